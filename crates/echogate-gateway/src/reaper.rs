//! C8 — periodic sweep that evicts stale sessions (no heartbeat within the
//! configured timeout). Runs orthogonally to every per-session pipeline.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::session::SessionStore;

/// Spawn the reaper as a background task. Returns its `JoinHandle` so the
/// composition root can abort it on shutdown.
pub fn spawn(sessions: Arc<SessionStore>, interval: Duration, stale_timeout: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let evicted = sessions.cleanup_stale(stale_timeout).await;
            for session in evicted {
                session.llm_agent.disconnect().await;
                info!(session_id = %session.session_id, "reaper disconnected stale session's agent");
                #[cfg(feature = "metrics")]
                crate::metrics::record_reaper_eviction();
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use echogate_core::config::RealtimeConfig;
    use echogate_core::voice::{ResponseLength, Voice};
    use echogate_media::realtime_agent::RealtimeAgent;
    use tokio::sync::mpsc;

    use crate::session::{Session, SessionMode};

    fn test_session(id: &str) -> Session {
        let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
        let config = RealtimeConfig { api_key: Some("test-key".to_string()), ..RealtimeConfig::default() };
        let agent = Arc::new(RealtimeAgent::new(&config, "alloy").unwrap());
        Session::new(id, format!("user_{id}"), false, SessionMode::Streaming, outbound_tx, agent, Voice::Alloy, None, ResponseLength::Normal)
    }

    #[tokio::test]
    async fn reaper_evicts_sessions_past_stale_timeout_on_its_next_tick() {
        let store = Arc::new(SessionStore::new());
        store.connect(test_session("stale")).await;
        store
            .with("stale", |s| s.last_heartbeat = std::time::Instant::now() - Duration::from_secs(100))
            .await;

        let handle = spawn(store.clone(), Duration::from_millis(20), Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(store.len().await, 0);

        handle.abort();
    }
}
