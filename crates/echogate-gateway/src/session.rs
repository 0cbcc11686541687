//! C5 — process-wide session store: a typed, named-field `Session` per
//! client connection, guarded by a single mutex over the map. Every
//! accessor/mutator takes the lock for the minimal span needed for one
//! field, matching this crate's synchronous-map-under-one-mutex shared
//! state pattern used elsewhere for connection registries.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use echogate_core::timing::{RequestTiming, PREROLL_CAPACITY};
use echogate_core::voice::{ResponseLength, Voice};
use echogate_media::realtime_agent::RealtimeAgent;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::debug;

/// A frame destined for the client's transport. The pipeline never touches
/// the axum `WebSocket` directly — it sends frames down this channel, and a
/// small forwarding task owns the actual socket.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// A synthesized-audio chunk queued for playback, paired with its duration
/// so the playback loop can pace pre-roll silence between bursts.
#[derive(Debug, Clone)]
pub struct PlaybackChunk {
    pub wav_bytes: Vec<u8>,
    pub duration_secs: f64,
}

/// Which wire variant created this session, determining whether billing
/// uses the per-request queue model or the flat reset-to-zero counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Streaming,
    PushToTalk,
}

/// Per-connection state. One instance per client session, owned by
/// [`SessionStore`].
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub is_authenticated: bool,
    pub mode: SessionMode,

    outbound_tx: mpsc::UnboundedSender<OutboundFrame>,
    /// Synthesized-audio handoff to the playback loop. A shared queue
    /// (rather than an mpsc channel) so `clear_queues` can discard
    /// buffered chunks from outside the loop's single reader on barge-in.
    playback_queue: Arc<StdMutex<VecDeque<PlaybackChunk>>>,
    playback_notify: Arc<Notify>,

    pub audio_buffer: Vec<u8>,
    pub preroll: VecDeque<Vec<u8>>,
    pub is_recording: bool,
    /// Byte offset into `audio_buffer` at which voice was last observed.
    pub last_voice_offset: usize,

    pub request_queue: Vec<RequestTiming>,
    pub current_request_id: Option<String>,
    /// Wall-clock onset of the in-flight recording, for `voice_duration`.
    pub recording_started_at: Option<Instant>,

    pub llm_agent: Arc<RealtimeAgent>,
    pub voice: Voice,
    pub topic: Option<String>,
    pub response_length: ResponseLength,

    pub last_heartbeat: Instant,

    /// Flat per-session billing counters, used only in push-to-talk mode.
    pub flat_voice_duration: f64,
    pub flat_processing_duration: f64,
    pub flat_response_duration: f64,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        is_authenticated: bool,
        mode: SessionMode,
        outbound_tx: mpsc::UnboundedSender<OutboundFrame>,
        llm_agent: Arc<RealtimeAgent>,
        voice: Voice,
        topic: Option<String>,
        response_length: ResponseLength,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            is_authenticated,
            mode,
            outbound_tx,
            playback_queue: Arc::new(StdMutex::new(VecDeque::new())),
            playback_notify: Arc::new(Notify::new()),
            audio_buffer: Vec::new(),
            preroll: VecDeque::with_capacity(PREROLL_CAPACITY),
            is_recording: false,
            last_voice_offset: 0,
            request_queue: Vec::new(),
            current_request_id: None,
            recording_started_at: None,
            llm_agent,
            voice,
            topic,
            response_length,
            last_heartbeat: Instant::now(),
            flat_voice_duration: 0.0,
            flat_processing_duration: 0.0,
            flat_response_duration: 0.0,
        }
    }

    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.outbound_tx.send(OutboundFrame::Text(text.into()));
    }

    pub fn send_bytes(&self, bytes: Vec<u8>) {
        let _ = self.outbound_tx.send(OutboundFrame::Binary(bytes));
    }

    pub fn close(&self) {
        let _ = self.outbound_tx.send(OutboundFrame::Close);
    }

    pub fn enqueue_playback(&self, chunk: PlaybackChunk) {
        self.playback_queue.lock().unwrap().push_back(chunk);
        self.playback_notify.notify_one();
    }

    /// Handles the playback loop reads from, captured once at spawn time so
    /// `clear_queues` can reach into the same queue from outside that task.
    pub fn playback_handles(&self) -> (Arc<StdMutex<VecDeque<PlaybackChunk>>>, Arc<Notify>) {
        (self.playback_queue.clone(), self.playback_notify.clone())
    }

    pub fn push_preroll(&mut self, frame: Vec<u8>) {
        self.preroll.push_back(frame);
        while self.preroll.len() > PREROLL_CAPACITY {
            self.preroll.pop_front();
        }
    }

    pub fn request_mut(&mut self, request_id: &str) -> Option<&mut RequestTiming> {
        self.request_queue.iter_mut().find(|r| r.request_id == request_id)
    }

    /// Remove and return a completed request's timing record.
    pub fn take_request(&mut self, request_id: &str) -> Option<RequestTiming> {
        let idx = self.request_queue.iter().position(|r| r.request_id == request_id)?;
        Some(self.request_queue.remove(idx))
    }
}

/// Process-wide map from session id to [`Session`], guarded by one mutex.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Session>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self { sessions: Mutex::new(HashMap::new()) }
    }

    pub async fn connect(&self, session: Session) {
        let session_id = session.session_id.clone();
        self.sessions.lock().await.insert(session_id, session);
    }

    /// Remove a session, closing its transport. Returns the removed session
    /// (its `llm_agent` still needs disconnecting by the caller).
    pub async fn disconnect(&self, session_id: &str) -> Option<Session> {
        let removed = self.sessions.lock().await.remove(session_id);
        if let Some(session) = &removed {
            session.close();
        }
        removed
    }

    /// Best-effort send; a session absent from the map (already evicted) is
    /// a silent no-op, matching the source's "removed mid-operation" policy.
    pub async fn send_text(&self, session_id: &str, text: impl Into<String>) {
        if let Some(session) = self.sessions.lock().await.get(session_id) {
            session.send_text(text);
        }
    }

    pub async fn send_bytes(&self, session_id: &str, bytes: Vec<u8>) {
        if let Some(session) = self.sessions.lock().await.get(session_id) {
            session.send_bytes(bytes);
        }
    }

    pub async fn record_preroll(&self, session_id: &str, frame: Vec<u8>) {
        if let Some(session) = self.sessions.lock().await.get_mut(session_id) {
            session.push_preroll(frame);
        }
    }

    pub async fn take_preroll(&self, session_id: &str) -> Vec<Vec<u8>> {
        match self.sessions.lock().await.get(session_id) {
            Some(session) => session.preroll.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Discard every currently-queued playback chunk. Called on voice-onset
    /// so stale assistant audio from an interrupted response doesn't keep
    /// playing into the next utterance (barge-in).
    pub async fn clear_queues(&self, session_id: &str) {
        if let Some(session) = self.sessions.lock().await.get(session_id) {
            session.playback_queue.lock().unwrap().clear();
        }
    }

    pub async fn heartbeat(&self, session_id: &str) {
        if let Some(session) = self.sessions.lock().await.get_mut(session_id) {
            session.last_heartbeat = Instant::now();
        }
    }

    /// Evict every session whose last heartbeat exceeds `stale_timeout`,
    /// returning the evicted sessions so the caller can disconnect their
    /// agents outside the lock.
    pub async fn cleanup_stale(&self, stale_timeout: Duration) -> Vec<Session> {
        let mut guard = self.sessions.lock().await;
        let stale_ids: Vec<String> = guard
            .iter()
            .filter(|(_, s)| s.last_heartbeat.elapsed() > stale_timeout)
            .map(|(id, _)| id.clone())
            .collect();

        let mut evicted = Vec::with_capacity(stale_ids.len());
        for id in stale_ids {
            if let Some(session) = guard.remove(&id) {
                debug!(session_id = %id, "reaper evicting stale session");
                session.close();
                evicted.push(session);
            }
        }
        evicted
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Typed escape hatch for call sites that need to read or mutate more
    /// than one field of a session atomically (VAD state transitions,
    /// request-timing updates) — still operates on the concretely-typed
    /// `Session`, never a string-keyed property bag.
    pub async fn with<F, R>(&self, session_id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut Session) -> R,
    {
        let mut guard = self.sessions.lock().await;
        guard.get_mut(session_id).map(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use echogate_core::config::RealtimeConfig;

    fn test_session(id: &str, mode: SessionMode) -> Session {
        let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
        let config = RealtimeConfig { api_key: Some("test-key".to_string()), ..RealtimeConfig::default() };
        let agent = Arc::new(RealtimeAgent::new(&config, "alloy").unwrap());
        Session::new(id, format!("user_{id}"), false, mode, outbound_tx, agent, Voice::Alloy, None, ResponseLength::Normal)
    }

    #[tokio::test]
    async fn clear_queues_drains_buffered_playback_chunks() {
        let store = SessionStore::new();
        store.connect(test_session("s1", SessionMode::Streaming)).await;
        store
            .with("s1", |s| {
                s.enqueue_playback(PlaybackChunk { wav_bytes: vec![1, 2, 3], duration_secs: 0.5 });
                s.enqueue_playback(PlaybackChunk { wav_bytes: vec![4, 5, 6], duration_secs: 0.5 });
            })
            .await;

        store.clear_queues("s1").await;

        let (queue, _notify) = store.with("s1", |s| s.playback_handles()).await.unwrap();
        assert!(queue.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn preroll_ring_caps_at_capacity() {
        let store = SessionStore::new();
        store.connect(test_session("s1", SessionMode::Streaming)).await;
        for i in 0..5u8 {
            store.record_preroll("s1", vec![i]).await;
        }
        let preroll = store.take_preroll("s1").await;
        assert_eq!(preroll, vec![vec![3u8], vec![4u8]]);
    }

    #[tokio::test]
    async fn operations_on_absent_session_are_silent_noops() {
        let store = SessionStore::new();
        store.send_text("missing", "hello").await;
        store.send_bytes("missing", vec![1, 2, 3]).await;
        store.heartbeat("missing").await;
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn disconnect_removes_session_and_closes_transport() {
        let store = SessionStore::new();
        store.connect(test_session("s1", SessionMode::PushToTalk)).await;
        assert_eq!(store.len().await, 1);

        let removed = store.disconnect("s1").await;
        assert!(removed.is_some());
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn cleanup_stale_evicts_only_sessions_past_timeout() {
        let store = SessionStore::new();
        store.connect(test_session("fresh", SessionMode::Streaming)).await;
        store.connect(test_session("stale", SessionMode::Streaming)).await;

        store
            .with("stale", |s| s.last_heartbeat = Instant::now() - Duration::from_secs(100))
            .await;

        let evicted = store.cleanup_stale(Duration::from_secs(10)).await;
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].session_id, "stale");
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn take_request_removes_matching_entry_only() {
        let store = SessionStore::new();
        store.connect(test_session("s1", SessionMode::Streaming)).await;
        store
            .with("s1", |s| {
                s.request_queue.push(RequestTiming::new("r1", 0.0));
                s.request_queue.push(RequestTiming::new("r2", 0.0));
            })
            .await;

        let taken = store.with("s1", |s| s.take_request("r1")).await.flatten();
        assert_eq!(taken.unwrap().request_id, "r1");
        let remaining = store.with("s1", |s| s.request_queue.len()).await.unwrap();
        assert_eq!(remaining, 1);
    }
}
