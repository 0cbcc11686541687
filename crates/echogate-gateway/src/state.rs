//! Gateway shared state: one [`SessionStore`] per pipeline variant plus the
//! shared collaborators (VAD pool, balance ledger, transcriber, accountant)
//! every connection handler needs, behind `Arc` for cheap cloning into
//! per-connection tasks.

use std::sync::Arc;

use echogate_core::balance::BalanceLedger;
use echogate_core::config::Config;
use echogate_media::stt::Transcriber;
use echogate_media::vad_pool::VadPool;

use crate::accountant::UsageAccountant;
use crate::rate_limit::RateLimiter;
use crate::session::SessionStore;

/// Shared application state accessible from every axum handler.
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions_streaming: Arc<SessionStore>,
    pub sessions_push_to_talk: Arc<SessionStore>,
    pub vad_pool: Arc<VadPool>,
    pub balance_ledger: Arc<dyn BalanceLedger>,
    pub transcriber: Arc<dyn Transcriber>,
    pub accountant: Arc<UsageAccountant>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        vad_pool: Arc<VadPool>,
        balance_ledger: Arc<dyn BalanceLedger>,
        transcriber: Arc<dyn Transcriber>,
    ) -> Self {
        let accountant = Arc::new(UsageAccountant::new(balance_ledger.clone()));
        let rate_limiter = config
            .gateway()
            .rate_limit
            .as_ref()
            .map(|rl| Arc::new(RateLimiter::new(rl.max_connections_per_ip)));

        Self {
            config,
            sessions_streaming: Arc::new(SessionStore::new()),
            sessions_push_to_talk: Arc::new(SessionStore::new()),
            vad_pool,
            balance_ledger,
            transcriber,
            accountant,
            rate_limiter,
        }
    }
}
