//! Realtime voice dialogue gateway: WebSocket/HTTP server, session store,
//! usage accounting, and the reaper that evicts stale connections.

pub mod accountant;
pub mod auth;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod pipeline;
pub mod rate_limit;
pub mod reaper;
pub mod server;
pub mod session;
pub mod state;
