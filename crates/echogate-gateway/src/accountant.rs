//! C7 — usage accountant. Measures and deducts per-request seconds from a
//! user's balance, and pushes the "minutes left" status line (or a terminal
//! exhausted-balance message plus forced disconnect).
//!
//! Two billing models coexist, per this workspace's resolved design note:
//! streaming deducts against an individual `RequestTiming` pulled off the
//! session's request queue; push-to-talk accumulates onto three flat
//! counters and resets them to zero after each debit (the source's
//! "old function... compatibility with Button mode").

use std::sync::Arc;

use echogate_core::balance::BalanceLedger;
use tracing::info;

use crate::session::{Session, SessionStore};

/// Message shown to the exhausted-balance terminal message when the
/// source's original amount couldn't be recovered this session.
pub(crate) const BALANCE_EXHAUSTED_MESSAGE: &str = "You have run out of minutes. Please top up your balance to continue.";

pub struct UsageAccountant {
    ledger: Arc<dyn BalanceLedger>,
}

/// What to do with the session after a billing event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingOutcome {
    Continue,
    Exhausted,
}

impl UsageAccountant {
    pub fn new(ledger: Arc<dyn BalanceLedger>) -> Self {
        Self { ledger }
    }

    /// Pre-flight balance check at utterance-end, before transcription runs.
    /// Runs independently of (and before) the post-debit check below.
    pub async fn preflight_ok(&self, user_id: &str) -> bool {
        self.ledger.get_total(user_id).await > 0
    }

    /// Bill a completed streaming request: pull its `RequestTiming` off the
    /// session's queue, sum+round its three spans, debit, and notify.
    pub async fn bill_streaming_request(
        &self,
        sessions: &SessionStore,
        session_id: &str,
        request_id: &str,
    ) -> Option<BillingOutcome> {
        let timing = sessions.with(session_id, |s| s.take_request(request_id)).await.flatten()?;
        let user_id = sessions.with(session_id, |s| s.user_id.clone()).await?;

        let seconds = timing.billable_seconds();
        Some(self.debit_and_notify(sessions, session_id, &user_id, seconds).await)
    }

    /// Bill a completed push-to-talk request: debit the session's flat
    /// counters, then zero them, matching the source's reset-after-deduct.
    pub async fn bill_push_to_talk(&self, sessions: &SessionStore, session_id: &str) -> Option<BillingOutcome> {
        let (user_id, seconds) = sessions
            .with(session_id, |s: &mut Session| {
                let total = (s.flat_voice_duration + s.flat_processing_duration + s.flat_response_duration).round() as i64;
                s.flat_voice_duration = 0.0;
                s.flat_processing_duration = 0.0;
                s.flat_response_duration = 0.0;
                (s.user_id.clone(), total)
            })
            .await?;

        Some(self.debit_and_notify(sessions, session_id, &user_id, seconds).await)
    }

    async fn debit_and_notify(
        &self,
        sessions: &SessionStore,
        session_id: &str,
        user_id: &str,
        seconds: i64,
    ) -> BillingOutcome {
        if seconds > 0 {
            let remaining_total = self.ledger.debit(user_id, seconds).await;
            info!(user_id, seconds, remaining_total, "debited usage seconds");
            #[cfg(feature = "metrics")]
            crate::metrics::record_request_billed(seconds);

            if remaining_total <= 0 {
                sessions.send_text(session_id, "<b>Minutes left:</b> 0").await;
                sessions.send_text(session_id, BALANCE_EXHAUSTED_MESSAGE).await;
                #[cfg(feature = "metrics")]
                crate::metrics::record_balance_exhausted();
                return BillingOutcome::Exhausted;
            }

            let minutes_left = (remaining_total as f64 / 60.0).ceil() as i64;
            sessions.send_text(session_id, format!("<b>Minutes left:</b> {minutes_left}")).await;
            return BillingOutcome::Continue;
        }

        if self.ledger.get_total(user_id).await <= 0 {
            return BillingOutcome::Exhausted;
        }
        BillingOutcome::Continue
    }
}
