//! In-memory stand-in for the out-of-scope payment/tariff system. Sits behind
//! the same `BalanceLedger` trait boundary a real billing service would, so
//! the usage accountant (gateway crate) never depends on a concrete store.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A user's depletable voice-time balance.
///
/// Invariant: both fields are non-negative; `get_total()` is their sum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserBalance {
    pub user_id: String,
    pub remaining_seconds: i64,
    pub permanent_seconds: i64,
    pub tariff: String,
    pub status: String,
}

impl UserBalance {
    pub fn get_total(&self) -> i64 {
        self.remaining_seconds + self.permanent_seconds
    }

    /// New guest accounts: grounded in `JWTService.verify_user_from_token`'s
    /// `create_user(..., remaining_seconds=120, ...)` default.
    pub fn guest(user_id: impl Into<String>, starting_balance_seconds: i64) -> Self {
        Self {
            user_id: user_id.into(),
            remaining_seconds: starting_balance_seconds,
            permanent_seconds: 0,
            tariff: "free".to_string(),
            status: "active".to_string(),
        }
    }

    /// Debit `seconds` from `remaining_seconds` first, then `permanent_seconds`
    /// for any shortfall. Neither field goes below zero.
    fn debit(&mut self, seconds: i64) {
        if seconds <= 0 {
            return;
        }
        if self.remaining_seconds >= seconds {
            self.remaining_seconds -= seconds;
            return;
        }
        let shortfall = seconds - self.remaining_seconds;
        self.remaining_seconds = 0;
        self.permanent_seconds = (self.permanent_seconds - shortfall).max(0);
    }
}

/// External collaborator boundary the usage accountant debits through.
#[async_trait]
pub trait BalanceLedger: Send + Sync {
    /// Fetch the user's balance, creating a guest account with
    /// `guest_starting_balance_seconds` if none exists yet.
    async fn get_or_create(&self, user_id: &str, guest_starting_balance_seconds: i64) -> UserBalance;

    /// Total remaining seconds (`remaining + permanent`), 0 if unknown.
    async fn get_total(&self, user_id: &str) -> i64;

    /// Debit `seconds` (regular first, then permanent) and return the
    /// resulting total. No-op (returns current total) if the user is unknown.
    async fn debit(&self, user_id: &str, seconds: i64) -> i64;
}

/// Process-wide in-memory ledger, one account per `user_id`, guarded by a
/// single mutex (mirrors the session store's locking discipline; the
/// account set is small and writes are infrequent relative to voice I/O).
#[derive(Default)]
pub struct InMemoryBalanceLedger {
    accounts: Mutex<HashMap<String, UserBalance>>,
}

impl InMemoryBalanceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed (or overwrite) an account, e.g. from a pre-flight provisioning step.
    pub fn seed(&self, balance: UserBalance) {
        self.accounts
            .lock()
            .unwrap()
            .insert(balance.user_id.clone(), balance);
    }
}

#[async_trait]
impl BalanceLedger for InMemoryBalanceLedger {
    async fn get_or_create(&self, user_id: &str, guest_starting_balance_seconds: i64) -> UserBalance {
        let mut accounts = self.accounts.lock().unwrap();
        accounts
            .entry(user_id.to_string())
            .or_insert_with(|| UserBalance::guest(user_id, guest_starting_balance_seconds))
            .clone()
    }

    async fn get_total(&self, user_id: &str) -> i64 {
        self.accounts
            .lock()
            .unwrap()
            .get(user_id)
            .map(UserBalance::get_total)
            .unwrap_or(0)
    }

    async fn debit(&self, user_id: &str, seconds: i64) -> i64 {
        let mut accounts = self.accounts.lock().unwrap();
        match accounts.get_mut(user_id) {
            Some(balance) => {
                balance.debit(seconds);
                balance.get_total()
            }
            None => 0,
        }
    }
}
