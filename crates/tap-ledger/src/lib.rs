//! Durable double-entry ledger store (spec §4.1, §6).
//!
//! Every write path runs under a transaction and locks the system row
//! before any user row, and user rows in ascending `user_id` order, to keep
//! the locking order consistent across all multi-row operations.

pub mod postgres;
pub mod types;

pub use postgres::PgLedgerStore;
pub use types::*;

use async_trait::async_trait;
use tap_common::{TapResult, UserId};

/// Process-wide handle over the durable ledger (spec §4.1).
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Idempotently ingest a batch of accepted-tap events (spec §4.1,
    /// duplicate `event_id`s are silently dropped).
    async fn apply_tap_events(&self, batch: &[TapEvent]) -> TapResult<ApplyReport>;

    /// Same effect as `apply_tap_events` but from pre-summed deltas, used by
    /// the in-memory aggregator which does not retain per-event identity.
    async fn apply_tap_aggregates(
        &self,
        users: &[UserDelta],
        daily: &[DailyDelta],
        reserve_delta: i64,
        source: &str,
    ) -> TapResult<()>;

    async fn credit_from_reserve(
        &self,
        user: UserId,
        amount: i64,
        kind: LedgerKind,
        meta: serde_json::Value,
    ) -> TapResult<()>;

    async fn debit_to_reserve(
        &self,
        user: UserId,
        amount: i64,
        kind: LedgerKind,
        meta: serde_json::Value,
    ) -> TapResult<()>;

    async fn transfer(&self, from: UserId, to: UserId, amount: i64) -> TapResult<()>;

    async fn burn(
        &self,
        user: UserId,
        amount: i64,
        kind: LedgerKind,
        meta: serde_json::Value,
    ) -> TapResult<()>;

    /// Registers a referral milestone once per `referred`. Returns the
    /// credited bonus amount (0 or `bonus`).
    async fn register_referral(
        &self,
        referrer: UserId,
        referred: UserId,
        step: u32,
        bonus: i64,
    ) -> TapResult<i64>;

    async fn earmark_invoice(&self, invoice_id: &str, coins: i64) -> TapResult<()>;
    async fn confirm_invoice(&self, invoice_id: &str, user: UserId) -> TapResult<()>;
    async fn release_invoice(&self, invoice_id: &str) -> TapResult<()>;

    async fn get_user(&self, user: UserId) -> TapResult<Option<User>>;
    async fn get_system_state(&self) -> TapResult<SystemState>;
    async fn get_daily_counter(&self, user: UserId, day: &tap_common::Day) -> TapResult<DailyCounter>;
}

/// Summary of an `apply_tap_events` call, useful for settlement-worker
/// logging and metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    pub duplicates: usize,
}
