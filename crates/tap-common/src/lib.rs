//! Shared types, error kinds, and resilience helpers used across the tap
//! ingestion and settlement pipeline crates.

pub mod resilience;
pub mod retry;

pub use resilience::{CircuitBreaker, CircuitBreakerError, CircuitState};
pub use retry::retry_with_backoff;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The structural error kinds shared by every crate in the pipeline (spec §7),
/// extended with the infrastructure variants every store/cache/stream
/// implementation needs in practice.
#[derive(Debug, Error)]
pub enum TapError {
    /// A budget would go negative. Never surfaced by the admission path
    /// itself (which returns a zero grant with a reason instead); surfaced
    /// by the ledger store when an invariant would break.
    #[error("not enough: {0}")]
    NotEnough(String),

    /// An idempotency key collided and the observed state differs from what
    /// the caller is trying to apply. Most callers should treat this as a
    /// no-op success rather than propagate it.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A participant mismatch in a multi-party operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The requested row/entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Store/network failure; safe to retry.
    #[error("transient error: {0}")]
    Transient(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TapError {
    /// True for errors the caller should retry without operator intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TapError::Transient(_) | TapError::Database(_))
    }
}

impl From<serde_json::Error> for TapError {
    fn from(e: serde_json::Error) -> Self {
        TapError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for TapError {
    fn from(e: std::io::Error) -> Self {
        TapError::Io(e.to_string())
    }
}

pub type TapResult<T> = Result<T, TapError>;

/// Abstracts wall-clock time so the admission, ledger, and resilience logic
/// can be driven by a deterministic clock in tests.
pub trait TimeProvider: Send + Sync {
    fn unix_seconds(&self) -> u64;

    /// Sub-second wall clock, used by the admission script's regen math
    /// which operates on fractional elapsed seconds.
    fn unix_millis(&self) -> u64 {
        self.unix_seconds() * 1000
    }
}

/// Real wall-clock implementation of [`TimeProvider`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn unix_seconds(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    fn unix_millis(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Deterministic clock for tests: starts at a fixed offset and only advances
/// when told to.
#[derive(Debug, Clone)]
pub struct FixedTimeProvider {
    pub secs: u64,
}

impl FixedTimeProvider {
    pub fn new(secs: u64) -> Self {
        Self { secs }
    }
}

impl std::ops::AddAssign<u64> for FixedTimeProvider {
    fn add_assign(&mut self, rhs: u64) {
        self.secs += rhs;
    }
}

impl TimeProvider for FixedTimeProvider {
    fn unix_seconds(&self) -> u64 {
        self.secs
    }
}

/// A user identifier. The core never interprets this beyond equality and
/// ordering (row-lock ordering locks user rows in ascending `UserId` order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub u64);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A UTC calendar day, stored as `yyyy-mm-dd`, matching the daily counter's
/// key shape (spec §3, §6).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Day(pub String);

impl Day {
    /// Derives the UTC day string for a given unix-seconds timestamp.
    pub fn from_unix_seconds(ts: u64) -> Self {
        let datetime = chrono::DateTime::from_timestamp(ts as i64, 0).unwrap_or_default();
        Day(datetime.format("%Y-%m-%d").to_string())
    }
}

impl std::fmt::Display for Day {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An in-flight accepted-tap event (spec §3): the payload that flows from
/// the admission path, through the event stream, to the settlement worker.
/// `event_id` is the stream-assigned idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TapEvent {
    pub event_id: String,
    pub user_id: UserId,
    pub coins: i64,
    pub taps: i64,
    pub day: Day,
    pub req: i64,
    pub ts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_from_unix_seconds_matches_known_dates() {
        assert_eq!(Day::from_unix_seconds(0).0, "1970-01-01");
        // 2024-01-01T00:00:00Z
        assert_eq!(Day::from_unix_seconds(1_704_067_200).0, "2024-01-01");
        // 2024-02-29T12:00:00Z (leap day)
        assert_eq!(Day::from_unix_seconds(1_709_208_000).0, "2024-02-29");
    }

    #[test]
    fn user_id_orders_ascending() {
        let mut ids = vec![UserId(3), UserId(1), UserId(2)];
        ids.sort();
        assert_eq!(ids, vec![UserId(1), UserId(2), UserId(3)]);
    }

    #[test]
    fn tap_error_retryability() {
        assert!(TapError::Transient("x".into()).is_retryable());
        assert!(!TapError::NotEnough("x".into()).is_retryable());
    }
}
