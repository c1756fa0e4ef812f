use once_cell::sync::Lazy;
use prometheus_client::metrics::counter::Counter;

/// Events successfully applied to the ledger (post-dedup).
pub static EVENTS_APPLIED: Lazy<Counter> = Lazy::new(Counter::default);

/// Messages rejected as poison before ever reaching the ledger.
pub static EVENTS_POISONED: Lazy<Counter> = Lazy::new(Counter::default);

/// `apply_tap_events` calls that returned an error.
pub static APPLY_FAILURES: Lazy<Counter> = Lazy::new(Counter::default);

/// Pending entries reclaimed from idle consumers.
pub static EVENTS_RECLAIMED: Lazy<Counter> = Lazy::new(Counter::default);
