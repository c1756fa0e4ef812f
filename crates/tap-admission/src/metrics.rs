use once_cell::sync::Lazy;
use prometheus_client::metrics::counter::Counter;

/// Counts every admission attempt, regardless of outcome.
pub static TAP_REQUESTS: Lazy<Counter> = Lazy::new(Counter::default);

/// Counts admission attempts that granted at least one tap.
pub static TAP_GRANTS: Lazy<Counter> = Lazy::new(Counter::default);

/// Counts admission attempts that granted zero taps.
pub static TAP_REJECTIONS: Lazy<Counter> = Lazy::new(Counter::default);
