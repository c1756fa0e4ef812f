use tap_common::Day;

/// Cached per-user row, mirroring the admission-script fields plus
/// write-behind bookkeeping (spec §4.5 "State").
#[derive(Debug, Clone)]
pub(crate) struct UserCache {
    pub energy: f64,
    pub energy_max: Option<f64>,
    pub energy_updated_at: u64,
    pub boost_until: u64,
    pub boost_regen_mul: f64,
    pub boost_max_mul: f64,
    /// Best-known current balance/taps total (ledger value plus every tap
    /// applied here so far, flushed or not).
    pub balance: i64,
    pub taps_total: u64,
    /// Portion of `balance`/`taps_total` not yet durably applied.
    pub pending_balance_delta: i64,
    pub pending_taps_delta: u64,
    pub last_touch: u64,
}

/// Cached per-`(user, day)` counter (spec §4.5 "State").
#[derive(Debug, Clone, Default)]
pub(crate) struct DayCache {
    pub tapped: i64,
    pub extra_quota: i64,
    pub pending_tapped_delta: i64,
}

/// Cached system reserve row, periodically refreshed (spec §4.5 "Tap path").
#[derive(Debug, Clone, Default)]
pub(crate) struct ReserveCache {
    pub reserve_supply: i64,
    pub reserved_supply: i64,
    pub refreshed_at: u64,
    /// Coins granted here but not yet debited from the durable reserve.
    pub pending_reserve_delta: i64,
}

pub(crate) type DayKey = (tap_common::UserId, Day);

/// Read-only view returned by [`crate::Aggregator::snapshot`] (spec §4.5
/// "Snapshot visibility").
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UserSnapshot {
    pub balance: i64,
    pub taps_total: u64,
    pub energy: f64,
}
