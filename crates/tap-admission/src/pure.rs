//! The admission script expressed as a pure, deterministic function (spec §6):
//! `tap(user_id, requested, now, cfg, preState) -> (postState, result)`.
//!
//! This is the single source of truth for the regen/budget/grant math; both
//! the in-process [`crate::engine::AdmissionEngine`] (Lua-script-backed) and
//! the in-memory aggregator re-derive their state transitions from the exact
//! same arithmetic, so this module has no I/O and is exhaustively testable.

use serde::{Deserialize, Serialize};

/// Tuning constants read once per deployment (spec §4.2, §6).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdmissionConfig {
    pub base_regen: f64,
    /// 0 disables the daily budget (treated as unbounded).
    pub daily_limit: i64,
    pub energy_max_default: f64,
    pub stream_max_len: u64,
    pub coin_per_tap: i64,
    pub daily_ttl: u64,
    /// Upper clamp on `requested` applied by the caller before this function
    /// is invoked (spec §4.2 "Inputs": "requested (>=1, clamped to a
    /// configured max)"). Not itself part of §6's enumerated configuration
    /// options; kept here so the pure function can enforce it directly for
    /// callers that don't clamp upstream.
    pub max_requested: i64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        AdmissionConfig {
            base_regen: 1.0,
            daily_limit: 0,
            energy_max_default: 1000.0,
            stream_max_len: 1_000_000,
            coin_per_tap: 1,
            daily_ttl: 172_800,
            max_requested: i64::MAX,
        }
    }
}

/// The user's cached energy/boost row (spec §4.2 "Pre-conditions read").
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UserPreState {
    pub energy: f64,
    /// `None` falls back to `cfg.energy_max_default`.
    pub energy_max: Option<f64>,
    pub energy_updated_at: u64,
    pub boost_until: u64,
    pub boost_regen_mul: f64,
    pub boost_max_mul: f64,
}

impl UserPreState {
    /// A fresh user row with no active boost.
    pub fn fresh(energy: f64, energy_updated_at: u64) -> Self {
        UserPreState {
            energy,
            energy_max: None,
            energy_updated_at,
            boost_until: 0,
            boost_regen_mul: 1.0,
            boost_max_mul: 1.0,
        }
    }
}

/// The day's cached counter row (spec §3).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DayPreState {
    pub tapped: i64,
    pub extra_quota: i64,
}

/// The system row's reserve fields (spec §3).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReservePreState {
    pub reserve_supply: i64,
    pub reserved_supply: i64,
}

/// `preState` (spec §6): `(energy, energy_updated_at, tapped, extra_quota,
/// reserve_supply, reserved_supply)`, plus the boost fields §4.2 needs to
/// compute the effective regen/cap and aren't elided from the tuple shape.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreState {
    pub user: UserPreState,
    pub day: DayPreState,
    pub reserve: ReservePreState,
}

/// `postState` (spec §6), same tuple shape as `preState`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PostState {
    pub energy: f64,
    pub energy_updated_at: u64,
    pub tapped: i64,
    pub extra_quota: i64,
    pub reserve_supply: i64,
    pub reserved_supply: i64,
}

/// The reason taxonomy for a zero grant (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    Ok,
    DailyLimit,
    ReserveEmpty,
    NoEnergy,
    Zero,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::Ok => "ok",
            Reason::DailyLimit => "daily_limit",
            Reason::ReserveEmpty => "reserve_empty",
            Reason::NoEnergy => "no_energy",
            Reason::Zero => "zero",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "ok" => Reason::Ok,
            "daily_limit" => Reason::DailyLimit,
            "reserve_empty" => Reason::ReserveEmpty,
            "no_energy" => Reason::NoEnergy,
            _ => Reason::Zero,
        }
    }
}

/// The seven-field result structure (spec §4.2 "Return").
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdmissionResult {
    pub gained: i64,
    pub reason: Reason,
    pub energy_after: f64,
    pub energy_max_effective: f64,
    pub tapped_after: i64,
    pub extra_quota: i64,
    /// `i64::MAX` represents "no daily cap configured".
    pub daily_remaining: i64,
}

/// The admission script's atomic critical section (spec §4.2), expressed as
/// a pure function over explicit pre/post state.
pub fn tap(requested: i64, now: u64, cfg: &AdmissionConfig, pre: PreState) -> (PostState, AdmissionResult) {
    let requested = requested.clamp(0, cfg.max_requested.max(0));

    let boosted = now < pre.user.boost_until;
    let regen = if boosted {
        (cfg.base_regen * pre.user.boost_regen_mul).max(0.0)
    } else {
        cfg.base_regen.max(0.0)
    };
    let base_energy_max = pre.user.energy_max.unwrap_or(cfg.energy_max_default);
    let energy_max_effective = if boosted {
        (base_energy_max * pre.user.boost_max_mul).max(0.0)
    } else {
        base_energy_max.max(0.0)
    };

    let elapsed = now.saturating_sub(pre.user.energy_updated_at) as f64;
    let regenerated_energy = (pre.user.energy + elapsed * regen).min(energy_max_effective);

    let from_energy = regenerated_energy.floor().max(0.0) as i64;
    let from_daily = if cfg.daily_limit > 0 {
        ((cfg.daily_limit + pre.day.extra_quota) - pre.day.tapped).max(0)
    } else {
        i64::MAX
    };
    let headroom = (pre.reserve.reserve_supply - pre.reserve.reserved_supply).max(0);
    let from_reserve = if cfg.coin_per_tap > 0 { headroom / cfg.coin_per_tap } else { 0 };

    let gained = requested.min(from_energy).min(from_daily).min(from_reserve).max(0);

    let reason = if requested == 0 {
        Reason::Zero
    } else if from_energy == 0 {
        Reason::NoEnergy
    } else if cfg.daily_limit > 0 && from_daily == 0 {
        Reason::DailyLimit
    } else if from_reserve == 0 {
        Reason::ReserveEmpty
    } else if gained > 0 {
        Reason::Ok
    } else {
        Reason::Zero
    };

    let energy_after = regenerated_energy - gained as f64;
    let tapped_after = if cfg.daily_limit > 0 { pre.day.tapped + gained } else { pre.day.tapped };
    let coins = gained * cfg.coin_per_tap;
    let reserve_supply_after = if coins > 0 { pre.reserve.reserve_supply - coins } else { pre.reserve.reserve_supply };

    let daily_remaining = if cfg.daily_limit > 0 {
        ((cfg.daily_limit + pre.day.extra_quota) - tapped_after).max(0)
    } else {
        i64::MAX
    };

    let post = PostState {
        energy: energy_after,
        energy_updated_at: now,
        tapped: tapped_after,
        extra_quota: pre.day.extra_quota,
        reserve_supply: reserve_supply_after,
        reserved_supply: pre.reserve.reserved_supply,
    };
    let result = AdmissionResult {
        gained,
        reason,
        energy_after,
        energy_max_effective,
        tapped_after,
        extra_quota: pre.day.extra_quota,
        daily_remaining,
    };
    (post, result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(base_regen: f64, coin_per_tap: i64, daily_limit: i64) -> AdmissionConfig {
        AdmissionConfig {
            base_regen,
            daily_limit,
            energy_max_default: 1000.0,
            stream_max_len: 1_000_000,
            coin_per_tap,
            daily_ttl: 172_800,
            max_requested: i64::MAX,
        }
    }

    /// Scenario 1: happy tap (spec §8).
    #[test]
    fn happy_tap() {
        let c = cfg(1.0, 1, 0);
        let pre = PreState {
            user: UserPreState::fresh(500.0, 0),
            day: DayPreState::default(),
            reserve: ReservePreState { reserve_supply: 10_000_000, reserved_supply: 0 },
        };
        let now = 10;
        let (post, result) = tap(50, now, &c, pre);
        assert_eq!(result.gained, 50);
        assert_eq!(result.reason, Reason::Ok);
        assert_eq!(result.energy_after, 460.0);
        assert_eq!(post.reserve_supply, 10_000_000 - 50);
    }

    /// Scenario 2: reserve pinch (spec §8).
    #[test]
    fn reserve_pinch() {
        let c = cfg(1.0, 10, 0);
        let pre = PreState {
            user: UserPreState::fresh(200.0, 0),
            day: DayPreState::default(),
            reserve: ReservePreState { reserve_supply: 30, reserved_supply: 0 },
        };
        let (post, result) = tap(50, 0, &c, pre);
        assert_eq!(result.gained, 3);
        assert_eq!(result.reason, Reason::Ok);
        assert_eq!(post.reserve_supply, 0);
    }

    /// Scenario 3: daily limit with headroom everywhere else (spec §8).
    #[test]
    fn daily_limit_binds_then_rejects() {
        let c = cfg(1.0, 1, 100);
        let pre = PreState {
            user: UserPreState::fresh(1000.0, 0),
            day: DayPreState { tapped: 99, extra_quota: 0 },
            reserve: ReservePreState { reserve_supply: 1_000_000_000, reserved_supply: 0 },
        };
        let (post1, result1) = tap(10, 0, &c, pre);
        assert_eq!(result1.gained, 1);
        assert_eq!(result1.reason, Reason::Ok);

        let pre2 = PreState { day: DayPreState { tapped: post1.tapped, extra_quota: 0 }, ..pre };
        let (_post2, result2) = tap(10, 0, &c, pre2);
        assert_eq!(result2.gained, 0);
        assert_eq!(result2.reason, Reason::DailyLimit);
    }

    #[test]
    fn requested_zero_mutates_nothing_but_energy_clock() {
        let c = cfg(1.0, 1, 0);
        let pre = PreState {
            user: UserPreState::fresh(500.0, 0),
            day: DayPreState::default(),
            reserve: ReservePreState { reserve_supply: 1000, reserved_supply: 0 },
        };
        let (post, result) = tap(0, 5, &c, pre);
        assert_eq!(result.gained, 0);
        assert_eq!(result.reason, Reason::Zero);
        assert_eq!(post.energy_updated_at, 5);
        assert_eq!(post.tapped, 0);
        assert_eq!(post.reserve_supply, 1000);
    }

    #[test]
    fn requested_zero_with_no_energy_is_still_zero_not_no_energy() {
        let c = cfg(1.0, 1, 0);
        let pre = PreState {
            user: UserPreState::fresh(0.0, 0),
            day: DayPreState::default(),
            reserve: ReservePreState { reserve_supply: 1_000_000, reserved_supply: 0 },
        };
        let (_post, result) = tap(0, 0, &c, pre);
        assert_eq!(result.gained, 0);
        assert_eq!(result.reason, Reason::Zero);
    }

    #[test]
    fn zero_energy_is_no_energy_regardless_of_other_budgets() {
        let c = cfg(1.0, 1, 0);
        let pre = PreState {
            user: UserPreState::fresh(0.0, 0),
            day: DayPreState::default(),
            reserve: ReservePreState { reserve_supply: 1_000_000, reserved_supply: 0 },
        };
        let (_post, result) = tap(10, 0, &c, pre);
        assert_eq!(result.gained, 0);
        assert_eq!(result.reason, Reason::NoEnergy);
    }

    #[test]
    fn reserve_headroom_below_coin_per_tap_is_reserve_empty() {
        let c = cfg(1.0, 10, 0);
        let pre = PreState {
            user: UserPreState::fresh(500.0, 0),
            day: DayPreState::default(),
            reserve: ReservePreState { reserve_supply: 5, reserved_supply: 0 },
        };
        let (_post, result) = tap(10, 0, &c, pre);
        assert_eq!(result.gained, 0);
        assert_eq!(result.reason, Reason::ReserveEmpty);
    }

    #[test]
    fn regen_across_long_gap_clamps_to_cap_exactly() {
        let c = cfg(1.0, 1, 0);
        let pre = PreState {
            user: UserPreState::fresh(0.0, 0),
            day: DayPreState::default(),
            reserve: ReservePreState { reserve_supply: 1_000_000, reserved_supply: 0 },
        };
        let (post, result) = tap(0, 10_000_000, &c, pre);
        assert_eq!(result.energy_max_effective, 1000.0);
        assert_eq!(post.energy, 1000.0);
    }

    #[test]
    fn boost_expiry_at_exact_now_uses_base_values() {
        let mut user = UserPreState::fresh(0.0, 0);
        user.boost_until = 100;
        user.boost_regen_mul = 5.0;
        user.boost_max_mul = 5.0;
        let c = cfg(1.0, 1, 0);
        let pre = PreState { user, day: DayPreState::default(), reserve: ReservePreState { reserve_supply: 1_000_000, reserved_supply: 0 } };
        let (_post, result) = tap(0, 100, &c, pre);
        // now == boost_until: base values only, not the 5x multipliers.
        assert_eq!(result.energy_max_effective, 1000.0);
    }

    #[test]
    fn boost_strictly_before_expiry_uses_multiplied_values() {
        let mut user = UserPreState::fresh(0.0, 0);
        user.boost_until = 100;
        user.boost_regen_mul = 2.0;
        user.boost_max_mul = 2.0;
        let c = cfg(1.0, 1, 0);
        let pre = PreState { user, day: DayPreState::default(), reserve: ReservePreState { reserve_supply: 1_000_000, reserved_supply: 0 } };
        let (_post, result) = tap(0, 99, &c, pre);
        assert_eq!(result.energy_max_effective, 2000.0);
    }

    #[test]
    fn daily_counter_invariant_never_exceeds_limit_plus_extra() {
        let c = cfg(1.0, 1, 10);
        let mut day = DayPreState { tapped: 0, extra_quota: 2 };
        let mut energy = 1000.0;
        for t in 0..20u64 {
            let pre = PreState {
                user: UserPreState::fresh(energy, t),
                day,
                reserve: ReservePreState { reserve_supply: 1_000_000, reserved_supply: 0 },
            };
            let (post, _result) = tap(5, t, &c, pre);
            energy = post.energy;
            day = DayPreState { tapped: post.tapped, extra_quota: post.extra_quota };
            assert!(day.tapped <= c.daily_limit + day.extra_quota);
        }
    }
}
