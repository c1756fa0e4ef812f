//! The in-memory aggregator (spec §4.5): an in-process alternative to the
//! Redis-scripted admission engine, for when admission traffic outpaces the
//! fast store or the fast store is unavailable.

use crate::state::{DayCache, DayKey, ReserveCache, UserCache, UserSnapshot};
use std::collections::HashMap;
use std::time::Duration;
use tap_admission::pure::{
    tap as pure_tap, AdmissionConfig, AdmissionResult, DayPreState, PreState, ReservePreState,
    UserPreState,
};
use tap_common::{Day, TapResult, UserId};
use tap_ledger::{DailyDelta, LedgerStore, UserDelta};
use tracing::{error, warn};

struct Inner {
    users: HashMap<UserId, UserCache>,
    daily: HashMap<DayKey, DayCache>,
    reserve: ReserveCache,
}

/// Per-engine aggregator state, guarded by a single mutex (spec §4.5 "under
/// a per-engine mutex").
pub struct Aggregator<L: LedgerStore + ?Sized> {
    ledger: std::sync::Arc<L>,
    cfg: AdmissionConfig,
    cache_ttl: Duration,
    system_refresh: Duration,
    inner: tokio::sync::Mutex<Inner>,
}

impl<L: LedgerStore + ?Sized> Aggregator<L> {
    pub fn new(ledger: std::sync::Arc<L>, cfg: AdmissionConfig, cache_ttl: Duration, system_refresh: Duration) -> Self {
        Aggregator {
            ledger,
            cfg,
            cache_ttl,
            system_refresh,
            inner: tokio::sync::Mutex::new(Inner {
                users: HashMap::new(),
                daily: HashMap::new(),
                reserve: ReserveCache::default(),
            }),
        }
    }

    /// Re-derives the same admission decision as §4.2, in-process (spec
    /// §4.5 "Tap path").
    pub async fn tap(&self, user_id: UserId, requested: i64, now: u64, day: &Day) -> TapResult<AdmissionResult> {
        tap_admission::metrics::TAP_REQUESTS.inc();
        let mut inner = self.inner.lock().await;

        if inner.reserve.refreshed_at == 0 || now.saturating_sub(inner.reserve.refreshed_at) >= self.system_refresh.as_secs() {
            let system = self.ledger.get_system_state().await?;
            inner.reserve.reserve_supply = system.reserve_supply;
            inner.reserve.reserved_supply = system.reserved_supply;
            inner.reserve.refreshed_at = now;
        }

        if !inner.users.contains_key(&user_id) {
            let loaded = self.ledger.get_user(user_id).await?;
            let cache = match loaded {
                Some(u) => UserCache {
                    energy: u.energy,
                    energy_max: Some(u.energy_max),
                    energy_updated_at: u.energy_updated_at,
                    boost_until: u.energy_boost_until,
                    boost_regen_mul: u.energy_boost_regen_mul,
                    boost_max_mul: u.energy_boost_max_mul,
                    balance: u.balance,
                    taps_total: u.taps_total,
                    pending_balance_delta: 0,
                    pending_taps_delta: 0,
                    last_touch: now,
                },
                None => UserCache {
                    energy: self.cfg.energy_max_default,
                    energy_max: None,
                    energy_updated_at: now,
                    boost_until: 0,
                    boost_regen_mul: 1.0,
                    boost_max_mul: 1.0,
                    balance: 0,
                    taps_total: 0,
                    pending_balance_delta: 0,
                    pending_taps_delta: 0,
                    last_touch: now,
                },
            };
            inner.users.insert(user_id, cache);
        }

        let key: DayKey = (user_id, day.clone());
        if !inner.daily.contains_key(&key) {
            let loaded = self.ledger.get_daily_counter(user_id, day).await?;
            inner.daily.insert(
                key.clone(),
                DayCache { tapped: loaded.tapped, extra_quota: loaded.extra_quota, pending_tapped_delta: 0 },
            );
        }

        let user = inner.users.get(&user_id).expect("just inserted").clone();
        let day_cache = inner.daily.get(&key).expect("just inserted").clone();
        let reserve = inner.reserve.clone();

        let pre = PreState {
            user: UserPreState {
                energy: user.energy,
                energy_max: user.energy_max,
                energy_updated_at: user.energy_updated_at,
                boost_until: user.boost_until,
                boost_regen_mul: user.boost_regen_mul,
                boost_max_mul: user.boost_max_mul,
            },
            day: DayPreState { tapped: day_cache.tapped, extra_quota: day_cache.extra_quota },
            reserve: ReservePreState { reserve_supply: reserve.reserve_supply, reserved_supply: reserve.reserved_supply },
        };
        let (post, result) = pure_tap(requested, now, &self.cfg, pre);

        let coins = result.gained * self.cfg.coin_per_tap;
        {
            let u = inner.users.get_mut(&user_id).expect("present");
            u.energy = post.energy;
            u.energy_updated_at = post.energy_updated_at;
            u.last_touch = now;
            if result.gained > 0 {
                u.balance += coins;
                u.taps_total += result.gained as u64;
                u.pending_balance_delta += coins;
                u.pending_taps_delta += result.gained as u64;
            }
        }
        {
            let d = inner.daily.get_mut(&key).expect("present");
            d.tapped = post.tapped;
            if self.cfg.daily_limit > 0 && result.gained > 0 {
                d.pending_tapped_delta += result.gained;
            }
        }
        if coins > 0 {
            inner.reserve.reserve_supply = post.reserve_supply;
            inner.reserve.pending_reserve_delta -= coins;
        }

        if result.gained > 0 {
            tap_admission::metrics::TAP_GRANTS.inc();
        } else {
            tap_admission::metrics::TAP_REJECTIONS.inc();
        }

        Ok(result)
    }

    /// A read-only view, exposed only while pending deltas exist for this
    /// user (spec §4.5 "Snapshot visibility").
    pub async fn snapshot(&self, user_id: UserId) -> Option<UserSnapshot> {
        let inner = self.inner.lock().await;
        let u = inner.users.get(&user_id)?;
        if u.pending_balance_delta == 0 && u.pending_taps_delta == 0 {
            return None;
        }
        Some(UserSnapshot { balance: u.balance, taps_total: u.taps_total, energy: u.energy })
    }

    /// Flushes pending deltas into the durable ledger (spec §4.5 "Flush").
    /// On failure, the snapshot is merged back into pending state so no
    /// work is lost and nothing is double-applied.
    pub async fn flush(&self) -> TapResult<()> {
        let (user_deltas, daily_deltas, reserve_delta) = {
            let mut inner = self.inner.lock().await;
            let mut user_deltas = Vec::new();
            for (uid, u) in inner.users.iter_mut() {
                if u.pending_balance_delta != 0 || u.pending_taps_delta != 0 {
                    user_deltas.push(UserDelta {
                        user_id: *uid,
                        balance_delta: u.pending_balance_delta,
                        taps_delta: u.pending_taps_delta,
                        energy: u.energy,
                        energy_updated_at: u.energy_updated_at,
                    });
                    u.pending_balance_delta = 0;
                    u.pending_taps_delta = 0;
                }
            }
            let mut daily_deltas = Vec::new();
            for ((uid, day), d) in inner.daily.iter_mut() {
                if d.pending_tapped_delta != 0 {
                    daily_deltas.push(DailyDelta { user_id: *uid, day: day.clone(), tapped_delta: d.pending_tapped_delta });
                    d.pending_tapped_delta = 0;
                }
            }
            let reserve_delta = inner.reserve.pending_reserve_delta;
            inner.reserve.pending_reserve_delta = 0;
            (user_deltas, daily_deltas, reserve_delta)
        };

        if user_deltas.is_empty() && daily_deltas.is_empty() && reserve_delta == 0 {
            return Ok(());
        }

        match self.ledger.apply_tap_aggregates(&user_deltas, &daily_deltas, reserve_delta, "memtap").await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(error = %e, "aggregator flush failed, merging deltas back into pending state");
                let mut inner = self.inner.lock().await;
                for ud in &user_deltas {
                    if let Some(u) = inner.users.get_mut(&ud.user_id) {
                        u.pending_balance_delta += ud.balance_delta;
                        u.pending_taps_delta += ud.taps_delta;
                    } else {
                        warn!(user_id = ud.user_id.0, "evicted before failed flush could merge back, re-inserting");
                    }
                }
                for dd in &daily_deltas {
                    let key: DayKey = (dd.user_id, dd.day.clone());
                    if let Some(d) = inner.daily.get_mut(&key) {
                        d.pending_tapped_delta += dd.tapped_delta;
                    }
                }
                inner.reserve.pending_reserve_delta += reserve_delta;
                Err(e)
            }
        }
    }

    /// Drops live rows with no pending work that haven't been touched
    /// within `cache_ttl` (spec §4.5 "Eviction").
    pub async fn evict_idle(&self, now: u64) {
        let mut inner = self.inner.lock().await;
        let ttl = self.cache_ttl.as_secs();
        inner.users.retain(|_, u| {
            u.pending_balance_delta != 0 || u.pending_taps_delta != 0 || now.saturating_sub(u.last_touch) < ttl
        });
        let live_users: std::collections::HashSet<UserId> = inner.users.keys().copied().collect();
        inner.daily.retain(|(uid, _), d| d.pending_tapped_delta != 0 || live_users.contains(uid));
    }
}
