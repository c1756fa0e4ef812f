//! Exercises the aggregator's tap/flush/merge-back cycle against an
//! in-memory fake ledger (spec §8 scenario 6: aggregator flush failure
//! merges pending deltas back instead of losing or double-applying them).

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tap_admission::pure::AdmissionConfig;
use tap_common::{Day, TapError, TapResult, UserId};
use tap_ledger::{
    ApplyReport, DailyCounter, DailyDelta, LedgerKind, LedgerStore, SystemState, TapEvent, User, UserDelta,
};
use tap_memtap::Aggregator;

struct FakeLedger {
    fail_flush_times: AtomicUsize,
    applied: Mutex<Vec<(Vec<UserDelta>, Vec<DailyDelta>, i64)>>,
}

impl FakeLedger {
    fn new(fail_flush_times: usize) -> Self {
        FakeLedger { fail_flush_times: AtomicUsize::new(fail_flush_times), applied: Mutex::new(Vec::new()) }
    }

    fn applied_calls(&self) -> Vec<(Vec<UserDelta>, Vec<DailyDelta>, i64)> {
        self.applied.lock().unwrap().clone()
    }
}

#[async_trait]
impl LedgerStore for FakeLedger {
    async fn apply_tap_events(&self, _batch: &[TapEvent]) -> TapResult<ApplyReport> {
        unreachable!("aggregator never calls this path")
    }

    async fn apply_tap_aggregates(
        &self,
        users: &[UserDelta],
        daily: &[DailyDelta],
        reserve_delta: i64,
        _source: &str,
    ) -> TapResult<()> {
        let remaining = self.fail_flush_times.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_flush_times.fetch_sub(1, Ordering::SeqCst);
            return Err(TapError::Transient("simulated ledger outage".into()));
        }
        self.applied.lock().unwrap().push((users.to_vec(), daily.to_vec(), reserve_delta));
        Ok(())
    }

    async fn credit_from_reserve(&self, _u: UserId, _a: i64, _k: LedgerKind, _m: serde_json::Value) -> TapResult<()> {
        unreachable!()
    }
    async fn debit_to_reserve(&self, _u: UserId, _a: i64, _k: LedgerKind, _m: serde_json::Value) -> TapResult<()> {
        unreachable!()
    }
    async fn transfer(&self, _from: UserId, _to: UserId, _amount: i64) -> TapResult<()> {
        unreachable!()
    }
    async fn burn(&self, _u: UserId, _a: i64, _k: LedgerKind, _m: serde_json::Value) -> TapResult<()> {
        unreachable!()
    }
    async fn register_referral(&self, _r: UserId, _rd: UserId, _s: u32, _b: i64) -> TapResult<i64> {
        unreachable!()
    }
    async fn earmark_invoice(&self, _id: &str, _coins: i64) -> TapResult<()> {
        unreachable!()
    }
    async fn confirm_invoice(&self, _id: &str, _u: UserId) -> TapResult<()> {
        unreachable!()
    }
    async fn release_invoice(&self, _id: &str) -> TapResult<()> {
        unreachable!()
    }
    async fn get_user(&self, _u: UserId) -> TapResult<Option<User>> {
        Ok(None)
    }
    async fn get_system_state(&self) -> TapResult<SystemState> {
        Ok(SystemState::bootstrap(UserId(0), 1_000_000_000, 0, 0))
    }
    async fn get_daily_counter(&self, _u: UserId, _d: &Day) -> TapResult<DailyCounter> {
        Ok(DailyCounter::default())
    }
}

fn cfg() -> AdmissionConfig {
    AdmissionConfig { base_regen: 1.0, daily_limit: 0, energy_max_default: 1000.0, stream_max_len: 1000, coin_per_tap: 1, daily_ttl: 172_800, max_requested: i64::MAX }
}

#[tokio::test]
async fn tap_then_flush_applies_pending_deltas_once() {
    let ledger = Arc::new(FakeLedger::new(0));
    let agg = Aggregator::new(ledger.clone(), cfg(), Duration::from_secs(60), Duration::from_secs(60));

    let day = Day("2024-01-01".into());
    let result = agg.tap(UserId(1), 10, 100, &day).await.unwrap();
    assert_eq!(result.gained, 10);

    let snap = agg.snapshot(UserId(1)).await.expect("pending deltas exist before flush");
    assert_eq!(snap.balance, 10);

    agg.flush().await.unwrap();

    assert!(agg.snapshot(UserId(1)).await.is_none(), "flushed deltas should no longer be pending");
    let calls = ledger.applied_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0[0].balance_delta, 10);
    assert_eq!(calls[0].2, -10, "granted coins must be debited from the durable reserve");
}

/// Spec §8 scenario 6.
#[tokio::test]
async fn failed_flush_merges_deltas_back_instead_of_losing_them() {
    let ledger = Arc::new(FakeLedger::new(1));
    let agg = Arc::new(Aggregator::new(ledger.clone(), cfg(), Duration::from_secs(60), Duration::from_secs(60)));

    let day = Day("2024-01-01".into());
    agg.tap(UserId(2), 5, 0, &day).await.unwrap();

    let first = agg.flush().await;
    assert!(first.is_err(), "first flush attempt should fail");
    assert!(ledger.applied_calls().is_empty());

    let snap_after_failure = agg.snapshot(UserId(2)).await.expect("deltas must survive a failed flush");
    assert_eq!(snap_after_failure.balance, 5);

    agg.flush().await.unwrap();
    let calls = ledger.applied_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0[0].balance_delta, 5);
    assert_eq!(calls[0].2, -5, "reserve delta must survive the failed-then-retried flush too");
    assert!(agg.snapshot(UserId(2)).await.is_none());
}

#[tokio::test]
async fn snapshot_is_none_when_no_pending_deltas() {
    let ledger = Arc::new(FakeLedger::new(0));
    let agg = Aggregator::new(ledger, cfg(), Duration::from_secs(60), Duration::from_secs(60));
    assert!(agg.snapshot(UserId(42)).await.is_none());
}
