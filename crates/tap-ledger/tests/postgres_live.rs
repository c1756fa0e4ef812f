//! End-to-end tests against a real Postgres instance. Gated behind `#[ignore]`
//! since no database is available in CI by default; run with
//! `cargo test -- --ignored` against a `DATABASE_URL` pointing at a scratch
//! database.

use std::sync::Arc;
use tap_common::{SystemTimeProvider, UserId};
use tap_ledger::{LedgerKind, LedgerStore, PgLedgerStore, TapEvent};

async fn store() -> PgLedgerStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for live tests");
    let store = PgLedgerStore::new(&url, Arc::new(SystemTimeProvider))
        .await
        .expect("connect");
    store
        .bootstrap_system(UserId(1), 10_000_000, 0)
        .await
        .expect("bootstrap");
    store
}

#[tokio::test]
#[ignore]
async fn apply_tap_events_is_idempotent_on_event_id() {
    let store = store().await;
    let user = UserId(42);
    let ev = TapEvent {
        event_id: "e-dup-1".into(),
        user_id: user,
        coins: 5,
        taps: 5,
        day: tap_common::Day("2024-01-01".into()),
        req: 5,
        ts: 1_700_000_000,
    };
    let first = store.apply_tap_events(&[ev.clone()]).await.unwrap();
    assert_eq!(first.applied, 1);
    let second = store.apply_tap_events(&[ev]).await.unwrap();
    assert_eq!(second.applied, 0);
    assert_eq!(second.duplicates, 1);

    let u = store.get_user(user).await.unwrap().unwrap();
    assert_eq!(u.balance, 5);
    assert_eq!(u.taps_total, 5);
}

#[tokio::test]
#[ignore]
async fn invoice_round_trip_confirm_preserves_supply() {
    let store = store().await;
    let before = store.get_system_state().await.unwrap();
    store.earmark_invoice("inv-1", 100).await.unwrap();
    let mid = store.get_system_state().await.unwrap();
    assert_eq!(mid.reserved_supply, before.reserved_supply + 100);
    assert_eq!(mid.reserve_supply, before.reserve_supply);

    store.confirm_invoice("inv-1", UserId(7)).await.unwrap();
    let after = store.get_system_state().await.unwrap();
    assert_eq!(after.reserved_supply, before.reserved_supply);
    assert_eq!(after.reserve_supply, before.reserve_supply - 100);
    let u = store.get_user(UserId(7)).await.unwrap().unwrap();
    assert_eq!(u.balance, 100);
}

#[tokio::test]
#[ignore]
async fn invoice_round_trip_release_restores_reserved_only() {
    let store = store().await;
    let before = store.get_system_state().await.unwrap();
    store.earmark_invoice("inv-2", 50).await.unwrap();
    store.release_invoice("inv-2").await.unwrap();
    let after = store.get_system_state().await.unwrap();
    assert_eq!(after.reserved_supply, before.reserved_supply);
    assert_eq!(after.reserve_supply, before.reserve_supply);
}

#[tokio::test]
#[ignore]
async fn referral_milestone_pays_once_per_referred() {
    let store = store().await;
    store.bootstrap_system(UserId(1), 1000, 0).await.unwrap();
    let referrer = UserId(100);
    for i in 0..2 {
        let credited = store.register_referral(referrer, UserId(200 + i), 3, 10).await.unwrap();
        assert_eq!(credited, 0);
    }
    let credited = store.register_referral(referrer, UserId(202), 3, 10).await.unwrap();
    assert_eq!(credited, 10);
    // replaying the same (referrer, referred) pair is a no-op
    let replay = store.register_referral(referrer, UserId(202), 3, 10).await.unwrap();
    assert_eq!(replay, 0);
}
