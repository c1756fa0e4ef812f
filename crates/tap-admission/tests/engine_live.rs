//! Live-Redis tests for the atomic admission engine, gated behind `#[ignore]`
//! (run with `REDIS_URL=redis://127.0.0.1 cargo test -- --ignored`).

use tap_admission::{AdmissionConfig, AdmissionEngine, Reason};
use tap_common::{Day, UserId};

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1".into())
}

fn cfg() -> AdmissionConfig {
    AdmissionConfig {
        base_regen: 1.0,
        daily_limit: 0,
        energy_max_default: 1000.0,
        stream_max_len: 10_000,
        coin_per_tap: 1,
        daily_ttl: 172_800,
        max_requested: i64::MAX,
    }
}

/// Fresh keyspace per test run so runs don't interfere with each other.
fn unique_user() -> UserId {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64;
    UserId(nanos)
}

#[tokio::test]
#[ignore]
async fn fresh_user_has_zero_energy_and_is_rejected() {
    let engine = AdmissionEngine::new(&redis_url()).await.unwrap();
    let user = unique_user();
    let day = Day("2024-01-01".into());
    let result = engine.tap(user, 10, 0, &day, &cfg()).await.unwrap();
    assert_eq!(result.gained, 0);
    assert_eq!(result.reason, Reason::NoEnergy);
}

#[tokio::test]
#[ignore]
async fn energy_regenerates_and_grants_taps_atomically() {
    let engine = AdmissionEngine::new(&redis_url()).await.unwrap();
    let user = unique_user();
    let day = Day("2024-01-01".into());

    // Warm the user row at t=0 with a no-op request, then let 50s of regen
    // accrue before the real request at t=50.
    engine.tap(user, 0, 0, &day, &cfg()).await.unwrap();
    let result = engine.tap(user, 20, 50, &day, &cfg()).await.unwrap();
    assert_eq!(result.gained, 20);
    assert_eq!(result.reason, Reason::Ok);
    assert_eq!(result.energy_after, 30.0);

    // A second identical request right after should only get what's left.
    let result2 = engine.tap(user, 20, 50, &day, &cfg()).await.unwrap();
    assert_eq!(result2.gained, 20);
    assert_eq!(result2.energy_after, 10.0);
}
