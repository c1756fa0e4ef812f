use std::time::Duration;

/// Tuning knobs for the worker pool (spec §4.4, §6).
#[derive(Debug, Clone)]
pub struct SettlementConfig {
    pub group: String,
    /// Prefix each worker's consumer name is derived from (`{prefix}-{index}`).
    pub consumer_prefix: String,
    pub worker_count: usize,
    /// Upper bound on events per settlement transaction.
    pub apply_batch_size: usize,
    /// Worker fetch sizing.
    pub read_count: usize,
    pub read_block: Duration,
    /// Reclaim pacing; only worker index 0 reclaims.
    pub claim_min_idle: Duration,
    pub claim_every: Duration,
    pub claim_max_rounds: usize,
    pub claim_count: usize,
    /// Backoff applied after an `apply` failure before the loop retries.
    pub apply_retry_backoff: Duration,
    /// Consecutive `apply_tap_events` failures (shared across all workers)
    /// before the circuit trips and callers fail fast instead of hammering
    /// a down ledger.
    pub cb_failure_threshold: usize,
    pub cb_timeout: Duration,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        SettlementConfig {
            group: "settlement".into(),
            consumer_prefix: "worker".into(),
            worker_count: 4,
            apply_batch_size: 200,
            read_count: 200,
            read_block: Duration::from_millis(2_000),
            claim_min_idle: Duration::from_secs(30),
            claim_every: Duration::from_secs(10),
            claim_max_rounds: 5,
            claim_count: 200,
            apply_retry_backoff: Duration::from_millis(500),
            cb_failure_threshold: 5,
            cb_timeout: Duration::from_secs(15),
        }
    }
}
