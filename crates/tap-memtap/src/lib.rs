//! The in-memory aggregator front for tap admission (spec §4.5): semantics
//! identical to the admission script, materialized as an in-process map
//! with a background write-behind flush into the durable ledger.

mod aggregator;
mod state;

pub use aggregator::Aggregator;
pub use state::UserSnapshot;

use std::sync::Arc;
use std::time::Duration;
use tap_common::TimeProvider;
use tap_ledger::LedgerStore;
use tokio::task::JoinHandle;
use tracing::error;

/// Background ticker configuration (spec §4.5, §6).
#[derive(Debug, Clone, Copy)]
pub struct FlushConfig {
    pub flush_interval: Duration,
    pub eviction_interval: Duration,
}

impl Default for FlushConfig {
    fn default() -> Self {
        FlushConfig { flush_interval: Duration::from_millis(1_500), eviction_interval: Duration::from_secs(60) }
    }
}

/// Spawns the periodic flush and eviction tasks for an [`Aggregator`]
/// (spec §4.5 "Flush": "A background ticker ... or shutdown hook").
pub fn spawn_background_tasks<L: LedgerStore + ?Sized + 'static>(
    aggregator: Arc<Aggregator<L>>,
    cfg: FlushConfig,
) -> Vec<JoinHandle<()>> {
    let flush_agg = aggregator.clone();
    let flush_handle = tokio::spawn(async move {
        let mut tick = tokio::time::interval(cfg.flush_interval);
        loop {
            tick.tick().await;
            if let Err(e) = flush_agg.flush().await {
                error!(error = %e, "periodic aggregator flush failed");
            }
        }
    });

    let evict_agg = aggregator;
    let evict_handle = tokio::spawn(async move {
        let mut tick = tokio::time::interval(cfg.eviction_interval);
        loop {
            tick.tick().await;
            let now = tap_common::SystemTimeProvider.unix_seconds();
            evict_agg.evict_idle(now).await;
        }
    });

    vec![flush_handle, evict_handle]
}
