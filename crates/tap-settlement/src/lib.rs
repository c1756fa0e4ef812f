//! Settlement worker pool (spec §4.4): `N` consumers sharing one Redis
//! Streams consumer group, plus a dedicated reclaim task, draining accepted
//! tap events into the durable ledger.

pub mod config;
pub mod metrics;
pub mod worker;

pub use config::SettlementConfig;

use std::sync::Arc;
use tap_common::SystemTimeProvider;
use tap_ledger::LedgerStore;
use tap_stream::EventStream;
use tokio::task::JoinHandle;
use tracing::info;
use worker::ApplyCircuitBreaker;

/// Owns the worker pool's background tasks. Dropping this without calling
/// [`SettlementPool::stop`] leaves the tasks running detached.
pub struct SettlementPool {
    handles: Vec<JoinHandle<()>>,
}

impl SettlementPool {
    /// Spawns `cfg.worker_count` consumer loops plus one reclaim loop
    /// (worker index 0 doubles as the reclaimer, per spec §4.4).
    pub async fn start<S, L>(stream: Arc<S>, ledger: Arc<L>, cfg: SettlementConfig) -> tap_common::TapResult<Self>
    where
        S: EventStream + 'static,
        L: LedgerStore + 'static,
    {
        stream.ensure_group(&cfg.group).await?;
        info!(group = %cfg.group, workers = cfg.worker_count, "starting settlement pool");

        let breaker = Arc::new(ApplyCircuitBreaker::new(
            SystemTimeProvider,
            cfg.cb_failure_threshold,
            cfg.cb_timeout,
        ));

        let mut handles = Vec::with_capacity(cfg.worker_count + 1);
        for i in 0..cfg.worker_count {
            let consumer = format!("{}-{i}", cfg.consumer_prefix);
            let stream = stream.clone();
            let ledger = ledger.clone();
            let breaker = breaker.clone();
            let cfg = cfg.clone();
            handles.push(tokio::spawn(async move {
                worker::run_consumer(stream, ledger, breaker, cfg, consumer).await;
            }));
        }

        let reclaim_consumer = format!("{}-reclaim", cfg.consumer_prefix);
        let stream = stream.clone();
        let ledger = ledger.clone();
        let reclaim_cfg = cfg.clone();
        handles.push(tokio::spawn(async move {
            worker::run_reclaim(stream, ledger, breaker, reclaim_cfg, reclaim_consumer).await;
        }));

        Ok(SettlementPool { handles })
    }

    /// Aborts every background task (consumer and reclaim loops alike).
    pub fn stop(&self) {
        info!(workers = self.handles.len(), "stopping settlement pool");
        for handle in &self.handles {
            handle.abort();
        }
    }
}

impl Drop for SettlementPool {
    fn drop(&mut self) {
        self.stop();
    }
}
