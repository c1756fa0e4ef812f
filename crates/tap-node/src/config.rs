//! Node configuration: defaults, file loading (TOML/YAML), and CLI overrides.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tap_admission::AdmissionConfig;
use tap_memtap::FlushConfig;
use tap_settlement::SettlementConfig;

/// Which admission front this node serves taps through (spec §4.5:
/// the aggregator is "an alternative front" to the Redis-scripted engine,
/// not a replacement for it).
#[derive(clap::ValueEnum, Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionFront {
    /// Atomic Redis/Lua script, events drained by the settlement pool.
    Script,
    /// In-process aggregator, periodic write-behind flush.
    Memtap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_name: String,
    pub http_listen_addr: String,
    pub front: AdmissionFront,

    pub redis_url: String,
    pub database_url: String,

    // Admission (spec §6 configuration options).
    pub coin_per_tap: i64,
    pub daily_limit: i64,
    pub energy_max_default: f64,
    pub base_regen: f64,
    pub stream_max_len: u64,
    pub daily_ttl: u64,
    pub max_requested: i64,

    // Settlement worker pool.
    pub settlement_group: String,
    pub settlement_consumer_prefix: String,
    pub worker_count: usize,
    pub apply_batch_size: usize,
    pub read_count: usize,
    pub read_block_ms: u64,
    pub claim_min_idle_secs: u64,
    pub claim_every_secs: u64,
    pub claim_max_rounds: usize,
    pub claim_count: usize,
    pub apply_retry_backoff_ms: u64,
    pub cb_failure_threshold: usize,
    pub cb_timeout_secs: u64,

    // Aggregator timers.
    pub flush_interval_ms: u64,
    pub eviction_interval_secs: u64,
    pub cache_ttl_secs: u64,
    pub system_refresh_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            node_name: "tap-node".to_string(),
            http_listen_addr: "127.0.0.1:8080".to_string(),
            front: AdmissionFront::Script,

            redis_url: "redis://127.0.0.1".to_string(),
            database_url: "postgres://localhost/tap".to_string(),

            coin_per_tap: 1,
            daily_limit: 0,
            energy_max_default: 1000.0,
            base_regen: 1.0,
            stream_max_len: 100_000,
            daily_ttl: 2 * 86_400,
            max_requested: 1_000,

            settlement_group: "settlement".to_string(),
            settlement_consumer_prefix: "worker".to_string(),
            worker_count: 4,
            apply_batch_size: 200,
            read_count: 200,
            read_block_ms: 2_000,
            claim_min_idle_secs: 30,
            claim_every_secs: 10,
            claim_max_rounds: 5,
            claim_count: 200,
            apply_retry_backoff_ms: 500,
            cb_failure_threshold: 5,
            cb_timeout_secs: 15,

            flush_interval_ms: 1_500,
            eviction_interval_secs: 60,
            cache_ttl_secs: 300,
            system_refresh_secs: 5,
        }
    }
}

impl NodeConfig {
    /// Loads a TOML or YAML config file, the format inferred from the
    /// extension.
    pub fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let data = fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let config = match ext {
            "toml" => toml::from_str(&data)?,
            "yaml" | "yml" => serde_yaml::from_str(&data)?,
            _ => return Err(format!("unsupported config extension: {ext}").into()),
        };
        Ok(config)
    }

    pub fn apply_cli_overrides(&mut self, cli: &super::Cli) {
        if let Some(v) = &cli.node_name {
            self.node_name = v.clone();
        }
        if let Some(v) = &cli.http_listen_addr {
            self.http_listen_addr = v.clone();
        }
        if let Some(v) = cli.front {
            self.front = v;
        }
        if let Some(v) = &cli.redis_url {
            self.redis_url = v.clone();
        }
        if let Some(v) = &cli.database_url {
            self.database_url = v.clone();
        }
        if let Some(v) = cli.coin_per_tap {
            self.coin_per_tap = v;
        }
        if let Some(v) = cli.daily_limit {
            self.daily_limit = v;
        }
        if let Some(v) = cli.worker_count {
            self.worker_count = v;
        }
    }

    pub fn admission_config(&self) -> AdmissionConfig {
        AdmissionConfig {
            base_regen: self.base_regen,
            daily_limit: self.daily_limit,
            energy_max_default: self.energy_max_default,
            stream_max_len: self.stream_max_len,
            coin_per_tap: self.coin_per_tap,
            daily_ttl: self.daily_ttl,
            max_requested: self.max_requested,
        }
    }

    pub fn settlement_config(&self) -> SettlementConfig {
        SettlementConfig {
            group: self.settlement_group.clone(),
            consumer_prefix: self.settlement_consumer_prefix.clone(),
            worker_count: self.worker_count,
            apply_batch_size: self.apply_batch_size,
            read_count: self.read_count,
            read_block: Duration::from_millis(self.read_block_ms),
            claim_min_idle: Duration::from_secs(self.claim_min_idle_secs),
            claim_every: Duration::from_secs(self.claim_every_secs),
            claim_max_rounds: self.claim_max_rounds,
            claim_count: self.claim_count,
            apply_retry_backoff: Duration::from_millis(self.apply_retry_backoff_ms),
            cb_failure_threshold: self.cb_failure_threshold,
            cb_timeout: Duration::from_secs(self.cb_timeout_secs),
        }
    }

    pub fn flush_config(&self) -> FlushConfig {
        FlushConfig {
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            eviction_interval: Duration::from_secs(self.eviction_interval_secs),
        }
    }
}
