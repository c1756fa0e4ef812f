//! Durable, at-least-once event stream with consumer-group semantics
//! (spec §4.3), backed by Redis Streams (`XADD`/`XREADGROUP`/`XACK`/`XCLAIM`).

pub mod message;
pub mod redis_stream;

pub use message::StreamMessage;
pub use redis_stream::RedisEventStream;

use async_trait::async_trait;
use std::time::Duration;
use tap_common::{TapEvent, TapResult};

/// Key shape for the single tap-events stream (spec §6: `stream:taps`).
pub const TAP_STREAM_KEY: &str = "stream:taps";

/// The producer/consumer-group contract the admission path and the
/// settlement worker pool share (spec §4.3).
#[async_trait]
pub trait EventStream: Send + Sync {
    /// Appends an accepted-tap event, trimming the stream to approximately
    /// `max_len` afterwards (spec §4.2, §4.3 — "approximate cap, honored
    /// after consumer-group retention").
    async fn append(&self, event: &TapEvent, max_len: u64) -> TapResult<String>;

    /// Idempotently creates the consumer group if it does not exist yet.
    async fn ensure_group(&self, group: &str) -> TapResult<()>;

    /// Blocking read of up to `count` new messages for `consumer` in `group`.
    /// An empty result means the read timed out (spec §4.4 step 1).
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> TapResult<Vec<StreamMessage>>;

    /// Acknowledges messages, removing them from the group's pending list.
    async fn ack(&self, group: &str, ids: &[String]) -> TapResult<()>;

    /// Reclaims messages pending longer than `min_idle` from any consumer in
    /// `group`, assigning them to `consumer` (spec §4.4 "Reclaim").
    async fn reclaim(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> TapResult<Vec<StreamMessage>>;
}
