//! The per-worker consumer loop and reclaim loop (spec §4.4).

use crate::config::SettlementConfig;
use crate::metrics;
use std::sync::Arc;
use tap_common::resilience::{CircuitBreaker, CircuitBreakerError};
use tap_common::{SystemTimeProvider, TapEvent};
use tap_ledger::LedgerStore;
use tap_stream::{EventStream, StreamMessage, TAP_STREAM_KEY};
use tracing::{debug, error, warn};

pub type ApplyCircuitBreaker = CircuitBreaker<SystemTimeProvider>;

/// Decodes a batch of raw stream messages, immediately separating out
/// poison entries (spec §4.4 step 2: acknowledged without ever reaching the
/// ledger) from well-formed ones.
fn decode_batch(messages: Vec<StreamMessage>) -> (Vec<String>, Vec<(String, TapEvent)>) {
    let mut poisoned_ids = Vec::new();
    let mut decoded = Vec::new();
    for msg in messages {
        match msg.decode_tap_event() {
            Some(event) => decoded.push((msg.id.clone(), event)),
            None => {
                warn!(message_id = %msg.id, "dropping poison message from {}", TAP_STREAM_KEY);
                poisoned_ids.push(msg.id);
            }
        }
    }
    (poisoned_ids, decoded)
}

/// Applies one decoded batch in `apply_batch_size`-sized chunks (spec §4.4
/// step 3/4). Returns the ids that were successfully applied and acked;
/// chunks that fail to apply are left out so they remain pending.
async fn apply_decoded<S: EventStream, L: LedgerStore>(
    stream: &S,
    ledger: &L,
    breaker: &ApplyCircuitBreaker,
    group: &str,
    decoded: &[(String, TapEvent)],
    apply_batch_size: usize,
    apply_retry_backoff: std::time::Duration,
) {
    for chunk in decoded.chunks(apply_batch_size) {
        let ids: Vec<String> = chunk.iter().map(|(id, _)| id.clone()).collect();
        let events: Vec<TapEvent> = chunk.iter().map(|(_, e)| e.clone()).collect();
        match breaker.call(|| ledger.apply_tap_events(&events)).await {
            Ok(report) => {
                metrics::EVENTS_APPLIED.inc_by(report.applied as u64);
                if let Err(e) = stream.ack(group, &ids).await {
                    error!(error = %e, "failed to ack applied chunk, will be redelivered harmlessly");
                }
            }
            Err(CircuitBreakerError::Open) => {
                metrics::APPLY_FAILURES.inc();
                warn!(chunk_len = chunk.len(), "ledger circuit open, leaving chunk pending");
                tokio::time::sleep(apply_retry_backoff).await;
            }
            Err(CircuitBreakerError::Inner(e)) => {
                metrics::APPLY_FAILURES.inc();
                error!(error = %e, chunk_len = chunk.len(), "apply_tap_events failed, leaving chunk pending");
                tokio::time::sleep(apply_retry_backoff).await;
            }
        }
    }
}

/// One worker's infinite consumer loop (spec §4.4).
pub async fn run_consumer<S: EventStream, L: LedgerStore>(
    stream: Arc<S>,
    ledger: Arc<L>,
    breaker: Arc<ApplyCircuitBreaker>,
    cfg: SettlementConfig,
    consumer: String,
) {
    loop {
        let messages = match stream
            .read_group(&cfg.group, &consumer, cfg.read_count, cfg.read_block)
            .await
        {
            Ok(m) => m,
            Err(e) => {
                error!(error = %e, consumer = %consumer, "read_group failed");
                tokio::time::sleep(cfg.apply_retry_backoff).await;
                continue;
            }
        };

        if messages.is_empty() {
            debug!(consumer = %consumer, "idle read timeout");
            continue;
        }

        let (poisoned_ids, decoded) = decode_batch(messages);
        if !poisoned_ids.is_empty() {
            metrics::EVENTS_POISONED.inc_by(poisoned_ids.len() as u64);
            if let Err(e) = stream.ack(&cfg.group, &poisoned_ids).await {
                error!(error = %e, "failed to ack poison messages");
            }
        }

        if !decoded.is_empty() {
            apply_decoded(
                stream.as_ref(),
                ledger.as_ref(),
                breaker.as_ref(),
                &cfg.group,
                &decoded,
                cfg.apply_batch_size,
                cfg.apply_retry_backoff,
            )
            .await;
        }
    }
}

/// The designated reclaim worker's periodic loop (spec §4.4 "Reclaim" —
/// conventionally worker index 0).
pub async fn run_reclaim<S: EventStream, L: LedgerStore>(
    stream: Arc<S>,
    ledger: Arc<L>,
    breaker: Arc<ApplyCircuitBreaker>,
    cfg: SettlementConfig,
    consumer: String,
) {
    let mut tick = tokio::time::interval(cfg.claim_every);
    loop {
        tick.tick().await;
        for _round in 0..cfg.claim_max_rounds {
            let reclaimed = match stream
                .reclaim(&cfg.group, &consumer, cfg.claim_min_idle, cfg.claim_count)
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    error!(error = %e, "reclaim failed");
                    break;
                }
            };
            if reclaimed.is_empty() {
                break;
            }
            metrics::EVENTS_RECLAIMED.inc_by(reclaimed.len() as u64);
            let (poisoned_ids, decoded) = decode_batch(reclaimed);
            if !poisoned_ids.is_empty() {
                metrics::EVENTS_POISONED.inc_by(poisoned_ids.len() as u64);
                if let Err(e) = stream.ack(&cfg.group, &poisoned_ids).await {
                    error!(error = %e, "failed to ack poison messages during reclaim");
                }
            }
            if !decoded.is_empty() {
                apply_decoded(
                    stream.as_ref(),
                    ledger.as_ref(),
                    breaker.as_ref(),
                    &cfg.group,
                    &decoded,
                    cfg.apply_batch_size,
                    cfg.apply_retry_backoff,
                )
                .await;
            }
        }
    }
}
