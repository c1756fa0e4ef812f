use crate::{EventStream, StreamMessage, TAP_STREAM_KEY};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamMaxlen, StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, Value};
use std::collections::HashMap;
use std::time::Duration;
use tap_common::{TapError, TapEvent, TapResult};
use tracing::warn;

fn redis_err(e: redis::RedisError) -> TapError {
    TapError::Transient(format!("redis: {e}"))
}

fn value_to_string(v: &Value) -> Option<String> {
    match v {
        Value::Data(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::Status(s) => Some(s.clone()),
        Value::Int(i) => Some(i.to_string()),
        _ => None,
    }
}

/// Redis-Streams-backed [`EventStream`] (spec §4.3, §6: `stream:taps`).
#[derive(Clone)]
pub struct RedisEventStream {
    conn: ConnectionManager,
    key: String,
}

impl RedisEventStream {
    pub async fn new(redis_url: &str) -> TapResult<Self> {
        Self::with_key(redis_url, TAP_STREAM_KEY).await
    }

    pub async fn with_key(redis_url: &str, key: impl Into<String>) -> TapResult<Self> {
        let client = redis::Client::open(redis_url).map_err(redis_err)?;
        let conn = client.get_connection_manager().await.map_err(redis_err)?;
        Ok(Self { conn, key: key.into() })
    }
}

#[async_trait]
impl EventStream for RedisEventStream {
    async fn append(&self, event: &TapEvent, max_len: u64) -> TapResult<String> {
        let fields = StreamMessage::encode_tap_event(event);
        let field_pairs: Vec<(&str, &str)> =
            fields.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd_maxlen(&self.key, StreamMaxlen::Approx(max_len as usize), "*", &field_pairs)
            .await
            .map_err(redis_err)?;
        Ok(id)
    }

    async fn ensure_group(&self, group: &str) -> TapResult<()> {
        let mut conn = self.conn.clone();
        let res: redis::RedisResult<()> =
            conn.xgroup_create_mkstream(&self.key, group, "$").await;
        match res {
            Ok(()) => Ok(()),
            // BUSYGROUP means the group already exists — idempotent create.
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(redis_err(e)),
        }
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> TapResult<Vec<StreamMessage>> {
        let mut conn = self.conn.clone();
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block.as_millis() as usize);
        let reply: StreamReadReply = conn
            .xread_options(&[self.key.as_str()], &[">"], &opts)
            .await
            .map_err(redis_err)?;

        let mut out = Vec::new();
        for stream_key in reply.keys {
            for stream_id in stream_key.ids {
                let mut fields = HashMap::new();
                for (k, v) in stream_id.map {
                    if let Some(s) = value_to_string(&v) {
                        fields.insert(k, s);
                    } else {
                        warn!(field = %k, "unreadable stream field value, dropping");
                    }
                }
                out.push(StreamMessage::new(stream_id.id, fields));
            }
        }
        Ok(out)
    }

    async fn ack(&self, group: &str, ids: &[String]) -> TapResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(&self.key, group, ids).await.map_err(redis_err)?;
        Ok(())
    }

    async fn reclaim(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> TapResult<Vec<StreamMessage>> {
        let mut conn = self.conn.clone();
        let opts = StreamAutoClaimOptions::default().count(count);
        let reply: StreamAutoClaimReply = conn
            .xautoclaim_options(
                &self.key,
                group,
                consumer,
                min_idle.as_millis() as usize,
                "0-0",
                opts,
            )
            .await
            .map_err(redis_err)?;

        let mut out = Vec::new();
        for stream_id in reply.claimed {
            let mut fields = HashMap::new();
            for (k, v) in stream_id.map {
                if let Some(s) = value_to_string(&v) {
                    fields.insert(k, s);
                }
            }
            out.push(StreamMessage::new(stream_id.id, fields));
        }
        Ok(out)
    }
}
