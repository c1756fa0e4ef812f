use std::collections::HashMap;
use tap_common::{Day, TapEvent, UserId};

/// One raw stream entry: a message id plus its field map, before the
/// settlement worker has decided whether it decodes to a `tap` event
/// (spec §4.4 step 2).
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl StreamMessage {
    pub fn new(id: impl Into<String>, fields: HashMap<String, String>) -> Self {
        Self { id: id.into(), fields }
    }

    /// Encodes a [`TapEvent`] into the field map the admission script writes
    /// to the stream (spec §4.2 post-conditions).
    pub fn encode_tap_event(event: &TapEvent) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        fields.insert("kind".into(), "tap".into());
        fields.insert("uid".into(), event.user_id.0.to_string());
        fields.insert("coins".into(), event.coins.to_string());
        fields.insert("taps".into(), event.taps.to_string());
        fields.insert("day".into(), event.day.0.clone());
        fields.insert("req".into(), event.req.to_string());
        fields.insert("ts".into(), event.ts.to_string());
        fields
    }

    /// Parses `uid, coins, taps, day, req` (spec §4.4 step 2). Returns
    /// `None` for `kind != tap` or any malformed field — the caller must
    /// treat that as poison and acknowledge without applying.
    pub fn decode_tap_event(&self) -> Option<TapEvent> {
        if self.fields.get("kind").map(String::as_str) != Some("tap") {
            return None;
        }
        let user_id = self.fields.get("uid")?.parse::<u64>().ok()?;
        let coins = self.fields.get("coins")?.parse::<i64>().ok()?;
        let taps = self.fields.get("taps")?.parse::<i64>().ok()?;
        let day = self.fields.get("day")?.clone();
        let req = self.fields.get("req")?.parse::<i64>().ok()?;
        let ts = self
            .fields
            .get("ts")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        if coins < 0 || taps < 0 || req < 0 {
            return None;
        }
        Some(TapEvent {
            event_id: self.id.clone(),
            user_id: UserId(user_id),
            coins,
            taps,
            day: Day(day),
            req,
            ts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> TapEvent {
        TapEvent {
            event_id: "ignored-on-encode".into(),
            user_id: UserId(7),
            coins: 50,
            taps: 50,
            day: Day("2024-01-01".into()),
            req: 50,
            ts: 1_700_000_000,
        }
    }

    #[test]
    fn encode_then_decode_preserves_fields() {
        let event = sample_event();
        let fields = StreamMessage::encode_tap_event(&event);
        let msg = StreamMessage::new("1700000000-0", fields);
        let decoded = msg.decode_tap_event().expect("should decode");
        assert_eq!(decoded.user_id, event.user_id);
        assert_eq!(decoded.coins, event.coins);
        assert_eq!(decoded.taps, event.taps);
        assert_eq!(decoded.day, event.day);
        assert_eq!(decoded.req, event.req);
        assert_eq!(decoded.event_id, "1700000000-0");
    }

    #[test]
    fn non_tap_kind_is_rejected_as_poison() {
        let mut fields = HashMap::new();
        fields.insert("kind".into(), "deposit_credit".into());
        let msg = StreamMessage::new("1-0", fields);
        assert!(msg.decode_tap_event().is_none());
    }

    #[test]
    fn missing_field_is_rejected_as_poison() {
        let mut fields = StreamMessage::encode_tap_event(&sample_event());
        fields.remove("coins");
        let msg = StreamMessage::new("1-0", fields);
        assert!(msg.decode_tap_event().is_none());
    }

    #[test]
    fn negative_amount_is_rejected_as_poison() {
        let mut fields = StreamMessage::encode_tap_event(&sample_event());
        fields.insert("coins".into(), "-5".into());
        let msg = StreamMessage::new("1-0", fields);
        assert!(msg.decode_tap_event().is_none());
    }
}
