//! Timeline events and their normalized, displayable form.
//!
//! Raw events arrive as loosely typed JSON. [`TimelineEvent::from_raw`] reads
//! the envelope fields and turns the content into an [`EventContent`], a tagged
//! union keyed by event type whose [`EventContent::Unknown`] variant keeps the
//! raw key/value bag of every type this client does not model. [`decode`] then
//! maps the event to the [`NormalizedEvent`] printed by the sync command.

use chrono::{DateTime, SecondsFormat, Utc};
use log::warn;
use matrix_sdk::ruma::{OwnedEventId, OwnedRoomId, OwnedUserId, RoomId};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

pub const MESSAGE: &str = "m.room.message";
pub const ENCRYPTED: &str = "m.room.encrypted";
pub const MEMBER: &str = "m.room.member";
pub const ENCRYPTION: &str = "m.room.encryption";

/// Content of an `m.room.message` event.
///
/// Built leniently: a missing or non-string body is kept as `None` rather than
/// rejecting the event.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageContent {
    pub msgtype: Option<String>,
    pub body: Option<String>,
}

impl MessageContent {
    fn from_raw(raw: &Map<String, Value>) -> Self {
        MessageContent {
            msgtype: raw.get("msgtype").and_then(Value::as_str).map(str::to_owned),
            body: raw.get("body").and_then(Value::as_str).map(str::to_owned),
        }
    }
}

/// Content of an `m.room.encrypted` event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EncryptedContent {
    pub algorithm: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Content of an `m.room.member` state event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MemberContent {
    pub membership: String,
    #[serde(default)]
    pub displayname: Option<String>,
}

/// Content of an `m.room.encryption` state event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EncryptionContent {
    pub algorithm: String,
}

/// Event content keyed by event type.
#[derive(Debug, Clone, PartialEq)]
pub enum EventContent {
    Message(MessageContent),
    Encrypted(EncryptedContent),
    Member(MemberContent),
    Encryption(EncryptionContent),
    /// Any other type, or a known type whose content does not have the expected shape
    Unknown(Map<String, Value>),
}

impl EventContent {
    /// Builds the content of an event of type `event_type`. Never fails.
    pub fn from_raw(event_type: &str, raw: Map<String, Value>) -> Self {
        let parsed = match event_type {
            MESSAGE => Some(EventContent::Message(MessageContent::from_raw(&raw))),
            ENCRYPTED => parse(&raw).map(EventContent::Encrypted),
            MEMBER => parse(&raw).map(EventContent::Member),
            ENCRYPTION => parse(&raw).map(EventContent::Encryption),
            _ => None,
        };

        parsed.unwrap_or(EventContent::Unknown(raw))
    }
}

fn parse<T: for<'de> Deserialize<'de>>(raw: &Map<String, Value>) -> Option<T> {
    serde_json::from_value(Value::Object(raw.clone())).ok()
}

/// Envelope fields of a timeline event as sent by the homeserver.
#[derive(Deserialize)]
struct RawEvent {
    event_id: OwnedEventId,
    #[serde(rename = "type")]
    event_type: String,
    sender: OwnedUserId,
    origin_server_ts: u64,
    #[serde(default)]
    content: Map<String, Value>,
}

/// A timeline event of one room.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEvent {
    pub event_id: OwnedEventId,
    pub event_type: String,
    pub room_id: OwnedRoomId,
    pub sender: OwnedUserId,
    /// Milliseconds since the unix epoch on the origin server
    pub origin_server_ts: u64,
    pub content: EventContent,
}

impl TimelineEvent {
    /// Reads a raw event received in the timeline of `room_id`.
    ///
    /// # Errors
    ///
    /// Returns an error when an envelope field (id, type, sender, timestamp) is
    /// missing or invalid. The content itself never causes an error.
    pub fn from_raw(room_id: &RoomId, raw: Value) -> Result<Self, serde_json::Error> {
        let RawEvent {
            event_id,
            event_type,
            sender,
            origin_server_ts,
            content,
        } = serde_json::from_value(raw)?;

        let content = EventContent::from_raw(&event_type, content);

        Ok(TimelineEvent {
            event_id,
            event_type,
            room_id: room_id.to_owned(),
            sender,
            origin_server_ts,
            content,
        })
    }
}

/// A point in time split into whole seconds and a nanosecond remainder.
///
/// Built from the millisecond wire timestamp without precision loss, see
/// [`Timestamp::from_millis`] and [`Timestamp::as_millis`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub secs: u64,
    pub nanos: u32,
}

impl Timestamp {
    pub fn from_millis(millis: u64) -> Self {
        Timestamp {
            secs: millis / 1000,
            // below 1_000_000_000, fits in u32
            nanos: (millis % 1000) as u32 * 1_000_000,
        }
    }

    pub fn as_millis(&self) -> u64 {
        self.secs * 1000 + u64::from(self.nanos / 1_000_000)
    }

    /// `None` when the timestamp is outside the range chrono can represent.
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(i64::try_from(self.secs).ok()?, self.nanos)
    }
}

/// RFC 3339 with millisecond precision, raw milliseconds when out of range.
impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.to_datetime() {
            Some(datetime) => serializer
                .serialize_str(&datetime.to_rfc3339_opts(SecondsFormat::Millis, true)),
            None => serializer.serialize_u64(self.as_millis()),
        }
    }
}

/// Either the displayable body of an event, or why it could not be displayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Decoded {
    Body(String),
    Error(String),
}

/// Output of [`decode`], one per timeline event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedEvent {
    pub event_id: OwnedEventId,
    pub event_type: String,
    pub room_id: OwnedRoomId,
    pub sender: OwnedUserId,
    pub timestamp: Timestamp,
    #[serde(flatten)]
    pub decoded: Decoded,
}

impl NormalizedEvent {
    pub fn body(&self) -> Option<&str> {
        match &self.decoded {
            Decoded::Body(body) => Some(body),
            Decoded::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.decoded {
            Decoded::Body(_) => None,
            Decoded::Error(error) => Some(error),
        }
    }
}

/// Maps a timeline event of `room_id` to its displayable form.
///
/// Messages yield their body (empty when the content carries none); every
/// other type yields an `event type <T> not implemented` error so new types
/// degrade instead of breaking the stream.
pub fn decode(room_id: &RoomId, event: &TimelineEvent) -> NormalizedEvent {
    let decoded = match &event.content {
        EventContent::Message(message) => Decoded::Body(message.body.clone().unwrap_or_default()),
        _ => Decoded::Error(format!("event type {} not implemented", event.event_type)),
    };

    NormalizedEvent {
        event_id: event.event_id.clone(),
        event_type: event.event_type.clone(),
        room_id: room_id.to_owned(),
        sender: event.sender.clone(),
        timestamp: Timestamp::from_millis(event.origin_server_ts),
        decoded,
    }
}

/// Reads a raw event of `room_id`, `None` with a warning when it is malformed.
pub fn parse_event(room_id: &RoomId, raw: Value) -> Option<TimelineEvent> {
    match TimelineEvent::from_raw(room_id, raw) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!("skip malformed event in {}: {}", room_id, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matrix_sdk::ruma::room_id;
    use serde_json::json;

    fn raw_event(event_type: &str, content: Value) -> Value {
        json!({
            "event_id": "$ev:example.org",
            "type": event_type,
            "sender": "@a:example.org",
            "origin_server_ts": 1_700_000_000_123u64,
            "content": content,
        })
    }

    #[test]
    fn test_decode_message() {
        let room_id = room_id!("!abc:example.org");
        let raw = raw_event(MESSAGE, json!({"msgtype": "m.text", "body": "hello"}));
        let event = TimelineEvent::from_raw(room_id, raw).unwrap();

        let normalized = decode(room_id, &event);

        assert_eq!(normalized.body(), Some("hello"));
        assert_eq!(normalized.error(), None);
        assert_eq!(normalized.event_type, MESSAGE);
        assert_eq!(normalized.room_id.as_str(), "!abc:example.org");
        assert_eq!(normalized.sender.as_str(), "@a:example.org");
        assert_eq!(normalized.event_id.as_str(), "$ev:example.org");
    }

    #[test]
    fn test_decode_message_without_body() {
        let room_id = room_id!("!abc:example.org");
        let raw = raw_event(MESSAGE, json!({"msgtype": "m.text"}));
        let event = TimelineEvent::from_raw(room_id, raw).unwrap();

        let normalized = decode(room_id, &event);

        assert_eq!(normalized.body(), Some(""));
        assert_eq!(normalized.error(), None);
    }

    #[test]
    fn test_decode_message_with_non_string_body() {
        let room_id = room_id!("!abc:example.org");
        let raw = raw_event(MESSAGE, json!({"body": 42}));
        let event = TimelineEvent::from_raw(room_id, raw).unwrap();

        assert_eq!(decode(room_id, &event).body(), Some(""));
    }

    #[test]
    fn test_decode_other_types() {
        let room_id = room_id!("!abc:example.org");

        for (event_type, content) in [
            (MEMBER, json!({"membership": "join"})),
            (ENCRYPTED, json!({"algorithm": "m.megolm.v1.aes-sha2", "ciphertext": "..."})),
            ("org.example.custom", json!({"anything": [1, 2, 3]})),
            ("m.reaction", json!({})),
        ] {
            let event = TimelineEvent::from_raw(room_id, raw_event(event_type, content)).unwrap();
            let normalized = decode(room_id, &event);

            assert_eq!(normalized.body(), None);
            assert_eq!(
                normalized.error(),
                Some(format!("event type {event_type} not implemented").as_str())
            );
        }
    }

    #[test]
    fn test_content_variants() {
        assert!(matches!(
            EventContent::from_raw(MEMBER, object(json!({"membership": "leave"}))),
            EventContent::Member(MemberContent { ref membership, .. }) if membership == "leave"
        ));
        assert!(matches!(
            EventContent::from_raw(ENCRYPTION, object(json!({"algorithm": "m.megolm.v1.aes-sha2"}))),
            EventContent::Encryption(_)
        ));
        assert!(matches!(
            EventContent::from_raw(ENCRYPTED, object(json!({"algorithm": "m.megolm.v1.aes-sha2"}))),
            EventContent::Encrypted(_)
        ));
    }

    #[test]
    fn test_malformed_known_content_degrades_to_unknown() {
        let raw = object(json!({"membership": 3}));
        assert_eq!(
            EventContent::from_raw(MEMBER, raw.clone()),
            EventContent::Unknown(raw)
        );
    }

    #[test]
    fn test_unknown_content_keeps_raw_bag() {
        let raw = object(json!({"key": "value", "nested": {"n": 1}}));
        let EventContent::Unknown(kept) = EventContent::from_raw("org.example.custom", raw.clone())
        else {
            panic!("expected unknown content");
        };
        assert_eq!(kept, raw);
    }

    #[test]
    fn test_missing_envelope_field_is_an_error() {
        let room_id = room_id!("!abc:example.org");
        let raw = json!({"type": MESSAGE, "sender": "@a:example.org", "origin_server_ts": 1});

        assert!(TimelineEvent::from_raw(room_id, raw).is_err());
    }

    #[test]
    fn test_timestamp_split() {
        let timestamp = Timestamp::from_millis(1_700_000_000_123);
        assert_eq!(timestamp.secs, 1_700_000_000);
        assert_eq!(timestamp.nanos, 123_000_000);
    }

    #[test]
    fn test_timestamp_round_trip() {
        for millis in [0, 1, 999, 1000, 1001, 1_700_000_000_123, u64::MAX / 2, u64::MAX] {
            assert_eq!(Timestamp::from_millis(millis).as_millis(), millis);
        }
    }

    #[test]
    fn test_timestamp_serialization() {
        let timestamp = Timestamp::from_millis(1_700_000_000_123);
        assert_eq!(
            serde_json::to_string(&timestamp).unwrap(),
            r#""2023-11-14T22:13:20.123Z""#
        );

        let far = Timestamp::from_millis(u64::MAX);
        assert_eq!(serde_json::to_string(&far).unwrap(), u64::MAX.to_string());
    }

    #[test]
    fn test_normalized_event_serialization() {
        let room_id = room_id!("!abc:example.org");
        let event =
            TimelineEvent::from_raw(room_id, raw_event(MESSAGE, json!({"body": "hi"}))).unwrap();
        let value = serde_json::to_value(decode(room_id, &event)).unwrap();

        assert_eq!(value["body"], "hi");
        assert!(value.get("error").is_none());
        assert_eq!(value["event_type"], MESSAGE);

        let event = TimelineEvent::from_raw(room_id, raw_event(MEMBER, json!({"membership": "join"})))
            .unwrap();
        let value = serde_json::to_value(decode(room_id, &event)).unwrap();

        assert!(value.get("body").is_none());
        assert_eq!(value["error"], "event type m.room.member not implemented");
    }

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected a json object"),
        }
    }
}
