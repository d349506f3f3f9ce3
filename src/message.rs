//! Immutable command and event messages.
//!
//! A [`Message`] carries a name, a JSON object payload, and scalar
//! metadata. Enrichment never mutates a message in place: every
//! `with_*` method consumes the value and returns a new one.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A JSON object mapping field names to values.
///
/// Used for message payloads and for aggregate state.
pub type Fields = Map<String, Value>;

/// Scalar metadata attached to a message, keyed by string.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// Discriminates intent messages from fact messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// An intent handled by a command handler.
    Command,
    /// A fact raised by a command handler and appended to a stream.
    Event,
}

/// A scalar metadata value.
///
/// Metadata is restricted to scalars so that it can be matched with
/// simple comparisons (see [`MetadataMatcher`](crate::MetadataMatcher)).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    /// Explicit null.
    Null,
    /// Boolean flag.
    Bool(bool),
    /// Signed integer. Aggregate versions are stored here.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// String value. Aggregate ids and types are stored here.
    String(String),
}

impl MetadataValue {
    /// Compare two values of compatible types.
    ///
    /// Integers and floats compare numerically with each other; strings
    /// compare lexically; booleans and nulls only compare with themselves.
    /// Returns `None` for incompatible types.
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        use MetadataValue::*;
        match (self, other) {
            (Null, Null) => Some(Ordering::Equal),
            (Bool(a), Bool(b)) => Some(a.cmp(b)),
            (Int(a), Int(b)) => Some(a.cmp(b)),
            (Int(a), Float(b)) => (*a as f64).partial_cmp(b),
            (Float(a), Int(b)) => a.partial_cmp(&(*b as f64)),
            (Float(a), Float(b)) => a.partial_cmp(b),
            (String(a), String(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Returns the string content, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer content, if this is a non-negative integer.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Int(n) => u64::try_from(*n).ok(),
            _ => None,
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for MetadataValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

// Versions beyond i64::MAX are not representable; saturate rather than wrap.
impl From<u64> for MetadataValue {
    fn from(value: u64) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Uuid> for MetadataValue {
    fn from(value: Uuid) -> Self {
        Self::String(value.to_string())
    }
}

/// An immutable command or event.
///
/// # Examples
///
/// ```
/// use eventfold_dispatch::{Message, MessageKind};
/// use serde_json::json;
///
/// let cmd = Message::command("RegisterUser", json!({"id": "1", "name": "Alex"}))
///     .expect("payload is an object");
/// assert_eq!(cmd.kind(), MessageKind::Command);
/// assert_eq!(cmd.payload()["name"], "Alex");
///
/// let stamped = cmd.clone().with_added_metadata("source", "api");
/// assert!(cmd.metadata().is_empty());
/// assert_eq!(stamped.metadata()["source"].as_str(), Some("api"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    uuid: Uuid,
    message_name: String,
    kind: MessageKind,
    payload: Fields,
    #[serde(default)]
    metadata: Metadata,
}

/// Returned when a payload is not a JSON object.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("message payload must be a JSON object")]
pub struct PayloadNotObject;

impl Message {
    /// Build a message of the given kind from an object payload.
    pub fn new(kind: MessageKind, name: impl Into<String>, payload: Fields) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            message_name: name.into(),
            kind,
            payload,
            metadata: Metadata::new(),
        }
    }

    /// Build a command from a JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadNotObject`] if `payload` is not a JSON object.
    pub fn command(name: impl Into<String>, payload: Value) -> Result<Self, PayloadNotObject> {
        match payload {
            Value::Object(fields) => Ok(Self::new(MessageKind::Command, name, fields)),
            _ => Err(PayloadNotObject),
        }
    }

    /// Build an event from a JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadNotObject`] if `payload` is not a JSON object.
    pub fn event(name: impl Into<String>, payload: Value) -> Result<Self, PayloadNotObject> {
        match payload {
            Value::Object(fields) => Ok(Self::new(MessageKind::Event, name, fields)),
            _ => Err(PayloadNotObject),
        }
    }

    /// Unique identifier of this message.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Type name, e.g. `"RegisterUser"`.
    pub fn message_name(&self) -> &str {
        &self.message_name
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn is_event(&self) -> bool {
        self.kind == MessageKind::Event
    }

    pub fn payload(&self) -> &Fields {
        &self.payload
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Look up a single metadata entry.
    pub fn metadata_value(&self, key: &str) -> Option<&MetadataValue> {
        self.metadata.get(key)
    }

    /// Return a copy of this message with one more metadata entry.
    ///
    /// An existing entry with the same key is replaced.
    pub fn with_added_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<MetadataValue>,
    ) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Return a copy of this message with its metadata replaced.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_requires_object_payload() {
        let err = Message::command("RegisterUser", json!(["not", "an", "object"]));
        assert_eq!(err, Err(PayloadNotObject));
    }

    #[test]
    fn event_kind_is_recorded() {
        let event = Message::event("UserRegistered", json!({"id": "1"})).unwrap();
        assert!(event.is_event());
        assert_eq!(event.message_name(), "UserRegistered");
    }

    #[test]
    fn enrichment_leaves_original_untouched() {
        let original = Message::event("UserRegistered", json!({"id": "1"})).unwrap();
        let enriched = original
            .clone()
            .with_added_metadata("_aggregate_id", "1")
            .with_added_metadata("_aggregate_version", 1u64);

        assert!(original.metadata().is_empty());
        assert_eq!(enriched.metadata().len(), 2);
        assert_eq!(enriched.uuid(), original.uuid());
        assert_eq!(enriched.payload(), original.payload());
    }

    #[test]
    fn later_metadata_replaces_earlier_key() {
        let msg = Message::event("Tick", json!({}))
            .unwrap()
            .with_added_metadata("n", 1)
            .with_added_metadata("n", 2);
        assert_eq!(msg.metadata_value("n"), Some(&MetadataValue::Int(2)));
    }

    #[test]
    fn metadata_values_compare_numerically_across_int_and_float() {
        let int = MetadataValue::Int(2);
        let float = MetadataValue::Float(1.5);
        assert_eq!(int.compare(&float), Some(Ordering::Greater));
        assert_eq!(
            MetadataValue::from("a").compare(&MetadataValue::Int(1)),
            None
        );
    }

    #[test]
    fn huge_u64_saturates() {
        assert_eq!(MetadataValue::from(u64::MAX), MetadataValue::Int(i64::MAX));
    }

    #[test]
    fn serde_roundtrip_keeps_metadata() {
        let msg = Message::event("UserRegistered", json!({"id": "1"}))
            .unwrap()
            .with_added_metadata("_aggregate_version", 3u64)
            .with_added_metadata("_aggregate_type", "user");

        let json = serde_json::to_string(&msg).expect("serialization should succeed");
        let back: Message = serde_json::from_str(&json).expect("deserialization should succeed");
        assert_eq!(back, msg);
    }
}
