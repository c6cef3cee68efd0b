use crate::keys::ReadKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// EphemeralMessage is a control message that is never written to any log, e.g. a writer asking
/// to be authorized.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralMessage {
    pub sender: ReadKey,
    pub action: String,
    pub payload: Value,
    /// Milliseconds since the unix epoch, as seen by the sender.
    pub timestamp: i64,
}

impl EphemeralMessage {
    pub fn new(sender: ReadKey, action: impl Into<String>, payload: Value) -> Self {
        EphemeralMessage {
            sender,
            action: action.into(),
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Fields in declaration order, and object keys inside `payload` sorted, so equal messages
    /// always serialize to equal bytes.
    pub(crate) fn to_canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        let canonical = EphemeralMessage {
            payload: sort_keys(&self.payload),
            ..self.clone()
        };
        serde_json::to_vec(&canonical)
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Rebuilds `value` with every object's keys inserted in sorted order. `serde_json::Map` keeps
/// insertion order when its `preserve_order` feature is on anywhere in the build.
fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            Value::Object(entries.into_iter().map(|(k, v)| (k.clone(), sort_keys(v))).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// MessageId is the content hash that identifies a message for deduplication.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct MessageId([u8; 32]);

impl MessageId {
    pub(crate) fn of_canonical_bytes(bytes: &[u8]) -> Self {
        MessageId(*blake3::hash(bytes).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", &hex::encode(self.0)[..10])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;
    use serde_json::json;

    #[test]
    fn canonical_bytes_ignore_payload_key_order() {
        let sender = KeyPair::generate().read_key();
        let a = EphemeralMessage {
            sender,
            action: "request-write".to_string(),
            payload: serde_json::from_str(r#"{"b": 1, "a": 2}"#).unwrap(),
            timestamp: 42,
        };
        let b = EphemeralMessage {
            payload: json!({"a": 2, "b": 1}),
            ..a.clone()
        };

        let a_bytes = a.to_canonical_bytes().unwrap();
        assert_eq!(a_bytes, b.to_canonical_bytes().unwrap());
        assert_eq!(
            MessageId::of_canonical_bytes(&a_bytes),
            MessageId::of_canonical_bytes(&b.to_canonical_bytes().unwrap())
        );
        assert_eq!(a, EphemeralMessage::from_bytes(&a_bytes).unwrap());
    }

    #[test]
    fn nested_payload_keys_are_sorted() {
        let payload = json!({"z": {"b": 1, "a": [{"d": 1, "c": 2}]}, "y": 0});

        assert_eq!(
            r#"{"y":0,"z":{"a":[{"c":2,"d":1}],"b":1}}"#,
            serde_json::to_string(&sort_keys(&payload)).unwrap()
        );
    }

    #[test]
    fn different_timestamps_are_different_messages() {
        let sender = KeyPair::generate().read_key();
        let a = EphemeralMessage {
            sender,
            action: "ping".to_string(),
            payload: Value::Null,
            timestamp: 1,
        };
        let b = EphemeralMessage { timestamp: 2, ..a.clone() };

        assert_ne!(
            MessageId::of_canonical_bytes(&a.to_canonical_bytes().unwrap()),
            MessageId::of_canonical_bytes(&b.to_canonical_bytes().unwrap())
        );
    }
}
