use crate::capability::CapabilityRecord;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Operation is what an entry's payload means to the store.
///
/// Encoded as JSON, tagged by `op`:
///
/// ```text
/// {"op":"put","path":"/table","value":{...},"writerSequence":3,"clock":7}
/// {"op":"capability","subject":"<hex>","state":"authorized","authorizer":"<hex>","clock":8}
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub(crate) enum Operation {
    Put(PutOperation),
    Capability(CapabilityRecord),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PutOperation {
    pub(crate) path: String,
    pub(crate) value: Value,
    /// Sequence of the entry carrying this operation in its writer's log.
    pub(crate) writer_sequence: u64,
    pub(crate) clock: u64,
}

impl Operation {
    pub(crate) fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub(crate) fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    pub(crate) fn clock(&self) -> u64 {
        match self {
            Operation::Put(put) => put.clock,
            Operation::Capability(record) => record.clock,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityState;
    use crate::keys::KeyPair;
    use serde_json::json;

    #[test]
    fn put_payload_shape() {
        let op = Operation::Put(PutOperation {
            path: "/table".to_string(),
            value: json!({"k1": "v1"}),
            writer_sequence: 3,
            clock: 7,
        });

        let encoded: Value = serde_json::from_slice(&op.encode().unwrap()).unwrap();
        assert_eq!(
            json!({"op": "put", "path": "/table", "value": {"k1": "v1"}, "writerSequence": 3, "clock": 7}),
            encoded
        );
    }

    #[test]
    fn capability_payload_decodes() {
        let origin = KeyPair::generate().read_key();
        let bob = KeyPair::generate().read_key();
        let text = format!(
            r#"{{"op":"capability","subject":"{}","state":"authorized","authorizer":"{}","clock":2}}"#,
            bob, origin
        );

        let op = Operation::decode(text.as_bytes()).unwrap();
        assert_eq!(
            Operation::Capability(CapabilityRecord {
                subject: bob,
                state: CapabilityState::Authorized,
                authorizer: origin,
                clock: 2,
            }),
            op
        );
        assert_eq!(2, op.clock());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(Operation::decode(b"{\"op\":\"drop-table\"}").is_err());
        assert!(Operation::decode(b"\xff\xfe").is_err());
    }
}
