use crate::keys::ReadKey;
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityState {
    /// An authorized writer has seen the request but not granted it yet.
    Pending,
    Authorized,
    Revoked,
}

/// CapabilityRecord says what `authorizer` decided about `subject`'s right to write. It lives in
/// the authorizer's own log, so it replicates like any other entry.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRecord {
    pub subject: ReadKey,
    pub state: CapabilityState,
    pub authorizer: ReadKey,
    /// Logical (Lamport) time at which the authorizer wrote this record.
    pub clock: u64,
}

/// A subject's current authorization, as derived from the whole record history.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Grant {
    pub state: CapabilityState,
    pub authorizer: ReadKey,
}

/// CapabilityChange describes how one subject's derived state moved after a record was applied.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CapabilityChange {
    pub subject: ReadKey,
    pub previous: Option<CapabilityState>,
    pub current: Option<CapabilityState>,
}
