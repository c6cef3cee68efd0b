//! Encrypted, deduplicated control messages that ride on replication sessions but are never
//! written to a log.
mod channel;
mod cipher;
mod message;
mod seen;

pub use message::EphemeralMessage;
pub use message::MessageId;

pub(crate) use channel::EphemeralChannel;
pub(crate) use channel::ReceiveOutcome;
pub(crate) use channel::SealError;

/// Extension name negotiated in the session handshake for ephemeral frames.
pub(crate) const EXTENSION_NAME: &str = "hyphae/ephemeral/1";

/// Why an ephemeral frame was dropped.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum BadMessage {
    #[error("Frame is too short ({0} bytes)")]
    Truncated(usize),
    #[error("Frame failed authentication")]
    Unauthenticated,
    #[error("Frame decrypted to an invalid message: {0}")]
    Malformed(String),
}

// -- Conversions --

impl From<cipher::OpenError> for BadMessage {
    fn from(e: cipher::OpenError) -> Self {
        match e {
            cipher::OpenError::Truncated(len) => BadMessage::Truncated(len),
            cipher::OpenError::Unauthenticated => BadMessage::Unauthenticated,
        }
    }
}
