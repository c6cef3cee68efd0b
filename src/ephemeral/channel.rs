use crate::ephemeral::cipher;
use crate::ephemeral::seen::SeenSet;
use crate::ephemeral::{BadMessage, EphemeralMessage, MessageId};
use crate::keys::{ChannelKey, DatabaseKey};

/// EphemeralChannel decides what happens to ephemeral frames for one database. It does no I/O:
/// the caller sends sealed frames and acts on each receive outcome.
///
/// Without a channel key the node is a pure relay. It can't read, dedupe or originate messages;
/// it only passes ciphertext along.
pub(crate) struct EphemeralChannel {
    database_key: DatabaseKey,
    channel_key: Option<ChannelKey>,
    seen: SeenSet,
}

#[derive(Debug)]
pub(crate) enum ReceiveOutcome {
    /// First time this message was seen. The frame should also be forwarded to other peers.
    Delivered(EphemeralMessage),
    Duplicate(MessageId),
    BadMessage(BadMessage),
    /// No key to open the frame with: forward it as is.
    Relay,
}

impl EphemeralChannel {
    pub(crate) fn new(database_key: DatabaseKey, channel_key: Option<ChannelKey>, seen_capacity: usize) -> Self {
        EphemeralChannel {
            database_key,
            channel_key,
            seen: SeenSet::with_capacity(seen_capacity),
        }
    }

    #[cfg(test)]
    pub(crate) fn is_relay(&self) -> bool {
        self.channel_key.is_none()
    }

    /// Seals `message` for sending. Its id goes into our own seen-set, so copies that come back
    /// to us through other peers are dropped.
    pub(crate) fn seal(&mut self, message: &EphemeralMessage) -> Result<(MessageId, Vec<u8>), SealError> {
        let channel_key = self.channel_key.as_ref().ok_or(SealError::NoChannelKey)?;

        let plaintext = message.to_canonical_bytes().map_err(SealError::Encoding)?;
        let sealed = cipher::seal(channel_key, &self.database_key, &plaintext).map_err(|_| SealError::Encryption)?;
        let id = MessageId::of_canonical_bytes(&plaintext);
        self.seen.insert(id);

        Ok((id, sealed))
    }

    pub(crate) fn receive(&mut self, sealed: &[u8]) -> ReceiveOutcome {
        let channel_key = match self.channel_key.as_ref() {
            Some(channel_key) => channel_key,
            None => return ReceiveOutcome::Relay,
        };

        let plaintext = match cipher::open(channel_key, &self.database_key, sealed) {
            Ok(plaintext) => plaintext,
            Err(e) => return ReceiveOutcome::BadMessage(BadMessage::from(e)),
        };
        let message = match EphemeralMessage::from_bytes(&plaintext) {
            Ok(message) => message,
            Err(e) => return ReceiveOutcome::BadMessage(BadMessage::Malformed(e.to_string())),
        };

        // Hash a re-serialization rather than the received bytes, so a sender that serializes
        // differently still produces the same id.
        let id = match message.to_canonical_bytes() {
            Ok(canonical) => MessageId::of_canonical_bytes(&canonical),
            Err(e) => return ReceiveOutcome::BadMessage(BadMessage::Malformed(e.to_string())),
        };
        if !self.seen.insert(id) {
            return ReceiveOutcome::Duplicate(id);
        }

        ReceiveOutcome::Delivered(message)
    }

    #[cfg(test)]
    pub(crate) fn seen_len(&self) -> usize {
        self.seen.len()
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum SealError {
    #[error("This node holds no channel key")]
    NoChannelKey,
    #[error("Failed to encode message")]
    Encoding(serde_json::Error),
    #[error("Failed to encrypt message")]
    Encryption,
}
