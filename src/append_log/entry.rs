use crate::commitlog;
use crate::commitlog::Sequence;
use crate::keys::{ReadKey, WriteKey};
use bytes::{Buf, BufMut, Bytes};
use ed25519_dalek::Signature;
use std::convert::TryFrom;
use std::{fmt, io};

const ENTRY_FORMAT_VERSION: u8 = 1;
const SIGNING_DOMAIN: &[u8] = b"hyphae/entry/v1";
const HASH_LEN: usize = 32;
const SIGNATURE_LEN: usize = 64;
const HEADER_LEN: usize = 1 + 8 + 1 + HASH_LEN + SIGNATURE_LEN;

const FLAG_HAS_PREVIOUS: u8 = 0b0000_0001;

/// EntryHash is the blake3 hash of an entry's full byte representation, signature included.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct EntryHash([u8; HASH_LEN]);

impl EntryHash {
    pub fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        EntryHash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

impl fmt::Debug for EntryHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryHash({})", &hex::encode(self.0)[..10])
    }
}

/// Entry is one immutable record in an append only log.
///
/// Byte representation:
///
/// ```text
/// | 0 | 1 ... 8 | 9 | 10 ... 41 | 42 ... 105 | 106 ...            |
/// +---+---------+---+-----------+------------+-------...----------+
/// |Vrs| Seq (BE)|Flg| Prev hash | Signature  | Payload (variable) |
/// +---+---------+---+-----------+------------+-------...----------+
/// ```
///
/// * `Vrs` - version of the serialized entry
/// * `Seq` - sequence of this entry within its log
/// * `Flg` - bit 0 set iff there is a previous entry (i.e. `Seq` > 0)
/// * `Prev hash` - hash of the entry at `Seq - 1`; all zeroes for the first entry
/// * `Signature` - ed25519 signature over domain, `Seq`, `Flg`, `Prev hash` and `Payload`
/// * `Payload` - app specific data
///
/// The log's read key is not part of the entry. It is implied by whichever log holds it.
#[derive(Clone, PartialEq)]
pub struct Entry {
    sequence: Sequence,
    previous_hash: Option<EntryHash>,
    payload: Bytes,
    signature: [u8; SIGNATURE_LEN],
}

impl Entry {
    pub(crate) fn sign(
        write_key: &WriteKey,
        sequence: Sequence,
        previous_hash: Option<EntryHash>,
        payload: Bytes,
    ) -> Self {
        let message = Self::signable_bytes(sequence, previous_hash.as_ref(), &payload);
        let signature = write_key.sign(&message).to_bytes();

        Entry {
            sequence,
            previous_hash,
            payload,
            signature,
        }
    }

    /// Reassembles an entry received from a peer. Nothing is checked here; call
    /// `AppendOnlyLog::verify` before trusting it.
    #[cfg(test)]
    pub(crate) fn from_parts(
        sequence: Sequence,
        previous_hash: Option<EntryHash>,
        payload: Bytes,
        signature: [u8; SIGNATURE_LEN],
    ) -> Self {
        Entry {
            sequence,
            previous_hash,
            payload,
            signature,
        }
    }

    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    pub fn previous_hash(&self) -> Option<EntryHash> {
        self.previous_hash
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn signature(&self) -> &[u8; SIGNATURE_LEN] {
        &self.signature
    }

    pub fn hash(&self) -> EntryHash {
        let bytes: Vec<u8> = self.clone().into();
        EntryHash(blake3::hash(&bytes).into())
    }

    pub(crate) fn has_valid_signature(&self, read_key: &ReadKey) -> bool {
        let message = Self::signable_bytes(self.sequence, self.previous_hash.as_ref(), &self.payload);
        let signature = Signature::from_bytes(&self.signature);
        read_key.verify(&message, &signature)
    }

    fn signable_bytes(sequence: Sequence, previous_hash: Option<&EntryHash>, payload: &[u8]) -> Vec<u8> {
        let mut message = Vec::with_capacity(SIGNING_DOMAIN.len() + 9 + HASH_LEN + payload.len());
        message.put_slice(SIGNING_DOMAIN);
        message.put_u64(sequence.as_u64());
        Self::put_previous_hash(&mut message, previous_hash);
        message.put_slice(payload);
        message
    }

    fn put_previous_hash(buf: &mut Vec<u8>, previous_hash: Option<&EntryHash>) {
        match previous_hash {
            Some(hash) => {
                buf.put_u8(FLAG_HAS_PREVIOUS);
                buf.put_slice(hash.as_bytes());
            }
            None => {
                buf.put_u8(0);
                buf.put_slice(&[0u8; HASH_LEN]);
            }
        }
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("sequence", &self.sequence)
            .field("previous_hash", &self.previous_hash)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

impl commitlog::Entry for Entry {}

impl TryFrom<Vec<u8>> for Entry {
    type Error = io::Error;

    fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
        if bytes.len() < HEADER_LEN {
            return Err(invalid_data("entry shorter than header"));
        }

        let mut buf = &bytes[..];
        let version = buf.get_u8();
        if version != ENTRY_FORMAT_VERSION {
            return Err(invalid_data("unknown entry format version"));
        }

        let sequence = Sequence::new(buf.get_u64());
        let flags = buf.get_u8();
        let mut hash = [0u8; HASH_LEN];
        buf.copy_to_slice(&mut hash);
        let previous_hash = if flags & FLAG_HAS_PREVIOUS != 0 {
            Some(EntryHash(hash))
        } else {
            None
        };

        let mut signature = [0u8; SIGNATURE_LEN];
        buf.copy_to_slice(&mut signature);

        let payload = Bytes::copy_from_slice(buf);

        Ok(Entry {
            sequence,
            previous_hash,
            payload,
            signature,
        })
    }
}

impl From<Entry> for Vec<u8> {
    fn from(entry: Entry) -> Self {
        let mut bytes = Vec::with_capacity(HEADER_LEN + entry.payload.len());
        bytes.put_u8(ENTRY_FORMAT_VERSION);
        bytes.put_u64(entry.sequence.as_u64());
        Entry::put_previous_hash(&mut bytes, entry.previous_hash.as_ref());
        bytes.put_slice(&entry.signature);
        bytes.put_slice(&entry.payload);

        bytes
    }
}

fn invalid_data(message: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}
