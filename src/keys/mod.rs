//! Key material for a hyphae database.
//!
//! A log is identified by its [`ReadKey`] (an ed25519 verifying key). Whoever holds the matching
//! [`WriteKey`] can append to that log. The origin writer's read key doubles as the database's
//! global identifier, the "hyphalink".
mod derivation;

pub use derivation::KeyDerivation;
pub use derivation::KeyMaterial;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::convert::TryInto;
use std::fmt;
use std::str::FromStr;

const DISCOVERY_CONTEXT: &str = "hyphae 2024 discovery handle";

/// ReadKey is the public verification key of a single append-only log.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct ReadKey(VerifyingKey);

impl ReadKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, KeyError> {
        VerifyingKey::from_bytes(bytes)
            .map(ReadKey)
            .map_err(|_| KeyError::InvalidPoint)
    }

    pub fn try_from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        let array: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidLength(bytes.len()))?;
        Self::from_bytes(&array)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    /// Strict signature check, rejecting malleable and small-order signatures.
    pub(crate) fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.0.verify_strict(message, signature).is_ok()
    }

    /// The handle peers use to rendezvous on, and to bind a replication session to a database,
    /// without revealing the key itself.
    pub fn discovery_handle(&self) -> DiscoveryHandle {
        DiscoveryHandle(blake3::derive_key(DISCOVERY_CONTEXT, self.as_bytes()))
    }
}

// Lexicographic over the raw key bytes. Used as the last tie-break between writers.
impl Ord for ReadKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_bytes().cmp(other.as_bytes())
    }
}

impl PartialOrd for ReadKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ReadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ReadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell writers apart in logs.
        write!(f, "ReadKey({})", &self.to_hex()[..10])
    }
}

impl FromStr for ReadKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|_| KeyError::InvalidHex)?;
        Self::try_from_slice(&bytes)
    }
}

// Text form in every serialized payload is the same hex string users share as a hyphalink.
impl Serialize for ReadKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ReadKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}

/// The database identifier is the origin writer's read key.
pub type DatabaseKey = ReadKey;

/// WriteKey is the private signing key for one log.
#[derive(Clone)]
pub struct WriteKey(SigningKey);

impl WriteKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        WriteKey(SigningKey::from_bytes(bytes))
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn read_key(&self) -> ReadKey {
        ReadKey(self.0.verifying_key())
    }

    pub(crate) fn sign(&self, message: &[u8]) -> Signature {
        self.0.sign(message)
    }
}

impl fmt::Debug for WriteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WriteKey(for {:?})", self.read_key())
    }
}

/// KeyPair is a writer's identity: a read key and the write key that signs for it.
#[derive(Clone, Debug)]
pub struct KeyPair {
    write_key: WriteKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        KeyPair {
            write_key: WriteKey(signing_key),
        }
    }

    pub fn from_write_key(write_key: WriteKey) -> Self {
        KeyPair { write_key }
    }

    pub fn read_key(&self) -> ReadKey {
        self.write_key.read_key()
    }

    pub fn write_key(&self) -> &WriteKey {
        &self.write_key
    }
}

/// DiscoveryHandle is the public rendezvous handle derived from a database key.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct DiscoveryHandle([u8; 32]);

impl DiscoveryHandle {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        DiscoveryHandle(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for DiscoveryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DiscoveryHandle({})", &hex::encode(self.0)[..10])
    }
}

/// ChannelKey is the pre-shared symmetric key for the ephemeral channel of one database.
#[derive(Clone)]
pub struct ChannelKey([u8; 32]);

impl ChannelKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        ChannelKey(bytes)
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
        ChannelKey(bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChannelKey(..)")
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("Key is not valid hex")]
    InvalidHex,
    #[error("Key must be 32 bytes, got {0}")]
    InvalidLength(usize),
    #[error("Key bytes are not a valid ed25519 point")]
    InvalidPoint,
}
