use crate::keys::{KeyPair, WriteKey};

/// The key tuple produced by a passphrase-based derivation collaborator. We treat everything but
/// the signing key as opaque.
#[derive(Clone)]
pub struct KeyMaterial {
    pub public_sign_key: [u8; 32],
    pub secret_sign_key: [u8; 32],
    pub public_encryption_key: [u8; 32],
    pub secret_encryption_key: [u8; 32],
}

impl KeyMaterial {
    /// Returns the writer identity described by this material, or `None` if the signing halves
    /// don't belong together.
    pub fn key_pair(&self) -> Option<KeyPair> {
        let write_key = WriteKey::from_bytes(&self.secret_sign_key);
        if write_key.read_key().as_bytes() != &self.public_sign_key {
            return None;
        }

        Some(KeyPair::from_write_key(write_key))
    }
}

/// KeyDerivation deterministically turns a human passphrase and a domain string into key
/// material. Implemented outside this crate.
pub trait KeyDerivation {
    fn derive(&self, passphrase: &str, domain: &str) -> KeyMaterial;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_pair_requires_matching_halves() {
        let pair = KeyPair::generate();
        let mut material = KeyMaterial {
            public_sign_key: *pair.read_key().as_bytes(),
            secret_sign_key: pair.write_key().to_bytes(),
            public_encryption_key: [0; 32],
            secret_encryption_key: [0; 32],
        };

        assert_eq!(Some(pair.read_key()), material.key_pair().map(|p| p.read_key()));

        material.public_sign_key = *KeyPair::generate().read_key().as_bytes();
        assert!(material.key_pair().is_none());
    }
}
