use crate::keys::{ChannelKey, DatabaseKey};
use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305, XNonce};
use rand::RngCore;

const NONCE_LEN: usize = 24;

/// Sealed layout: `nonce (24) | ciphertext + tag`. The database key is bound in as associated
/// data, so a frame sealed for one database doesn't open on another that shares the channel key.
pub(crate) fn seal(
    channel_key: &ChannelKey,
    database_key: &DatabaseKey,
    plaintext: &[u8],
) -> Result<Vec<u8>, chacha20poly1305::Error> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let ciphertext = aead(channel_key).encrypt(
        XNonce::from_slice(&nonce),
        Payload {
            msg: plaintext,
            aad: database_key.as_bytes(),
        },
    )?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

pub(crate) fn open(
    channel_key: &ChannelKey,
    database_key: &DatabaseKey,
    sealed: &[u8],
) -> Result<Vec<u8>, OpenError> {
    if sealed.len() < NONCE_LEN {
        return Err(OpenError::Truncated(sealed.len()));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);

    aead(channel_key)
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: database_key.as_bytes(),
            },
        )
        .map_err(|_| OpenError::Unauthenticated)
}

fn aead(channel_key: &ChannelKey) -> XChaCha20Poly1305 {
    XChaCha20Poly1305::new(Key::from_slice(channel_key.as_bytes()))
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub(crate) enum OpenError {
    #[error("Frame of {0} bytes is too short to hold a nonce")]
    Truncated(usize),
    #[error("Frame failed authentication")]
    Unauthenticated,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;

    #[test]
    fn opens_with_same_key_and_database_only() {
        let key = ChannelKey::generate();
        let database = KeyPair::generate().read_key();
        let sealed = seal(&key, &database, b"authorize me").unwrap();

        assert_eq!(b"authorize me".to_vec(), open(&key, &database, &sealed).unwrap());
        assert_eq!(
            Err(OpenError::Unauthenticated),
            open(&ChannelKey::generate(), &database, &sealed)
        );
        assert_eq!(
            Err(OpenError::Unauthenticated),
            open(&key, &KeyPair::generate().read_key(), &sealed)
        );
        assert_eq!(Err(OpenError::Truncated(3)), open(&key, &database, &sealed[..3]));
    }

    #[test]
    fn tampering_is_detected() {
        let key = ChannelKey::generate();
        let database = KeyPair::generate().read_key();
        let mut sealed = seal(&key, &database, b"hello").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        assert_eq!(Err(OpenError::Unauthenticated), open(&key, &database, &sealed));
    }
}
