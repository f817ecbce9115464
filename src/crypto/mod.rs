//! AEAD cipher wrapper: ChaCha20-Poly1305-IETF with a monotonic send nonce.
//!
//! Keys travel out of band as standard base64 (with padding). Each [`Cipher`]
//! owns one sending nonce counter, seeded randomly and incremented by one
//! (as a little-endian 96-bit integer) after every [`Cipher::encrypt`] call.
//! Decryption never touches this counter — the nonce used for a given
//! ciphertext always arrives alongside it on the wire.

use std::fmt::{self, Display, Formatter};

use base64::{engine::general_purpose::STANDARD, Engine};
use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    ChaCha20Poly1305,
};
use rand::RngCore;

use crate::constants::{NONCE_LEN, TAG_LEN};

/// A ChaCha20-Poly1305-IETF cipher bound to one 32-byte key.
pub struct Cipher {
    aead: ChaCha20Poly1305,
    nonce: [u8; NONCE_LEN],
}

impl Cipher {
    /// Generates a fresh 32-byte key and returns it as base64.
    pub fn gen_key() -> String {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        STANDARD.encode(key)
    }

    /// Decodes a base64 key and seeds a random starting nonce.
    pub fn init(key_b64: &str) -> Result<Cipher, KeyError> {
        let key = STANDARD.decode(key_b64).map_err(KeyError::Base64)?;
        if key.len() != 32 {
            return Err(KeyError::WrongLength(key.len()));
        }

        let aead =
            ChaCha20Poly1305::new_from_slice(&key).expect("32-byte key enforced above");

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        Ok(Cipher { aead, nonce })
    }

    /// Encrypts `data` in place, returning `(ciphertext, tag, nonce_used)` and
    /// advancing the sending nonce counter by one.
    pub fn encrypt(&mut self, data: &[u8]) -> (Vec<u8>, [u8; TAG_LEN], [u8; NONCE_LEN]) {
        let nonce_used = self.nonce;

        let mut buf = data.to_vec();
        let tag = self
            .aead
            .encrypt_in_place_detached(&nonce_used.into(), b"", &mut buf)
            .expect("encryption with a correctly sized key cannot fail");

        increment_le(&mut self.nonce);

        (buf, tag.into(), nonce_used)
    }

    /// Verifies and decrypts a ciphertext produced with the given nonce and
    /// tag. Never advances `self`'s own sending nonce counter.
    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        tag: &[u8; TAG_LEN],
        nonce: &[u8; NONCE_LEN],
    ) -> Result<Vec<u8>, AuthError> {
        let mut buf = ciphertext.to_vec();
        self.aead
            .decrypt_in_place_detached(nonce.into(), b"", &mut buf, tag.into())
            .map_err(|_| AuthError)?;

        Ok(buf)
    }
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str("Cipher(_)")
    }
}

/// Increments a byte string as a little-endian unsigned integer, wrapping on
/// overflow. Mirrors libsodium's `sodium_increment`.
fn increment_le(nonce: &mut [u8; NONCE_LEN]) {
    let mut carry: u16 = 1;
    for byte in nonce.iter_mut() {
        carry += *byte as u16;
        *byte = carry as u8;
        carry >>= 8;
    }
}

/// Error returned when a base64 key fails to decode or has the wrong length.
#[derive(Debug)]
pub enum KeyError {
    Base64(base64::DecodeError),
    WrongLength(usize),
}

impl Display for KeyError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            KeyError::Base64(err) => write!(f, "invalid base64 key: {}", err),
            KeyError::WrongLength(len) => {
                write!(f, "key must decode to 32 bytes, got {}", len)
            }
        }
    }
}

impl std::error::Error for KeyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KeyError::Base64(err) => Some(err),
            KeyError::WrongLength(_) => None,
        }
    }
}

/// AEAD tag verification failure.
#[derive(Debug)]
pub struct AuthError;

impl Display for AuthError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str("AEAD authentication failed")
    }
}

impl std::error::Error for AuthError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genkey_roundtrips_through_init() {
        let key = Cipher::gen_key();
        assert_eq!(key.len(), 44);
        assert!(Cipher::init(&key).is_ok());
    }

    #[test]
    fn init_rejects_wrong_length() {
        let short = STANDARD.encode([0u8; 16]);
        match Cipher::init(&short) {
            Err(KeyError::WrongLength(16)) => (),
            other => panic!("expected WrongLength(16), got {:?}", other),
        }
    }

    #[test]
    fn init_rejects_bad_base64() {
        assert!(matches!(Cipher::init("not base64!!"), Err(KeyError::Base64(_))));
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = Cipher::gen_key();
        let mut sender = Cipher::init(&key).unwrap();
        let receiver = Cipher::init(&key).unwrap();

        let data = b"hello from the flow multiplexer";
        let (ct, tag, nonce) = sender.encrypt(data);

        let plain = receiver.decrypt(&ct, &tag, &nonce).unwrap();
        assert_eq!(plain, data);
    }

    #[test]
    fn consecutive_nonces_differ_by_one() {
        let key = Cipher::gen_key();
        let mut cipher = Cipher::init(&key).unwrap();

        let (_, _, n1) = cipher.encrypt(b"a");
        let (_, _, n2) = cipher.encrypt(b"b");

        let mut expected = n1;
        increment_le(&mut expected);
        assert_eq!(n2, expected);
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let key = Cipher::gen_key();
        let mut sender = Cipher::init(&key).unwrap();
        let receiver = Cipher::init(&key).unwrap();

        let (mut ct, tag, nonce) = sender.encrypt(b"authenticate me");
        ct[0] ^= 0x01;

        assert!(receiver.decrypt(&ct, &tag, &nonce).is_err());
    }

    #[test]
    fn nonce_increment_wraps() {
        let mut nonce = [0xFFu8; NONCE_LEN];
        increment_le(&mut nonce);
        assert_eq!(nonce, [0u8; NONCE_LEN]);
    }
}
