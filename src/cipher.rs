//! Packet cipher
//!
//! Derives a symmetric key from a passphrase and salt with PBKDF2-HMAC-SHA1
//! and seals every packet body with an AEAD. A fresh random nonce is
//! prepended to each sealed body, so both directions can share one key.

use std::fmt;
use std::num::NonZeroU32;

use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, NONCE_LEN};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use serde::Deserialize;

use crate::error::{ConfigError, SessionError};

/// PBKDF2 iteration count
pub const PBKDF2_ITERATIONS: u32 = 4096;

/// Length of the derived key material
pub const DERIVED_KEY_LEN: usize = 32;

/// Supported packet ciphers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CipherKind {
    /// Plaintext packets
    #[default]
    None,
    /// AES-128-GCM keyed with the first 16 derived bytes
    Aes128,
    /// AES-256-GCM
    Aes256,
    /// ChaCha20-Poly1305
    Chacha20,
}

impl CipherKind {
    fn algorithm(self) -> Option<(&'static aead::Algorithm, usize)> {
        match self {
            CipherKind::None => None,
            CipherKind::Aes128 => Some((&aead::AES_128_GCM, 16)),
            CipherKind::Aes256 => Some((&aead::AES_256_GCM, 32)),
            CipherKind::Chacha20 => Some((&aead::CHACHA20_POLY1305, 32)),
        }
    }
}

impl fmt::Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CipherKind::None => "none",
            CipherKind::Aes128 => "aes128",
            CipherKind::Aes256 => "aes256",
            CipherKind::Chacha20 => "chacha20",
        };
        f.write_str(name)
    }
}

/// Encrypt/decrypt capability handed to the transport
pub struct BlockCrypt {
    kind: CipherKind,
    key: LessSafeKey,
    rng: SystemRandom,
}

impl BlockCrypt {
    /// Derive a key from `passphrase` and `salt` and build the cipher.
    ///
    /// Fails for [`CipherKind::None`], for an empty passphrase or salt, and
    /// when the AEAD rejects the key.
    pub fn new(kind: CipherKind, passphrase: &str, salt: &str) -> Result<Self, ConfigError> {
        let (algorithm, key_len) = kind
            .algorithm()
            .ok_or_else(|| ConfigError::Cipher("cipher `none` takes no key".into()))?;
        if passphrase.is_empty() {
            return Err(ConfigError::Cipher("passphrase must not be empty".into()));
        }
        if salt.is_empty() {
            return Err(ConfigError::Cipher("salt must not be empty".into()));
        }

        let mut derived = [0u8; DERIVED_KEY_LEN];
        let iterations =
            NonZeroU32::new(PBKDF2_ITERATIONS).ok_or_else(|| ConfigError::Cipher("zero iterations".into()))?;
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA1,
            iterations,
            salt.as_bytes(),
            passphrase.as_bytes(),
            &mut derived,
        );

        let unbound = UnboundKey::new(algorithm, &derived[..key_len])
            .map_err(|_| ConfigError::Cipher(format!("{kind} rejected derived key")))?;

        Ok(Self {
            kind,
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Cipher in use
    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    /// Bytes added to every sealed body
    pub fn overhead(&self) -> usize {
        NONCE_LEN + self.key.algorithm().tag_len()
    }

    /// Seal `plaintext` into `nonce || ciphertext || tag`
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| SessionError::Cipher)?;

        let mut out = Vec::with_capacity(plaintext.len() + self.overhead());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(plaintext);

        let tag = self
            .key
            .seal_in_place_separate_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut out[NONCE_LEN..],
            )
            .map_err(|_| SessionError::Cipher)?;
        out.extend_from_slice(tag.as_ref());

        Ok(out)
    }

    /// Open a sealed body in place, returning the plaintext slice
    pub fn open<'a>(&self, sealed: &'a mut [u8]) -> Result<&'a [u8], SessionError> {
        if sealed.len() < self.overhead() {
            return Err(SessionError::Cipher);
        }

        let (nonce, body) = sealed.split_at_mut(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce).map_err(|_| SessionError::Cipher)?;
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), body)
            .map_err(|_| SessionError::Cipher)?;

        Ok(plaintext)
    }
}

impl fmt::Debug for BlockCrypt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockCrypt").field("kind", &self.kind).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let crypt = BlockCrypt::new(CipherKind::Aes128, "passphrase", "salt").unwrap();
        let mut sealed = crypt.seal(b"hello").unwrap();

        assert_eq!(sealed.len(), 5 + crypt.overhead());
        assert_eq!(crypt.open(&mut sealed).unwrap(), b"hello");
    }

    #[test]
    fn test_nonce_is_fresh() {
        let crypt = BlockCrypt::new(CipherKind::Chacha20, "passphrase", "salt").unwrap();
        assert_ne!(crypt.seal(b"same").unwrap(), crypt.seal(b"same").unwrap());
    }

    #[test]
    fn test_same_secret_interoperates() {
        let a = BlockCrypt::new(CipherKind::Aes256, "passphrase", "salt").unwrap();
        let b = BlockCrypt::new(CipherKind::Aes256, "passphrase", "salt").unwrap();

        let mut sealed = a.seal(b"ping").unwrap();
        assert_eq!(b.open(&mut sealed).unwrap(), b"ping");
    }

    #[test]
    fn test_wrong_salt_fails_to_open() {
        let a = BlockCrypt::new(CipherKind::Aes256, "passphrase", "salt").unwrap();
        let b = BlockCrypt::new(CipherKind::Aes256, "passphrase", "pepper").unwrap();

        let mut sealed = a.seal(b"ping").unwrap();
        assert!(matches!(b.open(&mut sealed), Err(SessionError::Cipher)));
    }

    #[test]
    fn test_tampered_body_rejected() {
        let crypt = BlockCrypt::new(CipherKind::Aes128, "passphrase", "salt").unwrap();
        let mut sealed = crypt.seal(b"hello").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;

        assert!(crypt.open(&mut sealed).is_err());
        assert!(crypt.open(&mut [0u8; 4]).is_err());
    }

    #[test]
    fn test_construction_errors_surface() {
        assert!(matches!(
            BlockCrypt::new(CipherKind::Aes128, "", "salt"),
            Err(ConfigError::Cipher(_))
        ));
        assert!(matches!(
            BlockCrypt::new(CipherKind::Aes128, "key", ""),
            Err(ConfigError::Cipher(_))
        ));
        assert!(BlockCrypt::new(CipherKind::None, "key", "salt").is_err());
    }
}
