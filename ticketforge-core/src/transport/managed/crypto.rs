//! Session-key operations for the managed client.
//!
//! Thin wrapper over `kerberos_crypto` for the two enctypes the client
//! requests: aes128 and aes256 cts-hmac-sha1-96 (17, 18), with their
//! checksum types 15 and 16.

use kerberos_crypto::{AesSizes, checksum_sha_aes, new_kerberos_cipher};
use thiserror::Error;

use crate::store::SecretBytes;

/// Error type for Kerberos cryptography.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("unsupported encryption type {0}")]
    UnsupportedEnctype(i32),

    #[error("invalid key length {len} for encryption type {enctype}")]
    InvalidKeyLength { enctype: i32, len: usize },

    #[error("cannot decrypt with encryption type {enctype}: {message}")]
    Decrypt { enctype: i32, message: String },
}

/// Supported encryption types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Enctype {
    Aes128CtsHmacSha196,
    Aes256CtsHmacSha196,
}

impl Enctype {
    pub fn from_i32(value: i32) -> Result<Self, CryptoError> {
        match value {
            17 => Ok(Self::Aes128CtsHmacSha196),
            18 => Ok(Self::Aes256CtsHmacSha196),
            other => Err(CryptoError::UnsupportedEnctype(other)),
        }
    }

    pub fn id(self) -> i32 {
        match self {
            Self::Aes128CtsHmacSha196 => 17,
            Self::Aes256CtsHmacSha196 => 18,
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            Self::Aes128CtsHmacSha196 => 16,
            Self::Aes256CtsHmacSha196 => 32,
        }
    }

    /// The keyed checksum type paired with this enctype.
    pub fn checksum_type(self) -> i32 {
        match self {
            Self::Aes128CtsHmacSha196 => 15,
            Self::Aes256CtsHmacSha196 => 16,
        }
    }

    fn aes_sizes(self) -> AesSizes {
        match self {
            Self::Aes128CtsHmacSha196 => AesSizes::Aes128,
            Self::Aes256CtsHmacSha196 => AesSizes::Aes256,
        }
    }
}

/// A session key with a known enctype.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    enctype: Enctype,
    value: SecretBytes,
}

impl Key {
    pub fn new(enctype: i32, value: &[u8]) -> Result<Self, CryptoError> {
        let enctype = Enctype::from_i32(enctype)?;
        if value.len() != enctype.key_len() {
            return Err(CryptoError::InvalidKeyLength {
                enctype: enctype.id(),
                len: value.len(),
            });
        }
        Ok(Self {
            enctype,
            value: SecretBytes::new(value.to_vec()),
        })
    }

    pub fn enctype(&self) -> Enctype {
        self.enctype
    }

    /// Encrypt under `usage` with a random confounder.
    pub fn encrypt(&self, usage: i32, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = new_kerberos_cipher(self.enctype.id())
            .map_err(|_| CryptoError::UnsupportedEnctype(self.enctype.id()))?;
        Ok(cipher.encrypt(self.value.expose(), usage, plaintext))
    }

    /// Decrypt and verify the integrity tag.
    pub fn decrypt(&self, usage: i32, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = new_kerberos_cipher(self.enctype.id())
            .map_err(|_| CryptoError::UnsupportedEnctype(self.enctype.id()))?;
        cipher
            .decrypt(self.value.expose(), usage, ciphertext)
            .map_err(|e| CryptoError::Decrypt {
                enctype: self.enctype.id(),
                message: format!("{:?}", e),
            })
    }

    /// The keyed checksum of `data` under `usage`.
    pub fn checksum(&self, usage: i32, data: &[u8]) -> Vec<u8> {
        checksum_sha_aes(
            self.value.expose(),
            usage,
            data,
            &self.enctype.aes_sizes(),
        )
    }
}
