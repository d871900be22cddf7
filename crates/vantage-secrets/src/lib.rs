//! Vantage connection secrets
//!
//! Encrypts and decrypts the passwords stored on connection records:
//! - AES-256-GCM with a random 96-bit nonce per blob
//! - `v1:` versioned, base64 encoded blobs
//! - key material from a raw 32 byte key or a PBKDF2 stretched passphrase
//!
//! Decrypted values are handed out as [`Secret`], which never prints its
//! contents through `Debug` or `Display`.

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod codec;
pub mod error;

pub use codec::{SecretCodec, BLOB_PREFIX};
pub use error::SecretError;

/// Key material injected into the codec.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct SecretConfig {
    /// Base64 of a 32 byte key, or a passphrase. `None` leaves the codec unconfigured.
    pub key: Option<String>,
}

impl SecretConfig {
    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
        }
    }
}

impl fmt::Debug for SecretConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretConfig")
            .field("key", &self.key.as_ref().map(|_| "[redacted]"))
            .finish()
    }
}

/// A decrypted credential. Only [`Secret::expose`] reveals the value.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([redacted])")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}
