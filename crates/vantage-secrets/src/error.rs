//! Secret codec error types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecretError {
    #[error("encryption key is not configured (set VANTAGE_ENCRYPTION_KEY)")]
    EncryptionKeyMissing,

    #[error("stored secret could not be decrypted: {0}")]
    DecryptionError(String),

    #[error("secret could not be encrypted: {0}")]
    EncryptionError(String),
}

impl From<base64::DecodeError> for SecretError {
    fn from(err: base64::DecodeError) -> Self {
        SecretError::DecryptionError(format!("invalid base64 payload ({err})"))
    }
}
