//! AES-256-GCM codec for connection passwords

use crate::error::SecretError;
use crate::{Secret, SecretConfig};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

/// Version prefix of every blob this codec produces.
pub const BLOB_PREFIX: &str = "v1:";

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;
const PBKDF2_ROUNDS: u32 = 100_000;
const PASSPHRASE_SALT: &[u8] = b"vantage/connection-secrets/v1";

/// Encrypts and decrypts connection passwords.
///
/// The cipher is derived once at construction. An absent or blank key leaves
/// the codec unconfigured and every call fails with
/// [`SecretError::EncryptionKeyMissing`].
#[derive(Clone)]
pub struct SecretCodec {
    cipher: Option<Aes256Gcm>,
}

impl SecretCodec {
    pub fn new(config: &SecretConfig) -> Self {
        let cipher = config
            .key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(|key| Aes256Gcm::new(&derive_key(key)));
        Self { cipher }
    }

    /// A codec without key material.
    pub fn unconfigured() -> Self {
        Self { cipher: None }
    }

    pub fn is_configured(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, SecretError> {
        let cipher = self.cipher()?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| SecretError::EncryptionError("cipher rejected the payload".into()))?;

        let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(&nonce_bytes);
        payload.extend_from_slice(&ciphertext);

        Ok(format!("{BLOB_PREFIX}{}", STANDARD.encode(payload)))
    }

    pub fn decrypt(&self, blob: &str) -> Result<Secret, SecretError> {
        let cipher = self.cipher()?;

        let encoded = blob.trim().strip_prefix(BLOB_PREFIX).ok_or_else(|| {
            SecretError::DecryptionError(format!("missing '{BLOB_PREFIX}' version prefix"))
        })?;
        let payload = STANDARD.decode(encoded)?;
        if payload.len() < NONCE_LEN + TAG_LEN {
            return Err(SecretError::DecryptionError(format!(
                "blob is too short ({} bytes)",
                payload.len()
            )));
        }

        let (nonce_bytes, ciphertext) = payload.split_at(NONCE_LEN);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| {
                SecretError::DecryptionError(
                    "authentication failed (wrong key or tampered blob)".into(),
                )
            })?;

        String::from_utf8(plaintext)
            .map(Secret::new)
            .map_err(|_| SecretError::DecryptionError("plaintext is not valid UTF-8".into()))
    }

    fn cipher(&self) -> Result<&Aes256Gcm, SecretError> {
        self.cipher.as_ref().ok_or(SecretError::EncryptionKeyMissing)
    }
}

impl std::fmt::Debug for SecretCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCodec")
            .field("configured", &self.is_configured())
            .finish()
    }
}

fn derive_key(material: &str) -> Key<Aes256Gcm> {
    if let Ok(raw) = STANDARD.decode(material) {
        if raw.len() == KEY_LEN {
            return *Key::<Aes256Gcm>::from_slice(&raw);
        }
    }

    let mut stretched = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(
        material.as_bytes(),
        PASSPHRASE_SALT,
        PBKDF2_ROUNDS,
        &mut stretched,
    );
    *Key::<Aes256Gcm>::from_slice(&stretched)
}
