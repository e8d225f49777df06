//! Profile Codec
//!
//! Serializes [`ProtocolConfig`] to pretty JSON and optionally locks it
//! with a passphrase.
//!
//! # Locked envelope
//!
//! ```text
//! LKT1:base64( salt[16] ‖ nonce[12] ‖ ChaCha20-Poly1305 ciphertext )
//! key = BLAKE2s iterated over (salt, passphrase)
//! ```

use crate::config::ProtocolConfig;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use blake2::{Blake2s256, Digest};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;
use std::path::Path;

/// Envelope marker for locked profiles
pub const LOCKED_PREFIX: &str = "LKT1:";

/// Default profile file extension
pub const PROFILE_EXTENSION: &str = "lktconf";

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KDF_ROUNDS: u32 = 10_000;

/// Malformed profile text
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Parse error: {0}")]
pub struct ParseError(pub String);

/// Wrong passphrase or corrupted envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Decryption failed: wrong passphrase or corrupted data")]
pub struct DecryptError;

/// Import/export errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Decrypt(#[from] DecryptError),

    #[error("Passphrase entry cancelled")]
    Cancelled,

    #[error("Encryption failed: {0}")]
    Encrypt(String),

    #[error("IO error: {0}")]
    IoError(String),
}

/// Profile text codec
pub struct ConfigCodec;

impl ConfigCodec {
    pub fn serialize(config: &ProtocolConfig) -> Result<String, ParseError> {
        serde_json::to_string_pretty(config).map_err(|e| ParseError(e.to_string()))
    }

    pub fn deserialize(text: &str) -> Result<ProtocolConfig, ParseError> {
        serde_json::from_str(text).map_err(|e| ParseError(e.to_string()))
    }

    pub fn encrypt(text: &str, passphrase: &str) -> Result<String, CodecError> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut nonce);

        let cipher = ChaCha20Poly1305::new(&derive_key(passphrase, &salt));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), text.as_bytes())
            .map_err(|e| CodecError::Encrypt(e.to_string()))?;

        let mut blob = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(format!("{}{}", LOCKED_PREFIX, BASE64.encode(blob)))
    }

    pub fn decrypt(cipher_text: &str, passphrase: &str) -> Result<String, DecryptError> {
        let encoded = cipher_text
            .trim()
            .strip_prefix(LOCKED_PREFIX)
            .ok_or(DecryptError)?;
        let blob = BASE64.decode(encoded).map_err(|_| DecryptError)?;
        if blob.len() < SALT_LEN + NONCE_LEN + TAG_LEN {
            return Err(DecryptError);
        }

        let (salt, rest) = blob.split_at(SALT_LEN);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new(&derive_key(passphrase, salt));
        let plain = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| DecryptError)?;

        String::from_utf8(plain).map_err(|_| DecryptError)
    }

    /// Does this text look like a locked profile?
    pub fn is_locked(text: &str) -> bool {
        text.trim_start().starts_with(LOCKED_PREFIX)
    }

    /// Decode profile text, asking for a passphrase only if it is locked
    ///
    /// The provider returning `None` means the user cancelled.
    pub fn import<F>(text: &str, passphrase: F) -> Result<ProtocolConfig, CodecError>
    where
        F: FnOnce() -> Option<String>,
    {
        let parse_error = match Self::deserialize(text) {
            Ok(config) => return Ok(config),
            Err(e) => e,
        };
        if !Self::is_locked(text) {
            return Err(parse_error.into());
        }

        let passphrase = passphrase().ok_or(CodecError::Cancelled)?;
        let plain = Self::decrypt(text, &passphrase)?;
        Ok(Self::deserialize(&plain)?)
    }

    /// Encode a profile, locked when a passphrase is given
    pub fn export(config: &ProtocolConfig, passphrase: Option<&str>) -> Result<String, CodecError> {
        let mut record = config.clone();
        record.is_locked = Some(passphrase.is_some());
        let text = Self::serialize(&record)?;

        match passphrase {
            Some(passphrase) => Self::encrypt(&text, passphrase),
            None => Ok(text),
        }
    }

    pub fn import_file<F>(path: &Path, passphrase: F) -> Result<ProtocolConfig, CodecError>
    where
        F: FnOnce() -> Option<String>,
    {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CodecError::IoError(format!("{}: {}", path.display(), e)))?;
        Self::import(&text, passphrase)
    }

    pub fn export_file(
        path: &Path,
        config: &ProtocolConfig,
        passphrase: Option<&str>,
    ) -> Result<(), CodecError> {
        let text = Self::export(config, passphrase)?;
        std::fs::write(path, text)
            .map_err(|e| CodecError::IoError(format!("{}: {}", path.display(), e)))
    }
}

fn derive_key(passphrase: &str, salt: &[u8]) -> Key {
    let mut digest = Blake2s256::new()
        .chain_update(salt)
        .chain_update(passphrase.as_bytes())
        .finalize();
    for _ in 1..KDF_ROUNDS {
        digest = Blake2s256::new()
            .chain_update(digest)
            .chain_update(salt)
            .finalize();
    }
    *Key::from_slice(&digest)
}
