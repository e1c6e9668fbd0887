//! Machine-bound encryption for settings at rest.
//!
//! Values are sealed with AES-256-GCM under a key derived from a machine
//! identifier (hostname + OS + architecture) via PBKDF2-SHA256. Ciphertexts
//! produced on one host cannot in general be opened on another; callers are
//! expected to degrade gracefully (empty value + warning) when that happens.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

/// Marker prefix distinguishing ciphertext from legacy plaintext values.
const CIPHERTEXT_PREFIX: &str = "enc:v1:";

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const PBKDF2_ROUNDS: u32 = 100_000;

/// Errors from sealing or opening a settings value.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Value does not carry the ciphertext prefix
    #[error("Value is not a ciphertext")]
    NotCiphertext,
    /// Base64 or length structure is wrong
    #[error("Malformed ciphertext encoding")]
    Malformed,
    /// Authentication failed; wrong machine or corrupted value
    #[error("Decryption failed (value may have been encrypted on another machine)")]
    DecryptFailed,
    /// AES-GCM encryption itself failed
    #[error("Encryption failed")]
    EncryptFailed,
}

/// True if the stored value carries the ciphertext marker. Used by the
/// settings store to detect plaintext rows awaiting migration.
pub fn is_ciphertext(value: &str) -> bool {
    value.starts_with(CIPHERTEXT_PREFIX)
}

/// Identifier tying ciphertexts to this machine.
///
/// Hostname lookup failures fall back to a fixed marker rather than
/// erroring; the value only needs to be stable on one machine, not unique
/// across machines.
fn machine_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());
    format!("{}|{}|{}", host, std::env::consts::OS, std::env::consts::ARCH)
}

fn derive_key(salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(machine_id().as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    key
}

/// Seal a plaintext value.
///
/// Each call draws a fresh random salt and nonce, so two encryptions of the
/// same plaintext produce different ciphertexts. Output layout:
/// `enc:v1:` + base64(salt ‖ nonce ‖ ciphertext+tag).
pub fn encrypt(plaintext: &str) -> Result<String, CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let key = derive_key(&salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
        .map_err(|_| CryptoError::EncryptFailed)?;

    let mut blob = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&salt);
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&ciphertext);

    Ok(format!("{}{}", CIPHERTEXT_PREFIX, BASE64.encode(blob)))
}

/// Open a sealed value produced by [`encrypt`] on this machine.
pub fn decrypt(value: &str) -> Result<String, CryptoError> {
    let encoded = value
        .strip_prefix(CIPHERTEXT_PREFIX)
        .ok_or(CryptoError::NotCiphertext)?;

    let blob = BASE64.decode(encoded).map_err(|_| CryptoError::Malformed)?;
    if blob.len() < SALT_LEN + NONCE_LEN {
        return Err(CryptoError::Malformed);
    }

    let (salt, rest) = blob.split_at(SALT_LEN);
    let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);

    let key = derive_key(salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::DecryptFailed)?;

    String::from_utf8(plaintext).map_err(|_| CryptoError::Malformed)
}
