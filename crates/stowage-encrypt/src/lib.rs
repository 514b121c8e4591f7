//! Credential envelope encryption for driver configuration.
//!
//! Driver configs may carry credentials as `encrypted:<ciphertext>`. The
//! ciphertext is AES-256-GCM with a PBKDF2-SHA256 key derived from an
//! operator passphrase, encoded as `base64(salt || nonce || ciphertext)`.
//! The passphrase itself is handed to the constructor by the embedding
//! application — this crate never reads the process environment.
//!
//! # Usage
//!
//! ```
//! use stowage_encrypt::{PassphraseDecryptor, encrypt_credential};
//! use stowage_types::CredentialDecryptor;
//!
//! let ciphertext = encrypt_credential("hub_w_token", "operator-passphrase").expect("encrypt");
//! let decryptor = PassphraseDecryptor::new("operator-passphrase");
//! let clear = decryptor.decrypt(&ciphertext).expect("decrypt");
//! assert_eq!(clear, "hub_w_token");
//! ```
//!
//! ## Security
//!
//! - AES-256-GCM authenticated encryption
//! - PBKDF2 with 100,000 iterations for key derivation
//! - Random salt and nonce per encryption

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, OsRng, rand_core::RngCore},
};
use anyhow::{Context, Result, bail};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use pbkdf2::pbkdf2_hmac_array;
use sha2::Sha256;
use stowage_types::CredentialDecryptor;

/// Salt length for key derivation.
const SALT_SIZE: usize = 16;
/// Nonce length for AES-GCM.
const NONCE_SIZE: usize = 12;
/// PBKDF2 iteration count.
const PBKDF2_ITERATIONS: u32 = 100_000;
/// Derived key length (AES-256).
const KEY_SIZE: usize = 32;

/// Encrypt a clear credential for embedding in a config envelope.
///
/// Returns the bare ciphertext; callers prepend `encrypted:` when writing it
/// into a [`stowage_types::DriverConfig`].
pub fn encrypt_credential(credential: &str, passphrase: &str) -> Result<String> {
    let mut salt = [0u8; SALT_SIZE];
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut nonce_bytes);

    let key = derive_key(passphrase, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key).context("failed to initialize cipher")?;
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, credential.as_bytes())
        .map_err(|e| anyhow::anyhow!("encryption failed: {e}"))?;

    let mut envelope = Vec::with_capacity(SALT_SIZE + NONCE_SIZE + ciphertext.len());
    envelope.extend_from_slice(&salt);
    envelope.extend_from_slice(&nonce_bytes);
    envelope.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(envelope))
}

/// Decrypt a `base64(salt || nonce || ciphertext)` envelope.
pub fn decrypt_credential(ciphertext: &str, passphrase: &str) -> Result<String> {
    let envelope = BASE64
        .decode(ciphertext.trim())
        .context("credential ciphertext is not valid base64")?;
    if envelope.len() <= SALT_SIZE + NONCE_SIZE {
        bail!("credential ciphertext is too short");
    }

    let (salt, rest) = envelope.split_at(SALT_SIZE);
    let (nonce_bytes, payload) = rest.split_at(NONCE_SIZE);

    let key = derive_key(passphrase, salt);
    let cipher = Aes256Gcm::new_from_slice(&key).context("failed to initialize cipher")?;
    let nonce = Nonce::from_slice(nonce_bytes);

    let clear = cipher
        .decrypt(nonce, payload)
        .map_err(|_| anyhow::anyhow!("credential decryption failed (wrong passphrase?)"))?;
    String::from_utf8(clear).context("decrypted credential is not UTF-8")
}

fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; KEY_SIZE] {
    pbkdf2_hmac_array::<Sha256, KEY_SIZE>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS)
}

/// A [`CredentialDecryptor`] bound to one operator passphrase.
pub struct PassphraseDecryptor {
    passphrase: String,
}

impl PassphraseDecryptor {
    pub fn new(passphrase: impl Into<String>) -> Self {
        Self { passphrase: passphrase.into() }
    }
}

impl CredentialDecryptor for PassphraseDecryptor {
    fn decrypt(&self, ciphertext: &str) -> Result<String> {
        decrypt_credential(ciphertext, &self.passphrase)
    }
}
