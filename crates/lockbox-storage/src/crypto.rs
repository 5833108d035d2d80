use std::fmt;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use async_trait::async_trait;
use lockbox_core::StoreError;
use pbkdf2::pbkdf2_hmac;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use tracing::debug;
use zeroize::Zeroizing;

/// Algorithm label written into every envelope.
pub const ALGORITHM: &str = "AES-256-GCM+PBKDF2-SHA256";
/// 256-bit symmetric key.
pub const KEY_LEN: usize = 32;
/// 96-bit GCM nonce.
pub const IV_LEN: usize = 12;
/// 128-bit authentication tag, appended to the ciphertext.
pub const TAG_LEN: usize = 16;
pub const SALT_LEN: usize = 16;

/// A user password held in a zero-on-drop buffer. `Debug` never prints it.
pub struct Password(Zeroizing<String>);

impl Password {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(Zeroizing::new(secret.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for Password {
    fn from(secret: String) -> Self {
        Self::new(secret)
    }
}

impl From<&str> for Password {
    fn from(secret: &str) -> Self {
        Self::new(secret)
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(***)")
    }
}

/// Key material derived from exactly one (password, salt, iterations) triple.
/// The bytes are wiped when the key is dropped; never persist or log them.
pub struct DerivedKey {
    bytes: Zeroizing<[u8; KEY_LEN]>,
    salt: Vec<u8>,
    iterations: u32,
    epoch: u32,
}

impl DerivedKey {
    pub fn new(bytes: Zeroizing<[u8; KEY_LEN]>, salt: Vec<u8>, iterations: u32) -> Self {
        Self {
            bytes,
            salt,
            iterations,
            epoch: 0,
        }
    }

    /// Tag the key with the rotation epoch its envelopes should record.
    pub fn with_epoch(mut self, epoch: u32) -> Self {
        self.epoch = epoch;
        self
    }

    pub fn expose_secret(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKey")
            .field("iterations", &self.iterations)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

/// Platform cryptography capability. Nothing else in the crate touches a cipher directly.
#[async_trait]
pub trait CryptoProvider: Send + Sync {
    /// Deterministic for identical inputs.
    async fn derive_key(
        &self,
        password: &Password,
        salt: &[u8],
        iterations: u32,
    ) -> Result<DerivedKey, StoreError>;

    /// Returns `(ciphertext_with_tag, iv)`; a fresh IV is drawn for every call.
    async fn encrypt(
        &self,
        plaintext: &[u8],
        key: &DerivedKey,
    ) -> Result<(Vec<u8>, Vec<u8>), StoreError>;

    /// Fails with `AuthenticationFailed` when the tag does not verify.
    async fn decrypt(
        &self,
        ciphertext: &[u8],
        iv: &[u8],
        key: &DerivedKey,
    ) -> Result<Vec<u8>, StoreError>;

    /// Cryptographically secure bytes. There is no fallback generator.
    fn random_bytes(&self, len: usize) -> Result<Vec<u8>, StoreError>;
}

/// AES-256-GCM with PBKDF2-HMAC-SHA256 key derivation and the OS random source.
#[derive(Debug, Default, Clone, Copy)]
pub struct AesGcmProvider;

#[async_trait]
impl CryptoProvider for AesGcmProvider {
    async fn derive_key(
        &self,
        password: &Password,
        salt: &[u8],
        iterations: u32,
    ) -> Result<DerivedKey, StoreError> {
        if iterations == 0 {
            return Err(StoreError::EncryptionFailed {
                reason: "key derivation needs at least one iteration".to_string(),
            });
        }
        if salt.is_empty() {
            return Err(StoreError::EncryptionFailed {
                reason: "key derivation needs a salt".to_string(),
            });
        }

        debug!(iterations, "deriving key");
        let secret = Zeroizing::new(password.expose().as_bytes().to_vec());
        let kdf_salt = salt.to_vec();
        // PBKDF2 is CPU bound; keep it off the async workers.
        let bytes = tokio::task::spawn_blocking(move || {
            let mut out = Zeroizing::new([0u8; KEY_LEN]);
            pbkdf2_hmac::<Sha256>(&secret, &kdf_salt, iterations, &mut out[..]);
            out
        })
        .await
        .map_err(|e| StoreError::CryptoUnavailable {
            reason: format!("key derivation task failed: {e}"),
        })?;

        Ok(DerivedKey::new(bytes, salt.to_vec(), iterations))
    }

    async fn encrypt(
        &self,
        plaintext: &[u8],
        key: &DerivedKey,
    ) -> Result<(Vec<u8>, Vec<u8>), StoreError> {
        let cipher = build_cipher(key)?;
        let iv = self.random_bytes(IV_LEN)?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|e| StoreError::EncryptionFailed {
                reason: format!("encrypt failed: {e}"),
            })?;
        Ok((ciphertext, iv))
    }

    async fn decrypt(
        &self,
        ciphertext: &[u8],
        iv: &[u8],
        key: &DerivedKey,
    ) -> Result<Vec<u8>, StoreError> {
        if iv.len() != IV_LEN {
            return Err(StoreError::MalformedEnvelope {
                reason: format!("expected {IV_LEN}-byte iv, got {}", iv.len()),
            });
        }
        if ciphertext.len() < TAG_LEN {
            return Err(StoreError::MalformedEnvelope {
                reason: format!("ciphertext shorter than the {TAG_LEN}-byte tag"),
            });
        }

        let cipher = build_cipher(key)?;
        cipher
            .decrypt(Nonce::from_slice(iv), ciphertext)
            .map_err(|_| StoreError::AuthenticationFailed)
    }

    fn random_bytes(&self, len: usize) -> Result<Vec<u8>, StoreError> {
        let mut buf = vec![0u8; len];
        OsRng
            .try_fill_bytes(&mut buf)
            .map_err(|e| StoreError::CryptoUnavailable {
                reason: format!("secure random source failed: {e}"),
            })?;
        Ok(buf)
    }
}

fn build_cipher(key: &DerivedKey) -> Result<Aes256Gcm, StoreError> {
    Aes256Gcm::new_from_slice(key.expose_secret()).map_err(|e| StoreError::CryptoUnavailable {
        reason: format!("cipher init failed: {e}"),
    })
}
