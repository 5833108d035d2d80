//! Key/value façade that transparently encrypts in-scope records.
//!
//! Every call takes the [`EncryptionSession`] explicitly; the store never holds
//! key material or caches decrypted values between calls.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use lockbox_core::{BackendError, EncryptionSettings, RawBackend, StoreError, VaultConfig};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::{
    codec::{self, EncryptedEnvelope},
    crypto::CryptoProvider,
    session::EncryptionSession,
};

/// Logical keys starting with this are reserved for store metadata.
pub const RESERVED_PREFIX: &str = "encryption-";
const SETTINGS_KEY: &str = "encryption-settings";
const SALT_KEY: &str = "encryption-salt";
const VERIFIER_KEY: &str = "encryption-verifier";

/// How a record currently sits in the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordForm {
    Plaintext(String),
    Encrypted(EncryptedEnvelope),
    /// Envelope-shaped but structurally invalid.
    Malformed(String),
}

pub struct EncryptedStore<B, C: ?Sized> {
    backend: B,
    provider: Arc<C>,
    prefix: String,
    max_record_bytes: usize,
}

impl<B: RawBackend, C: CryptoProvider + ?Sized> EncryptedStore<B, C> {
    pub fn new(backend: B, provider: Arc<C>, config: &VaultConfig) -> Self {
        Self {
            backend,
            provider,
            prefix: config.prefix.clone(),
            max_record_bytes: config.max_record_bytes,
        }
    }

    pub fn provider(&self) -> &C {
        &self.provider
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}-{key}", self.prefix)
    }

    fn logical_key(&self, key: &str) -> Result<String, StoreError> {
        if key.starts_with(RESERVED_PREFIX) {
            return Err(StoreError::ReservedKey {
                key: key.to_string(),
            });
        }
        Ok(self.storage_key(key))
    }

    /// Read and decode `key`. Envelopes need an unlocked session; in-scope keys
    /// need one even when the stored value is still plaintext.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn get<T: DeserializeOwned>(
        &self,
        session: &mut EncryptionSession,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        let Some(raw) = self.backend.get(&self.logical_key(key)?)? else {
            return Ok(None);
        };

        let in_scope = session.settings().covers(key);
        match EncryptedEnvelope::parse(&raw)? {
            Some(envelope) => {
                if !session.settings().enabled {
                    return Err(StoreError::MalformedEnvelope {
                        reason: format!("{key} is encrypted but encryption is disabled"),
                    });
                }
                let session_key = session.active_key()?;
                if envelope.epoch != session_key.epoch() {
                    debug!(
                        record_epoch = envelope.epoch,
                        session_epoch = session_key.epoch(),
                        "record written under a different key epoch"
                    );
                }
                codec::decode(&*self.provider, &envelope, session_key)
                    .await
                    .map(Some)
            }
            None => {
                if in_scope {
                    session.active_key()?;
                }
                parse_plaintext(&raw).map(Some)
            }
        }
    }

    /// Write `value`, encrypting it when the key is in scope. Nothing is written
    /// when the payload exceeds the record ceiling.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        session: &mut EncryptionSession,
        key: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let storage_key = self.logical_key(key)?;
        let payload = if session.settings().covers(key) {
            let session_key = session.active_key()?;
            codec::encode(&*self.provider, value, session_key)
                .await?
                .to_json()?
        } else {
            let plain = serde_json::to_string(value)?;
            // a plaintext value that reads back as an envelope could never be returned
            if !matches!(EncryptedEnvelope::parse(&plain), Ok(None)) {
                return Err(StoreError::Serialization {
                    reason: format!("value for {key} has the shape of an encrypted record"),
                });
            }
            plain
        };
        self.write_checked(key, &storage_key, &payload)
    }

    fn write_checked(&self, key: &str, storage_key: &str, payload: &str) -> Result<(), StoreError> {
        if payload.len() > self.max_record_bytes {
            return Err(StoreError::QuotaExceeded {
                key: key.to_string(),
                size: payload.len(),
                limit: Some(self.max_record_bytes),
            });
        }
        self.backend
            .set(storage_key, payload)
            .map_err(|err| match err {
                BackendError::QuotaExceeded { .. } => StoreError::QuotaExceeded {
                    key: key.to_string(),
                    size: payload.len(),
                    limit: None,
                },
                other => other.into(),
            })
    }

    #[instrument(skip_all, fields(key = %key))]
    pub fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.backend.remove(&self.logical_key(key)?)?;
        Ok(())
    }

    pub fn has(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.backend.get(&self.logical_key(key)?)?.is_some())
    }

    /// Logical keys under this store's prefix, excluding encryption metadata.
    pub fn keys(&self) -> Result<Vec<String>, StoreError> {
        let namespace = format!("{}-", self.prefix);
        Ok(self
            .backend
            .keys()?
            .into_iter()
            .filter_map(|k| k.strip_prefix(&namespace).map(str::to_string))
            .filter(|k| !k.starts_with(RESERVED_PREFIX))
            .collect())
    }

    /// Remove every logical record. Encryption metadata is kept.
    #[instrument(skip_all)]
    pub fn clear(&self) -> Result<usize, StoreError> {
        let keys = self.keys()?;
        for key in &keys {
            self.backend.remove(&self.storage_key(key))?;
        }
        debug!(removed = keys.len(), "store cleared");
        Ok(keys.len())
    }

    /// Apply every write or none of them. Current raw values are snapshotted
    /// first and restored if any write fails; the triggering error is returned.
    #[instrument(skip_all, fields(entries = entries.len()))]
    pub async fn set_multiple<K, T>(
        &self,
        session: &mut EncryptionSession,
        entries: &[(K, T)],
    ) -> Result<(), StoreError>
    where
        K: AsRef<str>,
        T: Serialize,
    {
        let mut snapshots: Vec<(String, Option<String>)> = Vec::with_capacity(entries.len());
        for (key, _) in entries {
            let storage_key = self.logical_key(key.as_ref())?;
            if snapshots.iter().any(|(k, _)| *k == storage_key) {
                continue;
            }
            let previous = self.backend.get(&storage_key)?;
            snapshots.push((storage_key, previous));
        }

        for (index, (key, value)) in entries.iter().enumerate() {
            if let Err(err) = self.set(session, key.as_ref(), value).await {
                warn!(index, key = key.as_ref(), error = %err, "batch write failed, rolling back");
                let unrestored = self.restore(&snapshots);
                if unrestored.is_empty() {
                    return Err(err);
                }
                return Err(StoreError::BackendUnavailable {
                    reason: format!(
                        "rollback incomplete for {} after batch failure ({err})",
                        unrestored.join("; ")
                    ),
                });
            }
        }
        Ok(())
    }

    /// Put every snapshot back; returns a description of each one that could not be restored.
    fn restore(&self, snapshots: &[(String, Option<String>)]) -> Vec<String> {
        let mut unrestored = Vec::new();
        for (storage_key, previous) in snapshots.iter().rev() {
            let outcome = match previous {
                Some(raw) => self.backend.set(storage_key, raw),
                None => self.backend.remove(storage_key),
            };
            if let Err(err) = outcome {
                warn!(key = %storage_key, error = %err, "rollback could not restore record");
                unrestored.push(format!("{storage_key}: {err}"));
            }
        }
        unrestored
    }

    /// Classify a stored record without decrypting it.
    pub fn inspect(&self, key: &str) -> Result<Option<RecordForm>, StoreError> {
        let Some(raw) = self.backend.get(&self.logical_key(key)?)? else {
            return Ok(None);
        };
        Ok(Some(match EncryptedEnvelope::parse(&raw) {
            Ok(Some(envelope)) => RecordForm::Encrypted(envelope),
            Ok(None) => RecordForm::Plaintext(raw),
            Err(err) => RecordForm::Malformed(err.to_string()),
        }))
    }

    /// Write an already-sealed envelope verbatim.
    pub(crate) fn put_envelope(
        &self,
        key: &str,
        envelope: &EncryptedEnvelope,
    ) -> Result<(), StoreError> {
        let storage_key = self.logical_key(key)?;
        self.write_checked(key, &storage_key, &envelope.to_json()?)
    }

    pub fn load_settings(&self) -> Result<EncryptionSettings, StoreError> {
        match self.backend.get(&self.storage_key(SETTINGS_KEY))? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(EncryptionSettings::default()),
        }
    }

    pub(crate) fn save_settings(&self, settings: &EncryptionSettings) -> Result<(), StoreError> {
        let raw = serde_json::to_string(settings)?;
        self.backend.set(&self.storage_key(SETTINGS_KEY), &raw)?;
        Ok(())
    }

    pub fn load_salt(&self) -> Result<Option<Vec<u8>>, StoreError> {
        let Some(raw) = self.backend.get(&self.storage_key(SALT_KEY))? else {
            return Ok(None);
        };
        STANDARD
            .decode(raw.trim())
            .map(Some)
            .map_err(|e| StoreError::MalformedEnvelope {
                reason: format!("stored salt is not base64: {e}"),
            })
    }

    pub(crate) fn save_salt(&self, salt: &[u8]) -> Result<(), StoreError> {
        self.backend
            .set(&self.storage_key(SALT_KEY), &STANDARD.encode(salt))?;
        Ok(())
    }

    pub fn load_verifier(&self) -> Result<Option<EncryptedEnvelope>, StoreError> {
        match self.backend.get(&self.storage_key(VERIFIER_KEY))? {
            Some(raw) => EncryptedEnvelope::parse(&raw)?
                .map(Some)
                .ok_or_else(|| StoreError::MalformedEnvelope {
                    reason: "verifier is not an envelope".to_string(),
                }),
            None => Ok(None),
        }
    }

    pub(crate) fn save_verifier(&self, verifier: &EncryptedEnvelope) -> Result<(), StoreError> {
        self.backend
            .set(&self.storage_key(VERIFIER_KEY), &verifier.to_json()?)?;
        Ok(())
    }

    pub(crate) fn remove_verifier(&self) -> Result<(), StoreError> {
        self.backend.remove(&self.storage_key(VERIFIER_KEY))?;
        Ok(())
    }
}

/// Plaintext records are JSON; anything else is legacy text returned as a string.
pub(crate) fn parse_plaintext<T: DeserializeOwned>(raw: &str) -> Result<T, StoreError> {
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => Ok(serde_json::from_value(value)?),
        Err(_) => Ok(serde_json::from_value(Value::String(raw.to_string()))?),
    }
}
