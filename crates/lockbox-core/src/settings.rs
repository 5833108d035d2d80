use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted encryption settings. Always stored as plaintext JSON because they
/// must be readable before the store is unlocked.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionSettings {
    pub enabled: bool,
    /// Data types (the segment of a logical key before the first `/`) that are encrypted.
    #[serde(default)]
    pub encrypted_data_types: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_password_update: Option<DateTime<Utc>>,
    /// Incremented whenever the password is rotated; envelopes record the epoch
    /// they were written under.
    #[serde(default)]
    pub key_epoch: u32,
}

impl EncryptionSettings {
    /// Whether writes to `key` must be encrypted under these settings.
    pub fn covers(&self, key: &str) -> bool {
        self.enabled && self.encrypted_data_types.contains(data_type(key))
    }
}

/// Data type of a logical key: `profiles/work` belongs to `profiles`.
pub fn data_type(key: &str) -> &str {
    key.split_once('/').map_or(key, |(kind, _)| kind)
}
