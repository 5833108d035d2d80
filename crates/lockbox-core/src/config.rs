use serde::{Deserialize, Serialize};

/// Default PBKDF2 iteration count for newly derived keys. Existing envelopes keep
/// the count they were written with.
pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;
/// Sessions re-lock after 30 minutes by default.
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 30 * 60 * 1000;
/// Largest serialized record the store will write.
pub const DEFAULT_MAX_RECORD_BYTES: usize = 1024 * 1024;

/// Tunables for the encrypted store. Every field has a default so a partial
/// `[vault]` table in a config file is enough.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VaultConfig {
    /// Namespace prepended to every backend key (`<prefix>-<logical-key>`).
    pub prefix: String,
    pub kdf_iterations: u32,
    /// `None` or `0` keeps the session unlocked until an explicit lock. TOML
    /// has no null, so config files use `0`.
    pub session_timeout_ms: Option<u64>,
    pub max_record_bytes: usize,
    pub password_policy: PasswordPolicy,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            prefix: "lockbox".to_string(),
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
            session_timeout_ms: Some(DEFAULT_SESSION_TIMEOUT_MS),
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
            password_policy: PasswordPolicy::default(),
        }
    }
}

/// Minimum requirements for a new encryption password.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PasswordPolicy {
    pub min_length: usize,
    /// How many of lowercase, uppercase, digits and symbols must appear.
    pub min_character_classes: usize,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_length: 8,
            min_character_classes: 3,
        }
    }
}

impl VaultConfig {
    /// Effective session timeout; `0` means no expiry.
    pub fn session_timeout(&self) -> Option<u64> {
        self.session_timeout_ms.filter(|ms| *ms > 0)
    }
}

impl PasswordPolicy {
    /// Policy that accepts any non-empty password.
    pub fn permissive() -> Self {
        Self {
            min_length: 1,
            min_character_classes: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_table_keeps_defaults() {
        let cfg: VaultConfig = serde_json::from_str(r#"{"prefix":"admin"}"#).expect("parse");
        assert_eq!(cfg.prefix, "admin");
        assert_eq!(cfg.kdf_iterations, DEFAULT_KDF_ITERATIONS);
        assert_eq!(cfg.session_timeout_ms, Some(DEFAULT_SESSION_TIMEOUT_MS));
        assert_eq!(cfg.password_policy, PasswordPolicy::default());
    }

    #[test]
    fn timeout_can_be_disabled() {
        let cfg: VaultConfig =
            serde_json::from_str(r#"{"session_timeout_ms":null}"#).expect("parse");
        assert_eq!(cfg.session_timeout(), None);

        let cfg: VaultConfig = serde_json::from_str(r#"{"session_timeout_ms":0}"#).expect("parse");
        assert_eq!(cfg.session_timeout(), None);
        assert_eq!(
            VaultConfig::default().session_timeout(),
            Some(DEFAULT_SESSION_TIMEOUT_MS)
        );
    }
}
