//! Single entry point for the rest of the application: the store, its session
//! and the migration manager wired together over one backend.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use lockbox_core::{EncryptionSettings, RawBackend, StoreError, VaultConfig};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, instrument};

use crate::{
    crypto::{CryptoProvider, Password},
    migration::{MigrationManager, MigrationReport},
    password,
    session::{Clock, EncryptionSession, SessionStatus, SystemClock},
    store::{EncryptedStore, RecordForm},
};

/// Snapshot of the vault for settings screens and the `status` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultStatus {
    pub session: SessionStatus,
    pub settings: EncryptionSettings,
    pub plaintext_records: usize,
    pub encrypted_records: usize,
    pub malformed_records: usize,
    /// Envelope count per key epoch; more than one entry means a rotation is incomplete.
    pub records_by_epoch: BTreeMap<u32, usize>,
}

pub struct Vault<B, C: ?Sized> {
    store: EncryptedStore<B, C>,
    session: EncryptionSession,
    manager: MigrationManager,
}

impl<B: RawBackend, C: CryptoProvider + ?Sized> Vault<B, C> {
    /// Open over `backend`, starting `Disabled` or `Locked` per the persisted settings.
    pub fn open(backend: B, provider: Arc<C>, config: &VaultConfig) -> Result<Self, StoreError> {
        Self::open_with_clock(backend, provider, config, Arc::new(SystemClock))
    }

    pub fn open_with_clock(
        backend: B,
        provider: Arc<C>,
        config: &VaultConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let store = EncryptedStore::new(backend, provider, config);
        let settings = store.load_settings()?;
        debug!(enabled = settings.enabled, "vault opened");
        Ok(Self {
            session: EncryptionSession::new(settings, config.session_timeout(), clock.clone()),
            manager: MigrationManager::new(config, clock),
            store,
        })
    }

    pub async fn get<T: DeserializeOwned>(&mut self, key: &str) -> Result<Option<T>, StoreError> {
        self.store.get(&mut self.session, key).await
    }

    pub async fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<(), StoreError> {
        self.store.set(&mut self.session, key, value).await
    }

    pub async fn set_multiple<K: AsRef<str>, T: Serialize>(
        &mut self,
        entries: &[(K, T)],
    ) -> Result<(), StoreError> {
        self.store.set_multiple(&mut self.session, entries).await
    }

    pub fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.store.remove(key)
    }

    pub fn has(&self, key: &str) -> Result<bool, StoreError> {
        self.store.has(key)
    }

    pub fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.store.keys()
    }

    pub fn clear(&self) -> Result<usize, StoreError> {
        self.store.clear()
    }

    pub async fn enable_encryption(
        &mut self,
        password: &Password,
        scope: BTreeSet<String>,
        password_hint: Option<String>,
    ) -> Result<MigrationReport, StoreError> {
        self.manager
            .enable_encryption(&self.store, &mut self.session, password, scope, password_hint)
            .await
    }

    pub async fn change_password(
        &mut self,
        old_password: &Password,
        new_password: &Password,
    ) -> Result<MigrationReport, StoreError> {
        self.manager
            .change_password(&self.store, &mut self.session, old_password, new_password)
            .await
    }

    pub fn disable_encryption(&mut self) -> Result<usize, StoreError> {
        self.manager.disable_encryption(&self.store, &mut self.session)
    }

    #[instrument(skip_all)]
    pub async fn unlock(&mut self, password: &Password) -> Result<(), StoreError> {
        if !self.session.settings().enabled {
            return Err(StoreError::NotEnabled);
        }
        let verifier = self
            .store
            .load_verifier()?
            .ok_or_else(|| StoreError::MalformedEnvelope {
                reason: "encryption is enabled but the password verifier is missing".to_string(),
            })?;
        self.session
            .unlock(self.store.provider(), &verifier, password)
            .await
    }

    pub fn lock(&mut self) {
        self.session.lock();
    }

    pub fn is_unlocked(&mut self) -> bool {
        self.session.is_unlocked()
    }

    pub fn settings(&self) -> &EncryptionSettings {
        self.session.settings()
    }

    pub fn password_hint(&self) -> Option<&str> {
        self.session.settings().password_hint.as_deref()
    }

    pub fn suggest_password(&self, len: usize) -> Result<Password, StoreError> {
        password::suggest_password(self.store.provider(), len)
    }

    pub fn status(&mut self) -> Result<VaultStatus, StoreError> {
        let mut status = VaultStatus {
            session: self.session.status(),
            settings: self.session.settings().clone(),
            plaintext_records: 0,
            encrypted_records: 0,
            malformed_records: 0,
            records_by_epoch: BTreeMap::new(),
        };
        for key in self.store.keys()? {
            match self.store.inspect(&key)? {
                Some(RecordForm::Plaintext(_)) => status.plaintext_records += 1,
                Some(RecordForm::Encrypted(envelope)) => {
                    status.encrypted_records += 1;
                    *status.records_by_epoch.entry(envelope.epoch).or_default() += 1;
                }
                Some(RecordForm::Malformed(_)) => status.malformed_records += 1,
                None => {}
            }
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use lockbox_core::{MemoryBackend, PasswordPolicy};
    use serde_json::{json, Value};

    use super::*;
    use crate::{
        crypto::AesGcmProvider,
        session::{ManualClock, SessionState},
        store::tests::test_config,
    };

    fn open(backend: &MemoryBackend, clock: &ManualClock) -> Vault<MemoryBackend, AesGcmProvider> {
        Vault::open_with_clock(
            backend.clone(),
            Arc::new(AesGcmProvider),
            &test_config(),
            Arc::new(clock.clone()),
        )
        .expect("open")
    }

    fn scope(types: &[&str]) -> BTreeSet<String> {
        types.iter().map(|t| t.to_string()).collect()
    }

    #[tokio::test]
    async fn enable_then_reopen_requires_unlock() {
        let backend = MemoryBackend::new();
        let clock = ManualClock::new(Utc::now());
        let mut vault = open(&backend, &clock);
        vault
            .set("profiles", &json!([{"name": "default", "region": "eu"}]))
            .await
            .expect("seed");

        let report = vault
            .enable_encryption(&Password::from("Str0ng!Pass"), scope(&["profiles"]), None)
            .await
            .expect("enable");
        assert_eq!((report.migrated, report.failed), (1, 0));

        // a fresh page load starts locked
        let mut reopened = open(&backend, &clock);
        assert_eq!(reopened.status().expect("status").session.state, SessionState::Locked);
        let err = reopened.get::<Value>("profiles").await.expect_err("locked");
        assert_eq!(err, StoreError::Locked);

        reopened
            .unlock(&Password::from("Str0ng!Pass"))
            .await
            .expect("unlock");
        let profiles: Option<Value> = reopened.get("profiles").await.expect("get");
        assert_eq!(profiles, Some(json!([{"name": "default", "region": "eu"}])));
    }

    #[tokio::test]
    async fn wrong_unlock_stays_locked() {
        let backend = MemoryBackend::new();
        let clock = ManualClock::new(Utc::now());
        let config = VaultConfig {
            password_policy: PasswordPolicy::permissive(),
            ..test_config()
        };
        let mut vault = Vault::open_with_clock(
            backend.clone(),
            Arc::new(AesGcmProvider),
            &config,
            Arc::new(clock.clone()),
        )
        .expect("open");
        vault
            .enable_encryption(&Password::from("A"), scope(&["credentials"]), None)
            .await
            .expect("enable");
        vault.lock();

        let err = vault.unlock(&Password::from("B")).await.expect_err("wrong");
        assert_eq!(err, StoreError::InvalidPassword);
        assert!(!vault.is_unlocked());
        assert_eq!(vault.status().expect("status").session.state, SessionState::Locked);
    }

    #[tokio::test]
    async fn session_times_out_lazily() {
        let backend = MemoryBackend::new();
        let clock = ManualClock::new(Utc::now());
        let mut vault = open(&backend, &clock);
        vault
            .enable_encryption(&Password::from("Str0ng!Pass"), scope(&["env"]), None)
            .await
            .expect("enable");
        vault.set("env/API_URL", "https://example.test").await.expect("set");

        clock.advance(Duration::milliseconds(60_001));
        assert!(!vault.is_unlocked());
        assert_eq!(
            vault.get::<String>("env/API_URL").await.expect_err("expired"),
            StoreError::SessionTimedOut
        );
        assert_eq!(
            vault.set("env/API_URL", "x").await.expect_err("expired"),
            StoreError::SessionTimedOut
        );
        assert!(vault.status().expect("status").session.timed_out);
    }

    #[tokio::test]
    async fn zero_timeout_never_expires() {
        let backend = MemoryBackend::new();
        let clock = ManualClock::new(Utc::now());
        let config = VaultConfig {
            session_timeout_ms: Some(0),
            ..test_config()
        };
        let mut vault = Vault::open_with_clock(
            backend,
            Arc::new(AesGcmProvider),
            &config,
            Arc::new(clock.clone()),
        )
        .expect("open");
        vault
            .enable_encryption(&Password::from("Str0ng!Pass"), scope(&["env"]), None)
            .await
            .expect("enable");

        clock.advance(Duration::days(30));
        assert!(vault.is_unlocked());
        vault.set("env/API_URL", "https://example.test").await.expect("set");
        assert_eq!(vault.status().expect("status").session.timeout_ms, None);
    }

    #[tokio::test]
    async fn status_counts_records_per_epoch() {
        let backend = MemoryBackend::new();
        let clock = ManualClock::new(Utc::now());
        let mut vault = open(&backend, &clock);
        vault.set("theme", "dark").await.expect("seed");
        vault
            .enable_encryption(
                &Password::from("Str0ng!Pass"),
                scope(&["profiles"]),
                Some("hint".into()),
            )
            .await
            .expect("enable");
        vault.set("profiles/a", &json!(1)).await.expect("set");
        vault.set("profiles/b", &json!(2)).await.expect("set");

        backend.fail_writes_to("app-profiles/b");
        let report = vault
            .change_password(&Password::from("Str0ng!Pass"), &Password::from("N3w!Passw0rd"))
            .await
            .expect("rotate");
        assert!(!report.is_complete());

        let status = vault.status().expect("status");
        assert_eq!(status.plaintext_records, 1);
        assert_eq!(status.encrypted_records, 2);
        assert_eq!(status.records_by_epoch, BTreeMap::from([(1, 1), (2, 1)]));
        assert_eq!(vault.password_hint(), Some("hint"));
    }

    #[tokio::test]
    async fn disable_returns_store_to_plaintext_writes() {
        let backend = MemoryBackend::new();
        let clock = ManualClock::new(Utc::now());
        let mut vault = open(&backend, &clock);
        vault
            .enable_encryption(&Password::from("Str0ng!Pass"), scope(&["profiles"]), None)
            .await
            .expect("enable");
        vault.set("profiles/a", &json!(1)).await.expect("set");

        assert_eq!(vault.disable_encryption().expect("disable"), 1);
        assert!(!vault.settings().enabled);
        vault.set("profiles/b", &json!(2)).await.expect("plain write");
        assert_eq!(backend.get("app-profiles/b").expect("raw").as_deref(), Some("2"));
        assert!(matches!(
            vault.get::<Value>("profiles/a").await,
            Err(StoreError::MalformedEnvelope { .. })
        ));
        assert_eq!(
            vault.unlock(&Password::from("Str0ng!Pass")).await,
            Err(StoreError::NotEnabled)
        );
    }
}
