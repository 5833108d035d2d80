//! Mode changes for the encrypted store: enabling encryption over existing
//! plaintext records, rotating the password, and disabling encryption.
//!
//! None of these are transactional across records. Each record either moves to
//! its new form or stays exactly as it was, and the returned [`MigrationReport`]
//! says which.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use lockbox_core::{PasswordPolicy, RawBackend, StoreError, VaultConfig};
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::{
    codec::{self, EncryptedEnvelope},
    crypto::{CryptoProvider, DerivedKey, Password, SALT_LEN},
    password::validate_password,
    session::{verify_password, Clock, EncryptionSession, CANARY},
    store::{parse_plaintext, EncryptedStore, RecordForm},
};

/// Per-record accounting for a migration or rotation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    /// Records rewritten into their new form.
    pub migrated: usize,
    /// Records left exactly as they were because they could not be rewritten.
    pub failed: usize,
    /// Records that were already in the target form.
    pub unchanged: usize,
    /// Envelopes written under an earlier key that the current key cannot open,
    /// e.g. left behind by a disable before re-enabling. Never rewritten.
    pub stale: usize,
    pub failed_keys: Vec<String>,
}

impl MigrationReport {
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }

    fn record_failure(&mut self, key: &str, err: &StoreError) {
        warn!(key, error = %err, "record left in its previous form");
        self.failed += 1;
        self.failed_keys.push(key.to_string());
    }
}

/// Orchestrates enable / change-password / disable over a store and its session.
pub struct MigrationManager {
    kdf_iterations: u32,
    policy: PasswordPolicy,
    clock: Arc<dyn Clock>,
}

impl MigrationManager {
    pub fn new(config: &VaultConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            kdf_iterations: config.kdf_iterations,
            policy: config.password_policy,
            clock,
        }
    }

    /// Turn encryption on for `scope` and encrypt every existing plaintext record
    /// in scope. When already enabled, `password` must match the current one and
    /// the call only picks up records that are still plaintext.
    #[instrument(skip_all, fields(scope = ?scope))]
    pub async fn enable_encryption<B, C>(
        &self,
        store: &EncryptedStore<B, C>,
        session: &mut EncryptionSession,
        password: &Password,
        scope: BTreeSet<String>,
        password_hint: Option<String>,
    ) -> Result<MigrationReport, StoreError>
    where
        B: RawBackend,
        C: CryptoProvider + ?Sized,
    {
        validate_password(&self.policy, password)?;
        let provider = store.provider();
        let mut settings = session.settings().clone();

        let key = if settings.enabled {
            let verifier = required_verifier(store)?;
            let key = verify_password(provider, &verifier, password).await?;
            settings.encrypted_data_types.extend(scope);
            if password_hint.is_some() {
                settings.password_hint = password_hint;
            }
            store.save_settings(&settings)?;
            key
        } else {
            let epoch = settings.key_epoch + 1;
            let key = self.fresh_key(provider, password, epoch).await?;
            let verifier = codec::encode(provider, CANARY, &key).await?;

            store.save_salt(key.salt())?;
            store.save_verifier(&verifier)?;
            settings.enabled = true;
            settings.encrypted_data_types = scope;
            settings.password_hint = password_hint;
            settings.last_password_update = Some(self.clock.now());
            settings.key_epoch = epoch;
            store.save_settings(&settings)?;
            info!(epoch, "encryption enabled");
            key
        };
        session.replace_settings(settings);

        let outcome = encrypt_plaintext_records(store, session, &key).await;
        session.begin(key);
        let report = outcome?;
        info!(
            migrated = report.migrated,
            failed = report.failed,
            unchanged = report.unchanged,
            stale = report.stale,
            "plaintext migration finished"
        );
        Ok(report)
    }

    /// Re-encrypt every envelope under a key derived from `new_password` and a
    /// fresh salt.
    ///
    /// If `old_password` no longer opens the verifier but `new_password` does, a
    /// previous rotation was interrupted and this call resumes it. Records that
    /// cannot be opened with the old password stay as they are and are reported
    /// in `failed`; the session ends up keyed to `new_password` either way.
    #[instrument(skip_all)]
    pub async fn change_password<B, C>(
        &self,
        store: &EncryptedStore<B, C>,
        session: &mut EncryptionSession,
        old_password: &Password,
        new_password: &Password,
    ) -> Result<MigrationReport, StoreError>
    where
        B: RawBackend,
        C: CryptoProvider + ?Sized,
    {
        if !session.settings().enabled {
            return Err(StoreError::NotEnabled);
        }
        validate_password(&self.policy, new_password)?;
        let provider = store.provider();
        let verifier = required_verifier(store)?;

        let mut old_keys = OldKeys::new(old_password);
        let new_key = match verify_password(provider, &verifier, old_password).await {
            Ok(old_key) => {
                old_keys.insert(old_key);
                let mut settings = session.settings().clone();
                let epoch = settings.key_epoch + 1;
                let new_key = self.fresh_key(provider, new_password, epoch).await?;
                let new_verifier = codec::encode(provider, CANARY, &new_key).await?;

                store.save_salt(new_key.salt())?;
                store.save_verifier(&new_verifier)?;
                settings.key_epoch = epoch;
                settings.last_password_update = Some(self.clock.now());
                store.save_settings(&settings)?;
                session.replace_settings(settings);
                info!(epoch, "password rotated, re-encrypting records");
                new_key
            }
            Err(StoreError::InvalidPassword) => {
                let new_key = verify_password(provider, &verifier, new_password).await?;
                info!(
                    epoch = new_key.epoch(),
                    "resuming interrupted password rotation"
                );
                new_key
            }
            Err(err) => return Err(err),
        };

        let outcome = reencrypt_records(store, &mut old_keys, &new_key).await;
        session.begin(new_key);
        let report = outcome?;
        if report.is_complete() {
            info!(
                migrated = report.migrated,
                unchanged = report.unchanged,
                "password rotation complete"
            );
        } else {
            warn!(
                migrated = report.migrated,
                failed = report.failed,
                "password rotation incomplete"
            );
        }
        Ok(report)
    }

    /// Switch encryption off. Existing envelopes stay on disk untouched and reads
    /// of them fail; they can only be recovered by enabling encryption again and
    /// rotating away from the password they were written under.
    /// Returns how many envelopes were left behind.
    #[instrument(skip_all)]
    pub fn disable_encryption<B, C>(
        &self,
        store: &EncryptedStore<B, C>,
        session: &mut EncryptionSession,
    ) -> Result<usize, StoreError>
    where
        B: RawBackend,
        C: CryptoProvider + ?Sized,
    {
        let mut settings = session.settings().clone();
        if !settings.enabled {
            session.disable();
            return Ok(0);
        }

        settings.enabled = false;
        settings.password_hint = None;
        store.save_settings(&settings)?;
        store.remove_verifier()?;
        session.replace_settings(settings);
        session.disable();

        let mut stranded = 0;
        for key in store.keys()? {
            if matches!(store.inspect(&key)?, Some(RecordForm::Encrypted(_))) {
                stranded += 1;
            }
        }
        if stranded > 0 {
            warn!(stranded, "encryption disabled with envelopes still on disk");
        } else {
            info!("encryption disabled");
        }
        Ok(stranded)
    }

    async fn fresh_key<C: CryptoProvider + ?Sized>(
        &self,
        provider: &C,
        password: &Password,
        epoch: u32,
    ) -> Result<DerivedKey, StoreError> {
        let salt = provider.random_bytes(SALT_LEN)?;
        Ok(provider
            .derive_key(password, &salt, self.kdf_iterations)
            .await?
            .with_epoch(epoch))
    }
}

fn required_verifier<B, C>(store: &EncryptedStore<B, C>) -> Result<EncryptedEnvelope, StoreError>
where
    B: RawBackend,
    C: CryptoProvider + ?Sized,
{
    store
        .load_verifier()?
        .ok_or_else(|| StoreError::MalformedEnvelope {
            reason: "encryption is enabled but the password verifier is missing".to_string(),
        })
}

async fn encrypt_plaintext_records<B, C>(
    store: &EncryptedStore<B, C>,
    session: &EncryptionSession,
    key: &DerivedKey,
) -> Result<MigrationReport, StoreError>
where
    B: RawBackend,
    C: CryptoProvider + ?Sized,
{
    let mut report = MigrationReport::default();
    for record_key in store.keys()? {
        if !session.settings().covers(&record_key) {
            continue;
        }
        match store.inspect(&record_key)? {
            Some(RecordForm::Plaintext(raw)) => {
                match encrypt_one(store, &record_key, &raw, key).await {
                    Ok(()) => report.migrated += 1,
                    Err(StoreError::CryptoUnavailable { reason }) => {
                        return Err(StoreError::CryptoUnavailable { reason })
                    }
                    Err(err) => report.record_failure(&record_key, &err),
                }
            }
            Some(RecordForm::Encrypted(envelope)) => {
                if envelope.epoch == key.epoch() && envelope.salt == key.salt() {
                    report.unchanged += 1;
                } else {
                    warn!(key = %record_key, epoch = envelope.epoch, "envelope from an earlier key left as is");
                    report.stale += 1;
                }
            }
            Some(RecordForm::Malformed(reason)) => report.record_failure(
                &record_key,
                &StoreError::MalformedEnvelope { reason },
            ),
            None => {}
        }
    }
    Ok(report)
}

async fn encrypt_one<B, C>(
    store: &EncryptedStore<B, C>,
    record_key: &str,
    raw: &str,
    key: &DerivedKey,
) -> Result<(), StoreError>
where
    B: RawBackend,
    C: CryptoProvider + ?Sized,
{
    let value: Value = parse_plaintext(raw)?;
    let envelope = codec::encode(store.provider(), &value, key).await?;
    store.put_envelope(record_key, &envelope)
}

async fn reencrypt_records<B, C>(
    store: &EncryptedStore<B, C>,
    old_keys: &mut OldKeys<'_>,
    new_key: &DerivedKey,
) -> Result<MigrationReport, StoreError>
where
    B: RawBackend,
    C: CryptoProvider + ?Sized,
{
    let provider = store.provider();
    let mut report = MigrationReport::default();

    for record_key in store.keys()? {
        let envelope = match store.inspect(&record_key)? {
            Some(RecordForm::Encrypted(envelope)) => envelope,
            Some(RecordForm::Malformed(reason)) => {
                report.record_failure(&record_key, &StoreError::MalformedEnvelope { reason });
                continue;
            }
            Some(RecordForm::Plaintext(_)) | None => continue,
        };

        if envelope.epoch == new_key.epoch() && envelope.salt == new_key.salt() {
            match codec::decode::<_, Value>(provider, &envelope, new_key).await {
                Ok(_) => {
                    report.unchanged += 1;
                    continue;
                }
                Err(err) => {
                    report.record_failure(&record_key, &err);
                    continue;
                }
            }
        }

        let old_key = old_keys.for_envelope(provider, &envelope).await?;
        let rewritten = async {
            let value: Value = codec::decode(provider, &envelope, old_key).await?;
            let sealed = codec::encode(provider, &value, new_key).await?;
            store.put_envelope(&record_key, &sealed)
        }
        .await;

        match rewritten {
            Ok(()) => report.migrated += 1,
            Err(err) => report.record_failure(&record_key, &err),
        }
    }
    Ok(report)
}

/// Keys derived from the old password, one per (salt, iterations) pair seen.
struct OldKeys<'p> {
    password: &'p Password,
    keys: HashMap<(Vec<u8>, u32), DerivedKey>,
}

impl<'p> OldKeys<'p> {
    fn new(password: &'p Password) -> Self {
        Self {
            password,
            keys: HashMap::new(),
        }
    }

    fn insert(&mut self, key: DerivedKey) {
        self.keys
            .insert((key.salt().to_vec(), key.iterations()), key);
    }

    async fn for_envelope<C: CryptoProvider + ?Sized>(
        &mut self,
        provider: &C,
        envelope: &EncryptedEnvelope,
    ) -> Result<&DerivedKey, StoreError> {
        let id = (envelope.salt.clone(), envelope.kdf_iterations);
        if !self.keys.contains_key(&id) {
            let key = provider
                .derive_key(self.password, &envelope.salt, envelope.kdf_iterations)
                .await?
                .with_epoch(envelope.epoch);
            self.keys.insert(id.clone(), key);
        }
        self.keys
            .get(&id)
            .ok_or_else(|| StoreError::CryptoUnavailable {
                reason: "derived key cache lost an entry".to_string(),
            })
    }
}
