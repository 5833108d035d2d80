//! Session-scoped key custody: who holds the derived key, since when, and for how long.
//!
//! Expiry is evaluated lazily on access; there is no background timer.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use lockbox_core::{EncryptionSettings, StoreError};
use tracing::{debug, info, warn};

use crate::{
    codec::{self, EncryptedEnvelope},
    crypto::{CryptoProvider, DerivedKey, Password},
};

/// Plaintext sealed into the verifier envelope; unlocking must reproduce it.
pub const CANARY: &str = "lockbox-canary-v1";

/// Source of the current time for session expiry.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-driven clock for tests and simulations.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Externally visible session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Encryption feature is off.
    Disabled,
    /// Feature on, no key material held.
    Locked,
    /// Feature on, key held, session clock running.
    Unlocked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub session_start: Option<DateTime<Utc>>,
    pub timeout_ms: Option<u64>,
    pub remaining_ms: Option<u64>,
    /// True when the last transition to `Locked` was caused by expiry.
    pub timed_out: bool,
}

enum Custody {
    Disabled,
    Locked { timed_out: bool },
    Unlocked {
        key: DerivedKey,
        started: DateTime<Utc>,
    },
}

/// Owns the derived key for the lifetime of an unlocked session. The store
/// borrows it per call; nothing else may keep a copy.
pub struct EncryptionSession {
    settings: EncryptionSettings,
    custody: Custody,
    timeout_ms: Option<u64>,
    clock: Arc<dyn Clock>,
}

impl EncryptionSession {
    /// Starts `Disabled` or `Locked` depending on the persisted settings.
    pub fn new(settings: EncryptionSettings, timeout_ms: Option<u64>, clock: Arc<dyn Clock>) -> Self {
        let custody = if settings.enabled {
            Custody::Locked { timed_out: false }
        } else {
            Custody::Disabled
        };
        Self {
            settings,
            custody,
            timeout_ms,
            clock,
        }
    }

    pub fn settings(&self) -> &EncryptionSettings {
        &self.settings
    }

    pub(crate) fn replace_settings(&mut self, settings: EncryptionSettings) {
        self.settings = settings;
    }

    pub fn state(&mut self) -> SessionState {
        self.expire_if_due();
        match self.custody {
            Custody::Disabled => SessionState::Disabled,
            Custody::Locked { .. } => SessionState::Locked,
            Custody::Unlocked { .. } => SessionState::Unlocked,
        }
    }

    pub fn is_unlocked(&mut self) -> bool {
        self.state() == SessionState::Unlocked
    }

    pub fn status(&mut self) -> SessionStatus {
        let state = self.state();
        let now = self.clock.now();
        let (session_start, remaining_ms) = match &self.custody {
            Custody::Unlocked { started, .. } => {
                let remaining = self.timeout_ms.map(|ms| {
                    let elapsed = (now - *started).num_milliseconds().max(0) as u64;
                    ms.saturating_sub(elapsed)
                });
                (Some(*started), remaining)
            }
            _ => (None, None),
        };
        SessionStatus {
            state,
            session_start,
            timeout_ms: self.timeout_ms,
            remaining_ms,
            timed_out: matches!(self.custody, Custody::Locked { timed_out: true }),
        }
    }

    /// Verify `password` against the stored canary and start a session.
    /// On failure any held key is discarded and the session is `Locked`.
    pub async fn unlock<C: CryptoProvider + ?Sized>(
        &mut self,
        provider: &C,
        verifier: &EncryptedEnvelope,
        password: &Password,
    ) -> Result<(), StoreError> {
        if matches!(self.custody, Custody::Disabled) {
            return Err(StoreError::NotEnabled);
        }

        match verify_password(provider, verifier, password).await {
            Ok(key) => {
                self.begin(key);
                info!("encryption session unlocked");
                Ok(())
            }
            Err(err) => {
                self.custody = Custody::Locked { timed_out: false };
                warn!(error = %err, "unlock rejected");
                Err(err)
            }
        }
    }

    /// Install a freshly verified key and restart the session clock.
    pub(crate) fn begin(&mut self, key: DerivedKey) {
        self.custody = Custody::Unlocked {
            key,
            started: self.clock.now(),
        };
    }

    /// Drop the key. A disabled session stays disabled.
    pub fn lock(&mut self) {
        if !matches!(self.custody, Custody::Disabled) {
            self.custody = Custody::Locked { timed_out: false };
            debug!("encryption session locked");
        }
    }

    pub(crate) fn disable(&mut self) {
        self.custody = Custody::Disabled;
    }

    /// Borrow the session key, applying the lazy timeout first.
    pub fn active_key(&mut self) -> Result<&DerivedKey, StoreError> {
        self.expire_if_due();
        match &self.custody {
            Custody::Disabled => Err(StoreError::NotEnabled),
            Custody::Locked { timed_out: true } => Err(StoreError::SessionTimedOut),
            Custody::Locked { timed_out: false } => Err(StoreError::Locked),
            Custody::Unlocked { key, .. } => Ok(key),
        }
    }

    fn expire_if_due(&mut self) {
        let (Some(timeout_ms), Custody::Unlocked { started, .. }) = (self.timeout_ms, &self.custody)
        else {
            return;
        };
        let timeout = Duration::milliseconds(i64::try_from(timeout_ms).unwrap_or(i64::MAX));
        if self.clock.now() - *started > timeout {
            info!(timeout_ms, "encryption session expired");
            self.custody = Custody::Locked { timed_out: true };
        }
    }
}

/// Derive a key from `password` with the verifier's own parameters and check
/// that it opens the canary.
pub async fn verify_password<C: CryptoProvider + ?Sized>(
    provider: &C,
    verifier: &EncryptedEnvelope,
    password: &Password,
) -> Result<DerivedKey, StoreError> {
    let key = provider
        .derive_key(password, &verifier.salt, verifier.kdf_iterations)
        .await?
        .with_epoch(verifier.epoch);

    match codec::decode::<_, String>(provider, verifier, &key).await {
        Ok(canary) if canary == CANARY => Ok(key),
        Ok(_) | Err(StoreError::AuthenticationFailed) => Err(StoreError::InvalidPassword),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{AesGcmProvider, SALT_LEN};

    async fn verifier_for(password: &str) -> EncryptedEnvelope {
        let key = AesGcmProvider
            .derive_key(&Password::from(password), &[1u8; SALT_LEN], 1_000)
            .await
            .expect("derive");
        codec::encode(&AesGcmProvider, CANARY, &key)
            .await
            .expect("encode")
    }

    fn enabled_session(timeout_ms: Option<u64>, clock: &ManualClock) -> EncryptionSession {
        let settings = EncryptionSettings {
            enabled: true,
            ..Default::default()
        };
        EncryptionSession::new(settings, timeout_ms, Arc::new(clock.clone()))
    }

    #[test]
    fn initial_state_follows_settings() {
        let clock = ManualClock::new(Utc::now());
        let mut disabled =
            EncryptionSession::new(EncryptionSettings::default(), None, Arc::new(clock.clone()));
        assert_eq!(disabled.state(), SessionState::Disabled);
        assert_eq!(disabled.active_key().err(), Some(StoreError::NotEnabled));

        let mut locked = enabled_session(None, &clock);
        assert_eq!(locked.state(), SessionState::Locked);
        assert_eq!(locked.active_key().err(), Some(StoreError::Locked));
    }

    #[tokio::test]
    async fn unlock_with_right_password_starts_session() {
        let clock = ManualClock::new(Utc::now());
        let mut session = enabled_session(Some(60_000), &clock);
        let verifier = verifier_for("A").await;

        session
            .unlock(&AesGcmProvider, &verifier, &Password::from("A"))
            .await
            .expect("unlock");
        assert!(session.is_unlocked());

        clock.advance(Duration::milliseconds(15_000));
        let status = session.status();
        assert_eq!(status.remaining_ms, Some(45_000));
        assert!(status.session_start.is_some());
    }

    #[tokio::test]
    async fn wrong_password_leaves_session_locked() {
        let clock = ManualClock::new(Utc::now());
        let mut session = enabled_session(None, &clock);
        let verifier = verifier_for("A").await;

        let err = session
            .unlock(&AesGcmProvider, &verifier, &Password::from("B"))
            .await
            .expect_err("wrong password");
        assert_eq!(err, StoreError::InvalidPassword);
        assert_eq!(session.state(), SessionState::Locked);
    }

    #[tokio::test]
    async fn timeout_is_applied_lazily_and_sticks() {
        let clock = ManualClock::new(Utc::now());
        let mut session = enabled_session(Some(1_000), &clock);
        let verifier = verifier_for("A").await;
        session
            .unlock(&AesGcmProvider, &verifier, &Password::from("A"))
            .await
            .expect("unlock");

        clock.advance(Duration::milliseconds(1_000));
        assert!(session.active_key().is_ok(), "boundary is inclusive");

        clock.advance(Duration::milliseconds(1));
        assert_eq!(session.active_key().err(), Some(StoreError::SessionTimedOut));
        assert_eq!(session.active_key().err(), Some(StoreError::SessionTimedOut));
        assert!(!session.is_unlocked());
        assert!(session.status().timed_out);

        session
            .unlock(&AesGcmProvider, &verifier, &Password::from("A"))
            .await
            .expect("unlock again");
        assert!(session.is_unlocked());
    }

    #[tokio::test]
    async fn explicit_lock_drops_key() {
        let clock = ManualClock::new(Utc::now());
        let mut session = enabled_session(None, &clock);
        let verifier = verifier_for("A").await;
        session
            .unlock(&AesGcmProvider, &verifier, &Password::from("A"))
            .await
            .expect("unlock");

        clock.advance(Duration::days(365));
        assert!(session.is_unlocked(), "no timeout configured");

        session.lock();
        assert_eq!(session.active_key().err(), Some(StoreError::Locked));
    }

    #[tokio::test]
    async fn unlock_is_refused_while_disabled() {
        let clock = ManualClock::new(Utc::now());
        let mut session =
            EncryptionSession::new(EncryptionSettings::default(), None, Arc::new(clock));
        let verifier = verifier_for("A").await;
        let err = session
            .unlock(&AesGcmProvider, &verifier, &Password::from("A"))
            .await
            .expect_err("disabled");
        assert_eq!(err, StoreError::NotEnabled);
        session.lock();
        assert_eq!(session.state(), SessionState::Disabled);
    }
}
