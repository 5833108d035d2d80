use std::fmt;

use thiserror::Error;

/// Failures reported by a raw persistence backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Storage cannot be reached (permissions, missing directory, poisoned lock).
    #[error("backend unavailable: {reason}")]
    Unavailable { reason: String },
    /// The backend refused the write because it is full.
    #[error("backend quota exceeded while writing {key}")]
    QuotaExceeded { key: String },
}

/// A single reason a candidate password was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordIssue {
    Empty,
    TooShort { min: usize },
    TooFewCharacterClasses { found: usize, required: usize },
}

impl fmt::Display for PasswordIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PasswordIssue::Empty => write!(f, "password is empty"),
            PasswordIssue::TooShort { min } => {
                write!(f, "password must be at least {min} characters")
            }
            PasswordIssue::TooFewCharacterClasses { found, required } => write!(
                f,
                "password uses {found} character classes, at least {required} required \
                 (lowercase, uppercase, digits, symbols)"
            ),
        }
    }
}

/// Errors produced by the encrypted store, its session, and the rotation manager.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// No usable cipher, key-derivation or secure random source.
    #[error("cryptography unavailable: {reason}")]
    CryptoUnavailable { reason: String },
    /// The cipher provider failed while encrypting valid input.
    #[error("encryption failed: {reason}")]
    EncryptionFailed { reason: String },
    /// The password did not verify against the stored canary.
    #[error("invalid password")]
    InvalidPassword,
    /// An authentication tag did not verify (wrong key or corrupted record).
    #[error("authentication failed: wrong key or corrupted data")]
    AuthenticationFailed,
    /// Stored data is not a structurally valid envelope.
    #[error("malformed envelope: {reason}")]
    MalformedEnvelope { reason: String },
    /// A write was refused because it exceeds the record ceiling or the backend is full.
    #[error("quota exceeded for {key}: {size} bytes{}", describe_limit(.limit))]
    QuotaExceeded {
        key: String,
        size: usize,
        /// Per-record ceiling, when that was the reason; `None` means the backend is full.
        limit: Option<usize>,
    },
    /// The session expired; unlock again to continue.
    #[error("encryption session timed out")]
    SessionTimedOut,
    /// Encryption is enabled but no key is held.
    #[error("encrypted store is locked")]
    Locked,
    /// Raw storage is inaccessible.
    #[error("backend unavailable: {reason}")]
    BackendUnavailable { reason: String },
    /// The candidate password failed the strength policy.
    #[error("weak password: {}", join_issues(.issues))]
    WeakPassword { issues: Vec<PasswordIssue> },
    /// The operation needs encryption to be enabled first.
    #[error("encryption is not enabled")]
    NotEnabled,
    /// Logical keys may not shadow the `encryption-*` metadata entries.
    #[error("key {key} is reserved for encryption metadata")]
    ReservedKey { key: String },
    /// A value could not be converted to or from JSON.
    #[error("serialization failed: {reason}")]
    Serialization { reason: String },
}

impl StoreError {
    /// True when prompting the user for the password again can resolve the error.
    pub fn needs_password(&self) -> bool {
        matches!(
            self,
            StoreError::InvalidPassword
                | StoreError::AuthenticationFailed
                | StoreError::SessionTimedOut
                | StoreError::Locked
        )
    }
}

impl From<BackendError> for StoreError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unavailable { reason } => StoreError::BackendUnavailable { reason },
            BackendError::QuotaExceeded { key } => StoreError::QuotaExceeded {
                key,
                size: 0,
                limit: None,
            },
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization {
            reason: err.to_string(),
        }
    }
}

fn describe_limit(limit: &Option<usize>) -> String {
    match limit {
        Some(limit) => format!(" (limit {limit})"),
        None => " (backend full)".to_string(),
    }
}

fn join_issues(issues: &[PasswordIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
