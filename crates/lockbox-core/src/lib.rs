//! Core contracts for lockbox: raw persistence backends, the error taxonomy,
//! persisted encryption settings, and store configuration.
//! This crate carries no cryptography so it stays cheap to depend on.

pub mod backend;
pub mod config;
pub mod error;
pub mod settings;

pub use backend::{MemoryBackend, RawBackend};
pub use config::{PasswordPolicy, VaultConfig};
pub use error::{BackendError, PasswordIssue, StoreError};
pub use settings::{data_type, EncryptionSettings};
