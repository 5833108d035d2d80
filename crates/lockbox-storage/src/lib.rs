//! Encrypted record storage over a raw key/value backend.
//!
//! Records whose data type is in the encryption scope are sealed with
//! AES-256-GCM under a PBKDF2-derived key; everything else is stored as
//! plain JSON. [`Vault`] wires the store, the unlock session and the
//! migration manager together.

pub mod codec;
pub mod crypto;
pub mod file_backend;
pub mod migration;
pub mod password;
pub mod session;
pub mod store;
pub mod vault;

pub use codec::EncryptedEnvelope;
pub use crypto::{AesGcmProvider, CryptoProvider, DerivedKey, Password};
pub use file_backend::FileBackend;
pub use migration::{MigrationManager, MigrationReport};
pub use password::{password_issues, suggest_password, validate_password, MAX_SUGGESTION_LEN};
pub use session::{Clock, EncryptionSession, ManualClock, SessionState, SessionStatus, SystemClock};
pub use store::{EncryptedStore, RecordForm};
pub use vault::{Vault, VaultStatus};
