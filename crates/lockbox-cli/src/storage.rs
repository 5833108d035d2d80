use std::{path::PathBuf, sync::Arc};

use color_eyre::Result;
use dirs::data_dir;
use lockbox_storage::{AesGcmProvider, FileBackend, Vault};
use tracing::debug;

use crate::config::Config;

pub type FileVault = Vault<FileBackend, AesGcmProvider>;

/// Resolve the default data directory for lockbox.
pub fn default_data_dir() -> Result<PathBuf> {
    let base = data_dir().ok_or_else(|| color_eyre::eyre::eyre!("no data dir available"))?;
    Ok(base.join("lockbox"))
}

/// Open the vault at the configured data directory, or the platform default.
pub fn vault_from_config(config: &Config) -> Result<FileVault> {
    let root = match &config.data_dir {
        Some(root) => root.clone(),
        None => default_data_dir()?,
    };
    debug!(?root, "opening vault");
    Ok(Vault::open(
        FileBackend::new(root),
        Arc::new(AesGcmProvider),
        &config.vault,
    )?)
}
