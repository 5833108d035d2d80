use std::{collections::BTreeSet, fmt::Write as _};

use color_eyre::{eyre::eyre, Result};
use lockbox_core::{RawBackend, StoreError};
use lockbox_storage::{CryptoProvider, Password, SessionState, Vault, VaultStatus};
use serde_json::Value;
use tracing::warn;

use crate::{cli::Command, config::Config, prompt, storage};

/// Execute a vault subcommand against the configured data directory.
pub async fn handle(cmd: Command, config: &Config) -> Result<()> {
    let mut vault = storage::vault_from_config(config)?;

    match cmd {
        Command::Status => print!("{}", render_status(&vault.status()?)),
        Command::Enable { scope, hint } => {
            let password = prompt::new_password(prompt::PASSWORD_ENV_VAR)?;
            let scope: BTreeSet<String> = scope.into_iter().collect();
            let report = vault.enable_encryption(&password, scope, hint).await?;
            println!(
                "Encryption enabled: {} migrated, {} unchanged",
                report.migrated, report.unchanged
            );
            if report.stale > 0 {
                warn!(
                    stale = report.stale,
                    "records encrypted under an earlier password stay unreadable"
                );
            }
            if !report.is_complete() {
                return Err(eyre!(
                    "{} record(s) could not be encrypted: {}",
                    report.failed,
                    report.failed_keys.join(", ")
                ));
            }
        }
        Command::Disable => {
            let stranded = vault.disable_encryption()?;
            println!("Encryption disabled.");
            if stranded > 0 {
                warn!(stranded, "encrypted records remain unreadable until encryption is re-enabled");
            }
        }
        Command::Unlock => {
            unlock(&mut vault, &prompt::current_password()?).await?;
            println!("Password accepted.");
        }
        Command::ChangePassword => {
            let old = prompt::current_password()?;
            let new = prompt::new_password(prompt::NEW_PASSWORD_ENV_VAR)?;
            let report = vault.change_password(&old, &new).await?;
            println!(
                "Password changed: {} re-encrypted, {} unchanged",
                report.migrated, report.unchanged
            );
            if !report.is_complete() {
                return Err(eyre!(
                    "{} record(s) still use the old password ({}); run change-password again with the same passwords to resume",
                    report.failed,
                    report.failed_keys.join(", ")
                ));
            }
        }
        Command::Get { key } => {
            let value = match vault.get::<Value>(&key).await {
                Err(err) if err.needs_password() => {
                    unlock(&mut vault, &prompt::current_password()?).await?;
                    vault.get::<Value>(&key).await?
                }
                other => other?,
            };
            match value {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => return Err(eyre!("no record named {key}")),
            }
        }
        Command::Set { key, value } => {
            if vault.settings().covers(&key) {
                unlock(&mut vault, &prompt::current_password()?).await?;
            }
            vault.set(&key, &parse_value(&value)).await?;
        }
        Command::Remove { key } => vault.remove(&key)?,
        Command::List => {
            let keys = vault.keys()?;
            if keys.is_empty() {
                println!("No records yet. Add one with `lockbox set <key> <value>`.");
            }
            for key in keys {
                println!("{key}");
            }
        }
        Command::Clear => println!("Removed {} record(s).", vault.clear()?),
        Command::SuggestPassword { length } => {
            println!("{}", vault.suggest_password(usize::from(length))?.expose())
        }
        Command::Version | Command::Config(_) => {
            return Err(eyre!("command is not a vault operation"))
        }
    }

    Ok(())
}

/// Unlock, folding the password hint into the error on a wrong password.
async fn unlock<B: RawBackend, C: CryptoProvider + ?Sized>(
    vault: &mut Vault<B, C>,
    password: &Password,
) -> Result<()> {
    match vault.unlock(password).await {
        Err(StoreError::InvalidPassword) => match vault.password_hint() {
            Some(hint) => Err(eyre!("invalid password (hint: {hint})")),
            None => Err(eyre!(StoreError::InvalidPassword)),
        },
        other => Ok(other?),
    }
}

/// JSON when it parses, otherwise the raw text as a string.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn render_status(status: &VaultStatus) -> String {
    let mut out = String::new();
    let state = match status.session.state {
        SessionState::Disabled => "disabled",
        SessionState::Locked => "locked",
        SessionState::Unlocked => "unlocked",
    };
    let _ = writeln!(out, "encryption: {state}");
    if status.settings.enabled {
        let scope: Vec<&str> = status
            .settings
            .encrypted_data_types
            .iter()
            .map(String::as_str)
            .collect();
        let _ = writeln!(out, "scope: {}", scope.join(", "));
        if let Some(hint) = &status.settings.password_hint {
            let _ = writeln!(out, "hint: {hint}");
        }
        if let Some(updated) = status.settings.last_password_update {
            let _ = writeln!(out, "password updated: {}", updated.to_rfc3339());
        }
    }
    let _ = writeln!(
        out,
        "records: {} plaintext, {} encrypted, {} unreadable",
        status.plaintext_records, status.encrypted_records, status.malformed_records
    );
    if status.records_by_epoch.len() > 1 {
        let epochs: Vec<String> = status
            .records_by_epoch
            .iter()
            .map(|(epoch, count)| format!("epoch {epoch}: {count}"))
            .collect();
        let _ = writeln!(out, "rotation incomplete ({})", epochs.join(", "));
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use lockbox_core::{MemoryBackend, VaultConfig};
    use lockbox_storage::AesGcmProvider;
    use serde_json::json;

    use super::*;

    fn memory_vault() -> Vault<MemoryBackend, AesGcmProvider> {
        let config = VaultConfig {
            kdf_iterations: 1000,
            ..VaultConfig::default()
        };
        Vault::open(MemoryBackend::new(), Arc::new(AesGcmProvider), &config).expect("open")
    }

    #[test]
    fn set_values_parse_as_json_or_string() {
        assert_eq!(parse_value("[1,2]"), json!([1, 2]));
        assert_eq!(parse_value("true"), json!(true));
        assert_eq!(parse_value("https://example.test"), json!("https://example.test"));
    }

    #[tokio::test]
    async fn wrong_password_reports_hint() {
        let mut vault = memory_vault();
        vault
            .enable_encryption(
                &Password::from("Str0ng!Pass"),
                BTreeSet::from(["profiles".to_string()]),
                Some("blue door".into()),
            )
            .await
            .expect("enable");
        vault.lock();

        let err = unlock(&mut vault, &Password::from("Wr0ng!Pass"))
            .await
            .expect_err("wrong password");
        assert!(err.to_string().contains("blue door"));
        unlock(&mut vault, &Password::from("Str0ng!Pass"))
            .await
            .expect("right password");
        assert!(vault.is_unlocked());
    }

    #[tokio::test]
    async fn status_lists_scope_and_counts() {
        let mut vault = memory_vault();
        vault.set("theme", "dark").await.expect("seed");
        vault
            .enable_encryption(
                &Password::from("Str0ng!Pass"),
                BTreeSet::from(["profiles".to_string(), "env".to_string()]),
                None,
            )
            .await
            .expect("enable");
        vault.set("profiles/work", &json!({"region": "eu"})).await.expect("set");
        vault.lock();

        let rendered = render_status(&vault.status().expect("status"));
        assert!(rendered.contains("encryption: locked"));
        assert!(rendered.contains("scope: env, profiles"));
        assert!(rendered.contains("records: 1 plaintext, 1 encrypted, 0 unreadable"));
        assert!(!rendered.contains("rotation incomplete"));
    }

    #[test]
    fn disabled_status_omits_scope() {
        let mut vault = memory_vault();
        let rendered = render_status(&vault.status().expect("status"));
        assert!(rendered.starts_with("encryption: disabled\n"));
        assert!(!rendered.contains("scope:"));
    }
}
