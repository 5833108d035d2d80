//! Password acquisition from the environment or an interactive TTY prompt.

use std::io::IsTerminal;

use color_eyre::{eyre::eyre, Result};
use lockbox_storage::Password;

/// Current vault password, for scripts and CI.
pub const PASSWORD_ENV_VAR: &str = "LOCKBOX_PASSWORD";
/// Replacement password for `change-password`.
pub const NEW_PASSWORD_ENV_VAR: &str = "LOCKBOX_NEW_PASSWORD";

/// Read the current password: `LOCKBOX_PASSWORD` first, then the terminal.
pub fn current_password() -> Result<Password> {
    acquire(PASSWORD_ENV_VAR, "Vault password: ", false)
}

/// Read a password that is about to be set, confirming it on a terminal.
pub fn new_password(env_var: &str) -> Result<Password> {
    acquire(env_var, "New vault password: ", true)
}

fn acquire(env_var: &str, label: &str, confirm: bool) -> Result<Password> {
    if let Some(password) = from_env(std::env::var(env_var).ok()) {
        return Ok(password);
    }
    if !std::io::stdin().is_terminal() {
        return Err(eyre!(
            "no password provided; set {env_var} or run interactively"
        ));
    }

    let first = read(label)?;
    if confirm && first.expose() != read("Confirm password: ")?.expose() {
        return Err(eyre!("passwords do not match"));
    }
    Ok(first)
}

fn read(label: &str) -> Result<Password> {
    eprint!("{label}");
    let secret =
        rpassword::read_password().map_err(|e| eyre!("failed to read password: {e}"))?;
    if secret.is_empty() {
        return Err(eyre!("empty password not allowed"));
    }
    Ok(Password::from(secret))
}

fn from_env(value: Option<String>) -> Option<Password> {
    value.filter(|v| !v.is_empty()).map(Password::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_value_is_used_when_present() {
        let password = from_env(Some("Str0ng!Pass".into())).expect("password");
        assert_eq!(password.expose(), "Str0ng!Pass");
    }

    #[test]
    fn empty_env_value_is_ignored() {
        assert!(from_env(Some(String::new())).is_none());
        assert!(from_env(None).is_none());
    }
}
