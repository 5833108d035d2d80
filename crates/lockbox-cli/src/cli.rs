use clap::{Parser, Subcommand};

/// CLI surface definition.
#[derive(Parser, Debug)]
#[command(
    name = "lockbox",
    about = "Password-protected local key/value store",
    version,
    propagate_version = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Show lock state, encryption scope and record counts.
    Status,
    /// Turn on encryption for the given data types and migrate existing records.
    Enable {
        /// Data types to encrypt (the part of a key before the first `/`).
        #[arg(long, value_delimiter = ',', required = true)]
        scope: Vec<String>,
        /// Hint shown before unlock. Stored in plaintext.
        #[arg(long)]
        hint: Option<String>,
    },
    /// Turn off encryption. Already encrypted records stay encrypted.
    Disable,
    /// Check a password against the vault without changing anything.
    Unlock,
    /// Re-encrypt every record under a new password.
    ChangePassword,
    /// Print a stored value as JSON.
    Get { key: String },
    /// Store a value. Valid JSON is stored as-is, anything else as a string.
    Set { key: String, value: String },
    /// Delete a record.
    Remove { key: String },
    /// List logical keys.
    List,
    /// Delete every record, keeping encryption settings.
    Clear,
    /// Print a random password drawn from the secure random source.
    SuggestPassword {
        #[arg(long, default_value_t = 20, value_parser = clap::value_parser!(u16).range(4..=256))]
        length: u16,
    },
    /// Print version and exit.
    Version,
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}
