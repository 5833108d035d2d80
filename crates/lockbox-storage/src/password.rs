use lockbox_core::{PasswordIssue, PasswordPolicy, StoreError};

use crate::crypto::{CryptoProvider, Password};

const LOWER: &str = "abcdefghijkmnopqrstuvwxyz";
const UPPER: &str = "ABCDEFGHJKLMNPQRSTUVWXYZ";
const DIGITS: &str = "23456789";
const SYMBOLS: &str = "!@#$%^&*-_=+?";

/// Every way `password` falls short of `policy`; empty when acceptable.
pub fn password_issues(policy: &PasswordPolicy, password: &Password) -> Vec<PasswordIssue> {
    let secret = password.expose();
    if secret.is_empty() {
        return vec![PasswordIssue::Empty];
    }

    let mut issues = Vec::new();
    if secret.chars().count() < policy.min_length {
        issues.push(PasswordIssue::TooShort {
            min: policy.min_length,
        });
    }
    let found = character_classes(secret);
    if found < policy.min_character_classes {
        issues.push(PasswordIssue::TooFewCharacterClasses {
            found,
            required: policy.min_character_classes,
        });
    }
    issues
}

pub fn validate_password(policy: &PasswordPolicy, password: &Password) -> Result<(), StoreError> {
    let issues = password_issues(policy, password);
    if issues.is_empty() {
        Ok(())
    } else {
        Err(StoreError::WeakPassword { issues })
    }
}

fn character_classes(secret: &str) -> usize {
    let checks: [fn(char) -> bool; 4] = [
        |c| c.is_lowercase(),
        |c| c.is_uppercase(),
        |c| c.is_numeric(),
        |c| !c.is_alphanumeric() && !c.is_whitespace(),
    ];
    checks
        .iter()
        .filter(|check| secret.chars().any(|c| check(c)))
        .count()
}

/// Longest password `suggest_password` will produce.
pub const MAX_SUGGESTION_LEN: usize = 256;
const RANDOM_CHUNK: usize = 64;

/// Generate a random password of `len` characters (at most
/// [`MAX_SUGGESTION_LEN`]) drawing on every character class. Uses the
/// provider's secure random source only.
pub fn suggest_password<C: CryptoProvider + ?Sized>(
    provider: &C,
    len: usize,
) -> Result<Password, StoreError> {
    let len = len.min(MAX_SUGGESTION_LEN);
    let alphabet: Vec<char> = [LOWER, UPPER, DIGITS, SYMBOLS].concat().chars().collect();
    let wanted_classes = len.min(4);
    // Largest multiple of the alphabet size below 256, to avoid modulo bias.
    let zone = 256 - (256 % alphabet.len());

    loop {
        let mut out = String::with_capacity(len);
        let mut filled = 0;
        while filled < len {
            for byte in provider.random_bytes(RANDOM_CHUNK)? {
                if filled == len {
                    break;
                }
                if (byte as usize) < zone {
                    out.push(alphabet[byte as usize % alphabet.len()]);
                    filled += 1;
                }
            }
        }
        if character_classes(&out) >= wanted_classes {
            return Ok(Password::new(out));
        }
    }
}
