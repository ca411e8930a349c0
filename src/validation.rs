//! Identifier validation for users and wallets

use crate::{LedgerError, LedgerResult};

const MAX_LEN: usize = 64;

/// Alphanumeric runs joined by single `.` or `-`, at most 64 characters
pub fn validate_username(username: &str) -> LedgerResult<()> {
    let well_formed = username.len() <= MAX_LEN
        && username
            .split(['.', '-'])
            .all(|run| !run.is_empty() && run.chars().all(|c| c.is_ascii_alphanumeric()));

    if well_formed {
        Ok(())
    } else {
        Err(LedgerError::Validation(format!(
            "invalid username '{}': use letters and digits separated by single '.' or '-' (max {} characters)",
            username, MAX_LEN
        )))
    }
}

/// 1 to 64 characters of letters, digits, `_`, `-`, `@` or `.`
pub fn validate_wallet_id(id: &str) -> LedgerResult<()> {
    let well_formed = !id.is_empty()
        && id.len() <= MAX_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '@' | '.'));

    if well_formed {
        Ok(())
    } else {
        Err(LedgerError::Validation(format!("invalid wallet id '{}'", id)))
    }
}

/// Words separated by single spaces, at most 64 characters
pub fn validate_wallet_name(name: &str) -> LedgerResult<()> {
    let well_formed = name.chars().count() <= MAX_LEN
        && (name.is_empty() || name.split(' ').all(|word| !word.is_empty() && !word.chars().any(char::is_whitespace)));

    if well_formed {
        Ok(())
    } else {
        Err(LedgerError::Validation(format!("invalid wallet name '{}'", name)))
    }
}
