use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;

static E164: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\+[0-9]{1,15}$").expect("valid regex"));

/// Normalizes a dialed number to E.164 (`+` and 1 to 15 digits).
///
/// Spaces, dashes, dots and parentheses are dropped first; anything else
/// that does not fit is rejected.
pub fn validate_e164(number: &str) -> Result<String> {
    let compact: String = number
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')'))
        .collect();
    if E164.is_match(&compact) {
        Ok(compact)
    } else {
        Err(Error::Validation(format!(
            "{} is not an E.164 number (expected + followed by up to 15 digits)",
            number.trim()
        )))
    }
}
