//! SQL identifier checks for table and column names taken from envelopes.

use super::errors::{MirrorError, MirrorResult};

/// Postgres truncates identifiers beyond this length
const MAX_IDENTIFIER_LEN: usize = 63;

/// Accept `[A-Za-z_][A-Za-z0-9_]*` up to 63 bytes.
pub fn validate_identifier(name: &str) -> MirrorResult<()> {
    if name.is_empty() {
        return Err(MirrorError::invalid_identifier(name, "cannot be empty"));
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(MirrorError::invalid_identifier(
            name,
            format!("longer than {} characters", MAX_IDENTIFIER_LEN),
        ));
    }

    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => {
            return Err(MirrorError::invalid_identifier(
                name,
                "must start with a letter or underscore",
            ))
        }
    }

    if let Some(c) = chars.find(|c| !c.is_ascii_alphanumeric() && *c != '_') {
        return Err(MirrorError::invalid_identifier(
            name,
            format!("contains invalid character '{}'", c),
        ));
    }

    Ok(())
}

/// Validate then double-quote an identifier.
pub fn quote_identifier(name: &str) -> MirrorResult<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name))
}
