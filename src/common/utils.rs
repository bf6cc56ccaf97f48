//! Utility functions for shardmeta

use std::time::{SystemTime, UNIX_EPOCH};

/// Longest accepted cluster/schema/table/node name.
pub const MAX_NAME_LEN: usize = 255;

/// Get current Unix timestamp (seconds)
pub fn timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Validate an entity name (must be non-empty, reasonable length, printable)
pub fn validate_name(what: &str, name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(crate::Error::Validation(format!(
            "{} name cannot be empty",
            what
        )));
    }

    if name.len() > MAX_NAME_LEN {
        return Err(crate::Error::Validation(format!(
            "{} name too long (max {} bytes)",
            what, MAX_NAME_LEN
        )));
    }

    if name.chars().any(|c| c.is_control()) {
        return Err(crate::Error::Validation(format!(
            "{} name contains invalid characters",
            what
        )));
    }

    Ok(())
}
