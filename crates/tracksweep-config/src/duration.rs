//! Duration strings such as `5m`, `1d12h` or `90s`.
//!
//! Accepts the `#d#h#m#s` form used by `mlflow gc --older-than` (every unit
//! optional, in that order) and bare integers, which are seconds.

use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

use crate::{ConfigError, ConfigResult};

static DURATION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(\d+)d)?(?:(\d+)h)?(?:(\d+)m)?(?:(\d+)s)?$").unwrap()
});

const UNIT_SECONDS: [u64; 4] = [86_400, 3_600, 60, 1];

/// Parse a duration string; `field` names the setting in error messages.
pub fn parse_duration(field: &str, value: &str) -> ConfigResult<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ConfigError::invalid(field, "empty duration"));
    }

    if value.bytes().all(|b| b.is_ascii_digit()) {
        let secs = value
            .parse::<u64>()
            .map_err(|e| ConfigError::invalid(field, e.to_string()))?;
        return Ok(Duration::from_secs(secs));
    }

    let caps = DURATION_REGEX.captures(value).ok_or_else(|| {
        ConfigError::invalid(field, format!("'{}' is not of the form #d#h#m#s", value))
    })?;

    let mut total: u64 = 0;
    for (idx, unit) in UNIT_SECONDS.iter().enumerate() {
        if let Some(m) = caps.get(idx + 1) {
            let amount = m
                .as_str()
                .parse::<u64>()
                .map_err(|e| ConfigError::invalid(field, e.to_string()))?;
            total = amount
                .checked_mul(*unit)
                .and_then(|secs| total.checked_add(secs))
                .ok_or_else(|| ConfigError::invalid(field, "duration overflows"))?;
        }
    }

    Ok(Duration::from_secs(total))
}
