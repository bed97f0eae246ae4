//! Duration strings ("30s", "5m", "24h") and the wall clock.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DurationError {
    #[error("empty duration")]
    Empty,
    #[error("invalid duration '{0}', expected <n>ms, <n>s, <n>m or <n>h")]
    Invalid(String),
    #[error("duration '{0}' is out of range")]
    Overflow(String),
}

/// Parse a duration string like "500ms", "30s", "5m" or "24h".
///
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Result<Duration, DurationError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(DurationError::Empty);
    }

    let invalid = || DurationError::Invalid(s.to_string());
    let number = |digits: &str| digits.trim().parse::<u64>().map_err(|_| invalid());
    let scaled = |digits: &str, factor: u64| {
        number(digits)?
            .checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(|| DurationError::Overflow(s.to_string()))
    };

    if let Some(ms) = s.strip_suffix("ms") {
        Ok(Duration::from_millis(number(ms)?))
    } else if let Some(secs) = s.strip_suffix('s') {
        Ok(Duration::from_secs(number(secs)?))
    } else if let Some(mins) = s.strip_suffix('m') {
        scaled(mins, 60)
    } else if let Some(hours) = s.strip_suffix('h') {
        scaled(hours, 3600)
    } else {
        Ok(Duration::from_secs(number(s)?))
    }
}

/// Seconds since the unix epoch.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
