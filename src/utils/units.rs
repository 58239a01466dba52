// src/utils/units.rs
//! Duration and size strings as they appear in configuration files
//!
//! Durations use humantime syntax (`30s`, `5m`, `1h 30m`). Sizes are an
//! integer, an optional unit prefix, and a trailing `B` (`512MB`, `2gb`, `64B`).

use crate::utils::errors::{EngineError, Result};
use std::time::Duration;

/// Parse a duration string such as `30s` or `1h 30m`
pub fn parse_duration(s: &str) -> Result<Duration> {
    humantime::parse_duration(s.trim())
        .map_err(|e| EngineError::InvalidArgument(format!("invalid duration '{}': {}", s, e)))
}

/// Parse a size string such as `512MB` into bytes
pub fn parse_size(s: &str) -> Result<u64> {
    let invalid = || EngineError::InvalidArgument(format!("invalid size '{}'", s));

    let trimmed = s.trim();
    let body = trimmed
        .strip_suffix('B')
        .or_else(|| trimmed.strip_suffix('b'))
        .ok_or_else(invalid)?;

    let (digits, multiplier) = match body.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => {
            let shift = match c.to_ascii_uppercase() {
                'K' => 10,
                'M' => 20,
                'G' => 30,
                'T' => 40,
                'P' => 50,
                'E' => 60,
                _ => return Err(invalid()),
            };
            (&body[..body.len() - 1], 1u64 << shift)
        }
        _ => (body, 1u64),
    };

    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }

    let value: u64 = digits.parse().map_err(|_| invalid())?;
    value.checked_mul(multiplier).ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("1h 30m").unwrap(), Duration::from_secs(5400));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("512MB").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_size("2gb").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("64B").unwrap(), 64);
        assert_eq!(parse_size("1kB").unwrap(), 1024);
    }

    #[test]
    fn test_parse_size_rejects_garbage() {
        assert!(parse_size("512").is_err());
        assert!(parse_size("MB").is_err());
        assert!(parse_size("12XB").is_err());
        assert!(parse_size("-1MB").is_err());
        assert!(parse_size("99999999999EB").is_err());
    }
}
