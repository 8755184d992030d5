//! Small shared helpers.

use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Parse a human-readable duration string such as `"30s"`, `"10m"` or
/// `"250ms"`.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        bail!("duration is empty");
    }

    let parsed = humantime::parse_duration(trimmed)
        .with_context(|| format!("invalid duration '{trimmed}'"))?;
    if parsed.is_zero() {
        bail!("duration must be greater than zero");
    }

    Ok(parsed)
}

/// Format a duration back into the wire form (`"30s"`, `"10m"`).
pub fn format_duration(duration: Duration) -> String {
    humantime::format_duration(duration).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unit_suffixes() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("   ").is_err());
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("0s").is_err());
    }

    #[test]
    fn formats_round_trip() {
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(600)), "10m");
    }
}
