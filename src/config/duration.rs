//! # Duration Parsing
//!
//! Handles parsing and validating GitOps-style duration strings.

use anyhow::Result;
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    // <number><unit> where unit is s, m, h, or d
    Regex::new(r"^(?P<number>\d+)(?P<unit>[smhd])$").expect("duration regex is valid")
});

/// Parse a GitOps-style duration string into `std::time::Duration`.
/// Supports formats: "30s", "1m", "5m", "1h", "2h", "1d"
pub fn parse_duration(duration_str: &str) -> Result<Duration> {
    let duration_trimmed = duration_str.trim();

    if duration_trimmed.is_empty() {
        return Err(anyhow::anyhow!("Duration string cannot be empty"));
    }

    let interval_lower = duration_trimmed.to_lowercase();
    let captures = DURATION_RE.captures(&interval_lower).ok_or_else(|| {
        anyhow::anyhow!(
            "Invalid duration format '{}'. Expected format: <number><unit> (e.g., '30s', '5m', '1h')",
            duration_trimmed
        )
    })?;

    let number: u64 = captures["number"].parse().map_err(|e| {
        anyhow::anyhow!("Invalid duration number in '{}': {}", duration_trimmed, e)
    })?;

    if number == 0 {
        return Err(anyhow::anyhow!(
            "Duration must be greater than 0, got '{}'",
            duration_trimmed
        ));
    }

    let seconds = match &captures["unit"] {
        "s" => number,
        "m" => number * 60,
        "h" => number * 3600,
        "d" => number * 86400,
        unit => {
            return Err(anyhow::anyhow!(
                "Invalid unit '{}' in duration '{}'. Expected: s, m, h, or d",
                unit,
                duration_trimmed
            ));
        }
    };

    Ok(Duration::from_secs(seconds))
}

/// Validate a duration field against a minimum value.
/// `field_name` is only used for error messages.
pub fn validate_duration(interval: &str, field_name: &str, min_seconds: u64) -> Result<()> {
    let duration = parse_duration(interval)
        .map_err(|e| anyhow::anyhow!("{field_name}: {e}"))?;

    if duration.as_secs() < min_seconds {
        return Err(anyhow::anyhow!(
            "{} must be at least {}s, got '{}'",
            field_name,
            min_seconds,
            interval
        ));
    }

    Ok(())
}
