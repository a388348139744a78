use std::{future::Future, time::Duration};

use anyhow::{Context, Result, anyhow};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::time::timeout;

static DURATION_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:(\d+)d)?(?:(\d+)h)?(?:(\d+)m)?(?:(\d+)s)?$").expect("static regex")
});

static BYTE_SIZE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(\d+)\s*([kmgtp]?i?b?)?\s*$").expect("static regex"));

/// Parses durations written as `30d`, `12h30m`, `45s` or combinations
/// thereof. A bare integer is taken as seconds; `0` disables.
pub fn parse_flexible_duration(raw: &str) -> Result<Duration> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Duration::ZERO);
    }
    if trimmed.bytes().all(|b| b.is_ascii_digit()) {
        let seconds: u64 = trimmed
            .parse()
            .with_context(|| format!("invalid duration '{trimmed}'"))?;
        return Ok(Duration::from_secs(seconds));
    }
    let captures = DURATION_PATTERN
        .captures(trimmed)
        .ok_or_else(|| anyhow!("invalid duration '{trimmed}'"))?;

    let mut total = 0u64;
    for (index, unit_seconds) in [(1usize, 86_400u64), (2, 3_600), (3, 60), (4, 1)] {
        if let Some(value) = captures.get(index) {
            let amount: u64 = value
                .as_str()
                .parse()
                .with_context(|| format!("parse duration component '{}'", value.as_str()))?;
            let seconds = amount
                .checked_mul(unit_seconds)
                .ok_or_else(|| anyhow!("duration '{trimmed}' overflows"))?;
            total = total
                .checked_add(seconds)
                .ok_or_else(|| anyhow!("duration '{trimmed}' overflows"))?;
        }
    }
    Ok(Duration::from_secs(total))
}

/// Parses capacities written as `512kb`, `2mb`, `1gib` or bare byte counts.
pub fn parse_byte_size(raw: &str) -> Result<u64> {
    let clean = raw.trim();
    if clean.is_empty() {
        return Ok(0);
    }
    let captures = BYTE_SIZE_PATTERN
        .captures(clean)
        .ok_or_else(|| anyhow!("invalid size '{raw}'"))?;
    let value: u64 = captures
        .get(1)
        .expect("size pattern always captures digits")
        .as_str()
        .parse()
        .with_context(|| format!("parse size '{raw}'"))?;
    let unit = captures
        .get(2)
        .map(|m| m.as_str().to_ascii_lowercase())
        .unwrap_or_default();
    if unit.is_empty() || unit == "b" {
        return Ok(value);
    }
    let multiplier = size_multiplier(&unit).ok_or_else(|| anyhow!("unknown size unit '{unit}'"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| anyhow!("size '{raw}' overflows"))
}

fn size_multiplier(unit: &str) -> Option<u64> {
    match unit {
        "k" | "kb" | "kib" => Some(1 << 10),
        "m" | "mb" | "mib" => Some(1 << 20),
        "g" | "gb" | "gib" => Some(1 << 30),
        "t" | "tb" | "tib" => Some(1 << 40),
        "p" | "pb" | "pib" => Some(1 << 50),
        _ => None,
    }
}

/// Converts a byte count into a human readable string.
pub fn format_bytes(n: u64) -> String {
    const SIZES: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
    if n == 0 {
        return "0 B".to_string();
    }
    let mut value = n as f64;
    let mut idx = 0;
    while value >= 1024.0 && idx < SIZES.len() - 1 {
        value /= 1024.0;
        idx += 1;
    }
    if idx == 0 {
        format!("{} {}", n, SIZES[idx])
    } else {
        format!("{:.2} {}", value, SIZES[idx])
    }
}

/// Wraps `tokio::time::timeout`, converting elapsed deadlines and inner errors into contextual
/// `anyhow::Error` values for consistent diagnostics.
pub async fn timeout_with_context<F, T, E>(
    duration: Duration,
    future: F,
    context: impl Into<String>,
) -> Result<T>
where
    F: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let context = context.into();
    timeout(duration, future)
        .await
        .map_err(|_| anyhow!("timed out {context}"))?
        .with_context(|| format!("failed while {context}"))
}
