//! Human-readable quantity parsing for CPU, memory/disk, GPU and durations.
//!
//! Accepted formats:
//!
//! - CPU: `"2"`, `"0.5"`, `"500m"` (millicores)
//! - Bytes: bare numbers, decimal suffixes (`k`, `M`, `G`, `T`, with or
//!   without a trailing `b`/`B`) and binary suffixes (`Ki`, `Mi`, `Gi`, `Ti`)
//! - GPU: a non-negative integer count
//! - Durations: `"500ms"`, `"5s"`, `"2m"`, `"1h"`, or a bare number of seconds

use std::time::Duration;

use crate::error::{CoreError, CoreResult};

fn invalid(input: &str, reason: &str) -> CoreError {
    CoreError::InvalidQuantity {
        input: input.to_string(),
        reason: reason.to_string(),
    }
}

/// Parse a CPU quantity into cores.
pub fn parse_cpu(s: &str) -> CoreResult<f64> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(0.0);
    }
    let cores = match s.strip_suffix('m') {
        Some(milli) => milli
            .trim()
            .parse::<f64>()
            .map_err(|_| invalid(s, "expected millicores like '500m'"))?
            / 1000.0,
        None => s
            .parse::<f64>()
            .map_err(|_| invalid(s, "expected a number of cores"))?,
    };
    if !cores.is_finite() || cores < 0.0 {
        return Err(invalid(s, "must be a non-negative number"));
    }
    Ok(cores)
}

/// Parse a byte quantity.
pub fn parse_bytes(s: &str) -> CoreResult<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(0);
    }

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (num_str, suffix) = s.split_at(split);
    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| invalid(s, "expected a number with an optional unit"))?;

    let multiplier: u64 = match suffix.trim() {
        "" | "b" | "B" => 1,
        "Ki" | "KiB" => 1 << 10,
        "Mi" | "MiB" => 1 << 20,
        "Gi" | "GiB" => 1 << 30,
        "Ti" | "TiB" => 1 << 40,
        other => match other.to_ascii_lowercase().trim_end_matches('b') {
            "k" => 1_000,
            "m" => 1_000_000,
            "g" => 1_000_000_000,
            "t" => 1_000_000_000_000,
            _ => return Err(invalid(s, "unknown unit")),
        },
    };

    let bytes = num * multiplier as f64;
    if !bytes.is_finite() || bytes < 0.0 || bytes > u64::MAX as f64 {
        return Err(invalid(s, "out of range"));
    }
    Ok(bytes.round() as u64)
}

/// Parse a GPU count.
pub fn parse_gpu(s: &str) -> CoreResult<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(0);
    }
    s.parse::<u64>()
        .map_err(|_| invalid(s, "expected a whole number of GPUs"))
}

/// Parse a duration string like `"5s"`, `"500ms"`, `"2m"`, `"1h"`.
pub fn parse_duration(s: &str) -> CoreResult<Duration> {
    let s = s.trim();
    let bad = || CoreError::InvalidDuration(s.to_string());

    if let Some(ms) = s.strip_suffix("ms") {
        return ms.trim().parse::<u64>().map(Duration::from_millis).map_err(|_| bad());
    }
    let (number, unit_secs) = if let Some(secs) = s.strip_suffix('s') {
        (secs, 1)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60)
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, 3600)
    } else {
        (s, 1)
    };
    let count = number.trim().parse::<u64>().map_err(|_| bad())?;
    let secs = count.checked_mul(unit_secs).ok_or_else(bad)?;
    Ok(Duration::from_secs(secs))
}

/// Format a byte count using the largest exact binary unit.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [(u64, &str); 4] = [(1 << 40, "Ti"), (1 << 30, "Gi"), (1 << 20, "Mi"), (1 << 10, "Ki")];
    for (size, unit) in UNITS {
        if bytes >= size && bytes % size == 0 {
            return format!("{}{unit}", bytes / size);
        }
    }
    bytes.to_string()
}
