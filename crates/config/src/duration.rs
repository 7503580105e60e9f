//! Go-style duration strings: `"90s"`, `"1h30m"`, `"250ms"`, `"1.5h"`.

use std::time::Duration;

use crate::ConfigError;

fn unit_nanos(unit: &str) -> Option<f64> {
    Some(match unit {
        "ns" => 1.0,
        "us" | "µs" => 1e3,
        "ms" => 1e6,
        "s" => 1e9,
        "m" => 60.0 * 1e9,
        "h" => 3600.0 * 1e9,
        _ => return None,
    })
}

pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::Invalid(format!("invalid duration {:?}", s));
    let s = s.trim();
    if s.is_empty() { return Err(invalid()); }
    if s == "0" { return Ok(Duration::ZERO); }
    if s.starts_with('-') { return Err(ConfigError::Invalid(format!("negative duration {:?}", s))); }

    let mut total = 0f64;
    let mut rest = s.strip_prefix('+').unwrap_or(s);
    while !rest.is_empty() {
        let num_end = rest.find(|c: char| !(c.is_ascii_digit() || c == '.')).ok_or_else(invalid)?;
        if num_end == 0 { return Err(invalid()); }
        let value: f64 = rest[..num_end].parse().map_err(|_| invalid())?;
        rest = &rest[num_end..];
        let unit_end = rest.find(|c: char| c.is_ascii_digit() || c == '.').unwrap_or(rest.len());
        let mult = unit_nanos(&rest[..unit_end]).ok_or_else(invalid)?;
        total += value * mult;
        rest = &rest[unit_end..];
    }
    Ok(Duration::from_nanos(total.round() as u64))
}

/// Inverse of [`parse_duration`] for whole units; sub-second values fall back to `ms`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if d.subsec_nanos() != 0 {
        return format!("{}ms", d.as_millis());
    }
    if secs == 0 { return "0s".to_string(); }
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    let mut out = String::new();
    if h > 0 { out.push_str(&format!("{}h", h)); }
    if m > 0 { out.push_str(&format!("{}m", m)); }
    if s > 0 { out.push_str(&format!("{}s", s)); }
    out
}
