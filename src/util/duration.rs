use std::time::Duration;

use derive_more::{Display, Error};

/// A duration in a human notation could not be parsed.
#[derive(Debug, Display, Error, PartialEq, Eq)]
#[display("Invalid duration '{_0}', expected e.g. 30s, 5m, 1h or 7d")]
pub struct InvalidDuration(#[error(ignore)] String);

/// Parses durations like `30s`, `5m`, `1h` or `7d`.
///
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Result<Duration, InvalidDuration> {
    let s = s.trim();
    let invalid = || InvalidDuration(s.to_string());

    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (value, unit) = s.split_at(split);
    let value: u64 = value.parse().map_err(|_| invalid())?;

    let factor = match unit.trim() {
        "" | "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        _ => return Err(invalid()),
    };

    value
        .checked_mul(factor)
        .map(Duration::from_secs)
        .ok_or_else(invalid)
}

/// Renders a duration in the notation accepted by [parse_duration].
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    match secs {
        0 => "0s".to_string(),
        s if s % 86_400 == 0 => format!("{}d", s / 86_400),
        s if s % 3_600 == 0 => format!("{}h", s / 3_600),
        s if s % 60 == 0 => format!("{}m", s / 60),
        s => format!("{s}s"),
    }
}
