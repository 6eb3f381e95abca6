//! Conversions between textual trigger specifications and time values.
//!
//! - [`parse_duration`] understands compact durations such as `"10d"`, `"1h30m"`,
//!   `"0.3s"` or a bare number of seconds.
//! - [`parse_time`] understands RFC 3339 timestamps and `YYYY/MM/DD HH:MM[:SS]`
//!   style timestamps (interpreted as UTC).
//! - [`CronExpr`] wraps a parsed CRON expression (requires the `cron_schedule` feature).
//! - [`format_duration`] renders a duration the way `TickKeeper::uptime_s` reports it.

use std::fmt::Write as _;
use std::time::Duration as StdDuration;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

use crate::error::ParseError;

#[cfg(feature = "cron_schedule")]
use std::{fmt, str::FromStr, sync::Arc};

const SECS_PER_MINUTE: f64 = 60.0;
const SECS_PER_HOUR: f64 = 60.0 * SECS_PER_MINUTE;
const SECS_PER_DAY: f64 = 24.0 * SECS_PER_HOUR;

/// Timestamp layouts accepted by [`parse_time`] besides RFC 3339. All are read as UTC.
const NAIVE_TIME_FORMATS: &[&str] = &[
  "%Y/%m/%d %H:%M:%S",
  "%Y/%m/%d %H:%M",
  "%Y-%m-%d %H:%M:%S",
  "%Y-%m-%d %H:%M",
  "%Y-%m-%dT%H:%M:%S",
];

fn unit_seconds(unit: &str) -> Option<f64> {
  match unit {
    "y" => Some(365.0 * SECS_PER_DAY),
    "M" => Some(30.0 * SECS_PER_DAY),
    "w" => Some(7.0 * SECS_PER_DAY),
    "d" => Some(SECS_PER_DAY),
    "h" => Some(SECS_PER_HOUR),
    "m" => Some(SECS_PER_MINUTE),
    "s" => Some(1.0),
    "ms" => Some(0.001),
    _ => None,
  }
}

/// Parses a compact duration string.
///
/// The input is a sequence of `<number><unit>` pairs, optionally separated by
/// whitespace. Units: `y` (365 days), `M` (30 days), `w`, `d`, `h`, `m`, `s`, `ms`.
/// Numbers may be fractional. A bare number is read as seconds.
///
/// ```
/// use std::time::Duration;
/// use tickkeeper::parse::parse_duration;
///
/// assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
/// assert_eq!(parse_duration("0.3s").unwrap(), Duration::from_millis(300));
/// assert!(parse_duration("ten days").is_err());
/// ```
pub fn parse_duration(text: &str) -> Result<StdDuration, ParseError> {
  let invalid = || ParseError::InvalidDuration(text.to_string());
  let input = text.trim();
  if input.is_empty() {
    return Err(invalid());
  }

  // Bare number: seconds
  if let Ok(secs) = input.parse::<f64>() {
    return secs_to_duration(secs).ok_or_else(invalid);
  }

  let mut total_secs = 0.0;
  let mut rest = input;
  while !rest.is_empty() {
    rest = rest.trim_start();

    let number_len = rest
      .find(|c: char| !(c.is_ascii_digit() || c == '.'))
      .unwrap_or(rest.len());
    if number_len == 0 {
      return Err(invalid());
    }
    let value: f64 = rest[..number_len].parse().map_err(|_| invalid())?;
    rest = &rest[number_len..];

    let unit_len = rest
      .find(|c: char| !c.is_ascii_alphabetic())
      .unwrap_or(rest.len());
    let factor = unit_seconds(&rest[..unit_len]).ok_or_else(invalid)?;
    rest = &rest[unit_len..];

    total_secs += value * factor;
  }

  secs_to_duration(total_secs).ok_or_else(invalid)
}

fn secs_to_duration(secs: f64) -> Option<StdDuration> {
  if !secs.is_finite() || secs < 0.0 {
    return None;
  }
  StdDuration::try_from_secs_f64(secs).ok()
}

/// Parses an absolute point in time.
///
/// Accepts RFC 3339 (`2030-12-12T12:10:00+09:00`) as well as
/// `2030/12/12 12:10:00`, `2030/12/12 12:10`, `2030-12-12 12:10:00` and
/// `2030-12-12 12:10`, which carry no offset and are read as UTC.
pub fn parse_time(text: &str) -> Result<DateTime<Utc>, ParseError> {
  let input = text.trim();
  if let Ok(with_offset) = DateTime::parse_from_rfc3339(input) {
    return Ok(with_offset.with_timezone(&Utc));
  }

  NAIVE_TIME_FORMATS
    .iter()
    .find_map(|format| NaiveDateTime::parse_from_str(input, format).ok())
    .map(|naive| Utc.from_utc_datetime(&naive))
    .ok_or_else(|| ParseError::InvalidTime(text.to_string()))
}

/// Renders a duration as weeks, days, hours, minutes and seconds, followed by the
/// millisecond remainder padded to three digits.
///
/// Zero-valued leading components are omitted; seconds and milliseconds are
/// always present: `0s250`, `1s042`, `2m5s000`, `1d3h0s500`.
pub fn format_duration(duration: StdDuration) -> String {
  let mut secs = duration.as_secs();
  let millis = duration.subsec_millis();
  let mut out = String::new();

  for (unit, size) in [("w", 604_800u64), ("d", 86_400), ("h", 3_600), ("m", 60)] {
    let count = secs / size;
    if count > 0 {
      let _ = write!(out, "{count}{unit}");
      secs %= size;
    }
  }
  let _ = write!(out, "{secs}s{millis:03}");
  out
}

/// Renders a duration in the syntax [`parse_duration`] accepts, so the result
/// can be parsed back to the same value (to millisecond precision).
///
/// Zero-valued components are omitted: `1m`, `1h30m`, `2s250ms`, `0s`.
pub fn format_duration_spec(duration: StdDuration) -> String {
  let mut secs = duration.as_secs();
  let millis = duration.subsec_millis();
  let mut out = String::new();

  for (unit, size) in [("w", 604_800u64), ("d", 86_400), ("h", 3_600), ("m", 60), ("s", 1)] {
    let count = secs / size;
    if count > 0 {
      let _ = write!(out, "{count}{unit}");
      secs %= size;
    }
  }
  if millis > 0 {
    let _ = write!(out, "{millis}ms");
  }
  if out.is_empty() {
    out.push_str("0s");
  }
  out
}

// --- CRON ---

/// A parsed CRON expression, evaluated in UTC.
///
/// Five-field expressions (`min hour dom month dow`) have their seconds pinned
/// to zero; six- and seven-field expressions (with seconds, and optionally year)
/// are passed through. Numeric day-of-week values follow the `cron` crate
/// (1 = Sunday); named days (`MON-FRI`) are usually clearer.
#[cfg(feature = "cron_schedule")]
#[derive(Clone)]
pub struct CronExpr {
  source: String,
  schedule: Arc<cron::Schedule>,
}

#[cfg(feature = "cron_schedule")]
impl CronExpr {
  pub fn parse(expression: &str) -> Result<Self, ParseError> {
    let invalid = |reason: String| ParseError::InvalidCron {
      expression: expression.to_string(),
      reason,
    };

    let trimmed = expression.trim();
    let normalized = match trimmed.split_whitespace().count() {
      5 => format!("0 {trimmed}"),
      6 | 7 => trimmed.to_string(),
      n => return Err(invalid(format!("expected 5, 6 or 7 fields, found {n}"))),
    };

    let schedule = cron::Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))?;
    Ok(Self {
      source: expression.to_string(),
      schedule: Arc::new(schedule),
    })
  }

  /// The expression exactly as it was given.
  pub fn as_str(&self) -> &str {
    &self.source
  }

  /// The first occurrence strictly after `after`, or `None` if the expression
  /// has no further occurrences (e.g. a year field in the past).
  pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    self.schedule.after(&after).next()
  }
}

#[cfg(feature = "cron_schedule")]
impl PartialEq for CronExpr {
  fn eq(&self, other: &Self) -> bool {
    self.source == other.source
  }
}

#[cfg(feature = "cron_schedule")]
impl fmt::Debug for CronExpr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("CronExpr").field(&self.source).finish()
  }
}

#[cfg(feature = "cron_schedule")]
impl fmt::Display for CronExpr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.source)
  }
}

/// Next occurrence of `expr` strictly after `after`.
#[cfg(feature = "cron_schedule")]
pub fn next_cron_occurrence(expr: &CronExpr, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
  expr.next_after(after)
}
