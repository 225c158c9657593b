use std::str::FromStr;

use ::cron::Schedule;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// Parse a standard 5- or 6-field cron expression.
///
/// The `cron` crate always expects a seconds field, so plain 5-field
/// expressions get a literal `0` seconds prepended.
pub(crate) fn parse(expression: &str) -> Result<Schedule> {
    let expression = expression.trim();
    let normalized = match expression.split_whitespace().count() {
        5 => format!("0 {expression}"),
        6 => expression.to_string(),
        _ => return Err(Error::InvalidCron),
    };

    Schedule::from_str(&normalized).map_err(|_| Error::InvalidCron)
}

/// Next scheduled instant strictly after `after_millis`.
pub(crate) fn next_run_after(expression: &str, after_millis: i64) -> Result<i64> {
    let schedule = parse(expression)?;
    let after = DateTime::<Utc>::from_timestamp_millis(after_millis).unwrap_or_else(Utc::now);

    schedule
        .after(&after)
        .next()
        .map(|instant| instant.timestamp_millis())
        .ok_or(Error::InvalidCron)
}
