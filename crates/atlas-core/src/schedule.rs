use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::error::{Error, Result};

/// Parse a cron expression, accepting the standard 5-field form.
///
/// The `cron` crate wants a seconds field, so `"0 8 * * *"` is normalised to
/// `"0 0 8 * * *"` before parsing. 6- and 7-field expressions pass through.
pub fn parse_cron(expr: &str) -> Result<Schedule> {
    let normalised = normalise(expr);
    Schedule::from_str(&normalised)
        .map_err(|e| Error::validation(format!("invalid cron expression '{expr}': {e}")))
}

/// Validate without keeping the parsed schedule.
pub fn validate_cron(expr: &str) -> Result<()> {
    parse_cron(expr).map(|_| ())
}

/// Next fire time strictly after `after`, or `None` when the expression
/// admits no future fire (e.g. `0 0 30 2 *`).
pub fn next_fire_after(expr: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    let schedule = parse_cron(expr)?;
    Ok(schedule.after(&after).next())
}

fn normalise(expr: &str) -> String {
    let fields = expr.split_whitespace().count();
    if fields == 5 {
        format!("0 {}", expr.trim())
    } else {
        expr.trim().to_string()
    }
}
