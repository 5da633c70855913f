//! Recurrence rules and next-occurrence math.
//!
//! Rules are expanded lazily: only the next occurrence is ever computed, and
//! it is computed again after every fire.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkerError};

/// Longest accepted interval between doses: one leap year.
pub const MAX_INTERVAL_SECS: u64 = 366 * 86_400;

/// How often a reminder repeats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Recurrence {
    /// Every N seconds, counted from the alarm's base time.
    Interval {
        /// Interval in seconds between occurrences.
        secs: u64,
    },
    /// Once a day at a given hour and minute (UTC).
    Daily {
        /// Hour of day (0-23, UTC).
        hour: u8,
        /// Minute of hour (0-59).
        min: u8,
    },
}

impl std::fmt::Display for Recurrence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interval { secs } => {
                if *secs >= 3600 && secs % 3600 == 0 {
                    write!(f, "every {} hours", secs / 3600)
                } else if *secs >= 60 && secs % 60 == 0 {
                    write!(f, "every {} minutes", secs / 60)
                } else {
                    write!(f, "every {secs} seconds")
                }
            }
            Self::Daily { hour, min } => write!(f, "daily at {hour:02}:{min:02} UTC"),
        }
    }
}

impl Recurrence {
    /// Parse a dosing instruction.
    ///
    /// Accepted forms: `every 8 hours`, `every 30 min`, `every 2 days`,
    /// `a cada 8 horas`, `8/8h`, `12h`, `daily at 08:30`, `08:30`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::InvalidSchedule`] for unparsable text or an
    /// interval that is zero or longer than [`MAX_INTERVAL_SECS`].
    pub fn parse(instruction: &str) -> Result<Self> {
        let text = instruction.trim().to_lowercase();
        let invalid = || {
            WorkerError::InvalidSchedule(format!("cannot understand recurrence {instruction:?}"))
        };

        let rule = if let Some(time) = text.strip_prefix("daily at ") {
            parse_time_of_day(time.trim()).ok_or_else(invalid)?
        } else if let Some(rule) = parse_time_of_day(&text) {
            rule
        } else if let Some((left, right)) = text.split_once('/') {
            // "8/8h": the dose repeats every N hours.
            let (n, unit) = split_quantity(right.trim()).ok_or_else(invalid)?;
            if left.trim().parse::<u64>().ok() != Some(n) {
                return Err(invalid());
            }
            interval(n, if unit.is_empty() { "h" } else { unit }).ok_or_else(invalid)?
        } else {
            let rest = text
                .strip_prefix("every ")
                .or_else(|| text.strip_prefix("a cada "))
                .unwrap_or(&text);
            let (n, unit) = split_quantity(rest.trim()).ok_or_else(invalid)?;
            interval(n, unit).ok_or_else(invalid)?
        };

        rule.validate()?;
        Ok(rule)
    }

    /// Reject rules that would never advance or name an impossible time.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::InvalidSchedule`] describing the problem.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Interval { secs: 0 } => Err(WorkerError::InvalidSchedule(
                "recurrence interval must be positive".to_owned(),
            )),
            Self::Interval { secs } if *secs > MAX_INTERVAL_SECS => {
                Err(WorkerError::InvalidSchedule(format!(
                    "recurrence interval of {secs}s exceeds {MAX_INTERVAL_SECS}s"
                )))
            }
            Self::Interval { .. } => Ok(()),
            Self::Daily { hour, min } if *hour > 23 || *min > 59 => Err(
                WorkerError::InvalidSchedule(format!("invalid time of day {hour:02}:{min:02}")),
            ),
            Self::Daily { .. } => Ok(()),
        }
    }

    /// First occurrence strictly after `now`.
    ///
    /// Interval rules step from `anchor`; daily rules ignore it.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::InvalidSchedule`] if the occurrence falls outside
    /// the representable date range.
    pub fn next_after(&self, anchor: DateTime<Utc>, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let out_of_range =
            || WorkerError::InvalidSchedule(format!("next occurrence of {self} is out of range"));
        match self {
            Self::Interval { secs } => {
                let step = i64::try_from(*secs).map_err(|_| out_of_range())?.max(1);
                if anchor > now {
                    return Ok(anchor);
                }
                let elapsed = (now - anchor).num_seconds();
                let offset = (elapsed / step + 1)
                    .checked_mul(step)
                    .and_then(Duration::try_seconds)
                    .ok_or_else(out_of_range)?;
                anchor.checked_add_signed(offset).ok_or_else(out_of_range)
            }
            Self::Daily { hour, min } => {
                let time = NaiveTime::from_hms_opt(u32::from(*hour), u32::from(*min), 0)
                    .unwrap_or(NaiveTime::MIN);
                let today = now.date_naive().and_time(time).and_utc();
                if today > now {
                    Ok(today)
                } else {
                    today
                        .checked_add_signed(Duration::days(1))
                        .ok_or_else(out_of_range)
                }
            }
        }
    }
}

fn parse_time_of_day(text: &str) -> Option<Recurrence> {
    let (h, m) = text.split_once(':')?;
    let hour = h.trim().parse::<u8>().ok()?;
    let min = m.trim().parse::<u8>().ok()?;
    Some(Recurrence::Daily { hour, min })
}

/// Split `"8 hours"` / `"8h"` into `(8, "hours")`.
fn split_quantity(text: &str) -> Option<(u64, &str)> {
    let digits_end = text
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map_or(text.len(), |(i, _)| i);
    if digits_end == 0 {
        return None;
    }
    let n = text[..digits_end].parse().ok()?;
    Some((n, text[digits_end..].trim()))
}

fn interval(n: u64, unit: &str) -> Option<Recurrence> {
    let per_unit = match unit {
        "h" | "hr" | "hrs" | "hour" | "hours" | "hora" | "horas" => 3600,
        "m" | "min" | "mins" | "minute" | "minutes" | "minuto" | "minutos" => 60,
        "d" | "day" | "days" | "dia" | "dias" => 86_400,
        _ => return None,
    };
    Some(Recurrence::Interval {
        secs: n.checked_mul(per_unit)?,
    })
}
