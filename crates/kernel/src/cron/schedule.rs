//! Cron expression parsing and matching.
//!
//! Supports the classic 5-field grammar (minute, hour, day of month,
//! month, day of week) plus a set of `@` macros. Parsed schedules match
//! against a [`Moment`], the minute-resolution snapshot of a wall-clock
//! time.

use std::collections::HashSet;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Datelike, TimeZone, Timelike};

/// Macro shorthands and their 5-field equivalents.
const MACROS: &[(&str, &str)] = &[
    ("@yearly", "0 0 1 1 *"),
    ("@annually", "0 0 1 1 *"),
    ("@monthly", "0 0 1 * *"),
    ("@weekly", "0 0 * * 0"),
    ("@daily", "0 0 * * *"),
    ("@midnight", "0 0 * * *"),
    ("@hourly", "0 * * * *"),
    ("@30min", "*/30 * * * *"),
    ("@15min", "*/15 * * * *"),
    ("@10min", "*/10 * * * *"),
    ("@5min", "*/5 * * * *"),
];

/// Minute-resolution snapshot of a point in time, in the engine's
/// configured timezone. Day of week is 0 for Sunday through 6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Moment {
    pub minute: u32,
    pub hour: u32,
    pub day: u32,
    pub month: u32,
    pub day_of_week: u32,
}

impl Moment {
    pub fn from_datetime<Tz: TimeZone>(datetime: &DateTime<Tz>) -> Self {
        Self {
            minute: datetime.minute(),
            hour: datetime.hour(),
            day: datetime.day(),
            month: datetime.month(),
            day_of_week: datetime.weekday().num_days_from_sunday(),
        }
    }
}

/// Parsed cron expression as per-field slot sets.
#[derive(Debug, Clone)]
pub struct Schedule {
    minutes: HashSet<u32>,
    hours: HashSet<u32>,
    days: HashSet<u32>,
    months: HashSet<u32>,
    days_of_week: HashSet<u32>,
    raw: String,
}

impl Schedule {
    /// Parse a cron expression or macro.
    ///
    /// Each of the 5 space-separated fields accepts a wildcard (`*`), a
    /// single integer, an inclusive range (`a-b`), or a comma list of
    /// those, with an optional `/step` suffix on wildcards and ranges.
    pub fn parse(expression: &str) -> Result<Self> {
        let expression = MACROS
            .iter()
            .find(|(name, _)| *name == expression)
            .map_or(expression, |(_, expansion)| expansion);

        let segments: Vec<&str> = expression.split(' ').collect();
        let [minute, hour, day, month, day_of_week] = segments.as_slice() else {
            bail!(
                "invalid cron expression '{expression}': must be a macro or have exactly 5 space separated fields"
            );
        };

        Ok(Self {
            minutes: parse_segment(minute, 0, 59)
                .with_context(|| format!("invalid minute field '{minute}'"))?,
            hours: parse_segment(hour, 0, 23)
                .with_context(|| format!("invalid hour field '{hour}'"))?,
            days: parse_segment(day, 1, 31)
                .with_context(|| format!("invalid day of month field '{day}'"))?,
            months: parse_segment(month, 1, 12)
                .with_context(|| format!("invalid month field '{month}'"))?,
            days_of_week: parse_segment(day_of_week, 0, 6)
                .with_context(|| format!("invalid day of week field '{day_of_week}'"))?,
            raw: expression.to_string(),
        })
    }

    /// Whether the schedule fires at the given moment.
    pub fn is_due(&self, moment: &Moment) -> bool {
        self.minutes.contains(&moment.minute)
            && self.hours.contains(&moment.hour)
            && self.days.contains(&moment.day)
            && self.months.contains(&moment.month)
            && self.days_of_week.contains(&moment.day_of_week)
    }

    /// The expression this schedule was parsed from, with macros expanded.
    pub fn expression(&self) -> &str {
        &self.raw
    }
}

/// Parse one cron field into its set of matching slots.
fn parse_segment(segment: &str, min: u32, max: u32) -> Result<HashSet<u32>> {
    let mut slots = HashSet::new();

    for part in segment.split(',') {
        let (base, step) = match part.split_once('/') {
            None => (part, 1),
            Some((base, step)) => {
                let step: u32 = step
                    .parse()
                    .with_context(|| format!("step '{step}' is not a number"))?;
                if step < 1 || step > max {
                    bail!("step {step} must be between 1 and {max}");
                }
                (base, step)
            }
        };

        let (range_min, range_max) = if base == "*" {
            (min, max)
        } else {
            match base.split_once('-') {
                None => {
                    if step != 1 {
                        bail!("a step requires a wildcard or range, not a single value");
                    }
                    let value: u32 = base
                        .parse()
                        .with_context(|| format!("'{base}' is not a number"))?;
                    if value < min || value > max {
                        bail!("value {value} must be between {min} and {max}");
                    }
                    (value, value)
                }
                Some((lo, hi)) => {
                    let lo: u32 = lo
                        .parse()
                        .with_context(|| format!("range minimum '{lo}' is not a number"))?;
                    if lo < min || lo > max {
                        bail!("range minimum {lo} must be between {min} and {max}");
                    }
                    let hi: u32 = hi
                        .parse()
                        .with_context(|| format!("range maximum '{hi}' is not a number"))?;
                    if hi < lo || hi > max {
                        bail!("range maximum {hi} must be between {lo} and {max}");
                    }
                    (lo, hi)
                }
            }
        };

        let mut slot = range_min;
        while slot <= range_max {
            slots.insert(slot);
            slot += step;
        }
    }

    Ok(slots)
}
