//! Recurrence rule model for recurring tasks.

use chrono::Weekday;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::{Error, Result};

/// A repeat pattern attached to a task.
///
/// A rule is immutable once attached to a task generation: edits apply to
/// future-generated occurrences only, never retroactively. Serialized as
/// tagged JSON so it round-trips through the store and event payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frequency", rename_all = "lowercase")]
pub enum Recurrence {
    /// Every `interval` days.
    Daily { interval: u32 },
    /// On the listed weekdays, every `interval` weeks.
    Weekly {
        interval: u32,
        /// Weekdays the task recurs on; ordered and deduplicated.
        weekdays: BTreeSet<RuleWeekday>,
    },
    /// On `day_of_month`, every `interval` months. Days past the end of a
    /// short month clamp to its last day.
    Monthly { interval: u32, day_of_month: u32 },
}

impl Recurrence {
    /// Validate the rule, rejecting malformed variants.
    ///
    /// A malformed rule is a permanent error: it is never silently
    /// defaulted and never retried.
    pub fn validate(&self) -> Result<()> {
        match self {
            Recurrence::Daily { interval } => {
                if *interval == 0 {
                    return Err(Error::InvalidRule("daily interval must be >= 1".to_string()));
                }
            }
            Recurrence::Weekly { interval, weekdays } => {
                if *interval == 0 {
                    return Err(Error::InvalidRule(
                        "weekly interval must be >= 1".to_string(),
                    ));
                }
                if weekdays.is_empty() {
                    return Err(Error::InvalidRule(
                        "weekly rule requires at least one weekday".to_string(),
                    ));
                }
            }
            Recurrence::Monthly {
                interval,
                day_of_month,
            } => {
                if *interval == 0 {
                    return Err(Error::InvalidRule(
                        "monthly interval must be >= 1".to_string(),
                    ));
                }
                if !(1..=31).contains(day_of_month) {
                    return Err(Error::InvalidRule(format!(
                        "day of month must be 1-31, got {}",
                        day_of_month
                    )));
                }
            }
        }
        Ok(())
    }

    /// Parse a compact CLI spec: `daily[:n]`, `weekly[:n]:mon,wed`,
    /// `monthly[:n]:15`.
    pub fn parse_spec(spec: &str) -> Result<Self> {
        let parts: Vec<&str> = spec.split(':').collect();
        let rule = match parts[0].to_lowercase().as_str() {
            "daily" => {
                let interval = parse_interval(parts.get(1))?;
                if parts.len() > 2 {
                    return Err(Error::InvalidRule(format!("malformed spec: {}", spec)));
                }
                Recurrence::Daily { interval }
            }
            "weekly" => {
                // Last segment is the weekday list; an optional middle
                // segment is the interval.
                let (interval, days) = match parts.len() {
                    2 => (1, parts[1]),
                    3 => (parse_interval(parts.get(1))?, parts[2]),
                    _ => return Err(Error::InvalidRule(format!("malformed spec: {}", spec))),
                };
                let weekdays = days
                    .split(',')
                    .map(RuleWeekday::parse)
                    .collect::<Result<BTreeSet<_>>>()?;
                Recurrence::Weekly { interval, weekdays }
            }
            "monthly" => {
                let (interval, day) = match parts.len() {
                    2 => (1, parts[1]),
                    3 => (parse_interval(parts.get(1))?, parts[2]),
                    _ => return Err(Error::InvalidRule(format!("malformed spec: {}", spec))),
                };
                let day_of_month: u32 = day
                    .parse()
                    .map_err(|_| Error::InvalidRule(format!("invalid day of month: {}", day)))?;
                Recurrence::Monthly {
                    interval,
                    day_of_month,
                }
            }
            other => {
                return Err(Error::InvalidRule(format!(
                    "unknown frequency: {}",
                    other
                )))
            }
        };
        rule.validate()?;
        Ok(rule)
    }
}

impl fmt::Display for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recurrence::Daily { interval } => write!(f, "every {} day(s)", interval),
            Recurrence::Weekly { interval, weekdays } => {
                let days: Vec<&str> = weekdays.iter().map(|d| d.as_str()).collect();
                write!(f, "every {} week(s) on {}", interval, days.join(","))
            }
            Recurrence::Monthly {
                interval,
                day_of_month,
            } => write!(f, "every {} month(s) on day {}", interval, day_of_month),
        }
    }
}

fn parse_interval(part: Option<&&str>) -> Result<u32> {
    match part {
        None => Ok(1),
        Some(s) => s
            .parse()
            .map_err(|_| Error::InvalidRule(format!("invalid interval: {}", s))),
    }
}

/// A weekday in a weekly rule, ordered Monday-first.
///
/// `chrono::Weekday` does not implement `Ord`, so rules carry this wrapper
/// to keep weekday sets sorted in ISO order (the tie-break order used when
/// picking the next occurrence).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleWeekday {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl RuleWeekday {
    /// Parse from a short or full weekday name, case-insensitive.
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "mon" | "monday" => Ok(RuleWeekday::Mon),
            "tue" | "tues" | "tuesday" => Ok(RuleWeekday::Tue),
            "wed" | "wednesday" => Ok(RuleWeekday::Wed),
            "thu" | "thurs" | "thursday" => Ok(RuleWeekday::Thu),
            "fri" | "friday" => Ok(RuleWeekday::Fri),
            "sat" | "saturday" => Ok(RuleWeekday::Sat),
            "sun" | "sunday" => Ok(RuleWeekday::Sun),
            other => Err(Error::InvalidRule(format!("unknown weekday: {}", other))),
        }
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleWeekday::Mon => "mon",
            RuleWeekday::Tue => "tue",
            RuleWeekday::Wed => "wed",
            RuleWeekday::Thu => "thu",
            RuleWeekday::Fri => "fri",
            RuleWeekday::Sat => "sat",
            RuleWeekday::Sun => "sun",
        }
    }

    /// Days from Monday (0-6), matching ISO weekday order.
    pub fn num_days_from_monday(&self) -> u32 {
        *self as u32
    }
}

impl From<Weekday> for RuleWeekday {
    fn from(w: Weekday) -> Self {
        match w {
            Weekday::Mon => RuleWeekday::Mon,
            Weekday::Tue => RuleWeekday::Tue,
            Weekday::Wed => RuleWeekday::Wed,
            Weekday::Thu => RuleWeekday::Thu,
            Weekday::Fri => RuleWeekday::Fri,
            Weekday::Sat => RuleWeekday::Sat,
            Weekday::Sun => RuleWeekday::Sun,
        }
    }
}

impl From<RuleWeekday> for Weekday {
    fn from(w: RuleWeekday) -> Self {
        match w {
            RuleWeekday::Mon => Weekday::Mon,
            RuleWeekday::Tue => Weekday::Tue,
            RuleWeekday::Wed => Weekday::Wed,
            RuleWeekday::Thu => Weekday::Thu,
            RuleWeekday::Fri => Weekday::Fri,
            RuleWeekday::Sat => Weekday::Sat,
            RuleWeekday::Sun => Weekday::Sun,
        }
    }
}
