//! Next-occurrence calculation for recurring tasks.
//!
//! All arithmetic happens on the task's local calendar: the anchor instant
//! is projected into the task's timezone, the rule advances the local
//! date, and the original wall-clock time-of-day is re-resolved against
//! the destination date. The UTC offset is recomputed for that date, never
//! carried over, so occurrences stay at the same local time across DST
//! transitions.

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::models::recurrence::RuleWeekday;
use crate::models::Recurrence;
use crate::{Error, Result};

/// Compute the next occurrence's due instant after `anchor`.
///
/// `anchor` is the due time of the just-completed (or just-created)
/// occurrence. Returns `None` for tasks without a rule: a one-shot task
/// has no next occurrence.
pub fn next_occurrence(
    rule: Option<&Recurrence>,
    anchor: DateTime<Utc>,
    tz: Tz,
) -> Result<Option<DateTime<Utc>>> {
    match rule {
        None => Ok(None),
        Some(rule) => advance(rule, anchor, tz).map(Some),
    }
}

/// Advance `anchor` by one step of `rule` in the task's timezone.
pub fn advance(rule: &Recurrence, anchor: DateTime<Utc>, tz: Tz) -> Result<DateTime<Utc>> {
    rule.validate()?;

    let local = anchor.with_timezone(&tz);
    let anchor_date = local.date_naive();
    let time_of_day = local.time();

    let next_date = match rule {
        Recurrence::Daily { interval } => anchor_date + Duration::days(i64::from(*interval)),
        Recurrence::Weekly { interval, weekdays } => {
            next_weekly_date(anchor_date, *interval, weekdays).ok_or_else(|| {
                Error::InvalidRule("weekly rule requires at least one weekday".to_string())
            })?
        }
        Recurrence::Monthly {
            interval,
            day_of_month,
        } => next_monthly_date(anchor_date, *interval, *day_of_month)?,
    };

    resolve_local(tz, next_date, time_of_day)
}

/// Advance a `(due, reminder)` pair by one step of `rule`.
///
/// The reminder keeps its own wall-clock time-of-day and its day distance
/// from the due date, so a "remind the evening before" offset survives the
/// advance even when the UTC offset changes in between.
pub fn advance_pair(
    rule: &Recurrence,
    due: DateTime<Utc>,
    remind: Option<DateTime<Utc>>,
    tz: Tz,
) -> Result<(DateTime<Utc>, Option<DateTime<Utc>>)> {
    let next_due = advance(rule, due, tz)?;

    let next_remind = match remind {
        None => None,
        Some(remind) => {
            let due_local = due.with_timezone(&tz);
            let remind_local = remind.with_timezone(&tz);
            let gap_days = (due_local.date_naive() - remind_local.date_naive()).num_days();

            let next_due_date = next_due.with_timezone(&tz).date_naive();
            let remind_date = next_due_date - Duration::days(gap_days);
            Some(resolve_local(tz, remind_date, remind_local.time())?)
        }
    };

    Ok((next_due, next_remind))
}

/// Compute the next `count` occurrences following `anchor`.
///
/// Used by the occurrence preview command and by tests that assert a
/// whole series.
pub fn nth_following(
    rule: &Recurrence,
    anchor: DateTime<Utc>,
    tz: Tz,
    count: usize,
) -> Result<Vec<DateTime<Utc>>> {
    let mut out = Vec::with_capacity(count);
    let mut cursor = anchor;
    for _ in 0..count {
        cursor = advance(rule, cursor, tz)?;
        out.push(cursor);
    }
    Ok(out)
}

/// Next date for a weekly rule, strictly after the anchor date.
///
/// Scans the remainder of the anchor's ISO week first; when no listed
/// weekday remains, jumps `interval` weeks from the anchor's week start
/// and takes the earliest listed weekday. Ties break in ascending ISO
/// weekday order, which the `BTreeSet` ordering already provides.
fn next_weekly_date(
    anchor_date: NaiveDate,
    interval: u32,
    weekdays: &std::collections::BTreeSet<RuleWeekday>,
) -> Option<NaiveDate> {
    let anchor_offset = anchor_date.weekday().num_days_from_monday();

    // Remainder of the anchor's week, starting tomorrow.
    for offset in (anchor_offset + 1)..7 {
        if weekdays
            .iter()
            .any(|d| d.num_days_from_monday() == offset)
        {
            return Some(anchor_date + Duration::days(i64::from(offset - anchor_offset)));
        }
    }

    // Exhausted this cycle: jump whole weeks, earliest listed weekday wins.
    let week_start = anchor_date - Duration::days(i64::from(anchor_offset));
    let first = weekdays.iter().next()?;
    Some(
        week_start
            + Duration::days(i64::from(interval) * 7 + i64::from(first.num_days_from_monday())),
    )
}

/// Next date for a monthly rule: `interval` months ahead, clamped to the
/// target month's last day when `day_of_month` overflows it.
///
/// Clamping (Jan 31 -> Feb 28 -> still Mar 31, because the rule's day is
/// used rather than the clamped anchor day) is a product decision, not an
/// error.
fn next_monthly_date(anchor_date: NaiveDate, interval: u32, day_of_month: u32) -> Result<NaiveDate> {
    let month_index = i64::from(anchor_date.year()) * 12
        + i64::from(anchor_date.month0())
        + i64::from(interval);
    let year = i32::try_from(month_index.div_euclid(12))
        .map_err(|_| Error::InvalidRule("date out of range".to_string()))?;
    let month = month_index.rem_euclid(12) as u32 + 1;

    let day = day_of_month.min(days_in_month(year, month));
    NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| Error::InvalidRule("date out of range".to_string()))
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    first_of_next
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

/// Resolve a local date + wall-clock time to a UTC instant in `tz`.
///
/// Ambiguous local times (DST fold) take the earlier instant. Nonexistent
/// local times (DST gap) shift forward in one-hour steps until a valid
/// local time exists; gaps larger than two days do not occur in the IANA
/// database, so the bound is a hard error rather than a silent fallback.
fn resolve_local(tz: Tz, date: NaiveDate, time: NaiveTime) -> Result<DateTime<Utc>> {
    let mut naive = date.and_time(time);
    for _ in 0..48 {
        match tz.from_local_datetime(&naive) {
            LocalResult::Single(dt) => return Ok(dt.with_timezone(&Utc)),
            LocalResult::Ambiguous(earlier, _) => return Ok(earlier.with_timezone(&Utc)),
            LocalResult::None => naive += Duration::hours(1),
        }
    }
    Err(Error::Other(format!(
        "could not resolve local time {} in {}",
        date.and_time(time),
        tz
    )))
}
