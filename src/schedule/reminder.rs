//! Reminder disposition for a single task snapshot.
//!
//! Decides whether a reminder is due at a reference instant and carries
//! the data a delivery channel needs to render it. The idempotency check
//! belongs to the coordinator; this module stays pure.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::models::{Priority, Task};

/// Outcome of resolving a task snapshot against a reference instant.
#[derive(Debug, Clone, PartialEq)]
pub enum ReminderDisposition {
    /// No reminder set, task completed, or the reminder lies in the future.
    NotDue,
    /// The reminder window is open: `remind_at <= now <= due + grace`.
    Due(ReminderPayload),
    /// The grace period has lapsed. The coordinator records the skip in
    /// the ledger so the decision is not re-evaluated every poll, and no
    /// notification is sent.
    Expired,
}

/// Everything a delivery channel needs to render a reminder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReminderPayload {
    pub task_id: String,
    pub owner: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub priority: Priority,
    pub timezone: Tz,
    pub remind_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
    /// Due time preformatted in the task's timezone, for display.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_due: Option<String>,
}

impl ReminderPayload {
    fn from_task(task: &Task, remind_at: DateTime<Utc>) -> Self {
        Self {
            task_id: task.id.clone(),
            owner: task.owner.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            priority: task.priority,
            timezone: task.timezone,
            remind_at,
            due_at: task.due_at,
            local_due: task.due_at.map(|due| format_local(due, task.timezone)),
        }
    }
}

/// Format an instant for display in the task's timezone.
///
/// Example: "January 15, 2026 at 02:00 PM EST".
pub fn format_local(instant: DateTime<Utc>, tz: Tz) -> String {
    instant
        .with_timezone(&tz)
        .format("%B %d, %Y at %I:%M %p %Z")
        .to_string()
}

/// Resolve a task snapshot against `now`.
///
/// The grace period bounds how long after the due time a reminder is
/// still worth sending; past it the reminder expires silently rather
/// than spamming the owner about long-overdue work.
pub fn resolve(task: &Task, now: DateTime<Utc>, grace: Duration) -> ReminderDisposition {
    if task.completed {
        return ReminderDisposition::NotDue;
    }
    let remind_at = match task.remind_at {
        Some(t) => t,
        None => return ReminderDisposition::NotDue,
    };
    if now < remind_at {
        return ReminderDisposition::NotDue;
    }

    // Tasks without a due time anchor the grace window on the reminder.
    let deadline = task.due_at.unwrap_or(remind_at) + grace;
    if now > deadline {
        return ReminderDisposition::Expired;
    }

    ReminderDisposition::Due(ReminderPayload::from_task(task, remind_at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn grace() -> Duration {
        Duration::days(7)
    }

    fn task_with_window() -> Task {
        let mut task = Task::new(
            "kn-ab12".to_string(),
            "user-1".to_string(),
            "File the report".to_string(),
        );
        task.remind_at = Some(Utc.with_ymd_and_hms(2026, 1, 15, 13, 0, 0).unwrap());
        task.due_at = Some(Utc.with_ymd_and_hms(2026, 1, 15, 14, 0, 0).unwrap());
        task
    }

    #[test]
    fn test_not_due_before_reminder() {
        let task = task_with_window();
        let now = Utc.with_ymd_and_hms(2026, 1, 15, 12, 59, 59).unwrap();
        assert_eq!(resolve(&task, now, grace()), ReminderDisposition::NotDue);
    }

    #[test]
    fn test_due_at_exact_reminder_instant() {
        let task = task_with_window();
        let now = task.remind_at.unwrap();
        match resolve(&task, now, grace()) {
            ReminderDisposition::Due(payload) => {
                assert_eq!(payload.task_id, "kn-ab12");
                assert_eq!(payload.remind_at, now);
            }
            other => panic!("expected Due, got {:?}", other),
        }
    }

    #[test]
    fn test_due_at_grace_boundary() {
        let task = task_with_window();
        let now = task.due_at.unwrap() + grace();
        assert!(matches!(
            resolve(&task, now, grace()),
            ReminderDisposition::Due(_)
        ));
    }

    #[test]
    fn test_expired_one_second_past_grace() {
        let task = task_with_window();
        let now = task.due_at.unwrap() + grace() + Duration::seconds(1);
        assert_eq!(resolve(&task, now, grace()), ReminderDisposition::Expired);
    }

    #[test]
    fn test_completed_task_is_not_due() {
        let mut task = task_with_window();
        task.completed = true;
        let now = task.remind_at.unwrap();
        assert_eq!(resolve(&task, now, grace()), ReminderDisposition::NotDue);
    }

    #[test]
    fn test_no_reminder_time_is_not_due() {
        let mut task = task_with_window();
        task.remind_at = None;
        let now = Utc.with_ymd_and_hms(2026, 1, 15, 13, 30, 0).unwrap();
        assert_eq!(resolve(&task, now, grace()), ReminderDisposition::NotDue);
    }

    #[test]
    fn test_reminder_without_due_anchors_grace_on_reminder() {
        let mut task = task_with_window();
        task.due_at = None;
        let remind = task.remind_at.unwrap();

        assert!(matches!(
            resolve(&task, remind + grace(), grace()),
            ReminderDisposition::Due(_)
        ));
        assert_eq!(
            resolve(&task, remind + grace() + Duration::seconds(1), grace()),
            ReminderDisposition::Expired
        );
    }

    #[test]
    fn test_payload_formats_local_due() {
        let mut task = task_with_window();
        task.timezone = chrono_tz::America::New_York;
        let now = task.remind_at.unwrap();
        match resolve(&task, now, grace()) {
            ReminderDisposition::Due(payload) => {
                // 14:00Z on Jan 15 is 09:00 EST.
                assert_eq!(
                    payload.local_due.as_deref(),
                    Some("January 15, 2026 at 09:00 AM EST")
                );
            }
            other => panic!("expected Due, got {:?}", other),
        }
    }
}
