//! Scheduling coordinator.
//!
//! Drives the cycle the rest of the crate exists for: locate candidate
//! tasks, resolve each one's reminder disposition, claim the occurrence
//! in the idempotency ledger, dispatch the notification, and commit the
//! outcome. Completions (from the event path or `kn task done`) advance
//! recurring tasks to their next occurrence inside the same commit step.
//!
//! The coordinator holds its collaborators by injection and keeps no
//! global state; several instances may run against the same database,
//! which is exactly the situation the ledger arbitrates.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration as StdDuration;

use crate::config::Settings;
use crate::delivery::{Delivery, DeliveryError, Notification};
use crate::models::{Task, TaskEvent};
use crate::schedule::{self, ReminderDisposition};
use crate::storage::{event_key, occurrence_key, Acquire, LedgerOutcome, Storage};
use crate::{Error, Result};

/// Counters for one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleReport {
    /// Candidates returned by the Scan stage
    pub scanned: u64,
    /// Notifications handed to the delivery channel
    pub sent: u64,
    /// Candidates whose reminder is not yet due
    pub not_due: u64,
    /// Candidates already claimed in the ledger
    pub duplicates: u64,
    /// Reminders past their grace period, marked and skipped
    pub expired: u64,
    /// Deliveries that failed permanently
    pub failed: u64,
    /// Per-item errors (malformed rules, storage trouble on one task)
    pub errors: u64,
}

/// What handling an inbound event did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventOutcome {
    /// False when the event had already been processed
    pub applied: bool,
    /// Occurrence materialized by a completion event, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub occurrence_id: Option<String>,
}

/// Result of completing a task through the coordinator.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionOutcome {
    pub task_id: String,
    /// Occurrence materialized from the task's rule, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub occurrence_id: Option<String>,
    /// Set when the task carries a rule that failed validation; the task
    /// is completed anyway and flagged for manual correction
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_error: Option<String>,
}

/// The scheduling coordinator.
pub struct Coordinator {
    storage: Storage,
    delivery: Box<dyn Delivery>,
    settings: Settings,
}

impl Coordinator {
    /// Build a coordinator from injected collaborators.
    pub fn new(storage: Storage, delivery: Box<dyn Delivery>, settings: Settings) -> Self {
        Self {
            storage,
            delivery,
            settings,
        }
    }

    /// Run one poll cycle at the given reference instant.
    ///
    /// Ledger unavailability aborts the whole cycle (fail closed, the
    /// next tick retries); any other per-item failure is logged, counted,
    /// and isolated from the rest of the batch.
    pub fn run_cycle(&mut self, now: DateTime<Utc>) -> Result<CycleReport> {
        let window_end = now + self.settings.lookahead();
        let candidates = match self.storage.due_candidates(window_end) {
            Ok(candidates) => candidates,
            Err(e) => {
                let msg = e.to_string();
                self.storage.record_cycle(now, 0, 0, 0, 1, Some(&msg))?;
                return Err(e);
            }
        };

        let mut report = CycleReport {
            scanned: candidates.len() as u64,
            ..Default::default()
        };
        let mut last_error: Option<String> = None;

        for task in &candidates {
            match self.process_candidate(task, now, &mut report) {
                Ok(()) => {}
                Err(e @ Error::LedgerUnavailable(_)) => {
                    let msg = e.to_string();
                    tracing::error!(error = %msg, "ledger unavailable, aborting cycle");
                    self.storage
                        .record_cycle(now, report.scanned, report.sent, 0, report.errors + 1, Some(&msg))?;
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "skipping task after error");
                    report.errors += 1;
                    last_error = Some(e.to_string());
                }
            }
        }

        self.storage.record_cycle(
            now,
            report.scanned,
            report.sent,
            0,
            report.errors,
            last_error.as_deref(),
        )?;

        tracing::info!(
            scanned = report.scanned,
            sent = report.sent,
            expired = report.expired,
            failed = report.failed,
            errors = report.errors,
            "cycle complete"
        );
        Ok(report)
    }

    /// Poll forever at the configured interval until `shutdown` is set.
    pub fn run_loop(&mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let interval = StdDuration::from_secs(self.settings.poll_interval_secs);
        tracing::info!(interval_secs = self.settings.poll_interval_secs, "agent started");

        while !shutdown.load(Ordering::SeqCst) {
            if let Err(e) = self.run_cycle(Utc::now()) {
                // The cycle already recorded the failure; the next tick
                // gets a fresh chance.
                tracing::error!(error = %e, "cycle failed");
            }

            // Sleep in short slices so shutdown stays responsive.
            let mut remaining = interval;
            while !shutdown.load(Ordering::SeqCst) && !remaining.is_zero() {
                let slice = remaining.min(StdDuration::from_millis(200));
                thread::sleep(slice);
                remaining -= slice;
            }
        }

        tracing::info!("agent stopped");
        Ok(())
    }

    fn process_candidate(
        &mut self,
        task: &Task,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<()> {
        // A malformed rule is permanent: flag it and leave the task
        // alone rather than guessing at a schedule.
        if let Some(rule) = &task.recurrence {
            rule.validate()?;
        }

        let disposition = schedule::resolve(task, now, self.settings.grace_period());
        let ledger = self.storage.ledger();

        match disposition {
            ReminderDisposition::NotDue => {
                report.not_due += 1;
                Ok(())
            }
            ReminderDisposition::Expired => {
                // Record the skip so the decision is not re-evaluated on
                // every poll; nothing is sent for ancient reminders.
                let instant = match occurrence_instant(task) {
                    Some(instant) => instant,
                    None => return Ok(()),
                };
                let key = occurrence_key(&task.id, instant);
                if ledger.try_acquire(&key, now)? == Acquire::Acquired {
                    ledger.commit(&key, LedgerOutcome::Expired, now)?;
                    tracing::info!(task_id = %task.id, "reminder expired past grace period");
                }
                report.expired += 1;
                Ok(())
            }
            ReminderDisposition::Due(payload) => {
                // The occurrence identity is the due time when present,
                // the reminder time otherwise.
                let key = occurrence_key(&task.id, payload.due_at.unwrap_or(payload.remind_at));
                match ledger.try_acquire(&key, now)? {
                    Acquire::AlreadyProcessed => {
                        report.duplicates += 1;
                        Ok(())
                    }
                    Acquire::Acquired => {
                        let notification = Notification::render(&payload);
                        match self.dispatch_with_retry(&notification) {
                            Ok(attempts) => {
                                self.storage.ledger().commit(&key, LedgerOutcome::Delivered, now)?;
                                report.sent += 1;
                                tracing::info!(
                                    task_id = %task.id,
                                    channel = self.delivery.channel(),
                                    attempts,
                                    "reminder sent"
                                );
                                Ok(())
                            }
                            Err(e) => {
                                // Permanent failure or exhausted retries:
                                // commit `failed` so the occurrence does
                                // not retry forever.
                                self.storage.ledger().commit(&key, LedgerOutcome::Failed, now)?;
                                report.failed += 1;
                                tracing::error!(task_id = %task.id, error = %e, "delivery failed");
                                Ok(())
                            }
                        }
                    }
                }
            }
        }
    }

    /// Dispatch with bounded exponential backoff on transient failures.
    /// Returns the number of attempts on success.
    fn dispatch_with_retry(
        &self,
        notification: &Notification,
    ) -> std::result::Result<u32, DeliveryError> {
        let max_attempts = self.settings.max_delivery_attempts;
        let mut attempt = 1u32;
        loop {
            match self.delivery.send(notification) {
                Ok(()) => return Ok(attempt),
                Err(e @ DeliveryError::Permanent(_)) => return Err(e),
                Err(DeliveryError::Transient(reason)) => {
                    if attempt >= max_attempts {
                        return Err(DeliveryError::Transient(format!(
                            "{} (after {} attempts)",
                            reason, attempt
                        )));
                    }
                    let delay = self.settings.retry_base_ms << (attempt - 1);
                    tracing::warn!(
                        task_id = %notification.task_id,
                        attempt,
                        delay_ms = delay,
                        reason = %reason,
                        "transient delivery failure, backing off"
                    );
                    thread::sleep(StdDuration::from_millis(delay));
                    attempt += 1;
                }
            }
        }
    }

    /// Handle one inbound event from the task service bus.
    ///
    /// Events are delivered at least once; the `event:<id>` ledger key
    /// collapses duplicates. A processing failure after acquisition
    /// releases the key so redelivery can retry, except for malformed
    /// rules, which are committed `failed` and never retried.
    pub fn handle_event(&mut self, event: &TaskEvent, now: DateTime<Utc>) -> Result<EventOutcome> {
        event.validate()?;

        let key = event_key(event.event_id());
        if self.storage.ledger().try_acquire(&key, now)? == Acquire::AlreadyProcessed {
            tracing::debug!(event_id = %event.event_id(), "duplicate event ignored");
            return Ok(EventOutcome {
                applied: false,
                occurrence_id: None,
            });
        }

        let applied = match event {
            TaskEvent::TaskCompleted {
                task_id,
                occurred_at,
                ..
            } => self.complete_task(task_id, *occurred_at),
            TaskEvent::TaskCreated { task_id, .. } | TaskEvent::TaskUpdated { task_id, .. } => {
                // Nothing to materialize; the poll path picks the task
                // up. Reject malformed schedules at the boundary.
                self.storage.get_task(task_id).and_then(|task| {
                    task.validate()?;
                    Ok(CompletionOutcome {
                        task_id: task_id.clone(),
                        occurrence_id: None,
                        rule_error: None,
                    })
                })
            }
        };

        match applied {
            Ok(outcome) => {
                self.storage.ledger().commit(&key, LedgerOutcome::Applied, now)?;
                Ok(EventOutcome {
                    applied: true,
                    occurrence_id: outcome.occurrence_id,
                })
            }
            Err(e @ (Error::InvalidRule(_) | Error::InvalidInput(_))) => {
                // Permanent: redelivering the same event cannot fix it.
                self.storage.ledger().commit(&key, LedgerOutcome::Failed, now)?;
                Err(e)
            }
            Err(e) => {
                self.storage.ledger().release(&key)?;
                Err(e)
            }
        }
    }

    /// Mark a task completed and, when it carries a valid rule, create
    /// the next occurrence.
    ///
    /// The occurrence is created only after the completion is recorded,
    /// never before, so occurrence N+1 cannot precede occurrence N's
    /// completion. Completing an already-completed task is a no-op.
    pub fn complete_task(
        &mut self,
        task_id: &str,
        when: DateTime<Utc>,
    ) -> Result<CompletionOutcome> {
        let task = self.storage.get_task(task_id)?;
        if task.completed {
            tracing::debug!(task_id, "task already completed");
            return Ok(CompletionOutcome {
                task_id: task_id.to_string(),
                occurrence_id: None,
                rule_error: None,
            });
        }

        let task = self.storage.mark_completed(task_id, when)?;

        let rule = match &task.recurrence {
            None => {
                return Ok(CompletionOutcome {
                    task_id: task.id,
                    occurrence_id: None,
                    rule_error: None,
                })
            }
            Some(rule) => rule,
        };

        if let Err(e) = rule.validate() {
            tracing::warn!(task_id = %task.id, error = %e, "invalid rule, no occurrence created");
            return Ok(CompletionOutcome {
                task_id: task.id.clone(),
                occurrence_id: None,
                rule_error: Some(e.to_string()),
            });
        }

        // Validated recurring tasks always carry a due time (the anchor).
        let anchor = task.due_at.ok_or_else(|| {
            Error::InvalidInput(format!("recurring task {} has no due time", task.id))
        })?;

        let (next_due, next_remind) =
            schedule::advance_pair(rule, anchor, task.remind_at, task.timezone)?;
        let occurrence = self.storage.create_occurrence(&task, next_due, next_remind)?;
        self.storage.bump_occurrences()?;

        tracing::info!(
            task_id = %task.id,
            occurrence_id = %occurrence.id,
            next_due = %next_due.to_rfc3339(),
            "occurrence created"
        );

        Ok(CompletionOutcome {
            task_id: task.id,
            occurrence_id: Some(occurrence.id),
            rule_error: None,
        })
    }

    /// Borrow the underlying storage (command-layer access).
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Mutably borrow the underlying storage (command-layer access).
    pub fn storage_mut(&mut self) -> &mut Storage {
        &mut self.storage
    }
}

fn occurrence_instant(task: &Task) -> Option<DateTime<Utc>> {
    // The due time is the canonical occurrence identity when present.
    task.due_at.or(task.remind_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::recurrence::RuleWeekday;
    use crate::models::Recurrence;
    use crate::test_utils::TestEnv;
    use chrono::{Duration, TimeZone};
    use std::sync::Mutex;

    /// Scripted delivery channel: pops one result per send, records calls.
    struct MockDelivery {
        script: Mutex<Vec<std::result::Result<(), DeliveryError>>>,
        sent: Mutex<Vec<Notification>>,
    }

    impl MockDelivery {
        fn ok() -> Self {
            Self::scripted(Vec::new())
        }

        /// `script` holds failures to emit before succeeding, in order.
        fn scripted(script: Vec<std::result::Result<(), DeliveryError>>) -> Self {
            Self {
                script: Mutex::new(script),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    impl Delivery for MockDelivery {
        fn send(&self, notification: &Notification) -> std::result::Result<(), DeliveryError> {
            let mut script = self.script.lock().unwrap();
            let result = if script.is_empty() {
                Ok(())
            } else {
                script.remove(0)
            };
            if result.is_ok() {
                self.sent.lock().unwrap().push(notification.clone());
            }
            result
        }

        fn channel(&self) -> &'static str {
            "mock"
        }
    }

    fn fast_settings() -> Settings {
        Settings {
            retry_base_ms: 1,
            ..Settings::default()
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 15, 9, 0, 0).unwrap()
    }

    fn due_task(id: &str) -> Task {
        let mut task = Task::new(id.to_string(), "user-1".to_string(), "Pay rent".to_string());
        task.remind_at = Some(now() - Duration::minutes(30));
        task.due_at = Some(now() + Duration::hours(1));
        task
    }

    fn coordinator_with(env: &TestEnv, delivery: MockDelivery) -> Coordinator {
        let storage = env.init_storage();
        Coordinator::new(storage, Box::new(delivery), fast_settings())
    }

    fn seed(coordinator: &mut Coordinator, task: &Task) {
        coordinator.storage_mut().insert_task(task).unwrap();
    }

    #[test]
    fn test_due_reminder_sent_once() {
        let env = TestEnv::new();
        let mut coordinator = coordinator_with(&env, MockDelivery::ok());
        seed(&mut coordinator, &due_task("kn-ab12"));

        let report = coordinator.run_cycle(now()).unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(report.errors, 0);

        // The same poll again: the ledger suppresses the duplicate.
        let report = coordinator.run_cycle(now() + Duration::minutes(5)).unwrap();
        assert_eq!(report.sent, 0);
        assert_eq!(report.duplicates, 1);
    }

    #[test]
    fn test_transient_failures_then_success() {
        let env = TestEnv::new();
        let delivery = MockDelivery::scripted(vec![
            Err(DeliveryError::Transient("timeout".to_string())),
            Err(DeliveryError::Transient("timeout".to_string())),
            Ok(()),
        ]);
        let mut coordinator = coordinator_with(&env, delivery);
        seed(&mut coordinator, &due_task("kn-ab12"));

        let report = coordinator.run_cycle(now()).unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(report.failed, 0);

        let key = occurrence_key("kn-ab12", due_task("kn-ab12").due_at.unwrap());
        let record = coordinator.storage().ledger().get(&key).unwrap().unwrap();
        assert_eq!(record.outcome, Some(LedgerOutcome::Delivered));
    }

    #[test]
    fn test_transient_exhaustion_commits_failed() {
        let env = TestEnv::new();
        let delivery = MockDelivery::scripted(vec![
            Err(DeliveryError::Transient("timeout".to_string())),
            Err(DeliveryError::Transient("timeout".to_string())),
            Err(DeliveryError::Transient("timeout".to_string())),
        ]);
        let mut coordinator = coordinator_with(&env, delivery);
        seed(&mut coordinator, &due_task("kn-ab12"));

        let report = coordinator.run_cycle(now()).unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.sent, 0);

        // Not retried on the next cycle.
        let report = coordinator.run_cycle(now() + Duration::minutes(5)).unwrap();
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.failed, 0);
    }

    #[test]
    fn test_permanent_failure_not_retried() {
        let env = TestEnv::new();
        let delivery = MockDelivery::scripted(vec![Err(DeliveryError::Permanent(
            "unknown recipient".to_string(),
        ))]);
        let mut coordinator = coordinator_with(&env, delivery);
        seed(&mut coordinator, &due_task("kn-ab12"));

        let report = coordinator.run_cycle(now()).unwrap();
        assert_eq!(report.failed, 1);

        let key = occurrence_key("kn-ab12", due_task("kn-ab12").due_at.unwrap());
        let record = coordinator.storage().ledger().get(&key).unwrap().unwrap();
        assert_eq!(record.outcome, Some(LedgerOutcome::Failed));
    }

    #[test]
    fn test_expired_reminder_marked_without_sending() {
        let env = TestEnv::new();
        let mut coordinator = coordinator_with(&env, MockDelivery::ok());

        let mut task = due_task("kn-ab12");
        task.remind_at = Some(now() - Duration::days(10));
        task.due_at = Some(now() - Duration::days(9));
        seed(&mut coordinator, &task);

        let report = coordinator.run_cycle(now()).unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(report.sent, 0);

        let key = occurrence_key("kn-ab12", task.due_at.unwrap());
        let record = coordinator.storage().ledger().get(&key).unwrap().unwrap();
        assert_eq!(record.outcome, Some(LedgerOutcome::Expired));
    }

    #[test]
    fn test_malformed_rule_isolated_from_batch() {
        let env = TestEnv::new();
        let mut coordinator = coordinator_with(&env, MockDelivery::ok());

        let mut broken = due_task("kn-1111");
        broken.recurrence = Some(Recurrence::Weekly {
            interval: 1,
            weekdays: Default::default(),
        });
        seed(&mut coordinator, &broken);
        seed(&mut coordinator, &due_task("kn-2222"));

        let report = coordinator.run_cycle(now()).unwrap();
        assert_eq!(report.errors, 1);
        assert_eq!(report.sent, 1);
    }

    #[test]
    fn test_ledger_outage_fails_closed() {
        let env = TestEnv::new();
        let mut coordinator = coordinator_with(&env, MockDelivery::ok());
        seed(&mut coordinator, &due_task("kn-ab12"));

        coordinator.storage().break_ledger();
        assert!(matches!(
            coordinator.run_cycle(now()),
            Err(Error::LedgerUnavailable(_))
        ));
    }

    #[test]
    fn test_completion_creates_next_occurrence() {
        let env = TestEnv::new();
        let mut coordinator = coordinator_with(&env, MockDelivery::ok());

        // Due Thu 2026-01-15 09:00 UTC, weekly on Mon+Wed.
        let mut task = due_task("kn-ab12");
        task.due_at = Some(Utc.with_ymd_and_hms(2026, 1, 15, 9, 0, 0).unwrap());
        task.remind_at = Some(Utc.with_ymd_and_hms(2026, 1, 15, 8, 0, 0).unwrap());
        task.recurrence = Some(Recurrence::Weekly {
            interval: 1,
            weekdays: [RuleWeekday::Mon, RuleWeekday::Wed].into_iter().collect(),
        });
        seed(&mut coordinator, &task);

        let outcome = coordinator.complete_task("kn-ab12", now()).unwrap();
        let occurrence_id = outcome.occurrence_id.unwrap();

        let occurrence = coordinator.storage().get_task(&occurrence_id).unwrap();
        assert_eq!(
            occurrence.due_at,
            Some(Utc.with_ymd_and_hms(2026, 1, 19, 9, 0, 0).unwrap())
        );
        assert_eq!(
            occurrence.remind_at,
            Some(Utc.with_ymd_and_hms(2026, 1, 19, 8, 0, 0).unwrap())
        );
        assert_eq!(occurrence.parent_id.as_deref(), Some("kn-ab12"));
        assert!(!occurrence.completed);

        // Completing again is a no-op: no second occurrence.
        let outcome = coordinator.complete_task("kn-ab12", now()).unwrap();
        assert!(outcome.occurrence_id.is_none());
    }

    #[test]
    fn test_completed_event_applied_exactly_once() {
        let env = TestEnv::new();
        let mut coordinator = coordinator_with(&env, MockDelivery::ok());

        let mut task = due_task("kn-ab12");
        task.recurrence = Some(Recurrence::Daily { interval: 1 });
        seed(&mut coordinator, &task);

        let event = TaskEvent::completed("kn-ab12", now());
        let first = coordinator.handle_event(&event, now()).unwrap();
        assert!(first.applied);
        assert!(first.occurrence_id.is_some());

        // Redelivery of the same event: suppressed, no second occurrence.
        let second = coordinator.handle_event(&event, now()).unwrap();
        assert!(!second.applied);
        assert!(second.occurrence_id.is_none());

        let open = coordinator
            .storage()
            .list_tasks(Some(false), None, None)
            .unwrap();
        assert_eq!(open.len(), 1);
    }

    #[test]
    fn test_event_for_missing_task_releases_key() {
        let env = TestEnv::new();
        let mut coordinator = coordinator_with(&env, MockDelivery::ok());

        let event = TaskEvent::completed("kn-0000", now());
        assert!(coordinator.handle_event(&event, now()).is_err());

        // The key was released, so redelivery retries the work.
        let key = event_key(event.event_id());
        assert!(coordinator.storage().ledger().get(&key).unwrap().is_none());
    }

    #[test]
    fn test_completion_with_invalid_rule_flags_without_occurrence() {
        let env = TestEnv::new();
        let mut coordinator = coordinator_with(&env, MockDelivery::ok());

        let mut task = due_task("kn-ab12");
        task.recurrence = Some(Recurrence::Daily { interval: 0 });
        seed(&mut coordinator, &task);

        let outcome = coordinator.complete_task("kn-ab12", now()).unwrap();
        assert!(outcome.occurrence_id.is_none());
        assert!(outcome.rule_error.is_some());
        assert!(coordinator.storage().get_task("kn-ab12").unwrap().completed);
    }
}
