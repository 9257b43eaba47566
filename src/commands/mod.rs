//! Command implementations for the Knell CLI.
//!
//! Each command returns a result struct that renders either as JSON
//! (the default, machine-readable) or as human-readable text via the
//! `Render` trait; `main` picks the format.

use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use crate::config::Settings;
use crate::coordinator::{CompletionOutcome, Coordinator, CycleReport, EventOutcome};
use crate::delivery::{Delivery, LogDelivery, WebhookDelivery};
use crate::models::{AgentState, Priority, Recurrence, Task, TaskEvent};
use crate::schedule;
use crate::schedule::reminder::format_local;
use crate::storage::{generate_id, validate_task_id, Storage};
use crate::{Error, Result};

/// Command results that can be serialized to JSON or formatted for humans.
pub trait Render {
    /// Serialize to JSON string.
    fn to_json(&self) -> String;

    /// Format for human-readable output.
    fn to_human(&self) -> String;
}

fn json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| format!(r#"{{"error":"{}"}}"#, e))
}

// === system ===

#[derive(Debug, Serialize)]
pub struct InitResult {
    pub initialized: bool,
    pub path: String,
}

impl Render for InitResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if self.initialized {
            format!("Initialized knell data directory at {}", self.path)
        } else {
            format!("Already initialized at {}", self.path)
        }
    }
}

/// Initialize the data directory and database.
pub fn system_init(data_dir: &Path) -> Result<InitResult> {
    let existed = Storage::exists(data_dir);
    Storage::init(data_dir)?;
    Ok(InitResult {
        initialized: !existed,
        path: data_dir.display().to_string(),
    })
}

// === task ===

/// Arguments for `kn task add`.
#[derive(Debug, Default)]
pub struct TaskAddArgs {
    pub title: String,
    pub owner: String,
    pub description: Option<String>,
    pub priority: Option<String>,
    pub tags: Vec<String>,
    pub timezone: Option<String>,
    pub due: Option<String>,
    pub remind: Option<String>,
    pub every: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TaskResult {
    #[serde(flatten)]
    pub task: Task,
}

impl Render for TaskResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let task = &self.task;
        let mut out = format!("{}  {} [{}]", task.id, task.title, task.priority);
        if let Some(due) = task.due_at {
            out.push_str(&format!("\n  due:    {}", format_local(due, task.timezone)));
        }
        if let Some(remind) = task.remind_at {
            out.push_str(&format!("\n  remind: {}", format_local(remind, task.timezone)));
        }
        if let Some(rule) = &task.recurrence {
            out.push_str(&format!("\n  repeats: {}", rule));
        }
        if let Some(parent) = &task.parent_id {
            out.push_str(&format!("\n  occurrence of: {}", parent));
        }
        if task.completed {
            out.push_str("\n  completed");
        }
        out
    }
}

/// Create a task.
pub fn task_add(data_dir: &Path, args: TaskAddArgs) -> Result<TaskResult> {
    let mut storage = Storage::open(data_dir)?;

    let timezone = match &args.timezone {
        None => chrono_tz::UTC,
        Some(name) => Tz::from_str(name)
            .map_err(|_| Error::InvalidInput(format!("unknown timezone: {}", name)))?,
    };

    let mut task = Task::new(generate_id("kn", &args.title), args.owner, args.title);
    task.description = args.description;
    task.tags = args.tags;
    task.timezone = timezone;
    if let Some(p) = &args.priority {
        task.priority = Priority::parse(p)
            .ok_or_else(|| Error::InvalidInput(format!("invalid priority: {}", p)))?;
    }
    task.due_at = args
        .due
        .as_deref()
        .map(|s| parse_instant_in(s, timezone))
        .transpose()?;
    task.remind_at = args
        .remind
        .as_deref()
        .map(|s| parse_instant_in(s, timezone))
        .transpose()?;
    task.recurrence = args
        .every
        .as_deref()
        .map(Recurrence::parse_spec)
        .transpose()?;

    task.validate()?;
    storage.insert_task(&task)?;
    Ok(TaskResult { task })
}

#[derive(Debug, Serialize)]
pub struct TaskListResult {
    pub tasks: Vec<Task>,
}

impl Render for TaskListResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if self.tasks.is_empty() {
            return "No tasks".to_string();
        }
        self.tasks
            .iter()
            .map(|t| {
                let due = t
                    .due_at
                    .map(|d| format_local(d, t.timezone))
                    .unwrap_or_else(|| "-".to_string());
                let marker = if t.completed { "x" } else { " " };
                format!("[{}] {}  {}  due: {}", marker, t.id, t.title, due)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// List tasks. Open tasks only unless `all` is set.
pub fn task_list(
    data_dir: &Path,
    all: bool,
    owner: Option<&str>,
    tag: Option<&str>,
) -> Result<TaskListResult> {
    let storage = Storage::open(data_dir)?;
    let completed = if all { None } else { Some(false) };
    let tasks = storage.list_tasks(completed, owner, tag)?;
    Ok(TaskListResult { tasks })
}

/// Show a single task.
pub fn task_show(data_dir: &Path, id: &str) -> Result<TaskResult> {
    validate_task_id(id)?;
    let storage = Storage::open(data_dir)?;
    Ok(TaskResult {
        task: storage.get_task(id)?,
    })
}

#[derive(Debug, Serialize)]
pub struct DoneResult {
    #[serde(flatten)]
    pub outcome: CompletionOutcome,
}

impl Render for DoneResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut out = format!("Completed {}", self.outcome.task_id);
        if let Some(occurrence) = &self.outcome.occurrence_id {
            out.push_str(&format!("\nNext occurrence: {}", occurrence));
        }
        if let Some(error) = &self.outcome.rule_error {
            out.push_str(&format!("\nWarning: {}", error));
        }
        out
    }
}

/// Complete a task; recurring tasks get their next occurrence.
pub fn task_done(data_dir: &Path, id: &str) -> Result<DoneResult> {
    validate_task_id(id)?;
    let mut coordinator = build_coordinator(data_dir)?;
    let outcome = coordinator.complete_task(id, Utc::now())?;
    Ok(DoneResult { outcome })
}

#[derive(Debug, Serialize)]
pub struct RemoveResult {
    pub removed: String,
}

impl Render for RemoveResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        format!("Removed {}", self.removed)
    }
}

/// Delete a task.
pub fn task_rm(data_dir: &Path, id: &str) -> Result<RemoveResult> {
    validate_task_id(id)?;
    let mut storage = Storage::open(data_dir)?;
    storage.delete_task(id)?;
    Ok(RemoveResult {
        removed: id.to_string(),
    })
}

#[derive(Debug, Serialize)]
pub struct NextResult {
    pub task_id: String,
    pub occurrences: Vec<OccurrencePreview>,
}

#[derive(Debug, Serialize)]
pub struct OccurrencePreview {
    pub due_at: DateTime<Utc>,
    pub local: String,
}

impl Render for NextResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut out = format!("Next occurrences of {}:", self.task_id);
        for occurrence in &self.occurrences {
            out.push_str(&format!("\n  {}", occurrence.local));
        }
        out
    }
}

/// Preview the next `count` occurrences of a recurring task.
pub fn task_next(data_dir: &Path, id: &str, count: usize) -> Result<NextResult> {
    validate_task_id(id)?;
    let storage = Storage::open(data_dir)?;
    let task = storage.get_task(id)?;

    let rule = task
        .recurrence
        .as_ref()
        .ok_or_else(|| Error::InvalidInput(format!("task {} has no recurrence rule", id)))?;
    let anchor = task
        .due_at
        .ok_or_else(|| Error::InvalidInput(format!("task {} has no due time", id)))?;

    let occurrences = schedule::nth_following(rule, anchor, task.timezone, count)?
        .into_iter()
        .map(|due_at| OccurrencePreview {
            due_at,
            local: format_local(due_at, task.timezone),
        })
        .collect();

    Ok(NextResult {
        task_id: task.id,
        occurrences,
    })
}

// === agent ===

impl Render for CycleReport {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        format!(
            "Cycle: {} scanned, {} sent, {} not due, {} duplicates, {} expired, {} failed, {} errors",
            self.scanned, self.sent, self.not_due, self.duplicates, self.expired, self.failed,
            self.errors
        )
    }
}

/// Run one scheduling cycle.
pub fn agent_tick(data_dir: &Path) -> Result<CycleReport> {
    let mut coordinator = build_coordinator(data_dir)?;
    coordinator.run_cycle(Utc::now())
}

/// Run the poll loop until interrupted.
pub fn agent_run(data_dir: &Path) -> Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .map_err(|e| Error::Other(format!("failed to install signal handler: {}", e)))?;

    let mut coordinator = build_coordinator(data_dir)?;
    coordinator.run_loop(shutdown)
}

#[derive(Debug, Serialize)]
pub struct StatusResult {
    #[serde(flatten)]
    pub state: AgentState,
    pub build_commit: &'static str,
    pub build_timestamp: &'static str,
}

impl Render for StatusResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let last_cycle = self
            .state
            .last_cycle_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        let mut out = format!(
            "Last cycle:    {}\nCycles run:    {}\nProcessed:     {}\nSent:          {}\nOccurrences:   {}\nErrors:        {}",
            last_cycle,
            self.state.cycles_run,
            self.state.tasks_processed,
            self.state.reminders_sent,
            self.state.occurrences_created,
            self.state.errors_count,
        );
        if let Some(error) = &self.state.last_error {
            out.push_str(&format!("\nLast error:    {}", error));
        }
        out
    }
}

/// Report agent health for external monitoring.
pub fn agent_status(data_dir: &Path) -> Result<StatusResult> {
    let storage = Storage::open(data_dir)?;
    Ok(StatusResult {
        state: storage.agent_state()?,
        build_commit: env!("KN_GIT_COMMIT"),
        build_timestamp: env!("KN_BUILD_TIMESTAMP"),
    })
}

// === event ===

impl Render for EventOutcome {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if !self.applied {
            return "Duplicate event, ignored".to_string();
        }
        match &self.occurrence_id {
            Some(id) => format!("Event applied; next occurrence {}", id),
            None => "Event applied".to_string(),
        }
    }
}

/// Feed one event envelope through the push path.
pub fn event_submit(data_dir: &Path, payload: &str) -> Result<EventOutcome> {
    let event = TaskEvent::from_json(payload)?;
    let mut coordinator = build_coordinator(data_dir)?;
    coordinator.handle_event(&event, Utc::now())
}

// === ledger ===

#[derive(Debug, Serialize)]
pub struct SweepResult {
    pub removed: usize,
    pub cutoff: DateTime<Utc>,
}

impl Render for SweepResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        format!(
            "Removed {} ledger records older than {}",
            self.removed, self.cutoff
        )
    }
}

/// Purge ledger records past the retention window.
pub fn ledger_sweep(data_dir: &Path) -> Result<SweepResult> {
    let storage = Storage::open(data_dir)?;
    let settings = Settings::load(data_dir)?;
    let cutoff = Utc::now() - settings.ledger_retention();
    let removed = storage.ledger().sweep(cutoff)?;
    Ok(SweepResult { removed, cutoff })
}

// === helpers ===

fn build_coordinator(data_dir: &Path) -> Result<Coordinator> {
    let storage = Storage::open(data_dir)?;
    let settings = Settings::load(data_dir)?;
    let delivery: Box<dyn Delivery> = match &settings.webhook_url {
        Some(url) => Box::new(WebhookDelivery::new(
            url.clone(),
            StdDuration::from_secs(settings.dispatch_timeout_secs),
        )),
        None => Box::new(LogDelivery),
    };
    Ok(Coordinator::new(storage, delivery, settings))
}

/// Parse a user-supplied instant.
///
/// Accepts RFC 3339 (offset preserved, converted to UTC) or a naive
/// `YYYY-MM-DD HH:MM` interpreted in the task's timezone.
fn parse_instant_in(s: &str, tz: Tz) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").map_err(|_| {
        Error::InvalidInput(format!(
            "invalid datetime: {} (expected RFC 3339 or 'YYYY-MM-DD HH:MM')",
            s
        ))
    })?;
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earlier, _) => Ok(earlier.with_timezone(&Utc)),
        LocalResult::None => {
            // Spring-forward gap: nudge forward the same way the
            // recurrence calculator does.
            let shifted = naive + Duration::hours(1);
            match tz.from_local_datetime(&shifted) {
                LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => {
                    Ok(dt.with_timezone(&Utc))
                }
                LocalResult::None => Err(Error::InvalidInput(format!(
                    "datetime {} does not exist in {}",
                    s, tz
                ))),
            }
        }
    }
}
