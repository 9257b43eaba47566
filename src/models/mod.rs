//! Data models for Knell entities.
//!
//! This module defines the core data structures:
//! - `Task` - Work items with due/reminder instants and an optional recurrence rule
//! - `Recurrence` - Repeat patterns (daily, weekly, monthly)
//! - `TaskEvent` - Inbound events from the task service bus
//! - `AgentState` - Health counters for the scheduling agent

pub mod event;
pub mod recurrence;

pub use event::TaskEvent;
pub use recurrence::Recurrence;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Result};

/// Task priority level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    /// Parse from string, case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Priority::Low),
            "medium" | "med" => Some(Priority::Medium),
            "high" => Some(Priority::High),
            _ => None,
        }
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A task tracked by the scheduling agent.
///
/// Tasks are owned by the external task service; the agent reads them,
/// marks completions, and materializes occurrences of recurring tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier (e.g., "kn-a1b2")
    pub id: String,

    /// Owner identifier (user the reminder is addressed to)
    pub owner: String,

    /// Task title
    pub title: String,

    /// Detailed description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Priority level
    #[serde(default)]
    pub priority: Priority,

    /// Tags for categorization
    #[serde(default)]
    pub tags: Vec<String>,

    /// IANA timezone the task's wall-clock times are anchored in
    pub timezone: Tz,

    /// Due instant (UTC)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,

    /// Reminder instant (UTC); must precede `due_at` when both are set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remind_at: Option<DateTime<Utc>>,

    /// Recurrence rule; absent for one-shot tasks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<Recurrence>,

    /// Whether the task has been completed
    #[serde(default)]
    pub completed: bool,

    /// Completion timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Parent task ID; set on occurrences generated from a recurring task
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new task with the given ID, owner, and title.
    ///
    /// Times default to unset and the timezone to UTC.
    pub fn new(id: String, owner: String, title: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner,
            title,
            description: None,
            priority: Priority::default(),
            tags: Vec::new(),
            timezone: chrono_tz::UTC,
            due_at: None,
            remind_at: None,
            recurrence: None,
            completed: false,
            completed_at: None,
            parent_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this task carries a recurrence rule.
    pub fn is_recurring(&self) -> bool {
        self.recurrence.is_some()
    }

    /// Validate the task's scheduling fields.
    ///
    /// Enforced invariants:
    /// - `remind_at < due_at` when both are set
    /// - a recurrence rule requires `due_at` (recurrence anchors on the due time)
    /// - the rule itself must be well-formed
    pub fn validate(&self) -> Result<()> {
        if let (Some(remind), Some(due)) = (self.remind_at, self.due_at) {
            if remind >= due {
                return Err(Error::InvalidInput(format!(
                    "reminder time {} must precede due time {}",
                    remind.to_rfc3339(),
                    due.to_rfc3339()
                )));
            }
        }
        if let Some(rule) = &self.recurrence {
            if self.due_at.is_none() {
                return Err(Error::InvalidInput(
                    "recurring tasks require a due time".to_string(),
                ));
            }
            rule.validate()?;
        }
        Ok(())
    }
}

/// Health counters for the scheduling agent.
///
/// Mutated only by the coordinator at the end of each cycle; read by
/// `kn agent status` for external monitoring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentState {
    /// Timestamp of the last completed cycle
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cycle_at: Option<DateTime<Utc>>,

    /// Last cycle-level error, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Total cycles run
    pub cycles_run: u64,

    /// Total candidate tasks examined
    pub tasks_processed: u64,

    /// Total reminders delivered
    pub reminders_sent: u64,

    /// Total occurrences materialized from recurring tasks
    pub occurrences_created: u64,

    /// Total per-item errors encountered
    pub errors_count: u64,
}
