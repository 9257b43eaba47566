//! Inbound event envelope from the task service bus.
//!
//! Events arrive with at-least-once delivery; the `event_id` carried in
//! every envelope is the idempotency key input for the push path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Envelope schema version this agent understands.
pub const SCHEMA_VERSION: &str = "1.0";

/// An event published by the task service.
///
/// Closed set of variants; payloads with an unknown `event_type` or a
/// missing required field are rejected at the boundary rather than
/// defaulted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum TaskEvent {
    /// A task was completed by its owner.
    #[serde(rename = "task.completed")]
    TaskCompleted {
        event_id: String,
        schema_version: String,
        task_id: String,
        occurred_at: DateTime<Utc>,
    },
    /// A task was created.
    #[serde(rename = "task.created")]
    TaskCreated {
        event_id: String,
        schema_version: String,
        task_id: String,
        occurred_at: DateTime<Utc>,
    },
    /// A task's schedule or rule was edited.
    #[serde(rename = "task.updated")]
    TaskUpdated {
        event_id: String,
        schema_version: String,
        task_id: String,
        occurred_at: DateTime<Utc>,
    },
}

impl TaskEvent {
    /// Parse and validate an event envelope from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let event: TaskEvent = serde_json::from_str(json)
            .map_err(|e| Error::InvalidEvent(format!("malformed envelope: {}", e)))?;
        event.validate()?;
        Ok(event)
    }

    /// Validate required fields and the schema version.
    pub fn validate(&self) -> Result<()> {
        if self.event_id().is_empty() {
            return Err(Error::InvalidEvent("empty event_id".to_string()));
        }
        if self.task_id().is_empty() {
            return Err(Error::InvalidEvent("empty task_id".to_string()));
        }
        if self.schema_version() != SCHEMA_VERSION {
            return Err(Error::InvalidEvent(format!(
                "unsupported schema version: {}",
                self.schema_version()
            )));
        }
        Ok(())
    }

    /// The unique event identifier (idempotency key input).
    pub fn event_id(&self) -> &str {
        match self {
            TaskEvent::TaskCompleted { event_id, .. }
            | TaskEvent::TaskCreated { event_id, .. }
            | TaskEvent::TaskUpdated { event_id, .. } => event_id,
        }
    }

    /// The task the event refers to.
    pub fn task_id(&self) -> &str {
        match self {
            TaskEvent::TaskCompleted { task_id, .. }
            | TaskEvent::TaskCreated { task_id, .. }
            | TaskEvent::TaskUpdated { task_id, .. } => task_id,
        }
    }

    /// When the event occurred at the producer.
    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            TaskEvent::TaskCompleted { occurred_at, .. }
            | TaskEvent::TaskCreated { occurred_at, .. }
            | TaskEvent::TaskUpdated { occurred_at, .. } => *occurred_at,
        }
    }

    /// The declared envelope schema version.
    pub fn schema_version(&self) -> &str {
        match self {
            TaskEvent::TaskCompleted { schema_version, .. }
            | TaskEvent::TaskCreated { schema_version, .. }
            | TaskEvent::TaskUpdated { schema_version, .. } => schema_version,
        }
    }

    /// Build a completion event with a fresh UUID, for producers and tests.
    pub fn completed(task_id: &str, occurred_at: DateTime<Utc>) -> Self {
        TaskEvent::TaskCompleted {
            event_id: uuid::Uuid::new_v4().to_string(),
            schema_version: SCHEMA_VERSION.to_string(),
            task_id: task_id.to_string(),
            occurred_at,
        }
    }
}
