//! Delivery channel boundary.
//!
//! The scheduling core does not know how a reminder reaches the owner;
//! it hands a rendered `Notification` to a `Delivery` implementation and
//! branches only on whether a failure is worth retrying. SMTP, websocket
//! broadcast, and event republish all live behind this trait in their
//! respective services; this crate ships a webhook channel for handing
//! notifications to such a service, and a log channel for dry runs.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::schedule::ReminderPayload;
use crate::schedule::reminder::format_local;

/// A reminder rendered for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub task_id: String,
    pub owner: String,
    pub subject: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_at: Option<chrono::DateTime<chrono::Utc>>,
    pub remind_at: chrono::DateTime<chrono::Utc>,
}

impl Notification {
    /// Render a notification from a resolved reminder payload.
    pub fn render(payload: &ReminderPayload) -> Self {
        Self {
            task_id: payload.task_id.clone(),
            owner: payload.owner.clone(),
            subject: format!("Reminder: {}", payload.title),
            body: render_body(payload),
            due_at: payload.due_at,
            remind_at: payload.remind_at,
        }
    }
}

/// Plain-text body for a reminder.
fn render_body(payload: &ReminderPayload) -> String {
    let mut body = format!("Your task \"{}\" ", payload.title);
    match &payload.local_due {
        Some(local) => body.push_str(&format!("is due {}.", local)),
        None => body.push_str(&format!(
            "has a reminder set for {}.",
            format_local(payload.remind_at, payload.timezone)
        )),
    }
    body.push_str(&format!("\nPriority: {}", payload.priority));
    if let Some(description) = &payload.description {
        body.push_str(&format!("\n\n{}", description));
    }
    body
}

/// Delivery failure, split by retry policy.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// Timeout or connection failure; worth retrying with backoff.
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// The request itself is unacceptable (bad recipient, rejected
    /// payload); retrying cannot help.
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

/// A channel that can deliver notifications.
pub trait Delivery: Send {
    /// Deliver one notification.
    fn send(&self, notification: &Notification) -> std::result::Result<(), DeliveryError>;

    /// Channel name for logging and the ledger outcome note.
    fn channel(&self) -> &'static str;
}

/// POSTs notifications as JSON to a notification service endpoint.
pub struct WebhookDelivery {
    agent: ureq::Agent,
    url: String,
}

impl WebhookDelivery {
    /// Create a webhook channel with a per-request timeout.
    pub fn new(url: String, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout(timeout)
            .build();
        Self { agent, url }
    }
}

impl Delivery for WebhookDelivery {
    fn send(&self, notification: &Notification) -> std::result::Result<(), DeliveryError> {
        let response = self.agent.post(&self.url).send_json(notification);

        match response {
            Ok(_) => Ok(()),
            // Throttling and server-side trouble are retryable; other
            // 4xx responses mean the request will never be accepted.
            Err(ureq::Error::Status(code, _)) if code == 408 || code == 429 || code >= 500 => {
                Err(DeliveryError::Transient(format!("HTTP {}", code)))
            }
            Err(ureq::Error::Status(code, _)) => {
                Err(DeliveryError::Permanent(format!("HTTP {}", code)))
            }
            Err(ureq::Error::Transport(e)) => Err(DeliveryError::Transient(e.to_string())),
        }
    }

    fn channel(&self) -> &'static str {
        "webhook"
    }
}

/// Renders notifications into the log stream. Used when no webhook is
/// configured, and for dry runs.
#[derive(Debug, Default)]
pub struct LogDelivery;

impl Delivery for LogDelivery {
    fn send(&self, notification: &Notification) -> std::result::Result<(), DeliveryError> {
        tracing::info!(
            task_id = %notification.task_id,
            owner = %notification.owner,
            subject = %notification.subject,
            "reminder notification"
        );
        Ok(())
    }

    fn channel(&self) -> &'static str {
        "log"
    }
}
