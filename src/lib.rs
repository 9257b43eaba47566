//! Knell - A reminder scheduling and recurrence agent for task services.
//!
//! This library provides the core functionality for the `kn` CLI tool:
//! deciding when a task's reminder is due, advancing recurring tasks to
//! their next occurrence, and guaranteeing at-most-once delivery per
//! logical occurrence through a persistent idempotency ledger.

pub mod cli;
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod delivery;
pub mod models;
pub mod schedule;
pub mod storage;


/// Library-level error type for Knell operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Not initialized: run `kn system init` first")]
    NotInitialized,

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Invalid ID format: {0}")]
    InvalidId(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid recurrence rule: {0}")]
    InvalidRule(String),

    #[error("Invalid event payload: {0}")]
    InvalidEvent(String),

    #[error("Idempotency ledger unavailable: {0}")]
    LedgerUnavailable(String),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for Knell operations.
pub type Result<T> = std::result::Result<T, Error>;
