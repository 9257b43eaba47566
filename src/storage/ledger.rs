//! Idempotency ledger: at-most-once execution of side effects.
//!
//! Every side effect the coordinator performs is identified by a key
//! derived from business-stable facts (task id + occurrence due time, or
//! an inbound event's unique id). `try_acquire` is a single constrained
//! INSERT, so under concurrent or duplicate delivery exactly one caller
//! wins the key; everyone else observes `AlreadyProcessed`.
//!
//! Any storage failure other than the constraint violation maps to
//! `Error::LedgerUnavailable`: when the ledger cannot be consulted the
//! agent fails closed and performs nothing.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use crate::{Error, Result};

use super::Storage;

/// Result of attempting to claim a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// The key was free; the caller owns the side effect.
    Acquired,
    /// The key exists; some caller already handled (or is handling) it.
    AlreadyProcessed,
}

/// Terminal outcome recorded when a key is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOutcome {
    /// Notification handed to the delivery channel.
    Delivered,
    /// Delivery failed permanently; not retried again.
    Failed,
    /// Grace period lapsed; skipped without sending.
    Expired,
    /// Event-path side effect (completion, occurrence creation) applied.
    Applied,
}

impl LedgerOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerOutcome::Delivered => "delivered",
            LedgerOutcome::Failed => "failed",
            LedgerOutcome::Expired => "expired",
            LedgerOutcome::Applied => "applied",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "delivered" => Some(LedgerOutcome::Delivered),
            "failed" => Some(LedgerOutcome::Failed),
            "expired" => Some(LedgerOutcome::Expired),
            "applied" => Some(LedgerOutcome::Applied),
            _ => None,
        }
    }
}

/// A ledger row, as read back for inspection and tests.
#[derive(Debug, Clone)]
pub struct LedgerRecord {
    pub key: String,
    /// "processing" while a side effect is in flight, "done" afterwards.
    pub state: String,
    pub outcome: Option<LedgerOutcome>,
    pub acquired_at: DateTime<Utc>,
    pub committed_at: Option<DateTime<Utc>>,
}

/// Ledger view over the storage connection.
pub struct Ledger<'a> {
    conn: &'a Connection,
}

impl Storage {
    /// Access the idempotency ledger.
    pub fn ledger(&self) -> Ledger<'_> {
        Ledger { conn: &self.conn }
    }
}

impl Ledger<'_> {
    /// Atomically claim `key`, inserting an in-flight marker.
    ///
    /// The insert and the existence check are one statement; the primary
    /// key constraint is what arbitrates between concurrent workers.
    pub fn try_acquire(&self, key: &str, now: DateTime<Utc>) -> Result<Acquire> {
        let inserted = self.conn.execute(
            "INSERT INTO ledger (key, state, acquired_at) VALUES (?1, 'processing', ?2)",
            params![key, now.to_rfc3339()],
        );
        match inserted {
            Ok(_) => Ok(Acquire::Acquired),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                Ok(Acquire::AlreadyProcessed)
            }
            Err(e) => Err(Error::LedgerUnavailable(e.to_string())),
        }
    }

    /// Mark `key` done with the given outcome. Idempotent.
    pub fn commit(&self, key: &str, outcome: LedgerOutcome, now: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO ledger (key, state, outcome, acquired_at, committed_at)
                 VALUES (?1, 'done', ?2, ?3, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                     state = 'done', outcome = ?2, committed_at = ?3",
                params![key, outcome.as_str(), now.to_rfc3339()],
            )
            .map_err(|e| Error::LedgerUnavailable(e.to_string()))?;
        Ok(())
    }

    /// Remove an in-flight marker so the occurrence can be retried later.
    ///
    /// Only the transient "processing" state is released; a committed
    /// record is the at-most-once guarantee and is never removed here.
    pub fn release(&self, key: &str) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM ledger WHERE key = ?1 AND state = 'processing'",
                params![key],
            )
            .map_err(|e| Error::LedgerUnavailable(e.to_string()))?;
        Ok(())
    }

    /// Read a record back.
    pub fn get(&self, key: &str) -> Result<Option<LedgerRecord>> {
        self.conn
            .query_row(
                "SELECT key, state, outcome, acquired_at, committed_at FROM ledger WHERE key = ?1",
                params![key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| Error::LedgerUnavailable(e.to_string()))?
            .map(|(key, state, outcome, acquired_at, committed_at)| {
                Ok(LedgerRecord {
                    key,
                    state,
                    outcome: outcome.as_deref().and_then(LedgerOutcome::parse),
                    acquired_at: super::parse_instant(&acquired_at)?,
                    committed_at: committed_at
                        .as_deref()
                        .map(super::parse_instant)
                        .transpose()?,
                })
            })
            .transpose()
    }

    /// Purge records older than `cutoff`: terminal records by commit
    /// time, and stale in-flight markers (a worker that died between
    /// acquire and commit) by acquire time. Returns the number removed.
    pub fn sweep(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM ledger
                 WHERE (state = 'done' AND committed_at < ?1)
                    OR (state = 'processing' AND acquired_at < ?1)",
                params![cutoff.to_rfc3339()],
            )
            .map_err(|e| Error::LedgerUnavailable(e.to_string()))?;
        Ok(removed)
    }
}

/// Idempotency key for a reminder occurrence, derived from the task and
/// the occurrence's canonical instant.
pub fn occurrence_key(task_id: &str, occurrence_at: DateTime<Utc>) -> String {
    format!("task:{}:occ:{}", task_id, occurrence_at.to_rfc3339())
}

/// Idempotency key for an inbound event.
pub fn event_key(event_id: &str) -> String {
    format!("event:{}", event_id)
}
