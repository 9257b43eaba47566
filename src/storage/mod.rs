//! Storage layer for Knell data.
//!
//! This module handles persistence of tasks, the idempotency ledger, and
//! agent health state. Everything lives in a single SQLite database
//! (`knell.db`) under the data directory: the scheduling queries (due
//! windows) and the ledger's atomic insert-if-absent both want indexed,
//! transactional access, and SQLite's unique-constraint semantics are
//! what makes `try_acquire` safe across concurrent agent processes.

pub mod ledger;

pub use ledger::{occurrence_key, event_key, Acquire, Ledger, LedgerOutcome, LedgerRecord};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::models::{AgentState, Priority, Recurrence, Task};
use crate::{Error, Result};

/// Storage manager for a single data directory.
pub struct Storage {
    /// Root data directory
    pub root: PathBuf,
    /// SQLite connection
    conn: Connection,
}

impl Storage {
    /// Open existing storage in the given data directory.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let db_path = data_dir.join("knell.db");
        if !db_path.exists() {
            return Err(Error::NotInitialized);
        }

        let conn = Connection::open(&db_path)?;
        Self::init_schema(&conn)?;

        Ok(Self {
            root: data_dir.to_path_buf(),
            conn,
        })
    }

    /// Initialize storage in the given data directory, creating it if needed.
    pub fn init(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join("knell.db");
        let conn = Connection::open(&db_path)?;
        Self::init_schema(&conn)?;

        Ok(Self {
            root: data_dir.to_path_buf(),
            conn,
        })
    }

    /// Check if storage exists in the given data directory.
    pub fn exists(data_dir: &Path) -> bool {
        data_dir.join("knell.db").exists()
    }

    /// Initialize the SQLite schema.
    fn init_schema(conn: &Connection) -> Result<()> {
        // Multiple agent instances may share this database; keep writers
        // queued instead of failing fast on lock contention.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                priority TEXT NOT NULL DEFAULT 'medium',
                timezone TEXT NOT NULL DEFAULT 'UTC',
                due_at TEXT,
                remind_at TEXT,
                recurrence TEXT,
                completed INTEGER NOT NULL DEFAULT 0,
                completed_at TEXT,
                parent_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS task_tags (
                task_id TEXT NOT NULL,
                tag TEXT NOT NULL,
                PRIMARY KEY (task_id, tag),
                FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_remind ON tasks(remind_at);
            CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks(due_at);
            CREATE INDEX IF NOT EXISTS idx_tasks_completed ON tasks(completed);
            CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_id);
            CREATE INDEX IF NOT EXISTS idx_task_tags_tag ON task_tags(tag);

            -- Idempotency ledger: one row per logical occurrence. The
            -- primary key is what makes try_acquire atomic.
            CREATE TABLE IF NOT EXISTS ledger (
                key TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                outcome TEXT,
                acquired_at TEXT NOT NULL,
                committed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_ledger_committed ON ledger(committed_at);

            CREATE TABLE IF NOT EXISTS agent_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                last_cycle_at TEXT,
                last_error TEXT,
                cycles_run INTEGER NOT NULL DEFAULT 0,
                tasks_processed INTEGER NOT NULL DEFAULT 0,
                reminders_sent INTEGER NOT NULL DEFAULT 0,
                occurrences_created INTEGER NOT NULL DEFAULT 0,
                errors_count INTEGER NOT NULL DEFAULT 0
            );

            INSERT OR IGNORE INTO agent_state (id) VALUES (1);
            "#,
        )?;

        Ok(())
    }

    // === Task Operations ===

    /// Insert a new task.
    pub fn insert_task(&mut self, task: &Task) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO tasks
                (id, owner, title, description, priority, timezone, due_at, remind_at,
                 recurrence, completed, completed_at, parent_id, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
            params![
                task.id,
                task.owner,
                task.title,
                task.description,
                task.priority.as_str(),
                task.timezone.name(),
                task.due_at.map(|t| t.to_rfc3339()),
                task.remind_at.map(|t| t.to_rfc3339()),
                task.recurrence
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                task.completed,
                task.completed_at.map(|t| t.to_rfc3339()),
                task.parent_id,
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
            ],
        )?;
        for tag in &task.tags {
            tx.execute(
                "INSERT INTO task_tags (task_id, tag) VALUES (?1, ?2)",
                params![task.id, tag],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Get a task by ID.
    pub fn get_task(&self, id: &str) -> Result<Task> {
        let row = self
            .conn
            .query_row(
                "SELECT id, owner, title, description, priority, timezone, due_at, remind_at,
                        recurrence, completed, completed_at, parent_id, created_at, updated_at
                 FROM tasks WHERE id = ?1",
                params![id],
                TaskRow::from_row,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("Task not found: {}", id)))?;

        let tags = self.task_tags(id)?;
        row.into_task(tags)
    }

    /// List tasks, optionally filtered.
    pub fn list_tasks(
        &self,
        completed: Option<bool>,
        owner: Option<&str>,
        tag: Option<&str>,
    ) -> Result<Vec<Task>> {
        let mut sql = String::from(
            "SELECT DISTINCT t.id FROM tasks t
             LEFT JOIN task_tags tt ON t.id = tt.task_id
             WHERE 1=1",
        );
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(c) = completed {
            sql.push_str(" AND t.completed = ?");
            params_vec.push(Box::new(c));
        }
        if let Some(o) = owner {
            sql.push_str(" AND t.owner = ?");
            params_vec.push(Box::new(o.to_string()));
        }
        if let Some(t) = tag {
            sql.push_str(" AND tt.tag = ?");
            params_vec.push(Box::new(t.to_string()));
        }

        sql.push_str(" ORDER BY t.due_at IS NULL, t.due_at ASC, t.created_at DESC");

        let params_refs: Vec<&dyn rusqlite::ToSql> =
            params_vec.iter().map(|p| p.as_ref()).collect();

        let mut stmt = self.conn.prepare(&sql)?;
        let ids: Vec<String> = stmt
            .query_map(params_refs.as_slice(), |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;

        ids.iter().map(|id| self.get_task(id)).collect()
    }

    /// Update a task.
    pub fn update_task(&mut self, task: &Task) -> Result<()> {
        let tx = self.conn.transaction()?;
        let changed = tx.execute(
            r#"
            UPDATE tasks SET
                owner = ?2, title = ?3, description = ?4, priority = ?5, timezone = ?6,
                due_at = ?7, remind_at = ?8, recurrence = ?9, completed = ?10,
                completed_at = ?11, parent_id = ?12, updated_at = ?13
            WHERE id = ?1
            "#,
            params![
                task.id,
                task.owner,
                task.title,
                task.description,
                task.priority.as_str(),
                task.timezone.name(),
                task.due_at.map(|t| t.to_rfc3339()),
                task.remind_at.map(|t| t.to_rfc3339()),
                task.recurrence
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                task.completed,
                task.completed_at.map(|t| t.to_rfc3339()),
                task.parent_id,
                task.updated_at.to_rfc3339(),
            ],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("Task not found: {}", task.id)));
        }
        tx.execute("DELETE FROM task_tags WHERE task_id = ?1", params![task.id])?;
        for tag in &task.tags {
            tx.execute(
                "INSERT INTO task_tags (task_id, tag) VALUES (?1, ?2)",
                params![task.id, tag],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Delete a task by ID.
    pub fn delete_task(&mut self, id: &str) -> Result<()> {
        self.get_task(id)?;
        self.conn
            .execute("DELETE FROM task_tags WHERE task_id = ?1", params![id])?;
        self.conn
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Tasks whose reminder or due time falls at or before `window_end`
    /// and which are not completed.
    ///
    /// This is the coordinator's Scan query: the resolver decides what to
    /// do with each candidate, including skipping ones whose reminder is
    /// still in the future at the actual reference instant.
    pub fn due_candidates(&self, window_end: DateTime<Utc>) -> Result<Vec<Task>> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM tasks
             WHERE completed = 0
               AND ((remind_at IS NOT NULL AND remind_at <= ?1)
                    OR (due_at IS NOT NULL AND due_at <= ?1))
             ORDER BY COALESCE(remind_at, due_at) ASC",
        )?;
        let ids: Vec<String> = stmt
            .query_map(params![window_end.to_rfc3339()], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;

        ids.iter().map(|id| self.get_task(id)).collect()
    }

    /// Mark a task completed and return the updated snapshot.
    pub fn mark_completed(&mut self, id: &str, when: DateTime<Utc>) -> Result<Task> {
        let changed = self.conn.execute(
            "UPDATE tasks SET completed = 1, completed_at = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, when.to_rfc3339(), Utc::now().to_rfc3339()],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("Task not found: {}", id)));
        }
        self.get_task(id)
    }

    /// Materialize the next occurrence of a recurring task.
    ///
    /// The occurrence inherits the parent's descriptive fields, tags,
    /// timezone, and rule, and points back at the original definition:
    /// completing an occurrence chains new occurrences to the same root,
    /// not to each other.
    pub fn create_occurrence(
        &mut self,
        parent: &Task,
        due_at: DateTime<Utc>,
        remind_at: Option<DateTime<Utc>>,
    ) -> Result<Task> {
        let root_id = parent.parent_id.clone().unwrap_or_else(|| parent.id.clone());

        let mut occurrence = Task::new(
            generate_id("kn", &root_id),
            parent.owner.clone(),
            parent.title.clone(),
        );
        occurrence.description = parent.description.clone();
        occurrence.priority = parent.priority;
        occurrence.tags = parent.tags.clone();
        occurrence.timezone = parent.timezone;
        occurrence.due_at = Some(due_at);
        occurrence.remind_at = remind_at;
        occurrence.recurrence = parent.recurrence.clone();
        occurrence.parent_id = Some(root_id);

        self.insert_task(&occurrence)?;
        Ok(occurrence)
    }

    // === Agent State ===

    /// Read the agent's health counters.
    pub fn agent_state(&self) -> Result<AgentState> {
        self.conn
            .query_row(
                "SELECT last_cycle_at, last_error, cycles_run, tasks_processed,
                        reminders_sent, occurrences_created, errors_count
                 FROM agent_state WHERE id = 1",
                [],
                |row| {
                    Ok(AgentState {
                        last_cycle_at: row
                            .get::<_, Option<String>>(0)?
                            .and_then(|s| parse_instant(&s).ok()),
                        last_error: row.get(1)?,
                        cycles_run: row.get(2)?,
                        tasks_processed: row.get(3)?,
                        reminders_sent: row.get(4)?,
                        occurrences_created: row.get(5)?,
                        errors_count: row.get(6)?,
                    })
                },
            )
            .map_err(Error::from)
    }

    /// Fold one cycle's counters into the agent state.
    pub fn record_cycle(
        &mut self,
        at: DateTime<Utc>,
        processed: u64,
        sent: u64,
        occurrences: u64,
        errors: u64,
        last_error: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE agent_state SET
                last_cycle_at = ?1,
                last_error = ?2,
                cycles_run = cycles_run + 1,
                tasks_processed = tasks_processed + ?3,
                reminders_sent = reminders_sent + ?4,
                occurrences_created = occurrences_created + ?5,
                errors_count = errors_count + ?6
             WHERE id = 1",
            params![at.to_rfc3339(), last_error, processed, sent, occurrences, errors],
        )?;
        Ok(())
    }

    /// Count one materialized occurrence in the agent state.
    pub fn bump_occurrences(&mut self) -> Result<()> {
        self.conn.execute(
            "UPDATE agent_state SET occurrences_created = occurrences_created + 1 WHERE id = 1",
            [],
        )?;
        Ok(())
    }

    /// Drop the ledger table to simulate a storage outage in tests.
    #[cfg(test)]
    pub(crate) fn break_ledger(&self) {
        self.conn.execute_batch("DROP TABLE ledger").unwrap();
    }

    fn task_tags(&self, id: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT tag FROM task_tags WHERE task_id = ?1 ORDER BY tag")?;
        let tags = stmt
            .query_map(params![id], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(tags)
    }
}

/// Raw task row; string fields are parsed into typed values in a second
/// step so parse failures surface as crate errors instead of panics.
struct TaskRow {
    id: String,
    owner: String,
    title: String,
    description: Option<String>,
    priority: String,
    timezone: String,
    due_at: Option<String>,
    remind_at: Option<String>,
    recurrence: Option<String>,
    completed: bool,
    completed_at: Option<String>,
    parent_id: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TaskRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner: row.get(1)?,
            title: row.get(2)?,
            description: row.get(3)?,
            priority: row.get(4)?,
            timezone: row.get(5)?,
            due_at: row.get(6)?,
            remind_at: row.get(7)?,
            recurrence: row.get(8)?,
            completed: row.get(9)?,
            completed_at: row.get(10)?,
            parent_id: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    fn into_task(self, tags: Vec<String>) -> Result<Task> {
        let recurrence: Option<Recurrence> = self
            .recurrence
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(Task {
            id: self.id,
            owner: self.owner,
            title: self.title,
            description: self.description,
            priority: Priority::parse(&self.priority)
                .ok_or_else(|| Error::Other(format!("invalid priority: {}", self.priority)))?,
            tags,
            timezone: Tz::from_str(&self.timezone)
                .map_err(|_| Error::InvalidInput(format!("unknown timezone: {}", self.timezone)))?,
            due_at: self.due_at.as_deref().map(parse_instant).transpose()?,
            remind_at: self.remind_at.as_deref().map(parse_instant).transpose()?,
            recurrence,
            completed: self.completed,
            completed_at: self
                .completed_at
                .as_deref()
                .map(parse_instant)
                .transpose()?,
            parent_id: self.parent_id,
            created_at: parse_instant(&self.created_at)?,
            updated_at: parse_instant(&self.updated_at)?,
        })
    }
}

fn parse_instant(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Other(format!("invalid timestamp {}: {}", s, e)))
}

/// Generate a unique ID.
///
/// Format: `<prefix>-<4 hex chars>`, e.g. task prefix "kn".
pub fn generate_id(prefix: &str, seed: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(
        chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or(0)
            .to_le_bytes(),
    );
    let hash = hasher.finalize();
    let hash_hex = format!("{:x}", hash);
    format!("{}-{}", prefix, &hash_hex[..4])
}

/// Validate that an ID matches the expected format.
pub fn validate_task_id(id: &str) -> Result<()> {
    if !id.starts_with("kn-") {
        return Err(Error::InvalidId(format!(
            "ID must start with 'kn-', got: {}",
            id
        )));
    }
    let suffix = &id[3..];
    if suffix.len() != 4 || !suffix.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::InvalidId(format!(
            "ID suffix must be 4 hex characters, got: {}",
            suffix
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::recurrence::RuleWeekday;
    use crate::test_utils::TestEnv;
    use chrono::TimeZone;

    fn sample_task(id: &str) -> Task {
        let mut task = Task::new(id.to_string(), "user-1".to_string(), "Standup notes".to_string());
        task.timezone = chrono_tz::Europe::Berlin;
        task.due_at = Some(Utc.with_ymd_and_hms(2026, 1, 15, 8, 0, 0).unwrap());
        task.remind_at = Some(Utc.with_ymd_and_hms(2026, 1, 15, 7, 30, 0).unwrap());
        task.tags = vec!["work".to_string()];
        task
    }

    #[test]
    fn test_open_uninitialized_fails() {
        let env = TestEnv::new();
        assert!(matches!(
            Storage::open(env.data_path()),
            Err(Error::NotInitialized)
        ));
    }

    #[test]
    fn test_insert_and_get_round_trip() {
        let env = TestEnv::new();
        let mut storage = env.init_storage();

        let mut task = sample_task("kn-ab12");
        task.recurrence = Some(Recurrence::Weekly {
            interval: 1,
            weekdays: [RuleWeekday::Mon, RuleWeekday::Thu].into_iter().collect(),
        });
        storage.insert_task(&task).unwrap();

        let back = storage.get_task("kn-ab12").unwrap();
        assert_eq!(back.title, task.title);
        assert_eq!(back.timezone, chrono_tz::Europe::Berlin);
        assert_eq!(back.due_at, task.due_at);
        assert_eq!(back.recurrence, task.recurrence);
        assert_eq!(back.tags, vec!["work".to_string()]);
    }

    #[test]
    fn test_due_candidates_window() {
        let env = TestEnv::new();
        let mut storage = env.init_storage();

        let mut inside = sample_task("kn-1111");
        inside.remind_at = Some(Utc.with_ymd_and_hms(2026, 1, 15, 7, 0, 0).unwrap());
        storage.insert_task(&inside).unwrap();

        let mut outside = sample_task("kn-2222");
        outside.remind_at = Some(Utc.with_ymd_and_hms(2026, 1, 20, 7, 0, 0).unwrap());
        outside.due_at = Some(Utc.with_ymd_and_hms(2026, 1, 20, 8, 0, 0).unwrap());
        storage.insert_task(&outside).unwrap();

        let mut done = sample_task("kn-3333");
        done.completed = true;
        storage.insert_task(&done).unwrap();

        let window_end = Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap();
        let candidates = storage.due_candidates(window_end).unwrap();
        let ids: Vec<&str> = candidates.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["kn-1111"]);
    }

    #[test]
    fn test_mark_completed() {
        let env = TestEnv::new();
        let mut storage = env.init_storage();
        storage.insert_task(&sample_task("kn-ab12")).unwrap();

        let when = Utc.with_ymd_and_hms(2026, 1, 15, 9, 0, 0).unwrap();
        let task = storage.mark_completed("kn-ab12", when).unwrap();
        assert!(task.completed);
        assert_eq!(task.completed_at, Some(when));

        assert!(matches!(
            storage.mark_completed("kn-0000", when),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_create_occurrence_inherits_and_links_to_root() {
        let env = TestEnv::new();
        let mut storage = env.init_storage();

        let mut parent = sample_task("kn-ab12");
        parent.recurrence = Some(Recurrence::Daily { interval: 1 });
        storage.insert_task(&parent).unwrap();

        let due = Utc.with_ymd_and_hms(2026, 1, 16, 8, 0, 0).unwrap();
        let first = storage.create_occurrence(&parent, due, None).unwrap();
        assert_eq!(first.parent_id.as_deref(), Some("kn-ab12"));
        assert_eq!(first.title, parent.title);
        assert_eq!(first.recurrence, parent.recurrence);
        assert_eq!(first.tags, parent.tags);

        // Completing the occurrence chains the next one to the root.
        let due2 = Utc.with_ymd_and_hms(2026, 1, 17, 8, 0, 0).unwrap();
        let second = storage.create_occurrence(&first, due2, None).unwrap();
        assert_eq!(second.parent_id.as_deref(), Some("kn-ab12"));
    }

    #[test]
    fn test_update_and_delete() {
        let env = TestEnv::new();
        let mut storage = env.init_storage();
        let mut task = sample_task("kn-ab12");
        storage.insert_task(&task).unwrap();

        task.title = "Renamed".to_string();
        task.tags = vec!["home".to_string()];
        storage.update_task(&task).unwrap();
        let back = storage.get_task("kn-ab12").unwrap();
        assert_eq!(back.title, "Renamed");
        assert_eq!(back.tags, vec!["home".to_string()]);

        storage.delete_task("kn-ab12").unwrap();
        assert!(matches!(
            storage.get_task("kn-ab12"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_agent_state_accumulates() {
        let env = TestEnv::new();
        let mut storage = env.init_storage();

        let state = storage.agent_state().unwrap();
        assert_eq!(state.cycles_run, 0);

        let at = Utc.with_ymd_and_hms(2026, 1, 15, 9, 0, 0).unwrap();
        storage.record_cycle(at, 5, 2, 1, 0, None).unwrap();
        storage.record_cycle(at, 3, 1, 0, 1, Some("boom")).unwrap();

        let state = storage.agent_state().unwrap();
        assert_eq!(state.cycles_run, 2);
        assert_eq!(state.tasks_processed, 8);
        assert_eq!(state.reminders_sent, 3);
        assert_eq!(state.occurrences_created, 1);
        assert_eq!(state.errors_count, 1);
        assert_eq!(state.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_generate_id_format() {
        let id = generate_id("kn", "seed");
        assert!(id.starts_with("kn-"));
        assert_eq!(id.len(), 7);
        assert!(validate_task_id(&id).is_ok());
    }

    #[test]
    fn test_validate_task_id_rejects_bad_format() {
        assert!(validate_task_id("task-a1b2").is_err());
        assert!(validate_task_id("kn-xyz").is_err());
        assert!(validate_task_id("kn-a1b2c").is_err());
    }
}
