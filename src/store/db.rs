//! The shared state store: one SQLite file, many short-lived connections.
//!
//! Every pipeline process (CLI runs, the GUI, `levelup decide`) opens its own
//! connections against the same file. WAL mode plus a bounded busy timeout
//! let concurrent writers coexist; every mutation here is a single short
//! transaction so no run ever holds a lock across a step's execution.

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OptionalExtension, params};

use super::models::{CheckpointRequestRecord, CheckpointRow, RunRecord, RunRow};
use crate::context::{CheckpointDecision, PipelineContext, PipelineStatus};
use crate::errors::StoreError;

/// Highest schema version this build understands. A database recorded at a
/// higher version was written by a newer levelup and must not be touched.
pub const SUPPORTED_SCHEMA_VERSION: i64 = 3;

/// Ordered, idempotent migrations. Index N applies schema version N+1.
const MIGRATIONS: &[&str] = &[
    // v1: runs and checkpoint_requests tables
    "CREATE TABLE IF NOT EXISTS runs (
        run_id           TEXT PRIMARY KEY,
        task_title       TEXT NOT NULL,
        task_description TEXT NOT NULL DEFAULT '',
        project_path     TEXT NOT NULL,
        ticket_number    INTEGER,
        status           TEXT NOT NULL DEFAULT 'pending',
        current_step     TEXT,
        language         TEXT,
        framework        TEXT,
        test_runner      TEXT,
        error_message    TEXT,
        context_json     TEXT,
        branch_naming    TEXT,
        pid              INTEGER,
        started_at       TEXT NOT NULL,
        updated_at       TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS checkpoint_requests (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id       TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
        step_name    TEXT NOT NULL,
        payload_json TEXT,
        status       TEXT NOT NULL DEFAULT 'pending',
        decision     TEXT,
        feedback     TEXT NOT NULL DEFAULT '',
        created_at   TEXT NOT NULL,
        decided_at   TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
    CREATE INDEX IF NOT EXISTS idx_runs_ticket ON runs(project_path, ticket_number);
    CREATE INDEX IF NOT EXISTS idx_checkpoints_pending
        ON checkpoint_requests(run_id, step_name, status);",
    // v2: cooperative pause flag
    "ALTER TABLE runs ADD COLUMN pause_requested INTEGER NOT NULL DEFAULT 0;",
    // v3: accumulated usage totals
    "ALTER TABLE runs ADD COLUMN total_cost_usd REAL NOT NULL DEFAULT 0;
     ALTER TABLE runs ADD COLUMN input_tokens INTEGER NOT NULL DEFAULT 0;
     ALTER TABLE runs ADD COLUMN output_tokens INTEGER NOT NULL DEFAULT 0;",
];

const RUN_COLUMNS: &str = "run_id, task_title, task_description, project_path, ticket_number, \
     status, current_step, language, framework, test_runner, error_message, context_json, \
     branch_naming, total_cost_usd, input_tokens, output_tokens, pause_requested, pid, \
     started_at, updated_at";

const CHECKPOINT_COLUMNS: &str =
    "id, run_id, step_name, payload_json, status, decision, feedback, created_at, decided_at";

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(unix)]
fn is_pid_alive(pid: i64) -> bool {
    if pid <= 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM means the process exists but belongs to another user.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn is_pid_alive(_pid: i64) -> bool {
    // No portable probe here; treat recorded processes as alive so the
    // sweep never false-positives.
    true
}

/// Handle to the shared state database. Cheap to clone; every operation
/// opens its own short-lived connection.
#[derive(Debug, Clone)]
pub struct StateStore {
    db_path: PathBuf,
}

impl StateStore {
    /// Open (or create) the state database and bring its schema up to date.
    ///
    /// Fatal if the recorded schema version is newer than this build
    /// supports.
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self { db_path };
        let conn = store.connect()?;
        store.migrate(&conn)?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.db_path).map_err(|e| StoreError::Open {
            path: self.db_path.clone(),
            source: e,
        })?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )?;
        Ok(conn)
    }

    fn migrate(&self, conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);",
        )?;
        let current: i64 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?;
        if current > SUPPORTED_SCHEMA_VERSION {
            return Err(StoreError::SchemaTooNew {
                found: current,
                supported: SUPPORTED_SCHEMA_VERSION,
            });
        }
        for (idx, sql) in MIGRATIONS.iter().enumerate() {
            let version = idx as i64 + 1;
            if version <= current {
                continue;
            }
            let tx = conn.unchecked_transaction()?;
            tx.execute_batch(sql)?;
            tx.execute("DELETE FROM schema_version", [])?;
            tx.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![version],
            )?;
            tx.commit()?;
        }
        Ok(())
    }

    // ── Runs ──────────────────────────────────────────────────────────

    /// Register a new run, recording this process as its owner.
    pub fn register_run(&self, ctx: &PipelineContext) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO runs
                 (run_id, task_title, task_description, project_path, ticket_number,
                  status, current_step, language, framework, test_runner, branch_naming,
                  pid, started_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                ctx.run_id,
                ctx.task.title,
                ctx.task.description,
                ctx.project_path.to_string_lossy(),
                ctx.ticket_number(),
                ctx.status.as_str(),
                ctx.current_step,
                ctx.language,
                ctx.framework,
                ctx.test_runner,
                ctx.branch_naming,
                std::process::id() as i64,
                ctx.started_at.to_rfc3339(),
                now_iso(),
            ],
        )?;
        Ok(())
    }

    /// Persist the run's mutable state, including the full context snapshot.
    pub fn update_run(&self, ctx: &PipelineContext) -> Result<(), StoreError> {
        let context_json = serde_json::to_string(ctx)
            .map_err(|e| StoreError::Corrupt(format!("context serialization failed: {}", e)))?;
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE runs SET
                 status = ?1, current_step = ?2, language = ?3, framework = ?4,
                 test_runner = ?5, error_message = ?6, context_json = ?7,
                 branch_naming = ?8, total_cost_usd = ?9, input_tokens = ?10,
                 output_tokens = ?11, updated_at = ?12
             WHERE run_id = ?13",
            params![
                ctx.status.as_str(),
                ctx.current_step,
                ctx.language,
                ctx.framework,
                ctx.test_runner,
                ctx.error_message,
                context_json,
                ctx.branch_naming,
                ctx.total_cost_usd,
                ctx.total_input_tokens() as i64,
                ctx.total_output_tokens() as i64,
                now_iso(),
                ctx.run_id,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::RunNotFound(ctx.run_id.clone()));
        }
        Ok(())
    }

    /// Take ownership of an existing run for resume: records this process
    /// id and clears the previous terminal state.
    pub fn claim_run(&self, run_id: &str, status: PipelineStatus) -> Result<(), StoreError> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE runs SET pid = ?1, status = ?2, error_message = NULL,
                 pause_requested = 0, updated_at = ?3
             WHERE run_id = ?4",
            params![
                std::process::id() as i64,
                status.as_str(),
                now_iso(),
                run_id
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::RunNotFound(run_id.to_string()));
        }
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, StoreError> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM runs WHERE run_id = ?1", RUN_COLUMNS),
                params![run_id],
                read_run_row,
            )
            .optional()?;
        row.map(RunRow::into_record).transpose()
    }

    /// List runs newest-first, optionally filtered by status.
    pub fn list_runs(
        &self,
        status: Option<PipelineStatus>,
        limit: usize,
    ) -> Result<Vec<RunRecord>, StoreError> {
        let conn = self.connect()?;
        let mut records = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM runs WHERE status = ?1 ORDER BY updated_at DESC LIMIT ?2",
                    RUN_COLUMNS
                ))?;
                let rows = stmt.query_map(params![status.as_str(), limit as i64], read_run_row)?;
                for row in rows {
                    records.push(row?.into_record()?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM runs ORDER BY updated_at DESC LIMIT ?1",
                    RUN_COLUMNS
                ))?;
                let rows = stmt.query_map(params![limit as i64], read_run_row)?;
                for row in rows {
                    records.push(row?.into_record()?);
                }
            }
        }
        Ok(records)
    }

    /// Delete a run; its checkpoint requests cascade.
    pub fn delete_run(&self, run_id: &str) -> Result<bool, StoreError> {
        let conn = self.connect()?;
        let count = conn.execute("DELETE FROM runs WHERE run_id = ?1", params![run_id])?;
        Ok(count > 0)
    }

    /// Guard query: the active (pending/running/waiting) run for a ticket,
    /// if one exists. Checked before any agent or workspace work begins.
    pub fn active_run_for_ticket(
        &self,
        project_path: &Path,
        ticket_number: i64,
    ) -> Result<Option<RunRecord>, StoreError> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM runs
                     WHERE project_path = ?1 AND ticket_number = ?2
                       AND status IN ('pending', 'running', 'waiting_for_input')
                     ORDER BY updated_at DESC LIMIT 1",
                    RUN_COLUMNS
                ),
                params![project_path.to_string_lossy(), ticket_number],
                read_run_row,
            )
            .optional()?;
        row.map(RunRow::into_record).transpose()
    }

    // ── Checkpoint requests ───────────────────────────────────────────

    /// Create a pending checkpoint request and return its id.
    ///
    /// A second pending request for the same (run, step) is a programming
    /// error in the engine, not a user-facing condition.
    pub fn create_checkpoint_request(
        &self,
        run_id: &str,
        step_name: &str,
        payload_json: &str,
    ) -> Result<i64, StoreError> {
        let conn = self.connect()?;
        let tx = conn.unchecked_transaction()?;
        let pending: bool = tx.query_row(
            "SELECT COUNT(*) > 0 FROM checkpoint_requests
             WHERE run_id = ?1 AND step_name = ?2 AND status = 'pending'",
            params![run_id, step_name],
            |row| row.get(0),
        )?;
        if pending {
            return Err(StoreError::PendingRequestExists {
                run_id: run_id.to_string(),
                step_name: step_name.to_string(),
            });
        }
        tx.execute(
            "INSERT INTO checkpoint_requests (run_id, step_name, payload_json, status, created_at)
             VALUES (?1, ?2, ?3, 'pending', ?4)",
            params![run_id, step_name, payload_json, now_iso()],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    /// All pending checkpoint requests across all runs, oldest first.
    pub fn pending_checkpoints(&self) -> Result<Vec<CheckpointRequestRecord>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM checkpoint_requests WHERE status = 'pending' ORDER BY created_at",
            CHECKPOINT_COLUMNS
        ))?;
        let rows = stmt.query_map([], read_checkpoint_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }

    pub fn get_checkpoint_request(
        &self,
        request_id: i64,
    ) -> Result<Option<CheckpointRequestRecord>, StoreError> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM checkpoint_requests WHERE id = ?1",
                    CHECKPOINT_COLUMNS
                ),
                params![request_id],
                read_checkpoint_row,
            )
            .optional()?;
        row.map(CheckpointRow::into_record).transpose()
    }

    /// The decision for a request once an external actor has written one.
    /// Polled by waiting runs; `None` while the request is still pending.
    pub fn checkpoint_decision(
        &self,
        request_id: i64,
    ) -> Result<Option<(CheckpointDecision, String)>, StoreError> {
        let conn = self.connect()?;
        let row: Option<(Option<String>, Option<String>)> = conn
            .query_row(
                "SELECT decision, feedback FROM checkpoint_requests
                 WHERE id = ?1 AND status = 'decided'",
                params![request_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((decision, feedback)) = row else {
            return Ok(None);
        };
        let decision = decision
            .ok_or_else(|| StoreError::Corrupt("decided request without decision".into()))?
            .parse::<CheckpointDecision>()
            .map_err(StoreError::Corrupt)?;
        Ok(Some((decision, feedback.unwrap_or_default())))
    }

    /// Record a decision for a pending request. Decisions are written
    /// exactly once; a decided request is immutable.
    pub fn submit_decision(
        &self,
        request_id: i64,
        decision: CheckpointDecision,
        feedback: &str,
    ) -> Result<(), StoreError> {
        let conn = self.connect()?;
        let tx = conn.unchecked_transaction()?;
        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM checkpoint_requests WHERE id = ?1",
                params![request_id],
                |row| row.get(0),
            )
            .optional()?;
        match status.as_deref() {
            None => return Err(StoreError::RequestNotFound(request_id)),
            Some("pending") => {}
            Some(_) => return Err(StoreError::AlreadyDecided(request_id)),
        }
        tx.execute(
            "UPDATE checkpoint_requests
             SET status = 'decided', decision = ?1, feedback = ?2, decided_at = ?3
             WHERE id = ?4",
            params![decision.as_str(), feedback, now_iso(), request_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    // ── Pause flag ────────────────────────────────────────────────────

    pub fn request_pause(&self, run_id: &str) -> Result<(), StoreError> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE runs SET pause_requested = 1, updated_at = ?1 WHERE run_id = ?2",
            params![now_iso(), run_id],
        )?;
        if changed == 0 {
            return Err(StoreError::RunNotFound(run_id.to_string()));
        }
        Ok(())
    }

    pub fn is_pause_requested(&self, run_id: &str) -> Result<bool, StoreError> {
        let conn = self.connect()?;
        let flag: Option<i64> = conn
            .query_row(
                "SELECT pause_requested FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(flag.unwrap_or(0) != 0)
    }

    pub fn clear_pause_request(&self, run_id: &str) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE runs SET pause_requested = 0, updated_at = ?1 WHERE run_id = ?2",
            params![now_iso(), run_id],
        )?;
        Ok(())
    }

    // ── Liveness sweep ────────────────────────────────────────────────

    /// Reclassify active runs whose owning process has died as failed.
    /// Returns the number of runs reclassified.
    pub fn mark_dead_runs(&self) -> Result<u32, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, pid FROM runs
             WHERE status IN ('pending', 'running', 'waiting_for_input')",
        )?;
        let rows: Vec<(String, Option<i64>)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;
        drop(stmt);

        let mut count = 0;
        for (run_id, pid) in rows {
            let Some(pid) = pid else { continue };
            if is_pid_alive(pid) {
                continue;
            }
            conn.execute(
                "UPDATE runs SET status = 'failed', error_message = 'Process died', updated_at = ?1
                 WHERE run_id = ?2",
                params![now_iso(), run_id],
            )?;
            count += 1;
        }
        Ok(count)
    }
}

fn read_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRow> {
    Ok(RunRow {
        run_id: row.get(0)?,
        task_title: row.get(1)?,
        task_description: row.get(2)?,
        project_path: row.get(3)?,
        ticket_number: row.get(4)?,
        status: row.get(5)?,
        current_step: row.get(6)?,
        language: row.get(7)?,
        framework: row.get(8)?,
        test_runner: row.get(9)?,
        error_message: row.get(10)?,
        context_json: row.get(11)?,
        branch_naming: row.get(12)?,
        total_cost_usd: row.get(13)?,
        input_tokens: row.get(14)?,
        output_tokens: row.get(15)?,
        pause_requested: row.get(16)?,
        pid: row.get(17)?,
        started_at: row.get(18)?,
        updated_at: row.get(19)?,
    })
}

fn read_checkpoint_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CheckpointRow> {
    Ok(CheckpointRow {
        id: row.get(0)?,
        run_id: row.get(1)?,
        step_name: row.get(2)?,
        payload_json: row.get(3)?,
        status: row.get(4)?,
        decision: row.get(5)?,
        feedback: row.get(6)?,
        created_at: row.get(7)?,
        decided_at: row.get(8)?,
    })
}
