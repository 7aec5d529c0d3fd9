use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, params};

use crate::models::*;
use crate::pipeline::catalog;

/// Async-safe handle to the board store.
///
/// Wraps `BoardStore` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<BoardStore>>,
}

impl DbHandle {
    pub fn new(db: BoardStore) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&BoardStore) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct BoardStore {
    pub(crate) conn: Connection,
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl BoardStore {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS migration_jobs (
                    id TEXT PRIMARY KEY,
                    parent_job_id TEXT REFERENCES migration_jobs(id) ON DELETE CASCADE,
                    kind TEXT NOT NULL DEFAULT 'board_migration',
                    status TEXT NOT NULL DEFAULT 'pending',
                    board_index INTEGER,
                    trello_board_id TEXT,
                    config TEXT NOT NULL DEFAULT '{}',
                    progress TEXT NOT NULL DEFAULT '{}',
                    report TEXT,
                    version INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS pipeline_runs (
                    id TEXT PRIMARY KEY,
                    job_id TEXT NOT NULL UNIQUE REFERENCES migration_jobs(id) ON DELETE CASCADE,
                    kind TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    current_phase INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS gate_decisions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id TEXT NOT NULL REFERENCES pipeline_runs(id) ON DELETE CASCADE,
                    gate_name TEXT NOT NULL,
                    decision TEXT NOT NULL,
                    feedback TEXT,
                    decided_by TEXT,
                    decided_at TEXT NOT NULL,
                    UNIQUE(run_id, gate_name)
                );

                CREATE TABLE IF NOT EXISTS job_phases (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_id TEXT NOT NULL REFERENCES migration_jobs(id) ON DELETE CASCADE,
                    phase TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'running',
                    detail TEXT,
                    started_at TEXT,
                    completed_at TEXT,
                    UNIQUE(job_id, phase)
                );

                CREATE TABLE IF NOT EXISTS boards (
                    id TEXT PRIMARY KEY,
                    title TEXT NOT NULL,
                    trello_board_id TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS lists (
                    id TEXT PRIMARY KEY,
                    board_id TEXT NOT NULL REFERENCES boards(id) ON DELETE CASCADE,
                    title TEXT NOT NULL,
                    position INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS cards (
                    id TEXT PRIMARY KEY,
                    title TEXT NOT NULL,
                    description TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS card_placements (
                    card_id TEXT NOT NULL REFERENCES cards(id) ON DELETE CASCADE,
                    list_id TEXT NOT NULL REFERENCES lists(id) ON DELETE CASCADE,
                    position INTEGER NOT NULL DEFAULT 0,
                    is_mirror INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (card_id, list_id)
                );

                CREATE TABLE IF NOT EXISTS checklists (
                    id TEXT PRIMARY KEY,
                    card_id TEXT NOT NULL REFERENCES cards(id) ON DELETE CASCADE,
                    title TEXT NOT NULL,
                    items TEXT NOT NULL DEFAULT '[]',
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_parent ON migration_jobs(parent_job_id);
                CREATE INDEX IF NOT EXISTS idx_jobs_status ON migration_jobs(status);
                CREATE INDEX IF NOT EXISTS idx_gate_decisions_run ON gate_decisions(run_id);
                CREATE INDEX IF NOT EXISTS idx_job_phases_job ON job_phases(job_id);
                CREATE INDEX IF NOT EXISTS idx_lists_board ON lists(board_id);
                CREATE INDEX IF NOT EXISTS idx_placements_list ON card_placements(list_id);
                CREATE INDEX IF NOT EXISTS idx_checklists_card ON checklists(card_id);
                ",
            )
            .context("Failed to create tables")?;

        // Additive migrations (columns are nullable, safe to re-run).
        // Only "duplicate column" errors are ignored; anything else propagates.
        match self
            .conn
            .execute("ALTER TABLE migration_jobs ADD COLUMN error TEXT", [])
        {
            Ok(_) => {}
            Err(e) if e.to_string().contains("duplicate column") => {}
            Err(e) => return Err(anyhow::anyhow!("Failed to add error column: {}", e)),
        }
        match self
            .conn
            .execute("ALTER TABLE pipeline_runs ADD COLUMN completed_at TEXT", [])
        {
            Ok(_) => {}
            Err(e) if e.to_string().contains("duplicate column") => {}
            Err(e) => return Err(anyhow::anyhow!("Failed to add completed_at column: {}", e)),
        }

        // A card has at most one primary (non-mirror) placement.
        self.conn
            .execute_batch(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_placements_primary
             ON card_placements(card_id)
             WHERE is_mirror = 0;",
            )
            .context("Failed to create primary placement index")?;

        Ok(())
    }

    // ── Job CRUD ──────────────────────────────────────────────────────

    pub fn create_job(
        &self,
        parent_job_id: Option<&str>,
        kind: JobKind,
        board_index: Option<i64>,
        trello_board_id: Option<&str>,
        config: &serde_json::Value,
    ) -> Result<Job> {
        let id = new_id();
        let now = now_rfc3339();
        let config_json =
            serde_json::to_string(config).context("Failed to serialize job config")?;
        self.conn
            .execute(
                "INSERT INTO migration_jobs (id, parent_job_id, kind, status, board_index, trello_board_id, config, progress, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, '{}', ?7, ?7)",
                params![id, parent_job_id, kind.as_str(), board_index, trello_board_id, config_json, now],
            )
            .context("Failed to insert job")?;
        self.get_job(&id)?.context("Job not found after insert")
    }

    pub fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM migration_jobs WHERE id = ?1",
                JOB_COLUMNS
            ))
            .context("Failed to prepare get_job")?;
        let mut rows = stmt
            .query_map(params![id], JobRow::from_row)
            .context("Failed to query job")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read job row")?;
                Ok(Some(r.into_job()?))
            }
            None => Ok(None),
        }
    }

    pub fn list_children(&self, parent_id: &str) -> Result<Vec<Job>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM migration_jobs WHERE parent_job_id = ?1 ORDER BY board_index",
                JOB_COLUMNS
            ))
            .context("Failed to prepare list_children")?;
        let rows = stmt
            .query_map(params![parent_id], JobRow::from_row)
            .context("Failed to query children")?;
        let mut jobs = Vec::new();
        for row in rows {
            let r = row.context("Failed to read job row")?;
            jobs.push(r.into_job()?);
        }
        Ok(jobs)
    }

    pub fn list_jobs_with_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM migration_jobs WHERE status = ?1 ORDER BY created_at",
                JOB_COLUMNS
            ))
            .context("Failed to prepare list_jobs_with_status")?;
        let rows = stmt
            .query_map(params![status.as_str()], JobRow::from_row)
            .context("Failed to query jobs by status")?;
        let mut jobs = Vec::new();
        for row in rows {
            let r = row.context("Failed to read job row")?;
            jobs.push(r.into_job()?);
        }
        Ok(jobs)
    }

    /// Transition a job's status through the central transition table.
    /// Writing the same status back is a no-op. Stamps `started_at` on the
    /// first move to running and `completed_at` on terminal statuses.
    pub fn update_job_status(&self, id: &str, to: JobStatus) -> Result<Job> {
        let job = self
            .get_job(id)?
            .with_context(|| format!("Job {} not found", id))?;
        if job.status == to {
            return Ok(job);
        }
        if !is_valid_transition(&job.status, &to) {
            anyhow::bail!(
                "Invalid status transition {} -> {} for job {}",
                job.status,
                to,
                id
            );
        }
        let now = now_rfc3339();
        let started_at = match (&to, &job.started_at) {
            (JobStatus::Running, None) => Some(now.clone()),
            _ => job.started_at.clone(),
        };
        let completed_at = if to.is_terminal() {
            job.completed_at.clone().or_else(|| Some(now.clone()))
        } else {
            job.completed_at.clone()
        };
        self.conn
            .execute(
                "UPDATE migration_jobs SET status = ?1, started_at = ?2, completed_at = ?3,
                 version = version + 1, updated_at = ?4 WHERE id = ?5",
                params![to.as_str(), started_at, completed_at, now, id],
            )
            .context("Failed to update job status")?;
        self.get_job(id)?.context("Job not found after update")
    }

    /// Conditional status write: applies only when the row still carries
    /// `expected_version`. Returns `None` on a version conflict so the
    /// caller can re-read and re-derive.
    pub fn update_job_status_versioned(
        &self,
        id: &str,
        expected_version: i64,
        to: JobStatus,
    ) -> Result<Option<Job>> {
        let job = self
            .get_job(id)?
            .with_context(|| format!("Job {} not found", id))?;
        if job.status != to && !is_valid_transition(&job.status, &to) {
            anyhow::bail!(
                "Invalid status transition {} -> {} for job {}",
                job.status,
                to,
                id
            );
        }
        let now = now_rfc3339();
        let started_at = match (&to, &job.started_at) {
            (JobStatus::Running, None) => Some(now.clone()),
            _ => job.started_at.clone(),
        };
        let completed_at = if to.is_terminal() {
            job.completed_at.clone().or_else(|| Some(now.clone()))
        } else {
            job.completed_at.clone()
        };
        let changed = self
            .conn
            .execute(
                "UPDATE migration_jobs SET status = ?1, started_at = ?2, completed_at = ?3,
                 version = version + 1, updated_at = ?4
                 WHERE id = ?5 AND version = ?6",
                params![to.as_str(), started_at, completed_at, now, id, expected_version],
            )
            .context("Failed to update job status (versioned)")?;
        if changed == 0 {
            return Ok(None);
        }
        self.get_job(id)
    }

    pub fn update_job_progress(&self, id: &str, progress: &JobProgress) -> Result<Job> {
        let progress_json =
            serde_json::to_string(progress).context("Failed to serialize job progress")?;
        let changed = self
            .conn
            .execute(
                "UPDATE migration_jobs SET progress = ?1, version = version + 1, updated_at = ?2 WHERE id = ?3",
                params![progress_json, now_rfc3339(), id],
            )
            .context("Failed to update job progress")?;
        if changed == 0 {
            anyhow::bail!("Job {} not found", id);
        }
        self.get_job(id)?.context("Job not found after update")
    }

    pub fn set_job_report(&self, id: &str, report: &JobReport) -> Result<Job> {
        let report_json =
            serde_json::to_string(report).context("Failed to serialize job report")?;
        let changed = self
            .conn
            .execute(
                "UPDATE migration_jobs SET report = ?1, version = version + 1, updated_at = ?2 WHERE id = ?3",
                params![report_json, now_rfc3339(), id],
            )
            .context("Failed to set job report")?;
        if changed == 0 {
            anyhow::bail!("Job {} not found", id);
        }
        self.get_job(id)?.context("Job not found after update")
    }

    /// Mark a job failed, recording the triggering error message.
    pub fn fail_job(&self, id: &str, error: &str) -> Result<Job> {
        self.update_job_status(id, JobStatus::Failed)?;
        self.conn
            .execute(
                "UPDATE migration_jobs SET error = ?1, updated_at = ?2 WHERE id = ?3",
                params![error, now_rfc3339(), id],
            )
            .context("Failed to record job error")?;
        self.get_job(id)?.context("Job not found after update")
    }

    // ── Pipeline run CRUD ─────────────────────────────────────────────

    pub fn create_run(&self, job_id: &str, kind: JobKind) -> Result<PipelineRun> {
        let id = new_id();
        let now = now_rfc3339();
        self.conn
            .execute(
                "INSERT INTO pipeline_runs (id, job_id, kind, status, current_phase, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?4)",
                params![id, job_id, kind.as_str(), now],
            )
            .context("Failed to insert pipeline run")?;
        self.get_run(&id)?.context("Run not found after insert")
    }

    pub fn get_run(&self, id: &str) -> Result<Option<PipelineRun>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, job_id, kind, status, current_phase, created_at, updated_at, completed_at
                 FROM pipeline_runs WHERE id = ?1",
            )
            .context("Failed to prepare get_run")?;
        let mut rows = stmt
            .query_map(params![id], RunRow::from_row)
            .context("Failed to query run")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read run row")?;
                Ok(Some(r.into_run()?))
            }
            None => Ok(None),
        }
    }

    pub fn get_run_for_job(&self, job_id: &str) -> Result<Option<PipelineRun>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, job_id, kind, status, current_phase, created_at, updated_at, completed_at
                 FROM pipeline_runs WHERE job_id = ?1",
            )
            .context("Failed to prepare get_run_for_job")?;
        let mut rows = stmt
            .query_map(params![job_id], RunRow::from_row)
            .context("Failed to query run by job")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read run row")?;
                Ok(Some(r.into_run()?))
            }
            None => Ok(None),
        }
    }

    /// Move a run to a new typed state. The single write path for run
    /// state: validates against the central transition table, renders the
    /// stored status string, keeps `current_phase` in sync, and stamps
    /// `completed_at` on terminal states.
    pub fn update_run_state(&self, id: &str, to: RunState) -> Result<PipelineRun> {
        let run = self
            .get_run(id)?
            .with_context(|| format!("Run {} not found", id))?;
        let from = catalog::parse_run_status(run.kind, &run.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse stored run status")?;
        if from == to {
            return Ok(run);
        }
        if !is_valid_run_transition(&from, &to) {
            anyhow::bail!(
                "Invalid run transition {} -> {} for run {}",
                run.status,
                catalog::render_run_status(run.kind, &to),
                id
            );
        }
        let status = catalog::render_run_status(run.kind, &to);
        let current_phase = match to {
            RunState::InPhase(i) | RunState::AwaitingGate(i) => i as i64,
            _ => run.current_phase,
        };
        let now = now_rfc3339();
        let completed_at = if to.is_terminal() {
            run.completed_at.clone().or_else(|| Some(now.clone()))
        } else {
            run.completed_at.clone()
        };
        self.conn
            .execute(
                "UPDATE pipeline_runs SET status = ?1, current_phase = ?2, completed_at = ?3, updated_at = ?4
                 WHERE id = ?5",
                params![status, current_phase, completed_at, now, id],
            )
            .context("Failed to update run state")?;
        self.get_run(id)?.context("Run not found after update")
    }

    // ── Gate decisions ────────────────────────────────────────────────

    /// Record a gate decision. The UNIQUE (run_id, gate_name) constraint
    /// makes this idempotent across processes: if a decision already
    /// exists, the stored row is returned with `inserted = false` and
    /// nothing is written.
    pub fn record_gate_decision(
        &self,
        run_id: &str,
        gate_name: &str,
        decision: Decision,
        feedback: Option<&str>,
        decided_by: Option<&str>,
    ) -> Result<(GateDecision, bool)> {
        let changed = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO gate_decisions (run_id, gate_name, decision, feedback, decided_by, decided_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![run_id, gate_name, decision.as_str(), feedback, decided_by, now_rfc3339()],
            )
            .context("Failed to insert gate decision")?;
        let row = self
            .get_gate_decision(run_id, gate_name)?
            .context("Gate decision not found after insert")?;
        Ok((row, changed > 0))
    }

    pub fn get_gate_decision(
        &self,
        run_id: &str,
        gate_name: &str,
    ) -> Result<Option<GateDecision>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, run_id, gate_name, decision, feedback, decided_by, decided_at
                 FROM gate_decisions WHERE run_id = ?1 AND gate_name = ?2",
            )
            .context("Failed to prepare get_gate_decision")?;
        let mut rows = stmt
            .query_map(params![run_id, gate_name], GateDecisionRow::from_row)
            .context("Failed to query gate decision")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read gate decision row")?;
                Ok(Some(r.into_decision()?))
            }
            None => Ok(None),
        }
    }

    /// Remove a gate's recorded decision. Called when execution halts at
    /// the gate again after a revise loop, reopening it for a fresh
    /// decision; a decision row only blocks duplicates while it is live.
    pub fn clear_gate_decision(&self, run_id: &str, gate_name: &str) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM gate_decisions WHERE run_id = ?1 AND gate_name = ?2",
                params![run_id, gate_name],
            )
            .context("Failed to clear gate decision")?;
        Ok(())
    }

    pub fn list_gate_decisions(&self, run_id: &str) -> Result<Vec<GateDecision>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, run_id, gate_name, decision, feedback, decided_by, decided_at
                 FROM gate_decisions WHERE run_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_gate_decisions")?;
        let rows = stmt
            .query_map(params![run_id], GateDecisionRow::from_row)
            .context("Failed to query gate decisions")?;
        let mut decisions = Vec::new();
        for row in rows {
            let r = row.context("Failed to read gate decision row")?;
            decisions.push(r.into_decision()?);
        }
        Ok(decisions)
    }

    // ── Phase history ─────────────────────────────────────────────────

    pub fn upsert_job_phase(
        &self,
        job_id: &str,
        phase: &str,
        status: &str,
        detail: Option<&str>,
    ) -> Result<()> {
        let now = now_rfc3339();
        let completed_at = if status == "completed" || status == "failed" {
            Some(now.clone())
        } else {
            None
        };
        self.conn
            .execute(
                "INSERT INTO job_phases (job_id, phase, status, detail, started_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(job_id, phase) DO UPDATE SET
                     status = excluded.status,
                     detail = COALESCE(excluded.detail, job_phases.detail),
                     completed_at = excluded.completed_at",
                params![job_id, phase, status, detail, now, completed_at],
            )
            .context("Failed to upsert job phase")?;
        Ok(())
    }

    pub fn list_job_phases(&self, job_id: &str) -> Result<Vec<JobPhase>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, job_id, phase, status, detail, started_at, completed_at
                 FROM job_phases WHERE job_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_job_phases")?;
        let rows = stmt
            .query_map(params![job_id], |row| {
                Ok(JobPhase {
                    id: row.get(0)?,
                    job_id: row.get(1)?,
                    phase: row.get(2)?,
                    status: row.get(3)?,
                    detail: row.get(4)?,
                    started_at: row.get(5)?,
                    completed_at: row.get(6)?,
                })
            })
            .context("Failed to query job phases")?;
        let mut phases = Vec::new();
        for row in rows {
            phases.push(row.context("Failed to read job phase row")?);
        }
        Ok(phases)
    }

    // ── Board domain rows ─────────────────────────────────────────────

    pub fn create_board(&self, title: &str, trello_board_id: Option<&str>) -> Result<Board> {
        let id = new_id();
        let now = now_rfc3339();
        self.conn
            .execute(
                "INSERT INTO boards (id, title, trello_board_id, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![id, title, trello_board_id, now],
            )
            .context("Failed to insert board")?;
        Ok(Board {
            id,
            title: title.to_string(),
            trello_board_id: trello_board_id.map(|s| s.to_string()),
            created_at: now,
        })
    }

    pub fn create_list(&self, board_id: &str, title: &str, position: i32) -> Result<BoardList> {
        let id = new_id();
        let now = now_rfc3339();
        self.conn
            .execute(
                "INSERT INTO lists (id, board_id, title, position, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, board_id, title, position, now],
            )
            .context("Failed to insert list")?;
        Ok(BoardList {
            id,
            board_id: board_id.to_string(),
            title: title.to_string(),
            position,
            created_at: now,
        })
    }

    pub fn create_card(&self, title: &str, description: Option<&str>) -> Result<Card> {
        let id = new_id();
        let now = now_rfc3339();
        self.conn
            .execute(
                "INSERT INTO cards (id, title, description, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![id, title, description, now],
            )
            .context("Failed to insert card")?;
        Ok(Card {
            id,
            title: title.to_string(),
            description: description.map(|s| s.to_string()),
            created_at: now,
        })
    }

    pub fn get_board_by_trello_id(&self, trello_board_id: &str) -> Result<Option<Board>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, title, trello_board_id, created_at
                 FROM boards WHERE trello_board_id = ?1",
            )
            .context("Failed to prepare get_board_by_trello_id")?;
        let mut rows = stmt
            .query_map(params![trello_board_id], |row| {
                Ok(Board {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    trello_board_id: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })
            .context("Failed to query board by source id")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read board row")?)),
            None => Ok(None),
        }
    }

    pub fn create_checklist(&self, card_id: &str, title: &str, items: &[String]) -> Result<Checklist> {
        let id = new_id();
        let now = now_rfc3339();
        let items_json = serde_json::to_string(items).context("Failed to serialize checklist items")?;
        self.conn
            .execute(
                "INSERT INTO checklists (id, card_id, title, items, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, card_id, title, items_json, now],
            )
            .context("Failed to insert checklist")?;
        Ok(Checklist {
            id,
            card_id: card_id.to_string(),
            title: title.to_string(),
            items: items.to_vec(),
            created_at: now,
        })
    }

    /// Whether a list already holds a card with this title. Used to make
    /// re-imports after interruption skip rather than duplicate.
    pub fn list_has_card_titled(&self, list_id: &str, title: &str) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM cards c
                 JOIN card_placements p ON p.card_id = c.id
                 WHERE p.list_id = ?1 AND c.title = ?2",
                params![list_id, title],
                |row| row.get(0),
            )
            .context("Failed to check for existing card title")?;
        Ok(count > 0)
    }

    pub fn get_card_in_list(&self, list_id: &str, title: &str) -> Result<Option<Card>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT c.id, c.title, c.description, c.created_at
                 FROM cards c
                 JOIN card_placements p ON p.card_id = c.id
                 WHERE p.list_id = ?1 AND c.title = ?2
                 ORDER BY p.position LIMIT 1",
            )
            .context("Failed to prepare get_card_in_list")?;
        let mut rows = stmt
            .query_map(params![list_id, title], |row| {
                Ok(Card {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    description: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })
            .context("Failed to query card in list")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read card row")?)),
            None => Ok(None),
        }
    }

    pub fn count_card_checklists(&self, card_id: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM checklists WHERE card_id = ?1",
                params![card_id],
                |row| row.get(0),
            )
            .context("Failed to count checklists")
    }

    pub fn list_board_lists(&self, board_id: &str) -> Result<Vec<BoardList>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, board_id, title, position, created_at
                 FROM lists WHERE board_id = ?1 ORDER BY position",
            )
            .context("Failed to prepare list_board_lists")?;
        let rows = stmt
            .query_map(params![board_id], |row| {
                Ok(BoardList {
                    id: row.get(0)?,
                    board_id: row.get(1)?,
                    title: row.get(2)?,
                    position: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })
            .context("Failed to query lists")?;
        let mut lists = Vec::new();
        for row in rows {
            lists.push(row.context("Failed to read list row")?);
        }
        Ok(lists)
    }
}

const JOB_COLUMNS: &str = "id, parent_job_id, kind, status, board_index, trello_board_id, config, progress, report, error, version, created_at, started_at, completed_at, updated_at";

/// Intermediate row struct for migration_jobs.
struct JobRow {
    id: String,
    parent_job_id: Option<String>,
    kind: String,
    status: String,
    board_index: Option<i64>,
    trello_board_id: Option<String>,
    config: String,
    progress: String,
    report: Option<String>,
    error: Option<String>,
    version: i64,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    updated_at: String,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(JobRow {
            id: row.get(0)?,
            parent_job_id: row.get(1)?,
            kind: row.get(2)?,
            status: row.get(3)?,
            board_index: row.get(4)?,
            trello_board_id: row.get(5)?,
            config: row.get(6)?,
            progress: row.get(7)?,
            report: row.get(8)?,
            error: row.get(9)?,
            version: row.get(10)?,
            created_at: row.get(11)?,
            started_at: row.get(12)?,
            completed_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        let kind = JobKind::from_str(&self.kind)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse job kind")?;
        let status = JobStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse job status")?;
        let config: serde_json::Value =
            serde_json::from_str(&self.config).context("Failed to parse job config JSON")?;
        let progress: JobProgress =
            serde_json::from_str(&self.progress).context("Failed to parse job progress JSON")?;
        let report: Option<JobReport> = match &self.report {
            Some(raw) => Some(serde_json::from_str(raw).context("Failed to parse job report JSON")?),
            None => None,
        };

        Ok(Job {
            id: self.id,
            parent_job_id: self.parent_job_id,
            kind,
            status,
            board_index: self.board_index,
            trello_board_id: self.trello_board_id,
            config,
            progress,
            report,
            error: self.error,
            version: self.version,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            updated_at: self.updated_at,
        })
    }
}

/// Intermediate row struct for pipeline_runs.
struct RunRow {
    id: String,
    job_id: String,
    kind: String,
    status: String,
    current_phase: i64,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl RunRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(RunRow {
            id: row.get(0)?,
            job_id: row.get(1)?,
            kind: row.get(2)?,
            status: row.get(3)?,
            current_phase: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
            completed_at: row.get(7)?,
        })
    }

    fn into_run(self) -> Result<PipelineRun> {
        let kind = JobKind::from_str(&self.kind)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse run kind")?;
        Ok(PipelineRun {
            id: self.id,
            job_id: self.job_id,
            kind,
            status: self.status,
            current_phase: self.current_phase,
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
        })
    }
}

/// Intermediate row struct for gate_decisions.
struct GateDecisionRow {
    id: i64,
    run_id: String,
    gate_name: String,
    decision: String,
    feedback: Option<String>,
    decided_by: Option<String>,
    decided_at: String,
}

impl GateDecisionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(GateDecisionRow {
            id: row.get(0)?,
            run_id: row.get(1)?,
            gate_name: row.get(2)?,
            decision: row.get(3)?,
            feedback: row.get(4)?,
            decided_by: row.get(5)?,
            decided_at: row.get(6)?,
        })
    }

    fn into_decision(self) -> Result<GateDecision> {
        let decision = Decision::from_str(&self.decision)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse gate decision")?;
        Ok(GateDecision {
            id: self.id,
            run_id: self.run_id,
            gate_name: self.gate_name,
            decision,
            feedback: self.feedback,
            decided_by: self.decided_by,
            decided_at: self.decided_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_store() -> BoardStore {
        BoardStore::new_in_memory().unwrap()
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let db = test_store();
        // Re-running migrations on an initialized DB must not error.
        db.run_migrations().unwrap();
    }

    #[tokio::test]
    async fn test_handle_call_executes_and_propagates_errors() {
        let handle = DbHandle::new(test_store());

        let job = handle
            .call(|db| db.create_job(None, JobKind::BoardMigration, None, None, &json!({})))
            .await
            .unwrap();
        let id = job.id.clone();
        let fetched = handle.call(move |db| db.get_job(&id)).await.unwrap();
        assert_eq!(fetched.unwrap().id, job.id);

        let err = handle
            .call(|_db| -> Result<()> { Err(anyhow::anyhow!("boom")) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_create_and_get_job() {
        let db = test_store();
        let job = db
            .create_job(None, JobKind::BoardMigration, None, None, &json!({"workspace": "acme"}))
            .unwrap();
        assert!(job.is_parent());
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.version, 0);
        assert_eq!(job.config["workspace"], "acme");

        let fetched = db.get_job(&job.id).unwrap().unwrap();
        assert_eq!(fetched.id, job.id);
        assert!(db.get_job("nope").unwrap().is_none());
    }

    #[test]
    fn test_children_ordered_by_board_index() {
        let db = test_store();
        let parent = db
            .create_job(None, JobKind::BoardMigration, None, None, &json!({}))
            .unwrap();
        for (i, board) in ["b2", "b0", "b1"].iter().enumerate() {
            db.create_job(
                Some(&parent.id),
                JobKind::BoardMigration,
                Some(2 - i as i64),
                Some(board),
                &json!({}),
            )
            .unwrap();
        }
        let children = db.list_children(&parent.id).unwrap();
        assert_eq!(children.len(), 3);
        let boards: Vec<_> = children
            .iter()
            .map(|c| c.trello_board_id.clone().unwrap())
            .collect();
        assert_eq!(boards, vec!["b1", "b0", "b2"]);
        assert!(children.iter().all(|c| !c.is_parent()));
    }

    #[test]
    fn test_status_transition_enforced() {
        let db = test_store();
        let job = db
            .create_job(None, JobKind::BoardMigration, None, None, &json!({}))
            .unwrap();
        let running = db.update_job_status(&job.id, JobStatus::Running).unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert!(running.started_at.is_some());
        assert_eq!(running.version, 1);

        // Completed is terminal; nothing moves out of it.
        let done = db.update_job_status(&job.id, JobStatus::Completed).unwrap();
        assert!(done.completed_at.is_some());
        let err = db.update_job_status(&job.id, JobStatus::Running);
        assert!(err.is_err());
        assert!(err.unwrap_err().to_string().contains("Invalid status transition"));
    }

    #[test]
    fn test_same_status_write_is_noop() {
        let db = test_store();
        let job = db
            .create_job(None, JobKind::BoardMigration, None, None, &json!({}))
            .unwrap();
        let again = db.update_job_status(&job.id, JobStatus::Pending).unwrap();
        assert_eq!(again.version, 0);
    }

    #[test]
    fn test_versioned_update_detects_conflict() {
        let db = test_store();
        let job = db
            .create_job(None, JobKind::BoardMigration, None, None, &json!({}))
            .unwrap();
        // Bump the version behind the caller's back.
        db.update_job_progress(&job.id, &JobProgress::default()).unwrap();

        let conflicted = db
            .update_job_status_versioned(&job.id, job.version, JobStatus::Running)
            .unwrap();
        assert!(conflicted.is_none());

        let fresh = db.get_job(&job.id).unwrap().unwrap();
        let applied = db
            .update_job_status_versioned(&fresh.id, fresh.version, JobStatus::Running)
            .unwrap();
        assert_eq!(applied.unwrap().status, JobStatus::Running);
    }

    #[test]
    fn test_progress_and_report_roundtrip() {
        let db = test_store();
        let job = db
            .create_job(None, JobKind::BoardMigration, None, None, &json!({}))
            .unwrap();
        let progress = JobProgress {
            phase: Some("importing_cards".into()),
            items_total: Some(40),
            items_done: Some(12),
            needs_resume: true,
            resume_from_phase: Some(2),
        };
        let updated = db.update_job_progress(&job.id, &progress).unwrap();
        assert_eq!(updated.progress, progress);

        let report = JobReport {
            boards_created: 1,
            cards_created: 40,
            ..Default::default()
        };
        let with_report = db.set_job_report(&job.id, &report).unwrap();
        assert_eq!(with_report.report.unwrap().cards_created, 40);
    }

    #[test]
    fn test_fail_job_records_error() {
        let db = test_store();
        let job = db
            .create_job(None, JobKind::BoardMigration, None, None, &json!({}))
            .unwrap();
        db.update_job_status(&job.id, JobStatus::Running).unwrap();
        let failed = db.fail_job(&job.id, "snapshot missing list data").unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("snapshot missing list data"));
    }

    #[test]
    fn test_run_lifecycle_and_state_rendering() {
        let db = test_store();
        let job = db
            .create_job(None, JobKind::SeoContent, None, None, &json!({}))
            .unwrap();
        let run = db.create_run(&job.id, JobKind::SeoContent).unwrap();
        assert_eq!(run.status, "pending");
        assert_eq!(run.current_phase, 0);

        let started = db.update_run_state(&run.id, RunState::InPhase(0)).unwrap();
        assert_eq!(started.status, "research");

        let at_gate = db
            .update_run_state(&run.id, RunState::AwaitingGate(2))
            .unwrap();
        assert_eq!(at_gate.status, "awaiting_approval_outline");
        assert_eq!(at_gate.current_phase, 2);

        let scrapped = db.update_run_state(&run.id, RunState::Scrapped).unwrap();
        assert_eq!(scrapped.status, "scrapped");
        assert!(scrapped.completed_at.is_some());
    }

    #[test]
    fn test_run_invalid_transition_rejected() {
        let db = test_store();
        let job = db
            .create_job(None, JobKind::SeoContent, None, None, &json!({}))
            .unwrap();
        let run = db.create_run(&job.id, JobKind::SeoContent).unwrap();
        db.update_run_state(&run.id, RunState::InPhase(3)).unwrap();
        let err = db.update_run_state(&run.id, RunState::InPhase(1));
        assert!(err.is_err());
        assert!(err.unwrap_err().to_string().contains("Invalid run transition"));
    }

    #[test]
    fn test_gate_decision_duplicate_is_noop() {
        let db = test_store();
        let job = db
            .create_job(None, JobKind::SeoContent, None, None, &json!({}))
            .unwrap();
        let run = db.create_run(&job.id, JobKind::SeoContent).unwrap();

        let (first, inserted) = db
            .record_gate_decision(&run.id, "approval_outline", Decision::Approve, Some("lgtm"), Some("maya"))
            .unwrap();
        assert!(inserted);
        assert_eq!(first.decision, Decision::Approve);

        // A conflicting duplicate leaves the stored row untouched.
        let (second, inserted) = db
            .record_gate_decision(&run.id, "approval_outline", Decision::Scrap, None, Some("jo"))
            .unwrap();
        assert!(!inserted);
        assert_eq!(second.decision, Decision::Approve);
        assert_eq!(second.decided_by.as_deref(), Some("maya"));
        assert_eq!(db.list_gate_decisions(&run.id).unwrap().len(), 1);
    }

    #[test]
    fn test_job_phase_upsert() {
        let db = test_store();
        let job = db
            .create_job(None, JobKind::BoardMigration, None, None, &json!({}))
            .unwrap();
        db.upsert_job_phase(&job.id, "importing_lists", "running", None)
            .unwrap();
        db.upsert_job_phase(&job.id, "importing_lists", "completed", Some("4 lists"))
            .unwrap();
        let phases = db.list_job_phases(&job.id).unwrap();
        assert_eq!(phases.len(), 1);
        assert_eq!(phases[0].status, "completed");
        assert_eq!(phases[0].detail.as_deref(), Some("4 lists"));
        assert!(phases[0].completed_at.is_some());
    }

    #[test]
    fn test_board_rows() {
        let db = test_store();
        let board = db.create_board("Acme Ops", Some("trello-9")).unwrap();
        db.create_list(&board.id, "Doing", 1).unwrap();
        db.create_list(&board.id, "Todo", 0).unwrap();
        let lists = db.list_board_lists(&board.id).unwrap();
        assert_eq!(lists.len(), 2);
        assert_eq!(lists[0].title, "Todo");
        assert_eq!(lists[1].title, "Doing");

        let found = db.get_board_by_trello_id("trello-9").unwrap().unwrap();
        assert_eq!(found.id, board.id);
        assert!(db.get_board_by_trello_id("missing").unwrap().is_none());
    }

    #[test]
    fn test_card_title_lookup_and_checklists() {
        let db = test_store();
        let board = db.create_board("Acme Ops", None).unwrap();
        let list = db.create_list(&board.id, "Todo", 0).unwrap();
        let card = db.create_card("Call client", None).unwrap();
        db.create_placement(&card.id, &list.id, 0, false).unwrap();

        assert!(db.list_has_card_titled(&list.id, "Call client").unwrap());
        assert!(!db.list_has_card_titled(&list.id, "Other").unwrap());

        let checklist = db
            .create_checklist(&card.id, "Steps", &["draft".into(), "send".into()])
            .unwrap();
        assert_eq!(checklist.items.len(), 2);
    }
}
