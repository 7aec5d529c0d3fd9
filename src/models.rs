use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Job records ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    BoardMigration,
    SeoContent,
    PageForge,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BoardMigration => "board_migration",
            Self::SeoContent => "seo_content",
            Self::PageForge => "page_forge",
        }
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "board_migration" => Ok(Self::BoardMigration),
            "seo_content" => Ok(Self::SeoContent),
            "page_forge" => Ok(Self::PageForge),
            _ => Err(format!("Invalid job kind: {}", s)),
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::Paused)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Central job status transition table. Every status write goes through
/// this check; there is no prefix-matching on status strings anywhere.
///
/// `Running -> Pending` is the cooperative needs-resume yield; `Paused ->
/// Pending` is a gate decision re-enqueueing the job.
pub fn is_valid_transition(from: &JobStatus, to: &JobStatus) -> bool {
    use JobStatus::*;
    matches!(
        (from, to),
        (Pending, Running)
            | (Pending, Completed)
            | (Pending, Failed)
            | (Pending, Cancelled)
            | (Running, Pending)
            | (Running, Paused)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled)
            | (Paused, Pending)
            | (Paused, Running)
            | (Paused, Completed)
            | (Paused, Cancelled)
    )
}

/// Structured progress persisted on a job row.
///
/// `needs_resume` marks a deadline-truncated execution awaiting another
/// invocation; `resume_from_phase` is the phase index that invocation
/// should start from (written by gate decisions and the deadline yield).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobProgress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_total: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_done: Option<i64>,
    #[serde(default)]
    pub needs_resume: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_from_phase: Option<usize>,
}

/// Aggregate counters reported by a finished job. Parent jobs sum their
/// children's reports, concatenating `errors`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobReport {
    #[serde(default)]
    pub boards_created: i64,
    #[serde(default)]
    pub lists_created: i64,
    #[serde(default)]
    pub cards_created: i64,
    #[serde(default)]
    pub cards_skipped: i64,
    #[serde(default)]
    pub checklists_created: i64,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl JobReport {
    pub fn absorb(&mut self, other: &JobReport) {
        self.boards_created += other.boards_created;
        self.lists_created += other.lists_created;
        self.cards_created += other.cards_created;
        self.cards_skipped += other.cards_skipped;
        self.checklists_created += other.checklists_created;
        self.errors.extend(other.errors.iter().cloned());
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub parent_job_id: Option<String>,
    pub kind: JobKind,
    pub status: JobStatus,
    pub board_index: Option<i64>,
    pub trello_board_id: Option<String>,
    pub config: serde_json::Value,
    pub progress: JobProgress,
    pub report: Option<JobReport>,
    pub error: Option<String>,
    pub version: i64,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub updated_at: String,
}

impl Job {
    pub fn is_parent(&self) -> bool {
        self.parent_job_id.is_none()
    }

    /// A job can be (re)started when pending: fresh, or truncated and
    /// flagged for resume.
    pub fn is_runnable(&self) -> bool {
        self.status == JobStatus::Pending
    }
}

// ── Pipeline runs ────────────────────────────────────────────────────────────

/// Typed run state. The stored and wire form is a rendered string (a phase
/// name, `awaiting_<gate>`, or a terminal word); rendering and parsing live
/// next to the phase catalogs in `pipeline::catalog`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    InPhase(usize),
    AwaitingGate(usize),
    Completed,
    Scrapped,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Scrapped | Self::Failed)
    }

    pub fn awaiting_gate(&self) -> Option<usize> {
        match self {
            Self::AwaitingGate(i) => Some(*i),
            _ => None,
        }
    }
}

/// Central run state transition table.
///
/// Forward movement only while executing; a gate decision may jump
/// backward (revise) or finish the run (approve on the last gate).
/// Scrapping is reachable from a gate (the scrap decision) and from
/// mid-execution (direct cancellation of the linked job).
pub fn is_valid_run_transition(from: &RunState, to: &RunState) -> bool {
    use RunState::*;
    match (from, to) {
        (Pending, InPhase(_)) | (Pending, AwaitingGate(_)) => true,
        (Pending, Failed) | (Pending, Scrapped) => true,
        (InPhase(i), InPhase(j)) => j >= i,
        (InPhase(i), AwaitingGate(g)) => g >= i,
        (InPhase(_), Completed) | (InPhase(_), Failed) | (InPhase(_), Scrapped) => true,
        (AwaitingGate(_), InPhase(_)) => true,
        (AwaitingGate(_), Completed) | (AwaitingGate(_), Scrapped) => true,
        _ => false,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: String,
    pub job_id: String,
    pub kind: JobKind,
    /// Rendered state string: a phase name, `awaiting_<gate>`, `pending`,
    /// or terminal `completed`/`scrapped`/`failed`.
    pub status: String,
    pub current_phase: i64,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

// ── Gate decisions ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Revise,
    Scrap,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Revise => "revise",
            Self::Scrap => "scrap",
        }
    }
}

impl FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(Self::Approve),
            "revise" => Ok(Self::Revise),
            "scrap" => Ok(Self::Scrap),
            _ => Err(format!("Invalid decision: {}", s)),
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded decision per `(run_id, gate_name)`; the unique constraint
/// in the store makes duplicate submissions no-ops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateDecision {
    pub id: i64,
    pub run_id: String,
    pub gate_name: String,
    pub decision: Decision,
    pub feedback: Option<String>,
    pub decided_by: Option<String>,
    pub decided_at: String,
}

// ── Board domain rows ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Board {
    pub id: String,
    pub title: String,
    pub trello_board_id: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardList {
    pub id: String,
    pub board_id: String,
    pub title: String,
    pub position: i32,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Card {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub created_at: String,
}

/// A card's membership in an ordered list. At most one non-mirror
/// placement exists per card; mirrors are secondary appearances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardPlacement {
    pub card_id: String,
    pub list_id: String,
    pub position: i32,
    pub is_mirror: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checklist {
    pub id: String,
    pub card_id: String,
    pub title: String,
    pub items: Vec<String>,
    pub created_at: String,
}

// ── Migration input snapshots ────────────────────────────────────────────────

/// Pre-fetched source board content, one per migration unit. Arrives in
/// the create-jobs request and is embedded in each child job's config;
/// the service itself performs no outbound fetches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardSnapshot {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub lists: Vec<ListSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListSnapshot {
    pub name: String,
    #[serde(default)]
    pub cards: Vec<CardSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardSnapshot {
    pub name: String,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub checklists: Vec<ChecklistSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecklistSnapshot {
    pub name: String,
    #[serde(default)]
    pub items: Vec<String>,
}

// ── API view types ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTreeStatus {
    pub parent: Job,
    pub children: Vec<Job>,
    pub overall_percent: u8,
    pub failed_children: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDetail {
    pub run: PipelineRun,
    pub decisions: Vec<GateDecision>,
}

/// Per-phase execution history row, upserted as phases start and finish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPhase {
    pub id: i64,
    pub job_id: String,
    pub phase: String,
    pub status: String,
    pub detail: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}
