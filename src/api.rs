use std::convert::Infallible;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
    routing::{get, post},
};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::db::DbHandle;
use crate::errors::{GateError, OrchestratorError};
use crate::events::{EventSender, StreamFrame};
use crate::gates::ApprovalGate;
use crate::models::{BoardSnapshot, Decision, JobKind, JobStatus, PipelineRun, RunDetail};
use crate::orchestrator::Orchestrator;
use crate::pipeline::{PipelineRunner, catalog};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub runner: PipelineRunner,
    pub orchestrator: Orchestrator,
    pub gate: ApprovalGate,
    /// Interval between SSE heartbeat frames on open progress streams.
    pub heartbeat: Duration,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateJobsRequest {
    pub config: Option<serde_json::Value>,
    /// Pre-fetched board snapshots, one child job per entry. Kept as raw
    /// JSON so malformed units surface as a 400 instead of a body-level
    /// rejection.
    pub units: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
pub struct CreateRunRequest {
    pub kind: String,
    pub config: Option<serde_json::Value>,
}

#[derive(Deserialize)]
pub struct ApproveRequest {
    pub gate: String,
    pub decision: String,
    pub feedback: Option<String>,
    pub decided_by: Option<String>,
}

#[derive(serde::Serialize)]
pub struct CreateJobsResponse {
    pub parent_job_id: String,
    pub children: Vec<ChildSummary>,
}

#[derive(serde::Serialize)]
pub struct ChildSummary {
    pub id: String,
    pub trello_board_id: Option<String>,
    pub board_index: Option<i64>,
    pub status: JobStatus,
}

#[derive(serde::Serialize)]
pub struct CreateRunResponse {
    pub run: PipelineRun,
    pub job_id: String,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => {
                tracing::error!("internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        let msg = e.to_string();
        match e {
            OrchestratorError::JobNotFound { .. } => ApiError::NotFound(msg),
            OrchestratorError::NotAParent { .. }
            | OrchestratorError::NotRunnable { .. }
            | OrchestratorError::AlreadyRunning { .. }
            | OrchestratorError::NoRun { .. }
            | OrchestratorError::NotCancellable { .. } => ApiError::BadRequest(msg),
            OrchestratorError::Other(_) => ApiError::Internal(msg),
        }
    }
}

impl From<GateError> for ApiError {
    fn from(e: GateError) -> Self {
        let msg = e.to_string();
        match e {
            GateError::RunNotFound { .. } => ApiError::NotFound(msg),
            GateError::NotAwaitingGate { .. }
            | GateError::WrongGate { .. }
            | GateError::UnknownGate { .. }
            | GateError::InvalidDecision(_) => ApiError::BadRequest(msg),
            GateError::Other(_) => ApiError::Internal(msg),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/jobs", post(create_jobs))
        .route("/api/jobs/{id}/status", get(job_tree_status))
        .route("/api/jobs/{id}/run", post(run_job))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .route("/api/runs", post(create_run))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/approve", post(approve_run))
        .route("/health", get(health_check))
}

// ── Progress streaming ────────────────────────────────────────────────

/// Turn the engine's frame channel into an SSE response, interleaving
/// heartbeat frames between whatever the engine emits. The pump stops at
/// the terminal `done` frame or when the client goes away; the engine's
/// sends are swallowed after that, so the run itself keeps executing.
fn stream_frames(
    mut frames: mpsc::UnboundedReceiver<StreamFrame>,
    heartbeat_every: Duration,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::unbounded_channel::<Event>();

    tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(heartbeat_every);
        // The first tick completes immediately; consume it so the first
        // heartbeat fires a full interval after the stream opens.
        heartbeat.tick().await;

        loop {
            tokio::select! {
                frame = frames.recv() => {
                    let Some(frame) = frame else { break };
                    let last = frame.is_final();
                    if tx.send(sse_event(&frame)).is_err() {
                        // Client disconnected; the run continues detached.
                        break;
                    }
                    if last {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if tx.send(sse_event(&StreamFrame::heartbeat_now())).is_err() {
                        break;
                    }
                }
            }
        }
    });

    Sse::new(UnboundedReceiverStream::new(rx).map(Ok))
}

fn sse_event(frame: &StreamFrame) -> Event {
    Event::default().event(frame.name()).data(frame.data().to_string())
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn create_jobs(
    State(state): State<SharedState>,
    Json(req): Json<CreateJobsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.units.is_empty() {
        return Err(ApiError::BadRequest(
            "At least one board unit is required".into(),
        ));
    }

    let mut units = Vec::with_capacity(req.units.len());
    for (i, raw) in req.units.into_iter().enumerate() {
        let unit: BoardSnapshot = serde_json::from_value(raw)
            .map_err(|e| ApiError::BadRequest(format!("Board unit {} is invalid: {}", i, e)))?;
        if unit.id.is_empty() {
            return Err(ApiError::BadRequest(format!(
                "Board unit {} is missing an id",
                i
            )));
        }
        units.push(unit);
    }

    let config = req.config.unwrap_or_else(|| serde_json::json!({}));
    let (parent, children) = state
        .orchestrator
        .create_parent_with_children(config, units)
        .await?;

    let children = children
        .into_iter()
        .map(|job| ChildSummary {
            id: job.id,
            trello_board_id: job.trello_board_id,
            board_index: job.board_index,
            status: job.status,
        })
        .collect();

    Ok((
        StatusCode::CREATED,
        Json(CreateJobsResponse {
            parent_job_id: parent.id,
            children,
        }),
    ))
}

async fn job_tree_status(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state.orchestrator.job_tree_status(&id).await?;
    Ok(Json(status))
}

async fn run_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let (events, frames) = EventSender::channel();
    // Validation failures surface as plain HTTP errors; the stream only
    // opens once the job is actually registered and spawned.
    state.runner.start_run(&id, events).await?;
    Ok(stream_frames(frames, state.heartbeat))
}

async fn cancel_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.orchestrator.cancel_job(&id).await?;
    Ok(Json(job))
}

async fn create_run(
    State(state): State<SharedState>,
    Json(req): Json<CreateRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let kind = JobKind::from_str(&req.kind).map_err(ApiError::BadRequest)?;
    if !catalog::phases(kind).iter().any(|p| p.is_gate) {
        return Err(ApiError::BadRequest(format!(
            "Kind {} has no approval gates; use POST /api/jobs for migrations",
            kind
        )));
    }
    let config = req.config.unwrap_or_else(|| serde_json::json!({}));

    let (job, run) = state
        .db
        .call(move |db| {
            let job = db.create_job(None, kind, None, None, &config)?;
            let run = db.create_run(&job.id, kind)?;
            Ok((job, run))
        })
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok((
        StatusCode::CREATED,
        Json(CreateRunResponse {
            run,
            job_id: job.id,
        }),
    ))
}

async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let detail = state
        .db
        .call({
            let id = id.clone();
            move |db| {
                let run = match db.get_run(&id)? {
                    Some(run) => run,
                    None => return Ok(None),
                };
                let decisions = db.list_gate_decisions(&id)?;
                Ok(Some(RunDetail { run, decisions }))
            }
        })
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    match detail {
        Some(detail) => Ok(Json(detail)),
        None => Err(ApiError::NotFound(format!("Run {} not found", id))),
    }
}

async fn approve_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<ApproveRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let decision = Decision::from_str(&req.decision)
        .map_err(|_| GateError::InvalidDecision(req.decision.clone()))?;
    let outcome = state
        .gate
        .decide(&id, &req.gate, decision, req.feedback, req.decided_by)
        .await?;
    Ok(Json(outcome))
}

// ── Tests ─────────────────────────────────────────────────────────────
