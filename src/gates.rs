//! Approve/revise/scrap decisions against a run halted at a gate.
//!
//! Decisions are persisted before their effects are applied, keyed
//! uniquely per `(run, gate)`. A duplicate submission while a decision
//! row is live acknowledges the stored row and applies nothing; the row
//! is cleared when execution halts at the same gate again (a revise
//! loop), reopening it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::db::DbHandle;
use crate::errors::GateError;
use crate::models::*;
use crate::pipeline::{PipelineRunner, catalog};

/// What a decision submission produced: the run as it now stands, the
/// decision row that holds (freshly inserted or pre-existing), and
/// whether this call was a duplicate no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateOutcome {
    pub run: PipelineRun,
    pub decision: GateDecision,
    pub already_decided: bool,
}

/// Applies human decisions to runs halted at gates.
pub struct ApprovalGate {
    db: DbHandle,
    runner: PipelineRunner,
}

impl ApprovalGate {
    pub fn new(db: DbHandle, runner: PipelineRunner) -> Self {
        Self { db, runner }
    }

    /// Record and apply one decision. Validation happens before any
    /// write; the decision row is written before its effects so a crash
    /// in between leaves a recoverable record instead of a lost click.
    pub async fn decide(
        &self,
        run_id: &str,
        gate: &str,
        decision: Decision,
        feedback: Option<String>,
        decided_by: Option<String>,
    ) -> Result<GateOutcome, GateError> {
        let id = run_id.to_string();
        let run = self
            .db
            .call({
                let id = id.clone();
                move |db| db.get_run(&id)
            })
            .await?
            .ok_or_else(|| GateError::RunNotFound { id: id.clone() })?;

        let Some(gate_idx) = catalog::gate_index(run.kind, gate) else {
            return Err(GateError::UnknownGate {
                gate: gate.to_string(),
                kind: run.kind.to_string(),
            });
        };

        // A live decision row wins over every state check: duplicate
        // submissions acknowledge it and change nothing.
        let existing = self
            .db
            .call({
                let id = id.clone();
                let gate = gate.to_string();
                move |db| db.get_gate_decision(&id, &gate)
            })
            .await?;
        if let Some(decision) = existing {
            return Ok(GateOutcome {
                run,
                decision,
                already_decided: true,
            });
        }

        let state = catalog::parse_run_status(run.kind, &run.status)
            .map_err(|e| GateError::Other(anyhow::anyhow!(e)))?;
        let Some(at) = state.awaiting_gate() else {
            return Err(GateError::NotAwaitingGate {
                id,
                status: run.status.clone(),
            });
        };
        if at != gate_idx {
            return Err(GateError::WrongGate {
                id,
                expected: catalog::phases(run.kind)[at].name.to_string(),
                submitted: gate.to_string(),
            });
        }

        let (recorded, inserted) = self
            .db
            .call({
                let id = id.clone();
                let gate = gate.to_string();
                move |db| {
                    db.record_gate_decision(
                        &id,
                        &gate,
                        decision,
                        feedback.as_deref(),
                        decided_by.as_deref(),
                    )
                }
            })
            .await?;
        if !inserted {
            // Raced a concurrent submitter; their decision stands.
            return Ok(GateOutcome {
                run,
                decision: recorded,
                already_decided: true,
            });
        }

        let updated =
            apply_decision_effects(&self.db, &self.runner, &run, gate_idx, recorded.decision)
                .await?;
        Ok(GateOutcome {
            run: updated,
            decision: recorded,
            already_decided: false,
        })
    }
}

/// Move a run (and its job) out of a gate halt according to a recorded
/// decision. Also invoked by the reconciler when it finds a decision that
/// was recorded but whose effects never landed; every write in here is a
/// no-op when re-applied to an already-updated row.
pub(crate) async fn apply_decision_effects(
    db: &DbHandle,
    runner: &PipelineRunner,
    run: &PipelineRun,
    gate_idx: usize,
    decision: Decision,
) -> Result<PipelineRun> {
    let order = catalog::phases(run.kind);
    match decision {
        Decision::Approve => {
            let next = gate_idx + 1;
            if next >= order.len() {
                finish(db, run).await
            } else {
                let updated = requeue_at(db, run, next).await?;
                runner.dispatch_detached(&run.job_id);
                Ok(updated)
            }
        }
        Decision::Revise => {
            let target = catalog::revise_target(run.kind, gate_idx);
            let updated = requeue_at(db, run, target).await?;
            runner.dispatch_detached(&run.job_id);
            Ok(updated)
        }
        Decision::Scrap => {
            let run_id = run.id.clone();
            let job_id = run.job_id.clone();
            db.call(move |db| {
                let run = db.update_run_state(&run_id, RunState::Scrapped)?;
                db.update_job_status(&job_id, JobStatus::Cancelled)?;
                Ok(run)
            })
            .await
        }
    }
}

/// Approve on the final gate: the run is done, no dispatch.
async fn finish(db: &DbHandle, run: &PipelineRun) -> Result<PipelineRun> {
    let run_id = run.id.clone();
    let job_id = run.job_id.clone();
    db.call(move |db| {
        let run = db.update_run_state(&run_id, RunState::Completed)?;
        db.update_job_status(&job_id, JobStatus::Completed)?;
        Ok(run)
    })
    .await
}

/// Point the run at `index` and re-enqueue its job for execution.
pub(crate) async fn requeue_at(
    db: &DbHandle,
    run: &PipelineRun,
    index: usize,
) -> Result<PipelineRun> {
    let phase_name = catalog::phases(run.kind)[index].name.to_string();
    let run_id = run.id.clone();
    let job_id = run.job_id.clone();
    db.call(move |db| {
        let run = db.update_run_state(&run_id, RunState::InPhase(index))?;
        let job = db
            .get_job(&job_id)?
            .with_context(|| format!("Job {} not found", job_id))?;
        let progress = JobProgress {
            phase: Some(phase_name),
            needs_resume: true,
            resume_from_phase: Some(index),
            ..job.progress
        };
        db.update_job_progress(&job_id, &progress)?;
        db.update_job_status(&job_id, JobStatus::Pending)?;
        Ok(run)
    })
    .await
}
