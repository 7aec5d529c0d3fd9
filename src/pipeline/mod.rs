//! Gated, resumable pipeline execution.
//!
//! A `PipelineRunner` drives one job at a time through its kind's fixed
//! phase order (`catalog`), delegating the actual row mutations to the
//! kind's `PhaseWork` implementation (`work`). The runner owns
//! sequencing, the per-invocation deadline check, gate halts, and all
//! status persistence; progress flows out through an `EventSender`.

pub mod catalog;
pub mod work;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::db::DbHandle;
use crate::errors::{OrchestratorError, PhaseError};
use crate::events::{EventSender, StreamFrame};
use crate::models::*;

use work::{PhaseContext, work_for};

/// Default wall-clock budget for a single pipeline invocation. A job
/// that overruns it is re-enqueued rather than killed mid-phase.
pub const DEFAULT_INVOCATION_BUDGET: Duration = Duration::from_secs(300);

/// How a single invocation of a job's pipeline ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Every phase finished before the deadline.
    Completed,
    /// Deadline reached; the job was re-enqueued to continue at `next_phase`.
    NeedsResume { next_phase: usize },
    /// Execution halted at a gate pending a decision.
    AwaitingGate { gate: String },
    /// A phase's work errored; the failure is recorded on the job.
    Failed { message: String },
    /// The job turned terminal underneath us (direct cancellation).
    Interrupted,
}

/// Executes pipelines for jobs in this process.
///
/// The `running` set is best-effort, in-process double-start protection
/// only; cross-process safety comes from row state (a job must be
/// `pending` to start, and the status write is the gate).
#[derive(Clone)]
pub struct PipelineRunner {
    db: DbHandle,
    invocation_budget: Duration,
    running: Arc<tokio::sync::Mutex<HashSet<String>>>,
}

impl PipelineRunner {
    pub fn new(db: DbHandle, invocation_budget: Duration) -> Self {
        Self {
            db,
            invocation_budget,
            running: Arc::new(tokio::sync::Mutex::new(HashSet::new())),
        }
    }

    pub async fn is_running(&self, job_id: &str) -> bool {
        self.running.lock().await.contains(job_id)
    }

    /// Validate the job, mark it running, and spawn its pipeline
    /// execution. Returns once execution is underway; progress arrives on
    /// `events` (`started` first, `done` last).
    pub async fn start_run(
        &self,
        job_id: &str,
        events: EventSender,
    ) -> Result<(), OrchestratorError> {
        let id = job_id.to_string();
        let job = self
            .db
            .call({
                let id = id.clone();
                move |db| db.get_job(&id)
            })
            .await?
            .ok_or_else(|| OrchestratorError::JobNotFound { id: id.clone() })?;

        let children = self
            .db
            .call({
                let id = id.clone();
                move |db| db.list_children(&id)
            })
            .await?;
        if !children.is_empty() {
            return Err(OrchestratorError::NotRunnable {
                id,
                status: format!("{} (aggregate parent)", job.status),
            });
        }
        if !job.is_runnable() {
            return Err(OrchestratorError::NotRunnable {
                id,
                status: job.status.to_string(),
            });
        }
        let run = self
            .db
            .call({
                let id = id.clone();
                move |db| db.get_run_for_job(&id)
            })
            .await?
            .ok_or_else(|| OrchestratorError::NoRun { id: id.clone() })?;

        let start_phase = match job.progress.resume_from_phase {
            Some(i) => i,
            None => match catalog::parse_run_status(run.kind, &run.status) {
                Ok(RunState::InPhase(i)) => i,
                _ => 0,
            },
        };
        let order = catalog::phases(run.kind);
        if start_phase >= order.len() {
            let err = PhaseError::InvalidPhaseIndex {
                kind: run.kind.to_string(),
                index: start_phase,
            };
            return Err(OrchestratorError::Other(err.into()));
        }

        {
            let mut running = self.running.lock().await;
            if !running.insert(id.clone()) {
                return Err(OrchestratorError::AlreadyRunning { id });
            }
        }

        // Flip to running and clear the resume flags before execution
        // begins; a failure here must release the in-process slot.
        let flipped = self
            .db
            .call({
                let id = id.clone();
                move |db| {
                    let job = db.update_job_status(&id, JobStatus::Running)?;
                    if job.progress.needs_resume || job.progress.resume_from_phase.is_some() {
                        let progress = JobProgress {
                            needs_resume: false,
                            resume_from_phase: None,
                            ..job.progress
                        };
                        db.update_job_progress(&id, &progress)?;
                    }
                    Ok(())
                }
            })
            .await;
        if let Err(e) = flipped {
            self.running.lock().await.remove(&id);
            return Err(OrchestratorError::Other(e));
        }

        let deadline = Instant::now() + self.invocation_budget;
        let runner = self.clone();
        tokio::spawn(async move {
            events.send(StreamFrame::Started { job_id: id.clone() });
            let result = runner.execute(&id, start_phase, deadline, &events).await;
            if let Err(e) = result {
                eprintln!("[pipeline] job {}: execution error: {:#}", id, e);
                let message = format!("{:#}", e);
                let failed = runner
                    .db
                    .call({
                        let id = id.clone();
                        let message = message.clone();
                        move |db| db.fail_job(&id, &message)
                    })
                    .await;
                if let Err(e) = failed {
                    eprintln!(
                        "[pipeline] job {}: CRITICAL: failed but could not update DB: {:#}",
                        id, e
                    );
                }
                events.send(StreamFrame::Error { message });
                events.send(StreamFrame::Done);
            }
            runner.running.lock().await.remove(&id);
        });

        Ok(())
    }

    /// Re-enqueue execution in the background with no stream attached.
    /// Used by gate decisions and the reconciler.
    pub fn dispatch_detached(&self, job_id: &str) {
        let runner = self.clone();
        let id = job_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = runner.start_run(&id, EventSender::detached()).await {
                eprintln!("[pipeline] job {}: background dispatch failed: {:#}", id, e);
            }
        });
    }

    async fn execute(
        &self,
        job_id: &str,
        start_phase: usize,
        deadline: Instant,
        events: &EventSender,
    ) -> Result<RunOutcome> {
        let run = self
            .db
            .call({
                let id = job_id.to_string();
                move |db| db.get_run_for_job(&id)
            })
            .await?
            .context("Pipeline run disappeared mid-execution")?;
        let order = catalog::phases(run.kind);
        let work = work_for(run.kind);

        for idx in start_phase..order.len() {
            let job = self
                .db
                .call({
                    let id = job_id.to_string();
                    move |db| db.get_job(&id)
                })
                .await?
                .context("Job disappeared mid-execution")?;
            if job.status.is_terminal() {
                // Cancelled (or otherwise finished) from outside while we
                // were between phases. cancel_job already scrapped the run.
                events.send(StreamFrame::Done);
                return Ok(RunOutcome::Interrupted);
            }

            let spec = order[idx];

            if Instant::now() >= deadline {
                let phase_name = spec.name.to_string();
                self.db
                    .call({
                        let job_id = job_id.to_string();
                        let run_id = run.id.clone();
                        let phase_name = phase_name.clone();
                        move |db| {
                            db.update_run_state(&run_id, RunState::InPhase(idx))?;
                            let job = db
                                .get_job(&job_id)?
                                .with_context(|| format!("Job {} not found", job_id))?;
                            let progress = JobProgress {
                                phase: Some(phase_name),
                                needs_resume: true,
                                resume_from_phase: Some(idx),
                                ..job.progress
                            };
                            db.update_job_progress(&job_id, &progress)?;
                            db.update_job_status(&job_id, JobStatus::Pending)?;
                            Ok(())
                        }
                    })
                    .await?;
                events.send(StreamFrame::NeedsResume {
                    phase: phase_name,
                    resume_from_phase: idx,
                });
                events.send(StreamFrame::Done);
                return Ok(RunOutcome::NeedsResume { next_phase: idx });
            }

            if spec.is_gate {
                let gate = spec.name.to_string();
                self.db
                    .call({
                        let job_id = job_id.to_string();
                        let run_id = run.id.clone();
                        let gate = gate.clone();
                        move |db| {
                            db.update_run_state(&run_id, RunState::AwaitingGate(idx))?;
                            // Reopen the gate: any decision row left here
                            // belongs to a previous visit (revise loop).
                            db.clear_gate_decision(&run_id, &gate)?;
                            db.upsert_job_phase(&job_id, &gate, "awaiting", None)?;
                            let job = db
                                .get_job(&job_id)?
                                .with_context(|| format!("Job {} not found", job_id))?;
                            let progress = JobProgress {
                                phase: Some(gate.clone()),
                                needs_resume: false,
                                resume_from_phase: None,
                                ..job.progress
                            };
                            db.update_job_progress(&job_id, &progress)?;
                            db.update_job_status(&job_id, JobStatus::Paused)?;
                            Ok(())
                        }
                    })
                    .await?;
                events.send(StreamFrame::Progress {
                    phase: gate.clone(),
                    items_done: None,
                    items_total: None,
                    detail: Some("awaiting decision".into()),
                });
                events.send(StreamFrame::Done);
                return Ok(RunOutcome::AwaitingGate { gate });
            }

            // Ordinary phase: record entry, do the work, record the result.
            self.db
                .call({
                    let job_id = job_id.to_string();
                    let run_id = run.id.clone();
                    let phase_name = spec.name.to_string();
                    move |db| {
                        db.update_run_state(&run_id, RunState::InPhase(idx))?;
                        db.upsert_job_phase(&job_id, &phase_name, "running", None)?;
                        let progress = JobProgress {
                            phase: Some(phase_name),
                            ..Default::default()
                        };
                        db.update_job_progress(&job_id, &progress)?;
                        Ok(())
                    }
                })
                .await?;

            let ctx = PhaseContext {
                db: self.db.clone(),
                job,
                events: events.clone(),
            };
            match work.perform(&ctx, &spec).await {
                Ok(()) => {
                    self.db
                        .call({
                            let job_id = job_id.to_string();
                            let phase_name = spec.name.to_string();
                            move |db| db.upsert_job_phase(&job_id, &phase_name, "completed", None)
                        })
                        .await?;
                }
                Err(e) => {
                    let message = format!("{:#}", e);
                    self.db
                        .call({
                            let job_id = job_id.to_string();
                            let run_id = run.id.clone();
                            let phase_name = spec.name.to_string();
                            let message = message.clone();
                            move |db| {
                                db.upsert_job_phase(&job_id, &phase_name, "failed", Some(&message))?;
                                db.fail_job(&job_id, &message)?;
                                db.update_run_state(&run_id, RunState::Failed)?;
                                Ok(())
                            }
                        })
                        .await?;
                    events.send(StreamFrame::Error {
                        message: message.clone(),
                    });
                    events.send(StreamFrame::Done);
                    return Ok(RunOutcome::Failed { message });
                }
            }
        }

        let finished = self
            .db
            .call({
                let job_id = job_id.to_string();
                let run_id = run.id.clone();
                move |db| {
                    db.update_run_state(&run_id, RunState::Completed)?;
                    db.update_job_status(&job_id, JobStatus::Completed)
                }
            })
            .await?;
        events.send(StreamFrame::Completed {
            job_id: job_id.to_string(),
            report: finished.report,
        });
        events.send(StreamFrame::Done);
        Ok(RunOutcome::Completed)
    }
}
