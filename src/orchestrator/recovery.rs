use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::db::DbHandle;
use crate::gates;
use crate::models::*;
use crate::pipeline::{PipelineRunner, catalog};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// A running row untouched for a full invocation budget belongs to a
/// process that died mid-execution.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(300);

/// Periodic sweep over the job table that picks up work the request flow
/// dropped: deadline-truncated jobs awaiting re-invocation, gate
/// decisions recorded but never applied, and executions lost to a
/// process death. Coordination is entirely through row state, so any
/// number of processes can sweep concurrently; the worst case is a
/// rejected duplicate dispatch.
pub struct Reconciler {
    db: DbHandle,
    runner: PipelineRunner,
    interval: Duration,
    stale_after: Duration,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct SweepStats {
    pub resumed: usize,
    pub gate_repairs: usize,
    pub requeued: usize,
}

impl SweepStats {
    pub fn total(&self) -> usize {
        self.resumed + self.gate_repairs + self.requeued
    }
}

impl Reconciler {
    pub fn new(
        db: DbHandle,
        runner: PipelineRunner,
        interval: Duration,
        stale_after: Duration,
    ) -> Self {
        Self {
            db,
            runner,
            interval,
            stale_after,
        }
    }

    /// Sweep forever. The first pass runs immediately, so restart
    /// recovery happens as soon as the process is up.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.interval);
            loop {
                tick.tick().await;
                match self.sweep().await {
                    Ok(stats) if stats.total() > 0 => {
                        eprintln!(
                            "[reconcile] resumed={} gate_repairs={} requeued={}",
                            stats.resumed, stats.gate_repairs, stats.requeued
                        );
                    }
                    Ok(_) => {}
                    Err(e) => eprintln!("[reconcile] sweep failed: {:#}", e),
                }
            }
        })
    }

    /// One pass over the job table. Per-job failures are logged and do
    /// not stop the rest of the sweep.
    pub async fn sweep(&self) -> Result<SweepStats> {
        let mut stats = SweepStats::default();
        self.resume_truncated(&mut stats).await?;
        self.repair_paused(&mut stats).await?;
        self.requeue_lost(&mut stats).await?;
        Ok(stats)
    }

    /// Pending jobs flagged `needs_resume` are waiting for someone to
    /// re-invoke them; that someone is us.
    async fn resume_truncated(&self, stats: &mut SweepStats) -> Result<()> {
        let pending = self
            .db
            .call(|db| db.list_jobs_with_status(JobStatus::Pending))
            .await?;
        for job in pending {
            if !job.progress.needs_resume {
                continue;
            }
            if self.runner.is_running(&job.id).await {
                continue;
            }
            self.runner.dispatch_detached(&job.id);
            stats.resumed += 1;
        }
        Ok(())
    }

    async fn repair_paused(&self, stats: &mut SweepStats) -> Result<()> {
        let paused = self
            .db
            .call(|db| db.list_jobs_with_status(JobStatus::Paused))
            .await?;
        for job in paused {
            match self.repair_one_paused(&job).await {
                Ok(true) => stats.gate_repairs += 1,
                Ok(false) => {}
                Err(e) => eprintln!("[reconcile] job {}: gate repair failed: {:#}", job.id, e),
            }
        }
        Ok(())
    }

    /// A paused job is normally a run halted at a gate. Two crash shapes
    /// need repair: a decision recorded but never applied, and a run
    /// that moved on while the job write was lost.
    async fn repair_one_paused(&self, job: &Job) -> Result<bool> {
        let run = self
            .db
            .call({
                let id = job.id.clone();
                move |db| db.get_run_for_job(&id)
            })
            .await?;
        let Some(run) = run else {
            return Ok(false);
        };
        let state = catalog::parse_run_status(run.kind, &run.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse stored run status")?;

        match state {
            RunState::AwaitingGate(g) => {
                let gate_name = catalog::phases(run.kind)[g].name.to_string();
                let decision = self
                    .db
                    .call({
                        let run_id = run.id.clone();
                        move |db| db.get_gate_decision(&run_id, &gate_name)
                    })
                    .await?;
                let Some(decision) = decision else {
                    // Halted and undecided: nothing to do but wait.
                    return Ok(false);
                };
                gates::apply_decision_effects(
                    &self.db,
                    &self.runner,
                    &run,
                    g,
                    decision.decision,
                )
                .await?;
                Ok(true)
            }
            RunState::InPhase(i) => {
                gates::requeue_at(&self.db, &run, i).await?;
                self.runner.dispatch_detached(&run.job_id);
                Ok(true)
            }
            RunState::Completed => {
                self.align_job(&job.id, JobStatus::Completed).await?;
                Ok(true)
            }
            RunState::Scrapped => {
                self.align_job(&job.id, JobStatus::Cancelled).await?;
                Ok(true)
            }
            RunState::Pending | RunState::Failed => Ok(false),
        }
    }

    /// Running jobs nobody in this process is executing, with a row
    /// untouched past the staleness cutoff, were lost to a dead process.
    /// Flip them back to a resumable pending; the next sweep dispatches.
    async fn requeue_lost(&self, stats: &mut SweepStats) -> Result<()> {
        let running = self
            .db
            .call(|db| db.list_jobs_with_status(JobStatus::Running))
            .await?;
        for job in running {
            if self.runner.is_running(&job.id).await {
                continue;
            }
            if !is_stale(&job.updated_at, self.stale_after) {
                continue;
            }
            match self.requeue_one_lost(&job).await {
                Ok(true) => stats.requeued += 1,
                Ok(false) => {}
                Err(e) => eprintln!("[reconcile] job {}: requeue failed: {:#}", job.id, e),
            }
        }
        Ok(())
    }

    async fn requeue_one_lost(&self, job: &Job) -> Result<bool> {
        let id = job.id.clone();
        self.db
            .call(move |db| {
                let Some(fresh) = db.get_job(&id)? else {
                    return Ok(false);
                };
                if fresh.status != JobStatus::Running {
                    // Settled while we were looking.
                    return Ok(false);
                }
                let Some(run) = db.get_run_for_job(&id)? else {
                    // Derived-running parents carry no run and recover
                    // through status derivation, not through us.
                    return Ok(false);
                };
                let state = catalog::parse_run_status(run.kind, &run.status)
                    .map_err(|e| anyhow::anyhow!(e))
                    .context("Failed to parse stored run status")?;
                match state {
                    RunState::Completed => {
                        db.update_job_status(&id, JobStatus::Completed)?;
                    }
                    RunState::Scrapped => {
                        db.update_job_status(&id, JobStatus::Cancelled)?;
                    }
                    RunState::Failed => {
                        db.update_job_status(&id, JobStatus::Failed)?;
                    }
                    _ => {
                        let resume_from = run.current_phase.max(0) as usize;
                        let progress = JobProgress {
                            needs_resume: true,
                            resume_from_phase: Some(resume_from),
                            ..fresh.progress
                        };
                        db.update_job_progress(&id, &progress)?;
                        db.update_job_status(&id, JobStatus::Pending)?;
                    }
                }
                Ok(true)
            })
            .await
    }

    async fn align_job(&self, job_id: &str, to: JobStatus) -> Result<()> {
        let id = job_id.to_string();
        self.db
            .call(move |db| {
                db.update_job_status(&id, to)?;
                Ok(())
            })
            .await
    }
}

fn is_stale(updated_at: &str, stale_after: Duration) -> bool {
    match DateTime::parse_from_rfc3339(updated_at) {
        Ok(t) => {
            let age = Utc::now().signed_duration_since(t.with_timezone(&Utc));
            match chrono::Duration::from_std(stale_after) {
                Ok(threshold) => age >= threshold,
                Err(_) => false,
            }
        }
        // An unreadable timestamp never blocks recovery.
        Err(_) => true,
    }
}
