use anyhow::{Context, Result};

use crate::db::{BoardStore, DbHandle};
use crate::errors::OrchestratorError;
use crate::models::*;
use crate::pipeline::catalog;

/// Owns the parent/child job tree. Parents are bookkeeping rows whose
/// status is derived from their children; only children (and standalone
/// run-linked jobs) execute pipelines.
pub struct Orchestrator {
    db: DbHandle,
}

impl Orchestrator {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    /// Insert one parent job plus a pending child (and its pipeline run)
    /// per board unit. Children are ordered by `board_index` and carry
    /// their unit's snapshot inside their config.
    pub async fn create_parent_with_children(
        &self,
        config: serde_json::Value,
        units: Vec<BoardSnapshot>,
    ) -> Result<(Job, Vec<Job>), OrchestratorError> {
        if units.is_empty() {
            return Err(OrchestratorError::Other(anyhow::anyhow!(
                "At least one board unit is required"
            )));
        }
        let created = self
            .db
            .call(move |db| {
                let parent = db.create_job(None, JobKind::BoardMigration, None, None, &config)?;
                let mut children = Vec::with_capacity(units.len());
                for (i, unit) in units.iter().enumerate() {
                    let child_config = child_config(&config, unit)?;
                    let child = db.create_job(
                        Some(&parent.id),
                        JobKind::BoardMigration,
                        Some(i as i64),
                        Some(&unit.id),
                        &child_config,
                    )?;
                    db.create_run(&child.id, JobKind::BoardMigration)?;
                    children.push(child);
                }
                Ok((parent, children))
            })
            .await?;
        Ok(created)
    }

    /// The tree view behind `GET /api/jobs/{parentId}/status`: the parent
    /// row (with its status freshly derived), all children, and an
    /// overall completion percentage.
    ///
    /// Rejects child ids. A `cancelled` parent is authoritative and is
    /// returned as-is no matter what the children say.
    pub async fn job_tree_status(
        &self,
        parent_id: &str,
    ) -> Result<JobTreeStatus, OrchestratorError> {
        let id = parent_id.to_string();
        let (job, children) = self
            .db
            .call({
                let id = id.clone();
                move |db| {
                    let job = db.get_job(&id)?;
                    let children = db.list_children(&id)?;
                    Ok((job, children))
                }
            })
            .await?;
        let job = job.ok_or_else(|| OrchestratorError::JobNotFound { id: id.clone() })?;
        if job.parent_job_id.is_some() {
            return Err(OrchestratorError::NotAParent { id });
        }

        let failed_children = children
            .iter()
            .filter(|c| c.status == JobStatus::Failed)
            .count();
        let overall_percent = overall_percent(&job, &children);

        // A standalone run-linked job has no tree to derive from.
        if children.is_empty() || job.status == JobStatus::Cancelled {
            return Ok(JobTreeStatus {
                parent: job,
                children,
                overall_percent,
                failed_children,
            });
        }

        let parent = match derive_parent_status(&children) {
            Some(to) if to != job.status => self.persist_derived(&job, to, &children).await?,
            _ => job,
        };
        Ok(JobTreeStatus {
            parent,
            children,
            overall_percent,
            failed_children,
        })
    }

    async fn persist_derived(
        &self,
        parent: &Job,
        to: JobStatus,
        children: &[Job],
    ) -> Result<Job, OrchestratorError> {
        let report = (to == JobStatus::Completed).then(|| aggregate_reports(children));
        let id = parent.id.clone();
        let version = parent.version;
        let updated = self
            .db
            .call(move |db| {
                let Some(job) = db.update_job_status_versioned(&id, version, to)? else {
                    // Lost the race to a concurrent write (a user cancel,
                    // another derivation); the fresh row is authoritative.
                    return db
                        .get_job(&id)?
                        .with_context(|| format!("Job {} not found", id));
                };
                match report {
                    Some(report) => db.set_job_report(&id, &report),
                    None => Ok(job),
                }
            })
            .await?;
        Ok(updated)
    }

    /// Cancel a job: terminal, authoritative, never overwritten by
    /// derivation. Scraps its run and cascades to any children still in
    /// flight; already-terminal children keep their outcome.
    pub async fn cancel_job(&self, job_id: &str) -> Result<Job, OrchestratorError> {
        let id = job_id.to_string();
        let job = self
            .db
            .call({
                let id = id.clone();
                move |db| db.get_job(&id)
            })
            .await?
            .ok_or_else(|| OrchestratorError::JobNotFound { id: id.clone() })?;
        if !job.status.is_cancellable() {
            return Err(OrchestratorError::NotCancellable {
                id,
                status: job.status.to_string(),
            });
        }
        let cancelled = self
            .db
            .call(move |db| {
                let job = db.update_job_status(&id, JobStatus::Cancelled)?;
                scrap_run_if_open(db, &id)?;
                for child in db.list_children(&id)? {
                    if child.status.is_terminal() {
                        continue;
                    }
                    db.update_job_status(&child.id, JobStatus::Cancelled)?;
                    scrap_run_if_open(db, &child.id)?;
                }
                Ok(job)
            })
            .await?;
        Ok(cancelled)
    }
}

fn child_config(shared: &serde_json::Value, unit: &BoardSnapshot) -> Result<serde_json::Value> {
    let mut config = match shared {
        serde_json::Value::Object(map) => serde_json::Value::Object(map.clone()),
        _ => serde_json::json!({}),
    };
    config["snapshot"] =
        serde_json::to_value(unit).context("Failed to serialize board snapshot")?;
    Ok(config)
}

/// What the children collectively say the parent's status should be.
/// `None` means no rule applies yet (work still queued or paused) and the
/// stored status stands.
fn derive_parent_status(children: &[Job]) -> Option<JobStatus> {
    if children.iter().all(|c| c.status == JobStatus::Completed) {
        return Some(JobStatus::Completed);
    }
    // Checked before the failure rule: a mix of running and failed
    // children reports running.
    if children.iter().any(|c| c.status == JobStatus::Running) {
        return Some(JobStatus::Running);
    }
    // Every child settled, at least one of them badly. The tree is done;
    // partial failure lives in report.errors, not in the parent status.
    if children.iter().all(|c| c.status.is_terminal()) {
        return Some(JobStatus::Completed);
    }
    None
}

fn aggregate_reports(children: &[Job]) -> JobReport {
    let mut total = JobReport::default();
    for child in children {
        if let Some(report) = &child.report {
            total.absorb(report);
        }
        if let Some(error) = &child.error {
            let source = child
                .trello_board_id
                .as_deref()
                .unwrap_or(child.id.as_str());
            total.errors.push(format!("{}: {}", source, error));
        }
    }
    total
}

/// Completion fraction across the tree: a completed child counts 1.0, an
/// unfinished child counts its current phase's weight.
fn overall_percent(parent: &Job, children: &[Job]) -> u8 {
    if children.is_empty() {
        return (completion_fraction(parent) * 100.0).round() as u8;
    }
    let total: f64 = children.iter().map(completion_fraction).sum();
    ((total / children.len() as f64) * 100.0).round() as u8
}

fn completion_fraction(job: &Job) -> f64 {
    if job.status == JobStatus::Completed {
        return 1.0;
    }
    job.progress
        .phase
        .as_deref()
        .and_then(|phase| catalog::phase_weight(job.kind, phase))
        .unwrap_or(0.0)
}

fn scrap_run_if_open(db: &BoardStore, job_id: &str) -> Result<()> {
    if let Some(run) = db.get_run_for_job(job_id)? {
        let state = catalog::parse_run_status(run.kind, &run.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse stored run status")?;
        if !state.is_terminal() {
            db.update_run_state(&run.id, RunState::Scrapped)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::BoardStore;
    use serde_json::json;

    fn handle() -> DbHandle {
        DbHandle::new(BoardStore::new_in_memory().unwrap())
    }

    fn unit(i: usize) -> BoardSnapshot {
        BoardSnapshot {
            id: format!("trello-{}", i),
            name: format!("Board {}", i),
            lists: Vec::new(),
        }
    }

    async fn seed_tree(db: &DbHandle, count: usize) -> (Job, Vec<Job>) {
        let orch = Orchestrator::new(db.clone());
        orch.create_parent_with_children(
            json!({"workspace": "acme"}),
            (0..count).map(unit).collect(),
        )
        .await
        .unwrap()
    }

    async fn complete_child(db: &DbHandle, id: &str, report: JobReport) {
        let id = id.to_string();
        db.call(move |db| {
            db.update_job_status(&id, JobStatus::Running)?;
            db.set_job_report(&id, &report)?;
            db.update_job_status(&id, JobStatus::Completed)?;
            Ok(())
        })
        .await
        .unwrap();
    }

    async fn fail_child(db: &DbHandle, id: &str, error: &str) {
        let id = id.to_string();
        let error = error.to_string();
        db.call(move |db| {
            db.update_job_status(&id, JobStatus::Running)?;
            db.fail_job(&id, &error)?;
            Ok(())
        })
        .await
        .unwrap();
    }

    async fn start_child_in_phase(db: &DbHandle, id: &str, phase: &str) {
        let id = id.to_string();
        let phase = phase.to_string();
        db.call(move |db| {
            db.update_job_status(&id, JobStatus::Running)?;
            let progress = JobProgress {
                phase: Some(phase),
                ..Default::default()
            };
            db.update_job_progress(&id, &progress)?;
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_create_tree_orders_children_and_attaches_runs() {
        let db = handle();
        let (parent, children) = seed_tree(&db, 3).await;
        assert!(parent.is_parent());
        assert_eq!(children.len(), 3);
        for (i, child) in children.iter().enumerate() {
            assert_eq!(child.parent_job_id.as_deref(), Some(parent.id.as_str()));
            assert_eq!(child.board_index, Some(i as i64));
            assert_eq!(child.trello_board_id.as_deref(), Some(format!("trello-{}", i).as_str()));
            assert_eq!(child.config["workspace"], "acme");
            assert_eq!(child.config["snapshot"]["name"], format!("Board {}", i));
            let run = db
                .call({
                    let id = child.id.clone();
                    move |db| db.get_run_for_job(&id)
                })
                .await
                .unwrap()
                .expect("child has a run");
            assert_eq!(run.status, "pending");
        }
    }

    #[tokio::test]
    async fn test_create_tree_rejects_zero_units() {
        let db = handle();
        let orch = Orchestrator::new(db);
        let err = orch
            .create_parent_with_children(json!({}), Vec::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("At least one board unit"));
    }

    #[tokio::test]
    async fn test_status_rejects_child_and_unknown_ids() {
        let db = handle();
        let orch = Orchestrator::new(db.clone());
        let (_parent, children) = seed_tree(&db, 1).await;

        let err = orch.job_tree_status("missing").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::JobNotFound { .. }));

        let err = orch.job_tree_status(&children[0].id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotAParent { .. }));
    }

    #[tokio::test]
    async fn test_mixed_tree_reports_running_with_partial_percent() {
        let db = handle();
        let orch = Orchestrator::new(db.clone());
        let (parent, children) = seed_tree(&db, 3).await;

        complete_child(&db, &children[0].id, JobReport::default()).await;
        start_child_in_phase(&db, &children[1].id, "importing_cards").await;
        complete_child(&db, &children[2].id, JobReport::default()).await;

        let tree = orch.job_tree_status(&parent.id).await.unwrap();
        assert_eq!(tree.parent.status, JobStatus::Running);
        // (1.0 + 0.5 + 1.0) / 3
        assert_eq!(tree.overall_percent, 83);
        assert!(tree.overall_percent > 0 && tree.overall_percent < 100);
        assert_eq!(tree.failed_children, 0);
    }

    #[tokio::test]
    async fn test_running_beats_failed_in_derivation() {
        let db = handle();
        let orch = Orchestrator::new(db.clone());
        let (parent, children) = seed_tree(&db, 2).await;

        fail_child(&db, &children[0].id, "boom").await;
        start_child_in_phase(&db, &children[1].id, "importing_lists").await;

        let tree = orch.job_tree_status(&parent.id).await.unwrap();
        assert_eq!(tree.parent.status, JobStatus::Running);
        assert_eq!(tree.failed_children, 1);
    }

    #[tokio::test]
    async fn test_settled_tree_completes_and_sums_reports() {
        let db = handle();
        let orch = Orchestrator::new(db.clone());
        let (parent, children) = seed_tree(&db, 3).await;

        complete_child(
            &db,
            &children[0].id,
            JobReport {
                boards_created: 1,
                lists_created: 4,
                cards_created: 10,
                ..Default::default()
            },
        )
        .await;
        fail_child(&db, &children[1].id, "list import blew up").await;
        complete_child(
            &db,
            &children[2].id,
            JobReport {
                boards_created: 1,
                lists_created: 2,
                cards_created: 3,
                cards_skipped: 1,
                ..Default::default()
            },
        )
        .await;

        let tree = orch.job_tree_status(&parent.id).await.unwrap();
        assert_eq!(tree.parent.status, JobStatus::Completed);
        assert!(tree.parent.completed_at.is_some());
        assert_eq!(tree.failed_children, 1);

        let report = tree.parent.report.expect("aggregated report");
        assert_eq!(report.boards_created, 2);
        assert_eq!(report.lists_created, 6);
        assert_eq!(report.cards_created, 13);
        assert_eq!(report.cards_skipped, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("trello-1"));
        assert!(report.errors[0].contains("list import blew up"));
    }

    #[tokio::test]
    async fn test_status_derivation_is_idempotent() {
        let db = handle();
        let orch = Orchestrator::new(db.clone());
        let (parent, children) = seed_tree(&db, 2).await;

        complete_child(&db, &children[0].id, JobReport::default()).await;
        start_child_in_phase(&db, &children[1].id, "importing_board").await;

        let first = orch.job_tree_status(&parent.id).await.unwrap();
        let second = orch.job_tree_status(&parent.id).await.unwrap();
        assert_eq!(first.parent.status, second.parent.status);
        assert_eq!(first.overall_percent, second.overall_percent);
    }

    #[tokio::test]
    async fn test_cancelled_parent_is_never_rederived() {
        let db = handle();
        let orch = Orchestrator::new(db.clone());
        let (parent, children) = seed_tree(&db, 3).await;

        complete_child(&db, &children[0].id, JobReport::default()).await;
        orch.cancel_job(&parent.id).await.unwrap();

        // Children now sit entirely in terminal states, which would
        // normally derive completed.
        for _ in 0..3 {
            let tree = orch.job_tree_status(&parent.id).await.unwrap();
            assert_eq!(tree.parent.status, JobStatus::Cancelled);
        }
    }

    #[tokio::test]
    async fn test_pending_children_leave_parent_untouched() {
        let db = handle();
        let orch = Orchestrator::new(db.clone());
        let (parent, _children) = seed_tree(&db, 2).await;

        let tree = orch.job_tree_status(&parent.id).await.unwrap();
        assert_eq!(tree.parent.status, JobStatus::Pending);
        assert_eq!(tree.overall_percent, 0);
    }

    #[tokio::test]
    async fn test_standalone_job_reports_its_own_state() {
        let db = handle();
        let orch = Orchestrator::new(db.clone());
        let job = db
            .call(|db| {
                let job = db.create_job(None, JobKind::SeoContent, None, None, &json!({}))?;
                db.create_run(&job.id, JobKind::SeoContent)?;
                db.update_job_status(&job.id, JobStatus::Running)?;
                let progress = JobProgress {
                    phase: Some("drafting".into()),
                    ..Default::default()
                };
                db.update_job_progress(&job.id, &progress)
            })
            .await
            .unwrap();

        let tree = orch.job_tree_status(&job.id).await.unwrap();
        assert_eq!(tree.parent.status, JobStatus::Running);
        assert!(tree.children.is_empty());
        assert_eq!(tree.overall_percent, 55);

        db.call({
            let id = job.id.clone();
            move |db| db.update_job_status(&id, JobStatus::Completed)
        })
        .await
        .unwrap();
        let tree = orch.job_tree_status(&job.id).await.unwrap();
        assert_eq!(tree.overall_percent, 100);
        // Passthrough, not derivation: the stored status was already
        // terminal and stays untouched.
        assert_eq!(tree.parent.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_scraps_run_and_cascades_to_open_children() {
        let db = handle();
        let orch = Orchestrator::new(db.clone());
        let (parent, children) = seed_tree(&db, 3).await;

        complete_child(&db, &children[0].id, JobReport::default()).await;
        start_child_in_phase(&db, &children[1].id, "importing_cards").await;

        let cancelled = orch.cancel_job(&parent.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);

        let rows = db
            .call({
                let id = parent.id.clone();
                move |db| db.list_children(&id)
            })
            .await
            .unwrap();
        assert_eq!(rows[0].status, JobStatus::Completed);
        assert_eq!(rows[1].status, JobStatus::Cancelled);
        assert_eq!(rows[2].status, JobStatus::Cancelled);

        let run = db
            .call({
                let id = children[1].id.clone();
                move |db| db.get_run_for_job(&id)
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.status, "scrapped");
        let untouched = db
            .call({
                let id = children[0].id.clone();
                move |db| db.get_run_for_job(&id)
            })
            .await
            .unwrap()
            .unwrap();
        assert_ne!(untouched.status, "scrapped");
    }

    #[tokio::test]
    async fn test_cancel_rejects_terminal_jobs() {
        let db = handle();
        let orch = Orchestrator::new(db.clone());
        let (_parent, children) = seed_tree(&db, 1).await;
        complete_child(&db, &children[0].id, JobReport::default()).await;

        let err = orch.cancel_job(&children[0].id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotCancellable { .. }));

        let err = orch.cancel_job("missing").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::JobNotFound { .. }));
    }

    #[test]
    fn test_report_aggregation_concatenates_errors() {
        let db_free_child = |report: Option<JobReport>, error: Option<&str>| Job {
            id: "c".into(),
            parent_job_id: Some("p".into()),
            kind: JobKind::BoardMigration,
            status: if error.is_some() {
                JobStatus::Failed
            } else {
                JobStatus::Completed
            },
            board_index: Some(0),
            trello_board_id: Some("t1".into()),
            config: serde_json::json!({}),
            progress: JobProgress::default(),
            report,
            error: error.map(|e| e.to_string()),
            version: 0,
            created_at: String::new(),
            started_at: None,
            completed_at: None,
            updated_at: String::new(),
        };

        let ok = db_free_child(
            Some(JobReport {
                cards_created: 5,
                errors: vec!["card 'x' skipped: bad payload".into()],
                ..Default::default()
            }),
            None,
        );
        let bad = db_free_child(None, Some("timeout"));

        let total = aggregate_reports(&[ok, bad]);
        assert_eq!(total.cards_created, 5);
        assert_eq!(total.errors.len(), 2);
        assert!(total.errors[1].contains("timeout"));
    }
}
