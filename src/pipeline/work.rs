use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::db::DbHandle;
use crate::errors::PhaseError;
use crate::events::{EventSender, StreamFrame};
use crate::models::*;
use crate::pipeline::catalog::PhaseSpec;

/// Everything a phase needs to do its work: store access, a snapshot of
/// the job row taken when the invocation started, and the progress stream.
pub struct PhaseContext {
    pub db: DbHandle,
    pub job: Job,
    pub events: EventSender,
}

/// The opaque unit of work behind each phase. The engine owns sequencing,
/// deadline checks, and status persistence; implementations only mutate
/// domain rows and emit progress frames.
#[async_trait]
pub trait PhaseWork: Send + Sync {
    async fn perform(&self, ctx: &PhaseContext, spec: &PhaseSpec) -> Result<()>;
}

pub fn work_for(kind: JobKind) -> Box<dyn PhaseWork> {
    match kind {
        JobKind::BoardMigration => Box::new(MigrationWork),
        JobKind::SeoContent | JobKind::PageForge => Box::new(ContentWork),
    }
}

async fn add_to_report<F>(db: &DbHandle, job_id: &str, apply: F) -> Result<()>
where
    F: FnOnce(&mut JobReport) + Send + 'static,
{
    let id = job_id.to_string();
    db.call(move |db| {
        let job = db
            .get_job(&id)?
            .with_context(|| format!("Job {} not found", id))?;
        let mut report = job.report.unwrap_or_default();
        apply(&mut report);
        db.set_job_report(&id, &report)?;
        Ok(())
    })
    .await
}

async fn set_phase_progress(
    db: &DbHandle,
    job_id: &str,
    phase: &str,
    items_done: i64,
    items_total: i64,
) -> Result<()> {
    let id = job_id.to_string();
    let phase = phase.to_string();
    db.call(move |db| {
        let progress = JobProgress {
            phase: Some(phase),
            items_done: Some(items_done),
            items_total: Some(items_total),
            needs_resume: false,
            resume_from_phase: None,
        };
        db.update_job_progress(&id, &progress)?;
        Ok(())
    })
    .await
}

fn snapshot_from(job: &Job) -> Result<BoardSnapshot> {
    let raw = job.config.get("snapshot").ok_or_else(|| {
        anyhow::Error::from(PhaseError::MissingSnapshot { id: job.id.clone() })
    })?;
    serde_json::from_value(raw.clone()).context("Malformed board snapshot in job config")
}

/// Imports a pre-fetched board snapshot into domain rows, one phase per
/// entity family. Every phase skips rows that already exist so a
/// truncated invocation can be re-run without duplicating work.
pub struct MigrationWork;

#[async_trait]
impl PhaseWork for MigrationWork {
    async fn perform(&self, ctx: &PhaseContext, spec: &PhaseSpec) -> Result<()> {
        match spec.name {
            "importing_board" => self.import_board(ctx).await,
            "importing_lists" => self.import_lists(ctx).await,
            "importing_cards" => self.import_cards(ctx).await,
            "importing_checklists" => self.import_checklists(ctx).await,
            "finalizing" => self.finalize(ctx).await,
            other => anyhow::bail!("No migration work registered for phase '{}'", other),
        }
    }
}

impl MigrationWork {
    async fn import_board(&self, ctx: &PhaseContext) -> Result<()> {
        let snapshot = snapshot_from(&ctx.job)?;
        let board_name = snapshot.name.clone();
        let created = ctx
            .db
            .call(move |db| {
                if db.get_board_by_trello_id(&snapshot.id)?.is_some() {
                    return Ok(false);
                }
                db.create_board(&snapshot.name, Some(&snapshot.id))?;
                Ok(true)
            })
            .await?;
        if created {
            add_to_report(&ctx.db, &ctx.job.id, |r| r.boards_created += 1).await?;
        }
        set_phase_progress(&ctx.db, &ctx.job.id, "importing_board", 1, 1).await?;
        ctx.events.send(StreamFrame::Progress {
            phase: "importing_board".into(),
            items_done: Some(1),
            items_total: Some(1),
            detail: Some(board_name),
        });
        Ok(())
    }

    async fn import_lists(&self, ctx: &PhaseContext) -> Result<()> {
        let snapshot = snapshot_from(&ctx.job)?;
        let total = snapshot.lists.len() as i64;
        let created = ctx
            .db
            .call(move |db| {
                let board = db
                    .get_board_by_trello_id(&snapshot.id)?
                    .with_context(|| format!("Board {} has not been imported", snapshot.id))?;
                let existing: Vec<String> = db
                    .list_board_lists(&board.id)?
                    .into_iter()
                    .map(|l| l.title)
                    .collect();
                let mut created = 0i64;
                for (i, list) in snapshot.lists.iter().enumerate() {
                    if existing.iter().any(|title| title == &list.name) {
                        continue;
                    }
                    db.create_list(&board.id, &list.name, i as i32)?;
                    created += 1;
                }
                Ok(created)
            })
            .await?;
        if created > 0 {
            add_to_report(&ctx.db, &ctx.job.id, move |r| r.lists_created += created).await?;
        }
        set_phase_progress(&ctx.db, &ctx.job.id, "importing_lists", total, total).await?;
        ctx.events.send(StreamFrame::Progress {
            phase: "importing_lists".into(),
            items_done: Some(total),
            items_total: Some(total),
            detail: None,
        });
        Ok(())
    }

    async fn import_cards(&self, ctx: &PhaseContext) -> Result<()> {
        let snapshot = snapshot_from(&ctx.job)?;
        let total: i64 = snapshot.lists.iter().map(|l| l.cards.len() as i64).sum();
        let mut done = 0i64;

        for list_snap in &snapshot.lists {
            let board_source = snapshot.id.clone();
            let list_name = list_snap.name.clone();
            let cards = list_snap.cards.clone();
            let (created, skipped) = ctx
                .db
                .call(move |db| {
                    let board = db
                        .get_board_by_trello_id(&board_source)?
                        .with_context(|| format!("Board {} has not been imported", board_source))?;
                    let list = db
                        .list_board_lists(&board.id)?
                        .into_iter()
                        .find(|l| l.title == list_name)
                        .with_context(|| format!("List '{}' has not been imported", list_name))?;
                    let mut created = 0i64;
                    let mut skipped = 0i64;
                    for card in &cards {
                        if db.list_has_card_titled(&list.id, &card.name)? {
                            skipped += 1;
                            continue;
                        }
                        let row = db.create_card(&card.name, card.desc.as_deref())?;
                        let position = db.next_append_position(&list.id)?;
                        db.create_placement(&row.id, &list.id, position, false)?;
                        created += 1;
                    }
                    Ok((created, skipped))
                })
                .await?;

            done += created + skipped;
            if created > 0 || skipped > 0 {
                add_to_report(&ctx.db, &ctx.job.id, move |r| {
                    r.cards_created += created;
                    r.cards_skipped += skipped;
                })
                .await?;
            }
            set_phase_progress(&ctx.db, &ctx.job.id, "importing_cards", done, total).await?;
            ctx.events.send(StreamFrame::Progress {
                phase: "importing_cards".into(),
                items_done: Some(done),
                items_total: Some(total),
                detail: Some(list_snap.name.clone()),
            });
        }
        Ok(())
    }

    async fn import_checklists(&self, ctx: &PhaseContext) -> Result<()> {
        let snapshot = snapshot_from(&ctx.job)?;
        let created = ctx
            .db
            .call(move |db| {
                let board = db
                    .get_board_by_trello_id(&snapshot.id)?
                    .with_context(|| format!("Board {} has not been imported", snapshot.id))?;
                let lists = db.list_board_lists(&board.id)?;
                let mut created = 0i64;
                for list_snap in &snapshot.lists {
                    let Some(list) = lists.iter().find(|l| l.title == list_snap.name) else {
                        continue;
                    };
                    for card_snap in &list_snap.cards {
                        if card_snap.checklists.is_empty() {
                            continue;
                        }
                        let Some(card) = db.get_card_in_list(&list.id, &card_snap.name)? else {
                            continue;
                        };
                        if db.count_card_checklists(&card.id)? > 0 {
                            continue;
                        }
                        for checklist in &card_snap.checklists {
                            db.create_checklist(&card.id, &checklist.name, &checklist.items)?;
                            created += 1;
                        }
                    }
                }
                Ok(created)
            })
            .await?;
        if created > 0 {
            add_to_report(&ctx.db, &ctx.job.id, move |r| {
                r.checklists_created += created;
            })
            .await?;
        }
        ctx.events.send(StreamFrame::Progress {
            phase: "importing_checklists".into(),
            items_done: Some(created),
            items_total: None,
            detail: None,
        });
        Ok(())
    }

    async fn finalize(&self, ctx: &PhaseContext) -> Result<()> {
        let snapshot = snapshot_from(&ctx.job)?;
        let board_name = snapshot.name.clone();
        ctx.db
            .call(move |db| {
                db.get_board_by_trello_id(&snapshot.id)?
                    .with_context(|| format!("Board {} missing at finalize", snapshot.id))?;
                Ok(())
            })
            .await?;
        ctx.events.send(StreamFrame::Progress {
            phase: "finalizing".into(),
            items_done: None,
            items_total: None,
            detail: Some(board_name),
        });
        Ok(())
    }
}

/// Work for the content pipelines. Generation itself happens in an
/// external executor; what flows through here is bookkeeping: any
/// artifact text the caller staged in the job config is streamed out and
/// recorded on the phase history row.
pub struct ContentWork;

#[async_trait]
impl PhaseWork for ContentWork {
    async fn perform(&self, ctx: &PhaseContext, spec: &PhaseSpec) -> Result<()> {
        let artifact = ctx
            .job
            .config
            .get("artifacts")
            .and_then(|a| a.get(spec.name))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        if let Some(text) = &artifact {
            ctx.events.send(StreamFrame::Token { text: text.clone() });
            let job_id = ctx.job.id.clone();
            let phase = spec.name.to_string();
            let detail = text.clone();
            ctx.db
                .call(move |db| db.upsert_job_phase(&job_id, &phase, "running", Some(&detail)))
                .await?;
        }

        let id = ctx.job.id.clone();
        let phase = spec.name.to_string();
        ctx.db
            .call(move |db| {
                let progress = JobProgress {
                    phase: Some(phase),
                    needs_resume: false,
                    resume_from_phase: None,
                    ..Default::default()
                };
                db.update_job_progress(&id, &progress)?;
                Ok(())
            })
            .await?;
        ctx.events.send(StreamFrame::Progress {
            phase: spec.name.into(),
            items_done: None,
            items_total: None,
            detail: None,
        });
        Ok(())
    }
}
