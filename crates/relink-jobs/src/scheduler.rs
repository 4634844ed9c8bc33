use crate::walkers::{walk_batch, walker_for, BatchContext, BatchReport};
use crate::{validate_operator, JobConfig, JobError};
use chrono::{DateTime, Utc};
use relink_core::{
    AdvanceResponse, Job, JobMode, MessageResponse, RunSummary, Stage, StartResponse,
};
use relink_rewrite::{AssetFs, ValueRewriter};
use relink_storage::{JobSlot, JournalStore, SiteStore};
use std::time::Instant;
use tracing::{info, warn};

/// Drives one operator's job through its collections, one batch per call.
pub struct JobScheduler<F> {
    config: JobConfig,
    rewriter: ValueRewriter<F>,
}

impl<F: AssetFs> JobScheduler<F> {
    pub fn new(config: JobConfig, rewriter: ValueRewriter<F>) -> Self {
        Self { config, rewriter }
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn rewriter(&self) -> &ValueRewriter<F> {
        &self.rewriter
    }

    /// Creates a fresh job, replacing whatever the operator's slot held.
    pub fn start_job(
        &self,
        journal: &JournalStore,
        operator: &str,
        mode: JobMode,
        now: DateTime<Utc>,
    ) -> Result<StartResponse, JobError> {
        validate_operator(operator)?;
        self.clear_slot(journal, operator, now)?;

        let job = Job::new(operator, mode, &self.config.collections, now);
        job.validate()?;
        journal.discard_changes(&job.job_id)?;
        journal.save_job(&job, now, self.config.state_ttl)?;

        let collection = job.queue[job.index].collection;
        info!(
            event = "job_started",
            job_id = %job.job_id,
            operator,
            mode = %mode,
            collections = job.queue.len()
        );
        Ok(StartResponse {
            message: format!(
                "Started {} migration job {} over {} collections.",
                mode,
                job.job_id,
                job.queue.len()
            ),
            stage: Stage::Started,
            collection,
            job_id: job.job_id,
            mode,
        })
    }

    /// Runs at most one batch of the current collection.
    pub fn advance(
        &self,
        site: &SiteStore,
        journal: &JournalStore,
        operator: &str,
        now: DateTime<Utc>,
    ) -> Result<AdvanceResponse, JobError> {
        validate_operator(operator)?;
        let mut job = self.load_active(journal, operator, now)?;

        if job.stuck_batches >= self.config.stuck_batch_limit {
            return Err(self.abort_stuck(journal, &job)?);
        }

        let deadline = Instant::now() + self.config.time_budget;
        let index = job.index;
        let collection = job.queue[index].collection;
        let walker = walker_for(collection);

        if job.queue[index].total.is_none() {
            match walker.total(site, self.rewriter.resolver().legacy_extensions()) {
                Ok(total) => job.queue[index].total = total,
                Err(err) => warn!(
                    event = "walker_total_failed",
                    collection = %collection,
                    error = %err
                ),
            }
        }

        let previous_cursor = job.queue[index].cursor;
        // Rows journaled by an earlier call that failed before saving the slot
        // keep their sequence numbers.
        let first_seq = journal.next_change_seq(&job.job_id)?;
        let ctx = BatchContext {
            site,
            journal,
            job_id: &job.job_id,
            rewriter: &self.rewriter,
            config: &self.config,
            mode: job.mode,
        };
        let report = walk_batch(walker, &ctx, previous_cursor, first_seq, deadline)?;
        apply_report(&mut job, index, &report);

        info!(
            event = "batch_completed",
            job_id = %job.job_id,
            collection = %collection,
            cursor = job.queue[index].cursor,
            scanned = report.scanned,
            updated = report.updated,
            failed = report.failed,
            replaced = report.tally.replaced
        );

        if report.complete {
            job.queue[index].complete = true;
            job.stuck_batches = 0;
            info!(
                event = "table_complete",
                job_id = %job.job_id,
                collection = %collection,
                scanned = job.queue[index].scanned,
                updated = job.queue[index].updated
            );

            if job.is_last_collection() {
                return self.finalize(journal, job, now);
            }

            let response = progress_response(&job, index, Stage::TableComplete);
            job.index += 1;
            journal.save_job(&job, now, self.config.state_ttl)?;
            return Ok(response);
        }

        if job.queue[index].cursor > previous_cursor {
            job.stuck_batches = 0;
        } else {
            job.stuck_batches += 1;
            if job.stuck_batches >= self.config.stuck_batch_limit {
                return Err(self.abort_stuck(journal, &job)?);
            }
        }

        journal.save_job(&job, now, self.config.state_ttl)?;
        Ok(progress_response(&job, index, Stage::Progress))
    }

    /// Deletes the operator's job unconditionally.
    pub fn reset(
        &self,
        journal: &JournalStore,
        operator: &str,
        now: DateTime<Utc>,
    ) -> Result<MessageResponse, JobError> {
        validate_operator(operator)?;
        let cleared = self.clear_slot(journal, operator, now)?;
        let message = match cleared {
            Some(job_id) => {
                info!(event = "job_reset", job_id = %job_id, operator);
                format!("Migration job {job_id} reset.")
            }
            None => "No migration job to reset.".to_string(),
        };
        Ok(MessageResponse { message })
    }

    fn load_active(
        &self,
        journal: &JournalStore,
        operator: &str,
        now: DateTime<Utc>,
    ) -> Result<Job, JobError> {
        let (job_id, reason) = match journal.load_job(operator, now)? {
            JobSlot::Active(job) => match job.validate() {
                Ok(()) => return Ok(*job),
                Err(err) => (job.job_id.clone(), err.to_string()),
            },
            JobSlot::Empty => {
                return Err(JobError::NoActiveJob {
                    operator: operator.to_string(),
                })
            }
            JobSlot::Expired { job_id } => {
                info!(event = "job_expired", job_id = %job_id, operator);
                journal.delete_job(operator)?;
                journal.discard_changes(&job_id)?;
                return Err(JobError::NoActiveJob {
                    operator: operator.to_string(),
                });
            }
            JobSlot::Corrupt { job_id, reason } => (job_id, reason),
        };

        warn!(
            event = "corrupt_state_deleted",
            job_id = %job_id,
            operator,
            reason = %reason
        );
        journal.delete_job(operator)?;
        journal.discard_changes(&job_id)?;
        Err(JobError::CorruptState {
            operator: operator.to_string(),
            job_id,
            reason,
        })
    }

    /// Drops any slot content and its uncommitted change rows.
    fn clear_slot(
        &self,
        journal: &JournalStore,
        operator: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, JobError> {
        let job_id = match journal.load_job(operator, now)? {
            JobSlot::Empty => None,
            JobSlot::Active(job) => Some(job.job_id),
            JobSlot::Expired { job_id } | JobSlot::Corrupt { job_id, .. } => Some(job_id),
        };
        journal.delete_job(operator)?;
        if let Some(job_id) = job_id.as_deref() {
            journal.discard_changes(job_id)?;
        }
        Ok(job_id)
    }

    fn abort_stuck(&self, journal: &JournalStore, job: &Job) -> Result<JobError, JobError> {
        let progress = &job.queue[job.index];
        warn!(
            event = "stuck_loop_abort",
            job_id = %job.job_id,
            collection = %progress.collection,
            cursor = progress.cursor,
            stuck_batches = job.stuck_batches
        );
        journal.delete_job(&job.operator)?;
        journal.discard_changes(&job.job_id)?;
        Ok(JobError::StuckLoop {
            job_id: job.job_id.clone(),
            collection: progress.collection,
            cursor: progress.cursor,
            batches: job.stuck_batches,
        })
    }

    fn finalize(
        &self,
        journal: &JournalStore,
        job: Job,
        now: DateTime<Utc>,
    ) -> Result<AdvanceResponse, JobError> {
        let changes = journal.changes_for_job(&job.job_id)?;
        let summary = RunSummary::from_job(&job, &changes, self.config.summary_top_fields, now);
        journal.record_run(&summary)?;
        journal.delete_job(&job.operator)?;

        info!(
            event = "job_complete",
            job_id = %job.job_id,
            mode = %job.mode,
            changes = summary.change_count,
            replaced = job.references.replaced,
            failed = job.total_failed()
        );

        let scanned = job.queue.iter().map(|progress| progress.scanned).sum::<u64>();
        let last = &job.queue[job.index];
        Ok(AdvanceResponse {
            message: format!(
                "Migration {} complete ({}): scanned {}, updated {}, failed {}; {}.",
                job.job_id,
                job.mode,
                scanned,
                job.total_updated(),
                job.total_failed(),
                reference_counts(&job)
            ),
            stage: Stage::Complete,
            collection: last.collection,
            processed: scanned,
            total: None,
            updated: job.total_updated(),
            replacements: job.references.replaced,
            continue_: false,
        })
    }
}

/// Response for a call that leaves work to do.
fn progress_response(job: &Job, index: usize, stage: Stage) -> AdvanceResponse {
    let progress = &job.queue[index];
    let of_total = progress
        .total
        .map(|total| format!(" of {total}"))
        .unwrap_or_default();
    let verb = match stage {
        Stage::TableComplete => "Finished",
        _ => "Scanned",
    };
    AdvanceResponse {
        message: format!(
            "{verb} {}: {}{} rows scanned, {} updated, {} failed; {}.",
            progress.collection,
            progress.scanned,
            of_total,
            progress.updated,
            progress.failed,
            reference_counts(job)
        ),
        stage,
        collection: progress.collection,
        processed: progress.scanned,
        total: progress.total,
        updated: progress.updated,
        replacements: job.references.replaced,
        continue_: true,
    }
}

fn apply_report(job: &mut Job, index: usize, report: &BatchReport) {
    job.change_count += report.changes.len() as u64;
    job.references.merge(&report.tally);
    let progress = &mut job.queue[index];
    progress.scanned += report.scanned;
    progress.updated += report.updated;
    progress.failed += report.failed;
    progress.cursor = progress.cursor.max(report.cursor);
}

fn reference_counts(job: &Job) -> String {
    let references = &job.references;
    format!(
        "{} references replaced, skipped {} external, {} without target, {} already migrated",
        references.replaced,
        references.skipped_external,
        references.skipped_no_target,
        references.already_target
    )
}
