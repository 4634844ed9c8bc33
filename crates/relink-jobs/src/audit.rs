use crate::walkers::walker_for;
use crate::{validate_operator, JobError};
use chrono::{DateTime, Utc};
use relink_core::{ChangeExcerpt, LogView, MessageResponse};
use relink_storage::{JournalStore, SiteStore};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    pub job_id: String,
    pub restored: u64,
    pub failed: u64,
}

impl RollbackReport {
    pub fn to_response(&self) -> MessageResponse {
        MessageResponse {
            message: format!(
                "Rolled back run {}: restored {} fields, {} failed.",
                self.job_id, self.restored, self.failed
            ),
        }
    }
}

/// Restores every field changed by the operator's latest live run.
///
/// Changes are replayed newest first so a field touched twice ends at its
/// pre-run value. Per-record failures are counted and do not stop the replay.
pub fn rollback(
    site: &SiteStore,
    journal: &JournalStore,
    operator: &str,
    now: DateTime<Utc>,
) -> Result<RollbackReport, JobError> {
    validate_operator(operator)?;
    let Some(run) = journal.latest_run(operator)? else {
        return Err(JobError::NoAuditRun {
            operator: operator.to_string(),
        });
    };
    let job_id = run.summary.job_id.clone();
    if run.summary.mode.is_dry_run() {
        return Err(JobError::DryRunRollback { job_id });
    }
    if let Some(at) = run.rolled_back_at {
        return Err(JobError::AlreadyRolledBack { job_id, at });
    }

    let changes = journal.changes_for_job(&job_id)?;
    let mut report = RollbackReport {
        job_id: job_id.clone(),
        ..RollbackReport::default()
    };
    for change in changes.iter().rev() {
        let walker = walker_for(change.collection);
        match walker.write_field(site, &change.record, &change.field, &change.original) {
            Ok(()) => report.restored += 1,
            Err(err) => {
                report.failed += 1;
                warn!(
                    event = "rollback_record_failed",
                    job_id = %job_id,
                    collection = %change.collection,
                    record = %change.record,
                    field = %change.field,
                    error = %err
                );
            }
        }
    }

    journal.mark_rolled_back(&job_id, now)?;
    info!(
        event = "rollback_complete",
        job_id = %job_id,
        restored = report.restored,
        failed = report.failed
    );
    Ok(report)
}

/// Latest run summary with its change excerpts; read-only.
pub fn view_log(journal: &JournalStore, operator: &str) -> Result<LogView, JobError> {
    validate_operator(operator)?;
    let Some(run) = journal.latest_run(operator)? else {
        return Err(JobError::NoAuditRun {
            operator: operator.to_string(),
        });
    };
    let changes = journal.changes_for_job(&run.summary.job_id)?;
    Ok(LogView {
        log: changes.iter().map(ChangeExcerpt::from).collect(),
        summary: run.summary,
        rolled_back_at: run.rolled_back_at,
    })
}
