//! Resumable migration jobs over the record corpus.
//!
//! A job walks every queued collection in bounded batches. Each `advance`
//! call runs at most one batch, journals the resulting change records and
//! persists the cursor, so the caller can resume until the job completes.

use chrono::{DateTime, Utc};
use relink_core::{Collection, ErrorPayload, JobContractError};
use relink_storage::StorageError;
use std::time::Duration;
use thiserror::Error;

mod audit;
mod scheduler;
mod walkers;

pub use audit::{rollback, view_log, RollbackReport};
pub use scheduler::JobScheduler;
pub use walkers::{walker_for, CollectionWalker};

pub const DEFAULT_STUCK_BATCH_LIMIT: u32 = 3;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("contract error: {0}")]
    Contract(#[from] JobContractError),
    #[error("invalid operator id {operator:?}: {reason}")]
    InvalidOperator {
        operator: String,
        reason: &'static str,
    },
    #[error("no active migration job for {operator}")]
    NoActiveJob { operator: String },
    #[error("job state for {operator} was unreadable and has been cleared: {reason}")]
    CorruptState {
        operator: String,
        job_id: String,
        reason: String,
    },
    #[error("job {job_id} aborted: {collection} cursor stuck at {cursor} for {batches} batches")]
    StuckLoop {
        job_id: String,
        collection: Collection,
        cursor: i64,
        batches: u32,
    },
    #[error("no completed migration run for {operator}")]
    NoAuditRun { operator: String },
    #[error("run {job_id} was a dry run; nothing to roll back")]
    DryRunRollback { job_id: String },
    #[error("run {job_id} was already rolled back at {at}")]
    AlreadyRolledBack { job_id: String, at: DateTime<Utc> },
    #[error("record {record} does not belong to {collection}")]
    MismatchedRecord {
        collection: Collection,
        record: String,
    },
}

impl JobError {
    /// Whether repeating the same call can succeed without operator action.
    pub fn non_retryable(&self) -> bool {
        !matches!(self, JobError::Storage(_))
    }

    pub fn debug_context(&self) -> Option<String> {
        match self {
            JobError::Storage(err) => Some(format!("{err:?}")),
            JobError::CorruptState { job_id, reason, .. } => {
                Some(format!("step=load_state job_id={job_id} reason={reason}"))
            }
            JobError::StuckLoop {
                job_id,
                collection,
                cursor,
                batches,
            } => Some(format!(
                "step=advance job_id={job_id} collection={collection} cursor={cursor} stuck_batches={batches}"
            )),
            JobError::DryRunRollback { job_id } | JobError::AlreadyRolledBack { job_id, .. } => {
                Some(format!("step=rollback job_id={job_id}"))
            }
            JobError::MismatchedRecord { collection, record } => {
                Some(format!("step=write collection={collection} record={record}"))
            }
            JobError::Contract(_)
            | JobError::InvalidOperator { .. }
            | JobError::NoActiveJob { .. }
            | JobError::NoAuditRun { .. } => None,
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            message: self.to_string(),
            debug: self.debug_context(),
            non_retryable: self.non_retryable(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobConfig {
    pub collections: Vec<Collection>,
    pub batch_size: usize,
    /// Wall-clock ceiling for one `advance` call.
    pub time_budget: Duration,
    /// Idle lifetime of a persisted job slot.
    pub state_ttl: chrono::Duration,
    pub excerpt_chars: usize,
    pub summary_top_fields: usize,
    pub stuck_batch_limit: u32,
    /// Metadata keys describing an attachment itself; never rewritten.
    pub skip_meta_keys: Vec<String>,
    pub skipped_option_prefixes: Vec<String>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            collections: Collection::DEFAULT_QUEUE.to_vec(),
            batch_size: 200,
            time_budget: Duration::from_secs(20),
            state_ttl: chrono::Duration::hours(1),
            excerpt_chars: 200,
            summary_top_fields: 10,
            stuck_batch_limit: DEFAULT_STUCK_BATCH_LIMIT,
            skip_meta_keys: vec![
                "_wp_attached_file".to_string(),
                "_wp_attachment_metadata".to_string(),
            ],
            skipped_option_prefixes: vec![
                "_transient_".to_string(),
                "_site_transient_".to_string(),
            ],
        }
    }
}

/// Operator ids key the job slot; reject anything that can't be one.
fn validate_operator(operator: &str) -> Result<(), JobError> {
    let reason = if operator.trim().is_empty() {
        Some("must not be empty")
    } else if operator.len() > 128 {
        Some("must be at most 128 bytes")
    } else if operator.chars().any(char::is_control) {
        Some("must not contain control characters")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(JobError::InvalidOperator {
            operator: operator.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
pub(crate) mod test_support;
