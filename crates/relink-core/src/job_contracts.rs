use crate::{Collection, JobMode, RecordKey, ReferenceTally};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

pub const EXCERPT_ELLIPSIS: char = '…';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobContractError {
    #[error("job queue cannot be empty")]
    EmptyQueue,
    #[error("collection index {index} out of range for queue of {len}")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("collection {collection} appears twice in the queue")]
    DuplicateCollection { collection: Collection },
    #[error("job field {field} is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Cursor and counters for one collection in the job queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionProgress {
    pub collection: Collection,
    pub cursor: i64,
    pub scanned: u64,
    pub updated: u64,
    pub failed: u64,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub complete: bool,
}

impl CollectionProgress {
    pub fn new(collection: Collection) -> Self {
        Self {
            collection,
            cursor: 0,
            scanned: 0,
            updated: 0,
            failed: 0,
            total: None,
            complete: false,
        }
    }
}

/// Resumable migration run, persisted between `advance` calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub operator: String,
    pub mode: JobMode,
    pub queue: Vec<CollectionProgress>,
    pub index: usize,
    pub stuck_batches: u32,
    pub references: ReferenceTally,
    pub change_count: u64,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        operator: &str,
        mode: JobMode,
        collections: &[Collection],
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: job_id_for(operator, created_at),
            operator: operator.to_string(),
            mode,
            queue: collections
                .iter()
                .copied()
                .map(CollectionProgress::new)
                .collect(),
            index: 0,
            stuck_batches: 0,
            references: ReferenceTally::default(),
            change_count: 0,
            created_at,
        }
    }

    pub fn current(&self) -> Option<&CollectionProgress> {
        self.queue.get(self.index)
    }

    pub fn current_mut(&mut self) -> Option<&mut CollectionProgress> {
        self.queue.get_mut(self.index)
    }

    pub fn is_last_collection(&self) -> bool {
        self.index + 1 >= self.queue.len()
    }

    pub fn total_updated(&self) -> u64 {
        self.queue.iter().map(|progress| progress.updated).sum()
    }

    pub fn total_failed(&self) -> u64 {
        self.queue.iter().map(|progress| progress.failed).sum()
    }

    pub fn validate(&self) -> Result<(), JobContractError> {
        if self.queue.is_empty() {
            return Err(JobContractError::EmptyQueue);
        }
        if self.index >= self.queue.len() {
            return Err(JobContractError::IndexOutOfRange {
                index: self.index,
                len: self.queue.len(),
            });
        }
        if self.job_id.trim().is_empty() {
            return Err(JobContractError::InvalidField {
                field: "job_id",
                reason: "must be non-empty".to_string(),
            });
        }
        if self.operator.trim().is_empty() {
            return Err(JobContractError::InvalidField {
                field: "operator",
                reason: "must be non-empty".to_string(),
            });
        }

        let mut seen = Vec::with_capacity(self.queue.len());
        for progress in &self.queue {
            if seen.contains(&progress.collection) {
                return Err(JobContractError::DuplicateCollection {
                    collection: progress.collection,
                });
            }
            if progress.cursor < 0 {
                return Err(JobContractError::InvalidField {
                    field: "cursor",
                    reason: format!("{} cursor is negative", progress.collection),
                });
            }
            seen.push(progress.collection);
        }
        Ok(())
    }
}

pub fn job_id_for(operator: &str, created_at: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(operator.as_bytes());
    hasher.update(b"\n");
    hasher.update(created_at.to_rfc3339().as_bytes());
    let digest = hasher.finalize();
    digest
        .iter()
        .take(8)
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// One field-level mutation, recorded whether or not the run is a dry run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub collection: Collection,
    pub record: RecordKey,
    pub field: String,
    pub before: String,
    pub after: String,
    /// Full pre-run value, written back on rollback.
    pub original: String,
    pub replacements: u64,
}

impl ChangeRecord {
    pub fn new(
        collection: Collection,
        record: RecordKey,
        field: impl Into<String>,
        original: &str,
        rewritten: &str,
        replacements: u64,
        excerpt_chars: usize,
    ) -> Self {
        Self {
            collection,
            record,
            field: field.into(),
            before: excerpt(original, excerpt_chars),
            after: excerpt(rewritten, excerpt_chars),
            original: original.to_string(),
            replacements,
        }
    }

    pub fn field_key(&self) -> String {
        format!("{}:{}", self.collection, self.field)
    }
}

/// Truncates to at most `max_chars` characters, marking the cut with an ellipsis.
pub fn excerpt(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let mut out = value
        .chars()
        .take(max_chars.saturating_sub(1))
        .collect::<String>();
    out.push(EXCERPT_ELLIPSIS);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Started,
    Progress,
    TableComplete,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartResponse {
    pub message: String,
    pub stage: Stage,
    pub collection: Collection,
    pub job_id: String,
    pub mode: JobMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvanceResponse {
    pub message: String,
    pub stage: Stage,
    pub collection: Collection,
    pub processed: u64,
    pub total: Option<u64>,
    pub updated: u64,
    pub replacements: u64,
    #[serde(rename = "continue")]
    pub continue_: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<String>,
    pub non_retryable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSummary {
    pub collection: Collection,
    pub scanned: u64,
    pub updated: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldCount {
    pub field_key: String,
    pub changes: u64,
}

/// Compact description of a completed run, kept after the job state is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub job_id: String,
    pub operator: String,
    pub mode: JobMode,
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub collections: Vec<CollectionSummary>,
    pub references: ReferenceTally,
    pub change_count: u64,
    pub top_fields: Vec<FieldCount>,
}

impl RunSummary {
    pub fn from_job(
        job: &Job,
        changes: &[ChangeRecord],
        top_n: usize,
        completed_at: DateTime<Utc>,
    ) -> Self {
        let collections = job
            .queue
            .iter()
            .map(|progress| CollectionSummary {
                collection: progress.collection,
                scanned: progress.scanned,
                updated: progress.updated,
                failed: progress.failed,
            })
            .collect();

        Self {
            job_id: job.job_id.clone(),
            operator: job.operator.clone(),
            mode: job.mode,
            created_at: job.created_at,
            completed_at,
            collections,
            references: job.references,
            change_count: changes.len() as u64,
            top_fields: top_field_counts(changes, top_n),
        }
    }
}

pub fn top_field_counts(changes: &[ChangeRecord], top_n: usize) -> Vec<FieldCount> {
    let mut counts = BTreeMap::<String, u64>::new();
    for change in changes {
        *counts.entry(change.field_key()).or_default() += 1;
    }
    let mut ranked = counts
        .into_iter()
        .map(|(field_key, changes)| FieldCount { field_key, changes })
        .collect::<Vec<_>>();
    ranked.sort_by(|left, right| {
        right
            .changes
            .cmp(&left.changes)
            .then_with(|| left.field_key.cmp(&right.field_key))
    });
    ranked.truncate(top_n);
    ranked
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeExcerpt {
    pub collection: Collection,
    pub record: RecordKey,
    pub field: String,
    pub before: String,
    pub after: String,
    pub replacements: u64,
}

impl From<&ChangeRecord> for ChangeExcerpt {
    fn from(change: &ChangeRecord) -> Self {
        Self {
            collection: change.collection,
            record: change.record.clone(),
            field: change.field.clone(),
            before: change.before.clone(),
            after: change.after.clone(),
            replacements: change.replacements,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogView {
    pub log: Vec<ChangeExcerpt>,
    pub summary: RunSummary,
    #[serde(default)]
    pub rolled_back_at: Option<DateTime<Utc>>,
}
