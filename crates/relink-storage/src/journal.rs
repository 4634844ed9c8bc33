use crate::{parse_timestamp, to_sql_conversion_error, StorageError};
use chrono::{DateTime, Duration, Utc};
use relink_core::{ChangeRecord, Collection, Job, RecordKey, RunSummary};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::debug;

pub const JOURNAL_SCHEMA_VERSION: i64 = 1;

/// What the per-operator job slot currently holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobSlot {
    Empty,
    Expired { job_id: String },
    Corrupt { job_id: String, reason: String },
    Active(Box<Job>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRun {
    pub summary: RunSummary,
    pub rolled_back_at: Option<DateTime<Utc>>,
}

/// Job state slots and the audit journal. Lives outside the record corpus.
pub struct JournalStore {
    conn: Connection,
}

impl JournalStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > JOURNAL_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: JOURNAL_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_journal_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    /// Upserts the operator's job slot and pushes its expiry `ttl` past `now`.
    pub fn save_job(&self, job: &Job, now: DateTime<Utc>, ttl: Duration) -> Result<(), StorageError> {
        let state_json = serde_json::to_string(job)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        self.conn.execute(
            "
            INSERT INTO job_state (operator, job_id, state_json, updated_at, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(operator) DO UPDATE SET
                job_id=excluded.job_id,
                state_json=excluded.state_json,
                updated_at=excluded.updated_at,
                expires_at=excluded.expires_at
            ",
            params![
                job.operator,
                job.job_id,
                state_json,
                now.to_rfc3339(),
                (now + ttl).to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn load_job(&self, operator: &str, now: DateTime<Utc>) -> Result<JobSlot, StorageError> {
        let row = self
            .conn
            .query_row(
                "
                SELECT job_id, state_json, expires_at
                FROM job_state
                WHERE operator = ?1
                ",
                [operator],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((job_id, state_json, expires_at)) = row else {
            return Ok(JobSlot::Empty);
        };

        let expires_at = match parse_timestamp(&expires_at) {
            Ok(expires_at) => expires_at,
            Err(err) => {
                return Ok(JobSlot::Corrupt {
                    job_id,
                    reason: err.to_string(),
                })
            }
        };
        if expires_at <= now {
            return Ok(JobSlot::Expired { job_id });
        }

        match serde_json::from_str::<Job>(&state_json) {
            Ok(job) => Ok(JobSlot::Active(Box::new(job))),
            Err(err) => Ok(JobSlot::Corrupt {
                job_id,
                reason: err.to_string(),
            }),
        }
    }

    pub fn delete_job(&self, operator: &str) -> Result<bool, StorageError> {
        let changes = self
            .conn
            .execute("DELETE FROM job_state WHERE operator = ?1", [operator])?;
        Ok(changes > 0)
    }

    /// Writes one change row ahead of the record write it describes.
    pub fn append_change(
        &self,
        job_id: &str,
        seq: u64,
        change: &ChangeRecord,
    ) -> Result<(), StorageError> {
        insert_change(&self.conn, job_id, seq, change)?;
        debug!(event = "journal_change_appended", job_id, seq);
        Ok(())
    }

    /// Appends `changes` with consecutive sequence numbers in one transaction.
    pub fn append_changes(
        &self,
        job_id: &str,
        first_seq: u64,
        changes: &[ChangeRecord],
    ) -> Result<(), StorageError> {
        if changes.is_empty() {
            return Ok(());
        }

        let tx = self.conn.unchecked_transaction()?;
        for (offset, change) in changes.iter().enumerate() {
            insert_change(&tx, job_id, first_seq + offset as u64, change)?;
        }
        tx.commit()?;
        debug!(
            event = "journal_changes_appended",
            job_id,
            first_seq,
            count = changes.len()
        );
        Ok(())
    }

    /// Sequence number the job's next change row takes.
    pub fn next_change_seq(&self, job_id: &str) -> Result<u64, StorageError> {
        let next: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(seq) + 1, 0) FROM audit_changes WHERE job_id = ?1",
            [job_id],
            |row| row.get(0),
        )?;
        Ok(next.max(0) as u64)
    }

    /// Withdraws a change row whose record write did not happen.
    pub fn remove_change(&self, job_id: &str, seq: u64) -> Result<bool, StorageError> {
        let removed = self.conn.execute(
            "DELETE FROM audit_changes WHERE job_id = ?1 AND seq = ?2",
            params![job_id, seq as i64],
        )?;
        Ok(removed > 0)
    }

    pub fn changes_for_job(&self, job_id: &str) -> Result<Vec<ChangeRecord>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT collection, record_json, field, before_excerpt, after_excerpt, original_value, replacements
            FROM audit_changes
            WHERE job_id = ?1
            ORDER BY seq ASC
            ",
        )?;
        let rows = stmt.query_map([job_id], |row| {
            let collection: String = row.get(0)?;
            let collection = collection.parse::<Collection>().map_err(|reason| {
                to_sql_conversion_error(0, StorageError::Serialization(reason))
            })?;
            let record_json: String = row.get(1)?;
            let record = serde_json::from_str::<RecordKey>(&record_json).map_err(|err| {
                to_sql_conversion_error(1, StorageError::Serialization(err.to_string()))
            })?;

            Ok(ChangeRecord {
                collection,
                record,
                field: row.get(2)?,
                before: row.get(3)?,
                after: row.get(4)?,
                original: row.get(5)?,
                replacements: row.get::<_, i64>(6)?.max(0) as u64,
            })
        })?;

        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn change_count(&self, job_id: &str) -> Result<u64, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM audit_changes WHERE job_id = ?1",
            [job_id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Drops journal rows of a job that never completed.
    pub fn discard_changes(&self, job_id: &str) -> Result<usize, StorageError> {
        Ok(self
            .conn
            .execute("DELETE FROM audit_changes WHERE job_id = ?1", [job_id])?)
    }

    pub fn record_run(&self, summary: &RunSummary) -> Result<(), StorageError> {
        let summary_json = serde_json::to_string(summary)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        self.conn.execute(
            "
            INSERT OR REPLACE INTO audit_runs (
                job_id,
                operator,
                mode,
                created_at,
                completed_at,
                change_count,
                summary_json,
                rolled_back_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL)
            ",
            params![
                summary.job_id,
                summary.operator,
                summary.mode.as_str(),
                summary.created_at.to_rfc3339(),
                summary.completed_at.to_rfc3339(),
                summary.change_count as i64,
                summary_json,
            ],
        )?;
        Ok(())
    }

    /// Most recently completed run for the operator.
    pub fn latest_run(&self, operator: &str) -> Result<Option<StoredRun>, StorageError> {
        let run = self
            .conn
            .query_row(
                "
                SELECT summary_json, rolled_back_at
                FROM audit_runs
                WHERE operator = ?1
                ORDER BY completed_at DESC, rowid DESC
                LIMIT 1
                ",
                [operator],
                |row| {
                    let summary_json: String = row.get(0)?;
                    let summary =
                        serde_json::from_str::<RunSummary>(&summary_json).map_err(|err| {
                            to_sql_conversion_error(
                                0,
                                StorageError::Serialization(err.to_string()),
                            )
                        })?;
                    let rolled_back_at = row
                        .get::<_, Option<String>>(1)?
                        .map(|value| parse_timestamp(&value))
                        .transpose()
                        .map_err(|err| to_sql_conversion_error(1, err))?;
                    Ok(StoredRun {
                        summary,
                        rolled_back_at,
                    })
                },
            )
            .optional()?;

        Ok(run)
    }

    pub fn mark_rolled_back(&self, job_id: &str, at: DateTime<Utc>) -> Result<(), StorageError> {
        let changes = self.conn.execute(
            "UPDATE audit_runs SET rolled_back_at = ?1 WHERE job_id = ?2",
            params![at.to_rfc3339(), job_id],
        )?;
        if changes == 0 {
            return Err(StorageError::RowNotFound {
                store: "audit_runs",
                key: job_id.to_string(),
            });
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    /// Raw slot write, for exercising corrupt-state handling.
    #[cfg(any(test, feature = "test-support"))]
    pub fn put_raw_job_state(
        &self,
        operator: &str,
        job_id: &str,
        state_json: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT OR REPLACE INTO job_state (operator, job_id, state_json, updated_at, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            params![
                operator,
                job_id,
                state_json,
                Utc::now().to_rfc3339(),
                expires_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }
}

fn insert_change(
    conn: &Connection,
    job_id: &str,
    seq: u64,
    change: &ChangeRecord,
) -> Result<(), StorageError> {
    let record_json = serde_json::to_string(&change.record)
        .map_err(|err| StorageError::Serialization(err.to_string()))?;
    conn.execute(
        "
        INSERT INTO audit_changes (
            job_id,
            seq,
            collection,
            record_json,
            field,
            before_excerpt,
            after_excerpt,
            original_value,
            replacements
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ",
        params![
            job_id,
            seq as i64,
            change.collection.as_str(),
            record_json,
            change.field,
            change.before,
            change.after,
            change.original,
            change.replacements as i64,
        ],
    )?;
    Ok(())
}
