use crate::{JobConfig, JobError};
use relink_core::{ChangeRecord, Collection, JobMode, RecordKey, ReferenceTally};
use relink_rewrite::{AssetFs, AssetIndex, RewriteOutcome, ValueRewriter};
use relink_storage::{
    JournalStore, MetaOwner, PostField, SiteStore, StorageError, StoredField, StoredRow,
};
use std::time::Instant;
use tracing::{debug, warn};

/// Read/write primitives for one record store.
pub trait CollectionWalker: Sync {
    fn collection(&self) -> Collection;

    /// Candidate count for progress display; most stores have none.
    fn total(&self, _site: &SiteStore, _extensions: &[String]) -> Result<Option<u64>, StorageError> {
        Ok(None)
    }

    /// Records with cursor strictly greater than `cursor`, ascending, at most `limit`.
    fn fetch_batch(
        &self,
        site: &SiteStore,
        cursor: i64,
        limit: usize,
        extensions: &[String],
    ) -> Result<Vec<StoredRow>, StorageError>;

    fn write_field(
        &self,
        site: &SiteStore,
        record: &RecordKey,
        field: &str,
        value: &str,
    ) -> Result<(), JobError>;

    fn skips_field(&self, _field: &StoredField, _config: &JobConfig) -> bool {
        false
    }

    /// Fields here may hold attachment identifiers.
    fn holds_identifiers(&self) -> bool {
        false
    }
}

struct PostsWalker;

struct MetaWalker {
    collection: Collection,
    owner: MetaOwner,
}

struct OptionsWalker;

struct TermDescriptionsWalker;

struct ThemeModsWalker;

static POSTS: PostsWalker = PostsWalker;
static POST_META: MetaWalker = MetaWalker {
    collection: Collection::PostMeta,
    owner: MetaOwner::Post,
};
static USER_META: MetaWalker = MetaWalker {
    collection: Collection::UserMeta,
    owner: MetaOwner::User,
};
static TERM_META: MetaWalker = MetaWalker {
    collection: Collection::TermMeta,
    owner: MetaOwner::Term,
};
static OPTIONS: OptionsWalker = OptionsWalker;
static TERM_DESCRIPTIONS: TermDescriptionsWalker = TermDescriptionsWalker;
static THEME_MODS: ThemeModsWalker = ThemeModsWalker;

pub fn walker_for(collection: Collection) -> &'static dyn CollectionWalker {
    match collection {
        Collection::Posts => &POSTS,
        Collection::PostMeta => &POST_META,
        Collection::UserMeta => &USER_META,
        Collection::TermMeta => &TERM_META,
        Collection::Options => &OPTIONS,
        Collection::TermDescriptions => &TERM_DESCRIPTIONS,
        Collection::ThemeMods => &THEME_MODS,
    }
}

fn mismatched(collection: Collection, record: &RecordKey) -> JobError {
    JobError::MismatchedRecord {
        collection,
        record: record.to_string(),
    }
}

impl CollectionWalker for PostsWalker {
    fn collection(&self) -> Collection {
        Collection::Posts
    }

    fn total(&self, site: &SiteStore, extensions: &[String]) -> Result<Option<u64>, StorageError> {
        site.count_post_candidates(extensions).map(Some)
    }

    fn fetch_batch(
        &self,
        site: &SiteStore,
        cursor: i64,
        limit: usize,
        extensions: &[String],
    ) -> Result<Vec<StoredRow>, StorageError> {
        site.posts_batch(cursor, limit, extensions)
    }

    fn write_field(
        &self,
        site: &SiteStore,
        record: &RecordKey,
        field: &str,
        value: &str,
    ) -> Result<(), JobError> {
        let RecordKey::Row { id } = record else {
            return Err(mismatched(self.collection(), record));
        };
        let Some(column) = PostField::from_column(field) else {
            return Err(mismatched(self.collection(), record));
        };
        Ok(site.update_post_field(*id, column, value)?)
    }
}

impl CollectionWalker for MetaWalker {
    fn collection(&self) -> Collection {
        self.collection
    }

    fn fetch_batch(
        &self,
        site: &SiteStore,
        cursor: i64,
        limit: usize,
        extensions: &[String],
    ) -> Result<Vec<StoredRow>, StorageError> {
        site.meta_batch(self.owner, cursor, limit, extensions)
    }

    fn write_field(
        &self,
        site: &SiteStore,
        record: &RecordKey,
        _field: &str,
        value: &str,
    ) -> Result<(), JobError> {
        let RecordKey::Meta { meta_id, .. } = record else {
            return Err(mismatched(self.collection, record));
        };
        Ok(site.update_meta_value(self.owner, *meta_id, value)?)
    }

    fn skips_field(&self, field: &StoredField, config: &JobConfig) -> bool {
        config.skip_meta_keys.iter().any(|key| *key == field.name)
    }
}

impl CollectionWalker for OptionsWalker {
    fn collection(&self) -> Collection {
        Collection::Options
    }

    fn fetch_batch(
        &self,
        site: &SiteStore,
        cursor: i64,
        limit: usize,
        extensions: &[String],
    ) -> Result<Vec<StoredRow>, StorageError> {
        site.options_batch(cursor, limit, extensions)
    }

    fn write_field(
        &self,
        site: &SiteStore,
        record: &RecordKey,
        _field: &str,
        value: &str,
    ) -> Result<(), JobError> {
        let RecordKey::Option { name, .. } = record else {
            return Err(mismatched(self.collection(), record));
        };
        Ok(site.set_option(name, value)?)
    }

    fn skips_field(&self, field: &StoredField, config: &JobConfig) -> bool {
        config
            .skipped_option_prefixes
            .iter()
            .any(|prefix| field.name.starts_with(prefix.as_str()))
    }
}

impl CollectionWalker for TermDescriptionsWalker {
    fn collection(&self) -> Collection {
        Collection::TermDescriptions
    }

    fn fetch_batch(
        &self,
        site: &SiteStore,
        cursor: i64,
        limit: usize,
        extensions: &[String],
    ) -> Result<Vec<StoredRow>, StorageError> {
        site.term_descriptions_batch(cursor, limit, extensions)
    }

    fn write_field(
        &self,
        site: &SiteStore,
        record: &RecordKey,
        _field: &str,
        value: &str,
    ) -> Result<(), JobError> {
        let RecordKey::Row { id } = record else {
            return Err(mismatched(self.collection(), record));
        };
        Ok(site.update_term_description(*id, value)?)
    }
}

impl CollectionWalker for ThemeModsWalker {
    fn collection(&self) -> Collection {
        Collection::ThemeMods
    }

    /// Single pass over every setting; `cursor` only skips rows already
    /// handled by an earlier call that ran out of time.
    fn fetch_batch(
        &self,
        site: &SiteStore,
        cursor: i64,
        _limit: usize,
        _extensions: &[String],
    ) -> Result<Vec<StoredRow>, StorageError> {
        Ok(site
            .theme_mods()?
            .into_iter()
            .filter(|row| row.cursor > cursor)
            .collect())
    }

    fn write_field(
        &self,
        site: &SiteStore,
        record: &RecordKey,
        _field: &str,
        value: &str,
    ) -> Result<(), JobError> {
        let RecordKey::ThemeMod { theme, name } = record else {
            return Err(mismatched(self.collection(), record));
        };
        Ok(site.set_theme_mod(theme, name, value)?)
    }

    fn holds_identifiers(&self) -> bool {
        true
    }
}

/// Attachment lookups against the corpus.
struct SiteAssetIndex<'a>(&'a SiteStore);

impl AssetIndex for SiteAssetIndex<'_> {
    type Error = StorageError;

    fn attachment_file(&self, id: i64) -> Result<Option<String>, StorageError> {
        self.0.attachment_file(id)
    }

    fn attachment_id_for_file(&self, relative_file: &str) -> Result<Option<i64>, StorageError> {
        self.0.attachment_id_for_file(relative_file)
    }
}

pub(crate) struct BatchContext<'a, F> {
    pub site: &'a SiteStore,
    pub journal: &'a JournalStore,
    pub job_id: &'a str,
    pub rewriter: &'a ValueRewriter<F>,
    pub config: &'a JobConfig,
    pub mode: JobMode,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct BatchReport {
    pub fetched: usize,
    pub scanned: u64,
    pub updated: u64,
    pub failed: u64,
    pub tally: ReferenceTally,
    /// Cursor of the last processed record.
    pub cursor: i64,
    pub complete: bool,
    pub timed_out: bool,
    pub fetch_failed: bool,
    /// Sequence number for the next journal row.
    pub next_seq: u64,
    pub changes: Vec<ChangeRecord>,
}

/// Runs one bounded batch. A store read error yields an empty non-complete
/// batch with the cursor unchanged. Every change is journaled before its
/// record is written, so only a journal failure is returned as an error.
pub(crate) fn walk_batch<F: AssetFs>(
    walker: &dyn CollectionWalker,
    ctx: &BatchContext<'_, F>,
    cursor: i64,
    first_seq: u64,
    deadline: Instant,
) -> Result<BatchReport, JobError> {
    let collection = walker.collection();
    let extensions = ctx.rewriter.resolver().legacy_extensions();
    let mut report = BatchReport {
        cursor,
        next_seq: first_seq,
        ..BatchReport::default()
    };

    let rows = match walker.fetch_batch(ctx.site, cursor, ctx.config.batch_size, extensions) {
        Ok(rows) => rows,
        Err(err) => {
            warn!(
                event = "walker_fetch_failed",
                collection = %collection,
                cursor,
                error = %err,
                "store read failed; batch treated as empty"
            );
            report.fetch_failed = true;
            return Ok(report);
        }
    };
    report.fetched = rows.len();

    for (position, row) in rows.iter().enumerate() {
        process_row(walker, ctx, row, &mut report)?;
        report.cursor = row.cursor;

        if position + 1 < rows.len() && Instant::now() >= deadline {
            report.timed_out = true;
            debug!(
                event = "batch_time_budget_exhausted",
                collection = %collection,
                cursor = report.cursor,
                processed = position + 1
            );
            break;
        }
    }

    report.complete = !report.timed_out
        && (!collection.is_paginated() || report.fetched < ctx.config.batch_size);
    Ok(report)
}

fn process_row<F: AssetFs>(
    walker: &dyn CollectionWalker,
    ctx: &BatchContext<'_, F>,
    row: &StoredRow,
    report: &mut BatchReport,
) -> Result<(), JobError> {
    let collection = walker.collection();
    let mut row_updated = false;
    let mut row_failed = false;
    report.scanned += 1;

    for field in &row.fields {
        if walker.skips_field(field, ctx.config) {
            continue;
        }

        let outcome = rewrite_field(walker, ctx, field);
        let Some(rewritten) = outcome.value.as_deref() else {
            report.tally.merge(&outcome.tally);
            continue;
        };

        let change = ChangeRecord::new(
            collection,
            row.key.clone(),
            field.name.as_str(),
            &field.value,
            rewritten,
            outcome.tally.replaced,
            ctx.config.excerpt_chars,
        );
        let seq = report.next_seq;
        ctx.journal.append_change(ctx.job_id, seq, &change)?;
        report.next_seq += 1;

        if !ctx.mode.is_dry_run() {
            if let Err(err) = walker.write_field(ctx.site, &row.key, &field.name, rewritten) {
                warn!(
                    event = "record_write_failed",
                    collection = %collection,
                    record = %row.key,
                    field = %field.name,
                    error = %err
                );
                if let Err(err) = ctx.journal.remove_change(ctx.job_id, seq) {
                    warn!(
                        event = "journal_withdraw_failed",
                        job_id = ctx.job_id,
                        seq,
                        error = %err
                    );
                }
                let mut tally = outcome.tally;
                tally.replaced = 0;
                report.tally.merge(&tally);
                row_failed = true;
                continue;
            }
        }

        report.tally.merge(&outcome.tally);
        report.changes.push(change);
        row_updated = true;
    }

    if row_updated {
        report.updated += 1;
    }
    if row_failed {
        report.failed += 1;
    }
    Ok(())
}

fn rewrite_field<F: AssetFs>(
    walker: &dyn CollectionWalker,
    ctx: &BatchContext<'_, F>,
    field: &StoredField,
) -> RewriteOutcome {
    if walker.holds_identifiers() && ctx.rewriter.protected().is_protected(&field.name) {
        return ctx
            .rewriter
            .rewrite_protected(&field.value, &SiteAssetIndex(ctx.site));
    }
    ctx.rewriter.rewrite_field(&field.label, &field.value)
}
