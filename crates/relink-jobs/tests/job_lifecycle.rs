use chrono::{DateTime, Duration, TimeZone, Utc};
use relink_core::{Collection, JobMode, Stage};
use relink_jobs::{rollback, view_log, JobConfig, JobError, JobScheduler};
use relink_rewrite::{
    LocalFs, ProtectedFieldPolicy, ReferenceResolver, ResolverConfig, RewriteConfig, ValueRewriter,
};
use relink_storage::{JournalStore, MetaOwner, PostField, SiteStore};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

const OPERATOR: &str = "alice";

struct Fixture {
    dir: TempDir,
    site: SiteStore,
    journal: JournalStore,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("files")).expect("create upload dir");
        let site = SiteStore::open(dir.path().join("site.sqlite3")).expect("open site");
        let journal =
            JournalStore::open(dir.path().join("journal.sqlite3")).expect("open journal");
        Self { dir, site, journal }
    }

    fn site_db(&self) -> PathBuf {
        self.dir.path().join("site.sqlite3")
    }

    fn journal_db(&self) -> PathBuf {
        self.dir.path().join("journal.sqlite3")
    }

    fn upload(&self, relative: &str) {
        let path = self.dir.path().join("files").join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, b"img").expect("write upload");
    }

    fn scheduler(&self, config: JobConfig) -> JobScheduler<LocalFs> {
        let resolver = ReferenceResolver::new(
            ResolverConfig {
                upload_url: "https://example.com/files".to_string(),
                upload_dir: self.dir.path().join("files"),
                site_url: "https://example.com".to_string(),
                site_root: self.dir.path().to_path_buf(),
                ..ResolverConfig::default()
            },
            LocalFs,
        );
        let rewriter = ValueRewriter::new(
            resolver,
            RewriteConfig::default(),
            ProtectedFieldPolicy::new(["custom_logo", "site_logo", "site_icon"]),
        )
        .expect("rewriter");
        JobScheduler::new(config, rewriter)
    }

    /// Starts a job at `started` and advances it until complete; returns the
    /// number of `advance` calls.
    fn run_from(
        &self,
        scheduler: &JobScheduler<LocalFs>,
        mode: JobMode,
        started: DateTime<Utc>,
    ) -> usize {
        scheduler
            .start_job(&self.journal, OPERATOR, mode, started)
            .expect("start job");
        for call in 1..=200 {
            let response = scheduler
                .advance(&self.site, &self.journal, OPERATOR, started + Duration::seconds(1))
                .expect("advance");
            if response.stage == Stage::Complete {
                assert!(!response.continue_);
                return call;
            }
            assert!(response.continue_);
        }
        panic!("job did not complete");
    }

    fn run(&self, scheduler: &JobScheduler<LocalFs>, mode: JobMode) -> usize {
        self.run_from(scheduler, mode, ts(0))
    }

    fn post_content(&self, id: i64) -> String {
        self.site
            .post_field(id, PostField::Content)
            .expect("read post")
            .expect("post exists")
    }
}

fn ts(min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, min, 0)
        .single()
        .expect("valid timestamp")
}

#[test]
fn content_reference_is_rewritten_when_target_exists() {
    let fixture = Fixture::new();
    fixture.upload("a.jpg");
    fixture.upload("a.webp");
    let id = fixture
        .site
        .insert_post("post", "Hello", "<img src='/files/a.jpg'>", "")
        .expect("insert post");

    let scheduler = fixture.scheduler(JobConfig::default());
    fixture.run(&scheduler, JobMode::Live);

    assert_eq!(fixture.post_content(id), "<img src='/files/a.webp'>");
    let view = view_log(&fixture.journal, OPERATOR).expect("view log");
    assert_eq!(view.summary.references.replaced, 1);
    assert_eq!(view.summary.change_count, 1);
    assert_eq!(view.log[0].before, "<img src='/files/a.jpg'>");
}

#[test]
fn missing_target_leaves_content_and_counts_no_target() {
    let fixture = Fixture::new();
    fixture.upload("a.jpg");
    let id = fixture
        .site
        .insert_post("post", "Hello", "<img src='/files/a.jpg'>", "")
        .expect("insert post");

    let scheduler = fixture.scheduler(JobConfig::default());
    fixture.run(&scheduler, JobMode::Live);

    assert_eq!(fixture.post_content(id), "<img src='/files/a.jpg'>");
    let view = view_log(&fixture.journal, OPERATOR).expect("view log");
    assert_eq!(view.summary.references.skipped_no_target, 1);
    assert_eq!(view.summary.references.replaced, 0);
    assert!(view.log.is_empty());
}

#[test]
fn external_reference_in_serialized_option_is_untouched() {
    let fixture = Fixture::new();
    let url = "http://external.com/b.png";
    let value = format!("a:1:{{i:0;a:1:{{s:3:\"url\";s:{}:\"{url}\";}}}}", url.len());
    fixture
        .site
        .set_option("gallery", &value)
        .expect("set option");

    let scheduler = fixture.scheduler(JobConfig::default());
    fixture.run(&scheduler, JobMode::Live);

    assert_eq!(
        fixture
            .site
            .option_value("gallery")
            .expect("read option")
            .as_deref(),
        Some(value.as_str())
    );
    let view = view_log(&fixture.journal, OPERATOR).expect("view log");
    assert_eq!(view.summary.references.skipped_external, 1);
}

#[test]
fn protected_logo_identifier_is_swapped_for_migrated_attachment() {
    let fixture = Fixture::new();
    fixture.upload("logo.png");
    fixture.upload("logo.webp");
    let legacy = fixture
        .site
        .insert_attachment("logo.png")
        .expect("legacy attachment");
    let migrated = fixture
        .site
        .insert_attachment("logo.webp")
        .expect("migrated attachment");
    fixture
        .site
        .set_theme_mod("storefront", "custom_logo", &legacy.to_string())
        .expect("set logo");

    let scheduler = fixture.scheduler(JobConfig::default());
    fixture.run(&scheduler, JobMode::Live);

    let logo = fixture
        .site
        .theme_mod("storefront", "custom_logo")
        .expect("read logo")
        .expect("logo exists");
    assert_eq!(logo, migrated.to_string());
    assert!(logo.parse::<i64>().is_ok());
}

#[test]
fn unreadable_store_aborts_after_three_stuck_batches() {
    let fixture = Fixture::new();
    let scheduler = fixture.scheduler(JobConfig {
        collections: vec![Collection::PostMeta, Collection::Options],
        ..JobConfig::default()
    });
    scheduler
        .start_job(&fixture.journal, OPERATOR, JobMode::Live, ts(0))
        .expect("start job");

    let conn = rusqlite::Connection::open(fixture.site_db()).expect("open raw site db");
    conn.execute_batch("DROP TABLE postmeta;")
        .expect("drop postmeta");

    for _ in 0..2 {
        let response = scheduler
            .advance(&fixture.site, &fixture.journal, OPERATOR, ts(1))
            .expect("stalled advance");
        assert_eq!(response.stage, Stage::Progress);
        assert_eq!(response.processed, 0);
        assert!(response.continue_);
    }

    let err = scheduler
        .advance(&fixture.site, &fixture.journal, OPERATOR, ts(1))
        .expect_err("stuck loop");
    assert!(matches!(
        err,
        JobError::StuckLoop {
            collection: Collection::PostMeta,
            cursor: 0,
            ..
        }
    ));
    assert!(err.non_retryable());

    let err = scheduler
        .advance(&fixture.site, &fixture.journal, OPERATOR, ts(1))
        .expect_err("state deleted");
    assert!(matches!(err, JobError::NoActiveJob { .. }));
}

#[test]
fn rollback_restores_every_changed_field() {
    let fixture = Fixture::new();
    fixture.upload("a.jpg");
    fixture.upload("a.webp");
    fixture.upload("2024/b.png");
    fixture.upload("2024/b.webp");

    let first = fixture
        .site
        .insert_post("post", "One", "<img src='/files/a.jpg'>", "")
        .expect("insert first");
    let second = fixture
        .site
        .insert_post(
            "page",
            "Two",
            "<div style=\"background:url(https://example.com/files/2024/b.png)\"></div>",
            "",
        )
        .expect("insert second");
    let meta_id = fixture
        .site
        .insert_meta(MetaOwner::Post, first, "hero", "https://example.com/files/a.jpg")
        .expect("insert meta");
    fixture
        .site
        .set_option("banner", "{\"src\":\"\\/files\\/2024\\/b.png\"}")
        .expect("set option");
    let term = fixture
        .site
        .insert_term_taxonomy(3, "category", "<img srcset=\"/files/a.jpg 1x\">")
        .expect("insert term");

    let originals = (
        fixture.post_content(first),
        fixture.post_content(second),
        fixture
            .site
            .meta_value(MetaOwner::Post, meta_id)
            .expect("meta"),
        fixture.site.option_value("banner").expect("option"),
        fixture.site.term_description(term).expect("term"),
    );

    let scheduler = fixture.scheduler(JobConfig::default());
    fixture.run(&scheduler, JobMode::Live);

    let view = view_log(&fixture.journal, OPERATOR).expect("view log");
    assert_eq!(view.summary.change_count, 5);
    assert_eq!(
        fixture.site.option_value("banner").expect("option").as_deref(),
        Some("{\"src\":\"\\/files\\/2024\\/b.webp\"}")
    );

    let report = rollback(&fixture.site, &fixture.journal, OPERATOR, ts(5)).expect("rollback");
    assert_eq!(report.restored, 5);
    assert_eq!(report.failed, 0);

    let restored = (
        fixture.post_content(first),
        fixture.post_content(second),
        fixture
            .site
            .meta_value(MetaOwner::Post, meta_id)
            .expect("meta"),
        fixture.site.option_value("banner").expect("option"),
        fixture.site.term_description(term).expect("term"),
    );
    assert_eq!(restored, originals);

    let view = view_log(&fixture.journal, OPERATOR).expect("view log");
    assert_eq!(view.rolled_back_at, Some(ts(5)));
}

#[test]
fn journal_outage_leaves_records_unwritten_and_rollback_complete() {
    let fixture = Fixture::new();
    fixture.upload("a.jpg");
    fixture.upload("a.webp");
    let id = fixture
        .site
        .insert_post("post", "Hello", "<img src='/files/a.jpg'>", "")
        .expect("insert post");

    let scheduler = fixture.scheduler(JobConfig {
        collections: vec![Collection::Posts],
        ..JobConfig::default()
    });
    scheduler
        .start_job(&fixture.journal, OPERATOR, JobMode::Live, ts(0))
        .expect("start job");

    let raw = rusqlite::Connection::open(fixture.journal_db()).expect("open raw journal");
    raw.execute_batch("DROP TABLE audit_changes;")
        .expect("drop audit table");
    let err = scheduler
        .advance(&fixture.site, &fixture.journal, OPERATOR, ts(1))
        .expect_err("journal unavailable");
    assert!(matches!(err, JobError::Storage(_)));
    assert!(!err.non_retryable());
    assert_eq!(fixture.post_content(id), "<img src='/files/a.jpg'>");

    raw.execute_batch(include_str!(
        "../../relink-storage/migrations/0001_journal_schema.sql"
    ))
    .expect("recreate audit table");
    let done = scheduler
        .advance(&fixture.site, &fixture.journal, OPERATOR, ts(2))
        .expect("retry advance");
    assert_eq!(done.stage, Stage::Complete);
    assert_eq!(fixture.post_content(id), "<img src='/files/a.webp'>");

    let report = rollback(&fixture.site, &fixture.journal, OPERATOR, ts(5)).expect("rollback");
    assert_eq!(report.restored, 1);
    assert_eq!(fixture.post_content(id), "<img src='/files/a.jpg'>");
}

#[test]
fn dry_run_reports_changes_without_mutating_and_refuses_rollback() {
    let fixture = Fixture::new();
    fixture.upload("a.jpg");
    fixture.upload("a.webp");
    let id = fixture
        .site
        .insert_post("post", "Hello", "<img src='/files/a.jpg'>", "")
        .expect("insert post");

    let scheduler = fixture.scheduler(JobConfig::default());
    fixture.run(&scheduler, JobMode::DryRun);

    assert_eq!(fixture.post_content(id), "<img src='/files/a.jpg'>");
    let view = view_log(&fixture.journal, OPERATOR).expect("view log");
    assert_eq!(view.summary.mode, JobMode::DryRun);
    assert_eq!(view.summary.change_count, 1);
    assert_eq!(view.summary.references.replaced, 1);
    assert_eq!(view.log[0].after, "<img src='/files/a.webp'>");

    let err = rollback(&fixture.site, &fixture.journal, OPERATOR, ts(5)).expect_err("dry run");
    assert!(matches!(err, JobError::DryRunRollback { .. }));
}

#[test]
fn second_live_run_replaces_nothing() {
    let fixture = Fixture::new();
    fixture.upload("a.jpg");
    fixture.upload("a.webp");
    fixture
        .site
        .insert_post("post", "Hello", "<img src='/files/a.jpg'> /files/a.jpg", "")
        .expect("insert post");

    let scheduler = fixture.scheduler(JobConfig::default());
    fixture.run(&scheduler, JobMode::Live);
    let first = view_log(&fixture.journal, OPERATOR).expect("first log");
    assert_eq!(first.summary.references.replaced, 2);

    fixture.run_from(&scheduler, JobMode::Live, ts(10));
    let second = view_log(&fixture.journal, OPERATOR).expect("second log");
    assert_ne!(second.summary.job_id, first.summary.job_id);
    assert_eq!(second.summary.references.replaced, 0);
    assert_eq!(second.summary.change_count, 0);
}

#[test]
fn small_batches_resume_across_calls() {
    let fixture = Fixture::new();
    fixture.upload("a.jpg");
    fixture.upload("a.webp");
    let ids = (0..5)
        .map(|index| {
            fixture
                .site
                .insert_post("post", &format!("p{index}"), "/files/a.jpg", "")
                .expect("insert post")
        })
        .collect::<Vec<_>>();

    let scheduler = fixture.scheduler(JobConfig {
        collections: vec![Collection::Posts],
        batch_size: 2,
        ..JobConfig::default()
    });
    scheduler
        .start_job(&fixture.journal, OPERATOR, JobMode::Live, ts(0))
        .expect("start job");

    let first = scheduler
        .advance(&fixture.site, &fixture.journal, OPERATOR, ts(1))
        .expect("first batch");
    assert_eq!(first.stage, Stage::Progress);
    assert_eq!(first.processed, 2);
    assert_eq!(first.total, Some(5));

    let second = scheduler
        .advance(&fixture.site, &fixture.journal, OPERATOR, ts(2))
        .expect("second batch");
    assert_eq!(second.processed, 4);

    let last = scheduler
        .advance(&fixture.site, &fixture.journal, OPERATOR, ts(3))
        .expect("last batch");
    assert_eq!(last.stage, Stage::Complete);
    assert_eq!(last.updated, 5);
    assert_eq!(last.replacements, 5);

    for id in ids {
        assert_eq!(fixture.post_content(id), "/files/a.webp");
    }
}

#[test]
fn reset_discards_progress_and_journal_rows() {
    let fixture = Fixture::new();
    fixture.upload("a.jpg");
    fixture.upload("a.webp");
    for index in 0..3 {
        fixture
            .site
            .insert_post("post", &format!("p{index}"), "/files/a.jpg", "")
            .expect("insert post");
    }
    let scheduler = fixture.scheduler(JobConfig {
        batch_size: 1,
        ..JobConfig::default()
    });
    let started = scheduler
        .start_job(&fixture.journal, OPERATOR, JobMode::DryRun, ts(0))
        .expect("start");
    scheduler
        .advance(&fixture.site, &fixture.journal, OPERATOR, ts(1))
        .expect("advance");
    assert_eq!(
        fixture
            .journal
            .change_count(&started.job_id)
            .expect("count changes"),
        1
    );

    scheduler
        .reset(&fixture.journal, OPERATOR, ts(2))
        .expect("reset");
    assert_eq!(
        fixture
            .journal
            .change_count(&started.job_id)
            .expect("count changes"),
        0
    );
    let err = scheduler
        .advance(&fixture.site, &fixture.journal, OPERATOR, ts(2) + Duration::seconds(1))
        .expect_err("no job after reset");
    assert!(matches!(err, JobError::NoActiveJob { .. }));
}
