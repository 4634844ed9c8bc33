mod config;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use config::{config_path, load_config, FileConfig};
use relink_core::JobMode;
use relink_jobs::{rollback, view_log, JobError, JobScheduler};
use relink_rewrite::{LocalFs, ReferenceResolver, ValueRewriter};
use relink_storage::{JournalStore, SiteStore};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "relink", about = "Rewrite legacy image references to their migrated format")]
struct Cli {
    /// Config file (defaults to $RELINK_CONFIG, then the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Operator owning the job slot (defaults to $USER)
    #[arg(long, global = true)]
    operator: Option<String>,
    /// Log at debug level
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a fresh job, replacing any existing one
    Start {
        #[arg(long)]
        dry_run: bool,
    },
    /// Process one batch of the active job
    Advance,
    /// Start a job and advance it until it completes or fails
    Run {
        #[arg(long)]
        dry_run: bool,
    },
    /// Discard the active job
    Reset,
    /// Restore every field changed by the latest live run
    Rollback,
    /// Show the latest run summary and its changes
    Log,
}

struct App {
    scheduler: JobScheduler<LocalFs>,
    site: SiteStore,
    journal: JournalStore,
    operator: String,
}

impl App {
    fn open(config: &FileConfig, operator: String) -> Result<Self> {
        let resolver = ReferenceResolver::new(config.resolver_config()?, LocalFs);
        let rewriter = ValueRewriter::new(
            resolver,
            config.rewrite_config(),
            config.protected_policy(),
        )
        .context("invalid legacy_extensions")?;
        let scheduler = JobScheduler::new(config.job_config()?, rewriter);

        let site = SiteStore::open(&config.site.database).with_context(|| {
            format!("failed to open site database {}", config.site.database.display())
        })?;
        ensure_parent(&config.journal.database)?;
        let journal = JournalStore::open(&config.journal.database).with_context(|| {
            format!(
                "failed to open journal database {}",
                config.journal.database.display()
            )
        })?;
        Ok(Self {
            scheduler,
            site,
            journal,
            operator,
        })
    }

    fn start(&self, dry_run: bool) -> Result<bool> {
        let mode = JobMode::from_dry_run(dry_run);
        emit(
            self.scheduler
                .start_job(&self.journal, &self.operator, mode, Utc::now()),
        )
    }

    fn advance(&self) -> Result<bool> {
        emit(
            self.scheduler
                .advance(&self.site, &self.journal, &self.operator, Utc::now()),
        )
    }

    fn run(&self, dry_run: bool) -> Result<bool> {
        if !self.start(dry_run)? {
            return Ok(false);
        }
        loop {
            let response =
                self.scheduler
                    .advance(&self.site, &self.journal, &self.operator, Utc::now());
            let keep_going = matches!(&response, Ok(advance) if advance.continue_);
            if !emit(response)? {
                return Ok(false);
            }
            if !keep_going {
                return Ok(true);
            }
        }
    }

    fn reset(&self) -> Result<bool> {
        emit(
            self.scheduler
                .reset(&self.journal, &self.operator, Utc::now()),
        )
    }

    fn rollback(&self) -> Result<bool> {
        emit(
            rollback(&self.site, &self.journal, &self.operator, Utc::now())
                .map(|report| report.to_response()),
        )
    }

    fn log(&self) -> Result<bool> {
        emit(view_log(&self.journal, &self.operator))
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let path = config_path(cli.config.as_deref());
    debug!(event = "config_path", path = %path.display());
    let config = load_config(&path)?;
    let operator = cli.operator.unwrap_or_else(default_operator);
    let app = App::open(&config, operator)?;

    let ok = match cli.command {
        Commands::Start { dry_run } => app.start(dry_run)?,
        Commands::Advance => app.advance()?,
        Commands::Run { dry_run } => app.run(dry_run)?,
        Commands::Reset => app.reset()?,
        Commands::Rollback => app.rollback()?,
        Commands::Log => app.log()?,
    };
    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

/// Prints the response, or the error payload; returns whether it succeeded.
fn emit<T: Serialize>(result: Result<T, JobError>) -> Result<bool> {
    match result {
        Ok(response) => {
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(true)
        }
        Err(err) => {
            println!("{}", serde_json::to_string_pretty(&err.to_payload())?);
            Ok(false)
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn default_operator() -> String {
    std::env::var("USER")
        .ok()
        .map(|user| user.trim().to_string())
        .filter(|user| !user.is_empty())
        .unwrap_or_else(|| "operator".to_string())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    Ok(())
}
