use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod job_contracts;

pub use job_contracts::*;

/// Logical record store walked by a migration job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Collection {
    #[serde(rename = "posts")]
    Posts,
    #[serde(rename = "postmeta")]
    PostMeta,
    #[serde(rename = "usermeta")]
    UserMeta,
    #[serde(rename = "termmeta")]
    TermMeta,
    #[serde(rename = "options")]
    Options,
    #[serde(rename = "term_descriptions")]
    TermDescriptions,
    #[serde(rename = "theme_mods")]
    ThemeMods,
}

impl Collection {
    /// Queue order used when a job starts.
    pub const DEFAULT_QUEUE: [Collection; 7] = [
        Collection::Posts,
        Collection::PostMeta,
        Collection::UserMeta,
        Collection::TermMeta,
        Collection::Options,
        Collection::TermDescriptions,
        Collection::ThemeMods,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Posts => "posts",
            Collection::PostMeta => "postmeta",
            Collection::UserMeta => "usermeta",
            Collection::TermMeta => "termmeta",
            Collection::Options => "options",
            Collection::TermDescriptions => "term_descriptions",
            Collection::ThemeMods => "theme_mods",
        }
    }

    /// The protected config store is small and walked in a single pass.
    pub fn is_paginated(&self) -> bool {
        !matches!(self, Collection::ThemeMods)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "posts" => Ok(Collection::Posts),
            "postmeta" | "post_meta" => Ok(Collection::PostMeta),
            "usermeta" | "user_meta" => Ok(Collection::UserMeta),
            "termmeta" | "term_meta" => Ok(Collection::TermMeta),
            "options" => Ok(Collection::Options),
            "term_descriptions" | "term_taxonomy" => Ok(Collection::TermDescriptions),
            "theme_mods" => Ok(Collection::ThemeMods),
            other => Err(format!("Unknown collection: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    DryRun,
    Live,
}

impl JobMode {
    pub fn from_dry_run(dry_run: bool) -> Self {
        if dry_run {
            JobMode::DryRun
        } else {
            JobMode::Live
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobMode::DryRun => "dry_run",
            JobMode::Live => "live",
        }
    }

    pub fn is_dry_run(&self) -> bool {
        matches!(self, JobMode::DryRun)
    }
}

impl fmt::Display for JobMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobMode {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "dry_run" | "dry-run" | "dryrun" => Ok(JobMode::DryRun),
            "live" => Ok(JobMode::Live),
            other => Err(format!("Unknown job mode: {other}")),
        }
    }
}

/// Location of one mutated field inside its record store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKey {
    Row { id: i64 },
    Meta { meta_id: i64, owner_id: i64 },
    Option { option_id: i64, name: String },
    ThemeMod { theme: String, name: String },
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Row { id } => write!(f, "{id}"),
            RecordKey::Meta { meta_id, owner_id } => write!(f, "{owner_id}/{meta_id}"),
            RecordKey::Option { name, .. } => f.write_str(name),
            RecordKey::ThemeMod { theme, name } => write!(f, "{theme}/{name}"),
        }
    }
}

/// Why a matched reference was left as it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    External,
    NoTarget,
    AlreadyTarget,
    Unsupported,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::External => "external",
            SkipReason::NoTarget => "no_target",
            SkipReason::AlreadyTarget => "already_target",
            SkipReason::Unsupported => "unsupported",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-reference outcome counters accumulated by the rewriter.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceTally {
    pub replaced: u64,
    pub skipped_external: u64,
    pub skipped_no_target: u64,
    pub already_target: u64,
}

impl ReferenceTally {
    pub fn record_replaced(&mut self) {
        self.replaced += 1;
    }

    pub fn record_skip(&mut self, reason: SkipReason) {
        match reason {
            SkipReason::External => self.skipped_external += 1,
            SkipReason::NoTarget => self.skipped_no_target += 1,
            SkipReason::AlreadyTarget => self.already_target += 1,
            SkipReason::Unsupported => {}
        }
    }

    pub fn merge(&mut self, other: &ReferenceTally) {
        self.replaced += other.replaced;
        self.skipped_external += other.skipped_external;
        self.skipped_no_target += other.skipped_no_target;
        self.already_target += other.already_target;
    }
}
