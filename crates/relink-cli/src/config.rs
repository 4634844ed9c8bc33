use anyhow::{bail, Context, Result};
use relink_core::Collection;
use relink_jobs::JobConfig;
use relink_rewrite::{ProtectedFieldPolicy, ResolverConfig, RewriteConfig, TargetNaming};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_ENV: &str = "RELINK_CONFIG";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub site: SiteSection,
    pub rewrite: RewriteSection,
    pub jobs: JobsSection,
    pub journal: JournalSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SiteSection {
    pub database: PathBuf,
    pub upload_url: String,
    pub upload_dir: PathBuf,
    pub site_url: String,
    pub site_root: PathBuf,
    pub cdn_url: Option<String>,
}

impl Default for SiteSection {
    fn default() -> Self {
        let resolver = ResolverConfig::default();
        Self {
            database: PathBuf::from("site.db"),
            upload_url: resolver.upload_url,
            upload_dir: resolver.upload_dir,
            site_url: resolver.site_url,
            site_root: resolver.site_root,
            cdn_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RewriteSection {
    pub legacy_extensions: Vec<String>,
    pub target_extension: String,
    /// `replace` or `append`.
    pub target_naming: String,
    pub require_local_file: bool,
    pub protected_fields: Vec<String>,
    pub opaque_field_patterns: Vec<String>,
    pub opaque_size_threshold: usize,
    pub max_depth: usize,
    pub skip_meta_keys: Vec<String>,
}

impl Default for RewriteSection {
    fn default() -> Self {
        let resolver = ResolverConfig::default();
        let rewrite = RewriteConfig::default();
        Self {
            legacy_extensions: resolver.legacy_extensions,
            target_extension: resolver.target_extension,
            target_naming: "replace".to_string(),
            require_local_file: resolver.require_local_file,
            protected_fields: vec![
                "custom_logo".to_string(),
                "site_logo".to_string(),
                "site_icon".to_string(),
            ],
            opaque_field_patterns: rewrite.opaque_field_patterns,
            opaque_size_threshold: rewrite.opaque_size_threshold,
            max_depth: rewrite.max_depth,
            skip_meta_keys: JobConfig::default().skip_meta_keys,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobsSection {
    /// Queue order; empty means the default queue.
    pub collections: Vec<String>,
    pub batch_size: usize,
    pub time_budget_ms: u64,
    pub state_ttl_secs: i64,
    pub excerpt_chars: usize,
    pub summary_top_fields: usize,
    pub stuck_batch_limit: u32,
    pub skipped_option_prefixes: Vec<String>,
}

impl Default for JobsSection {
    fn default() -> Self {
        let jobs = JobConfig::default();
        Self {
            collections: Vec::new(),
            batch_size: jobs.batch_size,
            time_budget_ms: 20_000,
            state_ttl_secs: 3_600,
            excerpt_chars: jobs.excerpt_chars,
            summary_top_fields: jobs.summary_top_fields,
            stuck_batch_limit: jobs.stuck_batch_limit,
            skipped_option_prefixes: jobs.skipped_option_prefixes,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JournalSection {
    pub database: PathBuf,
}

impl Default for JournalSection {
    fn default() -> Self {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            database: base.join("relink").join("journal.db"),
        }
    }
}

/// `--config`, then `$RELINK_CONFIG`, then the user config dir.
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Ok(path) = env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("relink")
        .join("relink.toml")
}

/// A missing file yields defaults; a malformed one is an error.
pub fn load_config(path: &Path) -> Result<FileConfig> {
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("invalid config {}", path.display()))
}

impl FileConfig {
    pub fn resolver_config(&self) -> Result<ResolverConfig> {
        let target_naming = match self.rewrite.target_naming.trim().to_lowercase().as_str() {
            "replace" => TargetNaming::Replace,
            "append" => TargetNaming::Append,
            other => bail!("unknown target_naming `{other}` (expected replace or append)"),
        };
        Ok(ResolverConfig {
            upload_url: self.site.upload_url.clone(),
            upload_dir: self.site.upload_dir.clone(),
            site_url: self.site.site_url.clone(),
            site_root: self.site.site_root.clone(),
            cdn_url: self
                .site
                .cdn_url
                .clone()
                .filter(|url| !url.trim().is_empty()),
            require_local_file: self.rewrite.require_local_file,
            legacy_extensions: self.rewrite.legacy_extensions.clone(),
            target_extension: self.rewrite.target_extension.clone(),
            target_naming,
        })
    }

    pub fn rewrite_config(&self) -> RewriteConfig {
        RewriteConfig {
            opaque_field_patterns: self.rewrite.opaque_field_patterns.clone(),
            opaque_size_threshold: self.rewrite.opaque_size_threshold,
            max_depth: self.rewrite.max_depth,
        }
    }

    pub fn protected_policy(&self) -> ProtectedFieldPolicy {
        ProtectedFieldPolicy::new(self.rewrite.protected_fields.iter())
    }

    pub fn job_config(&self) -> Result<JobConfig> {
        let collections = if self.jobs.collections.is_empty() {
            Collection::DEFAULT_QUEUE.to_vec()
        } else {
            self.jobs
                .collections
                .iter()
                .map(|name| name.parse::<Collection>().map_err(anyhow::Error::msg))
                .collect::<Result<Vec<_>>>()?
        };
        if self.jobs.batch_size == 0 {
            bail!("jobs.batch_size must be at least 1");
        }
        Ok(JobConfig {
            collections,
            batch_size: self.jobs.batch_size,
            time_budget: Duration::from_millis(self.jobs.time_budget_ms),
            state_ttl: chrono::Duration::seconds(self.jobs.state_ttl_secs.max(1)),
            excerpt_chars: self.jobs.excerpt_chars,
            summary_top_fields: self.jobs.summary_top_fields,
            stuck_batch_limit: self.jobs.stuck_batch_limit.max(1),
            skip_meta_keys: self.rewrite.skip_meta_keys.clone(),
            skipped_option_prefixes: self.jobs.skipped_option_prefixes.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_config(&dir.path().join("absent.toml")).expect("load config");
        let jobs = config.job_config().expect("job config");
        assert_eq!(jobs.batch_size, 200);
        assert_eq!(jobs.time_budget, Duration::from_secs(20));
        assert_eq!(jobs.state_ttl, chrono::Duration::hours(1));
        assert_eq!(jobs.collections, Collection::DEFAULT_QUEUE.to_vec());
        let resolver = config.resolver_config().expect("resolver config");
        assert_eq!(resolver.target_extension, "webp");
        assert!(resolver.require_local_file);
        assert!(config.protected_policy().is_protected("site_icon"));
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("relink.toml");
        fs::write(
            &path,
            r#"
[site]
database = "/var/lib/site.db"
upload_url = "https://cdn.example.org/uploads"
cdn_url = ""

[rewrite]
target_naming = "append"
protected_fields = ["brand_mark"]

[jobs]
batch_size = 50
time_budget_ms = 5000
collections = ["posts", "options"]
"#,
        )
        .expect("write config");

        let config = load_config(&path).expect("load config");
        assert_eq!(config.site.database, PathBuf::from("/var/lib/site.db"));

        let resolver = config.resolver_config().expect("resolver config");
        assert_eq!(resolver.upload_url, "https://cdn.example.org/uploads");
        assert_eq!(resolver.target_naming, TargetNaming::Append);
        assert_eq!(resolver.cdn_url, None);
        assert_eq!(resolver.legacy_extensions, vec!["jpg", "jpeg", "png"]);

        let jobs = config.job_config().expect("job config");
        assert_eq!(jobs.batch_size, 50);
        assert_eq!(jobs.time_budget, Duration::from_millis(5000));
        assert_eq!(jobs.collections, vec![Collection::Posts, Collection::Options]);
        assert_eq!(jobs.summary_top_fields, 10);

        let policy = config.protected_policy();
        assert!(policy.is_protected("brand_mark"));
        assert!(!policy.is_protected("custom_logo"));
    }

    #[test]
    fn rejects_unknown_naming_and_collections() {
        let mut config = FileConfig::default();
        config.rewrite.target_naming = "prefix".to_string();
        assert!(config.resolver_config().is_err());

        config.jobs.collections = vec!["comments".to_string()];
        assert!(config.job_config().is_err());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("relink.toml");
        fs::write(&path, "[jobs]\nbatch_size = \"many\"\n").expect("write config");
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn explicit_path_wins() {
        let explicit = Path::new("/tmp/custom.toml");
        assert_eq!(config_path(Some(explicit)), PathBuf::from("/tmp/custom.toml"));
    }
}
