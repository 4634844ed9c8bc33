use percent_encoding::percent_decode_str;
use relink_core::SkipReason;
use std::path::{Path, PathBuf};
use tracing::warn;
use url::Url;

/// How the migrated file is named relative to its legacy source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetNaming {
    /// `a.jpg` becomes `a.webp`.
    #[default]
    Replace,
    /// `a.jpg` becomes `a.jpg.webp`.
    Append,
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub upload_url: String,
    pub upload_dir: PathBuf,
    pub site_url: String,
    pub site_root: PathBuf,
    pub cdn_url: Option<String>,
    pub require_local_file: bool,
    pub legacy_extensions: Vec<String>,
    pub target_extension: String,
    pub target_naming: TargetNaming,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            upload_url: "http://localhost/wp-content/uploads".to_string(),
            upload_dir: PathBuf::from("wp-content/uploads"),
            site_url: "http://localhost".to_string(),
            site_root: PathBuf::from("."),
            cdn_url: None,
            require_local_file: true,
            legacy_extensions: vec!["jpg".to_string(), "jpeg".to_string(), "png".to_string()],
            target_extension: "webp".to_string(),
            target_naming: TargetNaming::Replace,
        }
    }
}

/// Existence check against the asset storage.
pub trait AssetFs {
    fn is_file(&self, path: &Path) -> bool;
}

/// Checks the local filesystem on every call; results are never cached.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

impl AssetFs for LocalFs {
    fn is_file(&self, path: &Path) -> bool {
        std::fs::metadata(path)
            .map(|metadata| metadata.is_file())
            .unwrap_or(false)
    }
}

impl<T: AssetFs + ?Sized> AssetFs for &T {
    fn is_file(&self, path: &Path) -> bool {
        (**self).is_file(path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub replacement: String,
    pub matched: bool,
    pub skip_reason: Option<SkipReason>,
}

impl Resolution {
    fn replaced(replacement: String) -> Self {
        Self {
            replacement,
            matched: true,
            skip_reason: None,
        }
    }

    fn skipped(reference: &str, reason: SkipReason) -> Self {
        Self {
            replacement: reference.to_string(),
            matched: false,
            skip_reason: Some(reason),
        }
    }
}

/// Owned URL prefix (`host/path`, no scheme) and the local directory it serves.
#[derive(Debug, Clone)]
struct Base {
    host: String,
    path: String,
    root: PathBuf,
}

impl Base {
    /// `None` when `url` has no host; scheme-relative `//host` is taken as https.
    fn parse(url: &str, root: &Path) -> Option<Self> {
        let url = url.trim();
        let parsed = match url.strip_prefix("//") {
            Some(rest) => Url::parse(&format!("https://{rest}")),
            None => Url::parse(url),
        };
        let parsed = match parsed {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(event = "base_url_invalid", url, error = %err);
                return None;
            }
        };
        let host = parsed.host_str().filter(|host| !host.is_empty())?;
        let host = match parsed.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        Some(Self {
            host,
            path: parsed.path().trim_end_matches('/').to_string(),
            root: root.to_path_buf(),
        })
    }

    /// Byte length of the `host/path` prefix this base matches in `rest`.
    fn match_len(&self, rest: &str) -> Option<usize> {
        let host_len = self.host.len();
        let host = rest.get(..host_len)?;
        if !host.eq_ignore_ascii_case(&self.host) {
            return None;
        }
        let after_host = &rest[host_len..];
        if !after_host.starts_with(&self.path) {
            return None;
        }
        let matched = host_len + self.path.len();
        match rest[matched..].chars().next() {
            None | Some('/') => Some(matched),
            Some(_) => None,
        }
    }
}

/// Maps embedded references to on-disk assets and their migrated counterparts.
pub struct ReferenceResolver<F> {
    config: ResolverConfig,
    bases: Vec<Base>,
    site_host: Option<String>,
    legacy_extensions: Vec<String>,
    target_extension: String,
    fs: F,
}

impl<F: AssetFs> ReferenceResolver<F> {
    pub fn new(config: ResolverConfig, fs: F) -> Self {
        let mut bases = Vec::new();
        bases.extend(Base::parse(&config.upload_url, &config.upload_dir));
        bases.extend(Base::parse(&config.site_url, &config.site_root));
        if let Some(cdn_url) = config.cdn_url.as_deref() {
            bases.extend(Base::parse(cdn_url, &config.site_root));
        }
        bases.sort_by(|left, right| {
            (right.host.len() + right.path.len()).cmp(&(left.host.len() + left.path.len()))
        });

        let site = Base::parse(&config.site_url, &config.site_root);
        let legacy_extensions = config
            .legacy_extensions
            .iter()
            .map(|extension| normalize_extension(extension))
            .filter(|extension| !extension.is_empty())
            .collect();
        let target_extension = normalize_extension(&config.target_extension);

        Self {
            site_host: site.map(|base| base.host),
            bases,
            legacy_extensions,
            target_extension,
            config,
            fs,
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn legacy_extensions(&self) -> &[String] {
        &self.legacy_extensions
    }

    pub fn target_extension(&self) -> &str {
        &self.target_extension
    }

    pub fn fs(&self) -> &F {
        &self.fs
    }

    pub fn is_legacy_extension(&self, extension: &str) -> bool {
        let extension = extension.to_ascii_lowercase();
        self.legacy_extensions.iter().any(|legacy| *legacy == extension)
    }

    /// Migrated-format name for a legacy path or reference (`a.JPG` to `a.webp`).
    pub fn migrated_name(&self, path: &str) -> Option<String> {
        let extension = extension_of(path)?;
        if !self.is_legacy_extension(extension) {
            return None;
        }
        let stem = match self.config.target_naming {
            TargetNaming::Replace => &path[..path.len() - extension.len() - 1],
            TargetNaming::Append => path,
        };
        Some(format!("{stem}.{}", self.target_extension))
    }

    pub fn resolve(&self, reference: &str) -> Resolution {
        let (path_part, suffix) = split_suffix(reference);

        let Some(extension) = extension_of(path_part) else {
            return Resolution::skipped(reference, SkipReason::Unsupported);
        };
        if extension.eq_ignore_ascii_case(&self.target_extension) {
            return Resolution::skipped(reference, SkipReason::AlreadyTarget);
        }
        if !self.is_legacy_extension(extension) {
            return Resolution::skipped(reference, SkipReason::Unsupported);
        }

        let Some((prefix_len, base)) = self.classify(path_part) else {
            return Resolution::skipped(reference, SkipReason::External);
        };

        let relative = path_part[prefix_len..].trim_start_matches('/');
        if relative.is_empty() || relative.split('/').any(|segment| segment == "..") {
            return Resolution::skipped(reference, SkipReason::NoTarget);
        }

        let source = base.root.join(percent_decode(relative));
        if self.config.require_local_file && !self.fs.is_file(&source) {
            return Resolution::skipped(reference, SkipReason::NoTarget);
        }

        let Some(migrated_relative) = self.migrated_name(relative) else {
            return Resolution::skipped(reference, SkipReason::Unsupported);
        };
        let candidate = base.root.join(percent_decode(&migrated_relative));
        if !self.fs.is_file(&candidate) {
            return Resolution::skipped(reference, SkipReason::NoTarget);
        }

        let prefix = &path_part[..path_part.len() - relative.len()];
        Resolution::replaced(format!("{prefix}{migrated_relative}{suffix}"))
    }

    /// Finds the owned base for a reference; returns the byte offset where the
    /// base-relative part starts.
    fn classify(&self, path_part: &str) -> Option<(usize, &Base)> {
        if let Some(rest) = strip_scheme(path_part) {
            let scheme_len = path_part.len() - rest.len();
            return self
                .bases
                .iter()
                .find_map(|base| base.match_len(rest).map(|len| (scheme_len + len, base)));
        }

        if !path_part.starts_with('/') {
            return None;
        }
        let site_host = self.site_host.as_deref()?;
        let synthetic = format!("{site_host}{path_part}");
        self.bases.iter().find_map(|base| {
            base.match_len(&synthetic)
                .map(|len| (len - site_host.len(), base))
        })
    }
}

fn normalize_extension(extension: &str) -> String {
    extension.trim().trim_start_matches('.').to_ascii_lowercase()
}

/// Strips `http://`, `https://` or `//`, case-insensitively.
fn strip_scheme(value: &str) -> Option<&str> {
    for scheme in ["https://", "http://"] {
        if let Some(head) = value.get(..scheme.len()) {
            if head.eq_ignore_ascii_case(scheme) {
                return Some(&value[scheme.len()..]);
            }
        }
    }
    value.strip_prefix("//")
}

fn split_suffix(reference: &str) -> (&str, &str) {
    match reference.find(['?', '#']) {
        Some(index) => reference.split_at(index),
        None => (reference, ""),
    }
}

fn extension_of(path: &str) -> Option<&str> {
    let file_name = path.rsplit('/').next()?;
    let (stem, extension) = file_name.rsplit_once('.')?;
    if stem.is_empty() || extension.is_empty() {
        return None;
    }
    Some(extension)
}

/// Decoded on-disk spelling; undecodable input is used as written.
fn percent_decode(value: &str) -> String {
    percent_decode_str(value)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeFs;
    use std::fs;
    use tempfile::TempDir;

    fn config() -> ResolverConfig {
        ResolverConfig {
            upload_url: "https://example.com/wp-content/uploads".to_string(),
            upload_dir: PathBuf::from("/srv/site/wp-content/uploads"),
            site_url: "https://example.com".to_string(),
            site_root: PathBuf::from("/srv/site"),
            cdn_url: Some("https://cdn.example.net".to_string()),
            ..ResolverConfig::default()
        }
    }

    fn resolver(files: &[&str]) -> ReferenceResolver<FakeFs> {
        ReferenceResolver::new(config(), FakeFs::with(files))
    }

    #[test]
    fn upload_url_resolves_to_existing_migrated_file() {
        let resolver = resolver(&[
            "/srv/site/wp-content/uploads/2024/01/a.jpg",
            "/srv/site/wp-content/uploads/2024/01/a.webp",
        ]);
        let resolution = resolver.resolve("https://example.com/wp-content/uploads/2024/01/a.jpg");
        assert!(resolution.matched);
        assert_eq!(
            resolution.replacement,
            "https://example.com/wp-content/uploads/2024/01/a.webp"
        );
        assert_eq!(resolution.skip_reason, None);
    }

    #[test]
    fn scheme_variants_and_query_suffix_are_preserved() {
        let resolver = resolver(&[
            "/srv/site/wp-content/uploads/b.png",
            "/srv/site/wp-content/uploads/b.webp",
        ]);
        let resolution = resolver.resolve("//EXAMPLE.com/wp-content/uploads/b.png?ver=3#top");
        assert_eq!(
            resolution.replacement,
            "//EXAMPLE.com/wp-content/uploads/b.webp?ver=3#top"
        );

        let resolution = resolver.resolve("http://example.com/wp-content/uploads/b.png");
        assert_eq!(
            resolution.replacement,
            "http://example.com/wp-content/uploads/b.webp"
        );
    }

    #[test]
    fn root_relative_and_cdn_map_to_site_root() {
        let resolver = resolver(&[
            "/srv/site/files/a.jpg",
            "/srv/site/files/a.webp",
        ]);
        assert_eq!(
            resolver.resolve("/files/a.jpg").replacement,
            "/files/a.webp"
        );
        assert_eq!(
            resolver.resolve("https://cdn.example.net/files/a.jpg").replacement,
            "https://cdn.example.net/files/a.webp"
        );
    }

    #[test]
    fn missing_target_leaves_reference_unchanged() {
        let resolver = resolver(&["/srv/site/files/a.jpg"]);
        let resolution = resolver.resolve("/files/a.jpg");
        assert!(!resolution.matched);
        assert_eq!(resolution.replacement, "/files/a.jpg");
        assert_eq!(resolution.skip_reason, Some(SkipReason::NoTarget));
    }

    #[test]
    fn missing_source_is_no_target_only_when_required() {
        let resolver = resolver(&["/srv/site/files/a.webp"]);
        assert_eq!(
            resolver.resolve("/files/a.jpg").skip_reason,
            Some(SkipReason::NoTarget)
        );

        let mut relaxed = config();
        relaxed.require_local_file = false;
        let resolver = ReferenceResolver::new(relaxed, FakeFs::with(&["/srv/site/files/a.webp"]));
        assert!(resolver.resolve("/files/a.jpg").matched);
    }

    #[test]
    fn external_hosts_never_resolve() {
        let resolver = resolver(&["/srv/site/b.png", "/srv/site/b.webp"]);
        let resolution = resolver.resolve("http://external.com/b.png");
        assert_eq!(resolution.skip_reason, Some(SkipReason::External));
        assert_eq!(resolution.replacement, "http://external.com/b.png");

        // Prefix match must end at a segment boundary.
        let resolution = resolver.resolve("https://example.com.evil.org/b.png");
        assert_eq!(resolution.skip_reason, Some(SkipReason::External));
        assert_eq!(
            resolver.resolve("relative/b.png").skip_reason,
            Some(SkipReason::External)
        );
    }

    #[test]
    fn already_target_and_unsupported_extensions() {
        let resolver = resolver(&[]);
        assert_eq!(
            resolver.resolve("/files/a.webp").skip_reason,
            Some(SkipReason::AlreadyTarget)
        );
        assert_eq!(
            resolver.resolve("/files/a.gif").skip_reason,
            Some(SkipReason::Unsupported)
        );
        assert_eq!(
            resolver.resolve("/files/").skip_reason,
            Some(SkipReason::Unsupported)
        );
    }

    #[test]
    fn parent_segments_never_resolve() {
        let resolver = resolver(&["/srv/a.jpg", "/srv/a.webp"]);
        assert_eq!(
            resolver.resolve("/../a.jpg").skip_reason,
            Some(SkipReason::NoTarget)
        );
    }

    #[test]
    fn uppercase_legacy_extension_and_append_naming() {
        let resolver = resolver(&["/srv/site/x/A.JPG", "/srv/site/x/A.webp"]);
        assert_eq!(resolver.resolve("/x/A.JPG").replacement, "/x/A.webp");

        let mut append = config();
        append.target_naming = TargetNaming::Append;
        let resolver = ReferenceResolver::new(
            append,
            FakeFs::with(&["/srv/site/x/a.png", "/srv/site/x/a.png.webp"]),
        );
        assert_eq!(resolver.resolve("/x/a.png").replacement, "/x/a.png.webp");
        assert_eq!(
            resolver.resolve("/x/a.png.webp").skip_reason,
            Some(SkipReason::AlreadyTarget)
        );
    }

    #[test]
    fn percent_encoded_names_check_decoded_paths() {
        let resolver = resolver(&["/srv/site/x/my file.jpg", "/srv/site/x/my file.webp"]);
        assert_eq!(
            resolver.resolve("/x/my%20file.jpg").replacement,
            "/x/my%20file.webp"
        );
    }

    #[test]
    fn site_path_prefix_is_stripped_for_root_relative_references() {
        let resolver = ReferenceResolver::new(
            ResolverConfig {
                upload_url: "https://example.com/blog/wp-content/uploads".to_string(),
                upload_dir: PathBuf::from("/srv/blog/wp-content/uploads"),
                site_url: "https://example.com/blog".to_string(),
                site_root: PathBuf::from("/srv/blog"),
                ..ResolverConfig::default()
            },
            FakeFs::with(&[
                "/srv/blog/wp-content/uploads/a.jpg",
                "/srv/blog/wp-content/uploads/a.webp",
            ]),
        );
        assert_eq!(
            resolver.resolve("/blog/wp-content/uploads/a.jpg").replacement,
            "/blog/wp-content/uploads/a.webp"
        );
        assert_eq!(
            resolver.resolve("/elsewhere/a.jpg").skip_reason,
            Some(SkipReason::External)
        );
    }

    #[test]
    fn configured_bases_normalise_host_port_and_trailing_slash() {
        let resolver = ReferenceResolver::new(
            ResolverConfig {
                upload_url: " HTTPS://Media.Example.com:8443/Uploads/ ".to_string(),
                upload_dir: PathBuf::from("/srv/media"),
                site_url: "https://example.com/".to_string(),
                site_root: PathBuf::from("/srv/site"),
                cdn_url: Some("//cdn.example.net".to_string()),
                ..ResolverConfig::default()
            },
            FakeFs::with(&[
                "/srv/media/a.jpg",
                "/srv/media/a.webp",
                "/srv/site/b.jpg",
                "/srv/site/b.webp",
            ]),
        );
        assert_eq!(
            resolver
                .resolve("https://media.example.com:8443/Uploads/a.jpg")
                .replacement,
            "https://media.example.com:8443/Uploads/a.webp"
        );
        assert_eq!(
            resolver.resolve("https://media.example.com/Uploads/a.jpg").skip_reason,
            Some(SkipReason::External)
        );
        assert_eq!(
            resolver.resolve("//cdn.example.net/b.jpg").replacement,
            "//cdn.example.net/b.webp"
        );
    }

    #[test]
    fn unparseable_bases_are_ignored() {
        let resolver = ReferenceResolver::new(
            ResolverConfig {
                upload_url: "not a url".to_string(),
                upload_dir: PathBuf::from("/srv/site/uploads"),
                site_url: "https://example.com".to_string(),
                site_root: PathBuf::from("/srv/site"),
                cdn_url: Some("mailto:someone@example.com".to_string()),
                ..ResolverConfig::default()
            },
            FakeFs::with(&["/srv/site/uploads/a.jpg", "/srv/site/uploads/a.webp"]),
        );
        // Resolves through the site base alone.
        assert_eq!(
            resolver.resolve("/uploads/a.jpg").replacement,
            "/uploads/a.webp"
        );
        assert_eq!(
            resolver.resolve("https://someone@example.com/x.jpg").skip_reason,
            Some(SkipReason::External)
        );
    }

    #[test]
    fn undecodable_escapes_are_checked_as_written() {
        let raw = resolver(&["/srv/site/x/caf%FF.jpg", "/srv/site/x/caf%FF.webp"]);
        assert_eq!(raw.resolve("/x/caf%FF.jpg").replacement, "/x/caf%FF.webp");

        let decoded = resolver(&["/srv/site/x/caf\u{e9}.jpg", "/srv/site/x/caf\u{e9}.webp"]);
        assert_eq!(
            decoded.resolve("/x/caf%C3%A9.jpg").replacement,
            "/x/caf%C3%A9.webp"
        );
    }

    #[test]
    fn local_fs_reflects_current_disk_state() {
        let dir = TempDir::new().expect("temp dir");
        let uploads = dir.path().join("uploads");
        fs::create_dir_all(&uploads).expect("mkdir");
        fs::write(uploads.join("a.jpg"), b"jpg").expect("write jpg");

        let resolver = ReferenceResolver::new(
            ResolverConfig {
                upload_url: "https://example.com/uploads".to_string(),
                upload_dir: uploads.clone(),
                site_url: "https://example.com".to_string(),
                site_root: dir.path().to_path_buf(),
                ..ResolverConfig::default()
            },
            LocalFs,
        );
        let reference = "https://example.com/uploads/a.jpg";
        assert_eq!(
            resolver.resolve(reference).skip_reason,
            Some(SkipReason::NoTarget)
        );

        fs::write(uploads.join("a.webp"), b"webp").expect("write webp");
        assert!(resolver.resolve(reference).matched);

        fs::remove_file(uploads.join("a.webp")).expect("remove webp");
        assert!(!resolver.resolve(reference).matched);
    }
}
