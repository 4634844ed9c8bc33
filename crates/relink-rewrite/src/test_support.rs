use crate::{AssetFs, ReferenceResolver, ResolverConfig};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

#[derive(Default)]
pub(crate) struct FakeFs {
    files: BTreeSet<PathBuf>,
}

impl FakeFs {
    /// Store holding exactly `paths`, taken as absolute.
    pub(crate) fn with(paths: &[&str]) -> Self {
        Self {
            files: paths.iter().map(PathBuf::from).collect(),
        }
    }
}

impl AssetFs for FakeFs {
    fn is_file(&self, path: &Path) -> bool {
        self.files.contains(path)
    }
}

/// Resolver for `https://example.com` served from `/srv/site`, uploads under
/// `/files`. `files` are upload-relative paths that exist on disk.
pub(crate) fn resolver(files: &[&str]) -> ReferenceResolver<FakeFs> {
    let config = ResolverConfig {
        upload_url: "https://example.com/files".to_string(),
        upload_dir: PathBuf::from("/srv/site/files"),
        site_url: "https://example.com".to_string(),
        site_root: PathBuf::from("/srv/site"),
        cdn_url: None,
        ..ResolverConfig::default()
    };
    let files = files
        .iter()
        .map(|relative| Path::new("/srv/site/files").join(relative))
        .collect();
    ReferenceResolver::new(config, FakeFs { files })
}
