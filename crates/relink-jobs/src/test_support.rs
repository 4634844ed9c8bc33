use relink_rewrite::{
    LocalFs, ProtectedFieldPolicy, ReferenceResolver, ResolverConfig, RewriteConfig, ValueRewriter,
};
use std::fs;
use tempfile::TempDir;

/// Site rooted in a temp dir: `https://example.com`, uploads under `/files`.
pub(crate) struct Site {
    pub dir: TempDir,
}

impl Site {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("files")).expect("create upload dir");
        Self { dir }
    }

    /// Creates an (empty) file under the upload dir.
    pub fn upload(&self, relative: &str) {
        let path = self.dir.path().join("files").join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, b"img").expect("write upload");
    }

    pub fn rewriter(&self) -> ValueRewriter<LocalFs> {
        let config = ResolverConfig {
            upload_url: "https://example.com/files".to_string(),
            upload_dir: self.dir.path().join("files"),
            site_url: "https://example.com".to_string(),
            site_root: self.dir.path().to_path_buf(),
            ..ResolverConfig::default()
        };
        ValueRewriter::new(
            ReferenceResolver::new(config, LocalFs),
            RewriteConfig::default(),
            ProtectedFieldPolicy::new(["custom_logo", "site_logo", "site_icon"]),
        )
        .expect("rewriter")
    }
}
