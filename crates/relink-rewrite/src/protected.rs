use crate::resolver::{AssetFs, ReferenceResolver};
use std::collections::BTreeSet;
use std::fmt::Display;

/// Attachment lookups backing identifier-valued fields.
pub trait AssetIndex {
    type Error: Display;

    /// Upload-relative file of attachment `id`.
    fn attachment_file(&self, id: i64) -> Result<Option<String>, Self::Error>;

    fn attachment_id_for_file(&self, relative_file: &str) -> Result<Option<i64>, Self::Error>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtectedOutcome {
    Substituted { previous: i64, replacement: i64 },
    /// The identifier stays: unknown attachment, not a legacy file, or no
    /// migrated attachment registered for it.
    NoMigratedAsset { id: i64 },
    /// Not a positive integer; left untouched.
    NotAnIdentifier,
    LookupFailed { id: i64, error: String },
}

/// Fields whose value is an attachment identifier. They only ever get
/// another identifier, never a reference string.
#[derive(Debug, Clone, Default)]
pub struct ProtectedFieldPolicy {
    fields: BTreeSet<String>,
}

impl ProtectedFieldPolicy {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_protected(&self, field: &str) -> bool {
        self.fields.contains(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(String::as_str)
    }

    pub fn apply<F, I>(
        &self,
        raw: &str,
        resolver: &ReferenceResolver<F>,
        index: &I,
    ) -> ProtectedOutcome
    where
        F: AssetFs,
        I: AssetIndex,
    {
        let Some(id) = parse_identifier(raw) else {
            return ProtectedOutcome::NotAnIdentifier;
        };
        match migrated_identifier(id, resolver, index) {
            Ok(Some(replacement)) if replacement != id => ProtectedOutcome::Substituted {
                previous: id,
                replacement,
            },
            Ok(_) => ProtectedOutcome::NoMigratedAsset { id },
            Err(error) => ProtectedOutcome::LookupFailed { id, error },
        }
    }
}

fn parse_identifier(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    trimmed.parse::<i64>().ok().filter(|id| *id > 0)
}

fn migrated_identifier<F, I>(
    id: i64,
    resolver: &ReferenceResolver<F>,
    index: &I,
) -> Result<Option<i64>, String>
where
    F: AssetFs,
    I: AssetIndex,
{
    let Some(file) = index.attachment_file(id).map_err(|err| err.to_string())? else {
        return Ok(None);
    };
    let Some(migrated) = resolver.migrated_name(&file) else {
        return Ok(None);
    };

    let upload_dir = &resolver.config().upload_dir;
    if resolver.config().require_local_file && !resolver.fs().is_file(&upload_dir.join(&file)) {
        return Ok(None);
    }
    if !resolver.fs().is_file(&upload_dir.join(&migrated)) {
        return Ok(None);
    }
    index
        .attachment_id_for_file(&migrated)
        .map_err(|err| err.to_string())
}
