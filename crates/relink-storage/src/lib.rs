use chrono::{DateTime, Utc};
use thiserror::Error;

mod journal;
mod site;

pub use journal::{JobSlot, JournalStore, StoredRun, JOURNAL_SCHEMA_VERSION};
pub use site::{MetaOwner, PostField, SiteStore, StoredField, StoredRow};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("no {store} row matched {key}")]
    RowNotFound { store: &'static str, key: String },
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}

fn to_sql_conversion_error(index: usize, err: StorageError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(err))
}

/// `%.jpg%`-style LIKE patterns for the candidate filter.
fn like_patterns(extensions: &[String]) -> Vec<String> {
    extensions
        .iter()
        .map(|extension| extension.trim().trim_start_matches('.').to_lowercase())
        .filter(|extension| !extension.is_empty())
        .map(|extension| format!("%.{extension}%"))
        .collect()
}

/// `(a LIKE ?3 OR a LIKE ?4 OR b LIKE ?3 ...)`, parameters numbered from `first_param`.
fn like_clause(columns: &[&str], pattern_count: usize, first_param: usize) -> String {
    if pattern_count == 0 {
        return "1 = 1".to_string();
    }
    let terms = columns
        .iter()
        .flat_map(|column| {
            (0..pattern_count).map(move |offset| format!("{column} LIKE ?{}", first_param + offset))
        })
        .collect::<Vec<_>>();
    format!("({})", terms.join(" OR "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_patterns_normalize_extensions() {
        let patterns = like_patterns(&[".JPG".to_string(), "png".to_string(), " ".to_string()]);
        assert_eq!(patterns, vec!["%.jpg%".to_string(), "%.png%".to_string()]);
    }

    #[test]
    fn like_clause_reuses_numbered_parameters_per_column() {
        assert_eq!(
            like_clause(&["post_content", "post_excerpt"], 2, 3),
            "(post_content LIKE ?3 OR post_content LIKE ?4 OR post_excerpt LIKE ?3 OR post_excerpt LIKE ?4)"
        );
        assert_eq!(like_clause(&["meta_value"], 0, 3), "1 = 1");
    }
}
