use crate::{like_clause, like_patterns, StorageError};
use relink_core::RecordKey;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::path::Path;

pub const ATTACHED_FILE_META_KEY: &str = "_wp_attached_file";
const ATTACHMENT_POST_TYPE: &str = "attachment";

/// One rewritable field of a fetched record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredField {
    /// Name recorded in change records and used by the write primitive.
    pub name: String,
    /// Name the opaque-payload heuristic matches against.
    pub label: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    pub key: RecordKey,
    pub cursor: i64,
    pub fields: Vec<StoredField>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostField {
    Content,
    Excerpt,
}

impl PostField {
    pub const ALL: [PostField; 2] = [PostField::Content, PostField::Excerpt];

    pub fn column(&self) -> &'static str {
        match self {
            PostField::Content => "post_content",
            PostField::Excerpt => "post_excerpt",
        }
    }

    pub fn from_column(column: &str) -> Option<Self> {
        match column {
            "post_content" => Some(PostField::Content),
            "post_excerpt" => Some(PostField::Excerpt),
            _ => None,
        }
    }
}

/// The three owner kinds that carry attached key/value metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaOwner {
    Post,
    User,
    Term,
}

impl MetaOwner {
    pub fn table(&self) -> &'static str {
        match self {
            MetaOwner::Post => "postmeta",
            MetaOwner::User => "usermeta",
            MetaOwner::Term => "termmeta",
        }
    }

    fn id_column(&self) -> &'static str {
        match self {
            MetaOwner::Post | MetaOwner::Term => "meta_id",
            MetaOwner::User => "umeta_id",
        }
    }

    fn owner_column(&self) -> &'static str {
        match self {
            MetaOwner::Post => "post_id",
            MetaOwner::User => "user_id",
            MetaOwner::Term => "term_id",
        }
    }
}

/// The record corpus: content, metadata, options, taxonomy and theme settings.
pub struct SiteStore {
    conn: Connection,
}

impl SiteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    /// The corpus schema belongs to the host application; only missing tables are created.
    pub fn ensure_schema(&self) -> Result<(), StorageError> {
        let sql = include_str!("../migrations/0000_site_tables.sql");
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    #[cfg(test)]
    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    pub fn insert_post(
        &self,
        post_type: &str,
        title: &str,
        content: &str,
        excerpt: &str,
    ) -> Result<i64, StorageError> {
        self.conn.execute(
            "
            INSERT INTO posts (post_type, post_title, post_content, post_excerpt)
            VALUES (?1, ?2, ?3, ?4)
            ",
            params![post_type, title, content, excerpt],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn posts_batch(
        &self,
        after: i64,
        limit: usize,
        extensions: &[String],
    ) -> Result<Vec<StoredRow>, StorageError> {
        let patterns = like_patterns(extensions);
        let clause = like_clause(&["post_content", "post_excerpt"], patterns.len(), 3);
        let sql = format!(
            "
            SELECT id, post_content, post_excerpt
            FROM posts
            WHERE id > ?1 AND {clause}
            ORDER BY id ASC
            LIMIT ?2
            "
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(batch_params(after, limit, patterns), |row| {
            let id: i64 = row.get(0)?;
            Ok(StoredRow {
                key: RecordKey::Row { id },
                cursor: id,
                fields: vec![
                    column_field(PostField::Content.column(), row.get(1)?),
                    column_field(PostField::Excerpt.column(), row.get(2)?),
                ],
            })
        })?;

        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn count_post_candidates(&self, extensions: &[String]) -> Result<u64, StorageError> {
        let patterns = like_patterns(extensions);
        let clause = like_clause(&["post_content", "post_excerpt"], patterns.len(), 1);
        let sql = format!("SELECT COUNT(*) FROM posts WHERE {clause}");
        let values = patterns.into_iter().map(Value::Text).collect::<Vec<_>>();
        let count: i64 = self
            .conn
            .query_row(&sql, params_from_iter(values), |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    pub fn post_field(&self, id: i64, field: PostField) -> Result<Option<String>, StorageError> {
        let sql = format!("SELECT {} FROM posts WHERE id = ?1", field.column());
        Ok(self
            .conn
            .query_row(&sql, [id], |row| row.get(0))
            .optional()?)
    }

    pub fn update_post_field(
        &self,
        id: i64,
        field: PostField,
        value: &str,
    ) -> Result<(), StorageError> {
        let sql = format!("UPDATE posts SET {} = ?1 WHERE id = ?2", field.column());
        let changes = self.conn.execute(&sql, params![value, id])?;
        expect_row(changes, "posts", || id.to_string())
    }

    pub fn insert_meta(
        &self,
        owner: MetaOwner,
        owner_id: i64,
        key: &str,
        value: &str,
    ) -> Result<i64, StorageError> {
        let sql = format!(
            "INSERT INTO {} ({}, meta_key, meta_value) VALUES (?1, ?2, ?3)",
            owner.table(),
            owner.owner_column()
        );
        self.conn.execute(&sql, params![owner_id, key, value])?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn meta_batch(
        &self,
        owner: MetaOwner,
        after: i64,
        limit: usize,
        extensions: &[String],
    ) -> Result<Vec<StoredRow>, StorageError> {
        let patterns = like_patterns(extensions);
        let clause = like_clause(&["meta_value"], patterns.len(), 3);
        let sql = format!(
            "
            SELECT {id}, {owner}, meta_key, meta_value
            FROM {table}
            WHERE {id} > ?1 AND {clause}
            ORDER BY {id} ASC
            LIMIT ?2
            ",
            id = owner.id_column(),
            owner = owner.owner_column(),
            table = owner.table(),
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(batch_params(after, limit, patterns), |row| {
            let meta_id: i64 = row.get(0)?;
            let meta_key: String = row.get(2)?;
            Ok(StoredRow {
                key: RecordKey::Meta {
                    meta_id,
                    owner_id: row.get(1)?,
                },
                cursor: meta_id,
                fields: vec![StoredField {
                    name: meta_key.clone(),
                    label: meta_key,
                    value: row.get(3)?,
                }],
            })
        })?;

        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn meta_value(&self, owner: MetaOwner, meta_id: i64) -> Result<Option<String>, StorageError> {
        let sql = format!(
            "SELECT meta_value FROM {} WHERE {} = ?1",
            owner.table(),
            owner.id_column()
        );
        Ok(self
            .conn
            .query_row(&sql, [meta_id], |row| row.get(0))
            .optional()?)
    }

    /// First value stored under `key` for the owner, by meta id.
    pub fn get_meta(
        &self,
        owner: MetaOwner,
        owner_id: i64,
        key: &str,
    ) -> Result<Option<String>, StorageError> {
        let sql = format!(
            "SELECT meta_value FROM {} WHERE {} = ?1 AND meta_key = ?2 ORDER BY {} ASC LIMIT 1",
            owner.table(),
            owner.owner_column(),
            owner.id_column()
        );
        Ok(self
            .conn
            .query_row(&sql, params![owner_id, key], |row| row.get(0))
            .optional()?)
    }

    pub fn update_meta_value(
        &self,
        owner: MetaOwner,
        meta_id: i64,
        value: &str,
    ) -> Result<(), StorageError> {
        let sql = format!(
            "UPDATE {} SET meta_value = ?1 WHERE {} = ?2",
            owner.table(),
            owner.id_column()
        );
        let changes = self.conn.execute(&sql, params![value, meta_id])?;
        expect_row(changes, owner.table(), || meta_id.to_string())
    }

    pub fn options_batch(
        &self,
        after: i64,
        limit: usize,
        extensions: &[String],
    ) -> Result<Vec<StoredRow>, StorageError> {
        let patterns = like_patterns(extensions);
        let clause = like_clause(&["option_value"], patterns.len(), 3);
        let sql = format!(
            "
            SELECT option_id, option_name, option_value
            FROM options
            WHERE option_id > ?1 AND {clause}
            ORDER BY option_id ASC
            LIMIT ?2
            "
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(batch_params(after, limit, patterns), |row| {
            let option_id: i64 = row.get(0)?;
            let name: String = row.get(1)?;
            Ok(StoredRow {
                key: RecordKey::Option {
                    option_id,
                    name: name.clone(),
                },
                cursor: option_id,
                fields: vec![StoredField {
                    name: name.clone(),
                    label: name,
                    value: row.get(2)?,
                }],
            })
        })?;

        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn option_value(&self, name: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "SELECT option_value FROM options WHERE option_name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_option(&self, name: &str, value: &str) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO options (option_name, option_value)
            VALUES (?1, ?2)
            ON CONFLICT(option_name) DO UPDATE SET
                option_value=excluded.option_value
            ",
            params![name, value],
        )?;
        Ok(())
    }

    pub fn insert_term_taxonomy(
        &self,
        term_id: i64,
        taxonomy: &str,
        description: &str,
    ) -> Result<i64, StorageError> {
        self.conn.execute(
            "INSERT INTO term_taxonomy (term_id, taxonomy, description) VALUES (?1, ?2, ?3)",
            params![term_id, taxonomy, description],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn term_descriptions_batch(
        &self,
        after: i64,
        limit: usize,
        extensions: &[String],
    ) -> Result<Vec<StoredRow>, StorageError> {
        let patterns = like_patterns(extensions);
        let clause = like_clause(&["description"], patterns.len(), 3);
        let sql = format!(
            "
            SELECT term_taxonomy_id, taxonomy, description
            FROM term_taxonomy
            WHERE term_taxonomy_id > ?1 AND {clause}
            ORDER BY term_taxonomy_id ASC
            LIMIT ?2
            "
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(batch_params(after, limit, patterns), |row| {
            let id: i64 = row.get(0)?;
            Ok(StoredRow {
                key: RecordKey::Row { id },
                cursor: id,
                fields: vec![StoredField {
                    name: "description".to_string(),
                    label: row.get(1)?,
                    value: row.get(2)?,
                }],
            })
        })?;

        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn term_description(&self, term_taxonomy_id: i64) -> Result<Option<String>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "SELECT description FROM term_taxonomy WHERE term_taxonomy_id = ?1",
                [term_taxonomy_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn update_term_description(
        &self,
        term_taxonomy_id: i64,
        description: &str,
    ) -> Result<(), StorageError> {
        let changes = self.conn.execute(
            "UPDATE term_taxonomy SET description = ?1 WHERE term_taxonomy_id = ?2",
            params![description, term_taxonomy_id],
        )?;
        expect_row(changes, "term_taxonomy", || term_taxonomy_id.to_string())
    }

    /// Every theme setting, unfiltered: identifier-valued settings hold no extension.
    pub fn theme_mods(&self) -> Result<Vec<StoredRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT rowid, theme, name, value
            FROM theme_mods
            ORDER BY rowid ASC
            ",
        )?;
        let rows = stmt.query_map([], |row| {
            let theme: String = row.get(1)?;
            let name: String = row.get(2)?;
            Ok(StoredRow {
                key: RecordKey::ThemeMod {
                    theme,
                    name: name.clone(),
                },
                cursor: row.get(0)?,
                fields: vec![StoredField {
                    name: name.clone(),
                    label: name,
                    value: row.get(3)?,
                }],
            })
        })?;

        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn theme_mod(&self, theme: &str, name: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM theme_mods WHERE theme = ?1 AND name = ?2",
                params![theme, name],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_theme_mod(&self, theme: &str, name: &str, value: &str) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO theme_mods (theme, name, value)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(theme, name) DO UPDATE SET
                value=excluded.value
            ",
            params![theme, name, value],
        )?;
        Ok(())
    }

    /// Registers an attachment post pointing at an upload-relative file.
    pub fn insert_attachment(&self, relative_file: &str) -> Result<i64, StorageError> {
        let id = self.insert_post(ATTACHMENT_POST_TYPE, relative_file, "", "")?;
        self.insert_meta(MetaOwner::Post, id, ATTACHED_FILE_META_KEY, relative_file)?;
        Ok(id)
    }

    pub fn attachment_file(&self, attachment_id: i64) -> Result<Option<String>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "
                SELECT m.meta_value
                FROM postmeta m
                JOIN posts p ON p.id = m.post_id
                WHERE p.id = ?1 AND p.post_type = ?2 AND m.meta_key = ?3
                ORDER BY m.meta_id ASC
                LIMIT 1
                ",
                params![attachment_id, ATTACHMENT_POST_TYPE, ATTACHED_FILE_META_KEY],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn attachment_id_for_file(&self, relative_file: &str) -> Result<Option<i64>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "
                SELECT p.id
                FROM postmeta m
                JOIN posts p ON p.id = m.post_id
                WHERE m.meta_key = ?1 AND m.meta_value = ?2 AND p.post_type = ?3
                ORDER BY p.id ASC
                LIMIT 1
                ",
                params![ATTACHED_FILE_META_KEY, relative_file, ATTACHMENT_POST_TYPE],
                |row| row.get(0),
            )
            .optional()?)
    }
}

fn column_field(column: &str, value: String) -> StoredField {
    StoredField {
        name: column.to_string(),
        label: column.to_string(),
        value,
    }
}

fn batch_params(
    after: i64,
    limit: usize,
    patterns: Vec<String>,
) -> rusqlite::ParamsFromIter<Vec<Value>> {
    let mut values = Vec::with_capacity(patterns.len() + 2);
    values.push(Value::Integer(after));
    values.push(Value::Integer(limit as i64));
    values.extend(patterns.into_iter().map(Value::Text));
    params_from_iter(values)
}

fn expect_row(
    changes: usize,
    store: &'static str,
    key: impl FnOnce() -> String,
) -> Result<(), StorageError> {
    if changes == 0 {
        return Err(StorageError::RowNotFound { store, key: key() });
    }
    Ok(())
}
