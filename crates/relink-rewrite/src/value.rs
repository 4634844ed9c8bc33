use crate::protected::{AssetIndex, ProtectedFieldPolicy, ProtectedOutcome};
use crate::resolver::{AssetFs, ReferenceResolver};
use crate::scan::ReferenceScanner;
use crate::serialized::{looks_serialized, SerializedValue};
use relink_core::{ReferenceTally, SkipReason};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

/// A stored value decoded once at the rewriter boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Serialized composite; surrounding whitespace is kept verbatim.
    Composite {
        value: SerializedValue,
        leading: String,
        trailing: String,
    },
    /// Numbers keep their source spelling. `slash_escapes` holds one flag
    /// per string literal (keys included) in document order: whether its
    /// source spelling wrote `/` as `\/`.
    Json {
        value: JsonValue,
        slash_escapes: Vec<bool>,
    },
    Scalar(String),
    /// Shaped like a serialized array, object or string but fails to parse.
    /// Never rewritten: byte lengths inside it can't be trusted.
    Undecodable,
}

impl FieldValue {
    pub fn decode(raw: &str) -> Self {
        let trimmed = raw.trim();
        if looks_serialized(trimmed) {
            match SerializedValue::parse(trimmed) {
                Ok(value) => {
                    let leading_len = raw.len() - raw.trim_start().len();
                    return FieldValue::Composite {
                        value,
                        leading: raw[..leading_len].to_string(),
                        trailing: raw[leading_len + trimmed.len()..].to_string(),
                    };
                }
                Err(_) if matches!(trimmed.as_bytes()[0], b'a' | b'O' | b's' | b'C') => {
                    return FieldValue::Undecodable;
                }
                Err(_) => {}
            }
        }

        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            if let Ok(value) = serde_json::from_str::<JsonValue>(trimmed) {
                if value.is_object() || value.is_array() {
                    let mut slash_escapes = literal_slash_escapes(trimmed);
                    let strings = count_json_strings(&value);
                    if slash_escapes.len() != strings {
                        // Duplicate keys collapse literals; fall back to one
                        // document-wide choice.
                        let any = slash_escapes.iter().any(|escaped| *escaped);
                        slash_escapes = vec![any; strings];
                    }
                    return FieldValue::Json {
                        value,
                        slash_escapes,
                    };
                }
            }
        }

        FieldValue::Scalar(raw.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct RewriteConfig {
    /// Case-insensitive substrings of field names holding third-party builder
    /// configuration.
    pub opaque_field_patterns: Vec<String>,
    pub opaque_size_threshold: usize,
    /// Nesting limit for encodings inside strings (JSON inside serialized...).
    pub max_depth: usize,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            opaque_field_patterns: [
                "_elementor_data",
                "_elementor_page_settings",
                "_fl_builder_data",
                "_fl_builder_draft",
                "_et_builder",
                "_brizy",
                "_oxygen",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            opaque_size_threshold: 65_536,
            max_depth: 16,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteOutcome {
    /// `Some` only when at least one reference changed.
    pub value: Option<String>,
    pub tally: ReferenceTally,
    pub opaque_skipped: bool,
}

impl RewriteOutcome {
    pub fn changed(&self) -> bool {
        self.value.is_some()
    }
}

pub struct ValueRewriter<F> {
    resolver: ReferenceResolver<F>,
    scanner: ReferenceScanner,
    protected: ProtectedFieldPolicy,
    config: RewriteConfig,
}

impl<F: AssetFs> ValueRewriter<F> {
    pub fn new(
        resolver: ReferenceResolver<F>,
        config: RewriteConfig,
        protected: ProtectedFieldPolicy,
    ) -> Result<Self, regex::Error> {
        let mut extensions = resolver.legacy_extensions().to_vec();
        extensions.push(resolver.target_extension().to_string());
        let scanner = ReferenceScanner::new(&extensions)?;
        Ok(Self {
            resolver,
            scanner,
            protected,
            config,
        })
    }

    pub fn resolver(&self) -> &ReferenceResolver<F> {
        &self.resolver
    }

    pub fn protected(&self) -> &ProtectedFieldPolicy {
        &self.protected
    }

    pub fn is_opaque(&self, label: &str, raw: &str) -> bool {
        let label = label.to_lowercase();
        let trimmed = raw.trim_start();
        (trimmed.starts_with('{') || trimmed.starts_with('['))
            && raw.len() > self.config.opaque_size_threshold
            && self
                .config
                .opaque_field_patterns
                .iter()
                .any(|pattern| label.contains(&pattern.to_lowercase()))
    }

    /// Rewrites a named field, honouring the opaque-payload skip.
    pub fn rewrite_field(&self, label: &str, raw: &str) -> RewriteOutcome {
        if self.is_opaque(label, raw) {
            debug!(
                event = "opaque_field_skipped",
                field = label,
                bytes = raw.len()
            );
            return RewriteOutcome {
                opaque_skipped: true,
                ..RewriteOutcome::default()
            };
        }
        self.rewrite_value(raw)
    }

    pub fn rewrite_value(&self, raw: &str) -> RewriteOutcome {
        let mut tally = ReferenceTally::default();
        let value = self.rewrite_text(raw, 0, &mut tally);
        RewriteOutcome {
            value,
            tally,
            opaque_skipped: false,
        }
    }

    /// Identifier-valued field: the result is another identifier or nothing.
    pub fn rewrite_protected<I: AssetIndex>(&self, raw: &str, index: &I) -> RewriteOutcome {
        let mut outcome = RewriteOutcome::default();
        match self.protected.apply(raw, &self.resolver, index) {
            ProtectedOutcome::Substituted { replacement, .. } => {
                outcome.tally.record_replaced();
                outcome.value = Some(replacement.to_string());
            }
            ProtectedOutcome::NoMigratedAsset { .. } => {
                outcome.tally.record_skip(SkipReason::NoTarget);
            }
            ProtectedOutcome::NotAnIdentifier => {}
            ProtectedOutcome::LookupFailed { id, error } => {
                warn!(event = "protected_lookup_failed", id, error = %error);
            }
        }
        outcome
    }

    fn rewrite_text(&self, raw: &str, depth: usize, tally: &mut ReferenceTally) -> Option<String> {
        if depth > self.config.max_depth {
            return None;
        }

        match FieldValue::decode(raw) {
            FieldValue::Composite {
                mut value,
                leading,
                trailing,
            } => {
                let mut local = ReferenceTally::default();
                if !self.rewrite_serialized(&mut value, depth, &mut local) {
                    tally.merge(&local);
                    return None;
                }
                let encoded = value.encode();
                if SerializedValue::parse(&encoded).is_err() {
                    warn!(event = "serialized_reencode_failed", bytes = raw.len());
                    local.replaced = 0;
                    tally.merge(&local);
                    return None;
                }
                tally.merge(&local);
                Some(format!("{leading}{encoded}{trailing}"))
            }
            FieldValue::Json {
                mut value,
                slash_escapes,
            } => {
                let mut local = ReferenceTally::default();
                let changed = self.rewrite_json(&mut value, depth, &mut local);
                if !changed {
                    tally.merge(&local);
                    return None;
                }
                let mut encoded = String::with_capacity(raw.len());
                match write_json(&value, &mut slash_escapes.into_iter(), &mut encoded) {
                    Ok(()) => {
                        tally.merge(&local);
                        Some(encoded)
                    }
                    Err(err) => {
                        warn!(event = "json_reencode_failed", error = %err);
                        local.replaced = 0;
                        tally.merge(&local);
                        None
                    }
                }
            }
            FieldValue::Scalar(text) => self.scanner.rewrite(&text, &self.resolver, tally),
            FieldValue::Undecodable => {
                debug!(event = "undecodable_value_skipped", bytes = raw.len());
                None
            }
        }
    }

    fn rewrite_serialized(
        &self,
        value: &mut SerializedValue,
        depth: usize,
        tally: &mut ReferenceTally,
    ) -> bool {
        match value {
            SerializedValue::Str(text) => match self.rewrite_text(text, depth + 1, tally) {
                Some(rewritten) => {
                    *text = rewritten;
                    true
                }
                None => false,
            },
            SerializedValue::Array(entries) | SerializedValue::Object { members: entries, .. } => {
                let mut changed = false;
                for (_, entry) in entries.iter_mut() {
                    changed |= self.rewrite_serialized(entry, depth, tally);
                }
                changed
            }
            SerializedValue::Null
            | SerializedValue::Bool(_)
            | SerializedValue::Int(_)
            | SerializedValue::Float(_) => false,
        }
    }

    fn rewrite_json(
        &self,
        value: &mut JsonValue,
        depth: usize,
        tally: &mut ReferenceTally,
    ) -> bool {
        match value {
            JsonValue::String(text) => match self.rewrite_text(text, depth + 1, tally) {
                Some(rewritten) => {
                    *text = rewritten;
                    true
                }
                None => false,
            },
            JsonValue::Array(items) => {
                let mut changed = false;
                for item in items.iter_mut() {
                    changed |= self.rewrite_json(item, depth, tally);
                }
                changed
            }
            JsonValue::Object(map) => {
                let mut changed = false;
                for (_, item) in map.iter_mut() {
                    changed |= self.rewrite_json(item, depth, tally);
                }
                changed
            }
            JsonValue::Null | JsonValue::Bool(_) | JsonValue::Number(_) => false,
        }
    }
}

/// Scans string literals in document order and reports which ones contain `\/`.
fn literal_slash_escapes(json: &str) -> Vec<bool> {
    let mut flags = Vec::new();
    let mut bytes = json.bytes();
    while let Some(byte) = bytes.next() {
        if byte != b'"' {
            continue;
        }
        let mut escaped_slash = false;
        while let Some(byte) = bytes.next() {
            match byte {
                b'\\' => {
                    if bytes.next() == Some(b'/') {
                        escaped_slash = true;
                    }
                }
                b'"' => break,
                _ => {}
            }
        }
        flags.push(escaped_slash);
    }
    flags
}

fn count_json_strings(value: &JsonValue) -> usize {
    match value {
        JsonValue::String(_) => 1,
        JsonValue::Array(items) => items.iter().map(count_json_strings).sum(),
        JsonValue::Object(map) => map
            .iter()
            .map(|(_, item)| 1 + count_json_strings(item))
            .sum(),
        JsonValue::Null | JsonValue::Bool(_) | JsonValue::Number(_) => 0,
    }
}

/// Compact encoding; each string literal takes the next slash-escape flag.
fn write_json(
    value: &JsonValue,
    slash_escapes: &mut impl Iterator<Item = bool>,
    out: &mut String,
) -> Result<(), serde_json::Error> {
    match value {
        JsonValue::String(text) => {
            write_json_string(text, slash_escapes.next().unwrap_or(false), out)?
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (position, item) in items.iter().enumerate() {
                if position > 0 {
                    out.push(',');
                }
                write_json(item, slash_escapes, out)?;
            }
            out.push(']');
        }
        JsonValue::Object(map) => {
            out.push('{');
            for (position, (key, item)) in map.iter().enumerate() {
                if position > 0 {
                    out.push(',');
                }
                write_json_string(key, slash_escapes.next().unwrap_or(false), out)?;
                out.push(':');
                write_json(item, slash_escapes, out)?;
            }
            out.push('}');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}

fn write_json_string(
    text: &str,
    escape_slashes: bool,
    out: &mut String,
) -> Result<(), serde_json::Error> {
    let encoded = serde_json::to_string(text)?;
    if escape_slashes {
        out.push_str(&encoded.replace('/', "\\/"));
    } else {
        out.push_str(&encoded);
    }
    Ok(())
}
