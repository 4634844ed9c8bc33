use crate::resolver::{AssetFs, ReferenceResolver};
use regex::Regex;
use relink_core::ReferenceTally;
use std::ops::Range;

const SRCSET_PATTERN: &str = r#"(?i)\b(?:data-)?srcset\s*=\s*(?:"([^"]*)"|'([^']*)')"#;
const CSS_URL_PATTERN: &str = r#"(?i)url\(\s*(?:"([^"]*)"|'([^']*)'|([^'")\s]+))\s*\)"#;

/// Finds embedded references in free text (markup, CSS, plain strings).
#[derive(Debug, Clone)]
pub struct ReferenceScanner {
    srcset: Regex,
    css_url: Regex,
    inline: Regex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegionKind {
    Srcset,
    CssUrl,
}

#[derive(Debug, Clone)]
struct Region {
    kind: RegionKind,
    span: Range<usize>,
}

impl ReferenceScanner {
    /// `extensions` should cover both legacy and target formats so already
    /// migrated references are still seen and tallied.
    pub fn new(extensions: &[String]) -> Result<Self, regex::Error> {
        let mut alternation = extensions
            .iter()
            .map(|extension| extension.trim().trim_start_matches('.'))
            .filter(|extension| !extension.is_empty())
            .map(regex::escape)
            .collect::<Vec<_>>();
        alternation.sort();
        alternation.dedup();
        alternation.sort_by_key(|extension| std::cmp::Reverse(extension.len()));
        let inline = format!(
            r#"(?i)(?:(?:https?:)?(?:\\?/){{2}}|\\?/)(?:[^\s"'<>()\[\]{{}}\\,?#|]|\\/)+\.(?:{})(?:[?#][^\s"'<>()\[\]{{}}\\,|]*)?"#,
            alternation.join("|")
        );

        Ok(Self {
            srcset: Regex::new(SRCSET_PATTERN)?,
            css_url: Regex::new(CSS_URL_PATTERN)?,
            inline: Regex::new(&inline)?,
        })
    }

    /// Rewrites every resolvable reference in `text`. Returns `None` when
    /// nothing was replaced.
    pub fn rewrite<F: AssetFs>(
        &self,
        text: &str,
        resolver: &ReferenceResolver<F>,
        tally: &mut ReferenceTally,
    ) -> Option<String> {
        let before = tally.replaced;
        let mut out = String::with_capacity(text.len());
        let mut position = 0;

        for region in self.regions(text) {
            self.rewrite_inline(text, position..region.span.start, resolver, tally, &mut out);
            let value = &text[region.span.clone()];
            match region.kind {
                RegionKind::Srcset => out.push_str(&rewrite_srcset(value, resolver, tally)),
                RegionKind::CssUrl => out.push_str(&rewrite_css_url(value, resolver, tally)),
            }
            position = region.span.end;
        }
        self.rewrite_inline(text, position..text.len(), resolver, tally, &mut out);

        (tally.replaced > before).then_some(out)
    }

    /// Attribute-value and `url(...)` spans, sorted and non-overlapping.
    fn regions(&self, text: &str) -> Vec<Region> {
        let mut regions = Vec::new();
        for (kind, pattern) in [
            (RegionKind::Srcset, &self.srcset),
            (RegionKind::CssUrl, &self.css_url),
        ] {
            for captures in pattern.captures_iter(text) {
                if let Some(value) = captures.iter().skip(1).flatten().next() {
                    regions.push(Region {
                        kind,
                        span: value.range(),
                    });
                }
            }
        }
        regions.sort_by_key(|region| region.span.start);

        let mut kept: Vec<Region> = Vec::with_capacity(regions.len());
        for region in regions {
            if kept
                .last()
                .is_some_and(|last| region.span.start < last.span.end)
            {
                continue;
            }
            kept.push(region);
        }
        kept
    }

    fn rewrite_inline<F: AssetFs>(
        &self,
        text: &str,
        span: Range<usize>,
        resolver: &ReferenceResolver<F>,
        tally: &mut ReferenceTally,
        out: &mut String,
    ) {
        let gap = &text[span.clone()];
        let mut copied = 0;
        for found in self.inline.find_iter(gap) {
            let start = span.start + found.start();
            let end = span.start + found.end();
            if !standalone(text, start, end) {
                continue;
            }
            out.push_str(&gap[copied..found.start()]);
            out.push_str(&resolve_reference(found.as_str(), resolver, tally));
            copied = found.end();
        }
        out.push_str(&gap[copied..]);
    }
}

/// A path match glued to surrounding word characters is part of something
/// else (a relative path, a longer file name).
fn standalone(text: &str, start: usize, end: usize) -> bool {
    let glued = |c: char| c.is_alphanumeric() || matches!(c, '_' | '-' | '.');
    let before = text[..start].chars().next_back();
    let after = text[end..].chars().next();
    !before.is_some_and(glued) && !after.is_some_and(glued)
}

fn rewrite_srcset<F: AssetFs>(
    value: &str,
    resolver: &ReferenceResolver<F>,
    tally: &mut ReferenceTally,
) -> String {
    value
        .split(',')
        .map(|candidate| {
            let trimmed = candidate.trim_start();
            let leading = &candidate[..candidate.len() - trimmed.len()];
            let url_len = trimmed.find(char::is_whitespace).unwrap_or(trimmed.len());
            let (url, descriptor) = trimmed.split_at(url_len);
            if url.is_empty() {
                return candidate.to_string();
            }
            format!(
                "{leading}{}{descriptor}",
                resolve_reference(url, resolver, tally)
            )
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn rewrite_css_url<F: AssetFs>(
    value: &str,
    resolver: &ReferenceResolver<F>,
    tally: &mut ReferenceTally,
) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return value.to_string();
    }
    let offset = value.len() - value.trim_start().len();
    let resolved = resolve_reference(trimmed, resolver, tally);
    format!(
        "{}{}{}",
        &value[..offset],
        resolved,
        &value[offset + trimmed.len()..]
    )
}

/// Resolves one reference, honouring JSON-escaped `\/` spellings.
fn resolve_reference<F: AssetFs>(
    reference: &str,
    resolver: &ReferenceResolver<F>,
    tally: &mut ReferenceTally,
) -> String {
    let escaped = reference.contains("\\/");
    let plain = if escaped {
        reference.replace("\\/", "/")
    } else {
        reference.to_string()
    };

    let resolution = resolver.resolve(&plain);
    match resolution.skip_reason {
        Some(reason) => {
            tally.record_skip(reason);
            reference.to_string()
        }
        None => {
            tally.record_replaced();
            if escaped {
                resolution.replacement.replace('/', "\\/")
            } else {
                resolution.replacement
            }
        }
    }
}
