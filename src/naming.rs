//! File-name resolution for record files: a stable, human-readable base name
//! derived from slug, title, or identifier, plus run-wide deduplication.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));
static DISALLOWED: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9-]+").expect("valid regex"));
static HYPHEN_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"-{2,}").expect("valid regex"));

/// Normalize arbitrary text into a lowercase hyphenated file-name stem.
/// Returns an empty string when nothing survives (e.g. emoji-only input).
fn normalize(raw: &str) -> String {
    let decomposed: String = raw.nfd().filter(|c| !is_combining_mark(*c)).collect();
    let lowered = decomposed.to_lowercase();
    let hyphenated = WHITESPACE.replace_all(lowered.trim(), "-");
    let stripped = DISALLOWED.replace_all(&hyphenated, "");
    let collapsed = HYPHEN_RUNS.replace_all(&stripped, "-");
    collapsed.trim_matches('-').to_string()
}

/// Derive the base file name for a record: slug first, then titles in order,
/// then the identifier. Pure; never fails. `id` is required to be non-empty,
/// and if even it normalizes to nothing the raw id is used as-is.
pub fn resolve_base_file_name(slug: Option<&str>, titles: &[String], id: &str) -> String {
    if let Some(slug) = slug {
        if !slug.trim().is_empty() {
            let normalized = normalize(slug);
            if !normalized.is_empty() {
                return normalized;
            }
        }
    }
    for title in titles {
        if !title.trim().is_empty() {
            let normalized = normalize(title);
            if !normalized.is_empty() {
                return normalized;
            }
        }
    }
    let normalized = normalize(id);
    if normalized.is_empty() {
        id.to_string()
    } else {
        normalized
    }
}

/// Pick a collision-free file name and record it in `used`. The suffix is the
/// record's own stable identifier, never a counter, so retrying the same
/// record yields the same name. Callers must share one `used` set across an
/// entire publish or pull run.
pub fn deduplicate_file_name(
    base: &str,
    extension: &str,
    used: &mut HashSet<String>,
    unique_suffix: &str,
) -> String {
    let candidate = format!("{base}{extension}");
    let chosen = if used.contains(&candidate) {
        format!("{base}-{unique_suffix}{extension}")
    } else {
        candidate
    };
    used.insert(chosen.clone());
    chosen
}
