//! Branch-name resolution: slugs, natural-language aliases, placeholders.
//!
//! Conventions are stored as patterns like `levelup/{run_id}` or
//! `feature/{task_title}-{date}`. Operators often type natural-language
//! variants ("feature/task-title-in-kebab-case"); `normalize_convention`
//! maps those onto the canonical placeholders before resolution.

use std::sync::LazyLock;

use regex::Regex;

/// Canonical placeholders recognized in branch patterns.
const PLACEHOLDERS: [&str; 3] = ["{run_id}", "{task_title}", "{date}"];

/// Natural-language aliases, longest-first so greedy matching wins.
const ALIASES: [(&str, &str); 10] = [
    ("task-title-in-kebab-case", "{task_title}"),
    ("task-title", "{task_title}"),
    ("task_title", "{task_title}"),
    ("title", "{task_title}"),
    ("task", "{task_title}"),
    ("run-id", "{run_id}"),
    ("run_id", "{run_id}"),
    ("runid", "{run_id}"),
    ("id", "{run_id}"),
    ("date", "{date}"),
];

/// Trailing format descriptors stripped from segments that already contain
/// a placeholder ("-in-kebab-case", "-slug", "_snake", ...).
static FORMAT_DESCRIPTOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)([-_]in[-_](kebab|snake|camel|pascal)[-_]case|[-_](slug|kebab|snake|camel|pascal))$",
    )
    .unwrap_or_else(|e| panic!("invalid format-descriptor regex: {}", e))
});

static NON_ALNUM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[^a-z0-9]+").unwrap_or_else(|e| panic!("invalid slug regex: {}", e))
});

/// Convert a task title to a branch-safe slug: lowercase, non-alphanumerics
/// collapsed to single dashes, capped at 50 chars, `task` as a last resort.
pub fn slugify(title: &str) -> String {
    let lowered = title.to_lowercase();
    let mut slug = NON_ALNUM_RE
        .replace_all(&lowered, "-")
        .trim_matches('-')
        .to_string();
    if slug.len() > 50 {
        let mut cut = 50;
        while !slug.is_char_boundary(cut) {
            cut -= 1;
        }
        slug.truncate(cut);
        slug = slug.trim_end_matches('-').to_string();
    }
    if slug.is_empty() {
        "task".to_string()
    } else {
        slug
    }
}

fn has_placeholder(text: &str) -> bool {
    PLACEHOLDERS.iter().any(|p| text.contains(p))
}

/// Replace natural-language aliases with placeholders in one `/`-segment.
///
/// Aliases only match at word boundaries (segment start or after `-`/`_`/`.`
/// and followed by a separator or the segment end), tried longest-first,
/// each position consumed at most once.
fn replace_aliases_in_segment(segment: &str) -> String {
    let bytes = segment.as_bytes();
    let lower = segment.to_lowercase();
    // Aliases are ASCII-only; when case folding changes the byte length the
    // segment cannot contain one at matching offsets.
    if lower.len() != segment.len() {
        return segment.to_string();
    }
    let mut result = String::with_capacity(segment.len());
    let mut i = 0;

    while i < bytes.len() {
        let at_boundary = i == 0 || matches!(bytes[i - 1], b'-' | b'_' | b'.');
        if at_boundary {
            let mut matched = false;
            for (alias, placeholder) in ALIASES {
                let end = i + alias.len();
                if end > bytes.len() || !lower.is_char_boundary(i) || !lower.is_char_boundary(end) {
                    continue;
                }
                if &lower[i..end] != alias {
                    continue;
                }
                if end < bytes.len() && !matches!(bytes[end], b'-' | b'_' | b'.') {
                    continue;
                }
                result.push_str(placeholder);
                i = end;
                matched = true;
                break;
            }
            if matched {
                continue;
            }
        }
        // Advance one char, not one byte.
        let ch_len = segment[i..]
            .chars()
            .next()
            .map(char::len_utf8)
            .unwrap_or(1);
        result.push_str(&segment[i..i + ch_len]);
        i += ch_len;
    }

    result
}

fn strip_format_descriptors(segment: &str) -> String {
    if !has_placeholder(segment) {
        return segment.to_string();
    }
    FORMAT_DESCRIPTOR_RE.replace(segment, "").to_string()
}

/// Convert a natural-language branch pattern to canonical placeholder form.
///
/// Patterns that already contain a canonical placeholder pass through
/// unchanged. Otherwise each `/`-segment has its aliases replaced and any
/// trailing format descriptor stripped.
pub fn normalize_convention(raw: &str) -> String {
    let stripped = raw.trim();
    if stripped.is_empty() {
        return String::new();
    }
    if has_placeholder(stripped) {
        return stripped.to_string();
    }
    stripped
        .split('/')
        .map(|seg| strip_format_descriptors(&replace_aliases_in_segment(seg)))
        .collect::<Vec<_>>()
        .join("/")
}

/// Substitute placeholder values into a convention pattern.
///
/// Unknown placeholders pass through unresolved. An empty pattern falls
/// back to `levelup/{run_id}`.
pub fn resolve(convention: &str, run_id: &str, task_title: &str, date: &str) -> String {
    if convention.trim().is_empty() {
        return format!("levelup/{}", run_id);
    }
    convention
        .replace("{run_id}", run_id)
        .replace("{task_title}", &slugify(task_title))
        .replace("{date}", date)
}
