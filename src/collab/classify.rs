//! Additive vs shared-state classification of changed files
//!
//! Matching is depth-sensitive: `*` stays inside one path segment and `**`
//! spans whole segments, so `examples/*.yaml` does not cover
//! `examples/nested/a.yaml`. Nesting is a structural change and goes to review.

use once_cell::sync::Lazy;
use regex::Regex;

use super::MANIFEST_FILE;

/// Append-only files, safe to merge blindly. Order is significant only for readability.
pub const ADDITIVE_PATTERNS: &[&str] = &[
    "examples/*.yaml",
    "learnings/failures/*.yaml",
    "learnings/*.md",
    "feedback/*.yaml",
    "traces/**/*.jsonl",
];

/// Shared-state files that are append-only in practice
pub const AUTO_MERGEABLE_SHARED: &[&str] = &[MANIFEST_FILE];

/// Label of a changed file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileClass {
    Additive,
    Shared,
}

enum Segment {
    /// `**`: zero or more whole segments
    AnyDepth,
    /// Exactly one segment
    Name(Regex),
}

struct PathPattern {
    segments: Vec<Segment>,
}

impl PathPattern {
    fn compile(pattern: &str) -> Result<Self, regex::Error> {
        let segments = pattern
            .split('/')
            .map(|seg| {
                if seg == "**" {
                    Ok(Segment::AnyDepth)
                } else {
                    segment_regex(seg).map(Segment::Name)
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { segments })
    }

    fn matches(&self, path: &str) -> bool {
        let parts: Vec<&str> = path.split('/').collect();
        match_segments(&self.segments, &parts)
    }
}

fn segment_regex(segment: &str) -> Result<Regex, regex::Error> {
    let mut expr = String::from("^");
    for ch in segment.chars() {
        match ch {
            '*' => expr.push_str("[^/]*"),
            '?' => expr.push_str("[^/]"),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr)
}

fn match_segments(pattern: &[Segment], parts: &[&str]) -> bool {
    match pattern.split_first() {
        None => parts.is_empty(),
        Some((Segment::AnyDepth, rest)) => {
            (0..=parts.len()).any(|skip| match_segments(rest, &parts[skip..]))
        }
        Some((Segment::Name(re), rest)) => match parts.split_first() {
            Some((head, tail)) => re.is_match(head) && match_segments(rest, tail),
            None => false,
        },
    }
}

static ADDITIVE: Lazy<Vec<PathPattern>> = Lazy::new(|| {
    ADDITIVE_PATTERNS
        .iter()
        .filter_map(|p| match PathPattern::compile(p) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                tracing::error!(pattern = %p, error = %e, "invalid additive pattern");
                None
            }
        })
        .collect()
});

/// Classify a single path
pub fn classify_file(path: &str) -> FileClass {
    if path.is_empty() {
        return FileClass::Shared;
    }
    if ADDITIVE.iter().any(|p| p.matches(path)) {
        FileClass::Additive
    } else {
        FileClass::Shared
    }
}

/// Partition paths into (additive, shared), keeping input order and duplicates
pub fn classify<S: AsRef<str>>(paths: &[S]) -> (Vec<String>, Vec<String>) {
    let mut additive = Vec::new();
    let mut shared = Vec::new();

    for path in paths {
        let path = path.as_ref();
        match classify_file(path) {
            FileClass::Additive => additive.push(path.to_string()),
            FileClass::Shared => shared.push(path.to_string()),
        }
    }

    (additive, shared)
}

/// True when every shared file is on the auto-merge allow-list
pub fn is_auto_mergeable_shared<S: AsRef<str>>(files: &[S]) -> bool {
    files
        .iter()
        .all(|f| AUTO_MERGEABLE_SHARED.contains(&f.as_ref()))
}

/// Changed files split by what the engine may do with them
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Additive files plus allow-listed shared files
    pub allow: Vec<String>,
    /// Shared files that need review
    pub blocking: Vec<String>,
}

impl ChangeSet {
    pub fn from_paths<S: AsRef<str>>(paths: &[S]) -> Self {
        let (additive, shared) = classify(paths);
        let (listed, blocking): (Vec<String>, Vec<String>) = shared
            .into_iter()
            .partition(|f| is_auto_mergeable_shared(std::slice::from_ref(f)));

        let mut allow = additive;
        allow.extend(listed);
        Self { allow, blocking }
    }

    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.blocking.is_empty()
    }

    /// Whole changed set, allow files first
    pub fn all(&self) -> Vec<String> {
        self.allow.iter().chain(self.blocking.iter()).cloned().collect()
    }
}
