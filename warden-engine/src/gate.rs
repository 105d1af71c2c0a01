//! Filesystem snapshot and allowed-writes gate
//!
//! A step's working tree is fingerprinted before and after execution. Every
//! regular file whose `(mtime, size)` fingerprint is new or changed must match
//! one of the step's write patterns, otherwise the step fails.

use glob::{MatchOptions, Pattern};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};
use walkdir::WalkDir;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Modification time and size of one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub modified_nanos: u128,
    pub size: u64,
}

/// Fingerprints of every regular file under a root, keyed by relative path
#[derive(Debug, Clone, Default)]
pub struct TreeSnapshot {
    files: BTreeMap<String, Fingerprint>,
}

impl TreeSnapshot {
    /// Walks `root` without following symlinks; unreadable entries are skipped
    pub fn capture(root: &Path) -> Self {
        let mut files = BTreeMap::new();

        for entry in WalkDir::new(root).follow_links(false).into_iter() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("Skipping unreadable entry during snapshot: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let Ok(rel) = entry.path().strip_prefix(root) else {
                continue;
            };

            let modified_nanos = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_nanos())
                .unwrap_or(0);

            files.insert(
                relative_key(rel),
                Fingerprint {
                    modified_nanos,
                    size: metadata.len(),
                },
            );
        }

        Self { files }
    }

    /// Paths that are new in `self` or whose fingerprint differs from `before`
    pub fn changed_since(&self, before: &TreeSnapshot) -> Vec<String> {
        self.files
            .iter()
            .filter(|(path, print)| before.files.get(*path) != Some(print))
            .map(|(path, _)| path.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Joins path components with `/` regardless of platform
fn relative_key(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Result of checking a change set against the allow-list
#[derive(Debug, Clone)]
pub struct GateVerdict {
    pub changed: Vec<String>,
    pub denied: Vec<String>,
}

impl GateVerdict {
    pub fn passed(&self) -> bool {
        self.denied.is_empty()
    }
}

/// Allow-list of glob patterns a step may write to
///
/// Patterns match with dotfiles enabled; `*` stays within one path segment
/// and `**` spans directories.
#[derive(Debug, Clone)]
pub struct WriteGate {
    patterns: Vec<String>,
    compiled: Vec<Pattern>,
}

impl WriteGate {
    pub fn new(patterns: Vec<String>) -> Self {
        let compiled = patterns
            .iter()
            .filter_map(|p| match Pattern::new(p) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!("Ignoring invalid write pattern '{}': {}", p, e);
                    None
                }
            })
            .collect();
        Self { patterns, compiled }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn allows(&self, path: &str) -> bool {
        self.compiled
            .iter()
            .any(|p| p.matches_with(path, MATCH_OPTIONS))
    }

    pub fn check(&self, changed: Vec<String>) -> GateVerdict {
        let denied = changed
            .iter()
            .filter(|path| !self.allows(path))
            .cloned()
            .collect();
        GateVerdict { changed, denied }
    }

    /// Compares two snapshots and checks the difference
    pub fn evaluate(&self, before: &TreeSnapshot, after: &TreeSnapshot) -> GateVerdict {
        self.check(after.changed_since(before))
    }

    /// Log line describing a failed verdict
    pub fn violation_message(&self, verdict: &GateVerdict) -> String {
        let denied = verdict
            .denied
            .iter()
            .map(|p| format!(" - {}", p))
            .collect::<Vec<_>>()
            .join("\n");
        let allowed = self
            .patterns
            .iter()
            .map(|p| format!(" - {}", p))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "[SECURITY] allowed-writes violation:\ndenied:\n{}\nallowed:\n{}",
            denied, allowed
        )
    }
}
