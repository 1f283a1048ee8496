//! Collection entries and snapshot normalization.
//!
//! A snapshot is a full replacement of the desired state, never a delta.
//! Before a snapshot reaches the task manager it is normalized:
//!
//! - entries with a blank `path` or `topic` are rejected
//! - for duplicated paths the LAST occurrence wins, even when it is
//!   invalid: the path is then dropped rather than falling back to an
//!   earlier entry
//! - an empty snapshot is valid and means "stop everything"

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// One desired collection: tail `path`, ship lines to `topic`.
///
/// Identity is the path alone. Two entries with the same path and a
/// different topic describe the same collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectEntry {
    pub path: String,
    pub topic: String,
}

impl CollectEntry {
    pub fn new(path: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            topic: topic.into(),
        }
    }

    /// True when both fields carry something other than whitespace.
    pub fn is_valid(&self) -> bool {
        !self.path.trim().is_empty() && !self.topic.trim().is_empty()
    }
}

impl fmt::Display for CollectEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.path, self.topic)
    }
}

/// Result of [`normalize_snapshot`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedSnapshot {
    /// Surviving entries, one per path, ordered by each path's last occurrence.
    pub entries: Vec<CollectEntry>,
    /// Paths that appeared more than once (each listed once), including
    /// paths dropped because their last occurrence was invalid.
    pub duplicate_paths: Vec<String>,
    /// Entries dropped because a field was blank.
    pub invalid: Vec<CollectEntry>,
}

impl NormalizedSnapshot {
    pub fn is_clean(&self) -> bool {
        self.duplicate_paths.is_empty() && self.invalid.is_empty()
    }
}

/// Apply the snapshot malformation policy.
pub fn normalize_snapshot(entries: Vec<CollectEntry>) -> NormalizedSnapshot {
    let mut invalid = Vec::new();
    let mut seen: HashSet<String> = HashSet::with_capacity(entries.len());
    let mut duplicates: Vec<String> = Vec::new();
    let mut survivors: Vec<CollectEntry> = Vec::with_capacity(entries.len());

    // Walk backwards so the first time we see a path is its last occurrence.
    for entry in entries.into_iter().rev() {
        let has_path = !entry.path.trim().is_empty();
        if has_path && seen.contains(&entry.path) {
            if !duplicates.contains(&entry.path) {
                duplicates.push(entry.path.clone());
            }
            continue;
        }
        if has_path {
            // An invalid last occurrence still claims the path.
            seen.insert(entry.path.clone());
        }
        if entry.is_valid() {
            survivors.push(entry);
        } else {
            invalid.push(entry);
        }
    }

    survivors.reverse();
    duplicates.reverse();
    invalid.reverse();

    NormalizedSnapshot {
        entries: survivors,
        duplicate_paths: duplicates,
        invalid,
    }
}

/// Decode a snapshot stored as a JSON array of `{"path", "topic"}` objects.
///
/// A blank payload decodes to an empty snapshot.
pub fn parse_snapshot_json(payload: &[u8]) -> Result<Vec<CollectEntry>> {
    let text = std::str::from_utf8(payload).map_err(|_| ProtocolError::NotUtf8)?;
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(text)?)
}
