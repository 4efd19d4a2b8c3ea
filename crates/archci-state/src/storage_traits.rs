//! Storage trait definitions for ArchCI
//!
//! These traits define the state the change poller depends on:
//! - `CursorStore`: last-seen revision per branch, keyed by watched source
//! - `ChangeStore`: append-only feed of detected commits
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// RevisionCursor
// ---------------------------------------------------------------------------

/// Per-branch last-seen revision of one watched repository.
///
/// A branch absent from the map is untracked. An entirely empty cursor means
/// the repository has never been polled, which the poller treats as a
/// priming pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionCursor {
    last_seen: BTreeMap<String, String>,
}

impl RevisionCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether no branch has been observed yet.
    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    /// Last-seen revision for `branch`, if tracked.
    pub fn get(&self, branch: &str) -> Option<&str> {
        self.last_seen.get(branch).map(String::as_str)
    }

    /// Record `revision` as the newest observed revision of `branch`.
    pub fn advance(&mut self, branch: &str, revision: &str) {
        self.last_seen
            .insert(branch.to_string(), revision.to_string());
    }

    /// Every tracked revision across all branches, sorted and deduplicated.
    pub fn revisions(&self) -> Vec<String> {
        let mut revs: Vec<String> = self.last_seen.values().cloned().collect();
        revs.sort();
        revs.dedup();
        revs
    }

    /// Tracked branch names in sorted order.
    pub fn branches(&self) -> impl Iterator<Item = &str> {
        self.last_seen.keys().map(String::as_str)
    }
}

impl FromIterator<(String, String)> for RevisionCursor {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            last_seen: iter.into_iter().collect(),
        }
    }
}

/// Persistence for revision cursors, one per watched source.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Load the cursor for `source`. Returns an empty cursor if none was saved.
    async fn load(&self, source: &str) -> StorageResult<RevisionCursor>;

    /// Replace the stored cursor for `source`.
    async fn save(&self, source: &str, cursor: &RevisionCursor) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// ChangeRecord
// ---------------------------------------------------------------------------

/// Unique identifier for a stored change
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeId(pub String);

impl ChangeId {
    /// Generate a new random ChangeId
    pub fn new() -> Self {
        ChangeId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for ChangeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ChangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One detected commit, ready to trigger a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub revision: String,
    pub author: String,
    pub committer: Option<String>,
    /// Commit time
    pub when: DateTime<Utc>,
    /// Paths touched by the commit
    pub files: Vec<String>,
    /// Full commit message
    pub comments: String,
    /// Nearest tag as reported by `describe`
    pub tag: Option<String>,
    /// Branch name without the `refs/heads/` prefix
    pub branch: String,
    pub project: String,
    pub repository: String,
    pub category: String,
    /// VCS the change came from (always "git" for the git poller)
    pub src: String,
}

/// Append-only feed of detected changes.
///
/// Guarantees:
/// - `list_changes` returns records in the order they were added.
/// - Records are never rewritten once added.
#[async_trait]
pub trait ChangeStore: Send + Sync {
    /// Append a change, returning its identifier.
    async fn add_change(&self, change: &ChangeRecord) -> StorageResult<ChangeId>;

    /// All changes added so far, oldest first.
    async fn list_changes(&self) -> StorageResult<Vec<ChangeRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cursor_has_no_revisions() {
        let cursor = RevisionCursor::new();
        assert!(cursor.is_empty());
        assert!(cursor.revisions().is_empty());
        assert_eq!(cursor.get("main"), None);
    }

    #[test]
    fn advance_overwrites_branch_entry() {
        let mut cursor = RevisionCursor::new();
        cursor.advance("main", "a1");
        cursor.advance("main", "b2");
        assert_eq!(cursor.get("main"), Some("b2"));
        assert_eq!(cursor.len(), 1);
    }

    #[test]
    fn revisions_are_sorted_and_deduplicated() {
        let cursor: RevisionCursor = [
            ("main".to_string(), "ccc".to_string()),
            ("dev".to_string(), "aaa".to_string()),
            ("release".to_string(), "ccc".to_string()),
        ]
        .into_iter()
        .collect();

        assert_eq!(cursor.revisions(), vec!["aaa".to_string(), "ccc".to_string()]);
        assert_eq!(
            cursor.branches().collect::<Vec<_>>(),
            vec!["dev", "main", "release"]
        );
    }

    #[test]
    fn cursor_serializes_as_plain_map() {
        let mut cursor = RevisionCursor::new();
        cursor.advance("main", "abc");
        let json = serde_json::to_value(&cursor).unwrap();
        assert_eq!(json, serde_json::json!({ "main": "abc" }));
    }
}
