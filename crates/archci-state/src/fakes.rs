//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryCursorStore` and `MemoryChangeStore` that satisfy the
//! trait contracts without touching the filesystem.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryCursorStore
// ---------------------------------------------------------------------------

/// In-memory cursor store backed by a `HashMap<source, cursor>`.
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    cursors: Mutex<HashMap<String, RevisionCursor>>,
    saves: Mutex<usize>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a cursor before handing the store to a poller.
    pub fn with_cursor(self, source: &str, cursor: RevisionCursor) -> Self {
        self.cursors
            .lock()
            .unwrap()
            .insert(source.to_string(), cursor);
        self
    }

    /// Number of `save` calls observed.
    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self, source: &str) -> StorageResult<RevisionCursor> {
        let cursors = self.cursors.lock().unwrap();
        Ok(cursors.get(source).cloned().unwrap_or_default())
    }

    async fn save(&self, source: &str, cursor: &RevisionCursor) -> StorageResult<()> {
        self.cursors
            .lock()
            .unwrap()
            .insert(source.to_string(), cursor.clone());
        *self.saves.lock().unwrap() += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryChangeStore
// ---------------------------------------------------------------------------

/// In-memory change feed backed by a `Vec`.
#[derive(Debug, Default)]
pub struct MemoryChangeStore {
    changes: Mutex<Vec<(ChangeId, ChangeRecord)>>,
}

impl MemoryChangeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Revisions added so far, oldest first.
    pub fn revisions(&self) -> Vec<String> {
        self.changes
            .lock()
            .unwrap()
            .iter()
            .map(|(_, c)| c.revision.clone())
            .collect()
    }
}

#[async_trait]
impl ChangeStore for MemoryChangeStore {
    async fn add_change(&self, change: &ChangeRecord) -> StorageResult<ChangeId> {
        let id = ChangeId::new();
        self.changes
            .lock()
            .unwrap()
            .push((id.clone(), change.clone()));
        Ok(id)
    }

    async fn list_changes(&self) -> StorageResult<Vec<ChangeRecord>> {
        Ok(self
            .changes
            .lock()
            .unwrap()
            .iter()
            .map(|(_, c)| c.clone())
            .collect())
    }
}
