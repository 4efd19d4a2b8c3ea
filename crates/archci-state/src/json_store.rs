//! File-backed storage used by the `archci poll` daemon.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::StorageError;
use crate::storage_traits::*;

/// Cursor store keeping every source's cursor in one JSON document.
///
/// Writes go to a sibling temp file which is then renamed over the original,
/// so a crash never leaves a half-written cursor behind.
#[derive(Debug)]
pub struct JsonFileCursorStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileCursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> StorageResult<BTreeMap<String, RevisionCursor>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(BTreeMap::new());
        }
        serde_json::from_slice(&raw).map_err(|e| StorageError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl CursorStore for JsonFileCursorStore {
    async fn load(&self, source: &str) -> StorageResult<RevisionCursor> {
        let all = self.read_all().await?;
        Ok(all.get(source).cloned().unwrap_or_default())
    }

    async fn save(&self, source: &str, cursor: &RevisionCursor) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut all = self.read_all().await?;
        all.insert(source.to_string(), cursor.clone());

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&all)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), source = %source, "cursor saved");
        Ok(())
    }
}

/// Change feed stored as newline-delimited JSON, one record per line.
#[derive(Debug)]
pub struct JsonLinesChangeStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonLinesChangeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl ChangeStore for JsonLinesChangeStore {
    async fn add_change(&self, change: &ChangeRecord) -> StorageResult<ChangeId> {
        let _guard = self.write_lock.lock().await;
        let mut line = serde_json::to_vec(change)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(ChangeId::new())
    }

    async fn list_changes(&self) -> StorageResult<Vec<ChangeRecord>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        raw.lines()
            .enumerate()
            .filter(|(_, l)| !l.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str(line).map_err(|e| StorageError::Corrupt {
                    path: self.path.clone(),
                    reason: format!("line {}: {}", idx + 1, e),
                })
            })
            .collect()
    }
}
