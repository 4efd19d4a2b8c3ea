//! Trait contract tests for CursorStore and ChangeStore.
//!
//! Every contract is checked against both the in-memory fakes and the
//! file-backed stores; any conforming implementation must pass these.

use archci_state::fakes::{MemoryChangeStore, MemoryCursorStore};
use archci_state::storage_traits::*;
use archci_state::{JsonFileCursorStore, JsonLinesChangeStore, StorageError};
use chrono::{TimeZone, Utc};

fn change(revision: &str) -> ChangeRecord {
    ChangeRecord {
        revision: revision.to_string(),
        author: "Jane Packager <jane@example.org>".to_string(),
        committer: None,
        when: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        files: vec!["PKGBUILD".to_string()],
        comments: format!("update to {revision}"),
        tag: Some("v1.0".to_string()),
        branch: "main".to_string(),
        project: "core".to_string(),
        repository: "https://git.example.org/core.git".to_string(),
        category: "core".to_string(),
        src: "git".to_string(),
    }
}

async fn assert_cursor_round_trip(store: &dyn CursorStore) {
    assert!(store.load("repo").await.unwrap().is_empty());

    let mut cursor = RevisionCursor::new();
    cursor.advance("main", "aaa");
    cursor.advance("dev", "bbb");
    store.save("repo", &cursor).await.unwrap();

    assert_eq!(store.load("repo").await.unwrap(), cursor);
    assert!(store.load("other").await.unwrap().is_empty());
}

async fn assert_changes_keep_order(store: &dyn ChangeStore) {
    for rev in ["r1", "r2", "r3"] {
        store.add_change(&change(rev)).await.unwrap();
    }
    let revs: Vec<String> = store
        .list_changes()
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.revision)
        .collect();
    assert_eq!(revs, vec!["r1", "r2", "r3"]);
}

// ===========================================================================
// CursorStore
// ===========================================================================

#[tokio::test]
async fn memory_cursor_round_trip() {
    let store = MemoryCursorStore::new();
    assert_cursor_round_trip(&store).await;
    assert_eq!(store.save_count(), 1);
}

#[tokio::test]
async fn json_cursor_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileCursorStore::new(dir.path().join("state/cursor.json"));
    assert_cursor_round_trip(&store).await;
}

#[tokio::test]
async fn json_cursor_keeps_other_sources() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileCursorStore::new(dir.path().join("cursor.json"));

    let mut a = RevisionCursor::new();
    a.advance("main", "a1");
    let mut b = RevisionCursor::new();
    b.advance("main", "b1");
    store.save("a", &a).await.unwrap();
    store.save("b", &b).await.unwrap();

    let reopened = JsonFileCursorStore::new(store.path());
    assert_eq!(reopened.load("a").await.unwrap(), a);
    assert_eq!(reopened.load("b").await.unwrap(), b);
}

#[tokio::test]
async fn json_cursor_rejects_garbage() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cursor.json");
    std::fs::write(&path, "not json").unwrap();

    let err = JsonFileCursorStore::new(&path).load("a").await.unwrap_err();
    assert!(matches!(err, StorageError::Corrupt { .. }));
}

// ===========================================================================
// ChangeStore
// ===========================================================================

#[tokio::test]
async fn memory_changes_keep_order() {
    let store = MemoryChangeStore::new();
    assert_changes_keep_order(&store).await;
    assert_eq!(store.revisions(), vec!["r1", "r2", "r3"]);
}

#[tokio::test]
async fn jsonl_changes_keep_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonLinesChangeStore::new(dir.path().join("changes.jsonl"));
    assert_changes_keep_order(&store).await;
}

#[tokio::test]
async fn jsonl_missing_file_is_empty_feed() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonLinesChangeStore::new(dir.path().join("absent.jsonl"));
    assert!(store.list_changes().await.unwrap().is_empty());
}
