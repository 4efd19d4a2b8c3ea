//! Change extraction against a multi-branch revision cursor.
//!
//! All tests run on the in-memory VCS graph so ancestry and failures are
//! fully controlled.

use std::sync::Arc;

use archci_core::fakes::{MemoryVcs, MetadataField, RecordingNotifier};
use archci_core::poller::{ChangeExtractor, ExtractorConfig};
use archci_core::{ArchCiError, ReleaseNotice};
use archci_state::fakes::{MemoryChangeStore, MemoryCursorStore};
use archci_state::{ChangeStore, CursorStore, RevisionCursor};

const REPO: &str = "https://git.example.org/aurora/packages.git";

struct Harness {
    vcs: Arc<MemoryVcs>,
    changes: Arc<MemoryChangeStore>,
    notifier: Arc<RecordingNotifier>,
    cursors: Arc<MemoryCursorStore>,
}

impl Harness {
    fn new(cursor: &[(&str, &str)]) -> Self {
        let seeded: RevisionCursor = cursor
            .iter()
            .map(|(b, r)| (b.to_string(), r.to_string()))
            .collect();
        Self {
            vcs: Arc::new(MemoryVcs::new()),
            changes: Arc::new(MemoryChangeStore::new()),
            notifier: Arc::new(RecordingNotifier::new()),
            cursors: Arc::new(MemoryCursorStore::new().with_cursor(REPO, seeded)),
        }
    }

    async fn extractor(&self, config: ExtractorConfig) -> ChangeExtractor {
        ChangeExtractor::load(
            config,
            self.vcs.clone(),
            self.changes.clone(),
            self.notifier.clone(),
            self.cursors.clone(),
        )
        .await
        .unwrap()
    }
}

fn config() -> ExtractorConfig {
    ExtractorConfig {
        project: "aurora".to_string(),
        category: "aurora".to_string(),
        ..ExtractorConfig::new(REPO)
    }
}

fn heads(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(b, r)| (b.to_string(), r.to_string()))
        .collect()
}

#[tokio::test]
async fn new_commits_are_emitted_oldest_first() {
    let h = Harness::new(&[("main", "A")]);
    h.vcs.add_chain(None, &["A", "B", "C", "D"]);
    for rev in ["B", "C", "D"] {
        h.vcs.set_tag(rev, "v1.0");
    }
    let mut extractor = h.extractor(config()).await;

    let emitted = extractor.process_changes("D", "main").await.unwrap();

    let revs: Vec<&str> = emitted.iter().map(|c| c.revision.as_str()).collect();
    assert_eq!(revs, vec!["B", "C", "D"]);
    assert_eq!(h.changes.revisions(), vec!["B", "C", "D"]);
    assert_eq!(extractor.cursor().get("main"), Some("D"));
    assert_eq!(h.cursors.load(REPO).await.unwrap().get("main"), Some("D"));

    let record = &emitted[0];
    assert_eq!(record.repository, REPO);
    assert_eq!(record.category, "aurora");
    assert_eq!(record.files, vec!["PKGBUILD"]);
    assert!(record.committer.is_none());
}

#[tokio::test]
async fn exclusion_spans_every_tracked_branch() {
    let h = Harness::new(&[("main", "C"), ("testing", "A")]);
    h.vcs.add_chain(None, &["A", "B", "C"]);
    h.vcs.add_commit("T1", &["C"]);
    h.vcs.set_tag("T1", "v2");
    let mut extractor = h.extractor(config()).await;

    let emitted = extractor.process_changes("T1", "testing").await.unwrap();

    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].revision, "T1");
    let (new_rev, exclude) = h.vcs.rev_list_calls().pop().unwrap();
    assert_eq!(new_rev, "T1");
    assert_eq!(exclude, vec!["A", "C"]);
}

#[tokio::test]
async fn same_revision_pushed_again_emits_nothing() {
    let h = Harness::new(&[("main", "A")]);
    h.vcs.add_commit("A", &[]);
    let mut extractor = h.extractor(ExtractorConfig {
        build_pushes_with_no_commits: true,
        ..config()
    })
    .await;

    let emitted = extractor.process_changes("A", "main").await.unwrap();

    assert!(emitted.is_empty());
    assert!(h.changes.list_changes().await.unwrap().is_empty());
    assert_eq!(extractor.cursor().get("main"), Some("A"));
}

#[tokio::test]
async fn push_without_new_commits_rebuilds_moved_branch() {
    let h = Harness::new(&[("main", "B")]);
    h.vcs.add_chain(None, &["A", "B"]);
    h.vcs.set_tag("A", "v0.9");
    let mut extractor = h.extractor(ExtractorConfig {
        build_pushes_with_no_commits: true,
        ..config()
    })
    .await;

    let emitted = extractor.process_changes("A", "release").await.unwrap();

    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].revision, "A");
    assert_eq!(emitted[0].branch, "release");
    assert_eq!(extractor.cursor().get("release"), Some("A"));
}

#[tokio::test]
async fn push_without_new_commits_is_ignored_when_policy_is_off() {
    let h = Harness::new(&[("main", "B")]);
    h.vcs.add_chain(None, &["A", "B"]);
    let mut extractor = h.extractor(config()).await;

    let emitted = extractor.process_changes("A", "release").await.unwrap();

    assert!(emitted.is_empty());
    assert_eq!(extractor.cursor().get("release"), Some("A"));
}

#[tokio::test]
async fn first_poll_primes_cursor_without_emitting() {
    let h = Harness::new(&[]);
    h.vcs.add_chain(None, &["A", "B"]);
    h.vcs.add_commit("X", &["A"]);
    let mut extractor = h.extractor(config()).await;

    let emitted = extractor
        .poll(&heads(&[("refs/heads/main", "B"), ("testing", "X")]))
        .await
        .unwrap();

    assert!(emitted.is_empty());
    assert!(h.vcs.rev_list_calls().is_empty());
    assert!(h.notifier.notices().is_empty());
    let cursor = h.cursors.load(REPO).await.unwrap();
    assert_eq!(cursor.get("main"), Some("B"));
    assert_eq!(cursor.get("testing"), Some("X"));
}

#[tokio::test]
async fn poll_after_priming_reports_new_work() {
    let h = Harness::new(&[]);
    h.vcs.add_chain(None, &["A", "B", "C"]);
    h.vcs.set_tag("C", "v3");
    let mut extractor = h.extractor(config()).await;

    extractor.poll(&heads(&[("main", "B")])).await.unwrap();
    let emitted = extractor.poll(&heads(&[("main", "C")])).await.unwrap();

    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].revision, "C");
    assert_eq!(h.cursors.save_count(), 2);
}

#[tokio::test]
async fn failed_metadata_query_halts_the_batch() {
    let h = Harness::new(&[("main", "A")]);
    h.vcs.add_chain(None, &["A", "B", "C", "D"]);
    for rev in ["B", "C", "D"] {
        h.vcs.set_tag(rev, "v1");
    }
    h.vcs.fail_on("C", MetadataField::Files);
    let mut extractor = h.extractor(config()).await;

    let err = extractor.process_changes("D", "main").await.unwrap_err();

    assert!(matches!(
        err,
        ArchCiError::CommitMetadataFetchFailed { ref revision, .. } if revision == "C"
    ));
    assert_eq!(h.changes.revisions(), vec!["B"]);
    assert!(h.notifier.notices().is_empty());
    assert_eq!(h.cursors.load(REPO).await.unwrap().get("main"), Some("D"));
}

#[tokio::test]
async fn first_failure_wins_when_several_queries_fail() {
    let h = Harness::new(&[("main", "A")]);
    h.vcs.add_chain(None, &["A", "B"]);
    h.vcs.set_tag("B", "v1");
    h.vcs.fail_on("B", MetadataField::Comments);
    h.vcs.fail_on("B", MetadataField::Author);
    let mut extractor = h.extractor(config()).await;

    let err = extractor.process_changes("B", "main").await.unwrap_err();

    let ArchCiError::CommitMetadataFetchFailed { source, .. } = err else {
        panic!("expected CommitMetadataFetchFailed, got {err:?}");
    };
    assert!(source.to_string().contains("Author"));
}

#[tokio::test]
async fn missing_tag_is_fatal_for_the_revision() {
    let h = Harness::new(&[("main", "A")]);
    h.vcs.add_chain(None, &["A", "B"]);
    let mut extractor = h.extractor(config()).await;

    let err = extractor.process_changes("B", "main").await.unwrap_err();

    assert!(matches!(err, ArchCiError::TagNotFound { ref revision } if revision == "B"));
    assert!(h.changes.revisions().is_empty());
}

#[tokio::test]
async fn release_notice_is_sent_once_for_the_newest_commit() {
    let h = Harness::new(&[("main", "A")]);
    h.vcs.add_chain(None, &["A", "B", "C"]);
    h.vcs.set_tag("B", "v1.0-1-gb");
    h.vcs.set_tag("C", "v1.1");
    let mut extractor = h.extractor(config()).await;

    extractor.process_changes("C", "main").await.unwrap();

    assert_eq!(
        h.notifier.notices(),
        vec![ReleaseNotice::new("aurora", "v1.1")]
    );
}

#[tokio::test]
async fn notices_can_be_disabled() {
    let h = Harness::new(&[("main", "A")]);
    h.vcs.add_chain(None, &["A", "B"]);
    h.vcs.set_tag("B", "v1");
    let mut extractor = h.extractor(ExtractorConfig {
        notify_on_release: false,
        ..config()
    })
    .await;

    extractor.process_changes("B", "main").await.unwrap();

    assert!(h.notifier.notices().is_empty());
    assert_eq!(h.changes.revisions(), vec!["B"]);
}

#[tokio::test]
async fn committer_is_fetched_on_request() {
    let h = Harness::new(&[("main", "A")]);
    h.vcs.add_chain(None, &["A", "B"]);
    h.vcs.set_tag("B", "v1");
    let mut extractor = h.extractor(ExtractorConfig {
        fetch_committer: true,
        ..config()
    })
    .await;

    let emitted = extractor.process_changes("B", "main").await.unwrap();

    assert_eq!(
        emitted[0].committer.as_deref(),
        Some("CI Bot <ci@example.org>")
    );
}
