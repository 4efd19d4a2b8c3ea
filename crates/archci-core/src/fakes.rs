//! In-memory fakes for the VCS and notifier seams (testing only)
//!
//! `MemoryVcs` models a commit graph with per-field failure injection;
//! `RecordingNotifier` captures every notice it is asked to send.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::error::{ArchCiError, Result};
use crate::notify::{Notifier, ReleaseNotice};
use crate::vcs::VcsBackend;

// ---------------------------------------------------------------------------
// MemoryVcs
// ---------------------------------------------------------------------------

/// Commit metadata fields that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataField {
    Timestamp,
    Author,
    Committer,
    Files,
    Comments,
    Tag,
}

#[derive(Debug, Clone)]
struct FakeCommit {
    parents: Vec<String>,
    when: DateTime<Utc>,
    author: String,
    committer: String,
    files: Vec<String>,
    comments: String,
    tag: Option<String>,
}

#[derive(Debug, Default)]
struct Graph {
    commits: HashMap<String, FakeCommit>,
    failures: HashSet<(String, MetadataField)>,
    rev_list_calls: Vec<(String, Vec<String>)>,
}

/// Commit graph held in memory.
#[derive(Debug, Default)]
pub struct MemoryVcs {
    graph: Mutex<Graph>,
}

impl MemoryVcs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a commit with default metadata on top of `parents`.
    pub fn add_commit(&self, rev: &str, parents: &[&str]) {
        let mut graph = self.graph.lock().unwrap();
        let seq = graph.commits.len() as i64;
        graph.commits.insert(
            rev.to_string(),
            FakeCommit {
                parents: parents.iter().map(|p| p.to_string()).collect(),
                when: Utc.timestamp_opt(1_700_000_000 + seq * 60, 0).unwrap(),
                author: "Jane Packager <jane@example.org>".to_string(),
                committer: "CI Bot <ci@example.org>".to_string(),
                files: vec!["PKGBUILD".to_string()],
                comments: format!("commit {rev}"),
                tag: None,
            },
        );
    }

    /// Add a straight line of commits, each on top of the previous one.
    pub fn add_chain(&self, parent: Option<&str>, revs: &[&str]) {
        let mut prev = parent.map(str::to_string);
        for rev in revs {
            match &prev {
                Some(p) => self.add_commit(rev, &[p.as_str()]),
                None => self.add_commit(rev, &[]),
            }
            prev = Some(rev.to_string());
        }
    }

    pub fn set_tag(&self, rev: &str, tag: &str) {
        if let Some(commit) = self.graph.lock().unwrap().commits.get_mut(rev) {
            commit.tag = Some(tag.to_string());
        }
    }

    pub fn set_files(&self, rev: &str, files: &[&str]) {
        if let Some(commit) = self.graph.lock().unwrap().commits.get_mut(rev) {
            commit.files = files.iter().map(|f| f.to_string()).collect();
        }
    }

    /// Make a metadata query for `rev` fail.
    pub fn fail_on(&self, rev: &str, field: MetadataField) {
        self.graph
            .lock()
            .unwrap()
            .failures
            .insert((rev.to_string(), field));
    }

    /// Every `rev_list` call observed, as `(new_rev, exclude)`.
    pub fn rev_list_calls(&self) -> Vec<(String, Vec<String>)> {
        self.graph.lock().unwrap().rev_list_calls.clone()
    }

    fn lookup<T>(&self, rev: &str, field: MetadataField, get: impl FnOnce(&FakeCommit) -> T) -> Result<T> {
        let graph = self.graph.lock().unwrap();
        if graph.failures.contains(&(rev.to_string(), field)) {
            return Err(ArchCiError::Vcs(format!("injected {field:?} failure for {rev}")));
        }
        graph
            .commits
            .get(rev)
            .map(get)
            .ok_or_else(|| ArchCiError::Vcs(format!("unknown revision {rev}")))
    }
}

fn ancestors(commits: &HashMap<String, FakeCommit>, start: &str) -> Vec<String> {
    let mut order = Vec::new();
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([start.to_string()]);
    while let Some(rev) = queue.pop_front() {
        if !seen.insert(rev.clone()) {
            continue;
        }
        if let Some(commit) = commits.get(&rev) {
            queue.extend(commit.parents.iter().cloned());
            order.push(rev);
        }
    }
    order
}

#[async_trait]
impl VcsBackend for MemoryVcs {
    async fn rev_list(&self, new_rev: &str, exclude: &[String]) -> Result<Vec<String>> {
        let mut graph = self.graph.lock().unwrap();
        graph
            .rev_list_calls
            .push((new_rev.to_string(), exclude.to_vec()));
        if !graph.commits.contains_key(new_rev) {
            return Err(ArchCiError::Vcs(format!("unknown revision {new_rev}")));
        }
        let hidden: HashSet<String> = exclude
            .iter()
            .flat_map(|rev| ancestors(&graph.commits, rev))
            .collect();
        Ok(ancestors(&graph.commits, new_rev)
            .into_iter()
            .filter(|rev| !hidden.contains(rev))
            .collect())
    }

    async fn commit_timestamp(&self, rev: &str) -> Result<DateTime<Utc>> {
        self.lookup(rev, MetadataField::Timestamp, |c| c.when)
    }

    async fn commit_author(&self, rev: &str) -> Result<String> {
        self.lookup(rev, MetadataField::Author, |c| c.author.clone())
    }

    async fn commit_committer(&self, rev: &str) -> Result<String> {
        self.lookup(rev, MetadataField::Committer, |c| c.committer.clone())
    }

    async fn commit_files(&self, rev: &str) -> Result<Vec<String>> {
        self.lookup(rev, MetadataField::Files, |c| c.files.clone())
    }

    async fn commit_comments(&self, rev: &str) -> Result<String> {
        self.lookup(rev, MetadataField::Comments, |c| c.comments.clone())
    }

    async fn commit_tag(&self, rev: &str) -> Result<String> {
        self.lookup(rev, MetadataField::Tag, |c| c.tag.clone())?
            .ok_or_else(|| ArchCiError::TagNotFound {
                revision: rev.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// RecordingNotifier
// ---------------------------------------------------------------------------

/// Notifier that keeps every notice in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<ReleaseNotice>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notices(&self) -> Vec<ReleaseNotice> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notice: &ReleaseNotice) -> Result<()> {
        self.sent.lock().unwrap().push(notice.clone());
        Ok(())
    }
}
