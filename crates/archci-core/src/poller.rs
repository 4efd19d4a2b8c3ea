//! Incremental change detection against a multi-branch revision cursor.
//!
//! [`ChangeExtractor`] owns the cursor for one repository. Each poll turns
//! new branch heads into [`ChangeRecord`]s, oldest first, and announces the
//! newest tag of a batch through a [`Notifier`].
//!
//! Delivery is at-most-once: the cursor is advanced and persisted before
//! any commit of the batch is processed, so a failure mid-batch is not
//! retried on the next poll.

use std::sync::Arc;

use archci_state::{ChangeRecord, ChangeStore, CursorStore, RevisionCursor};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::{ArchCiError, Result};
use crate::notify::{Notifier, ReleaseNotice};
use crate::obs;
use crate::vcs::VcsBackend;

/// Value of `src` on every emitted change.
pub const CHANGE_SOURCE: &str = "git";

/// Strip a `refs/heads/` prefix from a branch name.
pub fn short_branch(name: &str) -> &str {
    name.strip_prefix("refs/heads/").unwrap_or(name)
}

/// What the extractor stamps on each change and how it treats empty pushes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractorConfig {
    /// Repository URL; also the key the cursor is stored under.
    pub repo_url: String,
    pub project: String,
    pub category: String,
    /// Emit the pushed revision itself when a push brings no new commits
    /// but moves the branch.
    pub build_pushes_with_no_commits: bool,
    pub fetch_committer: bool,
    pub notify_on_release: bool,
}

impl ExtractorConfig {
    pub fn new(repo_url: impl Into<String>) -> Self {
        Self {
            repo_url: repo_url.into(),
            project: String::new(),
            category: String::new(),
            build_pushes_with_no_commits: false,
            fetch_committer: false,
            notify_on_release: true,
        }
    }
}

/// Turns branch head updates into change records.
pub struct ChangeExtractor {
    config: ExtractorConfig,
    vcs: Arc<dyn VcsBackend>,
    changes: Arc<dyn ChangeStore>,
    notifier: Arc<dyn Notifier>,
    cursor_store: Arc<dyn CursorStore>,
    cursor: RevisionCursor,
}

impl ChangeExtractor {
    /// Build an extractor, restoring the persisted cursor for
    /// `config.repo_url`.
    pub async fn load(
        config: ExtractorConfig,
        vcs: Arc<dyn VcsBackend>,
        changes: Arc<dyn ChangeStore>,
        notifier: Arc<dyn Notifier>,
        cursor_store: Arc<dyn CursorStore>,
    ) -> Result<Self> {
        let cursor = cursor_store.load(&config.repo_url).await?;
        debug!(repository = %config.repo_url, branches = cursor.len(), "cursor restored");
        Ok(Self {
            config,
            vcs,
            changes,
            notifier,
            cursor_store,
            cursor,
        })
    }

    pub fn cursor(&self) -> &RevisionCursor {
        &self.cursor
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// Process one poll worth of `(branch, head)` pairs.
    ///
    /// With an empty cursor every head is recorded and nothing is emitted.
    pub async fn poll(&mut self, heads: &[(String, String)]) -> Result<Vec<ChangeRecord>> {
        if self.cursor.is_empty() {
            self.prime(heads.iter().map(|(b, r)| (b.as_str(), r.as_str())))
                .await?;
            return Ok(Vec::new());
        }

        let mut emitted = Vec::new();
        for (branch, rev) in heads {
            emitted.extend(self.process_changes(rev, branch).await?);
        }
        Ok(emitted)
    }

    /// Emit the commits that `new_rev` adds to `branch`.
    ///
    /// Commits already reachable from any tracked head, on any branch, are
    /// excluded. An empty cursor only records the head.
    pub async fn process_changes(&mut self, new_rev: &str, branch: &str) -> Result<Vec<ChangeRecord>> {
        if self.cursor.is_empty() {
            self.prime([(branch, new_rev)]).await?;
            return Ok(Vec::new());
        }

        let branch = short_branch(branch);
        let exclude = self.cursor.revisions();
        let mut revs = self.vcs.rev_list(new_rev, &exclude).await?;
        revs.reverse();

        if revs.is_empty()
            && self.config.build_pushes_with_no_commits
            && self.cursor.get(branch) != Some(new_rev)
        {
            debug!(branch = %branch, revision = %new_rev, "push without new commits");
            revs.push(new_rev.to_string());
        }

        self.cursor.advance(branch, new_rev);
        self.save_cursor().await?;

        if revs.is_empty() {
            return Ok(Vec::new());
        }
        obs::emit_changes_detected(&self.config.repo_url, branch, revs.len());

        let last = revs.len() - 1;
        let mut emitted = Vec::with_capacity(revs.len());
        for (idx, rev) in revs.iter().enumerate() {
            let record = self.fetch_change(rev, branch).await?;
            self.changes.add_change(&record).await?;
            obs::emit_change_added(rev, branch);

            if idx == last && self.config.notify_on_release {
                if let Some(tag) = &record.tag {
                    self.notifier
                        .send(&ReleaseNotice::new(&self.config.category, tag))
                        .await?;
                    obs::emit_release_notified(&self.config.category, tag);
                }
            }
            emitted.push(record);
        }
        Ok(emitted)
    }

    /// Record heads without walking their history.
    async fn prime<'a>(&mut self, heads: impl IntoIterator<Item = (&'a str, &'a str)>) -> Result<()> {
        let mut primed = 0;
        for (branch, rev) in heads {
            self.cursor.advance(short_branch(branch), rev);
            primed += 1;
        }
        self.save_cursor().await?;
        obs::emit_poll_primed(&self.config.repo_url, primed);
        Ok(())
    }

    async fn save_cursor(&self) -> Result<()> {
        self.cursor_store
            .save(&self.config.repo_url, &self.cursor)
            .await?;
        Ok(())
    }

    /// Query every metadata field of `rev` at once.
    ///
    /// All failures are logged; the first one is returned.
    async fn fetch_change(&self, rev: &str, branch: &str) -> Result<ChangeRecord> {
        let vcs = self.vcs.as_ref();
        let committer = async {
            if self.config.fetch_committer {
                vcs.commit_committer(rev).await.map(Some)
            } else {
                Ok(None)
            }
        };

        let (when, author, committer, files, comments, tag) = tokio::join!(
            vcs.commit_timestamp(rev),
            vcs.commit_author(rev),
            committer,
            vcs.commit_files(rev),
            vcs.commit_comments(rev),
            vcs.commit_tag(rev),
        );

        let mut failures = Vec::new();
        let when = when.map_err(|e| failures.push(e)).ok();
        let author = author.map_err(|e| failures.push(e)).ok();
        let committer = committer.map_err(|e| failures.push(e)).ok();
        let files = files.map_err(|e| failures.push(e)).ok();
        let comments = comments.map_err(|e| failures.push(e)).ok();
        let tag = tag.map_err(|e| failures.push(e)).ok();

        let (Some(when), Some(author), Some(committer), Some(files), Some(comments), Some(tag)) =
            (when, author, committer, files, comments, tag)
        else {
            for failure in &failures {
                error!(revision = %rev, error = %failure, "commit metadata query failed");
            }
            let first = failures
                .into_iter()
                .next()
                .unwrap_or_else(|| ArchCiError::Vcs(format!("metadata missing for {rev}")));
            return Err(match first {
                tag_err @ ArchCiError::TagNotFound { .. } => tag_err,
                other => ArchCiError::CommitMetadataFetchFailed {
                    revision: rev.to_string(),
                    source: Box::new(other),
                },
            });
        };

        Ok(ChangeRecord {
            revision: rev.to_string(),
            author,
            committer,
            when,
            files,
            comments,
            tag: Some(tag),
            branch: branch.to_string(),
            project: self.config.project.clone(),
            repository: self.config.repo_url.clone(),
            category: self.config.category.clone(),
            src: CHANGE_SOURCE.to_string(),
        })
    }
}
