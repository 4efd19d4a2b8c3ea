//! Version control queries used by the change poller.
//!
//! [`VcsBackend`] is the seam between change extraction and the actual VCS;
//! [`GitCli`] implements it by shelling out to `git` in a local clone.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::process::Command;
use tracing::debug;

use crate::error::{ArchCiError, Result};

/// Per-repository revision queries.
#[async_trait]
pub trait VcsBackend: Send + Sync {
    /// Revisions reachable from `new_rev` but from none of `exclude`,
    /// newest first.
    async fn rev_list(&self, new_rev: &str, exclude: &[String]) -> Result<Vec<String>>;

    async fn commit_timestamp(&self, rev: &str) -> Result<DateTime<Utc>>;

    /// `Name <email>` of the author.
    async fn commit_author(&self, rev: &str) -> Result<String>;

    /// `Name <email>` of the committer.
    async fn commit_committer(&self, rev: &str) -> Result<String>;

    async fn commit_files(&self, rev: &str) -> Result<Vec<String>>;

    async fn commit_comments(&self, rev: &str) -> Result<String>;

    /// Nearest tag as reported by `describe`. Never defaults: a revision
    /// without any reachable tag yields [`ArchCiError::TagNotFound`].
    async fn commit_tag(&self, rev: &str) -> Result<String>;
}

/// `git` command-line backend operating on a local clone.
#[derive(Debug, Clone)]
pub struct GitCli {
    repo_dir: PathBuf,
    git_bin: String,
}

impl GitCli {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            git_bin: "git".to_string(),
        }
    }

    /// Use a different git executable.
    pub fn with_binary(mut self, git_bin: &str) -> Self {
        self.git_bin = git_bin.to_string();
        self
    }

    pub fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        debug!(args = ?args, "git");
        let output = Command::new(&self.git_bin)
            .args(args)
            .current_dir(&self.repo_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ArchCiError::Vcs(format!("failed to run git: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ArchCiError::Vcs(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn log_format(&self, rev: &str, format: &str) -> Result<String> {
        let format = format!("--format={format}");
        let out = self.run(&["log", "--no-walk", &format, rev, "--"]).await?;
        Ok(out.trim().to_string())
    }

    /// Update remote-tracking refs.
    pub async fn fetch(&self, remote: &str) -> Result<()> {
        self.run(&["fetch", "--tags", "--prune", remote]).await?;
        Ok(())
    }

    /// Resolve any ref to a full commit hash.
    pub async fn resolve_ref(&self, reference: &str) -> Result<String> {
        let target = format!("{reference}^{{commit}}");
        let sha = self.run(&["rev-parse", "--verify", &target]).await?;
        let sha = sha.trim().to_string();
        if sha.is_empty() {
            return Err(ArchCiError::Vcs(format!("{reference} resolved to nothing")));
        }
        Ok(sha)
    }
}

#[async_trait]
impl VcsBackend for GitCli {
    async fn rev_list(&self, new_rev: &str, exclude: &[String]) -> Result<Vec<String>> {
        let excluded: Vec<String> = exclude.iter().map(|rev| format!("^{rev}")).collect();
        let mut args = vec!["log", "--format=%H", new_rev];
        args.extend(excluded.iter().map(String::as_str));
        args.push("--");
        let out = self.run(&args).await?;
        Ok(out.split_whitespace().map(str::to_string).collect())
    }

    async fn commit_timestamp(&self, rev: &str) -> Result<DateTime<Utc>> {
        let raw = self.log_format(rev, "%ct").await?;
        let secs: i64 = raw
            .parse()
            .map_err(|_| ArchCiError::Vcs(format!("bad commit timestamp for {rev}: {raw:?}")))?;
        Utc.timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| ArchCiError::Vcs(format!("timestamp out of range for {rev}: {secs}")))
    }

    async fn commit_author(&self, rev: &str) -> Result<String> {
        let author = self.log_format(rev, "%aN <%aE>").await?;
        if author.is_empty() {
            return Err(ArchCiError::Vcs(format!("could not get commit author for rev {rev}")));
        }
        Ok(author)
    }

    async fn commit_committer(&self, rev: &str) -> Result<String> {
        let committer = self.log_format(rev, "%cN <%cE>").await?;
        if committer.is_empty() {
            return Err(ArchCiError::Vcs(format!(
                "could not get commit committer for rev {rev}"
            )));
        }
        Ok(committer)
    }

    async fn commit_files(&self, rev: &str) -> Result<Vec<String>> {
        let out = self
            .run(&["log", "--name-only", "--no-walk", "--format=%n", rev, "--"])
            .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn commit_comments(&self, rev: &str) -> Result<String> {
        self.log_format(rev, "%B").await
    }

    async fn commit_tag(&self, rev: &str) -> Result<String> {
        let tag = match self.run(&["describe", "--tags", rev]).await {
            Ok(out) => out.trim().to_string(),
            Err(e) => {
                debug!(rev = %rev, error = %e, "describe failed");
                String::new()
            }
        };
        if tag.is_empty() {
            return Err(ArchCiError::TagNotFound {
                revision: rev.to_string(),
            });
        }
        Ok(tag)
    }
}
