//! Release notifications sent after a tagged change is recorded.

use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::info;

use crate::error::{ArchCiError, Result};

/// A release announcement for one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseNotice {
    pub subject: String,
    pub body: String,
}

impl ReleaseNotice {
    pub fn new(category: &str, tag: &str) -> Self {
        Self {
            subject: format!("[{category}] New release"),
            body: format!("{category} has got a new release: {tag}"),
        }
    }
}

/// Delivery channel for [`ReleaseNotice`]s.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notice: &ReleaseNotice) -> Result<()>;
}

/// Writes notices to the log only.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notice: &ReleaseNotice) -> Result<()> {
        info!(subject = %notice.subject, body = %notice.body, "release notice");
        Ok(())
    }
}

/// Pipes an RFC 822 message into a sendmail-compatible program.
#[derive(Debug, Clone)]
pub struct SendmailNotifier {
    program: String,
    sender: String,
    recipients: Vec<String>,
}

impl SendmailNotifier {
    pub fn new(program: impl Into<String>, sender: impl Into<String>, recipients: Vec<String>) -> Self {
        Self {
            program: program.into(),
            sender: sender.into(),
            recipients,
        }
    }

    fn message(&self, notice: &ReleaseNotice) -> String {
        format!(
            "From: {}\nTo: {}\nSubject: {}\n\n{}\n",
            header_value(&self.sender),
            header_value(&self.recipients.join(", ")),
            header_value(&notice.subject),
            notice.body
        )
    }
}

/// Header values stay on one line.
fn header_value(value: &str) -> String {
    value
        .split(['\r', '\n'])
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl Notifier for SendmailNotifier {
    async fn send(&self, notice: &ReleaseNotice) -> Result<()> {
        if self.recipients.is_empty() {
            return Err(ArchCiError::Notification("no recipients configured".to_string()));
        }

        let mut child = Command::new(&self.program)
            .arg("-f")
            .arg(&self.sender)
            .args(&self.recipients)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ArchCiError::Notification(format!("failed to run {}: {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            let written = async {
                stdin.write_all(self.message(notice).as_bytes()).await?;
                stdin.shutdown().await
            };
            written.await.map_err(|e| {
                ArchCiError::Notification(format!("failed to write to {}: {e}", self.program))
            })?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(ArchCiError::Notification(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        info!(subject = %notice.subject, recipients = self.recipients.len(), "release notice sent");
        Ok(())
    }
}
