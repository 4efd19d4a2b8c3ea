//! TOML configuration for the ArchCI binaries.
//!
//! Every section has serde defaults so a minimal file only needs
//! `[repository] name = "..."`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::artifact::PackageExt;
use crate::error::{ArchCiError, Result};
use crate::srcinfo::SrcinfoGenerator;

/// Environment variable holding the config file path.
pub const CONFIG_ENV: &str = "ARCHCI_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub repository: RepositoryConfig,
    pub signing: SigningConfig,
    pub mirror: MirrorConfig,
    pub build: BuildConfig,
    pub poller: PollerConfig,
    pub notify: NotifyConfig,
    pub identity: IdentityConfig,
}

/// Where packages come from and where they are published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Root of the published repositories.
    pub root: PathBuf,
    pub name: String,
    /// Published tree is `<root>/<name>-<suffix>/<arch>`.
    pub suffix: String,
    pub package_ext: PackageExt,
    /// Checkout holding `<group>/<pkg_base>` descriptor directories.
    pub descriptor_root: PathBuf,
    /// Parent of per-build scratch directories.
    pub workspace_root: PathBuf,
    pub worker_host: String,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/srv/repo"),
            name: String::new(),
            suffix: "stable".to_string(),
            package_ext: PackageExt::default(),
            descriptor_root: PathBuf::from("/srv/pkgbuilds"),
            workspace_root: PathBuf::from("/var/lib/archci/work"),
            worker_host: "localhost".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    pub gpg_sign: bool,
}

/// Remote mirror reached over sshfs. Disabled while `remote_host` is unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    pub remote_host: Option<String>,
    pub remote_path: String,
    pub mount_root: PathBuf,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            remote_host: None,
            remote_path: "/srv/http/repo".to_string(),
            mount_root: PathBuf::from("/mnt/archci-mirror"),
        }
    }
}

impl MirrorConfig {
    pub fn enabled(&self) -> bool {
        self.remote_host.as_deref().is_some_and(|h| !h.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Concurrent privileged builds allowed per lock.
    pub lock_slots: usize,
    pub lock_name: String,
    /// Build dependencies per `pkg_base`, resolved from the published tree.
    pub depends: BTreeMap<String, Vec<String>>,
    /// Command that prints a `.SRCINFO` on stdout.
    pub srcinfo_command: Vec<String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            lock_slots: 1,
            lock_name: "archbuild".to_string(),
            depends: BTreeMap::new(),
            srcinfo_command: vec!["makepkg".to_string(), "--printsrcinfo".to_string()],
        }
    }
}

impl BuildConfig {
    pub fn depends_for(&self, pkg_base: &str) -> Vec<String> {
        self.depends.get(pkg_base).cloned().unwrap_or_default()
    }

    pub fn srcinfo_generator(&self) -> SrcinfoGenerator {
        match self.srcinfo_command.split_first() {
            Some((program, args)) => SrcinfoGenerator {
                program: program.clone(),
                args: args.to_vec(),
            },
            None => SrcinfoGenerator::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub repo_dir: PathBuf,
    pub repo_url: String,
    pub remote: String,
    pub branches: Vec<String>,
    pub project: String,
    pub category: String,
    pub build_pushes_with_no_commits: bool,
    pub fetch_committer: bool,
    pub interval_secs: u64,
    pub state_file: PathBuf,
    pub changes_file: PathBuf,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            repo_dir: PathBuf::from("/var/lib/archci/poller"),
            repo_url: String::new(),
            remote: "origin".to_string(),
            branches: vec!["master".to_string()],
            project: String::new(),
            category: String::new(),
            build_pushes_with_no_commits: false,
            fetch_committer: false,
            interval_secs: 600,
            state_file: PathBuf::from("/var/lib/archci/cursor.json"),
            changes_file: PathBuf::from("/var/lib/archci/changes.jsonl"),
        }
    }
}

/// Release mail. Notices are only logged while `recipients` is empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub enabled: bool,
    pub program: String,
    pub sender: String,
    pub recipients: Vec<String>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            program: "sendmail".to_string(),
            sender: "archci@localhost".to_string(),
            recipients: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// URL of the provider's OpenID discovery document.
    pub configuration_uri: Option<String>,
}

impl Config {
    /// Read and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ArchCiError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Config = text.parse()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.repository.name.trim().is_empty() {
            return Err(ArchCiError::Config("repository.name must not be empty".to_string()));
        }
        if self.build.lock_slots == 0 {
            return Err(ArchCiError::Config("build.lock_slots must be at least 1".to_string()));
        }
        if self.build.srcinfo_command.is_empty() {
            return Err(ArchCiError::Config("build.srcinfo_command must not be empty".to_string()));
        }
        Ok(())
    }
}

impl std::str::FromStr for Config {
    type Err = ArchCiError;

    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| ArchCiError::Config(e.to_string()))
    }
}
