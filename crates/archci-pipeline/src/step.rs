//! Build step definitions.
//!
//! A [`Step`] is a named [`StepKind`] plus a run predicate and a failure
//! policy. External steps render a [`CommandLine`] from the property bag;
//! internal steps (property updates, file copies, PKGBUILD edits) are
//! carried out in-process by the runner.

use std::fmt;
use std::sync::OnceLock;

use archci_core::{ArchCiError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::properties::{dependency_key, keys, BuildProperties};

/// Program and arguments of an external step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Program followed by its arguments.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.argv().join(" "))
    }
}

/// Predicate deciding whether a step runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    Always,
    PropertyTrue { key: String },
    PropertySet { key: String },
    PropertyEquals { key: String, value: String },
    Any(Vec<Condition>),
    All(Vec<Condition>),
}

impl Condition {
    pub fn property_true(key: &str) -> Self {
        Condition::PropertyTrue { key: key.to_string() }
    }

    pub fn property_set(key: &str) -> Self {
        Condition::PropertySet { key: key.to_string() }
    }

    pub fn property_equals(key: &str, value: &str) -> Self {
        Condition::PropertyEquals {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    pub fn evaluate(&self, props: &BuildProperties) -> bool {
        match self {
            Condition::Always => true,
            Condition::PropertyTrue { key } => props.get_bool(key),
            Condition::PropertySet { key } => props.is_set(key),
            Condition::PropertyEquals { key, value } => props.get_str(key) == Some(value.as_str()),
            Condition::Any(conds) => conds.iter().any(|c| c.evaluate(props)),
            Condition::All(conds) => conds.iter().all(|c| c.evaluate(props)),
        }
    }
}

/// What a step does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    /// Merge a fixed set of properties into the bag.
    SetProperties { properties: BuildProperties },
    SetProperty { key: String, value: Value },
    /// Resolve the artifact of `depends_name` and set `<name>_pkg`.
    FindDependency,
    /// Copy `<descriptor_dir>/<source>` to `<workspace>/<dest>`.
    FetchFile { source: String, dest: String },
    /// Increment `pkgrel` in the workspace PKGBUILD.
    BumpRelease,
    /// Point the pinned VCS source at `tag` or `revision`.
    PinVcsRevision,
    /// Apply `pkg_ver_override` / `pkg_rel_override` to the PKGBUILD.
    SetVersion,
    /// `updpkgsums`
    UpdateChecksums,
    /// devtools clean-chroot build.
    ArchBuild,
    /// `makepkg --printsrcinfo`, stdout written to `.SRCINFO`.
    GenerateSrcinfo,
    /// Copy the workspace PKGBUILD and .SRCINFO back to the descriptor
    /// directory.
    PublishDescriptor,
    /// Re-read the workspace .SRCINFO into the bag.
    RefreshProperties,
    /// Copy a built package into the publish directory.
    UploadPackage { pkg_name: String },
    /// Detached signature next to the published package.
    SignPackage { pkg_name: String },
    /// Register a published package in the repository database.
    RepoAdd { pkg_name: String },
    MountMirror,
    SyncMirror,
    UnmountMirror,
    /// Remove the workspace.
    Cleanup,
    /// User-defined command. `{key}` placeholders are replaced by string
    /// properties.
    Shell { argv: Vec<String> },
}

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid placeholder regex"))
}

/// Substitute `{key}` placeholders. Unknown keys are an error.
pub fn interpolate(template: &str, props: &BuildProperties) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in placeholder().captures_iter(template) {
        let whole = caps.get(0).map(|m| m.range()).unwrap_or_default();
        out.push_str(&template[last..whole.start]);
        out.push_str(props.require_str(&caps[1])?);
        last = whole.end;
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// devtools build script, e.g. `extra-testing-x86_64-build`. Multilib
/// scripts carry no architecture.
pub fn build_script_name(repo_name: &str, channel: Option<&str>, arch: &str) -> String {
    let mut name = repo_name.to_string();
    if let Some(channel) = channel {
        name.push('-');
        name.push_str(channel);
    }
    if !repo_name.contains("multilib") {
        name.push('-');
        name.push_str(archci_core::artifact::repo_arch(arch));
    }
    name.push_str("-build");
    name
}

impl StepKind {
    /// The external command for this step, or `None` for in-process steps.
    pub fn command(&self, props: &BuildProperties) -> Result<Option<CommandLine>> {
        let cmd = match self {
            StepKind::UpdateChecksums => CommandLine::new("updpkgsums", Vec::<String>::new()),
            StepKind::GenerateSrcinfo => CommandLine::new("makepkg", ["--printsrcinfo"]),
            StepKind::ArchBuild => archbuild_command(props)?,
            StepKind::SignPackage { pkg_name } => {
                let artifact = props.publish_dir()?.join(props.artifact_name(pkg_name)?);
                CommandLine::new(
                    "gpg",
                    [
                        "--detach-sign".to_string(),
                        "--yes".to_string(),
                        artifact.display().to_string(),
                    ],
                )
            }
            StepKind::RepoAdd { pkg_name } => {
                let artifact = props.publish_dir()?.join(props.artifact_name(pkg_name)?);
                CommandLine::new(
                    "repo-add",
                    [
                        "-R".to_string(),
                        props.repo_db()?.display().to_string(),
                        artifact.display().to_string(),
                    ],
                )
            }
            StepKind::MountMirror => {
                let remote = format!(
                    "{}:{}",
                    props.require_str(keys::REMOTE_HOST)?,
                    props.require_str(keys::REMOTE_PATH)?
                );
                CommandLine::new(
                    "sshfs",
                    [remote, props.require_str(keys::SSH_MOUNT_ROOT)?.to_string()],
                )
            }
            StepKind::SyncMirror => {
                let tree = repo_tree(props)?;
                let root = props.require_str(keys::REPO_ROOT)?;
                let mount = props.require_str(keys::SSH_MOUNT_ROOT)?;
                CommandLine::new(
                    "rsync",
                    [
                        "-a".to_string(),
                        "--delete".to_string(),
                        format!("{root}/{tree}/"),
                        format!("{mount}/{tree}/"),
                    ],
                )
            }
            StepKind::UnmountMirror => CommandLine::new(
                "fusermount",
                ["-u".to_string(), props.require_str(keys::SSH_MOUNT_ROOT)?.to_string()],
            ),
            StepKind::Shell { argv } => {
                let mut rendered = argv
                    .iter()
                    .map(|arg| interpolate(arg, props))
                    .collect::<Result<Vec<_>>>()?;
                if rendered.is_empty() {
                    return Err(ArchCiError::StepFailed {
                        step: "shell".to_string(),
                        reason: "empty command".to_string(),
                    });
                }
                let program = rendered.remove(0);
                CommandLine::new(&program, rendered)
            }
            StepKind::SetProperties { .. }
            | StepKind::SetProperty { .. }
            | StepKind::FindDependency
            | StepKind::FetchFile { .. }
            | StepKind::BumpRelease
            | StepKind::PinVcsRevision
            | StepKind::SetVersion
            | StepKind::PublishDescriptor
            | StepKind::RefreshProperties
            | StepKind::UploadPackage { .. }
            | StepKind::Cleanup => return Ok(None),
        };
        Ok(Some(cmd))
    }
}

/// `<repo_name>-<suffix>`
fn repo_tree(props: &BuildProperties) -> Result<String> {
    Ok(format!(
        "{}-{}",
        props.require_str(keys::REPO_NAME)?,
        props.require_str(keys::CHANNEL_SUFFIX)?
    ))
}

/// `sudo <script> [-- -I <dep>...]`. Version and release overrides are not
/// passed here: the `set version` step has already written them into the
/// PKGBUILD.
fn archbuild_command(props: &BuildProperties) -> Result<CommandLine> {
    let channel = if props.get_bool(keys::TESTING) {
        Some("testing")
    } else if props.get_bool(keys::STAGING) {
        Some("staging")
    } else {
        None
    };
    let script = build_script_name(
        props.require_str(keys::REPO_NAME)?,
        channel,
        props.get_str(keys::PKG_ARCH).unwrap_or_default(),
    );

    let mut args = vec![script];
    let depends = props.get_str_list(keys::DEPENDENCY_NAMES);
    if !depends.is_empty() {
        args.push("--".to_string());
        for name in depends {
            args.push("-I".to_string());
            args.push(props.require_str(&dependency_key(&name))?.to_string());
        }
    }
    Ok(CommandLine::new("sudo", args))
}

/// A named step with its predicate and failure policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub kind: StepKind,
    pub run_if: Condition,
    /// Stop the pipeline when this step fails.
    pub halt_on_failure: bool,
    /// Mark the whole build failed when this step fails.
    pub flunk_on_failure: bool,
    /// Run even after an earlier step halted the pipeline.
    pub always_run: bool,
    /// Named counting lock held while the step runs.
    pub lock: Option<String>,
}

impl Step {
    pub fn new(name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            name: name.into(),
            kind,
            run_if: Condition::Always,
            halt_on_failure: true,
            flunk_on_failure: true,
            always_run: false,
            lock: None,
        }
    }

    pub fn run_if(mut self, condition: Condition) -> Self {
        self.run_if = condition;
        self
    }

    pub fn always_run(mut self) -> Self {
        self.always_run = true;
        self
    }

    pub fn with_lock(mut self, lock: impl Into<String>) -> Self {
        self.lock = Some(lock.into());
        self
    }

    /// Failures are reported but neither halt nor fail the build.
    pub fn warn_only(mut self) -> Self {
        self.halt_on_failure = false;
        self.flunk_on_failure = false;
        self
    }

    pub fn should_run(&self, props: &BuildProperties) -> bool {
        self.run_if.evaluate(props)
    }
}
