//! Single-step execution.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use archci_core::artifact::find_artifact;
use archci_core::pkgbuild::{bump_release, pin_vcs_source, set_version, PKGBUILD_FILENAME};
use archci_core::srcinfo::{parse, SRCINFO_FILENAME};
use archci_core::{ArchCiError, PinMode, Result, VcsKind};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::executor::{CommandExecutor, CommandOutput};
use crate::properties::{dependency_key, keys, BuildProperties};
use crate::step::{Step, StepKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepOutcome {
    Success,
    Failure,
    Skipped,
}

impl StepOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepOutcome::Success => "success",
            StepOutcome::Failure => "failure",
            StepOutcome::Skipped => "skipped",
        }
    }
}

/// Result of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_name: String,
    pub outcome: StepOutcome,
    /// Exit code of the external command; 0 for in-process steps, -1 when
    /// the step could not run.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl StepResult {
    pub fn passed(&self) -> bool {
        self.outcome == StepOutcome::Success
    }

    pub fn skipped(step: &Step) -> Self {
        Self {
            step_name: step.name.clone(),
            outcome: StepOutcome::Skipped,
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
        }
    }

    /// A step that raised an error instead of producing output.
    pub fn errored(step: &Step, err: &ArchCiError, duration_ms: u64) -> Self {
        Self {
            step_name: step.name.clone(),
            outcome: StepOutcome::Failure,
            exit_code: -1,
            stdout: String::new(),
            stderr: err.to_string(),
            duration_ms,
        }
    }
}

/// Executes steps against the property bag.
#[derive(Clone)]
pub struct StepRunner {
    executor: Arc<dyn CommandExecutor>,
}

impl StepRunner {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    /// Run `step` unconditionally. The run predicate is the caller's concern.
    ///
    /// A non-zero exit is a `Failure` result; `Err` means the step could not
    /// be carried out (missing property, file error, spawn failure).
    pub async fn execute_step(&self, step: &Step, props: &mut BuildProperties) -> Result<StepResult> {
        let start = Instant::now();
        debug!(step = %step.name, "executing step");

        let output = match step.kind.command(props)? {
            Some(command) => {
                let cwd = working_dir(&step.kind, props)?;
                let output = self.executor.run(&command, cwd.as_deref()).await?;
                if output.success() {
                    self.after_command(&step.kind, &output, props).await?;
                }
                output
            }
            None => {
                self.run_internal(&step.kind, props).await?;
                CommandOutput::default()
            }
        };

        let outcome = if output.success() {
            StepOutcome::Success
        } else {
            StepOutcome::Failure
        };
        Ok(StepResult {
            step_name: step.name.clone(),
            outcome,
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn after_command(
        &self,
        kind: &StepKind,
        output: &CommandOutput,
        props: &BuildProperties,
    ) -> Result<()> {
        if let StepKind::GenerateSrcinfo = kind {
            tokio::fs::write(props.workspace()?.join(SRCINFO_FILENAME), &output.stdout).await?;
        }
        Ok(())
    }

    async fn run_internal(&self, kind: &StepKind, props: &mut BuildProperties) -> Result<()> {
        match kind {
            StepKind::SetProperties { properties } => props.merge(properties),
            StepKind::SetProperty { key, value } => props.set(key.clone(), value.clone()),
            StepKind::FindDependency => {
                let name = props.require_str(keys::DEPENDS_NAME)?.to_string();
                let ext = props.package_ext()?;
                let artifact = find_artifact(&props.publish_dir()?, &name, ext.as_str())?;
                info!(dependency = %name, path = %artifact.path.display(), "resolved dependency");
                props.set(dependency_key(&name), artifact.path.display().to_string());
            }
            StepKind::FetchFile { source, dest } => {
                let workspace = props.workspace()?;
                tokio::fs::create_dir_all(&workspace).await?;
                copy(&props.descriptor_dir()?.join(source), &workspace.join(dest)).await?;
            }
            StepKind::BumpRelease => {
                let path = props.workspace()?.join(PKGBUILD_FILENAME);
                let (text, release) = bump_release(&tokio::fs::read_to_string(&path).await?)?;
                tokio::fs::write(&path, text).await?;
                props.set(keys::PKG_REL, release);
            }
            StepKind::PinVcsRevision => {
                let mode: PinMode = props.require_str(keys::PIN_MODE)?.parse()?;
                let kind: VcsKind = props.require_str(keys::VCS_TYPE)?.parse()?;
                let value = match mode {
                    PinMode::Tag => props.require_str(keys::TAG)?,
                    PinMode::Commit => props.require_str(keys::REVISION)?,
                    PinMode::Branch => {
                        return Err(ArchCiError::InvalidDescriptorEdit(
                            "branch sources cannot be pinned".to_string(),
                        ))
                    }
                }
                .to_string();
                let path = props.workspace()?.join(PKGBUILD_FILENAME);
                let text = pin_vcs_source(&tokio::fs::read_to_string(&path).await?, kind, mode, &value)?;
                tokio::fs::write(&path, text).await?;
                props.set(keys::PIN_VALUE, value);
            }
            StepKind::SetVersion => {
                let version = non_empty(props, keys::PKG_VER_OVERRIDE);
                let release = non_empty(props, keys::PKG_REL_OVERRIDE);
                if version.is_none() && release.is_none() {
                    return Ok(());
                }
                let path = props.workspace()?.join(PKGBUILD_FILENAME);
                let text = set_version(
                    &tokio::fs::read_to_string(&path).await?,
                    version.as_deref(),
                    release.as_deref(),
                )?;
                tokio::fs::write(&path, text).await?;
                if let Some(version) = &version {
                    props.set(keys::PKG_VER, version.clone());
                }
                let release = release.or(version.map(|_| "1".to_string()));
                if let Some(release) = release {
                    props.set(keys::PKG_REL, release);
                }
            }
            StepKind::PublishDescriptor => {
                let workspace = props.workspace()?;
                let descriptor = props.descriptor_dir()?;
                for file in [PKGBUILD_FILENAME, SRCINFO_FILENAME] {
                    copy(&workspace.join(file), &descriptor.join(file)).await?;
                }
            }
            StepKind::RefreshProperties => {
                let path = props.workspace()?.join(SRCINFO_FILENAME);
                let meta = parse(&tokio::fs::read_to_string(&path).await?)?;
                props.apply_metadata(&meta);
            }
            StepKind::UploadPackage { pkg_name } => {
                let artifact = props.artifact_name(pkg_name)?;
                let publish = props.publish_dir()?;
                tokio::fs::create_dir_all(&publish).await?;
                copy(&props.workspace()?.join(&artifact), &publish.join(&artifact)).await?;
            }
            StepKind::Cleanup => {
                let workspace = props.workspace()?;
                match tokio::fs::remove_dir_all(&workspace).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            other => {
                return Err(ArchCiError::StepFailed {
                    step: format!("{other:?}"),
                    reason: "no in-process implementation".to_string(),
                })
            }
        }
        Ok(())
    }
}

fn non_empty(props: &BuildProperties, key: &str) -> Option<String> {
    props
        .get_str(key)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Working directory for an external command.
fn working_dir(kind: &StepKind, props: &BuildProperties) -> Result<Option<PathBuf>> {
    match kind {
        StepKind::UpdateChecksums | StepKind::ArchBuild | StepKind::GenerateSrcinfo => {
            props.workspace().map(Some)
        }
        StepKind::Shell { .. } => Ok(props.workspace().ok()),
        _ => Ok(None),
    }
}

async fn copy(from: &Path, to: &Path) -> Result<()> {
    tokio::fs::copy(from, to).await.map_err(|e| ArchCiError::StepFailed {
        step: "copy".to_string(),
        reason: format!("{} -> {}: {e}", from.display(), to.display()),
    })?;
    Ok(())
}
