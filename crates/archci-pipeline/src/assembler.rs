//! Turns package metadata and a build request into an ordered step list.

use std::path::PathBuf;

use archci_core::config::Config;
use archci_core::pkgbuild::PKGBUILD_FILENAME;
use archci_core::{PackageExt, PackageMetadata};
use serde::{Deserialize, Serialize};

use crate::properties::{keys, BuildProperties};
use crate::step::{Condition, Step, StepKind};

/// Target channel of a build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    #[default]
    Stable,
    Testing,
    Staging,
}

/// Remote side of the mirror sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorTarget {
    pub remote_host: String,
    pub remote_path: String,
    pub mount_root: PathBuf,
}

/// Where a build reads from and publishes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildEnvironment {
    pub repo_root: PathBuf,
    pub repo_name: String,
    pub channel_suffix: String,
    pub package_ext: PackageExt,
    pub descriptor_dir: PathBuf,
    pub workspace: PathBuf,
    pub worker_host: String,
    pub mirror: Option<MirrorTarget>,
}

impl BuildEnvironment {
    /// Environment for `pkg_base`, whose descriptor lives in `descriptor_dir`.
    /// The workspace is `<workspace_root>/<pkg_base>`.
    pub fn from_config(config: &Config, descriptor_dir: PathBuf, pkg_base: &str) -> Self {
        let repo = &config.repository;
        let mirror = config.mirror.remote_host.as_ref().map(|host| MirrorTarget {
            remote_host: host.clone(),
            remote_path: config.mirror.remote_path.clone(),
            mount_root: config.mirror.mount_root.clone(),
        });
        Self {
            repo_root: repo.root.clone(),
            repo_name: repo.name.clone(),
            channel_suffix: repo.suffix.clone(),
            package_ext: repo.package_ext,
            descriptor_dir,
            workspace: repo.workspace_root.join(pkg_base),
            worker_host: repo.worker_host.clone(),
            mirror,
        }
    }
}

/// Per-invocation parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub channel: Channel,
    pub bump_rel: bool,
    pub version_override: Option<String>,
    pub release_override: Option<String>,
    /// Commit to pin a `#commit=` source to.
    pub revision: Option<String>,
    /// Tag to pin a `#tag=` source to.
    pub tag: Option<String>,
}

/// Which optional parts of the pipeline are assembled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOptions {
    pub gpg_sign: bool,
    /// Packages from the publish tree injected into the build chroot.
    pub depends: Vec<String>,
    /// Pin the VCS source to the requested tag or revision.
    pub pin_vcs: bool,
    /// Bump, pin and write the descriptor back after the build.
    pub mutate_descriptor: bool,
    /// Upload, sign, index and mirror the built packages.
    pub publish: bool,
    /// Counting lock held around the chroot build.
    pub build_lock: Option<String>,
    /// Appended after publishing, before cleanup.
    pub extra_steps: Vec<Step>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            gpg_sign: false,
            depends: Vec::new(),
            pin_vcs: true,
            mutate_descriptor: true,
            publish: true,
            build_lock: None,
            extra_steps: Vec::new(),
        }
    }
}

impl PipelineOptions {
    pub fn from_config(config: &Config, pkg_base: &str) -> Self {
        Self {
            gpg_sign: config.signing.gpg_sign,
            depends: config.build.depends_for(pkg_base),
            build_lock: Some(config.build.lock_name.clone()),
            ..Self::default()
        }
    }
}

/// Properties every pipeline starts from.
pub fn seed_properties(
    meta: &PackageMetadata,
    env: &BuildEnvironment,
    req: &BuildRequest,
    opts: &PipelineOptions,
) -> BuildProperties {
    let mut props = BuildProperties::from_metadata(meta);

    props.set(keys::REPO_ROOT, env.repo_root.display().to_string());
    props.set(keys::REPO_NAME, env.repo_name.clone());
    props.set(keys::CHANNEL_SUFFIX, env.channel_suffix.clone());
    props.set(keys::PACKAGE_EXT, env.package_ext.as_str());
    props.set(keys::DESCRIPTOR_DIR, env.descriptor_dir.display().to_string());
    props.set(keys::WORKSPACE, env.workspace.display().to_string());
    props.set(keys::WORKER_HOST, env.worker_host.clone());
    if let Some(mirror) = &env.mirror {
        props.set(keys::REMOTE_HOST, mirror.remote_host.clone());
        props.set(keys::REMOTE_PATH, mirror.remote_path.clone());
        props.set(keys::SSH_MOUNT_ROOT, mirror.mount_root.display().to_string());
    }

    props.set(keys::TESTING, req.channel == Channel::Testing);
    props.set(keys::STAGING, req.channel == Channel::Staging);
    props.set(keys::BUMP_REL, req.bump_rel);
    props.set(keys::GPG_SIGN, opts.gpg_sign);
    props.set(keys::DEPENDENCY_NAMES, opts.depends.clone());
    for (key, value) in [
        (keys::PKG_VER_OVERRIDE, &req.version_override),
        (keys::PKG_REL_OVERRIDE, &req.release_override),
        (keys::REVISION, &req.revision),
        (keys::TAG, &req.tag),
    ] {
        if let Some(value) = value {
            props.set(key, value.clone());
        }
    }
    props
}

fn pin_condition() -> Condition {
    Condition::Any(vec![
        Condition::All(vec![
            Condition::property_equals(keys::PIN_MODE, "tag"),
            Condition::property_set(keys::TAG),
        ]),
        Condition::All(vec![
            Condition::property_equals(keys::PIN_MODE, "commit"),
            Condition::property_set(keys::REVISION),
        ]),
    ])
}

/// Assemble the build pipeline for one package base.
///
/// Order: seed, dependency lookups, input fetch, descriptor edits, chroot
/// build, descriptor refresh, per-package publish, mirror, cleanup.
pub fn assemble(
    meta: &PackageMetadata,
    env: &BuildEnvironment,
    req: &BuildRequest,
    opts: &PipelineOptions,
) -> Vec<Step> {
    let mut steps = vec![Step::new(
        "seed properties",
        StepKind::SetProperties {
            properties: seed_properties(meta, env, req, opts),
        },
    )];

    for name in &opts.depends {
        let has_depends = Condition::property_set(keys::DEPENDENCY_NAMES);
        steps.push(
            Step::new(
                format!("set depends_name to {name}"),
                StepKind::SetProperty {
                    key: keys::DEPENDS_NAME.to_string(),
                    value: name.clone().into(),
                },
            )
            .run_if(has_depends.clone()),
        );
        steps.push(Step::new(format!("find {name}"), StepKind::FindDependency).run_if(has_depends));
    }

    let mut inputs = vec![PKGBUILD_FILENAME.to_string()];
    inputs.extend(meta.source_entries.iter().cloned());
    inputs.extend(meta.install.iter().cloned());
    for file in inputs {
        steps.push(Step::new(
            format!("fetch {file}"),
            StepKind::FetchFile {
                source: file.clone(),
                dest: file,
            },
        ));
    }

    if opts.mutate_descriptor {
        steps.push(
            Step::new("bump release", StepKind::BumpRelease)
                .run_if(Condition::property_true(keys::BUMP_REL)),
        );
        if opts.pin_vcs && meta.vcs.is_some() {
            steps.push(Step::new("pin vcs revision", StepKind::PinVcsRevision).run_if(pin_condition()));
        }
    }
    steps.push(
        Step::new("set version", StepKind::SetVersion).run_if(Condition::Any(vec![
            Condition::property_set(keys::PKG_VER_OVERRIDE),
            Condition::property_set(keys::PKG_REL_OVERRIDE),
        ])),
    );
    steps.push(
        Step::new("update checksums", StepKind::UpdateChecksums)
            .run_if(Condition::property_set(keys::PKG_VER_OVERRIDE)),
    );

    let build = Step::new("archbuild", StepKind::ArchBuild);
    steps.push(match &opts.build_lock {
        Some(lock) => build.with_lock(lock.clone()),
        None => build,
    });

    steps.push(Step::new("generate .SRCINFO", StepKind::GenerateSrcinfo));
    if opts.mutate_descriptor {
        steps.push(Step::new("publish descriptor", StepKind::PublishDescriptor));
    }
    steps.push(Step::new("refresh properties", StepKind::RefreshProperties));

    if opts.publish {
        for pkg in &meta.pkg_names {
            steps.push(Step::new(
                format!("upload {pkg}"),
                StepKind::UploadPackage {
                    pkg_name: pkg.clone(),
                },
            ));
            if opts.gpg_sign {
                steps.push(
                    Step::new(
                        format!("sign {pkg}"),
                        StepKind::SignPackage {
                            pkg_name: pkg.clone(),
                        },
                    )
                    .run_if(Condition::property_true(keys::GPG_SIGN)),
                );
            }
            steps.push(Step::new(
                format!("repo-add {pkg}"),
                StepKind::RepoAdd {
                    pkg_name: pkg.clone(),
                },
            ));
        }

        if env.mirror.is_some() {
            steps.push(Step::new("mount mirror", StepKind::MountMirror).always_run());
            steps.push(Step::new("sync mirror", StepKind::SyncMirror).always_run());
            steps.push(Step::new("unmount mirror", StepKind::UnmountMirror).always_run());
        }
    }

    steps.extend(opts.extra_steps.iter().cloned());
    steps.push(Step::new("clean up", StepKind::Cleanup).always_run());
    steps
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRCINFO: &str = "pkgbase = widget
\tpkgver = 2.0
\tpkgrel = 1
\tarch = x86_64
\tinstall = widget.install
\tsource = git+https://git.example.org/widget.git#tag=v2.0
\tsource = widget.service
pkgname = widget
";

    fn env(mirror: bool) -> BuildEnvironment {
        BuildEnvironment {
            repo_root: PathBuf::from("/srv/repo"),
            repo_name: "aurora".to_string(),
            channel_suffix: "stable".to_string(),
            package_ext: PackageExt::Zst,
            descriptor_dir: PathBuf::from("/srv/pkgbuilds/core/widget"),
            workspace: PathBuf::from("/var/lib/archci/work/widget"),
            worker_host: "builder1".to_string(),
            mirror: mirror.then(|| MirrorTarget {
                remote_host: "mirror.example.org".to_string(),
                remote_path: "/srv/http/repo".to_string(),
                mount_root: PathBuf::from("/mnt/mirror"),
            }),
        }
    }

    fn names(steps: &[Step]) -> Vec<&str> {
        steps.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn default_pipeline_order() {
        let meta: PackageMetadata = SRCINFO.parse().unwrap();
        let steps = assemble(&meta, &env(false), &BuildRequest::default(), &PipelineOptions::default());
        assert_eq!(
            names(&steps),
            vec![
                "seed properties",
                "fetch PKGBUILD",
                "fetch widget.service",
                "fetch widget.install",
                "bump release",
                "pin vcs revision",
                "set version",
                "update checksums",
                "archbuild",
                "generate .SRCINFO",
                "publish descriptor",
                "refresh properties",
                "upload widget",
                "repo-add widget",
                "clean up",
            ]
        );
    }

    #[test]
    fn read_only_pipeline_leaves_descriptor_alone() {
        let meta: PackageMetadata = SRCINFO.parse().unwrap();
        let opts = PipelineOptions {
            mutate_descriptor: false,
            publish: false,
            ..PipelineOptions::default()
        };
        let steps = assemble(&meta, &env(true), &BuildRequest::default(), &opts);
        let names = names(&steps);
        for absent in ["bump release", "pin vcs revision", "publish descriptor", "upload widget", "mount mirror"] {
            assert!(!names.contains(&absent), "{absent} should not be assembled");
        }
    }

    #[test]
    fn mirror_steps_always_run() {
        let meta: PackageMetadata = SRCINFO.parse().unwrap();
        let steps = assemble(&meta, &env(true), &BuildRequest::default(), &PipelineOptions::default());
        let mirror: Vec<&Step> = steps.iter().filter(|s| s.name.contains("mirror")).collect();
        assert_eq!(mirror.len(), 3);
        assert!(mirror.iter().all(|s| s.always_run));
    }

    #[test]
    fn build_step_holds_the_lock() {
        let meta: PackageMetadata = SRCINFO.parse().unwrap();
        let opts = PipelineOptions {
            build_lock: Some("archbuild".to_string()),
            ..PipelineOptions::default()
        };
        let steps = assemble(&meta, &env(false), &BuildRequest::default(), &opts);
        let locked: Vec<&str> = steps
            .iter()
            .filter(|s| s.lock.is_some())
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(locked, vec!["archbuild"]);
    }

    #[test]
    fn seed_carries_request_and_environment() {
        let meta: PackageMetadata = SRCINFO.parse().unwrap();
        let req = BuildRequest {
            channel: Channel::Testing,
            version_override: Some("2.1".to_string()),
            tag: Some("v2.1".to_string()),
            ..BuildRequest::default()
        };
        let props = seed_properties(&meta, &env(true), &req, &PipelineOptions::default());
        assert!(props.get_bool(keys::TESTING));
        assert!(!props.get_bool(keys::STAGING));
        assert_eq!(props.get_str(keys::PKG_VER_OVERRIDE), Some("2.1"));
        assert!(!props.is_set(keys::PKG_REL_OVERRIDE));
        assert_eq!(props.get_str(keys::TAG), Some("v2.1"));
        assert_eq!(props.get_str(keys::PACKAGE_EXT), Some(".pkg.tar.zst"));
        assert_eq!(props.get_str(keys::REMOTE_HOST), Some("mirror.example.org"));
        assert_eq!(props.get_str(keys::WORKER_HOST), Some("builder1"));
        assert!(pin_condition().evaluate(&props));
    }

    #[test]
    fn pin_needs_matching_value() {
        let meta: PackageMetadata = SRCINFO.parse().unwrap();
        let props = seed_properties(
            &meta,
            &env(false),
            &BuildRequest {
                revision: Some("abc123".to_string()),
                ..BuildRequest::default()
            },
            &PipelineOptions::default(),
        );
        // tag-pinned source, but only a revision was requested
        assert!(!pin_condition().evaluate(&props));
    }
}
