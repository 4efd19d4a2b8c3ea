//! Built package naming and dependency artifact lookup.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ArchCiError, Result};

/// Compression suffix of built packages. Older deployments produced
/// `.pkg.tar.xz`, current makepkg produces `.pkg.tar.zst`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PackageExt {
    #[serde(rename = ".pkg.tar.xz")]
    Xz,
    #[default]
    #[serde(rename = ".pkg.tar.zst")]
    Zst,
}

impl PackageExt {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageExt::Xz => ".pkg.tar.xz",
            PackageExt::Zst => ".pkg.tar.zst",
        }
    }
}

impl fmt::Display for PackageExt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PackageExt {
    type Err = ArchCiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim_start_matches('.') {
            "pkg.tar.xz" | "xz" => Ok(PackageExt::Xz),
            "pkg.tar.zst" | "zst" => Ok(PackageExt::Zst),
            other => Err(ArchCiError::Config(format!("unknown package extension: {other}"))),
        }
    }
}

/// `<name>-<epoch><version>-<release>-<arch><ext>`; `epoch` already carries
/// its trailing `:` (or is empty).
pub fn artifact_file_name(
    pkg_name: &str,
    epoch: &str,
    version: &str,
    release: &str,
    arch: &str,
    ext: PackageExt,
) -> String {
    format!("{pkg_name}-{epoch}{version}-{release}-{arch}{ext}")
}

/// Detached signature companion of an artifact.
pub fn signature_file_name(artifact: &str) -> String {
    format!("{artifact}.sig")
}

/// Repository architecture directory for a package architecture.
pub fn repo_arch(pkg_arch: &str) -> &str {
    if pkg_arch == "any" || pkg_arch.is_empty() {
        "x86_64"
    } else {
        pkg_arch
    }
}

/// A dependency artifact chosen from the publish tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedArtifact {
    /// Package name recovered from the file name.
    pub package_name: String,
    pub path: PathBuf,
}

impl ResolvedArtifact {
    /// Property under which the build step looks up this artifact.
    pub fn property_key(&self) -> String {
        format!("{}_pkg", self.package_name)
    }
}

fn hyphen_count(path: &Path) -> usize {
    path.file_name()
        .map(|n| n.to_string_lossy().matches('-').count())
        .unwrap_or(0)
}

/// Pick the candidate whose file name has the fewest hyphens.
///
/// Candidates are ordered by file name first, so ties go to the
/// lexically smallest name. There is deliberately no version comparison:
/// the rule exists to prefer `foo-1.0-1-x86_64` over `foo-docs-1.0-1-x86_64`.
pub fn select_fewest_segments(mut candidates: Vec<PathBuf>) -> Option<PathBuf> {
    candidates.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    candidates.sort_by_key(|p| hyphen_count(p));
    candidates.into_iter().next()
}

/// Package name of an artifact file: everything before the last three
/// hyphen-separated fields (version, release, arch-and-extension).
fn package_name_of(file_name: &str, fallback: &str) -> String {
    let parts: Vec<&str> = file_name.split('-').collect();
    if parts.len() > 3 {
        parts[..parts.len() - 3].join("-")
    } else {
        fallback.to_string()
    }
}

/// Find the artifact for `prefix` under `search_root`, i.e. the best match of
/// `<prefix>-*<ext>`.
pub fn find_artifact(search_root: &Path, prefix: &str, ext: &str) -> Result<ResolvedArtifact> {
    let pattern = format!("{prefix}-*{ext}");
    let not_found = || ArchCiError::DependencyNotFound {
        name: prefix.to_string(),
        search_root: search_root.to_path_buf(),
        pattern: pattern.clone(),
    };

    let root = glob::Pattern::escape(&search_root.to_string_lossy());
    let full_pattern = Path::new(&root)
        .join(format!(
            "{}-*{}",
            glob::Pattern::escape(prefix),
            glob::Pattern::escape(ext)
        ))
        .to_string_lossy()
        .into_owned();

    let mut candidates = Vec::new();
    for entry in glob::glob(&full_pattern)? {
        candidates.push(entry.map_err(glob::GlobError::into_error)?);
    }
    debug!(pattern = %pattern, matches = candidates.len(), "dependency lookup");

    let path = select_fewest_segments(candidates).ok_or_else(not_found)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(ResolvedArtifact {
        package_name: package_name_of(&file_name, prefix),
        path,
    })
}
