//! `.SRCINFO` parsing.
//!
//! A `.SRCINFO` file is a flat `key = value` rendering of a PKGBUILD. We only
//! model the fields the build pipeline consumes: package names, version
//! triple, architecture, the install script, plain source files that must be
//! shipped next to the PKGBUILD, and the first version-control source.
//!
//! Two VCS source grammars are recognised, tried in this order:
//!
//! - scheme-embedded: `name::git://host/repo.git#tag=v1`
//! - plus-form: `name::git+https://host/repo.git?signed#commit=abc`
//!
//! Only the first VCS source in file order is kept. Packages pulling from
//! several repositories build fine, but revision pinning only ever follows
//! the first one.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{ArchCiError, Result};

/// Name of the descriptor file inside a package directory.
pub const SRCINFO_FILENAME: &str = ".SRCINFO";

/// Package groups whose PKGBUILDs live in a `trunk/` subdirectory.
const TRUNK_GROUPS: [&str; 2] = ["community", "packages"];

fn url_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[^:]*:{0,2}(ht|f)tps?://.+").expect("valid url regex"))
}

fn vcs_scheme_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([^:]*):{0,2}((git|hg)://[^#]+)#?(.*)").expect("valid vcs regex")
    })
}

fn vcs_plus_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([^:]*):{0,2}(git|hg)\+([^#]+)#?(.*)").expect("valid vcs regex")
    })
}

/// Version control system backing a source entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VcsKind {
    Git,
    Hg,
}

impl VcsKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VcsKind::Git => "git",
            VcsKind::Hg => "hg",
        }
    }

    fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "git" => Some(VcsKind::Git),
            "hg" => Some(VcsKind::Hg),
            _ => None,
        }
    }

    /// Fragment key makepkg uses to pin a single revision.
    pub fn commit_key(&self) -> &'static str {
        match self {
            VcsKind::Git => "commit",
            VcsKind::Hg => "revision",
        }
    }
}

impl FromStr for VcsKind {
    type Err = ArchCiError;

    fn from_str(s: &str) -> Result<Self> {
        VcsKind::from_scheme(s)
            .ok_or_else(|| ArchCiError::InvalidDescriptorEdit(format!("unknown vcs type: {s}")))
    }
}

/// How a VCS source is locked to a point in history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinMode {
    Tag,
    Branch,
    Commit,
}

impl PinMode {
    fn from_fragment_key(key: &str) -> Option<Self> {
        match key {
            "tag" => Some(PinMode::Tag),
            "branch" => Some(PinMode::Branch),
            "commit" | "revision" => Some(PinMode::Commit),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PinMode::Tag => "tag",
            PinMode::Branch => "branch",
            PinMode::Commit => "commit",
        }
    }
}

impl FromStr for PinMode {
    type Err = ArchCiError;

    fn from_str(s: &str) -> Result<Self> {
        PinMode::from_fragment_key(s)
            .ok_or_else(|| ArchCiError::InvalidDescriptorEdit(format!("unknown pin mode: {s}")))
    }
}

/// The primary version-control source of a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcsSource {
    pub kind: VcsKind,
    pub url: String,
    /// Checkout directory name; derived from the URL when not given.
    pub name: String,
    pub pin_mode: Option<PinMode>,
    pub pin_value: Option<String>,
}

impl VcsSource {
    fn from_parts(name: &str, kind: VcsKind, url: &str, fragment: &str) -> Self {
        let name = if name.is_empty() {
            derive_name(url)
        } else {
            name.to_string()
        };

        let (pin_mode, pin_value) = if fragment.is_empty() {
            (None, None)
        } else {
            let mut parts = fragment.splitn(2, '=');
            let key = parts.next().unwrap_or_default();
            let value = parts.next().map(str::to_string);
            match PinMode::from_fragment_key(key) {
                Some(mode) => (Some(mode), value),
                None => (None, None),
            }
        };

        Self {
            kind,
            url: url.to_string(),
            name,
            pin_mode,
            pin_value,
        }
    }

    /// Render back into a plus-form source entry.
    pub fn to_source_entry(&self) -> String {
        let mut entry = format!("{}::{}+{}", self.name, self.kind.as_str(), self.url);
        if let Some(mode) = self.pin_mode {
            let key = match mode {
                PinMode::Commit => self.kind.commit_key(),
                other => other.as_str(),
            };
            entry.push('#');
            entry.push_str(key);
            if let Some(value) = &self.pin_value {
                entry.push('=');
                entry.push_str(value);
            }
        }
        entry
    }
}

/// Final path segment of a URL without its extension.
fn derive_name(url: &str) -> String {
    let path = match url::Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.split('?').next().unwrap_or(url).to_string(),
    };
    Path::new(&path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Match a source value against both VCS grammars, scheme-embedded first.
fn match_vcs(source: &str) -> Option<VcsSource> {
    if let Some(caps) = vcs_scheme_pattern().captures(source) {
        let kind = VcsKind::from_scheme(&caps[3])?;
        return Some(VcsSource::from_parts(&caps[1], kind, &caps[2], &caps[4]));
    }
    if let Some(caps) = vcs_plus_pattern().captures(source) {
        let kind = VcsKind::from_scheme(&caps[2])?;
        return Some(VcsSource::from_parts(&caps[1], kind, &caps[3], &caps[4]));
    }
    None
}

/// Snapshot of one `.SRCINFO` parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageMetadata {
    pub pkg_base: Option<String>,
    /// Local source files (everything that is neither a URL nor a VCS source).
    pub source_entries: Vec<String>,
    pub install: Option<String>,
    pub vcs: Option<VcsSource>,
    pub pkg_names: Vec<String>,
    pub arch: String,
    pub version: String,
    pub release: String,
    /// Epoch with its trailing `:`, ready for filename construction.
    pub epoch: Option<String>,
}

impl PackageMetadata {
    /// Epoch prefix for artifact names, empty when the package has none.
    pub fn epoch_prefix(&self) -> &str {
        self.epoch.as_deref().unwrap_or("")
    }

    /// `[epoch:]pkgver-pkgrel`
    pub fn full_version(&self) -> String {
        format!("{}{}-{}", self.epoch_prefix(), self.version, self.release)
    }

    /// Render the modeled fields as a `.SRCINFO` document.
    pub fn to_srcinfo(&self) -> String {
        let mut out = String::new();
        if let Some(base) = &self.pkg_base {
            out.push_str(&format!("pkgbase = {base}\n"));
        }
        out.push_str(&format!("\tpkgver = {}\n", self.version));
        out.push_str(&format!("\tpkgrel = {}\n", self.release));
        if let Some(epoch) = &self.epoch {
            out.push_str(&format!("\tepoch = {}\n", epoch.trim_end_matches(':')));
        }
        if let Some(install) = &self.install {
            out.push_str(&format!("\tinstall = {install}\n"));
        }
        if !self.arch.is_empty() {
            out.push_str(&format!("\tarch = {}\n", self.arch));
        }
        if let Some(vcs) = &self.vcs {
            out.push_str(&format!("\tsource = {}\n", vcs.to_source_entry()));
        }
        for source in &self.source_entries {
            out.push_str(&format!("\tsource = {source}\n"));
        }
        for name in &self.pkg_names {
            out.push_str(&format!("\npkgname = {name}\n"));
        }
        out
    }
}

impl FromStr for PackageMetadata {
    type Err = ArchCiError;

    fn from_str(s: &str) -> Result<Self> {
        parse(s)
    }
}

/// Parse `.SRCINFO` text.
///
/// Single forward scan; scalar fields keep their last occurrence. Fails with
/// [`ArchCiError::MalformedDescriptor`] when `pkgname` or `pkgver` never
/// appear.
pub fn parse(text: &str) -> Result<PackageMetadata> {
    let mut pkg_base = None;
    let mut source_entries = Vec::new();
    let mut install = None;
    let mut vcs: Option<VcsSource> = None;
    let mut pkg_names = Vec::new();
    let mut arch = String::new();
    let mut version = None;
    let mut release = String::new();
    let mut epoch = None;

    for line in text.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();

        match key {
            "source" => {}
            k if k.starts_with("source_") => {}
            "pkgbase" => {
                pkg_base = Some(value.to_string());
                continue;
            }
            "pkgname" => {
                pkg_names.push(value.to_string());
                continue;
            }
            "pkgver" => {
                version = Some(value.to_string());
                continue;
            }
            "pkgrel" => {
                release = value.to_string();
                continue;
            }
            "epoch" => {
                epoch = (!value.is_empty()).then(|| format!("{value}:"));
                continue;
            }
            "arch" => {
                arch = value.to_string();
                continue;
            }
            "install" => {
                install = (!value.is_empty()).then(|| value.to_string());
                continue;
            }
            _ => continue,
        }

        // source lines
        if let Some(found) = match_vcs(value) {
            if vcs.is_none() {
                vcs = Some(found);
            } else {
                debug!(source = %value, "ignoring additional vcs source");
            }
        } else if !url_pattern().is_match(value) {
            source_entries.push(value.to_string());
        }
    }

    if pkg_names.is_empty() {
        return Err(ArchCiError::MalformedDescriptor {
            field: "pkgname".to_string(),
        });
    }
    let version = version.ok_or_else(|| ArchCiError::MalformedDescriptor {
        field: "pkgver".to_string(),
    })?;

    Ok(PackageMetadata {
        pkg_base,
        source_entries,
        install,
        vcs,
        pkg_names,
        arch,
        version,
        release,
        epoch,
    })
}

/// Directory holding the PKGBUILD of `pkg_base` within `group`.
pub fn descriptor_dir(root: &Path, group: &str, pkg_base: &str) -> PathBuf {
    let dir = root.join(group).join(pkg_base);
    if TRUNK_GROUPS.contains(&group) {
        dir.join("trunk")
    } else {
        dir
    }
}

/// Command that prints a fresh `.SRCINFO` on stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrcinfoGenerator {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for SrcinfoGenerator {
    fn default() -> Self {
        Self {
            program: "makepkg".to_string(),
            args: vec!["--printsrcinfo".to_string()],
        }
    }
}

impl SrcinfoGenerator {
    /// Run the generator in `dir`, write its output to `.SRCINFO` and return it.
    pub async fn generate(&self, dir: &Path) -> Result<String> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .current_dir(dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            return Err(ArchCiError::StepFailed {
                step: "generate .SRCINFO".to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        tokio::fs::write(dir.join(SRCINFO_FILENAME), &text).await?;
        Ok(text)
    }
}

/// Parse `dir/.SRCINFO`, generating it first when it does not exist.
pub async fn load_or_generate(dir: &Path, generator: &SrcinfoGenerator) -> Result<PackageMetadata> {
    let path = dir.join(SRCINFO_FILENAME);
    let text = match tokio::fs::read_to_string(&path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(dir = %dir.display(), "no .SRCINFO, generating");
            generator.generate(dir).await?
        }
        Err(e) => return Err(e.into()),
    };
    parse(&text)
}
