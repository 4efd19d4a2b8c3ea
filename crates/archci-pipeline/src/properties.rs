//! The property bag shared by every step of a pipeline.
//!
//! Steps run one at a time, so the bag is passed by `&mut` and each step
//! writes only the keys it owns (see [`keys`]).

use std::collections::BTreeMap;
use std::path::PathBuf;

use archci_core::artifact::{artifact_file_name, repo_arch, PackageExt};
use archci_core::{ArchCiError, PackageMetadata, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Well-known property names.
pub mod keys {
    // Seeded from .SRCINFO, rewritten by RefreshProperties.
    pub const SRC_NAMES: &str = "src_names";
    pub const INSTALL: &str = "install";
    pub const VCS_TYPE: &str = "vcs_type";
    pub const VCS_URL: &str = "vcs_url";
    pub const VCS_NAME: &str = "vcs_name";
    pub const PIN_MODE: &str = "pin_mode";
    pub const PIN_VALUE: &str = "pin_value";
    pub const PKG_NAMES: &str = "pkg_names";
    pub const PKG_ARCH: &str = "pkg_arch";
    pub const PKG_VER: &str = "pkg_ver";
    pub const PKG_REL: &str = "pkg_rel";
    pub const EPOCH: &str = "epoch";
    pub const PKG_BASE: &str = "pkg_base";

    // Build environment.
    pub const REPO_ROOT: &str = "repo_root";
    pub const REPO_NAME: &str = "repo_name";
    pub const CHANNEL_SUFFIX: &str = "channel_suffix";
    pub const PACKAGE_EXT: &str = "package_ext";
    pub const DESCRIPTOR_DIR: &str = "descriptor_dir";
    pub const WORKSPACE: &str = "workspace";
    pub const WORKER_HOST: &str = "worker_host";
    pub const REMOTE_HOST: &str = "remote_host";
    pub const REMOTE_PATH: &str = "remote_path";
    pub const SSH_MOUNT_ROOT: &str = "ssh_mount_root";

    // Dependencies; each resolved one also sets `<name>_pkg`.
    pub const DEPENDENCY_NAMES: &str = "dependency_names";
    pub const DEPENDS_NAME: &str = "depends_name";

    // Build request.
    pub const TESTING: &str = "testing";
    pub const STAGING: &str = "staging";
    pub const GPG_SIGN: &str = "gpg_sign";
    pub const BUMP_REL: &str = "bump_rel";
    pub const PKG_VER_OVERRIDE: &str = "pkg_ver_override";
    pub const PKG_REL_OVERRIDE: &str = "pkg_rel_override";
    pub const REVISION: &str = "revision";
    pub const TAG: &str = "tag";
}

/// Property holding the resolved artifact path of dependency `name`.
pub fn dependency_key(name: &str) -> String {
    format!("{name}_pkg")
}

/// String-keyed JSON values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildProperties(BTreeMap<String, Value>);

impl BuildProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_metadata(meta: &PackageMetadata) -> Self {
        let mut props = Self::new();
        props.apply_metadata(meta);
        props
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Like [`get_str`](Self::get_str) but a missing or empty value is an
    /// error.
    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.get_str(key)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ArchCiError::MissingProperty(key.to_string()))
    }

    /// Missing and non-boolean values read as `false`.
    pub fn get_bool(&self, key: &str) -> bool {
        self.0.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn get_str_list(&self, key: &str) -> Vec<String> {
        match self.0.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Present and not null, `false`, an empty string or an empty list.
    pub fn is_set(&self, key: &str) -> bool {
        match self.0.get(key) {
            None | Some(Value::Null) | Some(Value::Bool(false)) => false,
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Array(a)) => !a.is_empty(),
            Some(_) => true,
        }
    }

    /// Copy every entry of `other` over this bag.
    pub fn merge(&mut self, other: &BuildProperties) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overwrite the descriptor-derived keys with `meta`. Keys for absent
    /// optional fields are removed.
    pub fn apply_metadata(&mut self, meta: &PackageMetadata) {
        self.set(keys::SRC_NAMES, meta.source_entries.clone());
        self.set(keys::PKG_NAMES, meta.pkg_names.clone());
        self.set(keys::PKG_ARCH, meta.arch.clone());
        self.set(keys::PKG_VER, meta.version.clone());
        self.set(keys::PKG_REL, meta.release.clone());
        self.set(keys::EPOCH, meta.epoch_prefix());
        self.set_or_remove(keys::PKG_BASE, meta.pkg_base.as_deref());
        self.set_or_remove(keys::INSTALL, meta.install.as_deref());

        let vcs = meta.vcs.as_ref();
        self.set_or_remove(keys::VCS_TYPE, vcs.map(|v| v.kind.as_str()));
        self.set_or_remove(keys::VCS_URL, vcs.map(|v| v.url.as_str()));
        self.set_or_remove(keys::VCS_NAME, vcs.map(|v| v.name.as_str()));
        self.set_or_remove(
            keys::PIN_MODE,
            vcs.and_then(|v| v.pin_mode).map(|m| m.as_str()),
        );
        self.set_or_remove(keys::PIN_VALUE, vcs.and_then(|v| v.pin_value.as_deref()));
    }

    fn set_or_remove(&mut self, key: &str, value: Option<&str>) {
        match value {
            Some(value) => self.set(key, value),
            None => {
                self.remove(key);
            }
        }
    }

    pub fn package_ext(&self) -> Result<PackageExt> {
        match self.get_str(keys::PACKAGE_EXT) {
            Some(ext) => ext.parse(),
            None => Ok(PackageExt::default()),
        }
    }

    /// `<repo_root>/<repo_name>-<suffix>/<arch>`, where packages are
    /// published and dependencies are looked up.
    pub fn publish_dir(&self) -> Result<PathBuf> {
        let root = self.require_str(keys::REPO_ROOT)?;
        let name = self.require_str(keys::REPO_NAME)?;
        let suffix = self.require_str(keys::CHANNEL_SUFFIX)?;
        let arch = repo_arch(self.get_str(keys::PKG_ARCH).unwrap_or_default());
        Ok(PathBuf::from(root).join(format!("{name}-{suffix}")).join(arch))
    }

    /// `<repo_name>-<suffix>.db.tar.gz` inside the publish directory.
    pub fn repo_db(&self) -> Result<PathBuf> {
        let name = self.require_str(keys::REPO_NAME)?;
        let suffix = self.require_str(keys::CHANNEL_SUFFIX)?;
        Ok(self.publish_dir()?.join(format!("{name}-{suffix}.db.tar.gz")))
    }

    /// Artifact file name of `pkg_name` at the current version.
    pub fn artifact_name(&self, pkg_name: &str) -> Result<String> {
        Ok(artifact_file_name(
            pkg_name,
            self.get_str(keys::EPOCH).unwrap_or_default(),
            self.require_str(keys::PKG_VER)?,
            self.require_str(keys::PKG_REL)?,
            self.require_str(keys::PKG_ARCH)?,
            self.package_ext()?,
        ))
    }

    pub fn workspace(&self) -> Result<PathBuf> {
        self.require_str(keys::WORKSPACE).map(PathBuf::from)
    }

    pub fn descriptor_dir(&self) -> Result<PathBuf> {
        self.require_str(keys::DESCRIPTOR_DIR).map(PathBuf::from)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for BuildProperties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SRCINFO: &str = "pkgbase = widget
\tpkgver = 2.0
\tpkgrel = 1
\tepoch = 1
\tarch = any
\tsource = git+https://git.example.org/widget.git#tag=v2.0
\tsource = widget.service
pkgname = widget
pkgname = widget-docs
";

    fn published() -> BuildProperties {
        let mut props = BuildProperties::from_metadata(&SRCINFO.parse().unwrap());
        props.set(keys::REPO_ROOT, "/srv/repo");
        props.set(keys::REPO_NAME, "aurora");
        props.set(keys::CHANNEL_SUFFIX, "stable");
        props
    }

    #[test]
    fn metadata_fields_become_properties() {
        let props = published();
        assert_eq!(props.get_str_list(keys::PKG_NAMES), vec!["widget", "widget-docs"]);
        assert_eq!(props.get_str_list(keys::SRC_NAMES), vec!["widget.service"]);
        assert_eq!(props.get_str(keys::EPOCH), Some("1:"));
        assert_eq!(props.get_str(keys::VCS_TYPE), Some("git"));
        assert_eq!(props.get_str(keys::PIN_MODE), Some("tag"));
        assert_eq!(props.get_str(keys::PIN_VALUE), Some("v2.0"));
        assert!(!props.is_set(keys::INSTALL));
    }

    #[test]
    fn refresh_drops_vanished_vcs_keys() {
        let mut props = published();
        let plain: PackageMetadata = "pkgver = 2.1\npkgrel = 1\narch = any\npkgname = widget\n"
            .parse()
            .unwrap();
        props.apply_metadata(&plain);
        assert!(props.get(keys::VCS_URL).is_none());
        assert!(props.get(keys::PIN_MODE).is_none());
        assert_eq!(props.get_str(keys::PKG_VER), Some("2.1"));
        assert_eq!(props.get_str(keys::EPOCH), Some(""));
    }

    #[test]
    fn publish_paths_follow_repo_layout() {
        let props = published();
        assert_eq!(
            props.publish_dir().unwrap(),
            PathBuf::from("/srv/repo/aurora-stable/x86_64")
        );
        assert_eq!(
            props.repo_db().unwrap(),
            PathBuf::from("/srv/repo/aurora-stable/x86_64/aurora-stable.db.tar.gz")
        );
        assert_eq!(
            props.artifact_name("widget-docs").unwrap(),
            "widget-docs-1:2.0-1-any.pkg.tar.zst"
        );
    }

    #[test]
    fn missing_and_empty_values_are_reported() {
        let mut props = BuildProperties::new();
        props.set(keys::REPO_NAME, "");
        assert!(matches!(
            props.require_str(keys::REPO_NAME),
            Err(ArchCiError::MissingProperty(ref k)) if k == "repo_name"
        ));
        assert!(props.publish_dir().is_err());
    }

    #[test]
    fn is_set_treats_falsy_values_as_unset() {
        let props: BuildProperties = [
            ("a", json!(null)),
            ("b", json!(false)),
            ("c", json!("")),
            ("d", json!([])),
            ("e", json!("x")),
            ("f", json!(true)),
        ]
        .into_iter()
        .collect();
        let set: Vec<&str> = ["a", "b", "c", "d", "e", "f", "g"]
            .into_iter()
            .filter(|k| props.is_set(k))
            .collect();
        assert_eq!(set, vec!["e", "f"]);
    }

    #[test]
    fn merge_overwrites() {
        let mut base: BuildProperties = [("a", "1"), ("b", "2")].into_iter().collect();
        let update: BuildProperties = [("b", "3")].into_iter().collect();
        base.merge(&update);
        assert_eq!(base.get_str("a"), Some("1"));
        assert_eq!(base.get_str("b"), Some("3"));
        assert_eq!(base.len(), 2);
    }
}
