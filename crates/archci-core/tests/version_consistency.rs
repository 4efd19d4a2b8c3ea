//! Manifest hygiene for the ArchCI workspace: every member listed in the root
//! manifest inherits the workspace version, and archci crates depend on each
//! other through `[workspace.dependencies]` only.

use std::path::{Path, PathBuf};

fn root_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn manifest(dir: &Path) -> toml::Value {
    let text = std::fs::read_to_string(dir.join("Cargo.toml")).unwrap();
    text.parse().unwrap()
}

fn root_manifest() -> toml::Value {
    manifest(&root_dir())
}

fn members() -> Vec<String> {
    root_manifest()["workspace"]["members"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m.as_str().unwrap().to_string())
        .collect()
}

fn inherits(value: Option<&toml::Value>) -> bool {
    value
        .and_then(|v| v.get("workspace"))
        .and_then(toml::Value::as_bool)
        == Some(true)
}

#[test]
fn members_are_the_four_archci_crates() {
    let mut names = members();
    names.sort();
    assert_eq!(
        names,
        vec![
            "crates/archci-cli",
            "crates/archci-core",
            "crates/archci-pipeline",
            "crates/archci-state",
        ]
    );
}

#[test]
fn every_member_inherits_the_workspace_version() {
    for member in members() {
        let doc = manifest(&root_dir().join(&member));
        assert!(
            inherits(doc["package"].get("version")),
            "{member} must set version.workspace = true"
        );
    }
}

#[test]
fn internal_dependencies_go_through_the_workspace_table() {
    let root = root_manifest();
    let table = &root["workspace"]["dependencies"];
    let version = root["workspace"]["package"]["version"].as_str().unwrap();

    for member in members() {
        let doc = manifest(&root_dir().join(&member));
        for section in ["dependencies", "dev-dependencies"] {
            let Some(deps) = doc.get(section).and_then(toml::Value::as_table) else {
                continue;
            };
            for (name, spec) in deps.iter().filter(|(n, _)| n.starts_with("archci-")) {
                assert!(
                    inherits(Some(spec)),
                    "{member} [{section}] {name} must use workspace = true"
                );
                let entry = &table[name.as_str()];
                assert_eq!(entry["version"].as_str(), Some(version), "{name} version drift");
            }
        }
    }
}

#[test]
fn this_crate_reports_the_workspace_version() {
    let root = root_manifest();
    assert_eq!(
        root["workspace"]["package"]["version"].as_str(),
        Some(env!("CARGO_PKG_VERSION"))
    );
}
