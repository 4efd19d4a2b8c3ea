//! In-place edits of a PKGBUILD before it is built.
//!
//! All edits are plain text rewrites of top-level assignments; the PKGBUILD
//! is never sourced. Each function returns the rewritten text and leaves
//! writing it back to the caller.

use std::sync::OnceLock;

use regex::{NoExpand, Regex};

use crate::error::{ArchCiError, Result};
use crate::srcinfo::{PinMode, VcsKind};

/// File name of the build script inside a package directory.
pub const PKGBUILD_FILENAME: &str = "PKGBUILD";

fn pkgrel_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^pkgrel=(.*)$").expect("valid pkgrel regex"))
}

fn pkgver_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^pkgver=(.*)$").expect("valid pkgver regex"))
}

fn unquote(value: &str) -> &str {
    value.trim().trim_matches(|c| c == '"' || c == '\'')
}

/// Increment `pkgrel`. A sub-release (`2.1`) is dropped: `2.1` becomes `3`.
///
/// Returns the new text and the new release.
pub fn bump_release(text: &str) -> Result<(String, String)> {
    let caps = pkgrel_line()
        .captures(text)
        .ok_or_else(|| ArchCiError::InvalidDescriptorEdit("no pkgrel= line".to_string()))?;
    let current = unquote(&caps[1]);
    let major = current.split('.').next().unwrap_or_default();
    let release: u32 = major.parse().map_err(|_| {
        ArchCiError::InvalidDescriptorEdit(format!("pkgrel is not numeric: {current}"))
    })?;
    let next = release
        .checked_add(1)
        .ok_or_else(|| ArchCiError::InvalidDescriptorEdit(format!("pkgrel {current} cannot be bumped")))?
        .to_string();
    let replaced = pkgrel_line()
        .replace(text, NoExpand(&format!("pkgrel={next}")))
        .into_owned();
    Ok((replaced, next))
}

/// Override `pkgver` and/or `pkgrel`. A new version without an explicit
/// release resets `pkgrel` to 1.
pub fn set_version(text: &str, version: Option<&str>, release: Option<&str>) -> Result<String> {
    let mut out = text.to_string();
    if let Some(version) = version {
        if !pkgver_line().is_match(&out) {
            return Err(ArchCiError::InvalidDescriptorEdit("no pkgver= line".to_string()));
        }
        out = pkgver_line()
            .replace(&out, NoExpand(&format!("pkgver={version}")))
            .into_owned();
    }
    let release = match (version, release) {
        (_, Some(release)) => Some(release),
        (Some(_), None) => Some("1"),
        (None, None) => None,
    };
    if let Some(release) = release {
        if !pkgrel_line().is_match(&out) {
            return Err(ArchCiError::InvalidDescriptorEdit("no pkgrel= line".to_string()));
        }
        out = pkgrel_line()
            .replace(&out, NoExpand(&format!("pkgrel={release}")))
            .into_owned();
    }
    Ok(out)
}

/// Point the pinned VCS source at `value`.
///
/// Rewrites the `#tag=` or `#commit=`/`#revision=` fragment of every source
/// using that pin. Fails when no fragment was rewritten.
pub fn pin_vcs_source(text: &str, kind: VcsKind, mode: PinMode, value: &str) -> Result<String> {
    let key = match mode {
        PinMode::Tag => "tag",
        PinMode::Commit => kind.commit_key(),
        PinMode::Branch => {
            return Err(ArchCiError::InvalidDescriptorEdit(
                "branch sources cannot be pinned".to_string(),
            ))
        }
    };
    let fragment = Regex::new(&format!(r#"#{key}=[^"'\s)]*"#))
        .map_err(|e| ArchCiError::InvalidDescriptorEdit(e.to_string()))?;
    if !fragment.is_match(text) {
        return Err(ArchCiError::InvalidDescriptorEdit(format!(
            "no #{key}= fragment to pin"
        )));
    }
    Ok(fragment
        .replace_all(text, NoExpand(&format!("#{key}={value}")))
        .into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PKGBUILD: &str = r#"# Maintainer: Jane <jane@example.org>
pkgname=widget
pkgver=1.2.0
pkgrel=3
arch=('x86_64')
source=("git+https://github.com/acme/widget.git#tag=v1.2.0"
        'widget.service')
sha256sums=('SKIP' 'abc')

build() {
  pkgrel=99 make
}
"#;

    #[test]
    fn bump_increments_top_level_release_only() {
        let (text, rel) = bump_release(PKGBUILD).unwrap();
        assert_eq!(rel, "4");
        assert!(text.contains("\npkgrel=4\n"));
        assert!(text.contains("  pkgrel=99 make"));
    }

    #[test]
    fn bump_drops_subrelease() {
        let (text, rel) = bump_release("pkgver=1\npkgrel='2.1'\n").unwrap();
        assert_eq!(rel, "3");
        assert_eq!(text, "pkgver=1\npkgrel=3\n");
    }

    #[test]
    fn bump_rejects_missing_or_odd_release() {
        assert!(bump_release("pkgver=1\n").is_err());
        assert!(bump_release("pkgrel=$_rel\n").is_err());
    }

    #[test]
    fn bump_refuses_to_wrap_the_largest_release() {
        let err = bump_release("pkgrel=4294967295\n").unwrap_err();
        assert!(matches!(err, ArchCiError::InvalidDescriptorEdit(ref m) if m.contains("4294967295")));
        let (text, next) = bump_release("pkgrel=4294967294\n").unwrap();
        assert_eq!(next, "4294967295");
        assert_eq!(text, "pkgrel=4294967295\n");
    }

    #[test]
    fn set_version_resets_release() {
        let text = set_version(PKGBUILD, Some("1.3.0"), None).unwrap();
        assert!(text.contains("\npkgver=1.3.0\n"));
        assert!(text.contains("\npkgrel=1\n"));
    }

    #[test]
    fn set_release_only() {
        let text = set_version(PKGBUILD, None, Some("7")).unwrap();
        assert!(text.contains("\npkgver=1.2.0\n"));
        assert!(text.contains("\npkgrel=7\n"));
        assert_eq!(set_version(PKGBUILD, None, None).unwrap(), PKGBUILD);
    }

    #[test]
    fn pin_tag() {
        let text = pin_vcs_source(PKGBUILD, VcsKind::Git, PinMode::Tag, "v1.3.0").unwrap();
        assert!(text.contains("widget.git#tag=v1.3.0\""));
    }

    #[test]
    fn pin_commit_uses_vcs_specific_key() {
        let git = "source=(\"git+https://x.org/a.git#commit=0000\")\n";
        let pinned = pin_vcs_source(git, VcsKind::Git, PinMode::Commit, "abcd").unwrap();
        assert_eq!(pinned, "source=(\"git+https://x.org/a.git#commit=abcd\")\n");

        let hg = "source=('hg+https://x.org/a#revision=1')\n";
        let pinned = pin_vcs_source(hg, VcsKind::Hg, PinMode::Commit, "42").unwrap();
        assert_eq!(pinned, "source=('hg+https://x.org/a#revision=42')\n");
    }

    #[test]
    fn pin_without_fragment_fails() {
        let err = pin_vcs_source(PKGBUILD, VcsKind::Git, PinMode::Commit, "abc").unwrap_err();
        assert!(matches!(err, ArchCiError::InvalidDescriptorEdit(_)));
        assert!(pin_vcs_source(PKGBUILD, VcsKind::Git, PinMode::Branch, "main").is_err());
    }
}
