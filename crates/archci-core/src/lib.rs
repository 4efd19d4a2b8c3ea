//! ArchCI Core Library
//!
//! Package metadata, change detection and artifact lookup for the Arch Linux
//! package CI:
//! - `.SRCINFO` parsing and PKGBUILD edits
//! - incremental change extraction from a git repository
//! - dependency artifact resolution in the published tree

pub mod artifact;
pub mod config;
pub mod error;
pub mod fakes;
pub mod identity;
pub mod notify;
pub mod obs;
pub mod pkgbuild;
pub mod poller;
pub mod srcinfo;
pub mod telemetry;
pub mod vcs;

pub use artifact::{find_artifact, PackageExt, ResolvedArtifact};
pub use config::Config;
pub use error::{ArchCiError, Result};
pub use identity::{OpenIdClient, UserProfile};
pub use notify::{LogNotifier, Notifier, ReleaseNotice, SendmailNotifier};
pub use poller::{ChangeExtractor, ExtractorConfig};
pub use srcinfo::{PackageMetadata, PinMode, SrcinfoGenerator, VcsKind, VcsSource};
pub use telemetry::init_tracing;
pub use vcs::{GitCli, VcsBackend};

pub use archci_state::{ChangeRecord, RevisionCursor};
