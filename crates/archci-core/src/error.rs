//! Error taxonomy for ArchCI.

use std::path::PathBuf;

use archci_state::StorageError;

/// ArchCI domain errors.
#[derive(Debug, thiserror::Error)]
pub enum ArchCiError {
    /// A required descriptor field never appeared. Callers should regenerate
    /// the descriptor rather than retry the parse.
    #[error("malformed descriptor: missing required field `{field}`")]
    MalformedDescriptor { field: String },

    #[error("dependency {name} not found: no {pattern} under {}", .search_root.display())]
    DependencyNotFound {
        name: String,
        search_root: PathBuf,
        pattern: String,
    },

    #[error("failed to fetch metadata for commit {revision}: {source}")]
    CommitMetadataFetchFailed {
        revision: String,
        #[source]
        source: Box<ArchCiError>,
    },

    #[error("could not get commit tag for rev {revision}")]
    TagNotFound { revision: String },

    #[error("step '{step}' failed: {reason}")]
    StepFailed { step: String, reason: String },

    #[error("missing build property: {0}")]
    MissingProperty(String),

    #[error("invalid descriptor edit: {0}")]
    InvalidDescriptorEdit(String),

    #[error("vcs error: {0}")]
    Vcs(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("notification failed: {0}")]
    Notification(String),

    #[error("identity provider error: {0}")]
    Identity(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid search pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for ArchCI operations.
pub type Result<T> = std::result::Result<T, ArchCiError>;
