//! ArchCI State: persistence for the change poller
//!
//! This crate owns the two pieces of state that outlive a single poll:
//!
//! - `RevisionCursor`: per-branch last-seen revision of a watched repository
//! - `ChangeRecord`: one detected commit, handed to the build scheduler
//!
//! ## Key Components
//!
//! - `CursorStore` / `ChangeStore`: async storage traits
//! - `JsonFileCursorStore` / `JsonLinesChangeStore`: file-backed implementations
//! - `fakes`: in-memory implementations for tests

mod error;
pub mod fakes;
mod json_store;
pub mod storage_traits;

pub use error::StorageError;
pub use json_store::{JsonFileCursorStore, JsonLinesChangeStore};
pub use storage_traits::{
    ChangeId, ChangeRecord, ChangeStore, CursorStore, RevisionCursor, StorageResult,
};
