//! ArchCI Pipeline - build steps for Arch Linux packages
//!
//! Assembles and runs the per-package build pipeline:
//! - A shared property bag seeded from `.SRCINFO`
//! - Steps with run predicates and halt/flunk policies
//! - devtools chroot builds, publishing, signing and mirroring
//! - Named counting locks around the chroot build

pub mod assembler;
pub mod executor;
pub mod fakes;
pub mod pipeline;
pub mod plan;
pub mod properties;
pub mod runner;
pub mod step;

// Re-export key types
pub use assembler::{
    assemble, seed_properties, BuildEnvironment, BuildRequest, Channel, MirrorTarget,
    PipelineOptions,
};
pub use executor::{CommandExecutor, CommandOutput, ProcessExecutor};
pub use pipeline::{BuildLocks, PipelineResult, PipelineRunner, PipelineState};
pub use plan::{describe, plan_digest};
pub use properties::{dependency_key, keys, BuildProperties};
pub use runner::{StepOutcome, StepResult, StepRunner};
pub use step::{CommandLine, Condition, Step, StepKind};
