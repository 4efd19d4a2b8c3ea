//! Structured observability hooks for poll and pipeline lifecycle events.
//!
//! Every emitter logs at `info!` (or `warn!` for failures) with a stable
//! `event = "..."` field so log aggregation can key on it.

use tracing::{info, warn};

/// Span carrying `run_id` and `pkg_base` for everything one pipeline logs.
///
/// ```ignore
/// runner.run_steps(steps).instrument(pipeline_span(&run_id, "zstd")).await
/// ```
pub fn pipeline_span(run_id: &str, pkg_base: &str) -> tracing::Span {
    tracing::info_span!("archci.pipeline", run_id = %run_id, pkg_base = %pkg_base)
}

/// First poll of a repository: branches recorded, nothing emitted.
pub fn emit_poll_primed(repository: &str, branches: usize) {
    info!(event = "poll.primed", repository = %repository, branches = branches);
}

pub fn emit_changes_detected(repository: &str, branch: &str, count: usize) {
    info!(
        event = "poll.changes_detected",
        repository = %repository,
        branch = %branch,
        count = count,
    );
}

pub fn emit_change_added(revision: &str, branch: &str) {
    info!(event = "poll.change_added", revision = %revision, branch = %branch);
}

pub fn emit_release_notified(category: &str, tag: &str) {
    info!(event = "poll.release_notified", category = %category, tag = %tag);
}

pub fn emit_pipeline_started(run_id: &str, steps: usize) {
    info!(event = "pipeline.started", run_id = %run_id, steps = steps);
}

/// Emit event: one step left the pipeline, with its outcome.
pub fn emit_step_finished(step: &str, outcome: &str, duration_ms: u64) {
    info!(
        event = "pipeline.step_finished",
        step = %step,
        outcome = %outcome,
        duration_ms = duration_ms,
    );
}

pub fn emit_pipeline_finished(run_id: &str, success: bool, duration_ms: u64) {
    if success {
        info!(event = "pipeline.finished", run_id = %run_id, success = true, duration_ms = duration_ms);
    } else {
        warn!(event = "pipeline.finished", run_id = %run_id, success = false, duration_ms = duration_ms);
    }
}
