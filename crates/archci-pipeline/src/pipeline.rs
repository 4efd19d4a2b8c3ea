//! Sequential pipeline execution.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use archci_core::{obs, ArchCiError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::plan::plan_digest;
use crate::properties::{keys, BuildProperties};
use crate::runner::{StepOutcome, StepResult, StepRunner};
use crate::step::{Step, StepKind};

/// Named counting locks shared by every pipeline of one worker. Each name
/// admits `slots` concurrent holders.
#[derive(Debug, Clone)]
pub struct BuildLocks {
    slots: usize,
    locks: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
}

impl BuildLocks {
    pub fn new(slots: usize) -> Self {
        Self {
            slots: slots.max(1),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn semaphore(&self, name: &str) -> Arc<Semaphore> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.slots)))
            .clone()
    }

    /// Wait for a slot of `name`. The slot is released when the permit drops.
    pub async fn acquire(&self, name: &str) -> Result<OwnedSemaphorePermit> {
        self.semaphore(name)
            .acquire_owned()
            .await
            .map_err(|e| ArchCiError::StepFailed {
                step: format!("lock {name}"),
                reason: e.to_string(),
            })
    }

    /// Free slots of `name` right now.
    pub fn available(&self, name: &str) -> usize {
        self.semaphore(name).available_permits()
    }
}

impl Default for BuildLocks {
    fn default() -> Self {
        Self::new(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Pending,
    Running,
    Success,
    Failure,
}

/// Result of a complete pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub run_id: String,
    pub state: PipelineState,
    /// Executed and skipped steps in order. Steps bypassed after a halt are
    /// not listed.
    pub steps: Vec<StepResult>,
    /// First step whose failure failed the build.
    pub failed_step: Option<String>,
    pub duration_ms: u64,
    pub plan_digest: String,
    pub started_at: DateTime<Utc>,
}

impl PipelineResult {
    pub fn success(&self) -> bool {
        self.state == PipelineState::Success
    }

    pub fn passed_count(&self) -> usize {
        self.steps.iter().filter(|s| s.passed()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.outcome == StepOutcome::Failure)
            .count()
    }

    pub fn skipped_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.outcome == StepOutcome::Skipped)
            .count()
    }

    /// Result of the first failed step, for reporting its output.
    pub fn first_failure(&self) -> Option<&StepResult> {
        let name = self.failed_step.as_deref()?;
        self.steps.iter().find(|s| s.step_name == name)
    }
}

/// Runs an assembled step list against one property bag.
#[derive(Clone)]
pub struct PipelineRunner {
    runner: StepRunner,
    locks: BuildLocks,
}

impl PipelineRunner {
    pub fn new(runner: StepRunner, locks: BuildLocks) -> Self {
        Self { runner, locks }
    }

    /// Execute `steps` in order.
    ///
    /// A step whose predicate is false is recorded as skipped. A failing
    /// step with `flunk_on_failure` fails the build; with `halt_on_failure`
    /// it also stops the pipeline, after which only `always_run` steps
    /// execute.
    pub async fn run(&self, steps: &[Step], props: &mut BuildProperties) -> PipelineResult {
        let run_id = Uuid::new_v4().to_string();
        let pkg_base = seeded_pkg_base(steps)
            .or_else(|| props.get_str(keys::PKG_BASE).map(str::to_string))
            .unwrap_or_default();
        let span = obs::pipeline_span(&run_id, &pkg_base);
        self.run_steps(run_id, steps, props).instrument(span).await
    }

    async fn run_steps(
        &self,
        run_id: String,
        steps: &[Step],
        props: &mut BuildProperties,
    ) -> PipelineResult {
        let start = Instant::now();
        let started_at = Utc::now();
        obs::emit_pipeline_started(&run_id, steps.len());

        let mut state = PipelineState::Running;
        let mut halted = false;
        let mut failed_step = None;
        let mut results = Vec::with_capacity(steps.len());

        for step in steps {
            if halted && !step.always_run {
                continue;
            }
            if !step.should_run(props) {
                info!(step = %step.name, "skipping step");
                let result = StepResult::skipped(step);
                obs::emit_step_finished(&step.name, result.outcome.as_str(), 0);
                results.push(result);
                continue;
            }

            let step_start = Instant::now();
            let result = match self.execute_locked(step, props).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(step = %step.name, error = %e, "step raised an error");
                    StepResult::errored(step, &e, step_start.elapsed().as_millis() as u64)
                }
            };
            obs::emit_step_finished(&step.name, result.outcome.as_str(), result.duration_ms);

            if result.outcome == StepOutcome::Failure {
                warn!(step = %step.name, exit_code = result.exit_code, "step failed");
                if step.flunk_on_failure {
                    state = PipelineState::Failure;
                    failed_step.get_or_insert_with(|| step.name.clone());
                }
                if step.halt_on_failure {
                    halted = true;
                }
            }
            results.push(result);
        }

        if state == PipelineState::Running {
            state = PipelineState::Success;
        }
        let duration_ms = start.elapsed().as_millis() as u64;
        obs::emit_pipeline_finished(&run_id, state == PipelineState::Success, duration_ms);

        PipelineResult {
            run_id,
            state,
            steps: results,
            failed_step,
            duration_ms,
            plan_digest: plan_digest(steps),
            started_at,
        }
    }

    async fn execute_locked(&self, step: &Step, props: &mut BuildProperties) -> Result<StepResult> {
        let _permit = match &step.lock {
            Some(name) => Some(self.locks.acquire(name).await?),
            None => None,
        };
        self.runner.execute_step(step, props).await
    }
}

/// `pkg_base` from a leading seed step, which has not run yet.
fn seeded_pkg_base(steps: &[Step]) -> Option<String> {
    match &steps.first()?.kind {
        StepKind::SetProperties { properties } => {
            properties.get_str(keys::PKG_BASE).map(str::to_string)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::ScriptedExecutor;
    use crate::step::Condition;
    use std::time::Duration;

    fn shell(name: &str, program: &str) -> Step {
        Step::new(
            name,
            StepKind::Shell {
                argv: vec![program.to_string()],
            },
        )
    }

    fn pipeline(executor: Arc<ScriptedExecutor>) -> PipelineRunner {
        PipelineRunner::new(StepRunner::new(executor), BuildLocks::default())
    }

    fn names(result: &PipelineResult) -> Vec<&str> {
        result.steps.iter().map(|s| s.step_name.as_str()).collect()
    }

    #[tokio::test]
    async fn all_steps_pass() {
        let executor = Arc::new(ScriptedExecutor::new());
        let steps = vec![shell("one", "a"), shell("two", "b")];
        let result = pipeline(executor.clone()).run(&steps, &mut BuildProperties::new()).await;
        assert!(result.success());
        assert_eq!(result.passed_count(), 2);
        assert_eq!(executor.programs(), vec!["a", "b"]);
        assert_eq!(result.plan_digest, plan_digest(&steps));
    }

    #[tokio::test]
    async fn halt_skips_remaining_steps_except_always_run() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.fail("b", 1);
        let steps = vec![
            shell("one", "a"),
            shell("two", "b"),
            shell("three", "c"),
            shell("cleanup", "d").always_run(),
        ];
        let result = pipeline(executor.clone()).run(&steps, &mut BuildProperties::new()).await;

        assert_eq!(result.state, PipelineState::Failure);
        assert_eq!(result.failed_step.as_deref(), Some("two"));
        assert_eq!(result.first_failure().unwrap().exit_code, 1);
        assert_eq!(names(&result), vec!["one", "two", "cleanup"]);
        assert_eq!(executor.programs(), vec!["a", "b", "d"]);
    }

    #[tokio::test]
    async fn warn_only_failure_keeps_going() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.fail("b", 1);
        let steps = vec![shell("one", "b").warn_only(), shell("two", "c")];
        let result = pipeline(executor).run(&steps, &mut BuildProperties::new()).await;
        assert!(result.success());
        assert_eq!(result.failed_count(), 1);
        assert!(result.failed_step.is_none());
    }

    #[tokio::test]
    async fn false_predicate_is_recorded_as_skipped() {
        let executor = Arc::new(ScriptedExecutor::new());
        let steps = vec![
            shell("maybe", "a").run_if(Condition::property_true("flag")),
            shell("always", "b"),
        ];
        let result = pipeline(executor.clone()).run(&steps, &mut BuildProperties::new()).await;
        assert!(result.success());
        assert_eq!(result.skipped_count(), 1);
        assert_eq!(executor.programs(), vec!["b"]);
    }

    #[tokio::test]
    async fn step_errors_become_failures() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.fail_to_spawn("a");
        let steps = vec![shell("broken", "a"), shell("next", "b")];
        let result = pipeline(executor).run(&steps, &mut BuildProperties::new()).await;
        assert_eq!(result.state, PipelineState::Failure);
        let failure = result.first_failure().unwrap();
        assert_eq!(failure.exit_code, -1);
        assert!(failure.stderr.contains("not found"));
        assert_eq!(names(&result), vec!["broken"]);
    }

    #[tokio::test]
    async fn predicates_see_earlier_property_writes() {
        let executor = Arc::new(ScriptedExecutor::new());
        let steps = vec![
            Step::new(
                "enable",
                StepKind::SetProperty {
                    key: "flag".to_string(),
                    value: true.into(),
                },
            ),
            shell("gated", "a").run_if(Condition::property_true("flag")),
        ];
        let result = pipeline(executor.clone()).run(&steps, &mut BuildProperties::new()).await;
        assert_eq!(result.skipped_count(), 0);
        assert_eq!(executor.programs(), vec!["a"]);
    }

    #[tokio::test]
    async fn named_lock_limits_concurrency() {
        let locks = BuildLocks::new(1);
        let held = locks.acquire("archbuild").await.unwrap();
        assert_eq!(locks.available("archbuild"), 0);
        assert_eq!(locks.available("other"), 1);

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _permit = locks.acquire("archbuild").await.unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.unwrap();
        assert_eq!(locks.available("archbuild"), 1);
    }

    #[tokio::test]
    async fn lock_is_released_after_step() {
        let executor = Arc::new(ScriptedExecutor::new());
        let locks = BuildLocks::new(2);
        let runner = PipelineRunner::new(StepRunner::new(executor), locks.clone());
        let steps = vec![shell("build", "a").with_lock("archbuild")];
        runner.run(&steps, &mut BuildProperties::new()).await;
        assert_eq!(locks.available("archbuild"), 2);
    }
}
