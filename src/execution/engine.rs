//! Workflow Execution Engine
//!
//! The core engine that orchestrates workflow runs including:
//! - Wave-based scheduling with dependency resolution
//! - An engine-wide concurrency limit shared by every run
//! - Pause/resume between waves and cooperative cancellation
//! - An in-memory run table for status queries

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::workflow::resolver::unresolved;
use crate::workflow::validator::describe;
use crate::workflow::{
    ready_steps, validate_definition, Context, Params, StepResult, WorkflowDefinition,
    WorkflowResult, WorkflowState, WorkflowStep,
};

use super::error::{EngineError, HandlerError};
use super::registry::{ActionRegistry, StepContext};
use super::retry::run_step;

/// Default number of step attempts allowed to execute at once.
pub const DEFAULT_MAX_CONCURRENT_STEPS: usize = 4;

/// Interval for checking whether a paused run was resumed.
const PAUSE_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Size of the limiter shared by every run (clamped to at least 1)
    pub max_concurrent_steps: usize,
    /// Validate the dependency graph before the first wave
    pub validate_graph: bool,
    /// Stop retrying a step as soon as its action is found to be unknown
    pub fail_fast_unknown_actions: bool,
    /// How often a paused run checks for resume
    pub pause_poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_steps: DEFAULT_MAX_CONCURRENT_STEPS,
            validate_graph: false,
            fail_fast_unknown_actions: false,
            pause_poll_interval: PAUSE_CHECK_INTERVAL,
        }
    }
}

impl EngineConfig {
    /// Creates a config with the given concurrency limit.
    pub fn new(max_concurrent_steps: usize) -> Self {
        Self {
            max_concurrent_steps,
            ..Self::default()
        }
    }

    /// Enables or disables up-front graph validation.
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.validate_graph = enabled;
        self
    }

    /// Enables or disables fail-fast handling of unknown actions.
    pub fn with_fail_fast_unknown_actions(mut self, enabled: bool) -> Self {
        self.fail_fast_unknown_actions = enabled;
        self
    }

    /// Sets the pause polling interval.
    pub fn with_pause_poll_interval(mut self, interval: Duration) -> Self {
        self.pause_poll_interval = interval;
        self
    }
}

/// One tracked run.
struct RunEntry {
    result: WorkflowResult,
    cancellation: CancellationToken,
    /// Set once the scheduling loop has stopped touching the record
    finished: bool,
}

/// How the wave loop ended.
#[derive(Debug, Default)]
struct WaveOutcome {
    failed: usize,
    deadlock: Option<Vec<String>>,
}

struct EngineInner {
    config: EngineConfig,
    registry: Arc<ActionRegistry>,
    limiter: Arc<Semaphore>,
    runs: Mutex<HashMap<String, RunEntry>>,
}

/// Workflow execution engine.
///
/// Cloning is cheap; clones share the registry, the limiter and the run table,
/// so one clone can drive `execute` while another pauses or cancels.
///
/// # Example
///
/// ```rust,no_run
/// use serde_json::Value;
/// use waverunner::execution::{Engine, HandlerError, StepContext};
/// use waverunner::workflow::{Context, Params, WorkflowDefinition, WorkflowStep};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let engine = Engine::new(4);
///     engine.register("hello", |_params: Params, ctx: StepContext| async move {
///         Ok::<_, HandlerError>(Value::from(format!("hello from {}", ctx.step_id)))
///     });
///
///     let definition = WorkflowDefinition::from_steps(
///         "greeting",
///         vec![
///             WorkflowStep::new("first", "hello"),
///             WorkflowStep::new("second", "hello").depends_on("first"),
///         ],
///     );
///
///     let result = engine.execute(&definition, Context::new()).await?;
///     println!("{}: {}", result.workflow_id, result.state);
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::with_config(EngineConfig::default())
    }
}

impl Engine {
    /// Creates an engine with an empty registry and the given limit.
    pub fn new(max_concurrent_steps: usize) -> Self {
        Self::with_config(EngineConfig::new(max_concurrent_steps))
    }

    /// Creates an engine from a config with an empty registry.
    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_registry(config, Arc::new(ActionRegistry::new()))
    }

    /// Creates an engine that resolves actions against an existing registry.
    pub fn with_registry(mut config: EngineConfig, registry: Arc<ActionRegistry>) -> Self {
        config.max_concurrent_steps = config.max_concurrent_steps.max(1);
        let limiter = Arc::new(Semaphore::new(config.max_concurrent_steps));

        Self {
            inner: Arc::new(EngineInner {
                config,
                registry,
                limiter,
                runs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns the engine settings.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Returns the action registry.
    pub fn registry(&self) -> &ActionRegistry {
        &self.inner.registry
    }

    /// Registers an action handler. See [`ActionRegistry::register`].
    pub fn register<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Params, StepContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<serde_json::Value, HandlerError>>
            + Send
            + 'static,
    {
        self.inner.registry.register(name, handler);
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<String, RunEntry>> {
        self.inner.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Executes a workflow to a terminal state.
    ///
    /// Step failures, deadlocks and cancellation are reported through the
    /// returned record. `Err` is reserved for rejected submissions and for
    /// step tasks that panicked or were aborted.
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        context: Context,
    ) -> Result<WorkflowResult, EngineError> {
        let workflow_id = definition.workflow_id.clone();
        let cancellation = self.register_run(definition)?;

        info!(
            "Starting workflow '{}' ({} steps, max concurrent steps: {})",
            workflow_id,
            definition.steps.len(),
            self.inner.config.max_concurrent_steps
        );

        if self.inner.config.validate_graph {
            if let Err(errors) = validate_definition(definition) {
                let message = format!("Invalid workflow definition: {}", describe(&errors));
                error!("Workflow '{}' rejected: {}", workflow_id, message);
                return self.finalize(&workflow_id, Some(message), WaveOutcome::default());
            }
        }

        let vars = Arc::new(context);
        match self.run_waves(definition, &vars, &cancellation).await {
            Ok(outcome) => self.finalize(&workflow_id, None, outcome),
            Err(message) => {
                self.finalize(&workflow_id, Some(message.clone()), WaveOutcome::default())?;
                Err(EngineError::StepTask {
                    workflow_id,
                    message,
                })
            }
        }
    }

    /// Runs a single step with retries outside of any workflow.
    ///
    /// The step still takes slots from the engine-wide limiter.
    pub async fn execute_step(&self, step: &WorkflowStep, context: Context) -> StepResult {
        let ctx = StepContext::new("", step.step_id.clone(), context);
        run_step(
            step,
            ctx,
            &self.inner.registry,
            &self.inner.limiter,
            self.inner.config.fail_fast_unknown_actions,
        )
        .await
    }

    /// Creates the run record, rejecting ids whose previous run is still going.
    fn register_run(&self, definition: &WorkflowDefinition) -> Result<CancellationToken, EngineError> {
        let mut runs = self.runs();

        if let Some(existing) = runs.get(&definition.workflow_id) {
            if !existing.finished {
                warn!(
                    "Rejecting workflow '{}': a run with this id is still {}",
                    definition.workflow_id, existing.result.state
                );
                return Err(EngineError::AlreadyRunning(definition.workflow_id.clone()));
            }
            debug!("Replacing finished run record for '{}'", definition.workflow_id);
        }

        let mut result = WorkflowResult::new(definition);
        result.state = WorkflowState::Running;
        result.started_at = Some(Utc::now());

        let cancellation = CancellationToken::new();
        runs.insert(
            definition.workflow_id.clone(),
            RunEntry {
                result,
                cancellation: cancellation.clone(),
                finished: false,
            },
        );

        Ok(cancellation)
    }

    /// Schedules waves until every step is resolved, the run stops, or no
    /// step can make progress.
    ///
    /// Returns the text of the first join error if a step task died.
    async fn run_waves(
        &self,
        definition: &WorkflowDefinition,
        vars: &Arc<Context>,
        cancellation: &CancellationToken,
    ) -> Result<WaveOutcome, String> {
        let workflow_id = &definition.workflow_id;
        // Steps sharing an id are resolved together
        let total = definition
            .steps
            .iter()
            .map(|step| step.step_id.as_str())
            .collect::<HashSet<_>>()
            .len();
        let mut completed: HashSet<String> = HashSet::new();
        let mut failed: HashSet<String> = HashSet::new();
        let mut wave = 0usize;

        while completed.len() + failed.len() < total {
            if !self.wait_while_paused(workflow_id, cancellation).await {
                info!("Workflow '{}' stopped before wave {}", workflow_id, wave + 1);
                break;
            }

            let ready = ready_steps(&definition.steps, &completed, &failed);
            if ready.is_empty() {
                let pending = unresolved(&definition.steps, &completed, &failed);
                warn!(
                    "Deadlock detected in workflow '{}': no runnable steps, unresolved: {}",
                    workflow_id,
                    pending.join(", ")
                );
                return Ok(WaveOutcome {
                    failed: failed.len(),
                    deadlock: Some(pending),
                });
            }

            wave += 1;
            info!(
                "Workflow '{}' wave {}: {} step(s)",
                workflow_id,
                wave,
                ready.len()
            );

            let mut tasks = JoinSet::new();
            for step in ready {
                info!("Starting step: {}", step.step_id);

                let step = step.clone();
                let ctx = StepContext {
                    workflow_id: workflow_id.clone(),
                    step_id: step.step_id.clone(),
                    vars: Arc::clone(vars),
                    cancellation: cancellation.clone(),
                };
                let registry = Arc::clone(&self.inner.registry);
                let limiter = Arc::clone(&self.inner.limiter);
                let fail_fast = self.inner.config.fail_fast_unknown_actions;

                tasks.spawn(async move {
                    run_step(&step, ctx, &registry, &limiter, fail_fast).await
                });
            }

            let mut results = Vec::with_capacity(tasks.len());
            let mut task_error: Option<String> = None;
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(result) => results.push(result),
                    Err(e) => {
                        error!("Step task in workflow '{}' failed: {}", workflow_id, e);
                        task_error.get_or_insert_with(|| e.to_string());
                    }
                }
            }

            let stop = self.fold_wave(definition, results, &mut completed, &mut failed);

            if let Some(message) = task_error {
                return Err(message);
            }
            if stop {
                break;
            }
        }

        Ok(WaveOutcome {
            failed: failed.len(),
            deadlock: None,
        })
    }

    /// Records one wave's results. Returns true when no further wave may run.
    fn fold_wave(
        &self,
        definition: &WorkflowDefinition,
        results: Vec<StepResult>,
        completed: &mut HashSet<String>,
        failed: &mut HashSet<String>,
    ) -> bool {
        let mut runs = self.runs();
        let mut entry = runs.get_mut(&definition.workflow_id);
        let mut stop = false;

        for result in results {
            if result.succeeded() {
                info!(
                    "Step '{}' completed successfully ({} ms)",
                    result.step_id, result.duration_ms
                );
                completed.insert(result.step_id.clone());
            } else {
                let message = result.error.clone().unwrap_or_default();
                error!("Step '{}' failed: {}", result.step_id, message);
                failed.insert(result.step_id.clone());

                if !definition.continue_on_error {
                    stop = true;
                    if let Some(entry) = entry.as_mut() {
                        if entry.result.state.is_active() {
                            entry.result.state = WorkflowState::Failed;
                            entry
                                .result
                                .set_error(format!("Step '{}' failed: {}", result.step_id, message));
                        }
                    }
                }
            }

            if let Some(entry) = entry.as_mut() {
                entry.result.steps.push(result);
            }
        }

        stop
    }

    /// Holds the loop while the run is paused.
    ///
    /// Returns false once the run was cancelled or left the active states.
    async fn wait_while_paused(&self, workflow_id: &str, cancellation: &CancellationToken) -> bool {
        let mut announced = false;

        loop {
            if cancellation.is_cancelled() {
                return false;
            }

            match self.state_of(workflow_id) {
                Some(WorkflowState::Paused) => {
                    if !announced {
                        info!("Workflow '{}' paused - waiting for resume", workflow_id);
                        announced = true;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(self.inner.config.pause_poll_interval) => {}
                        _ = cancellation.cancelled() => return false,
                    }
                }
                Some(state) if state.is_active() => {
                    if announced {
                        info!("Workflow '{}' resumed", workflow_id);
                    }
                    return true;
                }
                _ => return false,
            }
        }
    }

    fn state_of(&self, workflow_id: &str) -> Option<WorkflowState> {
        self.runs().get(workflow_id).map(|entry| entry.result.state)
    }

    /// Settles the final state and timestamps, then releases the record.
    fn finalize(
        &self,
        workflow_id: &str,
        forced_error: Option<String>,
        outcome: WaveOutcome,
    ) -> Result<WorkflowResult, EngineError> {
        let mut runs = self.runs();
        let entry = runs
            .get_mut(workflow_id)
            .ok_or_else(|| EngineError::UnknownRun(workflow_id.to_string()))?;
        let record = &mut entry.result;

        if record.state.is_active() {
            if let Some(message) = forced_error {
                record.state = WorkflowState::Failed;
                record.set_error(message);
            } else if let Some(pending) = outcome.deadlock {
                record.state = WorkflowState::Failed;
                record.set_error(format!(
                    "Deadlock detected: no runnable steps, unresolved: {}",
                    pending.join(", ")
                ));
            } else if outcome.failed > 0 {
                record.state = WorkflowState::Failed;
                record.set_error(format!("{} step(s) failed", outcome.failed));
            } else {
                record.state = WorkflowState::Completed;
            }
        }

        record.mark_finished(Utc::now());
        entry.finished = true;

        match record.state {
            WorkflowState::Completed => info!(
                "Workflow '{}' completed ({} steps, {} ms)",
                workflow_id,
                record.steps.len(),
                record.duration_ms.unwrap_or(0)
            ),
            WorkflowState::Cancelled => info!("Workflow '{}' cancelled", workflow_id),
            state => error!(
                "Workflow '{}' {}: {}",
                workflow_id,
                state,
                record.error.as_deref().unwrap_or("no error recorded")
            ),
        }

        Ok(record.clone())
    }

    /// Pauses a running workflow. The current wave finishes; the next one
    /// waits for [`Engine::resume`].
    pub fn pause(&self, workflow_id: &str) -> bool {
        let mut runs = self.runs();
        match runs.get_mut(workflow_id) {
            Some(entry) if entry.result.state == WorkflowState::Running => {
                entry.result.state = WorkflowState::Paused;
                info!("Pause requested for workflow '{}'", workflow_id);
                true
            }
            _ => false,
        }
    }

    /// Resumes a paused workflow.
    pub fn resume(&self, workflow_id: &str) -> bool {
        let mut runs = self.runs();
        match runs.get_mut(workflow_id) {
            Some(entry) if entry.result.state == WorkflowState::Paused => {
                entry.result.state = WorkflowState::Running;
                info!("Resume requested for workflow '{}'", workflow_id);
                true
            }
            _ => false,
        }
    }

    /// Cancels a running or paused workflow.
    ///
    /// No further waves or attempts start; handlers watching the
    /// cancellation token may stop early.
    pub fn cancel(&self, workflow_id: &str) -> bool {
        let mut runs = self.runs();
        match runs.get_mut(workflow_id) {
            Some(entry) if entry.result.state.is_active() => {
                entry.result.state = WorkflowState::Cancelled;
                entry.result.mark_finished(Utc::now());
                entry.cancellation.cancel();
                info!("Cancelled workflow '{}'", workflow_id);
                true
            }
            _ => false,
        }
    }

    /// Returns a snapshot of a run record.
    pub fn get_status(&self, workflow_id: &str) -> Option<WorkflowResult> {
        self.runs().get(workflow_id).map(|entry| entry.result.clone())
    }

    /// Lists run records, most recently started first.
    pub fn list(&self, state: Option<WorkflowState>, limit: usize) -> Vec<WorkflowResult> {
        let mut results: Vec<WorkflowResult> = self
            .runs()
            .values()
            .filter(|entry| state.map_or(true, |s| entry.result.state == s))
            .map(|entry| entry.result.clone())
            .collect();

        results.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        results.truncate(limit);
        results
    }

    /// Removes a finished run record. Runs still in flight are kept.
    pub fn evict(&self, workflow_id: &str) -> Option<WorkflowResult> {
        let mut runs = self.runs();
        if !runs.get(workflow_id).is_some_and(|entry| entry.finished) {
            return None;
        }
        runs.remove(workflow_id).map(|entry| {
            debug!("Evicted run record for '{}'", workflow_id);
            entry.result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::StepState;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn test_engine(max_concurrent_steps: usize) -> Engine {
        test_engine_with(EngineConfig::new(max_concurrent_steps))
    }

    fn test_engine_with(config: EngineConfig) -> Engine {
        let engine = Engine::with_config(config.with_pause_poll_interval(Duration::from_millis(10)));

        engine.register("ok", |_params: Params, ctx: StepContext| async move {
            Ok::<_, HandlerError>(Value::from(ctx.step_id))
        });
        engine.register("fail", |params: Params, _ctx: StepContext| async move {
            let message = params
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("boom")
                .to_string();
            Err::<Value, HandlerError>(message.into())
        });
        engine.register("sleep_ms", |params: Params, ctx: StepContext| async move {
            let ms = params.get("ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok::<_, HandlerError>(Value::Null),
                _ = ctx.cancellation.cancelled() => Err("interrupted".into()),
            }
        });
        engine.register("inspect", |params: Params, ctx: StepContext| async move {
            Ok::<_, HandlerError>(serde_json::json!({
                "workflow_id": ctx.workflow_id,
                "env": ctx.get("env").cloned(),
                "target": params.get("target").cloned(),
            }))
        });
        engine.register("explode", |params: Params, _ctx: StepContext| async move {
            if params.contains_key("now") {
                panic!("handler exploded");
            }
            Ok::<_, HandlerError>(Value::Null)
        });

        engine
    }

    fn step_ids(result: &WorkflowResult) -> Vec<&str> {
        result.steps.iter().map(|s| s.step_id.as_str()).collect()
    }

    async fn wait_for_state(engine: &Engine, workflow_id: &str, state: WorkflowState) {
        for _ in 0..500 {
            if engine.get_status(workflow_id).map(|r| r.state) == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("workflow '{workflow_id}' never reached {state}");
    }

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_steps, 4);
        assert!(!config.validate_graph);
        assert!(!config.fail_fast_unknown_actions);
        assert_eq!(config.pause_poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_engine_clamps_concurrency() {
        let engine = Engine::new(0);
        assert_eq!(engine.config().max_concurrent_steps, 1);
    }

    #[tokio::test]
    async fn test_linear_chain() {
        let engine = test_engine(4);
        let definition = WorkflowDefinition::from_steps(
            "linear",
            vec![
                WorkflowStep::new("a", "ok"),
                WorkflowStep::new("b", "ok").depends_on("a"),
                WorkflowStep::new("c", "ok").depends_on("b"),
            ],
        );

        let result = engine.execute(&definition, Context::new()).await.unwrap();

        assert_eq!(result.state, WorkflowState::Completed);
        assert_eq!(step_ids(&result), vec!["a", "b", "c"]);
        assert!(result.error.is_none());
        assert!(result.completed_at.is_some());
        assert!(result.duration_ms.is_some());
        assert_eq!(result.step("b").unwrap().output, Some(Value::from("b")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fan_out_waits_for_root() {
        let engine = test_engine(2);
        let definition = WorkflowDefinition::from_steps(
            "fan_out",
            vec![
                WorkflowStep::new("step1", "sleep_ms").with_param("ms", 30),
                WorkflowStep::new("step2", "sleep_ms")
                    .with_param("ms", 10)
                    .depends_on("step1"),
                WorkflowStep::new("step3", "sleep_ms")
                    .with_param("ms", 10)
                    .depends_on("step1"),
            ],
        );

        let result = engine.execute(&definition, Context::new()).await.unwrap();

        assert_eq!(result.state, WorkflowState::Completed);
        assert_eq!(result.steps[0].step_id, "step1");
        let root_done = result.steps[0].completed_at;
        for later in &result.steps[1..] {
            assert!(later.started_at >= root_done);
        }
    }

    #[tokio::test]
    async fn test_skip_on_failure() {
        let engine = test_engine(4);
        let definition = WorkflowDefinition::from_steps(
            "skip",
            vec![
                WorkflowStep::new("step1", "fail"),
                WorkflowStep::new("step2", "ok")
                    .depends_on("step1")
                    .skip_on_failure(),
                WorkflowStep::new("step3", "ok").depends_on("step1"),
            ],
        )
        .continue_on_error(true);

        let result = engine.execute(&definition, Context::new()).await.unwrap();

        assert_eq!(result.state, WorkflowState::Failed);
        assert_eq!(result.step("step1").unwrap().state, StepState::Failed);
        assert_eq!(result.step("step2").unwrap().state, StepState::Completed);
        assert!(result.step("step3").is_none());
        assert!(result.error.unwrap().contains("Deadlock"));
    }

    #[tokio::test]
    async fn test_continue_on_error_without_deadlock() {
        let engine = test_engine(4);
        let definition = WorkflowDefinition::from_steps(
            "independent",
            vec![WorkflowStep::new("bad", "fail"), WorkflowStep::new("good", "ok")],
        )
        .continue_on_error(true);

        let result = engine.execute(&definition, Context::new()).await.unwrap();

        assert_eq!(result.state, WorkflowState::Failed);
        assert_eq!(result.steps.len(), 2);
        assert_eq!(result.error.as_deref(), Some("1 step(s) failed"));
    }

    #[tokio::test]
    async fn test_retry_backoff_through_engine() {
        let engine = test_engine(2);
        let definition = WorkflowDefinition::from_steps(
            "retry",
            vec![WorkflowStep::new("flaky", "fail").with_retry(2, 1.0)],
        );

        let start = Instant::now();
        let result = engine.execute(&definition, Context::new()).await.unwrap();

        assert!(start.elapsed() >= Duration::from_secs(3));
        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.steps[0].state, StepState::Failed);
        assert_eq!(result.steps[0].retry_count, 2);
        assert_eq!(result.steps[0].error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_step_timeout() {
        let engine = test_engine(2);
        let definition = WorkflowDefinition::from_steps(
            "timeout",
            vec![WorkflowStep::new("slow", "sleep_ms")
                .with_param("ms", 2000)
                .with_timeout(0.05)],
        );

        let result = engine.execute(&definition, Context::new()).await.unwrap();

        assert_eq!(result.state, WorkflowState::Failed);
        assert!(result.steps[0].error.as_ref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_stop_on_error_finishes_wave() {
        let engine = test_engine(4);
        let definition = WorkflowDefinition::from_steps(
            "stop",
            vec![
                WorkflowStep::new("bad", "fail").with_param("message", "disk full"),
                WorkflowStep::new("slow", "sleep_ms").with_param("ms", 50),
                WorkflowStep::new("after", "ok").depends_on("slow"),
            ],
        );

        let result = engine.execute(&definition, Context::new()).await.unwrap();

        assert_eq!(result.state, WorkflowState::Failed);
        assert_eq!(result.steps.len(), 2);
        assert!(result.step("slow").unwrap().succeeded());
        assert!(result.step("after").is_none());
        assert_eq!(result.error.as_deref(), Some("Step 'bad' failed: disk full"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_running_workflow() {
        let engine = test_engine(2);
        let definition = WorkflowDefinition::from_steps(
            "cancel_me",
            vec![
                WorkflowStep::new("long", "sleep_ms").with_param("ms", 10_000),
                WorkflowStep::new("never", "ok").depends_on("long"),
            ],
        );

        let runner = engine.clone();
        let handle = tokio::spawn(async move { runner.execute(&definition, Context::new()).await });

        wait_for_state(&engine, "cancel_me", WorkflowState::Running).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(engine.cancel("cancel_me"));
        assert!(!engine.cancel("cancel_me"));
        assert!(!engine.pause("cancel_me"));

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.state, WorkflowState::Cancelled);
        assert!(result.completed_at.is_some());
        assert!(result.step("never").is_none());
        assert_eq!(result.step("long").unwrap().state, StepState::Failed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pause_holds_next_wave() {
        let engine = test_engine(2);
        let definition = WorkflowDefinition::from_steps(
            "pausable",
            vec![
                WorkflowStep::new("first", "sleep_ms").with_param("ms", 150),
                WorkflowStep::new("second", "ok").depends_on("first"),
            ],
        );

        let runner = engine.clone();
        let handle = tokio::spawn(async move { runner.execute(&definition, Context::new()).await });

        wait_for_state(&engine, "pausable", WorkflowState::Running).await;
        assert!(!engine.resume("pausable"));
        assert!(engine.pause("pausable"));
        assert!(!engine.pause("pausable"));

        tokio::time::sleep(Duration::from_millis(400)).await;
        let paused = engine.get_status("pausable").unwrap();
        assert_eq!(paused.state, WorkflowState::Paused);
        assert_eq!(step_ids(&paused), vec!["first"]);

        assert!(engine.resume("pausable"));
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.state, WorkflowState::Completed);
        assert_eq!(step_ids(&result), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_control_unknown_ids() {
        let engine = test_engine(1);
        assert!(!engine.pause("ghost"));
        assert!(!engine.resume("ghost"));
        assert!(!engine.cancel("ghost"));
        assert!(engine.get_status("ghost").is_none());
        assert!(engine.evict("ghost").is_none());
    }

    #[tokio::test]
    async fn test_unknown_action_retried_by_default() {
        let engine = test_engine(1);
        let definition = WorkflowDefinition::from_steps(
            "unknown",
            vec![WorkflowStep::new("s", "nope").with_retry(1, 0.01)],
        );

        let result = engine.execute(&definition, Context::new()).await.unwrap();

        assert_eq!(result.state, WorkflowState::Failed);
        assert_eq!(result.steps[0].retry_count, 1);
        assert_eq!(result.steps[0].error.as_deref(), Some("Unknown action: nope"));
    }

    #[tokio::test]
    async fn test_unknown_action_fail_fast() {
        let engine = test_engine_with(EngineConfig::new(1).with_fail_fast_unknown_actions(true));
        let definition = WorkflowDefinition::from_steps(
            "unknown_fast",
            vec![WorkflowStep::new("s", "nope").with_retry(3, 1.0)],
        );

        let start = Instant::now();
        let result = engine.execute(&definition, Context::new()).await.unwrap();

        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(result.steps[0].retry_count, 0);
    }

    #[tokio::test]
    async fn test_context_and_params_reach_handler() {
        let engine = test_engine(1);
        let definition = WorkflowDefinition::from_steps(
            "ctx",
            vec![WorkflowStep::new("look", "inspect").with_param("target", "eu-west")],
        );
        let mut context = Context::new();
        context.insert("env".to_string(), Value::from("staging"));

        let result = engine.execute(&definition, context).await.unwrap();

        let output = result.steps[0].output.clone().unwrap();
        assert_eq!(output["workflow_id"], "ctx");
        assert_eq!(output["env"], "staging");
        assert_eq!(output["target"], "eu-west");
    }

    #[tokio::test]
    async fn test_cycle_deadlocks_without_validation() {
        let engine = test_engine(1);
        let definition = WorkflowDefinition::from_steps(
            "cycle",
            vec![
                WorkflowStep::new("a", "ok").depends_on("b"),
                WorkflowStep::new("b", "ok").depends_on("a"),
            ],
        );

        let result = engine.execute(&definition, Context::new()).await.unwrap();

        assert_eq!(result.state, WorkflowState::Failed);
        assert!(result.steps.is_empty());
        let error = result.error.unwrap();
        assert!(error.starts_with("Deadlock detected"));
        assert!(error.contains("a, b"));
    }

    #[tokio::test]
    async fn test_validate_graph_rejects_cycle() {
        let engine = test_engine_with(EngineConfig::new(1).with_validation(true));
        let definition = WorkflowDefinition::from_steps(
            "cycle",
            vec![
                WorkflowStep::new("a", "ok").depends_on("b"),
                WorkflowStep::new("b", "ok").depends_on("a"),
            ],
        );

        let result = engine.execute(&definition, Context::new()).await.unwrap();

        assert_eq!(result.state, WorkflowState::Failed);
        assert!(result.steps.is_empty());
        assert!(result
            .error
            .unwrap()
            .starts_with("Invalid workflow definition"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_duplicate_submission_rejected() {
        let engine = test_engine(2);
        let definition = WorkflowDefinition::from_steps(
            "dup",
            vec![WorkflowStep::new("long", "sleep_ms").with_param("ms", 10_000)],
        );

        let runner = engine.clone();
        let first = definition.clone();
        let handle = tokio::spawn(async move { runner.execute(&first, Context::new()).await });
        wait_for_state(&engine, "dup", WorkflowState::Running).await;

        let second = engine.execute(&definition, Context::new()).await;
        assert!(matches!(second, Err(EngineError::AlreadyRunning(id)) if id == "dup"));

        assert!(engine.cancel("dup"));
        handle.await.unwrap().unwrap();

        // A finished record is replaced by a new run
        let quick = WorkflowDefinition::from_steps("dup", vec![WorkflowStep::new("s", "ok")]);
        let rerun = engine.execute(&quick, Context::new()).await.unwrap();
        assert_eq!(rerun.state, WorkflowState::Completed);
    }

    #[tokio::test]
    async fn test_list_and_evict() {
        let engine = test_engine(2);
        for (id, action) in [("one", "ok"), ("two", "fail"), ("three", "ok")] {
            let definition =
                WorkflowDefinition::from_steps(id, vec![WorkflowStep::new("s", action)]);
            engine.execute(&definition, Context::new()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let all: Vec<String> = engine.list(None, 10).into_iter().map(|r| r.workflow_id).collect();
        assert_eq!(all, vec!["three", "two", "one"]);

        let failed = engine.list(Some(WorkflowState::Failed), 10);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].workflow_id, "two");

        assert_eq!(engine.list(None, 2).len(), 2);

        let evicted = engine.evict("two").unwrap();
        assert_eq!(evicted.state, WorkflowState::Failed);
        assert!(engine.get_status("two").is_none());
        assert_eq!(engine.list(None, 10).len(), 2);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_task_error() {
        let engine = test_engine(2);
        let definition = WorkflowDefinition::from_steps(
            "panics",
            vec![WorkflowStep::new("bang", "explode").with_param("now", true)],
        );

        let err = engine.execute(&definition, Context::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::StepTask { ref workflow_id, .. } if workflow_id == "panics"));

        let record = engine.get_status("panics").unwrap();
        assert_eq!(record.state, WorkflowState::Failed);
        assert!(record.error.is_some());
        assert!(record.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_execute_step_standalone() {
        let engine = test_engine(1);
        let step = WorkflowStep::new("solo", "inspect");

        let result = engine.execute_step(&step, Context::new()).await;

        assert_eq!(result.state, StepState::Completed);
        assert_eq!(result.output.unwrap()["workflow_id"], "");
    }

    #[tokio::test]
    async fn test_empty_workflow_completes() {
        let engine = test_engine(1);
        let definition = WorkflowDefinition::new("empty");

        let result = engine.execute(&definition, Context::new()).await.unwrap();

        assert_eq!(result.state, WorkflowState::Completed);
        assert!(result.steps.is_empty());
    }

    #[tokio::test]
    async fn test_huge_timeout_means_no_limit() {
        let engine = test_engine(1);
        let step = WorkflowStep::new("s", "ok").with_timeout(1e20);
        let definition = WorkflowDefinition::from_steps("big", vec![step.clone()]);

        let result = engine.execute(&definition, Context::new()).await.unwrap();
        assert_eq!(result.state, WorkflowState::Completed);

        let standalone = engine.execute_step(&step, Context::new()).await;
        assert_eq!(standalone.state, StepState::Completed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_paused_workflow() {
        let engine = test_engine(2);
        let definition = WorkflowDefinition::from_steps(
            "held",
            vec![
                WorkflowStep::new("first", "sleep_ms").with_param("ms", 50),
                WorkflowStep::new("second", "ok").depends_on("first"),
            ],
        );

        let runner = engine.clone();
        let handle = tokio::spawn(async move { runner.execute(&definition, Context::new()).await });

        wait_for_state(&engine, "held", WorkflowState::Running).await;
        assert!(engine.pause("held"));

        // Let the first wave finish so the loop is held before the second one
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(step_ids(&engine.get_status("held").unwrap()), vec!["first"]);

        assert!(engine.cancel("held"));
        let result = handle.await.unwrap().unwrap();

        assert_eq!(result.state, WorkflowState::Cancelled);
        assert_eq!(step_ids(&result), vec!["first"]);
        assert!(result.completed_at.is_some());
        assert!(!engine.resume("held"));
        assert!(!engine.pause("held"));
    }

    #[tokio::test]
    async fn test_pause_resume_rejected_after_finish() {
        let engine = test_engine(1);
        let ok = WorkflowDefinition::from_steps("done", vec![WorkflowStep::new("s", "ok")]);
        let bad = WorkflowDefinition::from_steps("broken", vec![WorkflowStep::new("s", "fail")]);

        assert_eq!(
            engine.execute(&ok, Context::new()).await.unwrap().state,
            WorkflowState::Completed
        );
        assert_eq!(
            engine.execute(&bad, Context::new()).await.unwrap().state,
            WorkflowState::Failed
        );

        for id in ["done", "broken"] {
            assert!(!engine.pause(id));
            assert!(!engine.resume(id));
            assert!(!engine.cancel(id));
        }
        assert_eq!(engine.get_status("done").unwrap().state, WorkflowState::Completed);
    }

    #[tokio::test]
    async fn test_shared_step_ids_resolve_together() {
        let engine = test_engine(2);
        let definition = WorkflowDefinition::from_steps(
            "twins",
            vec![
                WorkflowStep::new("same", "ok"),
                WorkflowStep::new("same", "ok"),
                WorkflowStep::new("next", "ok").depends_on("same"),
            ],
        );

        let result = engine.execute(&definition, Context::new()).await.unwrap();

        assert_eq!(result.state, WorkflowState::Completed);
        assert_eq!(step_ids(&result), vec!["same", "same", "next"]);
        assert!(result.error.is_none());
    }

    fn register_gauge(engine: &Engine) -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (c, p) = (Arc::clone(&current), Arc::clone(&peak));

        engine.register("gauge", move |_params: Params, _ctx: StepContext| {
            let current = Arc::clone(&c);
            let peak = Arc::clone(&p);
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(40)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, HandlerError>(Value::Null)
            }
        });

        (current, peak)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_limiter_bounds_wave() {
        let engine = test_engine(2);
        let (_current, peak) = register_gauge(&engine);
        let steps = (0..6)
            .map(|i| WorkflowStep::new(format!("s{i}"), "gauge"))
            .collect();
        let definition = WorkflowDefinition::from_steps("wide", steps);

        let result = engine.execute(&definition, Context::new()).await.unwrap();

        assert_eq!(result.state, WorkflowState::Completed);
        assert_eq!(result.steps.len(), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_limiter_shared_across_workflows() {
        let engine = test_engine(2);
        let (_current, peak) = register_gauge(&engine);
        let left = WorkflowDefinition::from_steps(
            "left",
            (0..3).map(|i| WorkflowStep::new(format!("l{i}"), "gauge")).collect(),
        );
        let right = WorkflowDefinition::from_steps(
            "right",
            (0..3).map(|i| WorkflowStep::new(format!("r{i}"), "gauge")).collect(),
        );

        let (a, b) = tokio::join!(
            engine.execute(&left, Context::new()),
            engine.execute(&right, Context::new())
        );

        assert_eq!(a.unwrap().state, WorkflowState::Completed);
        assert_eq!(b.unwrap().state, WorkflowState::Completed);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
