//! Workflow Data Model
//!
//! Core data structures representing workflow steps, definitions and the
//! records produced while running them.
//!
//! # Example YAML Format
//!
//! ```yaml
//! workflow_id: nightly_report
//! continue_on_error: false
//! steps:
//!   - step_id: fetch
//!     action: shell
//!     params:
//!       command: curl -sf https://example.com/data.json -o data.json
//!     retry_attempts: 2
//!     retry_delay: 1.5
//!     timeout: 30
//!
//!   - step_id: summarize
//!     action: shell
//!     params:
//!       command: wc -l data.json
//!     depends_on:
//!       - fetch
//! ```

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Named arguments passed to an action handler.
pub type Params = HashMap<String, Value>;

/// Workflow-wide values shared by every step of a run.
pub type Context = HashMap<String, Value>;

/// Default backoff base in seconds.
fn default_retry_delay() -> f64 {
    1.0
}

/// Default per-attempt timeout in seconds.
fn default_timeout() -> f64 {
    300.0
}

/// A single step in a workflow.
///
/// Steps are immutable once handed to the engine. Dependencies are expressed
/// by id through `depends_on`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowStep {
    /// Unique identifier for this step within its workflow
    #[serde(alias = "id")]
    pub step_id: String,

    /// Name of the action resolved against the action registry
    pub action: String,

    /// Named arguments for the action handler
    #[serde(default)]
    pub params: Params,

    /// IDs of steps that must be resolved before this step can run
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Run even when a dependency failed
    #[serde(default)]
    pub skip_on_failure: bool,

    /// Attempts allowed after the first one
    #[serde(default)]
    pub retry_attempts: u32,

    /// Backoff base in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay: f64,

    /// Per-attempt time limit in seconds
    #[serde(default = "default_timeout")]
    pub timeout: f64,
}

impl WorkflowStep {
    /// Creates a new step with default retry and timeout settings.
    ///
    /// # Example
    ///
    /// ```
    /// use waverunner::workflow::WorkflowStep;
    ///
    /// let step = WorkflowStep::new("report", "shell")
    ///     .with_param("command", "echo done")
    ///     .depends_on("fetch")
    ///     .with_retry(2, 0.5)
    ///     .with_timeout(10.0);
    /// ```
    pub fn new(step_id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            action: action.into(),
            params: Params::new(),
            depends_on: Vec::new(),
            skip_on_failure: false,
            retry_attempts: 0,
            retry_delay: default_retry_delay(),
            timeout: default_timeout(),
        }
    }

    /// Sets a single named parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Replaces all parameters.
    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    /// Adds a dependency on another step.
    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    /// Lets the step run even when a dependency failed.
    pub fn skip_on_failure(mut self) -> Self {
        self.skip_on_failure = true;
        self
    }

    /// Sets the retry budget and the backoff base.
    pub fn with_retry(mut self, attempts: u32, delay_secs: f64) -> Self {
        self.retry_attempts = attempts;
        self.retry_delay = delay_secs;
        self
    }

    /// Sets the per-attempt timeout in seconds.
    pub fn with_timeout(mut self, secs: f64) -> Self {
        self.timeout = secs;
        self
    }

    /// Returns the per-attempt limit, or `None` when the configured value
    /// is not a positive finite number or does not fit in a `Duration`.
    pub fn attempt_timeout(&self) -> Option<Duration> {
        if self.timeout.is_finite() && self.timeout > 0.0 {
            Duration::try_from_secs_f64(self.timeout).ok()
        } else {
            None
        }
    }

    /// Total number of attempts this step may consume.
    pub fn max_attempts(&self) -> u32 {
        self.retry_attempts.saturating_add(1)
    }
}

/// A complete workflow submitted to the engine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowDefinition {
    /// Identifier the run is tracked under
    pub workflow_id: String,

    /// Ordered list of steps
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,

    /// Keep scheduling new waves after a step fails
    #[serde(default)]
    pub continue_on_error: bool,

    /// Free-form values copied into the run record
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl WorkflowDefinition {
    /// Creates an empty definition.
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            steps: Vec::new(),
            continue_on_error: false,
            metadata: HashMap::new(),
        }
    }

    /// Creates a definition from a list of steps.
    pub fn from_steps(workflow_id: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        Self {
            steps,
            ..Self::new(workflow_id)
        }
    }

    /// Sets the error policy.
    pub fn continue_on_error(mut self, value: bool) -> Self {
        self.continue_on_error = value;
        self
    }

    /// Adds a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Adds a step to the workflow.
    pub fn add_step(&mut self, step: WorkflowStep) -> Result<(), String> {
        if self.steps.iter().any(|s| s.step_id == step.step_id) {
            return Err(format!("Step '{}' already exists", step.step_id));
        }
        self.steps.push(step);
        Ok(())
    }

    /// Gets a step by ID.
    pub fn get_step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Returns steps with no dependencies (entry points).
    pub fn root_steps(&self) -> Vec<&WorkflowStep> {
        self.steps.iter().filter(|s| s.depends_on.is_empty()).collect()
    }

    /// Returns the number of steps in the workflow.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the workflow has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// State of a single step.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    /// Waiting for dependencies
    Pending,
    /// An attempt is executing
    Running,
    /// Finished successfully
    Completed,
    /// Exhausted its attempts
    Failed,
}

impl StepState {
    /// Returns true for `Completed` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// State of a workflow run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowState {
    /// Returns true once the run can no longer change state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true while the run may still schedule steps.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Terminal outcome of one step within one run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepResult {
    pub step_id: String,
    pub state: StepState,

    /// Handler result on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    /// Last failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,

    /// Attempts consumed beyond the first
    pub retry_count: u32,
}

impl StepResult {
    /// Returns true when the step completed successfully.
    pub fn succeeded(&self) -> bool {
        self.state == StepState::Completed
    }
}

/// The engine's record of one workflow run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowResult {
    pub workflow_id: String,
    pub state: WorkflowState,

    /// Step results in wave order
    #[serde(default)]
    pub steps: Vec<StepResult>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Top-level failure reason, set at most once
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl WorkflowResult {
    /// Creates a pending record for a definition.
    pub fn new(definition: &WorkflowDefinition) -> Self {
        Self {
            workflow_id: definition.workflow_id.clone(),
            state: WorkflowState::Pending,
            steps: Vec::new(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
            error: None,
            metadata: definition.metadata.clone(),
        }
    }

    /// Gets the result of a step by ID.
    pub fn step(&self, step_id: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Records the top-level error unless one is already set.
    pub fn set_error(&mut self, error: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(error.into());
        }
    }

    /// Stamps `completed_at` and `duration_ms` if not already set.
    pub fn mark_finished(&mut self, now: DateTime<Utc>) {
        if self.completed_at.is_none() {
            self.completed_at = Some(now);
        }
        if let (Some(start), Some(end)) = (self.started_at, self.completed_at) {
            self.duration_ms = Some(millis_between(start, end));
        }
    }

    /// Number of steps recorded as completed.
    pub fn completed_count(&self) -> usize {
        self.steps.iter().filter(|s| s.state == StepState::Completed).count()
    }

    /// Number of steps recorded as failed.
    pub fn failed_count(&self) -> usize {
        self.steps.iter().filter(|s| s.state == StepState::Failed).count()
    }
}

/// Non-negative milliseconds between two instants.
pub(crate) fn millis_between(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    u64::try_from((end - start).num_milliseconds()).unwrap_or(0)
}
