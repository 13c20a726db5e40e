//! Dependency Resolution
//!
//! Computes which steps may run next given the steps that have already
//! completed or failed. The wave scheduler calls [`ready_steps`] once per
//! wave; [`plan_waves`] replays the same rule ahead of time for dry runs.

use std::collections::HashSet;

use log::debug;

use super::model::WorkflowStep;

/// Returns true if every dependency of `step` is satisfied.
///
/// A dependency is satisfied when it completed, or when it failed and the
/// step runs regardless of failed dependencies.
pub fn dependencies_satisfied(
    step: &WorkflowStep,
    completed: &HashSet<String>,
    failed: &HashSet<String>,
) -> bool {
    step.depends_on.iter().all(|dep| {
        completed.contains(dep) || (step.skip_on_failure && failed.contains(dep))
    })
}

/// Returns true if a failed dependency will never let `step` run.
pub fn is_blocked(step: &WorkflowStep, failed: &HashSet<String>) -> bool {
    !step.skip_on_failure && step.depends_on.iter().any(|dep| failed.contains(dep))
}

/// Returns the steps that are ready to execute.
///
/// A step is ready if:
/// - It hasn't completed or failed yet
/// - All its dependencies are satisfied
///
/// Steps are returned in definition order; callers must not rely on any
/// ordering between them.
pub fn ready_steps<'a>(
    steps: &'a [WorkflowStep],
    completed: &HashSet<String>,
    failed: &HashSet<String>,
) -> Vec<&'a WorkflowStep> {
    steps
        .iter()
        .filter(|step| !completed.contains(&step.step_id) && !failed.contains(&step.step_id))
        .filter(|step| {
            let ready = dependencies_satisfied(step, completed, failed);
            if !ready && is_blocked(step, failed) {
                debug!("Step '{}' is blocked by a failed dependency", step.step_id);
            }
            ready
        })
        .collect()
}

/// Returns the ids of steps that are neither completed nor failed.
pub fn unresolved(
    steps: &[WorkflowStep],
    completed: &HashSet<String>,
    failed: &HashSet<String>,
) -> Vec<String> {
    steps
        .iter()
        .filter(|step| !completed.contains(&step.step_id) && !failed.contains(&step.step_id))
        .map(|step| step.step_id.clone())
        .collect()
}

/// The wave sequence a workflow would follow if every step succeeded.
#[derive(Debug, Clone, PartialEq)]
pub struct WavePlan {
    /// Step ids per wave, in scheduling order
    pub waves: Vec<Vec<String>>,
    /// Steps that could never become ready (cycles or unknown dependencies)
    pub unreachable: Vec<String>,
}

impl WavePlan {
    /// Returns true when every step appears in some wave.
    pub fn is_complete(&self) -> bool {
        self.unreachable.is_empty()
    }
}

/// Plans the waves of a workflow assuming every step completes.
pub fn plan_waves(steps: &[WorkflowStep]) -> WavePlan {
    let mut completed: HashSet<String> = HashSet::new();
    let failed: HashSet<String> = HashSet::new();
    let mut waves = Vec::new();

    loop {
        let wave: Vec<String> = ready_steps(steps, &completed, &failed)
            .into_iter()
            .map(|step| step.step_id.clone())
            .collect();

        if wave.is_empty() {
            break;
        }

        completed.extend(wave.iter().cloned());
        waves.push(wave);
    }

    WavePlan {
        waves,
        unreachable: unresolved(steps, &completed, &failed),
    }
}
