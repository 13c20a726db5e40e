//! Workflow Validation
//!
//! Optional up-front checks for workflow definitions:
//! - Step field validation
//! - Duplicate and unknown step references
//! - Dependency cycles (Kahn's algorithm)
//!
//! The engine itself only detects deadlocks while running. Callers that want
//! a distinct error for a malformed graph run [`validate_definition`] first,
//! or enable `EngineConfig::validate_graph`.

use std::collections::{HashMap, HashSet, VecDeque};

use log::{debug, info};
use thiserror::Error;

use super::model::{WorkflowDefinition, WorkflowStep};

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Step has empty or whitespace-only ID")]
    EmptyStepId,

    #[error("Duplicate step ID: '{0}'")]
    DuplicateStepId(String),

    #[error("Step '{0}' has no action specified")]
    EmptyAction(String),

    #[error("Step '{0}' depends on itself")]
    SelfDependency(String),

    #[error("Step '{step}' references unknown step '{reference}'")]
    InvalidReference { step: String, reference: String },

    #[error("Workflow contains cyclic dependencies between: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),
}

/// Validates a single step's fields.
fn validate_step(step: &WorkflowStep) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if step.step_id.trim().is_empty() {
        errors.push(ValidationError::EmptyStepId);
        return errors; // Can't validate further without ID
    }

    if step.action.trim().is_empty() {
        errors.push(ValidationError::EmptyAction(step.step_id.clone()));
    }

    if step.depends_on.iter().any(|dep| dep == &step.step_id) {
        errors.push(ValidationError::SelfDependency(step.step_id.clone()));
    }

    if step.depends_on.is_empty() {
        debug!("Step '{}' is a root step (no dependencies)", step.step_id);
    }

    errors
}

/// Validates the entire workflow structure.
///
/// Performs the following checks:
/// 1. All steps have valid fields
/// 2. No duplicate step IDs
/// 3. All references point to existing steps
/// 4. No cyclic dependencies
///
/// Structural errors are collected together; the cycle check only runs once
/// every reference resolves.
pub fn validate_definition(definition: &WorkflowDefinition) -> Result<(), Vec<ValidationError>> {
    info!(
        "Validating workflow '{}' with {} steps",
        definition.workflow_id,
        definition.steps.len()
    );

    let mut errors = Vec::new();
    let mut seen_ids: HashSet<&str> = HashSet::new();

    for step in &definition.steps {
        errors.extend(validate_step(step));

        if !step.step_id.trim().is_empty() && !seen_ids.insert(step.step_id.as_str()) {
            errors.push(ValidationError::DuplicateStepId(step.step_id.clone()));
        }
    }

    for step in &definition.steps {
        for dep in &step.depends_on {
            if !seen_ids.contains(dep.as_str()) {
                errors.push(ValidationError::InvalidReference {
                    step: step.step_id.clone(),
                    reference: dep.clone(),
                });
            }
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    let cyclic = find_cycle_members(&definition.steps);
    if !cyclic.is_empty() {
        return Err(vec![ValidationError::CyclicDependency(cyclic)]);
    }

    Ok(())
}

/// Runs Kahn's algorithm and returns the ids that never reach in-degree zero.
///
/// An empty result means the graph is acyclic. References to unknown steps
/// are ignored here.
fn find_cycle_members(steps: &[WorkflowStep]) -> Vec<String> {
    let known: HashSet<&str> = steps.iter().map(|s| s.step_id.as_str()).collect();

    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for step in steps {
        let deps: HashSet<&str> = step
            .depends_on
            .iter()
            .map(String::as_str)
            .filter(|dep| known.contains(dep))
            .collect();

        in_degree.insert(step.step_id.as_str(), deps.len());
        for dep in deps {
            dependents.entry(dep).or_default().push(step.step_id.as_str());
        }
    }

    // Start with root nodes (in-degree = 0)
    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, &degree)| degree == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut visited = 0usize;

    while let Some(current) = queue.pop_front() {
        visited += 1;

        for &successor in dependents.get(current).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(successor) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(successor);
                }
            }
        }
    }

    if visited == in_degree.len() {
        return Vec::new();
    }

    // Keep definition order for stable messages
    steps
        .iter()
        .filter(|s| in_degree.get(s.step_id.as_str()).is_some_and(|d| *d > 0))
        .map(|s| s.step_id.clone())
        .collect()
}

/// Joins validation errors into a single message.
pub fn describe(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
