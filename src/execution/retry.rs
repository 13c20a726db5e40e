//! Retry Controller
//!
//! Runs one step to a terminal [`StepResult`]:
//! - one limiter slot per attempt, released before any backoff sleep
//! - per-attempt timeout
//! - exponential backoff `retry_delay * 2^attempt`, no jitter, no cap
//! - cooperative cancellation between and during backoff sleeps

use std::time::Duration;

use chrono::Utc;
use log::{debug, warn};
use serde_json::Value;
use tokio::sync::Semaphore;

use super::error::StepError;
use super::registry::{ActionRegistry, StepContext};
use crate::workflow::model::millis_between;
use crate::workflow::{StepResult, StepState, WorkflowStep};

/// Message used when a step failed without any captured error.
const NO_ERROR_CAPTURED: &str = "Maximum retries exceeded";

/// Returns the backoff before the attempt following `attempt` (0-based).
///
/// Non-positive or non-finite bases yield no delay.
pub fn backoff_delay(base_secs: f64, attempt: u32) -> Duration {
    if !base_secs.is_finite() || base_secs <= 0.0 {
        return Duration::ZERO;
    }

    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let secs = base_secs * 2f64.powi(exponent);
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Executes a step with retries, returning its terminal result.
///
/// `fail_fast_unknown` ends the loop on the first `Unknown action` failure
/// instead of spending the retry budget on it.
pub async fn run_step(
    step: &WorkflowStep,
    ctx: StepContext,
    registry: &ActionRegistry,
    limiter: &Semaphore,
    fail_fast_unknown: bool,
) -> StepResult {
    let started_at = Utc::now();
    let max_attempts = step.max_attempts();
    let mut last_error: Option<StepError> = None;
    let mut attempt: u32 = 0;

    loop {
        if ctx.is_cancelled() {
            last_error = Some(StepError::Cancelled);
            break;
        }

        match run_attempt(step, &ctx, registry, limiter).await {
            Ok(output) => {
                if attempt > 0 {
                    debug!(
                        "Step '{}' succeeded on attempt {}/{}",
                        step.step_id,
                        attempt + 1,
                        max_attempts
                    );
                }
                return finish(step, started_at, Ok(output), attempt);
            }
            Err(err) => {
                warn!(
                    "Step '{}' attempt {}/{} failed: {}",
                    step.step_id,
                    attempt + 1,
                    max_attempts,
                    err
                );

                let give_up = fail_fast_unknown && err.is_permanent();
                last_error = Some(err);

                if give_up || attempt >= step.retry_attempts {
                    break;
                }

                let delay = backoff_delay(step.retry_delay, attempt);
                debug!("Retrying step '{}' in {:.2?}", step.step_id, delay);

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = ctx.cancellation.cancelled() => {
                        last_error = Some(StepError::Cancelled);
                        break;
                    }
                }

                attempt += 1;
            }
        }
    }

    let message = last_error
        .map(|e| e.to_string())
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| NO_ERROR_CAPTURED.to_string());

    finish(step, started_at, Err(message), attempt)
}

/// Runs a single attempt while holding one limiter slot.
async fn run_attempt(
    step: &WorkflowStep,
    ctx: &StepContext,
    registry: &ActionRegistry,
    limiter: &Semaphore,
) -> Result<Value, StepError> {
    let _permit = limiter.acquire().await.map_err(|_| StepError::LimiterClosed)?;

    let handler = registry
        .resolve(&step.action)
        .ok_or_else(|| StepError::UnknownAction(step.action.clone()))?;

    let call = handler(step.params.clone(), ctx.clone());

    match step.attempt_timeout() {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(result) => result.map_err(StepError::from_handler),
            Err(_elapsed) => Err(StepError::Timeout(step.timeout)),
        },
        None => call.await.map_err(StepError::from_handler),
    }
}

fn finish(
    step: &WorkflowStep,
    started_at: chrono::DateTime<Utc>,
    outcome: Result<Value, String>,
    attempt: u32,
) -> StepResult {
    let completed_at = Utc::now();
    let (state, output, error) = match outcome {
        Ok(output) => (StepState::Completed, Some(output), None),
        Err(message) => (StepState::Failed, None, Some(message)),
    };

    StepResult {
        step_id: step.step_id.clone(),
        state,
        output,
        error,
        started_at,
        completed_at,
        duration_ms: millis_between(started_at, completed_at),
        retry_count: attempt,
    }
}
