//! Built-in Actions
//!
//! A small set of general-purpose handlers registered by the command line
//! host:
//! - `echo`: returns `message`, or every param when none is given
//! - `sleep`: waits `seconds`, ending early on cancellation
//! - `fail`: always errors with `message`
//! - `shell`: runs `command` through `bash -c`

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use log::{debug, error};
use serde_json::{json, Value};
use tokio::process::Command;

use super::error::HandlerError;
use super::registry::{ActionRegistry, StepContext};
use crate::workflow::Params;

/// Names of the actions installed by [`register_builtins`].
pub const BUILTIN_ACTIONS: &[&str] = &["echo", "fail", "shell", "sleep"];

/// Registers every built-in action on `registry`.
pub fn register_builtins(registry: &ActionRegistry) {
    registry.register("echo", echo);
    registry.register("sleep", sleep);
    registry.register("fail", fail);
    registry.register("shell", shell);
}

async fn echo(params: Params, ctx: StepContext) -> Result<Value, HandlerError> {
    debug!("Step '{}' echo", ctx.step_id);

    match params.get("message") {
        Some(message) => Ok(message.clone()),
        None => Ok(Value::Object(params.into_iter().collect())),
    }
}

async fn sleep(params: Params, ctx: StepContext) -> Result<Value, HandlerError> {
    let seconds = param_f64(&params, "seconds")?.unwrap_or(0.0);
    let duration = Duration::try_from_secs_f64(seconds)
        .map_err(|_| format!("Invalid sleep duration: {seconds}"))?;

    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(json!({ "slept": seconds })),
        _ = ctx.cancellation.cancelled() => Err("Sleep interrupted by cancellation".into()),
    }
}

async fn fail(params: Params, _ctx: StepContext) -> Result<Value, HandlerError> {
    let message = param_str(&params, "message")?.unwrap_or("Step failed on purpose");
    Err(message.into())
}

/// Runs `params.command` with bash, optionally inside `params.working_dir`.
///
/// Returns `{stdout, stderr, exit_code}`; a non-zero exit is an error.
async fn shell(params: Params, ctx: StepContext) -> Result<Value, HandlerError> {
    let command_text = param_str(&params, "command")?
        .ok_or("Missing required param 'command'")?
        .to_string();

    let mut command = Command::new("bash");
    command
        .arg("-c")
        .arg(&command_text)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(dir) = param_str(&params, "working_dir")? {
        command.current_dir(PathBuf::from(dir));
    }

    debug!("Step '{}' running: {}", ctx.step_id, command_text);

    let child = command
        .spawn()
        .map_err(|e| format!("Failed to spawn bash: {e}"))?;

    let output = tokio::select! {
        output = child.wait_with_output() => output?,
        _ = ctx.cancellation.cancelled() => {
            return Err("Command interrupted by cancellation".into());
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    let exit_code = output.status.code();

    if output.status.success() {
        if !stdout.trim().is_empty() {
            debug!("Step '{}' output:\n{}", ctx.step_id, stdout);
        }
        return Ok(json!({
            "stdout": stdout,
            "stderr": stderr,
            "exit_code": exit_code,
        }));
    }

    error!(
        "Step '{}' command failed with exit code: {:?}",
        ctx.step_id, exit_code
    );
    if !stderr.trim().is_empty() {
        error!("stderr:\n{}", stderr);
    }

    match exit_code {
        Some(code) => Err(format!("Command exited with status {code}").into()),
        None => Err("Command terminated by signal".into()),
    }
}

/// Reads an optional string param, rejecting other types.
fn param_str<'a>(params: &'a Params, key: &str) -> Result<Option<&'a str>, HandlerError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(format!("Param '{key}' must be a string, got {other}").into()),
    }
}

/// Reads an optional numeric param. Numeric strings are accepted.
fn param_f64(params: &Params, key: &str) -> Result<Option<f64>, HandlerError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| format!("Param '{key}' must be a number, got '{s}'").into()),
        Some(other) => Err(format!("Param '{key}' must be a number, got {other}").into()),
    }
}
