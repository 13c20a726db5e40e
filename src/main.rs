//! WaveRunner CLI Entry Point
//!
//! Provides command-line interface for workflow execution.
//!
//! # Usage
//!
//! ```bash
//! # Execute a workflow
//! waverunner workflow.yaml
//!
//! # Preview the waves without running anything
//! waverunner workflow.yaml --dry-run
//!
//! # Pass context values and limit concurrency
//! waverunner workflow.yaml --context env=staging --context replicas=3 --parallel 8
//!
//! # Pause while a flag file exists
//! waverunner workflow.yaml --pause-file /tmp/pause.flag
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use colored::Colorize;
use log::{error, info, warn};
use serde_json::Value;

use waverunner::execution::{register_builtins, Engine, EngineConfig};
use waverunner::monitoring::ExecutionTimeline;
use waverunner::workflow::{
    load_definition, plan_waves, Context, StepState, WorkflowDefinition, WorkflowResult,
    WorkflowState,
};
use waverunner::{APP_NAME, VERSION};

/// Interval for checking the pause flag file.
const PAUSE_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    workflow_path: Option<String>,
    max_parallel: usize,
    context: Context,
    pause_file: Option<PathBuf>,
    validate: bool,
    fail_fast_unknown: bool,
    dry_run: bool,
    json: bool,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workflow_path: None,
            max_parallel: num_cpus::get(),
            context: Context::new(),
            pause_file: None,
            validate: false,
            fail_fast_unknown: false,
            dry_run: false,
            json: false,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Wave-Scheduled Workflow Execution Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: waverunner [OPTIONS] <DEFINITION_FILE>");
    println!();
    println!("Arguments:");
    println!("  <DEFINITION_FILE>    Path to workflow YAML or JSON file");
    println!();
    println!("Options:");
    println!("  --parallel N         Maximum concurrent steps (default: {})", num_cpus::get());
    println!("  --context KEY=VALUE  Workflow context value, JSON or plain text (repeatable)");
    println!("  --pause-file PATH    Pause between waves while PATH exists");
    println!("  --validate           Check the dependency graph before running");
    println!("  --fail-fast-unknown  Do not retry steps whose action is not registered");
    println!("  --dry-run            Print the wave plan without running anything");
    println!("  --json               Print the final run record as JSON");
    println!("  --verbose            Enable debug logging");
    println!("  --help               Show this help message");
    println!("  --version            Show version information");
    println!();
    println!("Built-in actions: echo, sleep, fail, shell");
    println!();
    println!("Examples:");
    println!("  waverunner pipeline.yaml");
    println!("  waverunner pipeline.yaml --dry-run");
    println!("  waverunner pipeline.yaml --context env=staging --parallel 8");
}

/// Parses a `KEY=VALUE` context argument. The value is read as JSON when
/// possible and kept as a plain string otherwise.
fn parse_context_arg(arg: &str) -> Result<(String, Value), String> {
    let (key, raw) = arg
        .split_once('=')
        .ok_or_else(|| format!("Invalid context value '{}': expected KEY=VALUE", arg))?;

    let key = key.trim();
    if key.is_empty() {
        return Err(format!("Invalid context value '{}': empty key", arg));
    }

    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--dry-run" => config.dry_run = true,
            "--validate" => config.validate = true,
            "--fail-fast-unknown" => config.fail_fast_unknown = true,
            "--json" => config.json = true,
            "--verbose" | "-v" => config.verbose = true,
            "--parallel" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or("--parallel requires a number argument")?;
                config.max_parallel = value
                    .parse::<usize>()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| format!("Invalid parallel value: {}", value))?;
            }
            "--context" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or("--context requires a KEY=VALUE argument")?;
                let (key, value) = parse_context_arg(value)?;
                config.context.insert(key, value);
            }
            "--pause-file" => {
                i += 1;
                let value = args.get(i).ok_or("--pause-file requires a path argument")?;
                config.pause_file = Some(PathBuf::from(value));
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.workflow_path.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.workflow_path = Some(arg.clone());
            }
        }
        i += 1;
    }

    Ok(config)
}

/// Prints the waves the workflow would run in if every step succeeded.
fn print_plan(definition: &WorkflowDefinition) -> bool {
    let plan = plan_waves(&definition.steps);

    println!("[DRY RUN] Workflow: {}", definition.workflow_id);
    for (index, wave) in plan.waves.iter().enumerate() {
        println!("  Wave {}: {}", index + 1, wave.join(", "));
    }

    if !plan.unreachable.is_empty() {
        println!(
            "  {} {}",
            "Never runnable:".yellow(),
            plan.unreachable.join(", ")
        );
    }

    plan.is_complete()
}

/// Prints one line per step plus the overall outcome.
fn print_summary(result: &WorkflowResult) {
    println!();
    for step in &result.steps {
        let status = match step.state {
            StepState::Completed => "OK".green(),
            _ => "FAILED".red(),
        };
        println!(
            "  {:<6} {:<24} {:>8} ms  retries: {}",
            status, step.step_id, step.duration_ms, step.retry_count
        );
        if let Some(ref message) = step.error {
            println!("         {}", message.dimmed());
        }
    }

    let state = match result.state {
        WorkflowState::Completed => result.state.to_string().green().bold(),
        WorkflowState::Cancelled => result.state.to_string().yellow().bold(),
        _ => result.state.to_string().red().bold(),
    };

    println!();
    println!(
        "Workflow '{}' {} ({} completed, {} failed, {} ms)",
        result.workflow_id,
        state,
        result.completed_count(),
        result.failed_count(),
        result.duration_ms.unwrap_or(0)
    );
    if let Some(ref message) = result.error {
        println!("Reason: {}", message);
    }
}

/// Pauses the run while the flag file exists and resumes it once removed.
async fn watch_pause_file(engine: Engine, workflow_id: String, path: PathBuf) {
    let mut paused = false;

    loop {
        tokio::time::sleep(PAUSE_CHECK_INTERVAL).await;

        match engine.get_status(&workflow_id) {
            Some(record) if !record.state.is_terminal() => {}
            _ => return,
        }

        let flagged = Path::new(&path).exists();
        if flagged && !paused && engine.pause(&workflow_id) {
            info!("Execution paused - remove {} to resume", path.display());
            paused = true;
        } else if !flagged && paused {
            engine.resume(&workflow_id);
            info!("Resumed");
            paused = false;
        }
    }
}

/// Main application entry point.
///
/// Returns true when the workflow completed (or, in dry-run mode, when
/// every step is reachable).
async fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);

    if !config.json {
        print_banner();
    }

    let workflow_path = config
        .workflow_path
        .ok_or("No workflow file given. Run with --help for usage.")?;

    let definition = load_definition(&workflow_path).map_err(|e| {
        error!("Failed to load workflow: {}", e);
        e
    })?;

    if config.dry_run {
        return Ok(print_plan(&definition));
    }

    let engine_config = EngineConfig::new(config.max_parallel)
        .with_validation(config.validate)
        .with_fail_fast_unknown_actions(config.fail_fast_unknown);
    let engine = Engine::with_config(engine_config);
    register_builtins(engine.registry());

    let interrupt = {
        let engine = engine.clone();
        let workflow_id = definition.workflow_id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received - cancelling workflow '{}'", workflow_id);
                engine.cancel(&workflow_id);
            }
        })
    };

    let pause_watcher = config.pause_file.map(|path| {
        info!("Pause control: {}", path.display());
        tokio::spawn(watch_pause_file(
            engine.clone(),
            definition.workflow_id.clone(),
            path,
        ))
    });

    let outcome = engine.execute(&definition, config.context).await;

    interrupt.abort();
    if let Some(watcher) = pause_watcher {
        watcher.abort();
    }

    let result = outcome?;

    if config.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_summary(&result);
        if !result.steps.is_empty() {
            print!("{}", ExecutionTimeline::from_result(&result).gantt_chart());
        }
    }

    Ok(result.state == WorkflowState::Completed)
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
