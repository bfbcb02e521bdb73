//! Command-line interface for cosci.
//!
//! Provides commands for planning and running research goals, checking run
//! status, listing runs and managing staged payloads.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::adapters::{
    CompletionOptions, HttpToolTransport, InferenceClient, Isolation, OpenAiCompatClient,
    ProcessScriptHost,
};
use crate::config::{Config, ENV_LLM_API_KEY, ENV_TOOLS_API_KEY};
use crate::core::executor::SYNTHESIS_CALL_ID;
use crate::core::{
    AnalysisRunner, ExecutionMode, Executor, ExecutorOptions, PayloadStore, Plan, Planner,
    ToolDispatcher,
};
use crate::domain::{RunResult, RunState, StepStatus, ToolCallResult};

/// cosci - research pipeline orchestrator
#[derive(Parser, Debug)]
#[command(name = "cosci")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Plan and execute a research goal
    Run {
        /// Research goal in plain language
        goal: String,

        /// Execute a plan file instead of asking the planner
        #[arg(short, long)]
        plan: Option<PathBuf>,

        /// Run dependents of failed steps with missing inputs instead of skipping them
        #[arg(long)]
        lenient: bool,

        /// Print the full run result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Produce a plan without executing it
    Plan {
        /// Research goal in plain language
        goal: String,

        /// Write the plan as YAML to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Inspect and clean the payload store
    Payloads {
        #[command(subcommand)]
        command: PayloadCommands,
    },

    /// Show resolved configuration (debug)
    Config,
}

#[derive(Subcommand, Debug)]
pub enum PayloadCommands {
    /// List staged payloads
    List,

    /// Print a payload's content
    Show {
        /// Payload key (sha256 hex)
        key: String,
    },

    /// Delete payloads older than the retention window
    Gc {
        /// Retention in hours (defaults to staging.retention_hours)
        #[arg(long)]
        older_than_hours: Option<u64>,
    },
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let config = Config::load()?;

        match self.command {
            Commands::Run {
                goal,
                plan,
                lenient,
                json,
            } => run_goal(&config, &goal, plan, lenient, json).await,
            Commands::Plan { goal, output } => plan_goal(&config, &goal, output).await,
            Commands::Status { run_id } => show_status(&config, &run_id).await,
            Commands::Runs { limit } => list_runs(&config, limit).await,
            Commands::Payloads { command } => execute_payloads(&config, command).await,
            Commands::Config => show_config(&config),
        }
    }
}

fn inference_client(config: &Config) -> Result<Arc<dyn InferenceClient>> {
    let client = OpenAiCompatClient::new(
        &config.llm.endpoint,
        &config.llm.model,
        config.llm_api_key()?,
        Duration::from_secs(config.llm.timeout_seconds),
    )?;
    Ok(Arc::new(client))
}

fn completion_options(config: &Config) -> CompletionOptions {
    CompletionOptions {
        temperature: config.llm.temperature,
        ..Default::default()
    }
}

/// Plan (or load) and execute a goal
async fn run_goal(
    config: &Config,
    goal: &str,
    plan_file: Option<PathBuf>,
    lenient: bool,
    json: bool,
) -> Result<()> {
    // Credentials are checked before any plan exists
    config.require_credentials()?;
    let llm = inference_client(config)?;

    let plan = match plan_file {
        Some(path) => {
            let mut plan = Plan::from_file(&path)?;
            if !goal.trim().is_empty() && plan.goal.trim().is_empty() {
                plan.goal = goal.trim().to_string();
            }
            plan
        }
        None => {
            Planner::new(Arc::clone(&llm))
                .with_options(completion_options(config))
                .create_plan(goal)
                .await?
        }
    };
    eprintln!("{}", plan.render());

    let mut tools = HttpToolTransport::new(&config.tools.endpoint, config.tools_api_key()?);
    if let Some(ref user_id) = config.tools.user_id {
        tools = tools.with_user_id(user_id);
    }

    let store = Arc::new(PayloadStore::open(config.payloads_dir()).await?);
    let host = ProcessScriptHost::new(config.analysis.interpreter.clone())
        .with_isolation(config.analysis.isolation.clone());
    let analysis = AnalysisRunner::new(
        Arc::new(host),
        Arc::clone(&store),
        config.analysis.limits.clone(),
    );

    let mode = if lenient {
        ExecutionMode::Lenient
    } else {
        config.execution.mode
    };
    let options = ExecutorOptions::new(config.runs_dir())
        .with_mode(mode)
        .with_inline_threshold(config.staging.inline_threshold_bytes)
        .with_retry(config.execution.retry.clone())
        .with_limits(config.execution.limits.clone());

    let cancel = CancellationToken::new();
    let executor = Executor::new(
        ToolDispatcher::new(Arc::new(tools), config.tools.call_timeout()),
        store,
        analysis,
        options,
    )
    .with_inference(llm, completion_options(config))
    .with_cancellation(cancel.clone());

    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            signal.cancel();
        }
    });

    let result = executor.run(plan).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_run_result(&result);
    }

    match &result.state {
        RunState::Completed => {
            eprintln!("\n[Run {} completed successfully]", result.run_id);
        }
        RunState::CompletedWithFailures { failed } => {
            eprintln!("\n[Run {} completed with {} unsuccessful step(s)]", result.run_id, failed);
            std::process::exit(1);
        }
        RunState::Cancelled => {
            eprintln!("\n[Run {} cancelled]", result.run_id);
            std::process::exit(130);
        }
        RunState::SafetyLimitReached { limit } => {
            eprintln!("\n[Run {} stopped: safety limit reached - {}]", result.run_id, limit);
            std::process::exit(1);
        }
        RunState::Running => {
            eprintln!("\n[Run {} in state: {}]", result.run_id, result.state);
        }
    }

    Ok(())
}

fn print_run_result(result: &RunResult) {
    println!("Goal: {}", result.goal);
    println!();

    for step in &result.steps {
        println!("[{}] {:<10} {}", step.ordinal, step.status.to_string(), step.intent);

        for call in &step.calls {
            let detail = match &call.result {
                ToolCallResult::Inline { text } => format!("{} bytes inline", text.len()),
                ToolCallResult::Staged { payload } => payload.to_string(),
                ToolCallResult::Failed { kind, message } => format!("{}: {}", kind, message),
            };
            println!("      {} ({}): {}", call.call_id, call.tool_id, detail);
        }

        let missing = step.missing_upstream();
        if !missing.is_empty() {
            println!("      missing inputs from step(s) {:?}", missing);
        }

        if let Some(ref err) = step.error {
            println!("      error: {}: {}", err.kind, err.message);
        }
    }

    for (ordinal, analysis) in &result.analyses {
        println!();
        println!("Analysis (step {}): {}", ordinal, analysis.summary);
        for (name, value) in &analysis.metrics {
            println!("  {}: {}", name, value);
        }
    }

    // The last succeeded synthesis output is the report
    let report = result
        .steps
        .iter()
        .rev()
        .filter(|s| s.status == StepStatus::Succeeded)
        .find_map(|s| {
            if let Some(ref synthesis) = s.synthesis {
                return Some(synthesis.to_markdown());
            }
            s.calls.iter().find_map(|c| match &c.result {
                ToolCallResult::Inline { text } if c.call_id == SYNTHESIS_CALL_ID => {
                    Some(text.clone())
                }
                ToolCallResult::Staged { payload } if c.call_id == SYNTHESIS_CALL_ID => Some(
                    format!(
                        "(report staged as {}; see `cosci payloads show {}`)",
                        payload, payload.key
                    ),
                ),
                _ => None,
            })
        });

    if let Some(report) = report {
        println!();
        println!("{}", report);
    }
}

/// Produce a plan and print or save it
async fn plan_goal(config: &Config, goal: &str, output: Option<PathBuf>) -> Result<()> {
    let llm = inference_client(config)?;
    let plan = Planner::new(llm)
        .with_options(completion_options(config))
        .create_plan(goal)
        .await?;

    match output {
        Some(path) => {
            let yaml = serde_yaml::to_string(&plan).context("Failed to serialize plan")?;
            std::fs::write(&path, yaml)
                .with_context(|| format!("Failed to write plan file: {}", path.display()))?;
            println!("{}", plan.render());
            eprintln!("\n[Plan written to {}]", path.display());
        }
        None => println!("{}", plan.render()),
    }

    Ok(())
}

/// Show the status of a run
async fn show_status(config: &Config, run_id_str: &str) -> Result<()> {
    let run_id = Uuid::parse_str(run_id_str)
        .with_context(|| format!("Invalid run ID: {}", run_id_str))?;

    let run = Executor::get_run_status(&config.runs_dir(), run_id).await?;

    println!("Run ID: {}", run.id);
    println!("Goal: {}", run.goal);
    println!("State: {}", run.state);
    println!("Started: {}", run.started_at);
    if let Some(completed) = run.completed_at {
        println!("Completed: {}", completed);
    }
    println!("\nStep statuses:");
    for (ordinal, status) in &run.step_statuses {
        let intent = run.step_intents.get(ordinal).map(String::as_str).unwrap_or("");
        println!("  {}: {} {}", ordinal, status, intent);
        if let Some(error) = run.step_errors.get(ordinal) {
            println!("     {}", error);
        }
    }
    if !run.payloads.is_empty() {
        println!("\nStaged payloads:");
        for payload in &run.payloads {
            println!("  {}", payload);
        }
    }

    Ok(())
}

/// List recent runs
async fn list_runs(config: &Config, limit: usize) -> Result<()> {
    let runs = Executor::list_runs(&config.runs_dir(), limit).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!("{:<38} {:<26} {:<40}", "RUN ID", "STATE", "GOAL");
    println!("{}", "-".repeat(104));

    for run in runs {
        let mut goal = run.goal.clone();
        if goal.chars().count() > 40 {
            goal = goal.chars().take(37).collect::<String>() + "...";
        }
        println!("{:<38} {:<26} {:<40}", run.id, run.state.to_string(), goal);
    }

    Ok(())
}

async fn execute_payloads(config: &Config, command: PayloadCommands) -> Result<()> {
    let store = PayloadStore::open(config.payloads_dir()).await?;

    match command {
        PayloadCommands::List => {
            let records = store.list().await?;
            if records.is_empty() {
                println!("No staged payloads");
                return Ok(());
            }

            println!("{:<66} {:>12} {:<25}", "KEY", "BYTES", "CREATED");
            println!("{}", "-".repeat(105));
            for record in records {
                println!(
                    "{:<66} {:>12} {:<25}",
                    record.reference.key,
                    record.reference.size_bytes,
                    record.created_at.to_rfc3339()
                );
            }
        }
        PayloadCommands::Show { key } => {
            let bytes = store.get_by_key(&key).await?;
            let mut stdout = io::stdout().lock();
            stdout.write_all(&bytes)?;
            stdout.flush()?;
        }
        PayloadCommands::Gc { older_than_hours } => {
            let retention = older_than_hours
                .map(|h| Duration::from_secs(h * 3600))
                .unwrap_or_else(|| config.staging.retention());
            let report = store.gc(retention).await?;
            println!(
                "Removed {} payload(s), freed {} bytes, retained {}",
                report.removed, report.bytes_freed, report.retained
            );
        }
    }

    Ok(())
}

fn show_config(cfg: &Config) -> Result<()> {
    let credential = |set: bool| if set { "set" } else { "not set" };

    println!("cosci configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:     {}", cfg.home.display());
    println!("  Runs:     {}", cfg.runs_dir().display());
    println!("  Payloads: {}", cfg.payloads_dir().display());
    println!();
    println!("Inference:");
    println!("  Endpoint:    {}", cfg.llm.endpoint);
    println!("  Model:       {}", cfg.llm.model);
    println!("  Temperature: {}", cfg.llm.temperature);
    println!("  {}: {}", ENV_LLM_API_KEY, credential(cfg.credentials.llm_api_key.is_some()));
    println!();
    println!("Tools:");
    println!("  Endpoint:     {}", cfg.tools.endpoint);
    println!("  Call timeout: {}s", cfg.tools.call_timeout_seconds);
    println!("  {}: {}", ENV_TOOLS_API_KEY, credential(cfg.credentials.tools_api_key.is_some()));
    println!();
    println!("Staging:");
    println!("  Inline threshold: {} bytes", cfg.staging.inline_threshold_bytes);
    println!("  Retention:        {}h", cfg.staging.retention_hours);
    println!();
    println!("Execution:");
    println!("  Mode:          {:?}", cfg.execution.mode);
    println!("  Max steps:     {}", cfg.execution.limits.max_steps);
    println!("  Run timeout:   {}s", cfg.execution.limits.run_timeout_seconds);
    println!("  Staging budget: {} bytes", cfg.execution.limits.max_staged_bytes);
    println!("  Retry attempts: {}", cfg.execution.retry.max_attempts);
    println!();
    println!("Analysis:");
    println!("  Interpreter: {}", cfg.analysis.interpreter.join(" "));
    match &cfg.analysis.isolation {
        Isolation::Wrapper(wrapper) => println!("  Isolation:   {}", wrapper.join(" ")),
        Isolation::Disabled => println!("  Isolation:   disabled"),
    }
    println!("  Wall clock:  {}s", cfg.analysis.limits.wall_clock_seconds);
    println!("  Memory:      {}MB", cfg.analysis.limits.memory_limit_mb);

    Ok(())
}
