use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use secflow::prelude::*;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "secflow")]
#[command(about = "Run declarative security-operations workflows", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow file and print the run result as JSON
    Run {
        /// Path to the workflow YAML file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Trigger payload as inline JSON, or @path to read it from a file
        #[arg(short, long)]
        trigger: Option<String>,

        /// Path to runner.yaml config file (default: runner.yaml next to FILE)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Execution id used to derive the run id (default: random)
        #[arg(short, long)]
        execution_id: Option<String>,
    },

    /// Validate a workflow file or directory without running it
    Validate {
        /// Path to workflow file or directory
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("secflow=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("secflow=info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            tracing::error!(error = %e, "secflow failed");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    match cli.command {
        Commands::Run {
            file,
            trigger,
            config,
            execution_id,
        } => run_workflow(file, trigger, config, execution_id).await,
        Commands::Validate { path } => validate(path),
    }
}

fn parse_trigger(raw: Option<&str>) -> anyhow::Result<Value> {
    let Some(raw) = raw else {
        return Ok(Value::Object(Default::default()));
    };

    let text = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read trigger file {}", path))?,
        None => raw.to_string(),
    };
    serde_json::from_str(&text).context("trigger is not valid JSON")
}

fn load_config(file: &Path, config: Option<PathBuf>) -> anyhow::Result<RunnerConfig> {
    let config_file = match config {
        Some(path) => path,
        None => file
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("runner.yaml"),
    };

    if config_file.exists() {
        tracing::info!(config = %config_file.display(), "Using runner config");
        Ok(RunnerConfig::load(&config_file)?)
    } else {
        Ok(RunnerConfig::default())
    }
}

#[tracing::instrument(skip_all, fields(file = %file.display()))]
async fn run_workflow(
    file: PathBuf,
    trigger: Option<String>,
    config: Option<PathBuf>,
    execution_id: Option<String>,
) -> anyhow::Result<bool> {
    if !file.exists() {
        anyhow::bail!("Workflow file not found: {}", file.display());
    }

    let definition = WorkflowLoader::load_file(&file)?;
    let config = load_config(&file, config)?;
    let trigger = parse_trigger(trigger.as_deref())?;
    let execution_id = execution_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let cancellation = CancellationToken::new();
    let on_interrupt = cancellation.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling run");
            on_interrupt.cancel();
        }
    });

    let scheduler = Scheduler::from_config(&config, ActionRegistry::new().with_builtins());
    let args = RunArgs::new(trigger)
        .with_execution_id(execution_id)
        .with_cancellation(cancellation);
    let result = scheduler.run(&definition, args).await?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(result.succeeded())
}

fn validate(path: PathBuf) -> anyhow::Result<bool> {
    if !path.exists() {
        anyhow::bail!("Path not found: {}", path.display());
    }

    let definitions = if path.is_dir() {
        WorkflowLoader::load_directory(&path)?
    } else {
        vec![WorkflowLoader::load_file(&path)?]
    };

    if definitions.is_empty() {
        println!("No workflows found in: {}", path.display());
        return Ok(true);
    }

    for definition in &definitions {
        let graph = definition.validate()?;
        let entrypoint = resolve_entrypoint(&graph, definition.entrypoint.as_deref())?;

        println!("✓ {} ({} actions)", definition.title, graph.len());
        if let Some(entrypoint) = entrypoint {
            println!("  entrypoint: {}", entrypoint);
        }
        for (i, level) in graph.execution_levels().iter().enumerate() {
            println!("  level {}: {}", i, level.join(", "));
        }
    }

    Ok(true)
}
