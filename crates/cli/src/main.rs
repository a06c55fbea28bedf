//! `taskgraph` CLI entry-point.
//!
//! Every command that takes a path accepts a workflow JSON file or a
//! directory of them; the definitions are loaded into a definition store
//! first.
//!
//! Available sub-commands:
//! - `list`: print the stored definitions.
//! - `validate`: validate each definition and print its execution order.
//! - `run`: execute one definition and print the final snapshot.
//! - `kinds`: list the task kinds with a registered handler.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use engine::{
    DefinitionStore, EngineConfig, ExecutionStatus, InMemoryDefinitionStore, TaskKind,
    TaskRegistry, TracingPublisher, TriggerContext, WorkflowDefinition, WorkflowEngine,
};
use tasks::{InMemorySink, StoragePushHandler};

#[derive(Parser)]
#[command(name = "taskgraph", about = "Workflow execution engine", version)]
struct Cli {
    /// Engine configuration file (TOML).
    #[arg(long, env = "TASKGRAPH_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the workflow definitions found under a path.
    List {
        /// Workflow JSON file or directory.
        path: PathBuf,
    },
    /// Validate workflow definitions.
    Validate {
        /// Workflow JSON file or directory.
        path: PathBuf,
    },
    /// Execute a workflow definition.
    Run {
        /// Workflow JSON file or directory.
        path: PathBuf,
        /// Name or ID of the workflow to run; required when the path holds
        /// more than one.
        #[arg(long)]
        workflow: Option<String>,
        /// Initial variable binding, `name=<json>`. Repeatable.
        #[arg(long = "var", value_parser = parse_binding)]
        vars: Vec<(String, Value)>,
        /// Start through this trigger instead of manually.
        #[arg(long)]
        trigger: Option<String>,
        /// Trigger payload as JSON.
        #[arg(long, requires = "trigger")]
        payload: Option<String>,
    },
    /// List task kinds with a registered handler.
    Kinds,
}

/// `name=value`; a value that is not valid JSON is taken as a string.
fn parse_binding(raw: &str) -> Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{raw}'"))?;
    if name.is_empty() {
        return Err("variable name is empty".into());
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

fn read_definition(path: &Path) -> Result<WorkflowDefinition> {
    let content = std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("{} is not a workflow definition", path.display()))
}

/// Load `path` (a file, or every `*.json` file in a directory) into a store.
async fn catalog(path: &Path) -> Result<InMemoryDefinitionStore> {
    let files = if path.is_dir() {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(path).with_context(|| format!("cannot list {}", path.display()))? {
            let file = entry?.path();
            if file.extension().is_some_and(|ext| ext == "json") {
                files.push(file);
            }
        }
        files.sort();
        files
    } else {
        vec![path.to_path_buf()]
    };

    let store = InMemoryDefinitionStore::new();
    for file in files {
        store.save(read_definition(&file)?).await?;
    }
    Ok(store)
}

/// Pick one stored definition by name or ID, or the only one there is.
async fn select(store: &dyn DefinitionStore, wanted: Option<&str>) -> Result<WorkflowDefinition> {
    let all = store.list().await?;
    let found = match wanted {
        Some(key) => all.iter().find(|d| d.name == key || d.id.to_string() == key),
        None if all.len() == 1 => all.first(),
        None => bail!("{} workflows found; choose one with --workflow", all.len()),
    };
    let Some(summary) = found else {
        bail!("no workflow named '{}'", wanted.unwrap_or_default());
    };
    Ok(store.load(summary.id).await?)
}

fn registry() -> TaskRegistry {
    let mut registry = TaskRegistry::with_builtins();
    registry.register(TaskKind::StoragePush, Arc::new(StoragePushHandler::new(InMemorySink::new())));
    registry
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match dispatch(Cli::parse()).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let engine = WorkflowEngine::new(registry(), Arc::new(TracingPublisher), config);

    match cli.command {
        Command::List { path } => {
            let store = catalog(&path).await?;
            for definition in store.list().await? {
                println!("{}  {}  ({} tasks)", definition.id, definition.name, definition.tasks.len());
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Validate { path } => {
            let store = catalog(&path).await?;
            let mut code = ExitCode::SUCCESS;
            for definition in store.list().await? {
                match engine.load(&definition) {
                    Ok(graph) => {
                        println!("Workflow '{}' is valid.", graph.name);
                        println!("Entry tasks: {:?}", graph.entries());
                        println!("Execution order: {:?}", graph.order());
                    }
                    Err(e) => {
                        eprintln!("Workflow '{}' failed validation:", definition.name);
                        for violation in &e.violations {
                            eprintln!("  - {violation}");
                        }
                        code = ExitCode::FAILURE;
                    }
                }
            }
            Ok(code)
        }

        Command::Run { path, workflow, vars, trigger, payload } => {
            let store = catalog(&path).await?;
            let definition = select(&store, workflow.as_deref()).await?;
            let payload = match payload {
                Some(raw) => serde_json::from_str(&raw).context("--payload is not valid JSON")?,
                None => Value::Null,
            };
            let trigger = match trigger {
                Some(id) => TriggerContext::fired(id, payload),
                None => TriggerContext::manual(),
            };
            let bindings: HashMap<String, Value> = vars.into_iter().collect();

            let run_id = engine.start_definition(&definition, bindings, trigger).await?;
            info!(%run_id, "waiting for run to finish (Ctrl-C cancels)");

            let snapshot = tokio::select! {
                snapshot = engine.wait(run_id) => snapshot?,
                _ = tokio::signal::ctrl_c() => {
                    warn!(%run_id, "interrupted, cancelling");
                    // Already terminal is fine; we only want it stopped.
                    let _ = engine.cancel(run_id).await;
                    engine.wait(run_id).await?
                }
            };

            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            if snapshot.status != ExecutionStatus::Completed {
                bail!("run {} ended {}", run_id, snapshot.status);
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Kinds => {
            for kind in registry().kinds() {
                println!("{kind}");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
