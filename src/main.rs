use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use weft_core::config::EngineConfig;
use weft_core::context::StateContext;
use weft_core::event::WorkflowEvent;
use weft_core::state::{HumanFeedback, Stage, WorkflowState};
use weft_core::traits::{handler_fn, task_fn};

use weft_engine::{Graph, GraphDefinition, MemoryCheckpointStore, NodeKind, WorkflowEngine};

#[derive(Parser)]
#[command(name = "weft", version, about = "Stateful workflow orchestration engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "weft.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the effective engine configuration
    Config,
    /// Check a graph definition (TOML or JSON)
    Validate {
        /// Graph definition file
        graph: PathBuf,
    },
    /// Walk a graph with placeholder handlers and print every event
    Simulate {
        /// Graph definition file
        graph: PathBuf,
        /// Initial context entries, `key=value`
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
        /// Decision for every review gate reached
        #[arg(long, value_enum, default_value = "approve")]
        review: ReviewDecision,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum ReviewDecision {
    Approve,
    Reject,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("weft=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Validate { graph } => {
            let definition = load_graph(&graph)?;
            println!(
                "{}: {} nodes, {} edges, entry '{}'",
                definition.name,
                definition.nodes.len(),
                definition.edges.len(),
                definition.entry
            );
        }
        Commands::Simulate { graph, set, review } => {
            let definition = load_graph(&graph)?;
            let context = parse_context(&set)?;
            let state = simulate(&config, definition, context, review).await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
            if state.stage() == Stage::Failed {
                bail!(
                    "workflow failed: {}",
                    state.failure_reason().unwrap_or("unknown")
                );
            }
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<EngineConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        Ok(EngineConfig::load(path)?)
    } else {
        info!(path = %path.display(), "No config file, using defaults");
        Ok(EngineConfig::default())
    }
}

fn load_graph(path: &Path) -> anyhow::Result<GraphDefinition> {
    let definition = GraphDefinition::load(path)
        .with_context(|| format!("reading graph {}", path.display()))?;
    definition
        .validate()
        .with_context(|| format!("validating graph {}", path.display()))?;
    Ok(definition)
}

fn parse_context(pairs: &[String]) -> anyhow::Result<StateContext> {
    let mut context = StateContext::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("expected KEY=VALUE, got '{}'", pair);
        };
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        context.set(key.trim(), value);
    }
    Ok(context)
}

/// Bind placeholder implementations: task nodes record `<id>_status =
/// "success"`, parallel tasks echo their name.
fn placeholder_graph(definition: GraphDefinition) -> Graph {
    let mut task_names = vec![];
    let mut task_nodes = vec![];
    for node in &definition.nodes {
        match &node.kind {
            NodeKind::Task => task_nodes.push(node.id.clone()),
            NodeKind::Parallel { tasks } => task_names.extend(tasks.iter().cloned()),
            NodeKind::Review { .. } => {}
        }
    }

    let mut graph = Graph::new(definition);
    for id in task_nodes {
        let key = format!("{}_status", id);
        graph = graph.with_handler(
            id,
            handler_fn(move |mut state: WorkflowState| {
                let key = key.clone();
                async move {
                    state.context_mut().set_str(key, "success");
                    Ok(state)
                }
            }),
        );
    }
    for name in task_names {
        let value = serde_json::Value::String(name.clone());
        graph = graph.with_task(
            name,
            task_fn(move |_| {
                let value = value.clone();
                async move { Ok(value) }
            }),
        );
    }
    graph
}

async fn simulate(
    config: &EngineConfig,
    definition: GraphDefinition,
    context: StateContext,
    decision: ReviewDecision,
) -> anyhow::Result<WorkflowState> {
    let engine = WorkflowEngine::from_config(config, Arc::new(MemoryCheckpointStore::new()));
    let mut events = engine.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{}", line);
            }
            if let WorkflowEvent::StageChanged { to, .. } = event {
                if to.is_terminal() {
                    break;
                }
            }
        }
    });

    let graph = Arc::new(placeholder_graph(definition));
    let thread_id = engine.start_workflow(graph, context).await?;

    let state = loop {
        let state = engine.join(&thread_id).await?;
        let review_id = match state.pending_review() {
            Some(review) if state.stage() == Stage::AwaitingHuman => review.review_id.clone(),
            _ => break state,
        };
        let feedback = match decision {
            ReviewDecision::Approve => HumanFeedback::approve(&review_id, "cli"),
            ReviewDecision::Reject => HumanFeedback::reject(&review_id, "cli"),
        };
        engine
            .submit_human_feedback(&thread_id, &review_id, feedback)
            .await?;
    };

    if state.is_terminal() {
        let _ = printer.await;
    } else {
        warn!(thread_id = %thread_id, stage = %state.stage(), "Simulation stopped before a terminal stage");
        printer.abort();
    }
    Ok(state)
}
