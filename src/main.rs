use clap::{Parser, Subcommand};
use serde_json::Value;
use std::time::Duration;

use dagr::events::EventFilter;
use dagr::{Engine, EngineConfig, WorkflowDefinition};

#[derive(Parser)]
#[command(name = "dagr")]
#[command(about = "Durable DAG workflow execution engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow definition file (JSON or YAML)
    Validate {
        /// Path to the workflow file
        file: String,
    },
    /// Run a workflow definition file and stream its events
    Run {
        /// Path to the workflow file
        file: String,
        /// JSON initial input
        #[arg(short, long)]
        input: Option<String>,
        /// Seconds to wait for completion
        #[arg(short, long, default_value = "300")]
        timeout: u64,
    },
    /// List stored executions
    Executions {
        /// Filter by workflow id
        #[arg(short, long)]
        workflow: Option<String>,
    },
    /// List registered node types
    NodeTypes,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dagr::telemetry::init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Commands::Validate { file } => {
            let content = std::fs::read_to_string(&file)?;
            let definition = WorkflowDefinition::parse(&content)?;
            dagr::workflow::validate_definition(&definition)?;
            println!(
                "OK: '{}' ({} nodes, {} edges)",
                definition.name,
                definition.nodes.len(),
                definition.edges.len()
            );
        }

        Commands::Run {
            file,
            input,
            timeout,
        } => {
            let content = std::fs::read_to_string(&file)?;
            let definition = WorkflowDefinition::parse(&content)?;
            let input: Value = match input {
                Some(text) => serde_json::from_str(&text)?,
                None => Value::Null,
            };

            let engine = Engine::start(EngineConfig::load()).await?;
            engine.shutdown_coordinator().start_signal_listener();

            let workflow = engine.create_workflow(definition).await?;
            let mut events = engine.subscribe(EventFilter::Workflow(workflow.id.clone()));
            let execution_id = engine.execute_workflow(&workflow.id, input).await?;

            println!("execution: {}", execution_id);

            let wait = engine.wait_for_terminal(&execution_id, Duration::from_secs(timeout));
            tokio::pin!(wait);

            let execution = loop {
                tokio::select! {
                    event = events.recv() => {
                        if let Some(event) = event {
                            println!("{}", serde_json::to_string(&event)?);
                        }
                    }
                    result = &mut wait => break result?,
                }
            };

            // Drain whatever the bus delivered before termination.
            while let Some(event) = events.try_recv() {
                println!("{}", serde_json::to_string(&event)?);
            }

            println!("{}", serde_json::to_string_pretty(&execution)?);
            engine.shutdown().await;

            if execution.status != dagr::ExecutionStatus::Completed {
                std::process::exit(1);
            }
        }

        Commands::Executions { workflow } => {
            let engine = Engine::start(EngineConfig::load()).await?;
            let executions = engine.list_executions(workflow.as_deref()).await?;
            for execution in executions {
                println!(
                    "{}  {}  {}  started={}",
                    execution.id, execution.workflow_id, execution.status, execution.started_at
                );
            }
            engine.shutdown().await;
        }

        Commands::NodeTypes => {
            let engine = Engine::start(EngineConfig::load()).await?;
            for meta in engine.node_types() {
                println!("{:<12} {}", meta.node_type, meta.description);
            }
            engine.shutdown().await;
        }
    }

    Ok(())
}
