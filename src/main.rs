use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use dotenv::dotenv;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use stategraph_rs::stategraph::checkpoint::{CheckpointStore, SqliteCheckpointStore};
use stategraph_rs::stategraph::config::Settings;
use stategraph_rs::stategraph::server;
use stategraph_rs::stategraph::workflow::builder::GraphBuilder;
use stategraph_rs::stategraph::workflow::graph::{
    CompiledGraph, ExecutionLimits, GraphContext, RunOutcome,
};
use stategraph_rs::stategraph::workflow::loader::GraphLoader;
use stategraph_rs::stategraph::workflow::registry::NodeRegistry;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run checkpointed state graphs", long_about = None)]
struct Cli {
    /// Checkpoint database (defaults to STATEGRAPH_DATABASE_URL or ~/.stategraph)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Keep checkpoints in memory for this process only
    #[arg(long, global = true)]
    memory: bool,

    /// Maximum node executions per run
    #[arg(long, global = true)]
    max_steps: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct ThreadArgs {
    /// Path to the graph YAML file
    #[arg(short, long)]
    file: PathBuf,

    /// Thread to operate on
    #[arg(short, long)]
    thread: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a run; without --input the thread resumes
    Run {
        #[command(flatten)]
        target: ThreadArgs,

        /// Initial state as a JSON object; missing fields take schema defaults
        #[arg(short, long)]
        input: Option<String>,
    },
    /// Resume a paused or interrupted thread
    Resume {
        #[command(flatten)]
        target: ThreadArgs,
    },
    /// Apply a manual state update
    Update {
        #[command(flatten)]
        target: ThreadArgs,

        /// Partial update as a JSON object
        #[arg(short, long)]
        values: String,

        /// Record the update as this node's result
        #[arg(long)]
        as_node: Option<String>,
    },
    /// Show the latest state of a thread
    State {
        #[command(flatten)]
        target: ThreadArgs,
    },
    /// List a thread's checkpoints
    History {
        /// Thread to inspect
        #[arg(short, long)]
        thread: String,
    },
    /// Delete all checkpoints of a thread
    Purge {
        #[arg(short, long)]
        thread: String,
    },
    /// List known threads
    Threads,
    /// Serve the HTTP API for one graph
    Serve {
        #[arg(short, long)]
        file: PathBuf,

        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();
    let mut settings = Settings::from_env()?;
    if let Some(url) = &cli.database_url {
        settings.database_url = url.clone();
    }
    if let Some(max_steps) = cli.max_steps {
        settings.max_steps = max_steps;
    }

    let ctx = open_context(&cli, &settings).await?;
    let result = dispatch(cli.command, &ctx, &settings).await;
    ctx.close().await;
    result
}

async fn dispatch(command: Commands, ctx: &GraphContext, settings: &Settings) -> anyhow::Result<()> {
    match command {
        Commands::Run { target, input } => {
            let input = match input {
                Some(raw) => {
                    let def = GraphLoader::new().load_graph(&target.file)?;
                    let values = parse_object(&raw, "--input")?;
                    Some(Value::Object(def.state.with_defaults(&values)))
                }
                None => None,
            };
            let graph = build(&target.file, ctx).await?;
            let outcome = graph.invoke(input, &target.thread).await?;
            print_outcome(&outcome)?;
        }
        Commands::Resume { target } => {
            let graph = build(&target.file, ctx).await?;
            let outcome = graph.invoke(None, &target.thread).await?;
            print_outcome(&outcome)?;
        }
        Commands::Update {
            target,
            values,
            as_node,
        } => {
            let graph = build(&target.file, ctx).await?;
            let values = Value::Object(parse_object(&values, "--values")?);
            let state = graph
                .update_state(&target.thread, values, as_node.as_deref())
                .await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Commands::State { target } => {
            let graph = build(&target.file, ctx).await?;
            match graph.get_state(&target.thread).await? {
                Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
                None => bail!("thread '{}' has no checkpoints", target.thread),
            }
        }
        Commands::History { thread } => {
            for checkpoint in ctx.store().history(&thread).await? {
                println!("{}", serde_json::to_string(&checkpoint)?);
            }
        }
        Commands::Purge { thread } => {
            let removed = ctx.store().purge(&thread).await?;
            println!("Removed {} checkpoints of thread '{}'", removed, thread);
        }
        Commands::Threads => {
            for thread in ctx.store().threads().await? {
                println!("{}", thread);
            }
        }
        Commands::Serve { file, port } => {
            let graph = build(&file, ctx).await?;
            server::serve(Arc::new(graph), port.unwrap_or(settings.port)).await?;
        }
    }
    Ok(())
}

async fn open_context(cli: &Cli, settings: &Settings) -> anyhow::Result<GraphContext> {
    let limits = ExecutionLimits::default().max_steps(settings.max_steps);
    if cli.memory {
        return Ok(GraphContext::in_memory().with_limits(limits));
    }

    ensure_data_dir(&settings.database_url)?;
    let store: Arc<dyn CheckpointStore> = Arc::new(
        SqliteCheckpointStore::connect(&settings.database_url)
            .await
            .with_context(|| format!("opening {}", settings.database_url))?,
    );
    Ok(GraphContext::new(store).with_limits(limits))
}

/// Create the directory of a file-backed SQLite URL
fn ensure_data_dir(database_url: &str) -> anyhow::Result<()> {
    if database_url.contains(":memory:") {
        return Ok(());
    }
    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:");
    let path = path.split('?').next().unwrap_or(path);
    if let Some(dir) = Path::new(path).parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating data directory {}", dir.display()))?;
    }
    Ok(())
}

async fn build(file: &Path, ctx: &GraphContext) -> anyhow::Result<CompiledGraph> {
    let builder = GraphBuilder::new(NodeRegistry::new());
    let graph = builder
        .build_file(file, ctx.clone())
        .await
        .with_context(|| format!("building graph from {}", file.display()))?;
    Ok(graph)
}

fn parse_object(raw: &str, flag: &str) -> anyhow::Result<serde_json::Map<String, Value>> {
    match serde_json::from_str(raw).with_context(|| format!("{} is not valid JSON", flag))? {
        Value::Object(map) => Ok(map),
        _ => bail!("{} must be a JSON object", flag),
    }
}

fn print_outcome(outcome: &RunOutcome) -> anyhow::Result<()> {
    for snapshot in &outcome.snapshots {
        println!("{}", serde_json::to_string(snapshot)?);
    }
    match outcome.next.as_slice() {
        [] => println!("Run {} {}", outcome.run_id, outcome.status),
        next => println!(
            "Run {} {} before {}; resume with `stategraph resume`",
            outcome.run_id,
            outcome.status,
            next.join(", ")
        ),
    }
    Ok(())
}
