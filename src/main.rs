use anyhow::Context;
use clap::{Parser, Subcommand};
use stackshift::{init_tracing, Orchestrator, StackshiftConfig, StoreBackend};
use stackshift_core::{compile, DependencyGraph};
use stackshift_cutover::{HealthStatus, ScriptedProbe};
use stackshift_scheduler::InMemoryBackend;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "stackshift",
    about = "Dependency-ordered provisioning and blue/green cutover"
)]
struct Cli {
    /// Path to config file (TOML). Defaults to $STACKSHIFT_CONFIG.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the operations that take the observed graph to the desired one
    Plan {
        /// Desired graph (JSON `{nodes, edges}` document)
        desired: PathBuf,
        /// Observed graph. Empty when omitted.
        #[arg(short, long)]
        observed: Option<PathBuf>,
        /// Emit the plan as JSON instead of a diff
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Bootstrap and cut over against the in-memory backend
    Simulate {
        /// Desired graph for both stacks
        desired: PathBuf,
        /// Health readings before green turns unhealthy (healthy forever if omitted)
        #[arg(long)]
        unhealthy_after: Option<usize>,
    },
    /// Print the effective configuration
    Config,
    /// Show version
    Version,
}

fn read_graph(path: &Path) -> anyhow::Result<DependencyGraph> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = StackshiftConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Plan {
            desired,
            observed,
            json,
        } => {
            let desired = read_graph(&desired)?;
            let observed = match observed {
                Some(path) => read_graph(&path)?,
                None => DependencyGraph::new(),
            };
            let plan = compile(&desired, &observed)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                print!("{plan}");
            }
        }

        Commands::Simulate {
            desired,
            unhealthy_after,
        } => {
            init_tracing(&config.logging)?;
            simulate(config, &read_graph(&desired)?, unhealthy_after).await?;
        }

        Commands::Config => print!("{}", config.to_toml()?),

        Commands::Version => println!("stackshift v{}", env!("CARGO_PKG_VERSION")),
    }

    Ok(())
}

async fn simulate(
    mut config: StackshiftConfig,
    desired: &DependencyGraph,
    unhealthy_after: Option<usize>,
) -> anyhow::Result<()> {
    config.store.backend = StoreBackend::Memory;
    let probe = match unhealthy_after {
        Some(n) => ScriptedProbe::new(
            std::iter::repeat(HealthStatus::Healthy).take(n),
            HealthStatus::unhealthy("simulated failure"),
        ),
        None => ScriptedProbe::always_healthy(),
    };
    let orchestrator =
        Orchestrator::from_config(config, Arc::new(InMemoryBackend::new()), Arc::new(probe))
            .await?;

    let blue = orchestrator.bootstrap(desired).await?;
    println!("blue {} live ({} resources)", blue.id, blue.graph.len());

    let id = orchestrator.start_cutover(desired).await?;
    let session = orchestrator.wait_for_completion(&id).await?;
    for t in &session.history {
        println!("{}  {} -> {}  ({})", t.at.format("%H:%M:%S"), t.from, t.to, t.signal);
    }
    let (blue_weight, green_weight) = session.weights();
    println!(
        "{}: blue {} = {blue_weight}%, green {} = {green_weight}%",
        session.state, session.blue.id, session.green.id
    );
    Ok(())
}
