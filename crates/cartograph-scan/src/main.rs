//! CLI entry point for the cartograph-scan inventory scanner.

use std::sync::Arc;

use clap::Parser;
use tokio::time::interval;
use tracing_subscriber::{fmt, EnvFilter};

use cartograph_core::config::{load_section, DEFAULT_FILE_PREFIX};
use cartograph_graph::{GraphClient, GraphConfig, GraphStore, MemoryGraph};

use cartograph_scan::config::ScanSettings;
use cartograph_scan::inventory::Inventory;
use cartograph_scan::{MultiTargetOrchestrator, ScannerRegistry};

#[derive(Parser)]
#[command(name = "cartograph-scan")]
#[command(about = "Project provider inventory into the Cartograph graph")]
struct Cli {
    /// Run a single scan cycle and exit.
    #[arg(long)]
    once: bool,

    /// Run scan cycles on the configured interval.
    #[arg(long)]
    daemon: bool,

    /// Force a full pass of every type before the first cycle.
    #[arg(long)]
    full: bool,

    /// Write to an in-memory graph instead of Neo4j.
    #[arg(long)]
    dry_run: bool,

    /// JSON inventory to scan (overrides scan.inventory_path).
    #[arg(short, long)]
    inventory: Option<String>,

    /// Config file prefix.
    #[arg(short, long, default_value = DEFAULT_FILE_PREFIX)]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).json().init();

    let cli = Cli::parse();
    if !cli.once && !cli.daemon {
        anyhow::bail!("Specify --once (single cycle) or --daemon (scheduled cycles)");
    }

    let settings: ScanSettings = load_section(&cli.config, "scan")?;

    let store: Arc<dyn GraphStore> = if cli.dry_run {
        tracing::info!("Dry run, writing to in-memory graph");
        Arc::new(MemoryGraph::new())
    } else {
        let graph_config: GraphConfig = load_section(&cli.config, "neo4j")?;
        Arc::new(GraphClient::connect(&graph_config).await?)
    };

    let inventory_path = cli
        .inventory
        .or_else(|| settings.inventory_path.clone())
        .ok_or_else(|| anyhow::anyhow!("No inventory: set --inventory or scan.inventory_path"))?;
    let inventory = Arc::new(Inventory::load(&inventory_path)?);

    let mut registry = ScannerRegistry::new();
    inventory.register(&mut registry)?;

    let orchestrator = MultiTargetOrchestrator::builder(registry, store)
        .settings(&settings)
        .build()?;
    if cli.full {
        orchestrator.force_full_scan().await?;
    }

    if cli.once {
        orchestrator.scan().await?;
    } else {
        let mut ticker = interval(settings.cycle_interval());
        loop {
            ticker.tick().await;
            // Daemon cycles log failures and keep going, except preconditions.
            match orchestrator.scan().await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => tracing::error!(error = %e, "Scan cycle failed"),
            }
        }
    }

    Ok(())
}
