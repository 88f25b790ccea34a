//! WolfCoord - Lease-Based Leader Election
//!
//! Runs a node that takes part in an election group and offers a few
//! inspection commands against the shared store.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfcoord::clock::SystemClock;
use wolfcoord::config::{BackendKind, LoggingConfig, WolfCoordConfig};
use wolfcoord::state::{LeaderElection, LeadershipTable, MembershipTable};
use wolfcoord::storage::StorageBackend;

/// WolfCoord - Lease-Based Leader Election
#[derive(Parser)]
#[command(name = "wolfcoord")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfcoord.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the election group and run until Ctrl+C
    Run,

    /// List the membership table
    Members,

    /// Show the leadership record
    Leader,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfcoord.toml")]
        output: PathBuf,

        /// Node ID (generated if omitted)
        #[arg(long)]
        node_id: Option<String>,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Init { output, node_id } => {
            init_logging(&LoggingConfig::default(), cli.log_level.as_deref());
            run_init(output.clone(), node_id.clone())
        }
        Commands::Run => run_node(load_config(&cli)?).await,
        Commands::Members => run_members(load_config(&cli)?).await,
        Commands::Leader => run_leader(load_config(&cli)?).await,
        Commands::Validate => {
            load_config(&cli)?;
            println!("Configuration {:?} is valid", cli.config);
            Ok(())
        }
    }
}

/// Load the configuration file and install logging from it
fn load_config(cli: &Cli) -> anyhow::Result<WolfCoordConfig> {
    let config = WolfCoordConfig::from_file(&cli.config)
        .with_context(|| format!("loading configuration from {:?}", cli.config))?;
    init_logging(&config.logging, cli.log_level.as_deref());
    Ok(config)
}

/// Initialize logging
fn init_logging(logging: &LoggingConfig, override_level: Option<&str>) {
    let level = override_level.unwrap_or(&logging.level);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "compact" {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().pretty()).init();
    }
}

/// Join the election group and run until interrupted
async fn run_node(config: WolfCoordConfig) -> anyhow::Result<()> {
    tracing::info!("Starting WolfCoord node {}", config.node.id);

    let backend = config.open_backend().await.context("opening storage backend")?;
    let election = Arc::new(LeaderElection::new(config.election_config(), backend)?);

    let mut status = election.subscribe();
    let outcome = election.start().await.context("joining election group")?;
    tracing::info!("Initial election: {:?}", outcome);

    let watcher = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            tracing::info!(
                "Leadership changed: {} (term: {:?}, leader: {:?})",
                current.state,
                current.term,
                current.leader_id
            );
        }
    });

    tokio::signal::ctrl_c().await.context("waiting for Ctrl+C")?;
    tracing::info!("Shutting down...");

    election.stop().await?;
    drop(election);
    watcher.abort();

    tracing::info!("WolfCoord stopped");
    Ok(())
}

/// Open the shared store for the inspection commands, creating the tables
/// so a fresh store reads as empty
async fn open_shared_store(config: &WolfCoordConfig) -> anyhow::Result<Arc<dyn StorageBackend>> {
    if config.storage.backend == BackendKind::Memory {
        anyhow::bail!("the memory backend lives inside a single process; point storage at sqlite or mysql to inspect a group");
    }

    let backend = config.open_backend().await.context("opening storage backend")?;
    backend
        .create_table_if_not_exists(&config.election.membership_table)
        .await?;
    backend
        .create_table_if_not_exists(&config.election.leadership_table)
        .await?;
    Ok(backend)
}

/// Print the membership table
async fn run_members(config: WolfCoordConfig) -> anyhow::Result<()> {
    let backend = open_shared_store(&config).await?;
    let election = config.election_config();
    let membership = MembershipTable::new(
        backend,
        Arc::new(SystemClock),
        election.membership_table.clone(),
        election.leadership_table.clone(),
        election.node_id.clone(),
        None,
    );

    let members = membership.members().await?;
    let threshold = election.stale_threshold();
    let now = chrono::Utc::now();

    println!("{:<24} {:<24} {:<32} {}", "ID", "ADDRESS", "LAST HEARTBEAT", "STATUS");
    for member in &members {
        let status = if member.is_stale(now, threshold) { "STALE" } else { "ALIVE" };
        println!(
            "{:<24} {:<24} {:<32} {}",
            member.id,
            member.address.as_deref().unwrap_or("-"),
            member.last_heartbeat.to_rfc3339(),
            status
        );
    }
    println!("{} member(s)", members.len());

    Ok(())
}

/// Print the leadership record
async fn run_leader(config: WolfCoordConfig) -> anyhow::Result<()> {
    let backend = open_shared_store(&config).await?;
    let election = config.election_config();
    let leadership = LeadershipTable::new(backend, election.leadership_table, election.group.clone());

    match leadership.read().await? {
        Some(record) => {
            let expired = record.is_expired(chrono::Utc::now(), election.max_clock_skew);
            println!("{}", serde_json::to_string_pretty(&record)?);
            if expired {
                println!("Lease expired; the next monitor tick will elect a new leader");
            }
        }
        None => println!("No leader elected yet for group {}", election.group),
    }

    Ok(())
}

/// Write a sample configuration file
fn run_init(output: PathBuf, node_id: Option<String>) -> anyhow::Result<()> {
    if output.exists() {
        anyhow::bail!("{:?} already exists", output);
    }

    let node_id = node_id.unwrap_or_else(|| format!("node-{}", uuid::Uuid::new_v4().simple()));
    let config = WolfCoordConfig::sample(&node_id);
    std::fs::write(&output, toml::to_string_pretty(&config)?)?;

    println!("Wrote {:?} for node {}", output, node_id);
    Ok(())
}
