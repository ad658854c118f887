//! electkv binary: cluster simulator and config inspection

use clap::{Parser, Subcommand};
use electkv::common::{parse_duration, Config};
use electkv::{ClusterCoordinator, MemoryStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "electkv")]
#[command(about = "Quorum-vote leader election over a coordination store")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ./electkv.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an in-process cluster and crash its leader
    Simulate {
        /// Number of nodes
        #[arg(long, default_value = "3")]
        nodes: usize,

        /// System to campaign in (overrides config)
        #[arg(long)]
        system: Option<String>,

        /// Crash the leader after this long (e.g. "5s"); never when omitted
        #[arg(long, value_parser = parse_duration_arg)]
        kill_leader_after: Option<Duration>,

        /// Total simulation time
        #[arg(long, default_value = "20s", value_parser = parse_duration_arg)]
        run_for: Duration,
    },

    /// Print the effective configuration as JSON
    Config,
}

fn parse_duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Simulate {
            nodes,
            system,
            kill_leader_after,
            run_for,
        } => {
            let system = system.unwrap_or_else(|| config.election.system.clone());
            simulate(config, system, nodes, kill_leader_after, run_for).await?;
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

async fn simulate(
    config: Config,
    system: String,
    nodes: usize,
    kill_leader_after: Option<Duration>,
    run_for: Duration,
) -> anyhow::Result<()> {
    anyhow::ensure!(nodes > 0, "at least one node is required");

    let store = Arc::new(MemoryStore::new());
    let _reaper = store.spawn_reaper(config.election.heartbeat_interval() / 2);

    tracing::info!("Starting {} node(s) in {}", nodes, system);
    tracing::info!("  Election timeout: {:?}", config.election.election_timeout());
    tracing::info!("  Heartbeat interval: {:?}", config.election.heartbeat_interval());

    let mut cluster = Vec::with_capacity(nodes);
    for i in 1..=nodes {
        let hostname = format!("{}-node-{}", system, i);
        let coordinator =
            ClusterCoordinator::new(store.clone(), hostname.clone(), config.election.clone());

        coordinator.on_leadership_change(move |change| {
            match serde_json::to_string(change) {
                Ok(json) => tracing::info!("[{}] leadership change {}", hostname, json),
                Err(e) => tracing::warn!("[{}] unserializable change: {}", hostname, e),
            }
        });

        let campaign = coordinator.campaign(&system).await?;
        cluster.push((coordinator, campaign));
    }

    if let Some(after) = kill_leader_after {
        tokio::time::sleep(after).await;
        match cluster.iter().find(|(coordinator, _)| coordinator.is_leader()) {
            Some((coordinator, campaign)) => {
                tracing::warn!("Crashing leader {}", coordinator.hostname());
                campaign.abort();
            }
            None => tracing::warn!("No leader elected after {:?}", after),
        }
        tokio::time::sleep(run_for.saturating_sub(after)).await;
    } else {
        tokio::time::sleep(run_for).await;
    }

    for (coordinator, campaign) in &cluster {
        let status = coordinator.status();
        println!(
            "{:<24} {:<12} leader={}",
            coordinator.hostname(),
            status.role.to_string(),
            status.leader.as_deref().unwrap_or("-")
        );
        if !campaign.is_finished() {
            campaign.resign().await?;
        }
    }

    Ok(())
}
