use std::net::SocketAddr;

use alloy_primitives::U256;
use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use portalium::{Enr, Node, NodeConfig, Radius, SubProtocolId};

#[derive(Parser, Debug)]
#[command(name = "portalium")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:9009")]
    bind: SocketAddr,

    /// Hex-encoded bootnode records.
    #[arg(short = 'B', long = "bootnode", value_name = "ENR")]
    bootnodes: Vec<String>,

    /// Initial responsibility radius as a hex u256; defaults to the full
    /// keyspace.
    #[arg(short, long)]
    radius: Option<String>,

    /// Sub-protocols to join.
    #[arg(long, value_delimiter = ',', default_values_t = ["history".to_string(), "state".to_string()])]
    protocols: Vec<String>,

    /// Content budget in megabytes.
    #[arg(long, default_value = "1024")]
    storage_mb: u64,

    /// Reload routing-table state from persistence on startup.
    #[arg(long)]
    rebuild_from_memory: bool,

    #[arg(short, long, default_value = "300")]
    status_interval: u64,
}

fn parse_protocol(name: &str) -> Result<SubProtocolId> {
    match name {
        "history" => Ok(SubProtocolId::History),
        "state" => Ok(SubProtocolId::State),
        "beacon" => Ok(SubProtocolId::Beacon),
        "canonical-indices" => Ok(SubProtocolId::CanonicalIndices),
        other => anyhow::bail!("unknown sub-protocol {other:?}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let mut config = NodeConfig {
        bind_address: args.bind,
        rebuild_from_memory: args.rebuild_from_memory,
        storage_budget: args.storage_mb * 1024 * 1024,
        ..NodeConfig::default()
    };
    config.supported_protocols = args
        .protocols
        .iter()
        .map(|p| parse_protocol(p))
        .collect::<Result<Vec<_>>>()?;
    if let Some(radius) = &args.radius {
        let parsed = U256::from_str_radix(radius.trim_start_matches("0x"), 16)
            .context("radius must be a hex u256")?;
        config.radius = Radius(parsed);
    }
    for bootnode in &args.bootnodes {
        let enr = Enr::from_hex(bootnode).context("invalid bootnode record")?;
        config.bootnodes.push(enr);
    }

    let node = Node::bind(config).await?;
    info!(node_id = %node.node_id(), addr = %node.local_addr(), "portalium up");
    info!(enr = node.local_enr().to_hex(), "local record");

    node.start().await?;

    let mut interval = time::interval(Duration::from_secs(args.status_interval));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                if let Err(e) = node.snapshot_routing().await {
                    warn!(error = %e, "routing snapshot failed");
                }
                break;
            }
            _ = interval.tick() => {
                for protocol in [SubProtocolId::History, SubProtocolId::State] {
                    if let Some(overlay) = node.overlay(protocol) {
                        info!(
                            protocol = %protocol,
                            peers = overlay.table_len().await,
                            radius = %overlay.radius().await.0,
                            "overlay status"
                        );
                    }
                }
            }
        }
    }

    Ok(())
}
