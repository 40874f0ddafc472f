//! Consensus cluster membership daemon (ccmd).
//!
//! Determines, for a set of communicating nodes, the single agreed list
//! of nodes forming a live, mutually-connected partition, and reports
//! every agreed change to its client observer.
//!
//! Usage:
//!   ccmd --name <ID> [--peer ID=HOST:PORT]... [OPTIONS]
//!
//! The daemon creates a tokio async runtime and runs:
//! 1. The cluster transport (in-process `local` or TCP `mesh`)
//! 2. The CCM protocol engine, pinned to one task that owns all
//!    protocol state

mod config;
mod engine;
mod notify;
mod transport;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use ccm_proto::constants::CCM_LISTEN_PORT;
use ccm_proto::defaults::DEFAULT_KEEPALIVE_MS;
use ccm_proto::node::NodeDirectory;

use crate::config::{EngineConfig, TimeoutConfig};
use crate::engine::CcmEngine;
use crate::notify::LogObserver;
use crate::transport::local::LocalHub;
use crate::transport::mesh::MeshTransport;
use crate::transport::ClusterTransport;

/// Consensus cluster membership daemon
#[derive(Parser, Debug)]
#[command(name = "ccmd", version, about = "Consensus cluster membership daemon")]
struct Args {
    /// This node's identifier (must appear in the roster)
    #[arg(short = 'n', long)]
    name: String,

    /// Roster entry: ID=HOST:PORT, can be specified multiple times.
    /// The roster must be identical on every node.
    #[arg(long = "peer", value_name = "ID=HOST:PORT")]
    peers: Vec<String>,

    /// Listen address for cluster communication
    #[arg(short = 'b', long, default_value = "0.0.0.0")]
    bind_addr: String,

    /// Listen port for cluster communication
    #[arg(short = 'p', long, default_value_t = CCM_LISTEN_PORT)]
    port: u16,

    /// Cluster transport to use: "local" (single-node) or "mesh" (TCP)
    #[arg(long, default_value = "mesh")]
    transport: String,

    /// Keepalive interval in milliseconds; every protocol timeout is a
    /// multiple of this
    #[arg(long, default_value_t = DEFAULT_KEEPALIVE_MS)]
    keepalive_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

/// Parse one `ID=HOST:PORT` roster entry.
fn parse_peer(s: &str) -> Option<(String, SocketAddr)> {
    let (id, addr) = s.split_once('=')?;
    let addr: SocketAddr = addr.parse().ok()?;
    Some((id.to_string(), addr))
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("ccmd v{} starting", env!("CARGO_PKG_VERSION"));

    // Build the roster
    let mut roster: HashMap<String, SocketAddr> = HashMap::new();
    for entry in &args.peers {
        match parse_peer(entry) {
            Some((id, addr)) => {
                roster.insert(id, addr);
            }
            None => {
                error!("invalid roster entry '{}', expected ID=HOST:PORT", entry);
                std::process::exit(1);
            }
        }
    }
    let mut ids: Vec<String> = roster.keys().cloned().collect();
    if !ids.contains(&args.name) {
        ids.push(args.name.clone());
    }

    let dir = match NodeDirectory::new(&args.name, &ids) {
        Ok(d) => d,
        Err(e) => {
            error!("cannot build node directory: {}", e);
            std::process::exit(1);
        }
    };
    info!(
        "node {} (uuid {}) in a {}-node roster",
        dir.my_id(),
        dir.my_uuid(),
        dir.node_count()
    );

    // Create the cluster transport
    let transport: Arc<dyn ClusterTransport> = match args.transport.as_str() {
        "mesh" => {
            let bind_ip: IpAddr = args
                .bind_addr
                .parse()
                .unwrap_or_else(|_| IpAddr::V4(Ipv4Addr::UNSPECIFIED));
            let mesh = MeshTransport::new(&args.name, roster);
            if let Err(e) = mesh.start(SocketAddr::new(bind_ip, args.port)).await {
                error!("cannot start mesh transport: {}", e);
                std::process::exit(1);
            }
            info!("using mesh transport on port {}", args.port);
            Arc::new(mesh)
        }
        _ => {
            if args.transport != "local" {
                error!(
                    "unknown transport '{}', falling back to 'local'",
                    args.transport
                );
            }
            info!("using local transport (single-node mode)");
            let hub = LocalHub::new();
            Arc::new(hub.register(&args.name).await)
        }
    };

    // Engine configuration
    let cfg = EngineConfig {
        timeouts: TimeoutConfig::from_keepalive(Duration::from_millis(args.keepalive_ms)),
        ..EngineConfig::default()
    };

    // Run the engine; it exclusively owns all protocol state.
    let mut engine = CcmEngine::new(dir, transport, Arc::new(LogObserver), cfg);
    if let Err(e) = engine.run().await {
        error!("engine stopped: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_peer() {
        let (id, addr) = parse_peer("nodea=10.0.0.1:7400").unwrap();
        assert_eq!(id, "nodea");
        assert_eq!(addr, "10.0.0.1:7400".parse().unwrap());
        assert!(parse_peer("nodea").is_none());
        assert!(parse_peer("nodea=notanaddr").is_none());
    }
}
