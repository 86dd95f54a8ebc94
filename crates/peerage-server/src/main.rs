mod api;
mod config;
mod metrics;
mod node;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use peerage_cluster::{RemovalCoordinator, StatusReporter};
use tokio::net::TcpListener;
use tracing::info;

use crate::api::ApiState;
use crate::config::{parse_cluster_mode, MemberConfig, PeerageConfig};
use crate::node::Node;

#[derive(Parser)]
#[command(name = "peerage-server", about = "cluster membership and peer removal service")]
struct Args {
    /// path to TOML configuration file
    #[arg(short = 'c', long, env = "PEERAGE_CONFIG")]
    config: Option<PathBuf>,

    /// print default configuration as TOML and exit
    #[arg(long)]
    config_template: bool,

    /// address to bind the HTTP API and raft listener to
    #[arg(long, env = "PEERAGE_HOST")]
    host: Option<String>,

    /// HTTP API port
    #[arg(short, long, env = "PEERAGE_PORT")]
    port: Option<u16>,

    /// this node's peer id. in raft mode it must be one of the members
    #[arg(long, env = "PEERAGE_PEER_ID")]
    peer_id: Option<u64>,

    /// address other peers reach this node at. defaults to the bind address
    #[arg(long, env = "PEERAGE_ADVERTISE_ADDR")]
    advertise_addr: Option<String>,

    /// consensus mode: standalone or raft
    #[arg(long, env = "PEERAGE_CLUSTER_MODE")]
    cluster_mode: Option<String>,

    /// port for the raft RPC listener
    #[arg(long, env = "PEERAGE_RAFT_PORT")]
    raft_port: Option<u16>,

    /// raft members as `id=host:port`, comma separated. replaces the
    /// members from the config file
    #[arg(long, env = "PEERAGE_MEMBERS", value_delimiter = ',')]
    members: Vec<String>,

    /// milliseconds without a heartbeat before a peer is reported stale
    #[arg(long, env = "PEERAGE_LIVENESS_THRESHOLD_MS")]
    liveness_threshold_ms: Option<u64>,

    /// disable the /metrics endpoint
    #[arg(long, env = "PEERAGE_NO_METRICS")]
    no_metrics: bool,
}

/// Applies CLI overrides to a `PeerageConfig`. Only `Some` values from the
/// CLI args take effect, which preserves the resolution order:
/// defaults, TOML file, env vars, CLI flags.
fn apply_args(cfg: &mut PeerageConfig, args: &Args) {
    if let Some(ref host) = args.host {
        cfg.bind = host.clone();
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(id) = args.peer_id {
        cfg.peer_id = id;
    }
    if let Some(ref addr) = args.advertise_addr {
        cfg.advertise_addr = addr.clone();
    }
    if let Some(ref mode) = args.cluster_mode {
        cfg.cluster.mode = parse_cluster_mode(mode).unwrap_or_else(|e| exit_err(e));
    }
    if let Some(port) = args.raft_port {
        cfg.cluster.raft_port = port;
    }
    if !args.members.is_empty() {
        cfg.cluster.members = args
            .members
            .iter()
            .map(|m| parse_member(m).unwrap_or_else(|e| exit_err(e)))
            .collect();
    }
    if let Some(ms) = args.liveness_threshold_ms {
        cfg.cluster.liveness_threshold_ms = ms;
    }
    if args.no_metrics {
        cfg.metrics = false;
    }
}

/// Parses an `id=host:port` member spec.
fn parse_member(spec: &str) -> Result<MemberConfig, String> {
    let (id, addr) = spec
        .split_once('=')
        .ok_or_else(|| format!("invalid member '{spec}', expected id=host:port"))?;
    let id = id
        .trim()
        .parse()
        .map_err(|_| format!("invalid member id in '{spec}'"))?;
    let addr = addr.trim();
    if addr.is_empty() {
        return Err(format!("member '{spec}' has no address"));
    }
    Ok(MemberConfig {
        id,
        addr: addr.to_string(),
    })
}

/// Prints `msg` to stderr and exits with code 1.
fn exit_err(msg: impl std::fmt::Display) -> ! {
    eprintln!("{msg}");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "peerage_server=info,peerage_cluster=info".into()),
        )
        .init();

    let args = Args::parse();

    // --config-template: dump defaults and exit
    if args.config_template {
        match PeerageConfig::default().to_toml() {
            Ok(toml) => {
                println!("{toml}");
                std::process::exit(0);
            }
            Err(e) => exit_err(format!("failed to generate config template: {e}")),
        }
    }

    // defaults -> TOML file -> CLI/env overrides
    let mut cfg = match &args.config {
        Some(path) => PeerageConfig::from_file(path).unwrap_or_else(|e| exit_err(e)),
        None => PeerageConfig::default(),
    };
    apply_args(&mut cfg, &args);
    cfg.validate().unwrap_or_else(|e| exit_err(e));

    let api_addr = cfg.api_addr().unwrap_or_else(|e| exit_err(e));

    let metrics_handle = if cfg.metrics {
        match metrics::install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => exit_err(format!("failed to install metrics recorder: {e}")),
        }
    } else {
        None
    };

    let node = Node::start(&cfg)
        .await
        .unwrap_or_else(|e| exit_err(format!("failed to start node: {e}")));

    let state = Arc::new(ApiState {
        coordinator: RemovalCoordinator::new(
            Arc::clone(&node.store),
            Arc::clone(&node.consensus),
            Arc::clone(&node.placement),
            cfg.removal_config(),
        ),
        reporter: StatusReporter::new(
            node.local_id,
            Arc::clone(&node.store),
            Arc::clone(&node.consensus),
            Arc::clone(&node.liveness),
            cfg.liveness_threshold(),
        ),
        metrics: metrics_handle,
    });

    let listener = TcpListener::bind(api_addr)
        .await
        .unwrap_or_else(|e| exit_err(format!("failed to bind {api_addr}: {e}")));
    api::spawn_http_server(listener, state);

    info!(
        peer_id = %node.local_id,
        mode = ?cfg.cluster.mode,
        shards = node.placement.shard_count(),
        "peerage ready"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        exit_err(format!("failed to listen for shutdown signal: {e}"));
    }
    info!("shutting down");
    node.shutdown().await;
}
