mod transport;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use lode_cluster::{ConsistencyMode, QuorumPolicy};
use lode_grid::{GridConfig, GridNode};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};

use crate::transport::TcpTransport;

#[derive(Parser)]
#[command(name = "lode-server", about = "lode data grid member")]
struct Args {
    /// path to TOML configuration file
    #[arg(short = 'c', long, env = "LODE_CONFIG")]
    config: Option<PathBuf>,

    /// print default configuration as TOML and exit
    #[arg(long)]
    config_template: bool,

    /// address other members reach this one on
    #[arg(short, long, env = "LODE_BIND")]
    bind: Option<SocketAddr>,

    /// members to contact when joining, comma separated. none founds a
    /// new cluster
    #[arg(long, env = "LODE_SEEDS", value_delimiter = ',')]
    seeds: Option<Vec<SocketAddr>>,

    /// redundancy zone of this member
    #[arg(long, env = "LODE_ZONE")]
    zone: Option<String>,

    /// partition behavior: strict or available
    #[arg(long, env = "LODE_CONSISTENCY")]
    consistency: Option<String>,

    /// write quorum for regions created without one: all, majority or a
    /// number of owners
    #[arg(long, env = "LODE_DEFAULT_QUORUM")]
    default_quorum: Option<String>,

    /// disable background rebalancing when members join
    #[arg(long, env = "LODE_NO_REBALANCE")]
    no_rebalance: bool,

    /// address for the prometheus metrics endpoint. disabled when unset
    #[arg(long, env = "LODE_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// how long to wait for admission into the cluster, in seconds
    #[arg(long, env = "LODE_JOIN_TIMEOUT", default_value_t = 30)]
    join_timeout: u64,

    /// how long a graceful shutdown waits for the departure view, in seconds
    #[arg(long, env = "LODE_SHUTDOWN_TIMEOUT", default_value_t = 10)]
    shutdown_timeout: u64,
}

/// Applies CLI and environment overrides on top of the file config.
/// Only options that were actually given replace a value.
fn apply_args(cfg: &mut GridConfig, args: &Args) {
    if let Some(bind) = args.bind {
        cfg.node.bind = bind;
    }
    if let Some(ref seeds) = args.seeds {
        cfg.node.seeds = seeds.clone();
    }
    if let Some(ref zone) = args.zone {
        cfg.node.zone = Some(zone.clone());
    }
    if let Some(ref mode) = args.consistency {
        cfg.membership.consistency =
            parse_consistency(mode).unwrap_or_else(|e| exit_err(e));
    }
    if let Some(ref quorum) = args.default_quorum {
        cfg.replication.default_quorum = parse_quorum(quorum).unwrap_or_else(|e| exit_err(e));
    }
    if args.no_rebalance {
        cfg.rebalance.enabled = false;
    }
}

fn parse_consistency(s: &str) -> Result<ConsistencyMode, String> {
    match s.to_ascii_lowercase().as_str() {
        "strict" => Ok(ConsistencyMode::Strict),
        "available" => Ok(ConsistencyMode::Available),
        other => Err(format!(
            "invalid consistency '{other}', expected strict or available"
        )),
    }
}

fn parse_quorum(s: &str) -> Result<QuorumPolicy, String> {
    match s.to_ascii_lowercase().as_str() {
        "all" => Ok(QuorumPolicy::All),
        "majority" => Ok(QuorumPolicy::Majority),
        n => match n.parse::<u32>() {
            Ok(count) if count > 0 => Ok(QuorumPolicy::Count(count)),
            _ => Err(format!(
                "invalid quorum '{s}', expected all, majority or a positive number"
            )),
        },
    }
}

fn exit_err(msg: impl std::fmt::Display) -> ! {
    eprintln!("{msg}");
    std::process::exit(1);
}

/// Resolves on ctrl-c, or on SIGTERM where there is one.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!("failed to install SIGTERM handler: {e}"),
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lode=info".into()),
        )
        .init();

    let args = Args::parse();

    // --config-template: dump defaults and exit
    if args.config_template {
        match GridConfig::default().to_toml() {
            Ok(toml) => {
                println!("{toml}");
                std::process::exit(0);
            }
            Err(e) => exit_err(format!("failed to generate config template: {e}")),
        }
    }

    // defaults → TOML file → CLI/env overrides
    let mut cfg = match &args.config {
        Some(path) => GridConfig::from_file(path).unwrap_or_else(|e| exit_err(e)),
        None => GridConfig::default(),
    };
    apply_args(&mut cfg, &args);

    if let Some(addr) = args.metrics_addr {
        if let Err(e) = PrometheusBuilder::new().with_http_listener(addr).install() {
            exit_err(format!("failed to start metrics endpoint: {e}"));
        }
        info!(%addr, "metrics endpoint listening");
    }

    let (transport, inbox, local, accept) = TcpTransport::bind(cfg.node.bind)
        .await
        .unwrap_or_else(|e| exit_err(format!("failed to bind {}: {e}", cfg.node.bind)));
    // port 0 resolves to whatever the listener got
    cfg.node.bind = local;

    let node = GridNode::start(cfg, Arc::new(transport), inbox)
        .await
        .unwrap_or_else(|e| exit_err(e));

    match node.join_cluster(Duration::from_secs(args.join_timeout)).await {
        Ok(view) => info!(
            member = %node.id(),
            members = view.len(),
            generation = view.generation,
            "member ready"
        ),
        Err(e) => {
            node.abort();
            exit_err(format!("failed to join the cluster: {e}"));
        }
    }

    shutdown_signal().await;
    info!("shutdown requested");
    if let Err(e) = node
        .shutdown(Duration::from_secs(args.shutdown_timeout))
        .await
    {
        warn!("shutdown was not graceful: {e}");
    }
    accept.abort();
}
