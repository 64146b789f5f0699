//! TWAMP Measurement Agent
//!
//! Runs the reflector and the sender next to the routing daemon and keeps the
//! shared next-hop latency table current.
//!
//! Usage:
//!   twamp-agent -c 3 -i 10 -t 100 -p 862 -f 60
//!   twamp-agent --config /etc/twamp/agent.toml --metrics-port 9090
//!
//! Environment:
//!   TWAMP_CONFIG - TOML config file
//!   TWAMP_SHM_PATH - Shared table backing file (default: /dev/shm/bgp_twamp_shm)
//!   TWAMP_METRICS_PORT - Status HTTP port (optional)
//!   RUST_LOG - Log filter

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{routing::get, Json, Router};
use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use twamp_latency::agent::{Agent, AgentConfig, AggregationPolicy};

/// Shortest probe cycle accepted on the command line
const MIN_CYCLE_SECS: u64 = 10;

#[derive(Parser, Debug)]
#[command(name = "twamp-agent")]
#[command(about = "TWAMP-light measurement agent for next-hop latency")]
struct Args {
    /// TOML config file; flags below override it
    #[arg(long, env = "TWAMP_CONFIG")]
    config: Option<PathBuf>,

    /// Probes per target per cycle (1-100)
    #[arg(short = 'c', long)]
    packet_count: Option<u32>,

    /// Interval between probes in milliseconds
    #[arg(short = 'i', long)]
    interval_ms: Option<u64>,

    /// Reply timeout in milliseconds
    #[arg(short = 't', long)]
    timeout_ms: Option<u64>,

    /// TWAMP UDP port
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Seconds between probe cycles (at least 10)
    #[arg(short = 'f', long, value_parser = clap::value_parser!(u64).range(MIN_CYCLE_SECS..))]
    cycle_secs: Option<u64>,

    /// Shared table backing file
    #[arg(long, env = "TWAMP_SHM_PATH")]
    shm_path: Option<PathBuf>,

    /// How probe samples are aggregated: min, mean or median
    #[arg(long)]
    aggregation: Option<AggregationPolicy>,

    /// Mark a next-hop unmeasured after this many failed cycles
    #[arg(long)]
    expire_after: Option<u32>,

    /// Do not answer probes
    #[arg(long)]
    no_reflector: bool,

    /// Do not send probes
    #[arg(long)]
    no_sender: bool,

    /// Status HTTP port (/health, /metrics)
    #[arg(long, env = "TWAMP_METRICS_PORT")]
    metrics_port: Option<u16>,
}

impl Args {
    fn into_config(self) -> Result<(AgentConfig, Option<u16>)> {
        let mut config = match &self.config {
            Some(path) => AgentConfig::load(path)?,
            None => AgentConfig::default(),
        };

        if let Some(v) = self.packet_count {
            config.packet_count = v;
        }
        if let Some(v) = self.interval_ms {
            config.probe_interval = Duration::from_millis(v);
        }
        if let Some(v) = self.timeout_ms {
            config.probe_timeout = Duration::from_millis(v);
        }
        if let Some(v) = self.port {
            config.port = v;
        }
        if let Some(v) = self.cycle_secs {
            config.probe_cycle = Duration::from_secs(v);
        }
        if let Some(v) = self.shm_path {
            config.shm_path = v;
        }
        if let Some(v) = self.aggregation {
            config.aggregation = v;
        }
        if self.expire_after.is_some() {
            config.expire_after_failed_cycles = self.expire_after;
        }
        if self.no_reflector {
            config.reflector_enabled = false;
        }
        if self.no_sender {
            config.sender_enabled = false;
        }

        config.validate().context("Invalid configuration")?;
        Ok((config, self.metrics_port))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(Level::INFO.into())
                .add_directive("twamp_latency=info".parse()?),
        )
        .init();

    let (config, metrics_port) = Args::parse().into_config()?;

    info!("Starting TWAMP measurement agent");
    let agent = tokio::task::spawn_blocking(move || Agent::start(config)).await??;

    let config = agent.config();
    info!("  Shared table: {}", config.shm_path.display());
    match agent.reflector_addr() {
        Some(addr) => info!("  Reflector: {}", addr),
        None => info!("  Reflector: disabled"),
    }
    info!(
        "  Probes: {} x {:?} apart, timeout {:?}, cycle {:?}",
        config.packet_count, config.probe_interval, config.probe_timeout, config.probe_cycle
    );
    info!("  Aggregation: {:?}", config.aggregation);

    if let Some(port) = metrics_port {
        let agent_for_metrics = agent.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(port, agent_for_metrics).await {
                error!("Status server failed: {}", e);
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown signal received");

    tokio::task::spawn_blocking(move || agent.stop()).await?;
    info!("TWAMP measurement agent stopped");
    Ok(())
}

async fn start_metrics_server(port: u16, agent: Arc<Agent>) -> Result<()> {
    let app = Router::new()
        .route("/health", get(|| async { "OK" }))
        .route(
            "/metrics",
            get({
                let agent = agent.clone();
                move || {
                    let status = agent.status();
                    async move { Json(status) }
                }
            }),
        );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind status port {}", port))?;

    info!("Status server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
