//! Next-hop Table Tool
//!
//! Operator access to the shared latency table.
//!
//! Usage:
//!   nexthop_table dump
//!   nexthop_table add 10.0.0.1
//!   nexthop_table query 10.0.0.1
//!   nexthop_table watch --interval-ms 1000
//!
//! Environment:
//!   TWAMP_SHM_PATH - Shared table backing file (default: /dev/shm/bgp_twamp_shm)

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use twamp_latency::routing::{ChangeMonitor, DEFAULT_CHECK_INTERVAL};
use twamp_latency::telemetry::{TelemetryStore, DEFAULT_SHM_PATH, LATENCY_UNMEASURED};

#[derive(Parser, Debug)]
#[command(name = "nexthop_table")]
#[command(about = "Inspect and edit the shared next-hop latency table")]
struct Args {
    /// Shared table backing file
    #[arg(long, env = "TWAMP_SHM_PATH", default_value = DEFAULT_SHM_PATH)]
    shm_path: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the whole table as JSON
    Dump {
        /// Only active next-hops
        #[arg(long)]
        active: bool,
    },
    /// Register a next-hop
    Add { address: Ipv4Addr },
    /// Stop monitoring a next-hop
    Remove { address: Ipv4Addr },
    /// Print the latency of a next-hop in ms
    Query { address: Ipv4Addr },
    /// Reclaim slots of removed next-hops
    Compact,
    /// Print every sequence change until Ctrl-C
    Watch {
        #[arg(long, default_value_t = DEFAULT_CHECK_INTERVAL.as_millis() as u64)]
        interval_ms: u64,
    },
    /// Tear the table down and unlink the backing file
    Cleanup,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::WARN.into()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let store = Arc::new(
        TelemetryStore::open(&args.shm_path)
            .with_context(|| format!("Failed to attach {}", args.shm_path.display()))?,
    );

    match args.command {
        Command::Dump { active } => {
            let mut snapshot = store.snapshot()?;
            if active {
                snapshot.entries.retain(|e| e.active);
            }
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Command::Add { address } => {
            let outcome = store.add(address)?;
            println!("{}: {:?}", address, outcome);
        }
        Command::Remove { address } => {
            if store.remove(address)? {
                println!("{}: removed", address);
            } else {
                println!("{}: not registered", address);
            }
        }
        Command::Query { address } => match store.query(address) {
            LATENCY_UNMEASURED => println!("{}: unmeasured", address),
            ms => println!("{}: {} ms", address, ms),
        },
        Command::Compact => {
            let reclaimed = store.compact()?;
            println!("Reclaimed {} slots", reclaimed);
        }
        Command::Watch { interval_ms } => {
            let monitor = ChangeMonitor::spawn(
                store.clone(),
                Duration::from_millis(interval_ms.max(1)),
                |change| println!("sequence {} -> {}", change.previous, change.current),
            )?;
            info!("Watching {}", args.shm_path.display());
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            tokio::task::spawn_blocking(move || monitor.stop()).await?;
        }
        Command::Cleanup => {
            if store.teardown() {
                println!("Removed {}", args.shm_path.display());
            }
        }
    }

    Ok(())
}
