//! numio-node — the order-core service binary.
//!
//! Startup sequence:
//!   1. Open (or initialise) the core store and the wallet ledger
//!   2. Build provider adapters from the providers config
//!   3. Wire kernel, catalog, saga, poll manager, outbox, reaper
//!   4. Start the JSON-RPC 2.0 server
//!   5. Run the periodic workers until shutdown

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use tracing::{info, warn};

use numio_adapter::{AdapterRegistry, HttpAdapter, HttpAdapterCaps};
use numio_core::ProviderId;
use numio_node::workers::{spawn_workers, WorkerIntervals};
use numio_node::Node;
use numio_rpc::{RpcServer, RpcServerState};

#[derive(Parser, Debug)]
#[command(
    name = "numio-node",
    version,
    about = "Numio order core — virtual number purchase orchestration"
)]
struct Args {
    /// Directory for the persistent stores.
    #[arg(long, default_value = "~/.numio/data")]
    data_dir: PathBuf,

    /// JSON-RPC listen address.
    #[arg(long, default_value = "127.0.0.1:8580")]
    rpc_addr: SocketAddr,

    /// Path to the providers config JSON (see `ProviderConfig`).
    #[arg(long)]
    providers: Option<PathBuf>,

    /// Poll cycle interval in seconds.
    #[arg(long, default_value_t = 3)]
    poll_interval: u64,

    /// Outbox dispatch interval in seconds.
    #[arg(long, default_value_t = 2)]
    outbox_interval: u64,

    /// Reaper sweep interval in seconds.
    #[arg(long, default_value_t = numio_core::REAPER_INTERVAL_SECS)]
    reaper_interval: u64,

    /// Offer sync interval in seconds.
    #[arg(long, default_value_t = 300)]
    offer_sync_interval: u64,

    /// Serve RPC only; run no periodic workers.
    #[arg(long)]
    no_workers: bool,
}

/// One upstream provider in the `--providers` file.
#[derive(Debug, Deserialize)]
struct ProviderConfig {
    id: String,
    base_url: String,
    api_key: String,
    #[serde(default)]
    status_batch: bool,
    #[serde(default)]
    balance: bool,
    #[serde(default)]
    resend: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,numio=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    info!("numio node starting");

    // ── Stores and components ─────────────────────────────────────────────────
    let data_dir = expand_tilde(&args.data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;

    let adapters = load_adapters(args.providers.as_deref())?;
    if adapters.is_empty() {
        warn!("no providers configured — purchases will fail until --providers is set");
    }
    let node = Node::open(&data_dir, adapters).context("wiring node components")?;

    // ── RPC server ────────────────────────────────────────────────────────────
    let rpc_state = Arc::new(RpcServerState {
        store: Arc::clone(&node.store),
        orchestrator: Arc::clone(&node.orchestrator),
        poll: Arc::clone(&node.poll),
        catalog: Arc::clone(&node.catalog),
        adapters: node.adapters.clone(),
        health: Arc::clone(&node.health),
    });
    let rpc_handle = RpcServer::new(rpc_state)
        .start(args.rpc_addr)
        .await
        .context("starting RPC server")?;

    // ── Workers ───────────────────────────────────────────────────────────────
    let workers = if args.no_workers {
        info!("workers disabled (--no-workers)");
        None
    } else {
        Some(spawn_workers(
            &node,
            WorkerIntervals {
                poll_secs: args.poll_interval,
                outbox_secs: args.outbox_interval,
                reaper_secs: args.reaper_interval,
                offer_sync_secs: args.offer_sync_interval,
            },
        ))
    };

    info!("node ready");
    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutting down");

    if let Some(workers) = workers {
        workers.stop().await;
    }
    let _ = rpc_handle.stop();
    Ok(())
}

/// Build the adapter registry from the providers config file.
fn load_adapters(path: Option<&Path>) -> anyhow::Result<AdapterRegistry> {
    let mut registry = AdapterRegistry::new();
    let Some(path) = path else {
        return Ok(registry);
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading providers config from {}", path.display()))?;
    let configs: Vec<ProviderConfig> =
        serde_json::from_str(&json).context("parsing providers config JSON")?;
    for cfg in configs {
        let adapter = HttpAdapter::new(
            ProviderId::new(&cfg.id),
            cfg.base_url,
            cfg.api_key,
            HttpAdapterCaps {
                status_batch: cfg.status_batch,
                balance: cfg.balance,
                resend: cfg.resend,
            },
        )
        .map_err(|e| anyhow::anyhow!("building adapter {}: {e}", cfg.id))?;
        info!(provider = %cfg.id, "provider adapter registered");
        registry.register(Arc::new(adapter));
    }
    Ok(registry)
}

/// Expand a leading `~` to the user's home directory (`HOME` or `USERPROFILE`).
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
            return PathBuf::from(home).join(stripped);
        }
    }
    path.to_path_buf()
}
