#![allow(dead_code)]

//! Bitorch PEX Node
//!
//! Peer exchange for the Bitorch overlay: every node keeps a registry of the
//! peers it knows, announces itself to them, learns new peers from their
//! answers and keeps checking that the peers it knows are still alive.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      BITORCH PEX NODE                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  HTTP API (8000)          ←── register, peer_list, health   │
//! │  Peer Registry (RocksDB)  ←── one record per address        │
//! │  Gossip Registration      ──→ announce, learn, propagate    │
//! │  Membership Monitor       ──→ probe stale, retire dead      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

mod api;
mod config;
mod gossip;
mod monitor;
mod peer;
mod protocol;
mod registry;

#[cfg(test)]
mod testing;

use api::{Metrics, RateLimiter, RegistrationService};
use config::{NodeConfig, OperatingMode};
use gossip::{Gossip, HttpTransport, PeerTransport};
use monitor::MembershipMonitor;
use peer::{PeerPublic, RawPeer};
use registry::{PeerRegistry, PeerStore};

/// Bitorch PEX - overlay peer membership and discovery
#[derive(Parser, Debug)]
#[command(name = "bitorch-pex")]
#[command(author = "Bitorch Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Peer exchange node for the Bitorch overlay", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "pex-node.toml")]
    config: PathBuf,

    /// Data directory for the peer registry
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Operating mode (address validation strictness)
    #[arg(long, env = "PEX_ENV", value_enum)]
    mode: Option<OperatingMode>,

    /// HTTP API port
    #[arg(long, env = "PEX_PORT")]
    api_port: Option<u16>,

    /// Address other peers reach this node at
    #[arg(long, env = "PEX_PUBLIC_ADDRESS")]
    public_address: Option<String>,

    /// Human-readable node name
    #[arg(long, env = "PEX_PEER_NAME")]
    display_name: Option<String>,

    /// Registry size at which propagation stops
    #[arg(long, env = "PEX_MAX_DEPTH")]
    max_depth: Option<usize>,

    /// Peers shared per response (0 = none, -1 = all)
    #[arg(long, env = "PEX_SHARE_PEERS", allow_hyphen_values = true)]
    share_peers: Option<i64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into())
        )
        .init();

    info!("🌐 Bitorch PEX Node v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = if args.config.exists() {
        NodeConfig::load(&args.config)?
    } else {
        warn!("Config file {:?} not found, using defaults", args.config);
        NodeConfig::default()
    };

    // Override config with CLI args
    let config = config
        .with_mode(args.mode)
        .with_api_port(args.api_port)
        .with_public_address(args.public_address)
        .with_display_name(args.display_name)
        .with_max_depth(args.max_depth)
        .with_share_peers(args.share_peers);

    config.validate()?;

    let me = config.self_peer()?;
    let bootstrap = config.bootstrap_peers()?;

    info!("⚙️  Configuration:");
    info!("   Mode: {}", config.mode.as_str());
    info!("   Identity: {}", me);
    info!("   API: {}:{}", config.bind_address, config.api_port);
    info!("   Max depth: {}", config.max_depth);
    info!("   Share peers: {}", config.share_peers);
    info!("   Stale after: {}s, dead after: {}s", config.stale_after_secs, config.dead_after_secs);
    info!("   Bootstrap peers: {}", bootstrap.len());

    // Initialize peer registry
    tokio::fs::create_dir_all(&args.data_dir).await?;
    let registry_path = args.data_dir.join("peer_registry");
    let store: Arc<dyn PeerStore> =
        Arc::new(PeerRegistry::open(&registry_path, config.max_request_history)?);
    info!("📦 Peer registry opened at {:?}", registry_path);

    store.upsert(me.to_internal()).await?;
    apply_operator_lists(&config, store.as_ref()).await?;

    let metrics = Arc::new(Metrics::new());
    let transport: Arc<dyn PeerTransport> = Arc::new(HttpTransport::new(config.request_timeout())?);

    let gossip = Arc::new(
        Gossip::new(me.clone(), config.mode, store.clone(), transport.clone(), metrics.clone())
            .with_max_depth(config.max_depth)
            .with_handshake_timeout(config.request_timeout()),
    );

    let service = Arc::new(
        RegistrationService::new(me.clone(), config.mode, store.clone(), metrics.clone())
            .with_share_limit(config.share_limit(), config.share_allow_listed_only)
            .with_cooldown(config.reregister_cooldown())
            .with_rate_limiter(RateLimiter::new(
                config.rate_limit_per_minute,
                config.max_violations_before_ban,
                chrono::Duration::seconds(config.ban_duration_secs as i64),
            )),
    );

    let monitor = Arc::new(
        MembershipMonitor::new(store.clone(), transport, gossip.clone(), metrics.clone())
            .with_bootstrap(bootstrap.clone())
            .with_thresholds(config.thresholds())
            .with_probe_timeout(config.request_timeout()),
    );

    let bind: SocketAddr = format!("{}:{}", config.bind_address, config.api_port).parse()?;

    // Start all services concurrently
    let api_handle = tokio::spawn(api::run_api_server(bind, service, metrics));

    let join_handle = tokio::spawn(async move {
        if bootstrap.is_empty() {
            info!("No bootstrap peers configured, waiting to be contacted");
            return;
        }
        let report = gossip.register(bootstrap).await;
        info!(
            "🤝 Joined overlay: {} contacted, {} succeeded, {} discovered",
            report.contacted, report.succeeded, report.discovered
        );
    });

    let monitor_handle = tokio::spawn(monitor.run(config.monitor_interval()));

    info!("✅ All services started");
    info!("   Press Ctrl+C to shutdown gracefully");

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 Shutdown signal received");
        }
        result = api_handle => {
            error!("HTTP API exited: {:?}", result);
        }
        result = monitor_handle => {
            error!("Membership monitor exited: {:?}", result);
        }
    }

    // Startup join may still be running
    join_handle.abort();

    // Graceful shutdown: flush registry
    store.flush().await?;
    info!("📦 Peer registry flushed to disk");

    info!("👋 Bitorch PEX node shutting down");
    Ok(())
}

/// Bring the registry's allow/deny flags in line with the configuration
async fn apply_operator_lists(config: &NodeConfig, store: &dyn PeerStore) -> anyhow::Result<()> {
    // Listed addresses need not be publicly routable
    let listed = |addresses: &[String]| -> anyhow::Result<Vec<PeerPublic>> {
        addresses
            .iter()
            .map(|address| {
                let raw = RawPeer {
                    address: address.clone(),
                    ..RawPeer::default()
                };
                Ok(PeerPublic::validate(raw, OperatingMode::Development)?)
            })
            .collect()
    };

    let allow = listed(&config.allow_list)?;
    let deny = listed(&config.deny_list)?;
    registry::sync_operator_lists(store, &allow, &deny).await?;

    info!(
        "🛡️  Operator lists: {} allowed, {} denied",
        allow.len(),
        deny.len()
    );

    Ok(())
}
