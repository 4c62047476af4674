// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Webhook Rate Proxy Service
//!
//! Accepts webhook deliveries on behalf of many endpoints and forwards
//! them to a rate-limited upstream, queueing instead of failing when an
//! endpoint's budget is spent.
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `BIND_ADDR`: Server bind address (default: 0.0.0.0:8080)
//! - `MAX_QUEUE_SIZE`: Max queued deliveries per webhook (default: 100)
//! - `BAN_THRESHOLD`: Overflow errors before a ban, 0 disables (default: 50)
//! - `DRAIN_INTERVAL_MS`: Drain tick interval (default: 1000)
//! - `DRAIN_ORDER`: `fifo` or `lifo` (default: fifo)
//! - `RESET_ERRORS_ON_DRAIN`: Clear error counts once a queue empties (default: false)
//! - `UPSTREAM_URL`: Upstream webhook base URL (default: https://discord.com/api/webhooks)
//! - `UPSTREAM_TIMEOUT_MS`: Forwarding call timeout (default: 10000)
//! - `BAN_LIST_PATH`: Ban list JSON file, empty for memory only (default: bans.json)
//! - `HISTORY_CAPACITY`: Recent deliveries shown on the status page (default: 100)
//! - `MAX_PAYLOAD_BYTES`: Largest accepted body (default: 8 MiB)

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use webhook_rate_proxy::{
    analytics::{Fanout, LogAnalytics},
    ban::{BanRegistry, BanStore, JsonFileBanStore, MemoryBanStore},
    config::{Config, DrainOrder},
    drain::DrainScheduler,
    error::ConfigError,
    handlers::{router, AppState},
    limiter::Proxy,
    metrics::ProxyMetrics,
    upstream::HttpUpstream,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    // Load configuration
    let config = load_config()?;
    info!(
        bind_addr = %config.bind_addr,
        upstream = %config.upstream.base_url,
        max_queue_size = config.proxy.max_queue_size,
        ban_threshold = config.proxy.ban_threshold,
        drain_interval_ms = config.proxy.drain_interval_ms,
        "Starting webhook rate proxy"
    );

    // Load bans
    let ban_store: Arc<dyn BanStore> = match &config.bans.path {
        Some(path) => Arc::new(JsonFileBanStore::new(path)),
        None => Arc::new(MemoryBanStore::default()),
    };
    let bans = BanRegistry::load(ban_store).await?;

    // Create application state
    let metrics = Arc::new(ProxyMetrics::new()?);
    let upstream = Arc::new(HttpUpstream::new(&config.upstream)?);
    let analytics = Fanout::new()
        .with(Arc::new(LogAnalytics))
        .with(metrics.clone());
    let proxy = Arc::new(
        Proxy::new(config.proxy.clone(), upstream, bans, metrics)
            .with_analytics(Arc::new(analytics)),
    );
    proxy.log_startup();

    // Spawn drain task
    let drain = tokio::spawn(DrainScheduler::new(proxy.clone()).run());

    let state = Arc::new(AppState {
        proxy,
        config: config.clone(),
    });
    let app = router(state);

    // Start server
    let addr: SocketAddr = config.bind_addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    drain.abort();
    info!("Shut down");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

/// Load configuration from environment variables.
fn load_config() -> Result<Config, ConfigError> {
    let mut config = Config::default();

    if let Ok(addr) = std::env::var("BIND_ADDR") {
        config.bind_addr = addr;
    }
    if let Some(v) = env_parse("MAX_QUEUE_SIZE")? {
        config.proxy.max_queue_size = v;
    }
    if let Some(v) = env_parse("BAN_THRESHOLD")? {
        config.proxy.ban_threshold = v;
    }
    if let Some(v) = env_parse::<u64>("DRAIN_INTERVAL_MS")? {
        if v == 0 {
            return Err(ConfigError::InvalidValue {
                var: "DRAIN_INTERVAL_MS",
                value: v.to_string(),
            });
        }
        config.proxy.drain_interval_ms = v;
    }
    if let Ok(order) = std::env::var("DRAIN_ORDER") {
        config.proxy.drain_order = DrainOrder::from_str(&order)?;
    }
    if let Some(v) = env_parse("RESET_ERRORS_ON_DRAIN")? {
        config.proxy.reset_errors_on_drain = v;
    }
    if let Ok(url) = std::env::var("UPSTREAM_URL") {
        config.upstream.base_url = url;
    }
    if let Some(v) = env_parse("UPSTREAM_TIMEOUT_MS")? {
        config.proxy.forward_timeout_ms = v;
    }
    if let Ok(path) = std::env::var("BAN_LIST_PATH") {
        config.bans.path = (!path.is_empty()).then(|| PathBuf::from(path));
    }
    if let Some(v) = env_parse("HISTORY_CAPACITY")? {
        config.proxy.history_capacity = v;
    }
    if let Some(v) = env_parse("MAX_PAYLOAD_BYTES")? {
        config.max_payload_bytes = v;
    }

    Ok(config)
}

fn env_parse<T: FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { var, value }),
        Err(_) => Ok(None),
    }
}
