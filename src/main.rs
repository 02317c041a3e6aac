// =============================================================================
// Meridian Trading Engine — Main Entry Point
// =============================================================================
//
// A localhost trading-engine server: declarative algorithms evaluated over a
// live futures feed (or historical bars in backtests), with a REST control
// API and a WebSocket event stream. Fails fast when the configured port is
// taken, the bind address is not loopback, or the data directory cannot be
// created.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod algorithm;
mod api;
mod backtest;
mod broker;
mod conditions;
mod config;
mod errors;
mod events;
mod indicators;
mod manager;
mod market;
mod position;
mod runtime;
mod store;
mod types;

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::ApiState;
use crate::backtest::BacktestExecutor;
use crate::broker::gateway::GatewayClient;
use crate::broker::mock::MockBroker;
use crate::broker::MarketBroker;
use crate::config::ServerConfig;
use crate::events::EventBus;
use crate::manager::InstanceManager;
use crate::store::DocumentStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Meridian trading engine starting up");

    // ── 2. Server configuration (fail fast) ──────────────────────────────
    let server_config = ServerConfig::from_env().context("invalid server configuration")?;
    server_config
        .validate()
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let store = Arc::new(
        DocumentStore::open(&server_config.data_dir)
            .map_err(|e| anyhow::anyhow!("data directory unusable: {e}"))?,
    );
    info!(data_dir = %server_config.data_dir.display(), "document store ready");

    // ── 3. Broker selection ──────────────────────────────────────────────
    let mut connection = store.load_connection();
    connection.apply_env();

    let broker: Arc<dyn MarketBroker> = if connection.has_credentials() {
        info!(api_url = %connection.api_url, "using gateway broker");
        Arc::new(GatewayClient::new(
            connection.username.clone(),
            connection.api_key.clone(),
            connection.api_url.clone(),
            connection.ws_url.clone(),
        ))
    } else {
        warn!("no broker credentials configured — running with the simulated broker");
        Arc::new(MockBroker::new())
    };

    if connection.autoconnect && connection.has_credentials() {
        let autoconnect_broker = Arc::clone(&broker);
        tokio::spawn(async move {
            match autoconnect_broker.authenticate().await {
                Ok(token) => info!(expires_at = %token.expires_at, "broker autoconnect ok"),
                Err(e) => error!(error = %e, "broker autoconnect failed"),
            }
        });
    }

    // ── 4. Engine assembly ───────────────────────────────────────────────
    let events = EventBus::new(server_config.event_capacity);
    let manager = InstanceManager::new(Arc::clone(&broker), events.clone(), Arc::clone(&store));
    let executor = Arc::new(BacktestExecutor::new(events.clone()));

    let poller = Arc::clone(&manager).spawn_state_poller();

    // ── 5. API server (fail fast on a taken port) ────────────────────────
    let api_state = ApiState::new(
        Arc::clone(&manager),
        Arc::clone(&executor),
        events.clone(),
        Arc::clone(&store),
    );
    let app = api::rest::router(api_state);

    let bind = format!("{}:{}", server_config.bind_addr, server_config.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("cannot bind {bind} — is the port in use?"))?;
    info!(addr = %bind, "API server listening");

    // ── 6. Serve until ctrl-c ────────────────────────────────────────────
    let server = axum::serve(listener, app).with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        warn!("shutdown signal received");
    });

    server.await.context("API server failed")?;

    // ── 7. Graceful teardown ─────────────────────────────────────────────
    poller.abort();
    manager.stop_all().await;
    info!("Meridian shut down complete");
    Ok(())
}
