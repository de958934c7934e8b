// =============================================================================
// signal-core — Main Entry Point
// =============================================================================
//
// Builds the exchange clients, the shared application state, spawns the
// active-futures reconciliation loop, and serves the signal/alert ingestion
// API.
// =============================================================================

mod api;
mod app_state;
mod config;
mod engine;
mod error;
mod exchange;
mod followup;
mod locks;
mod orders;
mod position;
mod reconcile;
mod repository;
mod risk;
mod router;
mod symbol;
mod txn;
mod types;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::EngineConfig;
use crate::exchange::binance::BinanceExchange;
use crate::exchange::kucoin::KucoinExchange;
use crate::exchange::Exchange as ExchangeCapability;
use crate::repository::{InMemoryActiveFuturesRepository, InMemoryAlertRepository, InMemoryTradeRepository};
use crate::types::Exchange;

const CONFIG_PATH: &str = "engine_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("signal-core starting up");

    let config = EngineConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load engine config, using defaults");
        EngineConfig::default()
    });

    info!(
        trade_amount = %config.trade_amount,
        default_exchange = %config.default_exchange,
        target_traders = ?config.target_traders,
        "engine config loaded"
    );

    let binance_api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let binance_api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
    let kucoin_api_key = std::env::var("KUCOIN_API_KEY").unwrap_or_default();
    let kucoin_api_secret = std::env::var("KUCOIN_API_SECRET").unwrap_or_default();
    let kucoin_passphrase = std::env::var("KUCOIN_API_PASSPHRASE").unwrap_or_default();

    let mut exchanges: HashMap<Exchange, Arc<dyn ExchangeCapability>> = HashMap::new();
    exchanges.insert(
        Exchange::Binance,
        Arc::new(BinanceExchange::new(binance_api_key, binance_api_secret, config.maker_tick_offset)),
    );
    exchanges.insert(
        Exchange::Kucoin,
        Arc::new(KucoinExchange::new(kucoin_api_key, kucoin_api_secret, kucoin_passphrase)),
    );

    let trades = Arc::new(InMemoryTradeRepository::new());
    let alerts = Arc::new(InMemoryAlertRepository::new());
    let active_futures = Arc::new(InMemoryActiveFuturesRepository::new());

    let state = AppState::new(config, exchanges, trades, alerts, active_futures);

    state.spawn_reconciler();

    let api_state = state.clone();
    let bind_addr = std::env::var("SIGNAL_CORE_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr).await.expect("failed to bind API server");
        info!(addr = %bind_addr, "API server listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("all subsystems running, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    if let Err(e) = state.config.save(CONFIG_PATH) {
        error!(error = %e, "failed to save engine config on shutdown");
    }

    info!("signal-core shut down complete");
    Ok(())
}
