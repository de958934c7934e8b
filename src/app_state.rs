// =============================================================================
// Central Application State — signal-core trading pipeline
// =============================================================================
//
// The single set of shared handles every request-driven task (signal, alert)
// and the long-lived reconciler task operate against. Built once at startup
// and handed out as `Arc<AppState>`.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::engine::TradingEngine;
use crate::error::EngineError;
use crate::exchange::Exchange;
use crate::followup::{DispatchOutcome, FollowupProcessor};
use crate::locks::TradeLockRegistry;
use crate::reconcile::ActiveFuturesReconciler;
use crate::repository::{ActiveFuturesRepository, AlertRepository, TradeRepository};
use crate::router::SignalRouter;
use crate::symbol::SymbolResolver;
use crate::types::{Alert, Exchange as ExchangeEnum, Signal, Trade};

pub struct AppState {
    pub config: Arc<EngineConfig>,
    pub exchanges: HashMap<ExchangeEnum, Arc<dyn Exchange>>,
    pub engines: HashMap<ExchangeEnum, Arc<TradingEngine>>,
    pub symbol_resolver: Arc<SymbolResolver>,
    pub trade_locks: Arc<TradeLockRegistry>,
    pub trades: Arc<dyn TradeRepository>,
    pub alerts: Arc<dyn AlertRepository>,
    pub active_futures: Arc<dyn ActiveFuturesRepository>,
    pub reconciler: Arc<ActiveFuturesReconciler>,
}

impl AppState {
    pub fn new(
        config: EngineConfig,
        exchanges: HashMap<ExchangeEnum, Arc<dyn Exchange>>,
        trades: Arc<dyn TradeRepository>,
        alerts: Arc<dyn AlertRepository>,
        active_futures: Arc<dyn ActiveFuturesRepository>,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let symbol_resolver = Arc::new(SymbolResolver::new(Duration::from_secs(config.symbol_cache_ttl_mins * 60)));

        let mut engines = HashMap::new();
        for (kind, exchange) in &exchanges {
            engines.insert(
                *kind,
                Arc::new(TradingEngine::new(*kind, exchange.clone(), symbol_resolver.clone(), trades.clone(), config.clone())),
            );
        }

        let reconciler = Arc::new(ActiveFuturesReconciler::new(
            active_futures.clone(),
            trades.clone(),
            alerts.clone(),
            exchanges.clone(),
            symbol_resolver.clone(),
            config.clone(),
        ));

        Arc::new(Self {
            config,
            exchanges,
            engines,
            symbol_resolver,
            trade_locks: Arc::new(TradeLockRegistry::new()),
            trades,
            alerts,
            active_futures,
            reconciler,
        })
    }

    /// Route an inbound signal to the engine for its trader's configured
    /// exchange and run the full entry pipeline.
    pub async fn handle_signal(&self, signal: Signal) -> Result<Trade, EngineError> {
        let exchange = SignalRouter::route_initial(&self.config, &signal.trader);
        let engine = self
            .engines
            .get(&exchange)
            .ok_or_else(|| EngineError::Validation(format!("no trading engine configured for {exchange}")))?;
        engine.process_signal(&signal).await
    }

    /// Resolve, aggregate, and dispatch a follow-up alert. The trade-level
    /// keyed lock is acquired per related trade to serialize concurrent
    /// follow-ups referencing the same position.
    pub async fn handle_alert(&self, alert: Alert) -> Result<DispatchOutcome, EngineError> {
        let coin = alert.coin_symbol.clone().unwrap_or_default();
        let candidates = if coin.is_empty() {
            self.trades.find_open_by_trader(&alert.trader).await?
        } else {
            self.trades.find_by_coin(&coin).await?
        };

        let tolerance = chrono::Duration::minutes(self.config.timestamp_tolerance_mins);
        let related_refs = SignalRouter::find_related_trades(&alert, &candidates, tolerance);
        if related_refs.is_empty() {
            warn!(alert_id = alert.id, "no related trade found for follow-up, skipping");
            self.alerts.update(alert.id, Box::new(|a| a.status = crate::types::AlertStatus::Skipped)).await?;
            return Err(EngineError::Validation("no related trade for follow-up".to_string()));
        }
        let related: Vec<Trade> = related_refs.into_iter().cloned().collect();

        // Serialize on the first related trade id; aggregation below folds
        // every other related trade into a single primary under this lock.
        let lock_key = related[0].id;
        let _guard = self.trade_locks.acquire(lock_key).await;

        let primary = FollowupProcessor::resolve_aggregated_target(self.trades.clone(), &related).await?;

        let action = match &alert.parsed_action {
            Some(action) => action.clone(),
            None => FollowupProcessor::classify_content(&alert.content),
        };

        let exchange = self
            .exchanges
            .get(&primary.exchange)
            .ok_or_else(|| EngineError::Validation(format!("no exchange client configured for {}", primary.exchange)))?;

        let outcome = FollowupProcessor::dispatch(exchange.as_ref(), &self.symbol_resolver, &self.config, &primary, &action).await;

        match &outcome {
            // Genuinely unrecognized content: no action taken, alert skipped.
            Ok(DispatchOutcome::Informational) => {
                self.alerts.update(alert.id, Box::new(|a| a.status = crate::types::AlertStatus::Skipped)).await?;
            }
            // Recognized content, whether or not it triggered a position
            // action (e.g. a limit order filling is informational but
            // still a recognized, processed outcome).
            Ok(
                DispatchOutcome::StopLossReplaced { .. }
                | DispatchOutcome::Closed { .. }
                | DispatchOutcome::PartialClose { .. }
                | DispatchOutcome::Cancelled
                | DispatchOutcome::LimitFilled,
            ) => {
                self.alerts.update(alert.id, Box::new(|a| a.status = crate::types::AlertStatus::Processed)).await?;
            }
            Ok(DispatchOutcome::Skipped { reason }) => {
                warn!(alert_id = alert.id, reason, "follow-up dispatch skipped");
                self.alerts.update(alert.id, Box::new(|a| a.status = crate::types::AlertStatus::Skipped)).await?;
            }
            Err(_) => {
                self.alerts.update(alert.id, Box::new(|a| a.status = crate::types::AlertStatus::Failed)).await?;
            }
        }

        info!(alert_id = alert.id, primary_trade_id = primary.id, "follow-up processed");
        outcome
    }

    /// Spawn the background active-futures reconciliation loop. Call once
    /// at startup; the returned handle runs until the process exits.
    pub fn spawn_reconciler(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let reconciler = self.reconciler.clone();
        tokio::spawn(async move {
            reconciler.run().await;
        })
    }
}
