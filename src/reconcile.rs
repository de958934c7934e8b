// =============================================================================
// Active-Futures Reconciler (C9)
// =============================================================================
//
// Background task that watches an externally-sourced "currently active
// futures" feed for entries that moved from ACTIVE to CLOSED, scores them
// against our own open trades, and closes the best match at market. A single
// mutex serializes both the watermark read and the per-entry processing loop
// so a slow exchange call can't let two passes race on the same trade.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::Mutex;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::exchange::Exchange;
use crate::position::PositionManager;
use crate::repository::{ActiveFuturesRepository, AlertRepository, TradeRepository};
use crate::symbol::SymbolResolver;
use crate::txn::TransactionManager;
use crate::types::{ActiveFutures, ActiveFuturesStatus, Trade, TradeMatch, TradeStatus};

/// Coin tickers recognised by the content extractor, in priority order.
/// Mirrors the fixed watch-list the upstream alert parser uses; an unlisted
/// coin falls back to the generic "`XYZ` Entry:" pattern below.
const KNOWN_TICKERS: &[&str] = &[
    "BTC", "ETH", "SOL", "ADA", "DOT", "LINK", "UNI", "AAVE", "MATIC", "AVAX", "NEAR", "FTM",
    "ALGO", "ATOM", "XRP", "DOGE", "SHIB", "PEPE", "BONK", "WIF", "FLOKI", "TOSHI", "TURBO",
    "HYPE", "FARTCOIN", "VELVET", "NAORIS", "PUMP", "SUI", "ENA", "ZEC", "TAO",
];

pub struct ActiveFuturesReconciler {
    active_futures: Arc<dyn ActiveFuturesRepository>,
    trades: Arc<dyn TradeRepository>,
    alerts: Arc<dyn AlertRepository>,
    exchanges: HashMap<crate::types::Exchange, Arc<dyn Exchange>>,
    symbol_resolver: Arc<SymbolResolver>,
    config: Arc<EngineConfig>,
    /// Guards both the watermark read and the processing loop below it.
    sync_lock: Mutex<Option<DateTime<Utc>>>,
}

impl ActiveFuturesReconciler {
    pub fn new(
        active_futures: Arc<dyn ActiveFuturesRepository>,
        trades: Arc<dyn TradeRepository>,
        alerts: Arc<dyn AlertRepository>,
        exchanges: HashMap<crate::types::Exchange, Arc<dyn Exchange>>,
        symbol_resolver: Arc<SymbolResolver>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            active_futures,
            trades,
            alerts,
            exchanges,
            symbol_resolver,
            config,
            sync_lock: Mutex::new(None),
        }
    }

    /// Extract a coin ticker from free-form alert content: a known ticker
    /// anywhere in the uppercased text, else the token preceding "Entry:".
    pub fn extract_coin_symbol(content: &str) -> Option<String> {
        let upper = content.to_uppercase();
        for ticker in KNOWN_TICKERS {
            if upper.split(|c: char| !c.is_alphanumeric()).any(|tok| tok == *ticker) {
                return Some(ticker.to_string());
            }
        }

        let words: Vec<&str> = upper.split_whitespace().collect();
        for (i, word) in words.iter().enumerate() {
            if word.starts_with("ENTRY") {
                if i > 0 {
                    let candidate = words[i - 1].trim_matches(|c: char| !c.is_alphanumeric());
                    if candidate.len() >= 2 && candidate.chars().all(|c| c.is_alphanumeric()) {
                        return Some(candidate.to_string());
                    }
                }
            }
        }
        None
    }

    /// Jaccard similarity over whitespace-separated uppercased tokens.
    fn content_similarity(a: &str, b: &str) -> Decimal {
        if a.is_empty() && b.is_empty() {
            return Decimal::ONE;
        }
        if a.is_empty() || b.is_empty() {
            return Decimal::ZERO;
        }
        let au = a.to_uppercase();
        let bu = b.to_uppercase();
        if au == bu {
            return Decimal::ONE;
        }

        let words_a: std::collections::HashSet<&str> = au.split_whitespace().collect();
        let words_b: std::collections::HashSet<&str> = bu.split_whitespace().collect();
        if words_a.is_empty() || words_b.is_empty() {
            return Decimal::ZERO;
        }

        let intersection = words_a.intersection(&words_b).count();
        let union = words_a.union(&words_b).count();
        if union == 0 {
            return Decimal::ZERO;
        }
        Decimal::from(intersection as u64) / Decimal::from(union as u64)
    }

    fn is_timestamp_proximate(a: DateTime<Utc>, b: DateTime<Utc>, max_hours: i64) -> bool {
        (a - b).abs() <= Duration::hours(max_hours)
    }

    /// Score every open trade for the same trader against `active_futures`,
    /// returning matches at or above the configured confidence threshold,
    /// highest confidence first.
    fn score_candidates(
        &self,
        active_futures: &ActiveFutures,
        candidates: &[Trade],
    ) -> Vec<TradeMatch> {
        let coin_symbol = match Self::extract_coin_symbol(&active_futures.content) {
            Some(c) => c,
            None => {
                warn!(active_futures_id = active_futures.id, "no coin symbol extracted from active futures content");
                return vec![];
            }
        };

        let mut matches = Vec::new();

        for trade in candidates {
            if trade.trader != active_futures.trader {
                continue;
            }

            let mut confidence = dec!(0.4);
            let mut reasons = vec!["trader_match".to_string()];

            if trade.coin_symbol.eq_ignore_ascii_case(&coin_symbol) {
                confidence += dec!(0.4);
                reasons.push("coin_symbol_match".to_string());
            } else {
                confidence -= dec!(0.2);
            }

            let similarity = Self::content_similarity(&active_futures.content, &trade.content);
            if similarity > dec!(0.2) {
                confidence += similarity * dec!(0.2);
                reasons.push(format!("content_similarity_{similarity:.2}"));
            }

            if Self::is_timestamp_proximate(active_futures.created_at, trade.created_at, 24) {
                confidence += dec!(0.1);
                reasons.push("timestamp_proximate".to_string());
            }

            if confidence >= self.config.match_confidence_threshold {
                matches.push(TradeMatch {
                    active_futures_id: active_futures.id,
                    trade_id: trade.id,
                    confidence,
                    reasons,
                });
            }
        }

        matches.sort_by(|a, b| b.confidence.cmp(&a.confidence));
        matches
    }

    async fn find_trade_matches(&self, active_futures: &ActiveFutures) -> Result<Vec<TradeMatch>, EngineError> {
        let coin_symbol = Self::extract_coin_symbol(&active_futures.content);

        let candidates = if let Some(coin) = &coin_symbol {
            let by_coin = self.trades.find_by_coin(coin).await?;
            let filtered: Vec<Trade> = by_coin
                .into_iter()
                .filter(|t| t.trader == active_futures.trader && t.is_open())
                .collect();
            if !filtered.is_empty() {
                filtered
            } else {
                self.trades.find_open_by_trader(&active_futures.trader).await?
            }
        } else {
            self.trades.find_open_by_trader(&active_futures.trader).await?
        };

        Ok(self.score_candidates(active_futures, &candidates))
    }

    async fn close_trade_position(&self, trade: &Trade) -> Result<(), EngineError> {
        let exchange = self
            .exchanges
            .get(&trade.exchange)
            .ok_or_else(|| EngineError::Validation(format!("no exchange client configured for {}", trade.exchange)))?;

        let (pair, _filters) = self
            .symbol_resolver
            .resolve(exchange.as_ref(), trade.exchange, &trade.coin_symbol)
            .await?;

        let exit_price = if PositionManager::is_position_open(exchange.as_ref(), &pair).await? {
            let outcome = PositionManager::close_at_market(exchange.as_ref(), &pair, trade, "active_futures_closed", Decimal::from(100)).await?;
            outcome.exit_price
        } else {
            warn!(trade_id = trade.id, pair, "active futures entry closed but live position already flat; marking trade closed locally");
            None
        };

        let pending = self.alerts.find_pending_for_trade(&trade.source_message_id).await?;

        let mut txn = TransactionManager::new();

        let trade_id = trade.id;
        let original_status = trade.status;
        let original_closed_at = trade.closed_at;
        let original_exit_price = trade.exit_price;
        let trades_op = self.trades.clone();
        let trades_rb = self.trades.clone();
        txn = txn.add_step(
            format!("close_trade_{trade_id}"),
            move || {
                Box::pin(async move {
                    trades_op
                        .update(trade_id, Box::new(move |t| {
                            t.status = TradeStatus::Closed;
                            t.closed_at = Some(Utc::now());
                            t.exit_price = exit_price;
                        }))
                        .await?;
                    Ok(())
                })
            },
            Some(move || {
                Box::pin(async move {
                    let _ = trades_rb
                        .update(trade_id, Box::new(move |t| {
                            t.status = original_status;
                            t.closed_at = original_closed_at;
                            t.exit_price = original_exit_price;
                        }))
                        .await;
                })
            }),
        );

        for alert in &pending {
            let alert_id = alert.id;
            let alerts_op = self.alerts.clone();
            let alerts_rb = self.alerts.clone();
            txn = txn.add_step(
                format!("mark_alert_processed_{alert_id}"),
                move || {
                    Box::pin(async move {
                        alerts_op
                            .update(alert_id, Box::new(|a| a.status = crate::types::AlertStatus::Processed))
                            .await?;
                        Ok(())
                    })
                },
                Some(move || {
                    Box::pin(async move {
                        let _ = alerts_rb.update(alert_id, Box::new(|a| a.status = crate::types::AlertStatus::Pending)).await;
                    })
                }),
            );
        }

        txn.execute().await?;

        info!(trade_id = trade.id, pair, "closed trade due to active futures closure");
        Ok(())
    }

    async fn process_one(&self, active_futures: &ActiveFutures) -> Result<bool, EngineError> {
        let matches = self.find_trade_matches(active_futures).await?;

        let best = match matches.first() {
            Some(m) => m,
            None => {
                warn!(active_futures_id = active_futures.id, trader = %active_futures.trader, "no matching open trade found for closed active futures entry");
                return Ok(false);
            }
        };

        info!(active_futures_id = active_futures.id, trade_id = best.trade_id, confidence = %best.confidence, "matched closed active futures to trade");

        let trade = self.trades.get(best.trade_id).await?;
        self.close_trade_position(&trade).await?;
        Ok(true)
    }

    /// One synchronization pass: fetch CLOSED entries for the watched
    /// traders created since the watermark, process each under the same
    /// lock, then advance the watermark.
    pub async fn sync_once(&self) -> Result<(usize, usize), EngineError> {
        let mut watermark = self.sync_lock.lock().await;

        let cutoff = watermark.unwrap_or_else(|| Utc::now() - Duration::hours(self.config.reconcile_lookback_hours));

        let closed = self
            .active_futures
            .find_by_traders_and_status(&self.config.target_traders, ActiveFuturesStatus::Closed)
            .await?;

        let recent: Vec<ActiveFutures> = closed
            .into_iter()
            .filter(|af| af.stopped_at.map(|t| t >= cutoff).unwrap_or(false))
            .collect();

        if recent.is_empty() {
            *watermark = Some(Utc::now());
            return Ok((0, 0));
        }

        info!(count = recent.len(), "processing recently closed active futures entries");

        let mut processed = 0usize;
        let mut closed_count = 0usize;

        for af in &recent {
            processed += 1;
            match self.process_one(af).await {
                Ok(true) => closed_count += 1,
                Ok(false) => {}
                Err(e) => error!(active_futures_id = af.id, error = %e, "error processing closed active futures entry"),
            }
        }

        *watermark = Some(Utc::now());
        Ok((processed, closed_count))
    }

    /// Run forever on the configured poll interval. The first tick fires
    /// immediately.
    pub async fn run(self: Arc<Self>) {
        info!(interval_secs = self.config.reconcile_interval_secs, "starting active futures reconciler");
        let mut ticker = interval(std::time::Duration::from_secs(self.config.reconcile_interval_secs));

        loop {
            ticker.tick().await;
            match self.sync_once().await {
                Ok((processed, closed)) if processed > 0 => {
                    info!(processed, closed, "active futures sync pass complete");
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "active futures sync pass failed"),
            }
        }
    }
}
