// =============================================================================
// Trading Engine (C6) — per-exchange signal-to-order orchestration
// =============================================================================
//
// One instance per exchange. Runs the pipeline described for every inbound
// signal: cooldown check, price fetch, range decision, symbol resolution,
// quantity sizing, leverage, entry, brackets, persist, cooldown update.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{info, instrument, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::exchange::Exchange;
use crate::orders::OrderCreator;
use crate::repository::TradeRepository;
use crate::risk::{StopLossManager, TakeProfitManager};
use crate::symbol::SymbolResolver;
use crate::types::{Exchange as ExchangeEnum, OrderKind, PositionSide, SignalOrderType, Signal, Trade, TradeStatus};

pub struct TradingEngine {
    exchange_kind: ExchangeEnum,
    exchange: Arc<dyn Exchange>,
    symbol_resolver: Arc<SymbolResolver>,
    trades: Arc<dyn TradeRepository>,
    config: Arc<EngineConfig>,
    /// Last successful entry time per coin, process-local, advisory only.
    cooldowns: Mutex<HashMap<String, Instant>>,
}

impl TradingEngine {
    pub fn new(
        exchange_kind: ExchangeEnum,
        exchange: Arc<dyn Exchange>,
        symbol_resolver: Arc<SymbolResolver>,
        trades: Arc<dyn TradeRepository>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            exchange_kind,
            exchange,
            symbol_resolver,
            trades,
            config,
            cooldowns: Mutex::new(HashMap::new()),
        }
    }

    fn check_cooldown(&self, coin: &str) -> Result<(), EngineError> {
        let cooldowns = self.cooldowns.lock();
        if let Some(last) = cooldowns.get(coin) {
            let elapsed = last.elapsed();
            let required = StdDuration::from_secs(self.config.trade_cooldown_secs);
            if elapsed < required {
                let remaining = required - elapsed;
                return Err(EngineError::CooldownActive { remaining_secs: remaining.as_secs() });
            }
        }
        Ok(())
    }

    fn record_cooldown(&self, coin: &str) {
        self.cooldowns.lock().insert(coin.to_string(), Instant::now());
    }

    /// Decide the effective entry price from the signal's price(s), the
    /// order type, and the current market price. Returns `OutOfRange` for a
    /// MARKET signal whose range the current price has left.
    fn decide_entry_price(signal: &Signal, current_price: Decimal) -> Result<(Decimal, bool), EngineError> {
        let (lo, hi) = signal.entry_range().ok_or_else(|| EngineError::Validation("signal has no entry prices".into()))?;

        match signal.order_type {
            SignalOrderType::Market => {
                if lo == hi {
                    return Ok((current_price, true));
                }
                let in_range = match signal.position_type {
                    PositionSide::Long => current_price <= hi,
                    PositionSide::Short => current_price >= lo,
                };
                if !in_range {
                    return Err(EngineError::OutOfRange);
                }
                Ok((current_price, true))
            }
            SignalOrderType::Limit => {
                if lo == hi {
                    return Ok((lo, false));
                }
                let price = match signal.position_type {
                    PositionSide::Long => hi,
                    PositionSide::Short => lo,
                };
                Ok((price, false))
            }
        }
    }

    #[instrument(skip(self, signal), fields(coin = %signal.coin_symbol, trader = %signal.trader))]
    pub async fn process_signal(&self, signal: &Signal) -> Result<Trade, EngineError> {
        self.check_cooldown(&signal.coin_symbol)?;

        let current_price = self.exchange.get_mark_price(&SymbolResolver::native_pair(self.exchange_kind, &signal.coin_symbol)).await?;

        let (effective_price, is_market) = Self::decide_entry_price(signal, current_price)?;

        let (pair, filters) = self
            .symbol_resolver
            .resolve(self.exchange.as_ref(), self.exchange_kind, &signal.coin_symbol)
            .await?;

        let raw_qty = self.config.trade_amount / effective_price
            * Decimal::from(signal.quantity_multiplier.unwrap_or(1));
        let quantity = SymbolResolver::round_quantity(&filters, raw_qty);

        if let Err(e) = self.exchange.set_leverage(&pair, 1).await {
            warn!(pair, error = %e, "set_leverage failed, continuing with exchange default");
        }

        let kind = if is_market { OrderKind::Market } else { OrderKind::Limit };
        let entry_price_for_order = if is_market { None } else { Some(effective_price) };

        let entry_resp = match OrderCreator::create_entry(
            self.exchange.as_ref(),
            &pair,
            &filters,
            signal.position_type,
            kind,
            quantity,
            entry_price_for_order,
            signal.client_order_id.clone(),
            effective_price,
        )
        .await
        {
            Ok(resp) => resp,
            Err(e) => return self.fail(signal, e).await,
        };

        let mut trade = Trade {
            id: 0,
            source_message_id: signal.source_message_id.clone(),
            coin_symbol: signal.coin_symbol.clone(),
            trader: signal.trader.clone(),
            exchange: self.exchange_kind,
            side: signal.position_type,
            status: TradeStatus::Open,
            position_size: quantity,
            entry_price: entry_resp.avg_price.unwrap_or(effective_price),
            exit_price: None,
            exchange_order_id: Some(entry_resp.order_id.clone()),
            stop_loss_order_id: None,
            take_profit_order_ids: vec![],
            content: format!("{} Entry: {}", signal.coin_symbol, effective_price),
            created_at: signal.timestamp,
            closed_at: None,
            merged_into_trade_id: None,
            exchange_response: Some(entry_resp.raw.clone()),
            exchange_update_time: Some(chrono::Utc::now()),
            trade_group_id: signal.trade_group_id.clone(),
        };

        match StopLossManager::ensure_for_position(self.exchange.as_ref(), &pair, &filters, &trade, signal.stop_loss, self.config.default_bracket_pct).await {
            Ok(order_id) => trade.stop_loss_order_id = Some(order_id),
            Err(e) => warn!(trade_source = %signal.source_message_id, error = %e, "stop-loss bracket creation failed; auditor will remediate"),
        }

        if !signal.take_profits.is_empty() {
            let fraction = Decimal::ONE / Decimal::from(signal.take_profits.len() as u64);
            let levels: Vec<(Decimal, Decimal)> = signal.take_profits.iter().map(|tp| (*tp, fraction)).collect();
            match TakeProfitManager::ensure_for_position(self.exchange.as_ref(), &pair, &filters, &trade, &levels, self.config.default_bracket_pct).await {
                Ok(ids) => trade.take_profit_order_ids = ids,
                Err(e) => warn!(trade_source = %signal.source_message_id, error = %e, "take-profit bracket creation failed; auditor will remediate"),
            }
        }

        let persisted = self.trades.insert(trade).await?;
        self.record_cooldown(&signal.coin_symbol);

        info!(trade_id = persisted.id, pair, "entry processed successfully");
        Ok(persisted)
    }

    async fn fail(&self, signal: &Signal, err: EngineError) -> Result<Trade, EngineError> {
        warn!(coin = %signal.coin_symbol, trader = %signal.trader, error = %err, "signal rejected");
        let trade = Trade {
            id: 0,
            source_message_id: signal.source_message_id.clone(),
            coin_symbol: signal.coin_symbol.clone(),
            trader: signal.trader.clone(),
            exchange: self.exchange_kind,
            side: signal.position_type,
            status: TradeStatus::Failed,
            position_size: Decimal::ZERO,
            entry_price: Decimal::ZERO,
            exit_price: None,
            exchange_order_id: None,
            stop_loss_order_id: None,
            take_profit_order_ids: vec![],
            content: format!("{} rejected: {}", signal.coin_symbol, err),
            created_at: signal.timestamp,
            closed_at: None,
            merged_into_trade_id: None,
            exchange_response: None,
            exchange_update_time: None,
            trade_group_id: signal.trade_group_id.clone(),
        };
        self.trades.insert(trade).await?;
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SignalOrderType;
    use rust_decimal_macros::dec;

    fn signal_with_range(lo: Decimal, hi: Decimal, order_type: SignalOrderType, side: PositionSide) -> Signal {
        Signal {
            coin_symbol: "BTC".to_string(),
            position_type: side,
            order_type,
            entry_prices: vec![lo, hi],
            stop_loss: None,
            take_profits: vec![],
            quantity_multiplier: None,
            client_order_id: None,
            trader: "@Johnny".to_string(),
            source_message_id: "sig-1".to_string(),
            timestamp: chrono::Utc::now(),
            trade_group_id: None,
        }
    }

    #[test]
    fn market_range_accepts_boundary_price_long() {
        let signal = signal_with_range(dec!(85050), dec!(86050), SignalOrderType::Market, PositionSide::Long);
        let (price, is_market) = TradingEngine::decide_entry_price(&signal, dec!(86050)).unwrap();
        assert!(is_market);
        assert_eq!(price, dec!(86050));
    }

    #[test]
    fn market_range_rejects_price_outside_range() {
        let signal = signal_with_range(dec!(85050), dec!(86050), SignalOrderType::Market, PositionSide::Long);
        let result = TradingEngine::decide_entry_price(&signal, dec!(86100));
        assert!(matches!(result, Err(EngineError::OutOfRange)));
    }

    #[test]
    fn limit_range_uses_hi_for_long() {
        let signal = signal_with_range(dec!(85050), dec!(86050), SignalOrderType::Limit, PositionSide::Long);
        let (price, is_market) = TradingEngine::decide_entry_price(&signal, dec!(86000)).unwrap();
        assert!(!is_market);
        assert_eq!(price, dec!(86050));
    }

    #[test]
    fn limit_range_uses_lo_for_short() {
        let signal = signal_with_range(dec!(85050), dec!(86050), SignalOrderType::Limit, PositionSide::Short);
        let (price, _) = TradingEngine::decide_entry_price(&signal, dec!(86000)).unwrap();
        assert_eq!(price, dec!(85050));
    }
}
