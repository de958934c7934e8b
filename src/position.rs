// =============================================================================
// Position Manager (C5)
// =============================================================================
//
// Resolves the authoritative live size of a trade's position and closes it
// at market, respecting the 100%-close bracket-cancellation discipline: all
// reduce-only bracket orders for the pair must be cancelled before the
// closing order is submitted, or a race could let both a bracket and the
// market close fill.
// =============================================================================

use rust_decimal::Decimal;
use tracing::{info, instrument};

use crate::error::EngineError;
use crate::exchange::Exchange;
use crate::orders::OrderCreator;
use crate::types::{SymbolFilters, Trade, TradeStatus};

pub struct PositionManager;

#[derive(Debug, Clone)]
pub struct CloseOutcome {
    pub exit_price: Option<Decimal>,
    pub exchange_order_id: String,
    pub filled_qty: Option<Decimal>,
    pub status: TradeStatus,
}

impl PositionManager {
    pub async fn is_position_open(exchange: &dyn Exchange, pair: &str) -> Result<bool, EngineError> {
        let positions = exchange.get_positions(Some(pair)).await?;
        Ok(positions.iter().any(|p| p.pair == pair && !p.quantity.is_zero()))
    }

    /// Resolve the effective size to close: the trade record, falling back
    /// to the persisted exchange response, falling back to the live
    /// position lookup.
    async fn resolve_close_size(exchange: &dyn Exchange, pair: &str, trade: &Trade) -> Result<Decimal, EngineError> {
        if !trade.position_size.is_zero() {
            return Ok(trade.position_size);
        }

        if let Some(resp) = &trade.exchange_response {
            if let Some(qty) = resp.get("origQty").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()) {
                return Ok(qty);
            }
        }

        let positions = exchange.get_positions(Some(pair)).await?;
        positions
            .into_iter()
            .find(|p| p.pair == pair)
            .map(|p| p.quantity)
            .ok_or_else(|| EngineError::PositionNotFound(pair.to_string()))
    }

    #[instrument(skip(exchange, trade), fields(trade_id = trade.id, pair))]
    pub async fn close_at_market(
        exchange: &dyn Exchange,
        pair: &str,
        trade: &Trade,
        reason: &str,
        close_percent: Decimal,
    ) -> Result<CloseOutcome, EngineError> {
        if trade.status == TradeStatus::Closed {
            return Ok(CloseOutcome {
                exit_price: trade.exit_price,
                exchange_order_id: trade.exchange_order_id.clone().unwrap_or_default(),
                filled_qty: None,
                status: TradeStatus::Closed,
            });
        }

        if close_percent <= Decimal::ZERO || close_percent > Decimal::from(100) {
            return Err(EngineError::Validation(format!("close_percent out of bounds: {close_percent}")));
        }

        let full_size = Self::resolve_close_size(exchange, pair, trade).await?;
        let close_qty = full_size * close_percent / Decimal::from(100);
        let is_full_close = close_percent == Decimal::from(100);

        if is_full_close {
            if let Some(sl) = &trade.stop_loss_order_id {
                OrderCreator::cancel(exchange, pair, sl).await?;
            }
            for tp in &trade.take_profit_order_ids {
                OrderCreator::cancel(exchange, pair, tp).await?;
            }
            info!(trade_id = trade.id, pair, "cancelled brackets before full market close");
        }

        let resp = exchange.close_position(pair, close_qty, trade.side.close_side()).await?;

        let exit_price = resp.avg_price;
        let status = if is_full_close { TradeStatus::Closed } else { TradeStatus::PartiallyFilled };

        info!(trade_id = trade.id, pair, reason, %close_qty, status = %status, "position closed at market");

        Ok(CloseOutcome {
            exit_price,
            exchange_order_id: resp.order_id,
            filled_qty: resp.executed_qty,
            status,
        })
    }

    /// Submit a reduce-only LIMIT order at `tp_price` for `close_percent` of
    /// the live position — the take-profit-ladder counterpart to
    /// `close_at_market`, used when the follow-up action carries a specific
    /// limit price rather than requesting an immediate market exit.
    #[instrument(skip(exchange, filters, trade), fields(trade_id = trade.id, pair))]
    pub async fn close_partial_limit(
        exchange: &dyn Exchange,
        pair: &str,
        filters: &SymbolFilters,
        trade: &Trade,
        tp_price: Decimal,
        close_percent: Decimal,
    ) -> Result<CloseOutcome, EngineError> {
        if trade.status == TradeStatus::Closed {
            return Ok(CloseOutcome {
                exit_price: trade.exit_price,
                exchange_order_id: trade.exchange_order_id.clone().unwrap_or_default(),
                filled_qty: None,
                status: TradeStatus::Closed,
            });
        }

        if close_percent <= Decimal::ZERO || close_percent > Decimal::from(100) {
            return Err(EngineError::Validation(format!("close_percent out of bounds: {close_percent}")));
        }

        let full_size = Self::resolve_close_size(exchange, pair, trade).await?;
        let close_qty = full_size * close_percent / Decimal::from(100);
        let is_full_close = close_percent == Decimal::from(100);

        if is_full_close {
            if let Some(sl) = &trade.stop_loss_order_id {
                OrderCreator::cancel(exchange, pair, sl).await?;
            }
            for tp in &trade.take_profit_order_ids {
                OrderCreator::cancel(exchange, pair, tp).await?;
            }
            info!(trade_id = trade.id, pair, "cancelled brackets before full limit close");
        }

        let resp = OrderCreator::create_reduce_only_limit(exchange, pair, filters, trade.side, close_qty, tp_price).await?;

        let status = if is_full_close { TradeStatus::Closed } else { TradeStatus::PartiallyFilled };

        info!(trade_id = trade.id, pair, %tp_price, %close_qty, status = %status, "submitted reduce-only limit take-profit");

        Ok(CloseOutcome {
            exit_price: resp.avg_price,
            exchange_order_id: resp.order_id,
            filled_qty: resp.executed_qty,
            status,
        })
    }

    /// Break-even price accounting for round-trip taker fees:
    /// entry * (1 + 2*fee_rate) for LONG, entry * (1 - 2*fee_rate) for SHORT.
    pub fn breakeven_price(trade: &Trade, fee_rate: Decimal) -> Decimal {
        match trade.side {
            crate::types::PositionSide::Long => trade.entry_price * (Decimal::ONE + fee_rate * Decimal::TWO),
            crate::types::PositionSide::Short => trade.entry_price * (Decimal::ONE - fee_rate * Decimal::TWO),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{OrderBook, OrderRequest, OrderResponse, Position};
    use crate::types::{Exchange as ExchangeEnum, OrderSide, PositionSide, SymbolFilters};
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    struct FakeExchange {
        cancelled: Arc<Mutex<Vec<String>>>,
        close_calls: Arc<Mutex<Vec<(String, Decimal, OrderSide)>>>,
        orders: Arc<Mutex<Vec<OrderRequest>>>,
        positions: Vec<Position>,
    }

    #[async_trait]
    impl Exchange for FakeExchange {
        async fn create_order(&self, req: OrderRequest) -> Result<OrderResponse, EngineError> {
            let quantity = req.quantity;
            let price = req.price;
            self.orders.lock().push(req);
            Ok(OrderResponse {
                order_id: "limit-1".to_string(),
                status: "NEW".to_string(),
                avg_price: price,
                executed_qty: Some(quantity),
                raw: serde_json::json!({}),
            })
        }
        async fn cancel_order(&self, _pair: &str, order_id: &str) -> Result<(), EngineError> {
            self.cancelled.lock().push(order_id.to_string());
            Ok(())
        }
        async fn get_order_status(&self, _pair: &str, _order_id: &str) -> Result<OrderResponse, EngineError> {
            unimplemented!()
        }
        async fn get_open_orders(&self, _pair: Option<&str>) -> Result<Vec<OrderResponse>, EngineError> {
            Ok(vec![])
        }
        async fn get_positions(&self, _pair: Option<&str>) -> Result<Vec<Position>, EngineError> {
            Ok(self.positions.clone())
        }
        async fn get_mark_price(&self, _pair: &str) -> Result<Decimal, EngineError> {
            Ok(dec!(100))
        }
        async fn get_order_book(&self, _pair: &str, _depth: u32) -> Result<OrderBook, EngineError> {
            Ok(OrderBook { bids: vec![], asks: vec![] })
        }
        async fn get_current_prices(&self, _pairs: &[String]) -> Result<Vec<(String, Decimal)>, EngineError> {
            Ok(vec![])
        }
        async fn close_position(&self, pair: &str, qty: Decimal, side: OrderSide) -> Result<OrderResponse, EngineError> {
            self.close_calls.lock().push((pair.to_string(), qty, side));
            Ok(OrderResponse {
                order_id: "close-1".to_string(),
                status: "FILLED".to_string(),
                avg_price: Some(dec!(99.5)),
                executed_qty: Some(qty),
                raw: serde_json::json!({}),
            })
        }
        async fn set_leverage(&self, _pair: &str, _leverage: u32) -> Result<(), EngineError> {
            Ok(())
        }
        async fn get_symbol_filters(&self, _pair: &str) -> Result<SymbolFilters, EngineError> {
            unimplemented!()
        }
    }

    fn sample_trade() -> Trade {
        Trade {
            id: 7,
            source_message_id: "m7".to_string(),
            coin_symbol: "BTC".to_string(),
            trader: "@Johnny".to_string(),
            exchange: ExchangeEnum::Binance,
            side: PositionSide::Long,
            status: TradeStatus::Open,
            position_size: dec!(2),
            entry_price: dec!(100),
            exit_price: None,
            exchange_order_id: Some("entry-7".to_string()),
            stop_loss_order_id: Some("sl-7".to_string()),
            take_profit_order_ids: vec!["tp-7".to_string()],
            content: "BTC Entry: 100".to_string(),
            created_at: Utc::now(),
            closed_at: None,
            merged_into_trade_id: None,
            exchange_response: None,
            exchange_update_time: None,
            trade_group_id: None,
        }
    }

    #[tokio::test]
    async fn full_close_cancels_brackets_before_closing() {
        let fx = FakeExchange { cancelled: Arc::new(Mutex::new(vec![])), close_calls: Arc::new(Mutex::new(vec![])), orders: Arc::new(Mutex::new(vec![])), positions: vec![] };
        let trade = sample_trade();
        let outcome = PositionManager::close_at_market(&fx, "BTCUSDT", &trade, "stop_loss_hit", dec!(100)).await.unwrap();
        assert_eq!(outcome.status, TradeStatus::Closed);
        let cancelled = fx.cancelled.lock();
        assert!(cancelled.contains(&"sl-7".to_string()));
        assert!(cancelled.contains(&"tp-7".to_string()));
        assert_eq!(fx.close_calls.lock()[0].1, dec!(2));
    }

    #[tokio::test]
    async fn partial_close_does_not_cancel_brackets() {
        let fx = FakeExchange { cancelled: Arc::new(Mutex::new(vec![])), close_calls: Arc::new(Mutex::new(vec![])), orders: Arc::new(Mutex::new(vec![])), positions: vec![] };
        let trade = sample_trade();
        let outcome = PositionManager::close_at_market(&fx, "BTCUSDT", &trade, "take_profit_1", dec!(50)).await.unwrap();
        assert_eq!(outcome.status, TradeStatus::PartiallyFilled);
        assert!(fx.cancelled.lock().is_empty());
        assert_eq!(fx.close_calls.lock()[0].1, dec!(1));
    }

    #[tokio::test]
    async fn close_already_closed_trade_is_a_noop() {
        let fx = FakeExchange { cancelled: Arc::new(Mutex::new(vec![])), close_calls: Arc::new(Mutex::new(vec![])), orders: Arc::new(Mutex::new(vec![])), positions: vec![] };
        let mut trade = sample_trade();
        trade.status = TradeStatus::Closed;
        trade.exit_price = Some(dec!(101));
        let outcome = PositionManager::close_at_market(&fx, "BTCUSDT", &trade, "active_futures_closed", dec!(100)).await.unwrap();
        assert_eq!(outcome.exit_price, Some(dec!(101)));
        assert!(fx.close_calls.lock().is_empty());
    }

    #[tokio::test]
    async fn partial_limit_close_submits_reduce_only_limit_at_tp_price() {
        let fx = FakeExchange { cancelled: Arc::new(Mutex::new(vec![])), close_calls: Arc::new(Mutex::new(vec![])), orders: Arc::new(Mutex::new(vec![])), positions: vec![] };
        let trade = sample_trade();
        let filters = SymbolFilters {
            native_pair: "BTCUSDT".to_string(),
            step_size: dec!(0.001),
            tick_size: dec!(0.1),
            min_qty: dec!(0.001),
            max_qty: dec!(1000),
            min_notional: dec!(5),
        };
        let outcome = PositionManager::close_partial_limit(&fx, "BTCUSDT", &filters, &trade, dec!(110), dec!(50)).await.unwrap();
        assert_eq!(outcome.status, TradeStatus::PartiallyFilled);
        assert!(fx.cancelled.lock().is_empty());
        let orders = fx.orders.lock();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].price, Some(dec!(110)));
        assert_eq!(orders[0].quantity, dec!(1));
        assert!(orders[0].reduce_only);
    }

    #[test]
    fn breakeven_price_accounts_for_round_trip_fees() {
        let mut trade = sample_trade();
        trade.entry_price = dec!(100);
        let be = PositionManager::breakeven_price(&trade, dec!(0.0002));
        assert_eq!(be, dec!(100.0400));
    }
}
