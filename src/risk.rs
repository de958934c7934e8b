// =============================================================================
// Stop-Loss / Take-Profit Managers + Position Auditor (C4)
// =============================================================================
//
// Enforces the single-active-bracket invariant per position: cancel any
// existing SL (or TP) orders for the pair, then create the replacement.
// Ordering is strict — a cancel failure aborts the replacement rather than
// risking two live stop orders on the same position.
// =============================================================================

use rust_decimal::Decimal;
use tracing::{info, instrument, warn};

use crate::error::EngineError;
use crate::exchange::Exchange;
use crate::orders::OrderCreator;
use crate::types::{SymbolFilters, Trade};

pub struct StopLossManager;

impl StopLossManager {
    /// Cancel any existing SL order for this trade, then create a new one at
    /// `price` (or the default 5%-from-entry distance if `price` is `None`).
    #[instrument(skip(exchange, filters, trade), fields(trade_id = trade.id))]
    pub async fn ensure_for_position(
        exchange: &dyn Exchange,
        pair: &str,
        filters: &SymbolFilters,
        trade: &Trade,
        price: Option<Decimal>,
        default_pct: Decimal,
    ) -> Result<String, EngineError> {
        if let Some(existing) = &trade.stop_loss_order_id {
            OrderCreator::cancel(exchange, pair, existing).await?;
            info!(trade_id = trade.id, order_id = %existing, "cancelled existing stop-loss before replacement");
        }

        let target = price.unwrap_or_else(|| OrderCreator::default_stop_loss(trade.side, trade.entry_price, default_pct));

        let resp = OrderCreator::create_stop_loss(exchange, pair, filters, trade.side, trade.position_size, target).await?;

        Ok(resp.order_id)
    }

    pub async fn update(
        exchange: &dyn Exchange,
        pair: &str,
        filters: &SymbolFilters,
        trade: &Trade,
        new_price: Decimal,
        default_pct: Decimal,
    ) -> Result<String, EngineError> {
        Self::ensure_for_position(exchange, pair, filters, trade, Some(new_price), default_pct).await
    }
}

pub struct TakeProfitManager;

impl TakeProfitManager {
    /// Cancel any existing TP orders for this trade, then create the new
    /// ladder. `levels` is a list of (price, close_fraction) pairs; fractions
    /// should sum to at most 1.0. An empty `levels` falls back to a single
    /// 100%-size TP at the default distance.
    #[instrument(skip(exchange, filters, trade, levels), fields(trade_id = trade.id))]
    pub async fn ensure_for_position(
        exchange: &dyn Exchange,
        pair: &str,
        filters: &SymbolFilters,
        trade: &Trade,
        levels: &[(Decimal, Decimal)],
        default_pct: Decimal,
    ) -> Result<Vec<String>, EngineError> {
        for existing in &trade.take_profit_order_ids {
            OrderCreator::cancel(exchange, pair, existing).await?;
        }
        if !trade.take_profit_order_ids.is_empty() {
            info!(trade_id = trade.id, count = trade.take_profit_order_ids.len(), "cancelled existing take-profits before replacement");
        }

        let mut ids = Vec::new();

        if levels.is_empty() {
            let target = OrderCreator::default_take_profit(trade.side, trade.entry_price, default_pct);
            let resp = OrderCreator::create_take_profit(exchange, pair, filters, trade.side, trade.position_size, target).await?;
            ids.push(resp.order_id);
            return Ok(ids);
        }

        for (price, fraction) in levels {
            let qty = trade.position_size * fraction;
            let resp = OrderCreator::create_take_profit(exchange, pair, filters, trade.side, qty, *price).await?;
            ids.push(resp.order_id);
        }

        Ok(ids)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditFinding {
    Compliant,
    MissingStopLoss,
    MissingTakeProfit,
}

pub struct PositionAuditor;

impl PositionAuditor {
    /// Read-only classification of one open trade's protection state against
    /// the live exchange open-order list. Remediation is the caller's job
    /// (typically re-invoking `StopLossManager::ensure_for_position`).
    #[instrument(skip(exchange, trade), fields(trade_id = trade.id))]
    pub async fn audit(exchange: &dyn Exchange, pair: &str, trade: &Trade) -> Result<AuditFinding, EngineError> {
        let open_orders = exchange.get_open_orders(Some(pair)).await?;
        let has_sl = trade
            .stop_loss_order_id
            .as_ref()
            .map(|id| open_orders.iter().any(|o| &o.order_id == id))
            .unwrap_or(false);

        if !has_sl {
            warn!(trade_id = trade.id, pair, "audit: missing stop-loss on open position");
            return Ok(AuditFinding::MissingStopLoss);
        }

        let has_tp = trade
            .take_profit_order_ids
            .iter()
            .any(|id| open_orders.iter().any(|o| &o.order_id == id));

        if !has_tp && !trade.take_profit_order_ids.is_empty() {
            warn!(trade_id = trade.id, pair, "audit: missing take-profit on open position");
            return Ok(AuditFinding::MissingTakeProfit);
        }

        Ok(AuditFinding::Compliant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{OrderBook, OrderRequest, OrderResponse, Position};
    use crate::types::{Exchange as ExchangeEnum, PositionSide, TradeStatus};
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    struct FakeExchange {
        cancelled: Arc<Mutex<Vec<String>>>,
        created: Arc<Mutex<Vec<OrderRequest>>>,
    }

    #[async_trait]
    impl Exchange for FakeExchange {
        async fn create_order(&self, req: OrderRequest) -> Result<OrderResponse, EngineError> {
            self.created.lock().push(req.clone());
            Ok(OrderResponse {
                order_id: format!("new-{}", self.created.lock().len()),
                status: "NEW".to_string(),
                avg_price: None,
                executed_qty: None,
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
            Ok(vec![])
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
        async fn close_position(&self, _pair: &str, _qty: Decimal, _side: crate::types::OrderSide) -> Result<OrderResponse, EngineError> {
            unimplemented!()
        }
        async fn set_leverage(&self, _pair: &str, _leverage: u32) -> Result<(), EngineError> {
            Ok(())
        }
        async fn get_symbol_filters(&self, _pair: &str) -> Result<SymbolFilters, EngineError> {
            unimplemented!()
        }
    }

    fn filters() -> SymbolFilters {
        SymbolFilters {
            native_pair: "BTCUSDT".to_string(),
            step_size: dec!(0.001),
            tick_size: dec!(0.1),
            min_qty: dec!(0.001),
            max_qty: dec!(1000),
            min_notional: dec!(5),
        }
    }

    fn trade_with_sl(sl_id: Option<&str>) -> Trade {
        Trade {
            id: 1,
            source_message_id: "m1".to_string(),
            coin_symbol: "BTC".to_string(),
            trader: "@Johnny".to_string(),
            exchange: ExchangeEnum::Binance,
            side: PositionSide::Long,
            status: TradeStatus::Open,
            position_size: dec!(1),
            entry_price: dec!(100),
            exit_price: None,
            exchange_order_id: Some("entry-1".to_string()),
            stop_loss_order_id: sl_id.map(str::to_string),
            take_profit_order_ids: vec![],
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
    async fn ensure_cancels_before_creating_replacement() {
        let fx = FakeExchange { cancelled: Arc::new(Mutex::new(vec![])), created: Arc::new(Mutex::new(vec![])) };
        let trade = trade_with_sl(Some("old-sl"));
        let id = StopLossManager::ensure_for_position(&fx, "BTCUSDT", &filters(), &trade, Some(dec!(95)), dec!(0.05))
            .await
            .unwrap();
        assert_eq!(fx.cancelled.lock().clone(), vec!["old-sl".to_string()]);
        assert_eq!(id, "new-1");
    }

    #[tokio::test]
    async fn ensure_without_existing_sl_skips_cancel() {
        let fx = FakeExchange { cancelled: Arc::new(Mutex::new(vec![])), created: Arc::new(Mutex::new(vec![])) };
        let trade = trade_with_sl(None);
        StopLossManager::ensure_for_position(&fx, "BTCUSDT", &filters(), &trade, None, dec!(0.05))
            .await
            .unwrap();
        assert!(fx.cancelled.lock().is_empty());
        assert_eq!(fx.created.lock().len(), 1);
    }

    #[tokio::test]
    async fn default_sl_used_when_no_price_given() {
        let fx = FakeExchange { cancelled: Arc::new(Mutex::new(vec![])), created: Arc::new(Mutex::new(vec![])) };
        let trade = trade_with_sl(None);
        StopLossManager::ensure_for_position(&fx, "BTCUSDT", &filters(), &trade, None, dec!(0.05))
            .await
            .unwrap();
        let created = fx.created.lock();
        assert_eq!(created[0].stop_price, Some(dec!(95.00)));
    }

    #[tokio::test]
    async fn audit_flags_missing_stop_loss() {
        let fx = FakeExchange { cancelled: Arc::new(Mutex::new(vec![])), created: Arc::new(Mutex::new(vec![])) };
        let trade = trade_with_sl(Some("ghost-sl"));
        let finding = PositionAuditor::audit(&fx, "BTCUSDT", &trade).await.unwrap();
        assert_eq!(finding, AuditFinding::MissingStopLoss);
    }
}
