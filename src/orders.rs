// =============================================================================
// Order Creator / Canceller (C3)
// =============================================================================
//
// Builds the entry order and the SL/TP bracket ladder for a position. Holds
// no state of its own; every method takes the exchange port and filters it
// needs. Side mapping and default-bracket-distance math live here so the
// engine and the risk managers share one source of truth for them.
// =============================================================================

use rust_decimal::Decimal;
use tracing::{debug, instrument};

use crate::error::EngineError;
use crate::exchange::{Exchange, OrderRequest, OrderResponse};
use crate::symbol::SymbolResolver;
use crate::types::{OrderKind, PositionSide, SymbolFilters};

pub struct OrderCreator;

impl OrderCreator {
    /// Default stop-loss / take-profit price computed from entry when a
    /// signal doesn't supply one: 5% away from entry, against the position.
    pub fn default_stop_loss(side: PositionSide, entry: Decimal, pct: Decimal) -> Decimal {
        match side {
            PositionSide::Long => entry * (Decimal::ONE - pct),
            PositionSide::Short => entry * (Decimal::ONE + pct),
        }
    }

    pub fn default_take_profit(side: PositionSide, entry: Decimal, pct: Decimal) -> Decimal {
        match side {
            PositionSide::Long => entry * (Decimal::ONE + pct),
            PositionSide::Short => entry * (Decimal::ONE - pct),
        }
    }

    /// Reject a quantity/reference-price pair that would violate the
    /// pair's filters before it ever reaches the exchange client. Every
    /// order-submitting method below calls this after rounding, so no
    /// order path (entry, SL, TP, or reduce-only close) can bypass it.
    fn validate_against_filters(filters: &SymbolFilters, quantity: Decimal, reference_price: Decimal) -> Result<(), EngineError> {
        if quantity < filters.min_qty || quantity > filters.max_qty {
            return Err(EngineError::Validation(format!(
                "quantity {quantity} outside allowed range [{}, {}]",
                filters.min_qty, filters.max_qty
            )));
        }
        let notional = quantity * reference_price;
        if notional < filters.min_notional {
            return Err(EngineError::InsufficientNotional { min: filters.min_notional.to_string(), actual: notional.to_string() });
        }
        Ok(())
    }

    /// `reference_price` is the price used for the notional check: the
    /// order price itself for LIMIT entries, the fetched mark price for
    /// MARKET entries (since a MARKET order carries no `price`).
    #[instrument(skip(exchange, filters), fields(pair))]
    pub async fn create_entry(
        exchange: &dyn Exchange,
        pair: &str,
        filters: &SymbolFilters,
        side: PositionSide,
        kind: OrderKind,
        quantity: Decimal,
        price: Option<Decimal>,
        client_order_id: Option<String>,
        reference_price: Decimal,
    ) -> Result<OrderResponse, EngineError> {
        let quantity = SymbolResolver::round_quantity(filters, quantity);
        let price = price.map(|p| SymbolResolver::round_price(filters, p));

        Self::validate_against_filters(filters, quantity, reference_price)?;

        debug!(pair, %quantity, ?price, "submitting entry order");

        exchange
            .create_order(OrderRequest {
                pair: pair.to_string(),
                side: side.entry_side(),
                kind,
                quantity,
                price,
                stop_price: None,
                reduce_only: false,
                close_position: false,
                client_order_id,
            })
            .await
    }

    /// A reduce-only STOP_MARKET protecting the full position size.
    #[instrument(skip(exchange, filters), fields(pair))]
    pub async fn create_stop_loss(
        exchange: &dyn Exchange,
        pair: &str,
        filters: &SymbolFilters,
        side: PositionSide,
        quantity: Decimal,
        stop_price: Decimal,
    ) -> Result<OrderResponse, EngineError> {
        let quantity = SymbolResolver::round_quantity(filters, quantity);
        let stop_price = SymbolResolver::round_price(filters, stop_price);

        Self::validate_against_filters(filters, quantity, stop_price)?;

        exchange
            .create_order(OrderRequest {
                pair: pair.to_string(),
                side: side.close_side(),
                kind: OrderKind::StopMarket,
                quantity,
                price: None,
                stop_price: Some(stop_price),
                reduce_only: true,
                close_position: false,
                client_order_id: None,
            })
            .await
    }

    /// A reduce-only TAKE_PROFIT_MARKET for `close_qty` (may be a partial
    /// size when the signal carries a multi-level TP ladder).
    #[instrument(skip(exchange, filters), fields(pair))]
    pub async fn create_take_profit(
        exchange: &dyn Exchange,
        pair: &str,
        filters: &SymbolFilters,
        side: PositionSide,
        close_qty: Decimal,
        tp_price: Decimal,
    ) -> Result<OrderResponse, EngineError> {
        let quantity = SymbolResolver::round_quantity(filters, close_qty);
        let tp_price = SymbolResolver::round_price(filters, tp_price);

        Self::validate_against_filters(filters, quantity, tp_price)?;

        exchange
            .create_order(OrderRequest {
                pair: pair.to_string(),
                side: side.close_side(),
                kind: OrderKind::TakeProfitMarket,
                quantity,
                price: None,
                stop_price: Some(tp_price),
                reduce_only: true,
                close_position: false,
                client_order_id: None,
            })
            .await
    }

    /// A reduce-only LIMIT order at a specific price, used for take-profit
    /// follow-up actions that specify an exact price and percentage.
    pub async fn create_reduce_only_limit(
        exchange: &dyn Exchange,
        pair: &str,
        filters: &SymbolFilters,
        side: PositionSide,
        close_qty: Decimal,
        price: Decimal,
    ) -> Result<OrderResponse, EngineError> {
        let quantity = SymbolResolver::round_quantity(filters, close_qty);
        let price = SymbolResolver::round_price(filters, price);

        Self::validate_against_filters(filters, quantity, price)?;

        exchange
            .create_order(OrderRequest {
                pair: pair.to_string(),
                side: side.close_side(),
                kind: OrderKind::Limit,
                quantity,
                price: Some(price),
                stop_price: None,
                reduce_only: true,
                close_position: false,
                client_order_id: None,
            })
            .await
    }

    pub async fn cancel(exchange: &dyn Exchange, pair: &str, order_id: &str) -> Result<(), EngineError> {
        match exchange.cancel_order(pair, order_id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_idempotent_noop() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn default_stop_loss_below_entry_for_long() {
        let sl = OrderCreator::default_stop_loss(PositionSide::Long, dec!(100), dec!(0.05));
        assert_eq!(sl, dec!(95.00));
    }

    #[test]
    fn default_stop_loss_above_entry_for_short() {
        let sl = OrderCreator::default_stop_loss(PositionSide::Short, dec!(100), dec!(0.05));
        assert_eq!(sl, dec!(105.00));
    }

    #[test]
    fn default_take_profit_above_entry_for_long() {
        let tp = OrderCreator::default_take_profit(PositionSide::Long, dec!(100), dec!(0.05));
        assert_eq!(tp, dec!(105.00));
    }

    fn filters() -> SymbolFilters {
        SymbolFilters {
            native_pair: "BTCUSDT".to_string(),
            step_size: dec!(0.001),
            tick_size: dec!(0.1),
            min_qty: dec!(0.01),
            max_qty: dec!(1000),
            min_notional: dec!(5),
        }
    }

    #[test]
    fn validate_against_filters_rejects_below_min_qty() {
        let err = OrderCreator::validate_against_filters(&filters(), dec!(0.001), dec!(100)).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn validate_against_filters_rejects_below_min_notional() {
        let err = OrderCreator::validate_against_filters(&filters(), dec!(0.02), dec!(100)).unwrap_err();
        assert!(matches!(err, EngineError::InsufficientNotional { .. }));
    }

    #[test]
    fn validate_against_filters_accepts_notional_at_exact_minimum() {
        OrderCreator::validate_against_filters(&filters(), dec!(0.05), dec!(100)).unwrap();
    }
}
