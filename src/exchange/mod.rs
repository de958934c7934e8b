// =============================================================================
// Exchange Capability (C2) — a typed port over one derivatives venue
// =============================================================================
//
// The trading engine never talks to an HTTP client directly; it depends on
// this trait so that Binance and KuCoin differences (pair formatting,
// signing, trigger-order semantics) stay contained in their respective
// implementations.
// =============================================================================

pub mod binance;
pub mod kucoin;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::types::{OrderKind, OrderSide, SymbolFilters};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub pair: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub reduce_only: bool,
    pub close_position: bool,
    pub client_order_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResponse {
    pub order_id: String,
    pub status: String,
    pub avg_price: Option<Decimal>,
    pub executed_qty: Option<Decimal>,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub pair: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub unrealized_pnl: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    pub bids: Vec<OrderBookLevel>,
    pub asks: Vec<OrderBookLevel>,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }
}

/// A thin, typed capability over one exchange's futures API. Implementations
/// own signing, pair formatting, and response-shape validation; they
/// contain no trading business logic of their own.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn create_order(&self, req: OrderRequest) -> Result<OrderResponse, EngineError>;

    /// Idempotent: "order not found" is treated as success by callers.
    async fn cancel_order(&self, pair: &str, order_id: &str) -> Result<(), EngineError>;

    async fn get_order_status(&self, pair: &str, order_id: &str) -> Result<OrderResponse, EngineError>;

    async fn get_open_orders(&self, pair: Option<&str>) -> Result<Vec<OrderResponse>, EngineError>;

    async fn get_positions(&self, pair: Option<&str>) -> Result<Vec<Position>, EngineError>;

    async fn get_mark_price(&self, pair: &str) -> Result<Decimal, EngineError>;

    async fn get_order_book(&self, pair: &str, depth: u32) -> Result<OrderBook, EngineError>;

    async fn get_current_prices(&self, pairs: &[String]) -> Result<Vec<(String, Decimal)>, EngineError>;

    async fn close_position(&self, pair: &str, qty: Decimal, side: OrderSide) -> Result<OrderResponse, EngineError>;

    async fn set_leverage(&self, pair: &str, leverage: u32) -> Result<(), EngineError>;

    async fn get_symbol_filters(&self, pair: &str) -> Result<SymbolFilters, EngineError>;
}
