// =============================================================================
// Shared domain types for the signal-driven trading engine
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Which venue a trader's signals are routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Binance,
    Kucoin,
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Exchange::Binance => write!(f, "binance"),
            Exchange::Kucoin => write!(f, "kucoin"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// The exchange order side that opens this position.
    pub fn entry_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }

    /// The exchange order side that closes (reduces) this position.
    pub fn close_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalOrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit,
    StopMarket,
    TakeProfitMarket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    Pending,
    Open,
    PartiallyFilled,
    Closed,
    Cancelled,
    Failed,
    Merged,
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TradeStatus::Pending => "PENDING",
            TradeStatus::Open => "OPEN",
            TradeStatus::PartiallyFilled => "PARTIALLY_FILLED",
            TradeStatus::Closed => "CLOSED",
            TradeStatus::Cancelled => "CANCELLED",
            TradeStatus::Failed => "FAILED",
            TradeStatus::Merged => "MERGED",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertStatus {
    Pending,
    Processed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActiveFuturesStatus {
    Active,
    Closed,
}

/// A normalized trading signal, already parsed out of whatever free-form
/// message produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub coin_symbol: String,
    pub position_type: PositionSide,
    pub order_type: SignalOrderType,
    /// 1..N entries. A single entry is a fixed price; two entries are treated
    /// as an inclusive [lo, hi] range (order is not assumed).
    pub entry_prices: Vec<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub take_profits: Vec<Decimal>,
    pub quantity_multiplier: Option<u32>,
    pub client_order_id: Option<String>,
    pub trader: String,
    pub source_message_id: String,
    pub timestamp: DateTime<Utc>,
    pub trade_group_id: Option<String>,
}

impl Signal {
    /// Entry prices sorted into an inclusive (lo, hi) range. For a single
    /// price, lo == hi.
    pub fn entry_range(&self) -> Option<(Decimal, Decimal)> {
        match self.entry_prices.len() {
            0 => None,
            1 => Some((self.entry_prices[0], self.entry_prices[0])),
            _ => {
                let lo = *self.entry_prices.iter().min()?;
                let hi = *self.entry_prices.iter().max()?;
                Some((lo, hi))
            }
        }
    }
}

/// The authoritative local record of one position intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: u64,
    pub source_message_id: String,
    pub coin_symbol: String,
    pub trader: String,
    pub exchange: Exchange,
    pub side: PositionSide,
    pub status: TradeStatus,
    pub position_size: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Option<Decimal>,
    pub exchange_order_id: Option<String>,
    pub stop_loss_order_id: Option<String>,
    pub take_profit_order_ids: Vec<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub merged_into_trade_id: Option<u64>,
    pub exchange_response: Option<serde_json::Value>,
    pub exchange_update_time: Option<DateTime<Utc>>,
    /// Carried over from the originating `Signal`, if any; follow-up
    /// matching requires equality on this rather than a loose substring
    /// match against `source_message_id`.
    pub trade_group_id: Option<String>,
}

impl Trade {
    pub fn is_open(&self) -> bool {
        matches!(self.status, TradeStatus::Open | TradeStatus::PartiallyFilled)
    }
}

/// A follow-up message referencing a Trade by `source_message_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: u64,
    pub trade_source_message_id: String,
    pub trader: String,
    pub coin_symbol: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub content: String,
    pub parsed_action: Option<FollowupAction>,
    pub status: AlertStatus,
    pub trade_group_id: Option<String>,
}

/// Classified follow-up action, either supplied directly or derived from a
/// textual heuristic fallback (see `crate::followup`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action_type", rename_all = "snake_case")]
pub enum FollowupAction {
    BreakEven,
    StopLossUpdate { new_price: Decimal },
    StopLossHit,
    ProfitClose,
    TakeProfitPartial { tp_price: Decimal, close_percent: Decimal },
    LimitOrderCancelled,
    /// A resting limit entry order filled; informational, but the alert is
    /// still marked PROCESSED since the content was recognized.
    LimitFilled,
    Informational,
}

/// Authoritative mirror of an externally-sourced "currently active trade"
/// feed, used by the reconciler to detect externally-closed positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveFutures {
    pub id: u64,
    pub trader: String,
    pub content: String,
    pub status: ActiveFuturesStatus,
    pub created_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

/// Per-(exchange, pair) trading filters, cached with a TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolFilters {
    pub native_pair: String,
    pub step_size: Decimal,
    pub tick_size: Decimal,
    pub min_qty: Decimal,
    pub max_qty: Decimal,
    pub min_notional: Decimal,
}

/// Ephemeral scoring result produced by the active-futures reconciler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeMatch {
    pub active_futures_id: u64,
    pub trade_id: u64,
    pub confidence: Decimal,
    pub reasons: Vec<String>,
}
