// =============================================================================
// Repository traits (C3-C9 persistence boundary) + in-memory reference impl
// =============================================================================
//
// Persistence is explicitly an external collaborator: production deployments
// implement these traits against a real tabular store. The in-memory
// implementation here exists so the engine, router, and reconciler can run
// and be tested end-to-end without one. It follows the same ownership shape
// the rest of this codebase uses for shared mutable state: a
// `parking_lot::RwLock` guarding a plain `Vec`, with monotonic surrogate ids.
// =============================================================================

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::EngineError;
use crate::types::{ActiveFutures, ActiveFuturesStatus, Alert, AlertStatus, Trade, TradeStatus};

#[async_trait]
pub trait TradeRepository: Send + Sync {
    async fn insert(&self, trade: Trade) -> Result<Trade, EngineError>;
    async fn update(&self, id: u64, f: Box<dyn FnOnce(&mut Trade) + Send>) -> Result<Trade, EngineError>;
    async fn get(&self, id: u64) -> Result<Trade, EngineError>;
    async fn get_by_source_message_id(&self, source_message_id: &str) -> Result<Trade, EngineError>;
    async fn find_by_coin(&self, coin: &str) -> Result<Vec<Trade>, EngineError>;
    async fn find_open_by_trader(&self, trader: &str) -> Result<Vec<Trade>, EngineError>;
    async fn find_open_by_coin_and_side(&self, coin: &str, side: crate::types::PositionSide, trader: &str) -> Result<Vec<Trade>, EngineError>;
}

#[async_trait]
pub trait AlertRepository: Send + Sync {
    async fn insert(&self, alert: Alert) -> Result<Alert, EngineError>;
    async fn update(&self, id: u64, f: Box<dyn FnOnce(&mut Alert) + Send>) -> Result<Alert, EngineError>;
    async fn find_by_trade_source_message_id(&self, source_message_id: &str) -> Result<Vec<Alert>, EngineError>;
    async fn find_pending_for_trade(&self, source_message_id: &str) -> Result<Vec<Alert>, EngineError>;
}

#[async_trait]
pub trait ActiveFuturesRepository: Send + Sync {
    async fn insert(&self, entry: ActiveFutures) -> Result<ActiveFutures, EngineError>;
    async fn find_by_traders_and_status(
        &self,
        traders: &[String],
        status: ActiveFuturesStatus,
    ) -> Result<Vec<ActiveFutures>, EngineError>;
}

// =============================================================================
// In-memory reference implementation
// =============================================================================

pub struct InMemoryTradeRepository {
    next_id: AtomicU64,
    rows: RwLock<Vec<Trade>>,
}

impl InMemoryTradeRepository {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            rows: RwLock::new(Vec::new()),
        }
    }
}

impl Default for InMemoryTradeRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TradeRepository for InMemoryTradeRepository {
    async fn insert(&self, mut trade: Trade) -> Result<Trade, EngineError> {
        trade.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut rows = self.rows.write();
        rows.push(trade.clone());
        Ok(trade)
    }

    async fn update(&self, id: u64, f: Box<dyn FnOnce(&mut Trade) + Send>) -> Result<Trade, EngineError> {
        let mut rows = self.rows.write();
        let row = rows
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| EngineError::Database(format!("trade {id} not found")))?;
        f(row);
        Ok(row.clone())
    }

    async fn get(&self, id: u64) -> Result<Trade, EngineError> {
        self.rows
            .read()
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| EngineError::Database(format!("trade {id} not found")))
    }

    async fn get_by_source_message_id(&self, source_message_id: &str) -> Result<Trade, EngineError> {
        self.rows
            .read()
            .iter()
            .find(|t| t.source_message_id == source_message_id)
            .cloned()
            .ok_or_else(|| EngineError::Database(format!("trade with source_message_id {source_message_id} not found")))
    }

    async fn find_by_coin(&self, coin: &str) -> Result<Vec<Trade>, EngineError> {
        Ok(self.rows.read().iter().filter(|t| t.coin_symbol == coin).cloned().collect())
    }

    async fn find_open_by_trader(&self, trader: &str) -> Result<Vec<Trade>, EngineError> {
        Ok(self
            .rows
            .read()
            .iter()
            .filter(|t| t.trader == trader && t.is_open())
            .cloned()
            .collect())
    }

    async fn find_open_by_coin_and_side(
        &self,
        coin: &str,
        side: crate::types::PositionSide,
        trader: &str,
    ) -> Result<Vec<Trade>, EngineError> {
        Ok(self
            .rows
            .read()
            .iter()
            .filter(|t| t.coin_symbol == coin && t.side == side && t.trader == trader && t.is_open())
            .cloned()
            .collect())
    }
}

pub struct InMemoryAlertRepository {
    next_id: AtomicU64,
    rows: RwLock<Vec<Alert>>,
}

impl InMemoryAlertRepository {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            rows: RwLock::new(Vec::new()),
        }
    }
}

impl Default for InMemoryAlertRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AlertRepository for InMemoryAlertRepository {
    async fn insert(&self, mut alert: Alert) -> Result<Alert, EngineError> {
        alert.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut rows = self.rows.write();
        rows.push(alert.clone());
        Ok(alert)
    }

    async fn update(&self, id: u64, f: Box<dyn FnOnce(&mut Alert) + Send>) -> Result<Alert, EngineError> {
        let mut rows = self.rows.write();
        let row = rows
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| EngineError::Database(format!("alert {id} not found")))?;
        f(row);
        Ok(row.clone())
    }

    async fn find_by_trade_source_message_id(&self, source_message_id: &str) -> Result<Vec<Alert>, EngineError> {
        Ok(self
            .rows
            .read()
            .iter()
            .filter(|a| a.trade_source_message_id == source_message_id)
            .cloned()
            .collect())
    }

    async fn find_pending_for_trade(&self, source_message_id: &str) -> Result<Vec<Alert>, EngineError> {
        Ok(self
            .rows
            .read()
            .iter()
            .filter(|a| a.trade_source_message_id == source_message_id && a.status == AlertStatus::Pending)
            .cloned()
            .collect())
    }
}

pub struct InMemoryActiveFuturesRepository {
    next_id: AtomicU64,
    rows: RwLock<Vec<ActiveFutures>>,
}

impl InMemoryActiveFuturesRepository {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            rows: RwLock::new(Vec::new()),
        }
    }
}

impl Default for InMemoryActiveFuturesRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActiveFuturesRepository for InMemoryActiveFuturesRepository {
    async fn insert(&self, mut entry: ActiveFutures) -> Result<ActiveFutures, EngineError> {
        entry.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut rows = self.rows.write();
        rows.push(entry.clone());
        Ok(entry)
    }

    async fn find_by_traders_and_status(
        &self,
        traders: &[String],
        status: ActiveFuturesStatus,
    ) -> Result<Vec<ActiveFutures>, EngineError> {
        Ok(self
            .rows
            .read()
            .iter()
            .filter(|af| traders.iter().any(|t| t == &af.trader) && af.status == status)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Exchange, PositionSide};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn sample_trade(coin: &str, trader: &str) -> Trade {
        Trade {
            id: 0,
            source_message_id: format!("msg-{coin}-{trader}"),
            coin_symbol: coin.to_string(),
            trader: trader.to_string(),
            exchange: Exchange::Binance,
            side: PositionSide::Long,
            status: TradeStatus::Open,
            position_size: dec!(1),
            entry_price: dec!(100),
            exit_price: None,
            exchange_order_id: Some("1".to_string()),
            stop_loss_order_id: None,
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
    async fn insert_assigns_monotonic_ids() {
        let repo = InMemoryTradeRepository::new();
        let t1 = repo.insert(sample_trade("BTC", "@Johnny")).await.unwrap();
        let t2 = repo.insert(sample_trade("ETH", "@Johnny")).await.unwrap();
        assert_eq!(t1.id, 1);
        assert_eq!(t2.id, 2);
    }

    #[tokio::test]
    async fn update_mutates_in_place() {
        let repo = InMemoryTradeRepository::new();
        let t = repo.insert(sample_trade("BTC", "@Johnny")).await.unwrap();
        let updated = repo
            .update(t.id, Box::new(|trade| trade.status = TradeStatus::Closed))
            .await
            .unwrap();
        assert_eq!(updated.status, TradeStatus::Closed);
    }

    #[tokio::test]
    async fn find_open_by_trader_excludes_closed() {
        let repo = InMemoryTradeRepository::new();
        let t = repo.insert(sample_trade("BTC", "@Johnny")).await.unwrap();
        repo.update(t.id, Box::new(|trade| trade.status = TradeStatus::Closed)).await.unwrap();
        repo.insert(sample_trade("ETH", "@Johnny")).await.unwrap();

        let open = repo.find_open_by_trader("@Johnny").await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].coin_symbol, "ETH");
    }
}
