// =============================================================================
// Follow-up Processor (C8)
// =============================================================================
//
// Classifies a follow-up alert's action (either pre-parsed by an upstream
// natural-language step, or derived from a textual heuristic fallback) and
// dispatches it against the risk managers (C4) and position manager (C5).
// =============================================================================

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::exchange::Exchange;
use crate::position::PositionManager;
use crate::repository::TradeRepository;
use crate::risk::StopLossManager;
use crate::symbol::SymbolResolver;
use crate::txn::TransactionManager;
use crate::types::{FollowupAction, Trade, TradeStatus};

pub struct FollowupProcessor;

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    StopLossReplaced { order_id: String },
    Closed { exit_price: Option<Decimal> },
    PartialClose { exit_price: Option<Decimal> },
    Cancelled,
    /// Recognized as informational content (e.g. a limit order filling);
    /// no position action taken, but the alert is PROCESSED.
    LimitFilled,
    /// Content did not classify into any known action; no position action
    /// taken and the alert is SKIPPED.
    Informational,
    Skipped { reason: String },
}

impl FollowupProcessor {
    /// Classify free-form `content` into a `FollowupAction` using the same
    /// substring heuristics the upstream natural-language fallback applies
    /// when no structured action was already attached to the alert.
    pub fn classify_content(content: &str) -> FollowupAction {
        let normalized = content.to_lowercase();

        if normalized.contains("moved to be") || normalized.contains("stops moved to be") {
            FollowupAction::BreakEven
        } else if normalized.contains("stopped out") || normalized.contains("stop loss hit") {
            FollowupAction::StopLossHit
        } else if normalized.contains("closed in profit") {
            FollowupAction::ProfitClose
        } else if normalized.contains("limit order filled") {
            FollowupAction::LimitFilled
        } else {
            warn!(content, "follow-up content did not classify into any known action");
            FollowupAction::Informational
        }
    }

    /// Before dispatching a follow-up against a set of related open trades
    /// for the same `(coin, side, trader)`, collapse duplicates into a
    /// single aggregated position: the oldest trade carrying a live
    /// `exchange_order_id` is the primary; every other trade is marked
    /// `MERGED` with `merged_into_trade_id` set to the primary's id. Returns
    /// the primary trade, which is the one all dispatch actions act against.
    ///
    /// A `related` trade that is already `MERGED` is resolved through to
    /// its recorded primary rather than treated as its own candidate.
    pub async fn resolve_aggregated_target(
        trades: Arc<dyn TradeRepository>,
        related: &[Trade],
    ) -> Result<Trade, EngineError> {
        if related.len() == 1 {
            let only = &related[0];
            if let Some(primary_id) = only.merged_into_trade_id {
                return trades.get(primary_id).await;
            }
            return Ok(only.clone());
        }

        let primary = related
            .iter()
            .filter(|t| t.exchange_order_id.is_some())
            .min_by_key(|t| t.created_at)
            .or_else(|| related.iter().min_by_key(|t| t.created_at))
            .cloned()
            .ok_or_else(|| EngineError::Validation("no related trades to aggregate".to_string()))?;

        let mut txn = TransactionManager::new();
        let mut to_merge = 0usize;

        for secondary in related {
            if secondary.id == primary.id || secondary.status == TradeStatus::Merged {
                continue;
            }
            to_merge += 1;

            let secondary_id = secondary.id;
            let original_status = secondary.status;
            let original_merged_into = secondary.merged_into_trade_id;
            let primary_id = primary.id;

            let op_trades = trades.clone();
            let rb_trades = trades.clone();

            txn = txn.add_step(
                format!("merge_trade_{secondary_id}"),
                move || {
                    Box::pin(async move {
                        op_trades
                            .update(secondary_id, Box::new(move |t| {
                                t.status = TradeStatus::Merged;
                                t.merged_into_trade_id = Some(primary_id);
                            }))
                            .await?;
                        Ok(())
                    })
                },
                Some(move || {
                    Box::pin(async move {
                        let _ = rb_trades
                            .update(secondary_id, Box::new(move |t| {
                                t.status = original_status;
                                t.merged_into_trade_id = original_merged_into;
                            }))
                            .await;
                    })
                }),
            );
        }

        if to_merge > 0 {
            txn.execute().await?;
            info!(primary_id = primary.id, merged = to_merge, "merged duplicate positions into primary trade");
        }

        Ok(primary)
    }

    pub async fn dispatch(
        exchange: &dyn Exchange,
        symbol_resolver: &SymbolResolver,
        config: &EngineConfig,
        trade: &Trade,
        action: &FollowupAction,
    ) -> Result<DispatchOutcome, EngineError> {
        let (pair, filters) = symbol_resolver.resolve(exchange, trade.exchange, &trade.coin_symbol).await?;

        match action {
            FollowupAction::BreakEven => {
                let target = PositionManager::breakeven_price(trade, config.fixed_fee_rate);
                let order_id =
                    StopLossManager::update(exchange, &pair, &filters, trade, target, config.default_bracket_pct).await?;
                info!(trade_id = trade.id, %target, "moved stop-loss to break-even");
                Ok(DispatchOutcome::StopLossReplaced { order_id })
            }
            FollowupAction::StopLossUpdate { new_price } => {
                let order_id =
                    StopLossManager::update(exchange, &pair, &filters, trade, *new_price, config.default_bracket_pct).await?;
                Ok(DispatchOutcome::StopLossReplaced { order_id })
            }
            FollowupAction::StopLossHit => {
                let outcome =
                    PositionManager::close_at_market(exchange, &pair, trade, "stop_loss_hit", Decimal::from(100)).await?;
                Ok(DispatchOutcome::Closed { exit_price: outcome.exit_price })
            }
            FollowupAction::ProfitClose => {
                let outcome =
                    PositionManager::close_at_market(exchange, &pair, trade, "profit_close", Decimal::from(100)).await?;
                Ok(DispatchOutcome::Closed { exit_price: outcome.exit_price })
            }
            FollowupAction::TakeProfitPartial { tp_price, close_percent } => {
                let outcome =
                    PositionManager::close_partial_limit(exchange, &pair, &filters, trade, *tp_price, *close_percent).await?;
                Ok(DispatchOutcome::PartialClose { exit_price: outcome.exit_price })
            }
            FollowupAction::LimitOrderCancelled => {
                if let Some(order_id) = &trade.exchange_order_id {
                    crate::orders::OrderCreator::cancel(exchange, &pair, order_id).await?;
                }
                Ok(DispatchOutcome::Cancelled)
            }
            FollowupAction::LimitFilled => {
                info!(trade_id = trade.id, "limit entry order filled, no action needed");
                Ok(DispatchOutcome::LimitFilled)
            }
            FollowupAction::Informational => {
                warn!(trade_id = trade.id, "follow-up classified as informational, no action taken");
                Ok(DispatchOutcome::Informational)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_break_even_phrasing() {
        assert!(matches!(FollowupProcessor::classify_content("Stops moved to BE"), FollowupAction::BreakEven));
    }

    #[test]
    fn classifies_stop_loss_hit_phrasing() {
        assert!(matches!(FollowupProcessor::classify_content("Position stopped out"), FollowupAction::StopLossHit));
    }

    #[test]
    fn classifies_profit_close_phrasing() {
        assert!(matches!(FollowupProcessor::classify_content("Trade closed in profit"), FollowupAction::ProfitClose));
    }

    #[test]
    fn unrecognized_phrasing_is_informational() {
        assert!(matches!(FollowupProcessor::classify_content("random chatter"), FollowupAction::Informational));
    }

    fn trade(id: u64, created_at: chrono::DateTime<chrono::Utc>, has_order_id: bool) -> Trade {
        Trade {
            id,
            source_message_id: format!("m{id}"),
            coin_symbol: "BTC".to_string(),
            trader: "@Johnny".to_string(),
            exchange: crate::types::Exchange::Binance,
            side: crate::types::PositionSide::Long,
            status: TradeStatus::Open,
            position_size: rust_decimal_macros::dec!(1),
            entry_price: rust_decimal_macros::dec!(100),
            exit_price: None,
            exchange_order_id: if has_order_id { Some(format!("o-{id}")) } else { None },
            stop_loss_order_id: None,
            take_profit_order_ids: vec![],
            content: "BTC Entry: 100".to_string(),
            created_at,
            closed_at: None,
            merged_into_trade_id: None,
            exchange_response: None,
            exchange_update_time: None,
            trade_group_id: None,
        }
    }

    #[tokio::test]
    async fn aggregation_designates_oldest_with_order_id_as_primary() {
        let repo: Arc<dyn TradeRepository> = Arc::new(crate::repository::InMemoryTradeRepository::new());
        let now = chrono::Utc::now();
        let older = repo.insert(trade(0, now - chrono::Duration::minutes(10), true)).await.unwrap();
        let newer = repo.insert(trade(0, now, true)).await.unwrap();

        let primary = FollowupProcessor::resolve_aggregated_target(repo.clone(), &[older.clone(), newer.clone()]).await.unwrap();
        assert_eq!(primary.id, older.id);

        let reloaded_newer = repo.get(newer.id).await.unwrap();
        assert_eq!(reloaded_newer.status, TradeStatus::Merged);
        assert_eq!(reloaded_newer.merged_into_trade_id, Some(older.id));
    }

    #[tokio::test]
    async fn single_related_trade_with_merge_pointer_resolves_to_primary() {
        let repo: Arc<dyn TradeRepository> = Arc::new(crate::repository::InMemoryTradeRepository::new());
        let primary_trade = repo.insert(trade(0, chrono::Utc::now(), true)).await.unwrap();
        let mut secondary = trade(0, chrono::Utc::now(), true);
        secondary.merged_into_trade_id = Some(primary_trade.id);

        let resolved = FollowupProcessor::resolve_aggregated_target(repo.clone(), &[secondary]).await.unwrap();
        assert_eq!(resolved.id, primary_trade.id);
    }
}
