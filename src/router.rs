// =============================================================================
// Signal Router (C7)
// =============================================================================
//
// Maps a trader to an exchange, and for follow-ups resolves the set of local
// trades a free-form update alert actually refers to. Routing itself is a
// pure lookup against `EngineConfig`; the interesting work here is
// timestamp-proximal multi-order matching for follow-ups.
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::types::{Alert, Exchange, Trade};

pub struct SignalRouter;

impl SignalRouter {
    /// Select the exchange for an inbound initial signal's trader.
    pub fn route_initial(config: &EngineConfig, trader: &str) -> Exchange {
        let exchange = config.exchange_for_trader(trader);
        info!(trader, %exchange, "routed initial signal");
        exchange
    }

    /// Find the trades a follow-up alert refers to among `candidates`
    /// (already filtered by coin upstream). A candidate is in-range if the
    /// alert's timestamp is within `tolerance` of either the trade's own
    /// timestamp or the `updateTime` embedded in its persisted exchange
    /// response. If the alert carries a `trade_group_id`, it further
    /// constrains candidates to the same group.
    pub fn find_related_trades<'a>(
        alert: &Alert,
        candidates: &'a [Trade],
        tolerance: Duration,
    ) -> Vec<&'a Trade> {
        let mut related: Vec<&Trade> = candidates
            .iter()
            .filter(|t| Self::is_timestamp_related(alert.timestamp, t, tolerance))
            .collect();

        if let Some(group_id) = &alert.trade_group_id {
            related.retain(|t| t.trade_group_id.as_deref() == Some(group_id.as_str()));
        }

        if related.is_empty() {
            // Fall back to the single trade whose source_message_id matches
            // the alert's own trade reference.
            if let Some(direct) = candidates.iter().find(|t| t.source_message_id == alert.trade_source_message_id) {
                return vec![direct];
            }
            warn!(alert_id = alert.id, "no related trades found for follow-up");
        }

        related
    }

    fn is_timestamp_related(alert_time: DateTime<Utc>, trade: &Trade, tolerance: Duration) -> bool {
        let near_created = (alert_time - trade.created_at).abs() <= tolerance;
        let near_exchange_update = trade
            .exchange_update_time
            .map(|t| (alert_time - t).abs() <= tolerance)
            .unwrap_or(false);
        near_created || near_exchange_update
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Exchange as ExchangeEnum, PositionSide, TradeStatus};
    use rust_decimal_macros::dec;

    fn trade_at(id: u64, ts: DateTime<Utc>, source: &str) -> Trade {
        trade_at_with_group(id, ts, source, None)
    }

    fn trade_at_with_group(id: u64, ts: DateTime<Utc>, source: &str, group_id: Option<&str>) -> Trade {
        Trade {
            id,
            source_message_id: source.to_string(),
            coin_symbol: "BTC".to_string(),
            trader: "@Johnny".to_string(),
            exchange: ExchangeEnum::Binance,
            side: PositionSide::Long,
            status: TradeStatus::Open,
            position_size: dec!(1),
            entry_price: dec!(100),
            exit_price: None,
            exchange_order_id: Some(format!("o-{id}")),
            stop_loss_order_id: None,
            take_profit_order_ids: vec![],
            content: "BTC Entry: 100".to_string(),
            created_at: ts,
            closed_at: None,
            merged_into_trade_id: None,
            exchange_response: None,
            exchange_update_time: None,
            trade_group_id: group_id.map(str::to_string),
        }
    }

    fn alert_at(ts: DateTime<Utc>, trade_source: &str) -> Alert {
        alert_at_with_group(ts, trade_source, None)
    }

    fn alert_at_with_group(ts: DateTime<Utc>, trade_source: &str, group_id: Option<&str>) -> Alert {
        Alert {
            id: 1,
            trade_source_message_id: trade_source.to_string(),
            trader: "@Johnny".to_string(),
            coin_symbol: Some("BTC".to_string()),
            timestamp: ts,
            content: "stops moved to be".to_string(),
            parsed_action: None,
            status: crate::types::AlertStatus::Pending,
            trade_group_id: group_id.map(str::to_string),
        }
    }

    #[test]
    fn route_initial_uses_exact_mapping() {
        let cfg = EngineConfig::default();
        assert_eq!(SignalRouter::route_initial(&cfg, "@Tareeq"), ExchangeEnum::Kucoin);
    }

    #[test]
    fn matches_trade_within_tolerance() {
        let now = Utc::now();
        let trade = trade_at(1, now, "m1");
        let alert = alert_at(now + Duration::minutes(3), "m1");
        let matches = SignalRouter::find_related_trades(&alert, &[trade], Duration::minutes(5));
        assert_eq!(matches.len(), 1);
    }

    #[test]
    fn excludes_trade_outside_tolerance() {
        let now = Utc::now();
        let trade = trade_at(1, now, "m1");
        let alert = alert_at(now + Duration::minutes(10), "m-other");
        let matches = SignalRouter::find_related_trades(&alert, &[trade], Duration::minutes(5));
        assert!(matches.is_empty());
    }

    #[test]
    fn falls_back_to_direct_source_message_match() {
        let now = Utc::now();
        let trade = trade_at(1, now - Duration::hours(2), "m1");
        let alert = alert_at(now, "m1");
        let matches = SignalRouter::find_related_trades(&alert, &[trade], Duration::minutes(5));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].source_message_id, "m1");
    }

    #[test]
    fn group_id_requires_exact_equality_not_substring() {
        let now = Utc::now();
        let matching = trade_at_with_group(1, now, "m1", Some("grp-1"));
        let other_group = trade_at_with_group(2, now, "m2", Some("other-grp-1-x"));
        let alert = alert_at_with_group(now + Duration::minutes(1), "m1", Some("grp-1"));

        let matches = SignalRouter::find_related_trades(&alert, &[matching, other_group], Duration::minutes(5));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, 1);
    }
}
