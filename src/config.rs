// =============================================================================
// Engine configuration — hot-reloadable settings with atomic save
// =============================================================================
//
// Every tunable parameter named in the external interface contract lives
// here. Persistence uses an atomic tmp + rename pattern to avoid corruption
// on crash. All fields carry `#[serde(default = "...")]` so that adding a new
// field never breaks loading an older config file. Exchange credentials are
// intentionally NOT part of this struct; they are read from the environment
// at startup (see `main.rs`) and never written to disk.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::Exchange;

fn default_trade_amount() -> Decimal {
    dec!(100)
}

fn default_fee_rate() -> Decimal {
    dec!(0.0002)
}

fn default_cooldown_secs() -> u64 {
    60
}

fn default_target_traders() -> Vec<String> {
    vec!["@Johnny".to_string(), "@Tareeq".to_string()]
}

fn default_trader_exchange_map() -> HashMap<String, Exchange> {
    let mut m = HashMap::new();
    m.insert("@Johnny".to_string(), Exchange::Binance);
    m.insert("@-Johnny".to_string(), Exchange::Binance);
    m.insert("@Tareeq".to_string(), Exchange::Kucoin);
    m.insert("@-Tareeq".to_string(), Exchange::Kucoin);
    m
}

fn default_exchange() -> Exchange {
    Exchange::Binance
}

fn default_symbol_cache_ttl_mins() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_maker_tick_offset() -> u32 {
    3
}

fn default_bracket_pct() -> Decimal {
    dec!(0.05)
}

fn default_timestamp_tolerance_mins() -> i64 {
    5
}

fn default_match_confidence_threshold() -> Decimal {
    dec!(0.6)
}

fn default_reconcile_lookback_hours() -> i64 {
    24
}

fn default_reconcile_interval_secs() -> u64 {
    30
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// USDT notional spent per entry signal.
    #[serde(default = "default_trade_amount")]
    pub trade_amount: Decimal,

    /// Per-side taker fee rate used for breakeven-price calculations.
    #[serde(default = "default_fee_rate")]
    pub fixed_fee_rate: Decimal,

    /// Minimum time between two successful entries for the same
    /// (exchange, coin) pair.
    #[serde(default = "default_cooldown_secs")]
    pub trade_cooldown_secs: u64,

    /// Traders the active-futures reconciler watches.
    #[serde(default = "default_target_traders")]
    pub target_traders: Vec<String>,

    /// Static trader -> exchange routing table.
    #[serde(default = "default_trader_exchange_map")]
    pub trader_exchange_map: HashMap<String, Exchange>,

    /// Exchange used for traders with no mapping at all (exact or partial).
    #[serde(default = "default_exchange")]
    pub default_exchange: Exchange,

    /// Symbol filter cache time-to-live, in minutes.
    #[serde(default = "default_symbol_cache_ttl_mins")]
    pub symbol_cache_ttl_mins: u64,

    /// Whether the symbol resolver should refresh filters from the exchange
    /// at all, or rely purely on the static fallback table.
    #[serde(default = "default_true")]
    pub dynamic_validation_enabled: bool,

    /// When true, exchange clients are never actually called; used for
    /// dry-run testing of the routing/risk pipeline.
    #[serde(default)]
    pub offline_mode: bool,

    /// Number of ticks to walk a maker-preflight LIMIT price away from the
    /// touch when it would otherwise cross the book.
    #[serde(default = "default_maker_tick_offset")]
    pub maker_tick_offset: u32,

    /// Default stop-loss / take-profit distance from entry, used when a
    /// signal omits one, expressed as a fraction (0.05 == 5%).
    #[serde(default = "default_bracket_pct")]
    pub default_bracket_pct: Decimal,

    /// Follow-up timestamp matching tolerance.
    #[serde(default = "default_timestamp_tolerance_mins")]
    pub timestamp_tolerance_mins: i64,

    /// Minimum confidence score for the active-futures matcher to accept a
    /// candidate.
    #[serde(default = "default_match_confidence_threshold")]
    pub match_confidence_threshold: Decimal,

    /// How far back the reconciler looks for closed active-futures entries
    /// on a cold start (no watermark yet).
    #[serde(default = "default_reconcile_lookback_hours")]
    pub reconcile_lookback_hours: i64,

    /// Reconciler poll interval.
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    /// Per-request timeout for exchange HTTP calls.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Max retry attempts for retryable exchange errors.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            trade_amount: default_trade_amount(),
            fixed_fee_rate: default_fee_rate(),
            trade_cooldown_secs: default_cooldown_secs(),
            target_traders: default_target_traders(),
            trader_exchange_map: default_trader_exchange_map(),
            default_exchange: default_exchange(),
            symbol_cache_ttl_mins: default_symbol_cache_ttl_mins(),
            dynamic_validation_enabled: true,
            offline_mode: false,
            maker_tick_offset: default_maker_tick_offset(),
            default_bracket_pct: default_bracket_pct(),
            timestamp_tolerance_mins: default_timestamp_tolerance_mins(),
            match_confidence_threshold: default_match_confidence_threshold(),
            reconcile_lookback_hours: default_reconcile_lookback_hours(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl EngineConfig {
    /// Resolve the exchange for a trader: exact match, then substring match
    /// against a mapped key in either direction, then the configured
    /// default.
    pub fn exchange_for_trader(&self, trader: &str) -> Exchange {
        let normalized = trader.trim();
        if normalized.is_empty() {
            return self.default_exchange;
        }

        if let Some(ex) = self.trader_exchange_map.get(normalized) {
            return *ex;
        }

        for (mapped_trader, ex) in &self.trader_exchange_map {
            if normalized.contains(mapped_trader.as_str()) || mapped_trader.contains(normalized) {
                return *ex;
            }
        }

        self.default_exchange
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;
        info!(path = %path.display(), "engine config loaded");
        Ok(config)
    }

    /// Persist using an atomic write (tmp file + rename) so a crash mid-write
    /// never leaves a half-written config on disk.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content =
            serde_json::to_string_pretty(self).context("failed to serialise engine config")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.trade_cooldown_secs, 60);
        assert_eq!(cfg.default_exchange, Exchange::Binance);
        assert_eq!(cfg.target_traders.len(), 2);
        assert!(cfg.dynamic_validation_enabled);
        assert!(!cfg.offline_mode);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.trade_cooldown_secs, 60);
        assert_eq!(cfg.maker_tick_offset, 3);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "trade_cooldown_secs": 120 }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.trade_cooldown_secs, 120);
        assert_eq!(cfg.default_exchange, Exchange::Binance);
    }

    #[test]
    fn exact_trader_match() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.exchange_for_trader("@Johnny"), Exchange::Binance);
        assert_eq!(cfg.exchange_for_trader("@Tareeq"), Exchange::Kucoin);
    }

    #[test]
    fn partial_trader_match() {
        let cfg = EngineConfig::default();
        // "@--Johnny" is not an exact key but contains "@Johnny" is false;
        // check the reverse containment direction instead.
        assert_eq!(cfg.exchange_for_trader("-Tareeq"), Exchange::Kucoin);
    }

    #[test]
    fn unknown_trader_falls_back_to_default() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.exchange_for_trader("@SomeoneElse"), Exchange::Binance);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = EngineConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.trade_amount, cfg2.trade_amount);
        assert_eq!(cfg.trade_cooldown_secs, cfg2.trade_cooldown_secs);
    }
}
