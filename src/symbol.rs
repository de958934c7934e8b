// =============================================================================
// Symbol & Precision Resolver (C1)
// =============================================================================
//
// Converts a canonical coin symbol into an exchange-native trading pair and
// caches the per-pair quantity/price filters needed to submit a compliant
// order. Single-writer-per-key, many-reader; stale cache entries are
// preferred over a hard failure when a refresh fetch errors out.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rust_decimal::prelude::*;
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::{debug, instrument, warn};

use crate::error::EngineError;
use crate::exchange::Exchange as ExchangePort;
use crate::types::{Exchange, SymbolFilters};

struct CacheEntry {
    filters: SymbolFilters,
    fetched_at: Instant,
}

pub struct SymbolResolver {
    cache: RwLock<HashMap<(Exchange, String), CacheEntry>>,
    ttl: Duration,
}

impl SymbolResolver {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Map a canonical coin symbol to an exchange's native pair format.
    /// Binance USDⓈ-M perpetuals are `{COIN}USDT`; KuCoin futures use the
    /// `XBT` alias for BTC and a trailing `M`: `{COIN}USDTM`.
    pub fn native_pair(exchange: Exchange, coin: &str) -> String {
        let coin = coin.to_uppercase();
        match exchange {
            Exchange::Binance => format!("{coin}USDT"),
            Exchange::Kucoin => {
                let aliased = if coin == "BTC" { "XBT".to_string() } else { coin };
                format!("{aliased}USDTM")
            }
        }
    }

    #[instrument(skip(self, port), fields(exchange = %exchange, coin))]
    pub async fn resolve(
        &self,
        port: &dyn ExchangePort,
        exchange: Exchange,
        coin: &str,
    ) -> Result<(String, SymbolFilters), EngineError> {
        let pair = Self::native_pair(exchange, coin);
        let key = (exchange, pair.clone());

        if let Some(entry) = self.cache.read().get(&key) {
            if entry.fetched_at.elapsed() < self.ttl {
                debug!(pair = %pair, "symbol cache hit");
                return Ok((pair, entry.filters.clone()));
            }
        }

        match port.get_symbol_filters(&pair).await {
            Ok(filters) => {
                self.cache.write().insert(
                    key,
                    CacheEntry {
                        filters: filters.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                Ok((pair, filters))
            }
            Err(err) => {
                if let Some(entry) = self.cache.read().get(&key) {
                    warn!(pair = %pair, error = %err, "symbol fetch failed, serving stale cache");
                    return Ok((pair, entry.filters.clone()));
                }
                Err(EngineError::UnsupportedSymbol(pair))
            }
        }
    }

    pub fn clear_cache(&self, exchange: Option<Exchange>, pair: Option<&str>) {
        let mut cache = self.cache.write();
        match (exchange, pair) {
            (Some(ex), Some(p)) => {
                cache.remove(&(ex, p.to_string()));
            }
            (Some(ex), None) => cache.retain(|(e, _), _| *e != ex),
            _ => cache.clear(),
        }
    }

    /// Round `qty` down to the nearest `step_size`, clamped into
    /// [min_qty, max_qty].
    pub fn round_quantity(filters: &SymbolFilters, qty: Decimal) -> Decimal {
        let stepped = Self::round_to_step(qty, filters.step_size);
        stepped.clamp(filters.min_qty, filters.max_qty)
    }

    /// Round `price` to the nearest `tick_size` using round-half-up.
    pub fn round_price(filters: &SymbolFilters, price: Decimal) -> Decimal {
        Self::round_to_step(price, filters.tick_size)
    }

    fn round_to_step(value: Decimal, step: Decimal) -> Decimal {
        if step.is_zero() {
            return value;
        }
        let units = (value / step).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
        units * step
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

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

    #[test]
    fn native_pair_formats_per_exchange() {
        assert_eq!(SymbolResolver::native_pair(Exchange::Binance, "btc"), "BTCUSDT");
        assert_eq!(SymbolResolver::native_pair(Exchange::Kucoin, "btc"), "XBTUSDTM");
        assert_eq!(SymbolResolver::native_pair(Exchange::Kucoin, "eth"), "ETHUSDTM");
    }

    #[test]
    fn round_quantity_is_idempotent() {
        let f = filters();
        let once = SymbolResolver::round_quantity(&f, dec!(0.12345));
        let twice = SymbolResolver::round_quantity(&f, once);
        assert_eq!(once, twice);
    }

    #[test]
    fn round_quantity_clamps_to_min() {
        let f = filters();
        let rounded = SymbolResolver::round_quantity(&f, dec!(0.0001));
        assert_eq!(rounded, f.min_qty);
    }

    #[test]
    fn round_price_aligns_to_tick() {
        let f = filters();
        let rounded = SymbolResolver::round_price(&f, dec!(86123.27));
        assert_eq!(rounded, dec!(86123.3));
    }
}
