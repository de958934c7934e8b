// =============================================================================
// Binance USDⓈ-M Futures client — implements the Exchange capability (C2)
// =============================================================================
//
// HMAC-SHA256 request signing: secret is never logged, recvWindow tolerates
// clock drift, and every signed request carries the timestamp/signature pair
// appended last.
// =============================================================================

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use rust_decimal::Decimal;
use sha2::Sha256;
use std::str::FromStr;
use tracing::{debug, instrument, warn};

use crate::error::EngineError;
use crate::exchange::{Exchange as ExchangeTrait, OrderBook, OrderBookLevel, OrderRequest, OrderResponse, Position};
use crate::types::{OrderKind, OrderSide, SymbolFilters};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW: u64 = 5000;

/// Ticks to walk a crossing LIMIT price away from the touch during
/// maker-preflight adjustment.
pub const DEFAULT_MAKER_TICK_OFFSET: u32 = 3;

pub struct BinanceExchange {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    maker_tick_offset: u32,
}

impl BinanceExchange {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, maker_tick_offset: u32) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key,
            secret,
            base_url: "https://fapi.binance.com".to_string(),
            client,
            maker_tick_offset,
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &str,
    ) -> Result<serde_json::Value, EngineError> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);

        let resp = self
            .client
            .request(method, &url)
            .send()
            .await
            .map_err(|e| EngineError::Network(e.to_string()))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EngineError::Network(format!("invalid response body: {e}")))?;

        if status.as_u16() == 429 || status.as_u16() == 418 {
            return Err(EngineError::RateLimited { retry_after_ms: 1000 });
        }
        if !status.is_success() {
            return Err(EngineError::ExchangeRejected(body.to_string()));
        }

        Ok(body)
    }

    fn order_side_str(side: OrderSide) -> &'static str {
        match side {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    fn order_type_str(kind: OrderKind) -> &'static str {
        match kind {
            OrderKind::Market => "MARKET",
            OrderKind::Limit => "LIMIT",
            OrderKind::StopMarket => "STOP_MARKET",
            OrderKind::TakeProfitMarket => "TAKE_PROFIT_MARKET",
        }
    }

    fn parse_response(body: serde_json::Value) -> OrderResponse {
        let order_id = body["orderId"]
            .as_u64()
            .map(|n| n.to_string())
            .or_else(|| body["orderId"].as_str().map(str::to_string))
            .unwrap_or_default();
        let status = body["status"].as_str().unwrap_or("UNKNOWN").to_string();
        let avg_price = body["avgPrice"]
            .as_str()
            .and_then(|s| Decimal::from_str(s).ok())
            .filter(|d| !d.is_zero());
        let executed_qty = body["executedQty"].as_str().and_then(|s| Decimal::from_str(s).ok());

        OrderResponse {
            order_id,
            status,
            avg_price,
            executed_qty,
            raw: body,
        }
    }

    /// Walk a would-be-crossing LIMIT price away from the touch by
    /// `maker_tick_offset` ticks, grounded on the original system's
    /// maker-preflight adjustment.
    fn maker_preflight(
        &self,
        side: OrderSide,
        price: Decimal,
        book: &OrderBook,
        tick_size: Decimal,
    ) -> Decimal {
        let best_bid = book.best_bid().unwrap_or(Decimal::ZERO);
        let best_ask = book.best_ask().unwrap_or(Decimal::ZERO);

        let tick = if tick_size.is_zero() {
            Decimal::new(1, 8)
        } else {
            tick_size
        };
        let offset = tick * Decimal::from(self.maker_tick_offset.max(1));

        let would_cross = match side {
            OrderSide::Buy => (best_ask > Decimal::ZERO && price >= best_ask) || (best_bid > Decimal::ZERO && price > best_bid),
            OrderSide::Sell => (best_bid > Decimal::ZERO && price <= best_bid) || (best_ask > Decimal::ZERO && price < best_ask),
        };

        if !would_cross {
            return price;
        }

        match side {
            OrderSide::Buy if best_bid > Decimal::ZERO => best_bid - offset,
            OrderSide::Sell if best_ask > Decimal::ZERO => best_ask + offset,
            OrderSide::Buy => price - offset,
            OrderSide::Sell => price + offset,
        }
    }
}

#[async_trait]
impl ExchangeTrait for BinanceExchange {
    #[instrument(skip(self, req), name = "binance::create_order", fields(pair = %req.pair))]
    async fn create_order(&self, mut req: OrderRequest) -> Result<OrderResponse, EngineError> {
        if req.kind == OrderKind::Limit && !req.reduce_only {
            if let Some(price) = req.price {
                let book = self.get_order_book(&req.pair, 5).await;
                let tick = match self.get_symbol_filters(&req.pair).await {
                    Ok(filters) => filters.tick_size,
                    Err(e) => {
                        warn!(pair = %req.pair, error = %e, "failed to resolve tick size for maker-preflight, falling back to 0.01");
                        Decimal::new(1, 2)
                    }
                };
                if let Ok(book) = book {
                    let adjusted = self.maker_preflight(req.side, price, &book, tick);
                    if adjusted != price {
                        debug!(pair = %req.pair, orig = %price, adjusted = %adjusted, "maker-preflight adjusted price");
                        req.price = Some(adjusted);
                    }
                }
            }
        }

        let mut params = format!(
            "symbol={}&side={}&type={}&quantity={}",
            req.pair,
            Self::order_side_str(req.side),
            Self::order_type_str(req.kind),
            req.quantity
        );
        if let Some(price) = req.price {
            params.push_str(&format!("&price={price}&timeInForce=GTC"));
        }
        if let Some(stop_price) = req.stop_price {
            params.push_str(&format!("&stopPrice={stop_price}&workingType=MARK_PRICE"));
        }
        if req.reduce_only {
            params.push_str("&reduceOnly=true");
        }
        if req.close_position {
            params.push_str("&closePosition=true");
        }
        if let Some(coid) = &req.client_order_id {
            params.push_str(&format!("&newClientOrderId={coid}"));
        }

        let body = self.signed_request(reqwest::Method::POST, "/fapi/v1/order", &params).await?;
        Ok(Self::parse_response(body))
    }

    #[instrument(skip(self), name = "binance::cancel_order")]
    async fn cancel_order(&self, pair: &str, order_id: &str) -> Result<(), EngineError> {
        let params = format!("symbol={pair}&orderId={order_id}");
        match self.signed_request(reqwest::Method::DELETE, "/fapi/v1/order", &params).await {
            Ok(_) => Ok(()),
            Err(EngineError::ExchangeRejected(msg)) if msg.contains("Unknown order") => {
                warn!(pair, order_id, "cancel target not found, treating as no-op");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn get_order_status(&self, pair: &str, order_id: &str) -> Result<OrderResponse, EngineError> {
        let params = format!("symbol={pair}&orderId={order_id}");
        let body = self.signed_request(reqwest::Method::GET, "/fapi/v1/order", &params).await?;
        Ok(Self::parse_response(body))
    }

    async fn get_open_orders(&self, pair: Option<&str>) -> Result<Vec<OrderResponse>, EngineError> {
        let params = pair.map(|p| format!("symbol={p}")).unwrap_or_default();
        let body = self.signed_request(reqwest::Method::GET, "/fapi/v1/openOrders", &params).await?;
        let arr = body.as_array().cloned().unwrap_or_default();
        Ok(arr.into_iter().map(Self::parse_response).collect())
    }

    async fn get_positions(&self, pair: Option<&str>) -> Result<Vec<Position>, EngineError> {
        let params = pair.map(|p| format!("symbol={p}")).unwrap_or_default();
        let body = self
            .signed_request(reqwest::Method::GET, "/fapi/v2/positionRisk", &params)
            .await?;
        let arr = body.as_array().cloned().unwrap_or_default();

        let mut positions = Vec::new();
        for p in arr {
            let amt = p["positionAmt"]
                .as_str()
                .and_then(|s| Decimal::from_str(s).ok())
                .unwrap_or(Decimal::ZERO);
            if amt.is_zero() {
                continue;
            }
            positions.push(Position {
                pair: p["symbol"].as_str().unwrap_or_default().to_string(),
                side: if amt.is_sign_positive() { OrderSide::Buy } else { OrderSide::Sell },
                quantity: amt.abs(),
                entry_price: p["entryPrice"].as_str().and_then(|s| Decimal::from_str(s).ok()).unwrap_or_default(),
                mark_price: p["markPrice"].as_str().and_then(|s| Decimal::from_str(s).ok()).unwrap_or_default(),
                unrealized_pnl: p["unRealizedProfit"]
                    .as_str()
                    .and_then(|s| Decimal::from_str(s).ok())
                    .unwrap_or_default(),
            });
        }
        Ok(positions)
    }

    async fn get_mark_price(&self, pair: &str) -> Result<Decimal, EngineError> {
        let url = format!("{}/fapi/v1/premiumIndex?symbol={}", self.base_url, pair);
        let resp = self.client.get(&url).send().await.map_err(|e| EngineError::Network(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(EngineError::MarkPriceUnavailable(pair.to_string()));
        }
        let body: serde_json::Value = resp.json().await.map_err(|e| EngineError::Network(e.to_string()))?;
        body["markPrice"]
            .as_str()
            .and_then(|s| Decimal::from_str(s).ok())
            .ok_or_else(|| EngineError::MarkPriceUnavailable(pair.to_string()))
    }

    async fn get_order_book(&self, pair: &str, depth: u32) -> Result<OrderBook, EngineError> {
        let url = format!("{}/fapi/v1/depth?symbol={}&limit={}", self.base_url, pair, depth);
        let resp = self.client.get(&url).send().await.map_err(|e| EngineError::Network(e.to_string()))?;
        let body: serde_json::Value = resp.json().await.map_err(|e| EngineError::Network(e.to_string()))?;

        let parse_levels = |arr: &serde_json::Value| -> Vec<OrderBookLevel> {
            arr.as_array()
                .map(|levels| {
                    levels
                        .iter()
                        .filter_map(|lvl| {
                            let lvl = lvl.as_array()?;
                            let price = Decimal::from_str(lvl.first()?.as_str()?).ok()?;
                            let qty = Decimal::from_str(lvl.get(1)?.as_str()?).ok()?;
                            Some(OrderBookLevel { price, quantity: qty })
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        Ok(OrderBook {
            bids: parse_levels(&body["bids"]),
            asks: parse_levels(&body["asks"]),
        })
    }

    async fn get_current_prices(&self, pairs: &[String]) -> Result<Vec<(String, Decimal)>, EngineError> {
        let mut out = Vec::with_capacity(pairs.len());
        for pair in pairs {
            out.push((pair.clone(), self.get_mark_price(pair).await?));
        }
        Ok(out)
    }

    async fn close_position(&self, pair: &str, qty: Decimal, side: OrderSide) -> Result<OrderResponse, EngineError> {
        self.create_order(OrderRequest {
            pair: pair.to_string(),
            side,
            kind: OrderKind::Market,
            quantity: qty,
            price: None,
            stop_price: None,
            reduce_only: true,
            close_position: false,
            client_order_id: None,
        })
        .await
    }

    async fn set_leverage(&self, pair: &str, leverage: u32) -> Result<(), EngineError> {
        let params = format!("symbol={pair}&leverage={leverage}");
        self.signed_request(reqwest::Method::POST, "/fapi/v1/leverage", &params).await?;
        Ok(())
    }

    #[instrument(skip(self), name = "binance::get_symbol_filters")]
    async fn get_symbol_filters(&self, pair: &str) -> Result<SymbolFilters, EngineError> {
        let url = format!("{}/fapi/v1/exchangeInfo", self.base_url);
        let resp = self.client.get(&url).send().await.map_err(|e| EngineError::Network(e.to_string()))?;
        let body: serde_json::Value = resp.json().await.map_err(|e| EngineError::Network(e.to_string()))?;

        let symbols = body["symbols"].as_array().ok_or_else(|| EngineError::UnsupportedSymbol(pair.to_string()))?;
        let info = symbols
            .iter()
            .find(|s| s["symbol"].as_str() == Some(pair))
            .ok_or_else(|| EngineError::UnsupportedSymbol(pair.to_string()))?;

        let filters = info["filters"].as_array().cloned().unwrap_or_default();

        let mut step_size = Decimal::new(1, 3);
        let mut min_qty = Decimal::new(1, 3);
        let mut max_qty = Decimal::from(1_000_000);
        let mut tick_size = Decimal::new(1, 2);
        let mut min_notional = Decimal::from(5);

        for f in filters {
            match f["filterType"].as_str() {
                Some("LOT_SIZE") => {
                    step_size = f["stepSize"].as_str().and_then(|s| Decimal::from_str(s).ok()).unwrap_or(step_size);
                    min_qty = f["minQty"].as_str().and_then(|s| Decimal::from_str(s).ok()).unwrap_or(min_qty);
                    max_qty = f["maxQty"].as_str().and_then(|s| Decimal::from_str(s).ok()).unwrap_or(max_qty);
                }
                Some("PRICE_FILTER") => {
                    tick_size = f["tickSize"].as_str().and_then(|s| Decimal::from_str(s).ok()).unwrap_or(tick_size);
                }
                Some("MIN_NOTIONAL") | Some("NOTIONAL") => {
                    min_notional = f["notional"]
                        .as_str()
                        .or_else(|| f["minNotional"].as_str())
                        .and_then(|s| Decimal::from_str(s).ok())
                        .unwrap_or(min_notional);
                }
                _ => {}
            }
        }

        Ok(SymbolFilters {
            native_pair: pair.to_string(),
            step_size,
            tick_size,
            min_qty,
            max_qty,
            min_notional,
        })
    }
}

impl std::fmt::Debug for BinanceExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceExchange")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book(bid: &str, ask: &str) -> OrderBook {
        OrderBook {
            bids: vec![OrderBookLevel { price: Decimal::from_str(bid).unwrap(), quantity: Decimal::ONE }],
            asks: vec![OrderBookLevel { price: Decimal::from_str(ask).unwrap(), quantity: Decimal::ONE }],
        }
    }

    #[test]
    fn maker_preflight_leaves_non_crossing_buy_alone() {
        let ex = BinanceExchange::new("k", "s", DEFAULT_MAKER_TICK_OFFSET);
        let b = book("100.00", "100.10");
        let price = ex.maker_preflight(OrderSide::Buy, Decimal::from_str("99.90").unwrap(), &b, Decimal::new(1, 2));
        assert_eq!(price, Decimal::from_str("99.90").unwrap());
    }

    #[test]
    fn maker_preflight_walks_crossing_buy_below_bid() {
        let ex = BinanceExchange::new("k", "s", 3);
        let b = book("100.00", "100.10");
        let price = ex.maker_preflight(OrderSide::Buy, Decimal::from_str("100.05").unwrap(), &b, Decimal::new(1, 2));
        assert_eq!(price, Decimal::from_str("99.97").unwrap());
    }

    #[test]
    fn maker_preflight_walks_crossing_sell_above_ask() {
        let ex = BinanceExchange::new("k", "s", 3);
        let b = book("100.00", "100.10");
        let price = ex.maker_preflight(OrderSide::Sell, Decimal::from_str("100.02").unwrap(), &b, Decimal::new(1, 2));
        assert_eq!(price, Decimal::from_str("100.13").unwrap());
    }
}
