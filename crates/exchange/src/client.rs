//! Signed REST client for the spot exchange.
//!
//! All requests pass through a [`WeightBudget`]; signed endpoints add a
//! timestamp corrected by the clock offset measured in [`BinanceClient::sync_time`].

use crate::rate_limit::{weight, WeightBudget};
use crate::signing::{signed_query, Credentials};
use crate::types::{
    commission_in_quote, millis_to_utc, parse_kline, parse_status, ApiErrorBody, ExchangeInfo,
    RawAccount, RawOrder, RawOrderStatus, RawTrade, ServerTime, TickerPrice,
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use spotgrid_core::config::{ExchangeConfig, MarketDataConfig};
use spotgrid_core::error::{parse_ban_until, ExchangeError, ExchangeResult};
use spotgrid_core::events::{
    split_symbol, AccountSnapshot, Kline, LimitOrder, MarketOrder, OrderAck, OrderAmount,
    OrderFill, OrderStatus, Side, SymbolFilters,
};
use spotgrid_core::traits::ExchangeClient;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// REST client for a Binance-compatible spot API.
pub struct BinanceClient {
    http: Client,
    base_url: String,
    recv_window_ms: u64,
    credentials: Option<Credentials>,
    budget: Arc<WeightBudget>,
    clock_offset_ms: AtomicI64,
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("base_url", &self.base_url)
            .field("authenticated", &self.credentials.is_some())
            .finish_non_exhaustive()
    }
}

fn decimal_param(value: Decimal) -> String {
    value.normalize().to_string()
}

fn map_transport(e: &reqwest::Error) -> ExchangeError {
    if e.is_timeout() {
        ExchangeError::Timeout(e.to_string())
    } else if e.is_decode() {
        ExchangeError::Decode(e.to_string())
    } else {
        ExchangeError::Network(e.to_string())
    }
}

impl BinanceClient {
    /// Builds a client. Without credentials only public endpoints work.
    ///
    /// # Errors
    /// Returns a configuration error if the HTTP client cannot be built.
    pub fn new(
        exchange: &ExchangeConfig,
        market_data: &MarketDataConfig,
        credentials: Option<Credentials>,
    ) -> ExchangeResult<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(exchange.request_timeout_secs))
            .build()
            .map_err(|e| ExchangeError::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: exchange.rest_url.trim_end_matches('/').to_string(),
            recv_window_ms: exchange.recv_window_ms,
            credentials,
            budget: Arc::new(WeightBudget::new(
                market_data.requests_per_minute,
                market_data.weight_warn_threshold,
            )),
            clock_offset_ms: AtomicI64::new(0),
        })
    }

    #[must_use]
    pub fn budget(&self) -> Arc<WeightBudget> {
        Arc::clone(&self.budget)
    }

    #[must_use]
    pub fn clock_offset_ms(&self) -> i64 {
        self.clock_offset_ms.load(Ordering::Relaxed)
    }

    fn timestamp_ms(&self) -> i64 {
        Utc::now().timestamp_millis() + self.clock_offset_ms()
    }

    async fn public_get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
        cost: u32,
    ) -> ExchangeResult<T> {
        self.budget.acquire(cost).await;
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!(%url, "GET");
        let response = self
            .http
            .get(&url)
            .query(params)
            .send()
            .await
            .map_err(|e| map_transport(&e))?;
        Self::handle_response(response).await
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        cost: u32,
    ) -> ExchangeResult<T> {
        let credentials = self.credentials.as_ref().ok_or_else(|| {
            ExchangeError::Configuration("API credentials required for signed endpoint".to_string())
        })?;
        self.budget.acquire(cost).await;
        let query = signed_query(credentials, params, self.timestamp_ms(), self.recv_window_ms)?;
        let url = format!("{}{}?{}", self.base_url, path, query);
        tracing::debug!(%method, %path, "Signed request");
        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &credentials.api_key)
            .send()
            .await
            .map_err(|e| map_transport(&e))?;
        Self::handle_response(response).await
    }

    async fn handle_response<T: DeserializeOwned>(response: reqwest::Response) -> ExchangeResult<T> {
        let status = response.status();
        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());

        if status.is_success() {
            return response.json::<T>().await.map_err(|e| map_transport(&e));
        }

        let text = response.text().await.unwrap_or_default();
        let body = serde_json::from_str::<ApiErrorBody>(&text).ok();

        match status {
            StatusCode::IM_A_TEAPOT => {
                let until = body
                    .as_ref()
                    .and_then(|b| parse_ban_until(&b.msg))
                    .unwrap_or_else(|| {
                        let secs = i64::try_from(retry_after.unwrap_or(120)).unwrap_or(120);
                        Utc::now() + Duration::seconds(secs)
                    });
                Err(ExchangeError::Banned { until })
            }
            StatusCode::TOO_MANY_REQUESTS => Err(ExchangeError::RateLimited {
                retry_after_secs: retry_after.unwrap_or(60),
            }),
            _ => Err(body.map_or_else(
                || ExchangeError::Api {
                    code: i64::from(status.as_u16()),
                    message: text,
                },
                |b| ExchangeError::from_api(b.code, b.msg),
            )),
        }
    }

    fn fill_from_raw(order: RawOrder, symbol: &str, side: Side) -> OrderFill {
        let (base, quote) = split_symbol(symbol);
        let commission = commission_in_quote(
            order
                .fills
                .iter()
                .map(|f| (f.price, f.commission, f.commission_asset.as_str())),
            &base,
            &quote,
        );
        OrderFill::new(
            order.order_id.to_string(),
            symbol.to_string(),
            side,
            order.executed_qty,
            order.cumulative_quote,
            commission,
        )
    }
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    async fn get_price(&self, symbol: &str) -> ExchangeResult<Decimal> {
        let ticker: TickerPrice = self
            .public_get("/api/v3/ticker/price", &[("symbol", symbol.to_string())], weight::PRICE)
            .await?;
        Ok(ticker.price)
    }

    async fn get_klines(&self, symbol: &str, interval: &str, limit: usize) -> ExchangeResult<Vec<Kline>> {
        let rows: Vec<Vec<serde_json::Value>> = self
            .public_get(
                "/api/v3/klines",
                &[
                    ("symbol", symbol.to_string()),
                    ("interval", interval.to_string()),
                    ("limit", limit.min(1000).to_string()),
                ],
                weight::KLINES,
            )
            .await?;
        rows.iter().map(|row| parse_kline(row)).collect()
    }

    async fn get_account(&self) -> ExchangeResult<AccountSnapshot> {
        let raw: RawAccount = self
            .signed(Method::GET, "/api/v3/account", &[], weight::ACCOUNT)
            .await?;
        Ok(raw.into())
    }

    async fn symbol_filters(&self, symbol: &str) -> ExchangeResult<SymbolFilters> {
        let info: ExchangeInfo = self
            .public_get(
                "/api/v3/exchangeInfo",
                &[("symbol", symbol.to_string())],
                weight::EXCHANGE_INFO,
            )
            .await?;
        info.symbols
            .iter()
            .find(|s| s.symbol == symbol)
            .map(crate::types::RawSymbol::filters)
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))
    }

    async fn submit_market_order(&self, order: &MarketOrder) -> ExchangeResult<OrderFill> {
        let amount = match order.amount {
            OrderAmount::Quote(q) => ("quoteOrderQty", decimal_param(q)),
            OrderAmount::Base(b) => ("quantity", decimal_param(b)),
        };
        let params = [
            ("symbol", order.symbol.clone()),
            ("side", order.side.as_str().to_string()),
            ("type", "MARKET".to_string()),
            amount,
            ("newOrderRespType", "FULL".to_string()),
            ("newClientOrderId", uuid::Uuid::new_v4().simple().to_string()),
        ];
        let raw: RawOrder = self
            .signed(Method::POST, "/api/v3/order", &params, weight::ORDER)
            .await?;
        if raw.executed_qty.is_zero() {
            return Err(ExchangeError::OrderRejected(format!(
                "market order {} not filled (status {})",
                raw.order_id, raw.status
            )));
        }
        let fill = Self::fill_from_raw(raw, &order.symbol, order.side);
        tracing::info!(
            symbol = %fill.symbol,
            side = %fill.side,
            qty = %fill.executed_qty,
            avg_price = %fill.avg_price,
            order_id = %fill.order_id,
            "Market order filled"
        );
        Ok(fill)
    }

    async fn submit_limit_order(&self, order: &LimitOrder) -> ExchangeResult<OrderAck> {
        let params = [
            ("symbol", order.symbol.clone()),
            ("side", order.side.as_str().to_string()),
            ("type", "LIMIT".to_string()),
            ("timeInForce", "GTC".to_string()),
            ("quantity", decimal_param(order.quantity)),
            ("price", decimal_param(order.price)),
        ];
        let raw: RawOrder = self
            .signed(Method::POST, "/api/v3/order", &params, weight::ORDER)
            .await?;
        Ok(OrderAck {
            order_id: raw.order_id.to_string(),
            symbol: order.symbol.clone(),
            status: parse_status(&raw.status),
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<()> {
        let _: serde_json::Value = self
            .signed(
                Method::DELETE,
                "/api/v3/order",
                &[("symbol", symbol.to_string()), ("orderId", order_id.to_string())],
                weight::ORDER,
            )
            .await?;
        Ok(())
    }

    async fn get_order_status(&self, symbol: &str, order_id: &str) -> ExchangeResult<OrderStatus> {
        let raw: RawOrderStatus = self
            .signed(
                Method::GET,
                "/api/v3/order",
                &[("symbol", symbol.to_string()), ("orderId", order_id.to_string())],
                weight::ORDER,
            )
            .await?;
        Ok(parse_status(&raw.status))
    }

    async fn order_commission(&self, symbol: &str, order_id: &str) -> ExchangeResult<Option<Decimal>> {
        let trades: Vec<RawTrade> = self
            .signed(
                Method::GET,
                "/api/v3/myTrades",
                &[("symbol", symbol.to_string()), ("orderId", order_id.to_string())],
                weight::MY_TRADES,
            )
            .await?;
        if trades.is_empty() {
            return Ok(None);
        }
        let (base, quote) = split_symbol(symbol);
        Ok(Some(commission_in_quote(
            trades
                .iter()
                .map(|t| (t.price, t.commission, t.commission_asset.as_str())),
            &base,
            &quote,
        )))
    }

    async fn sync_time(&self) -> ExchangeResult<()> {
        let before = Utc::now().timestamp_millis();
        let server: ServerTime = self.public_get("/api/v3/time", &[], weight::TIME).await?;
        let after = Utc::now().timestamp_millis();
        let local = before + (after - before) / 2;
        let offset = server.server_time - local;
        self.clock_offset_ms.store(offset, Ordering::Relaxed);
        tracing::info!(
            offset_ms = offset,
            server_time = %millis_to_utc(server.server_time)?,
            "Clock synchronised with exchange"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer, credentials: Option<Credentials>) -> BinanceClient {
        let exchange = ExchangeConfig {
            rest_url: server.uri(),
            ..ExchangeConfig::default()
        };
        BinanceClient::new(&exchange, &MarketDataConfig::default(), credentials).unwrap()
    }

    fn creds() -> Option<Credentials> {
        Some(Credentials::new("key", "secret"))
    }

    #[tokio::test]
    async fn fetches_price() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/ticker/price"))
            .and(query_param("symbol", "ETHUSDT"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "symbol": "ETHUSDT",
                "price": "3000.50000000"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server, None);
        assert_eq!(client.get_price("ETHUSDT").await.unwrap(), dec!(3000.5));
    }

    #[tokio::test]
    async fn parses_klines() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/klines"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                [1_700_000_000_000_i64, "100", "110", "90", "105", "12.5", 1_700_000_059_999_i64, "0", 1, "0", "0", "0"],
                [1_700_000_060_000_i64, "105", "106", "104", "104.5", "3", 1_700_000_119_999_i64, "0", 1, "0", "0", "0"]
            ])))
            .mount(&server)
            .await;

        let client = client_for(&server, None);
        let klines = client.get_klines("ETHUSDT", "1m", 2).await.unwrap();
        assert_eq!(klines.len(), 2);
        assert_eq!(klines[0].high, dec!(110));
        assert_eq!(klines[1].close, dec!(104.5));
    }

    #[tokio::test]
    async fn market_order_fill_includes_commission() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v3/order"))
            .and(query_param("quoteOrderQty", "300"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "symbol": "ETHUSDT",
                "orderId": 42,
                "status": "FILLED",
                "executedQty": "0.10000000",
                "cummulativeQuoteQty": "300.00000000",
                "fills": [
                    {"price": "3000", "qty": "0.1", "commission": "0.0001", "commissionAsset": "ETH"}
                ]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server, creds());
        let fill = client
            .submit_market_order(&MarketOrder {
                symbol: "ETHUSDT".to_string(),
                side: Side::Buy,
                amount: OrderAmount::Quote(dec!(300)),
            })
            .await
            .unwrap();
        assert_eq!(fill.order_id, "42");
        assert_eq!(fill.avg_price, dec!(3000));
        assert_eq!(fill.commission, dec!(0.3));
    }

    #[tokio::test]
    async fn clock_skew_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/account"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "code": -1021,
                "msg": "Timestamp for this request is outside of the recvWindow."
            })))
            .mount(&server)
            .await;

        let client = client_for(&server, creds());
        let err = client.get_account().await.unwrap_err();
        assert!(err.is_clock_skew());
    }

    #[tokio::test]
    async fn teapot_is_a_ban() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/ticker/price"))
            .respond_with(ResponseTemplate::new(418).set_body_json(serde_json::json!({
                "code": -1003,
                "msg": "Way too much request weight used; IP banned until 1700000000000."
            })))
            .mount(&server)
            .await;

        let client = client_for(&server, None);
        let err = client.get_price("ETHUSDT").await.unwrap_err();
        assert_eq!(err.ban_until().unwrap().timestamp_millis(), 1_700_000_000_000);
    }

    #[tokio::test]
    async fn too_many_requests_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/ticker/price"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
            .mount(&server)
            .await;

        let client = client_for(&server, None);
        let err = client.get_price("ETHUSDT").await.unwrap_err();
        assert_eq!(err, ExchangeError::RateLimited { retry_after_secs: 7 });
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn signed_calls_need_credentials() {
        let server = MockServer::start().await;
        let client = client_for(&server, None);
        assert!(matches!(
            client.get_account().await,
            Err(ExchangeError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn sync_time_sets_offset() {
        let server = MockServer::start().await;
        let ahead = Utc::now().timestamp_millis() + 60_000;
        Mock::given(method("GET"))
            .and(path("/api/v3/time"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"serverTime": ahead})),
            )
            .mount(&server)
            .await;

        let client = client_for(&server, None);
        client.sync_time().await.unwrap();
        assert!(client.clock_offset_ms() > 50_000);
    }

    #[tokio::test]
    async fn symbol_filters_from_exchange_info() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/exchangeInfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "symbols": [{
                    "symbol": "ETHUSDT",
                    "filters": [
                        {"filterType": "PRICE_FILTER", "tickSize": "0.01"},
                        {"filterType": "LOT_SIZE", "stepSize": "0.0001"}
                    ]
                }]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server, None);
        let filters = client.symbol_filters("ETHUSDT").await.unwrap();
        assert_eq!(filters.step_size, dec!(0.0001));
        assert!(matches!(
            client.symbol_filters("BTCUSDT").await,
            Err(ExchangeError::UnknownSymbol(_))
        ));
    }
}
