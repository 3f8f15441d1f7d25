//! Signed futures exchange client for live accounts.
//!
//! Handles:
//! - HMAC-SHA256 request signing (`timestamp` + `recvWindow` + `signature`)
//! - Leverage, market and reduce-only orders
//! - STOP_MARKET / TAKE_PROFIT_MARKET protective orders
//! - Account, position risk and realized-PnL income history

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::de::DeserializeOwned;
use sha2::Sha256;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::types::*;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
const RECV_WINDOW_MS: u64 = 5000;
const API_KEY_HEADER: &str = "X-MBX-APIKEY";
const INCOME_PAGE_LIMIT: usize = 1000;

/// Hex HMAC-SHA256 of `query` under `secret`.
pub fn sign_query(secret: &str, query: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid API secret: {}", e))?;
    mac.update(query.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Client for one live futures account.
pub struct ExchangeClient {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    lot_steps: RwLock<HashMap<String, Decimal>>,
    income_page_limit: usize,
}

impl ExchangeClient {
    pub fn new(base_url: &str, api_key: &str, api_secret: &str) -> Result<Self> {
        if api_key.is_empty() || api_secret.is_empty() {
            anyhow::bail!("API key and secret are required");
        }

        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            lot_steps: RwLock::new(HashMap::new()),
            income_page_limit: INCOME_PAGE_LIMIT,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_income_page_limit(mut self, limit: usize) -> Self {
        self.income_page_limit = limit;
        self
    }

    /// Send a signed request and decode the JSON body.
    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T> {
        let mut query: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        query.push(format!("recvWindow={}", RECV_WINDOW_MS));
        query.push(format!("timestamp={}", Utc::now().timestamp_millis()));
        let query = query.join("&");
        let signature = sign_query(&self.api_secret, &query)?;

        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);
        debug!(method = %method, path = %path, "Signed exchange request");

        let response = self
            .client
            .request(method, &url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", path))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            match serde_json::from_str::<ApiError>(&body) {
                Ok(err) => anyhow::bail!("{} failed: {} - [{}] {}", path, status, err.code, err.msg),
                Err(_) => anyhow::bail!("{} failed: {} - {}", path, status, body),
            }
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse {} response", path))
    }

    // ==================== Account ====================

    pub async fn account(&self) -> Result<AccountInfo> {
        self.signed(Method::GET, "/fapi/v2/account", &[]).await
    }

    /// Non-flat positions, optionally for one symbol.
    pub async fn position_risk(&self, symbol: Option<&str>) -> Result<Vec<PositionRisk>> {
        let params: Vec<(&str, String)> = symbol.map(|s| vec![("symbol", s.to_string())]).unwrap_or_default();
        let risks: Vec<PositionRisk> = self.signed(Method::GET, "/fapi/v2/positionRisk", &params).await?;
        Ok(risks.into_iter().filter(|r| !r.is_flat()).collect())
    }

    /// REALIZED_PNL income entries at or after `start_ms`, oldest first.
    ///
    /// Pages forward from the last timestamp of each full page. Records
    /// sharing that millisecond come back again and are dropped by `tranId`.
    pub async fn realized_pnl_since(&self, start_ms: i64) -> Result<Vec<IncomeRecord>> {
        let mut records: Vec<IncomeRecord> = Vec::new();
        let mut seen: HashSet<(i64, i64)> = HashSet::new();
        let mut cursor = start_ms;

        loop {
            let params = [
                ("incomeType", "REALIZED_PNL".to_string()),
                ("startTime", cursor.to_string()),
                ("limit", self.income_page_limit.to_string()),
            ];
            let page: Vec<IncomeRecord> = self.signed(Method::GET, "/fapi/v1/income", &params).await?;
            let full = page.len() >= self.income_page_limit;
            let last_time = page.iter().map(|r| r.time).max();

            for record in page {
                if seen.insert((record.tran_id, record.time)) {
                    records.push(record);
                }
            }

            match last_time {
                Some(time) if full && time > cursor => cursor = time,
                Some(_) if full => {
                    warn!(cursor, "Income page filled by one millisecond, later entries skipped");
                    break;
                }
                _ => break,
            }
            debug!(cursor, fetched = records.len(), "Income page full, fetching next");
        }

        records.sort_by_key(|r| r.time);
        Ok(records)
    }

    // ==================== Orders ====================

    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<LeverageResponse> {
        let params = [("symbol", symbol.to_string()), ("leverage", leverage.to_string())];
        self.signed(Method::POST, "/fapi/v1/leverage", &params).await
    }

    /// Market order. `reduce_only` prevents it from flipping the position.
    pub async fn market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        reduce_only: bool,
    ) -> Result<OrderResponse> {
        let quantity = self.round_quantity(symbol, quantity).await?;
        if quantity <= Decimal::ZERO {
            anyhow::bail!("Order quantity rounds to zero for {}", symbol);
        }

        let mut params = vec![
            ("symbol", symbol.to_string()),
            ("side", side.as_str().to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", quantity.normalize().to_string()),
            ("newClientOrderId", client_order_id()),
            ("newOrderRespType", "RESULT".to_string()),
        ];
        if reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        let order: OrderResponse = self.signed(Method::POST, "/fapi/v1/order", &params).await?;
        info!(
            symbol = %symbol,
            side = %side.as_str(),
            quantity = %quantity,
            order_id = order.order_id,
            avg_price = %order.avg_price,
            "Market order placed"
        );
        Ok(order)
    }

    /// Conditional order that closes the whole position when `stop_price` is hit.
    pub async fn protective_order(
        &self,
        symbol: &str,
        side: OrderSide,
        kind: ProtectiveKind,
        stop_price: Decimal,
    ) -> Result<OrderResponse> {
        let params = [
            ("symbol", symbol.to_string()),
            ("side", side.as_str().to_string()),
            ("type", kind.as_str().to_string()),
            ("stopPrice", stop_price.normalize().to_string()),
            ("closePosition", "true".to_string()),
            ("workingType", "MARK_PRICE".to_string()),
            ("newClientOrderId", client_order_id()),
        ];
        self.signed(Method::POST, "/fapi/v1/order", &params).await
    }

    /// Orders still resting on the book for `symbol`.
    pub async fn open_orders(&self, symbol: &str) -> Result<Vec<RestingOrder>> {
        let params = [("symbol", symbol.to_string())];
        self.signed(Method::GET, "/fapi/v1/openOrders", &params).await
    }

    pub async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<()> {
        let params = [("symbol", symbol.to_string()), ("orderId", order_id.to_string())];
        let _: serde_json::Value = self.signed(Method::DELETE, "/fapi/v1/order", &params).await?;
        Ok(())
    }

    pub async fn cancel_all_open_orders(&self, symbol: &str) -> Result<()> {
        let params = [("symbol", symbol.to_string())];
        let _: serde_json::Value = self.signed(Method::DELETE, "/fapi/v1/allOpenOrders", &params).await?;
        Ok(())
    }

    // ==================== Helpers ====================

    /// Round `quantity` down to the symbol's lot step.
    async fn round_quantity(&self, symbol: &str, quantity: Decimal) -> Result<Decimal> {
        let cached = self.lot_steps.read().await.get(symbol).copied();
        let step = match cached {
            Some(step) => step,
            None => {
                let step = self.fetch_lot_step(symbol).await?;
                self.lot_steps.write().await.insert(symbol.to_string(), step);
                step
            }
        };
        Ok(round_to_step(quantity, step))
    }

    async fn fetch_lot_step(&self, symbol: &str) -> Result<Decimal> {
        let url = format!("{}/fapi/v1/exchangeInfo", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to fetch exchange info")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Exchange info request failed: {} - {}", status, body);
        }

        let info: ExchangeInfo = response.json().await.context("Failed to parse exchange info")?;
        info.symbols
            .iter()
            .find(|s| s.symbol == symbol)
            .and_then(SymbolInfo::lot_step)
            .ok_or_else(|| anyhow::anyhow!("No lot size for {}", symbol))
    }
}

/// Round down to a multiple of `step`.
pub fn round_to_step(quantity: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return quantity;
    }
    ((quantity / step).round_dp_with_strategy(0, RoundingStrategy::ToZero) * step).normalize()
}

fn client_order_id() -> String {
    format!("futsim-{}", uuid::Uuid::new_v4().simple())
        .chars()
        .take(36)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_sign_query_known_vector() {
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            sign_query(secret, query).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn test_round_to_step() {
        assert_eq!(round_to_step(dec!(0.123456), dec!(0.001)), dec!(0.123));
        assert_eq!(round_to_step(dec!(12.9), dec!(1)), dec!(12));
        assert_eq!(round_to_step(dec!(0.0004), dec!(0.001)), dec!(0));
        assert_eq!(client_order_id().len(), 36);
    }

    #[test]
    fn test_requires_credentials() {
        assert!(ExchangeClient::new("http://localhost", "", "secret").is_err());
    }

    #[tokio::test]
    async fn test_market_order_signed_and_rounded() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/fapi/v1/exchangeInfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "symbols": [{"symbol": "BTCUSDT", "filters": [
                    {"filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001"}
                ]}]
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .and(path("/fapi/v1/order"))
            .and(header("X-MBX-APIKEY", "key"))
            .and(query_param("quantity", "0.123"))
            .and(query_param("reduceOnly", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "orderId": 42, "symbol": "BTCUSDT", "status": "FILLED",
                "clientOrderId": "abc", "avgPrice": "60000.0", "executedQty": "0.123",
                "origQty": "0.123", "side": "SELL", "type": "MARKET", "reduceOnly": true
            })))
            .mount(&mock_server)
            .await;

        let client = ExchangeClient::new(&mock_server.uri(), "key", "secret").unwrap();
        let order = client
            .market_order("BTCUSDT", OrderSide::Sell, dec!(0.12345), true)
            .await
            .unwrap();
        assert_eq!(order.order_id, 42);
        assert_eq!(order.avg_price, dec!(60000));

        // Lot step is cached
        client
            .market_order("BTCUSDT", OrderSide::Sell, dec!(0.1234), true)
            .await
            .unwrap();

        let requests = mock_server.received_requests().await.unwrap();
        let order_req = requests.iter().find(|r| r.url.path() == "/fapi/v1/order").unwrap();
        let query = order_req.url.query().unwrap();
        let (unsigned, signature) = query.rsplit_once("&signature=").unwrap();
        assert_eq!(signature, sign_query("secret", unsigned).unwrap());
    }

    #[tokio::test]
    async fn test_error_body_surfaces_code() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/fapi/v2/account"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "code": -2015, "msg": "Invalid API-key, IP, or permissions for action."
            })))
            .mount(&mock_server)
            .await;

        let client = ExchangeClient::new(&mock_server.uri(), "key", "secret").unwrap();
        let err = client.account().await.unwrap_err().to_string();
        assert!(err.contains("-2015"), "{}", err);
    }

    #[tokio::test]
    async fn test_position_risk_drops_flat_rows() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/fapi/v2/positionRisk"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"symbol": "BTCUSDT", "positionAmt": "0.010", "entryPrice": "60000",
                 "markPrice": "61000", "unRealizedProfit": "10", "leverage": "10"},
                {"symbol": "ETHUSDT", "positionAmt": "0", "entryPrice": "0",
                 "markPrice": "3000", "unRealizedProfit": "0", "leverage": "20"}
            ])))
            .mount(&mock_server)
            .await;

        let client = ExchangeClient::new(&mock_server.uri(), "key", "secret").unwrap();
        let risks = client.position_risk(None).await.unwrap();
        assert_eq!(risks.len(), 1);
        assert_eq!(risks[0].symbol, "BTCUSDT");
    }

    #[tokio::test]
    async fn test_income_sorted_oldest_first() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/fapi/v1/income"))
            .and(query_param("incomeType", "REALIZED_PNL"))
            .and(query_param("startTime", "1000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"symbol": "BTCUSDT", "incomeType": "REALIZED_PNL", "income": "-3.5", "asset": "USDT", "time": 3000, "tranId": 2},
                {"symbol": "BTCUSDT", "incomeType": "REALIZED_PNL", "income": "12.0", "asset": "USDT", "time": 2000, "tranId": 1}
            ])))
            .mount(&mock_server)
            .await;

        let client = ExchangeClient::new(&mock_server.uri(), "key", "secret").unwrap();
        let records = client.realized_pnl_since(1000).await.unwrap();
        assert_eq!(records.iter().map(|r| r.time).collect::<Vec<_>>(), vec![2000, 3000]);
        assert_eq!(records[1].income, dec!(-3.5));
    }

    #[tokio::test]
    async fn test_income_pages_past_shared_millisecond() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/fapi/v1/income"))
            .and(query_param("startTime", "1000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"symbol": "BTCUSDT", "incomeType": "REALIZED_PNL", "income": "1", "time": 1500, "tranId": 1},
                {"symbol": "BTCUSDT", "incomeType": "REALIZED_PNL", "income": "2", "time": 2000, "tranId": 2}
            ])))
            .expect(1)
            .mount(&mock_server)
            .await;

        // Same millisecond as the end of the first page
        Mock::given(method("GET"))
            .and(path("/fapi/v1/income"))
            .and(query_param("startTime", "2000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"symbol": "BTCUSDT", "incomeType": "REALIZED_PNL", "income": "2", "time": 2000, "tranId": 2},
                {"symbol": "ETHUSDT", "incomeType": "REALIZED_PNL", "income": "-4", "time": 2000, "tranId": 3}
            ])))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = ExchangeClient::new(&mock_server.uri(), "key", "secret")
            .unwrap()
            .with_income_page_limit(2);
        let records = client.realized_pnl_since(1000).await.unwrap();

        assert_eq!(records.iter().map(|r| r.tran_id).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(records.iter().map(|r| r.income).sum::<Decimal>(), dec!(-1));
    }

    #[tokio::test]
    async fn test_income_stops_on_repeated_full_page() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/fapi/v1/income"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"symbol": "BTCUSDT", "incomeType": "REALIZED_PNL", "income": "1", "time": 2000, "tranId": 8}
            ])))
            .expect(2)
            .mount(&mock_server)
            .await;

        let client = ExchangeClient::new(&mock_server.uri(), "key", "secret")
            .unwrap()
            .with_income_page_limit(1);
        let records = tokio_test::assert_ok!(client.realized_pnl_since(1000).await);
        assert_eq!(records.len(), 1);
    }
}
