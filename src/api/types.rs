//! API response types for the futures REST endpoints.
//!
//! Numeric fields arrive as JSON strings; `rust_decimal` accepts both.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Entry from /fapi/v1/ticker/price.
#[derive(Debug, Clone, Deserialize)]
pub struct TickerPrice {
    pub symbol: String,
    pub price: Decimal,
    #[serde(default)]
    pub time: i64,
}

/// Error body returned on non-2xx responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiError {
    pub code: i64,
    pub msg: String,
}

/// Account snapshot from /fapi/v2/account.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    #[serde(default)]
    pub total_wallet_balance: Decimal,
    #[serde(default)]
    pub total_unrealized_profit: Decimal,
    #[serde(default)]
    pub total_margin_balance: Decimal,
    #[serde(default)]
    pub total_initial_margin: Decimal,
    #[serde(default)]
    pub available_balance: Decimal,
    #[serde(default)]
    pub can_trade: bool,
}

/// Entry from /fapi/v2/positionRisk.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRisk {
    pub symbol: String,
    /// Signed: positive long, negative short, zero flat
    pub position_amt: Decimal,
    pub entry_price: Decimal,
    #[serde(default)]
    pub mark_price: Decimal,
    #[serde(default, rename = "unRealizedProfit")]
    pub unrealized_profit: Decimal,
    #[serde(default)]
    pub liquidation_price: Decimal,
    pub leverage: Decimal,
    #[serde(default)]
    pub isolated_margin: Decimal,
    #[serde(default)]
    pub margin_type: String,
    #[serde(default)]
    pub position_side: String,
    #[serde(default)]
    pub update_time: i64,
}

impl PositionRisk {
    pub fn is_flat(&self) -> bool {
        self.position_amt.is_zero()
    }
}

/// Order acknowledgement from /fapi/v1/order.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub order_id: i64,
    pub symbol: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub client_order_id: String,
    #[serde(default)]
    pub avg_price: Decimal,
    #[serde(default)]
    pub executed_qty: Decimal,
    #[serde(default)]
    pub orig_qty: Decimal,
    #[serde(default)]
    pub side: String,
    #[serde(default, rename = "type")]
    pub order_type: String,
    #[serde(default)]
    pub stop_price: Decimal,
    #[serde(default)]
    pub reduce_only: bool,
}

/// Resting order from /fapi/v1/openOrders.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestingOrder {
    pub order_id: i64,
    pub symbol: String,
    #[serde(rename = "type")]
    pub order_type: String,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub stop_price: Decimal,
    #[serde(default)]
    pub close_position: bool,
}

impl RestingOrder {
    pub fn is_kind(&self, kind: ProtectiveKind) -> bool {
        self.order_type == kind.as_str()
    }
}

/// Response from /fapi/v1/leverage.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeverageResponse {
    pub leverage: u32,
    pub symbol: String,
    #[serde(default)]
    pub max_notional_value: Decimal,
}

/// Entry from /fapi/v1/income.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomeRecord {
    #[serde(default)]
    pub symbol: String,
    pub income_type: String,
    pub income: Decimal,
    #[serde(default)]
    pub asset: String,
    pub time: i64,
    #[serde(default)]
    pub tran_id: i64,
}

/// Subset of /fapi/v1/exchangeInfo used for quantity rounding.
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeInfo {
    pub symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    #[serde(default)]
    pub filters: Vec<serde_json::Value>,
}

impl SymbolInfo {
    /// `stepSize` of the LOT_SIZE filter.
    pub fn lot_step(&self) -> Option<Decimal> {
        self.filters
            .iter()
            .find(|f| f.get("filterType").and_then(|t| t.as_str()) == Some("LOT_SIZE"))
            .and_then(|f| f.get("stepSize"))
            .and_then(|s| s.as_str())
            .and_then(|s| s.parse().ok())
    }
}

/// Order side on the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

/// Protective conditional order kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectiveKind {
    StopMarket,
    TakeProfitMarket,
}

impl ProtectiveKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtectiveKind::StopMarket => "STOP_MARKET",
            ProtectiveKind::TakeProfitMarket => "TAKE_PROFIT_MARKET",
        }
    }
}
