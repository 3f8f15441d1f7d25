//! Trading gateway: one interface over the simulated ledger and a live account.
//!
//! The variant is chosen once per user from the `exchange_accounts` row and
//! cached. Callers never branch on it.

mod live;
mod simulated;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::api::QuoteSource;
use crate::db::Database;
use crate::error::{EngineError, EngineResult};
use crate::models::{CloseReason, Direction, Position, WalletSummary};
use crate::trading::PositionLedger;

pub use live::{LiveGateway, ReconcileReport};
pub use simulated::VirtualGateway;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GatewayVariant {
    Virtual,
    LiveExchange,
}

impl fmt::Display for GatewayVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayVariant::Virtual => f.write_str("virtual"),
            GatewayVariant::LiveExchange => f.write_str("live"),
        }
    }
}

/// Open instruction. The gateway prices the entry itself.
#[derive(Debug, Clone)]
pub struct OpenOrder {
    pub symbol: String,
    pub direction: Direction,
    pub margin: Decimal,
    pub leverage: u32,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

/// What a close did, in the same shape for both variants.
#[derive(Debug, Clone, Serialize)]
pub struct CloseReport {
    pub symbol: String,
    pub closed_quantity: Decimal,
    pub price: Decimal,
    pub realized_pnl: Decimal,
    pub fully_closed: bool,
}

/// Account snapshot in the same shape for both variants.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSummary {
    pub variant: GatewayVariant,
    pub wallet: WalletSummary,
    pub positions: Vec<Position>,
}

/// Open / close / adjust / summarize for one user's account.
#[async_trait]
pub trait TradingGateway: Send + Sync {
    fn variant(&self) -> GatewayVariant;

    fn user_id(&self) -> &str;

    async fn open(&self, order: OpenOrder) -> EngineResult<Position>;

    /// Close `percent` of the user's position in `symbol`.
    async fn close(&self, symbol: &str, percent: Decimal, reason: CloseReason) -> EngineResult<CloseReport>;

    /// Move stop-loss and/or take-profit on the user's position in `symbol`.
    async fn adjust_stop_loss(
        &self,
        symbol: &str,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> EngineResult<()>;

    async fn summarize(&self) -> EngineResult<AccountSummary>;
}

/// Builds and caches the gateway for each user.
pub struct GatewayFactory {
    db: Database,
    ledger: PositionLedger,
    quotes: Arc<dyn QuoteSource>,
    exchange_base_url: String,
    gateways: Mutex<HashMap<String, Arc<dyn TradingGateway>>>,
}

impl GatewayFactory {
    pub fn new(ledger: PositionLedger, quotes: Arc<dyn QuoteSource>, exchange_base_url: &str) -> Self {
        Self {
            db: ledger.database().clone(),
            ledger,
            quotes,
            exchange_base_url: exchange_base_url.to_string(),
            gateways: Mutex::new(HashMap::new()),
        }
    }

    /// Gateway for `user_id`, selected on first use.
    pub async fn for_user(&self, user_id: &str) -> EngineResult<Arc<dyn TradingGateway>> {
        let mut gateways = self.gateways.lock().await;
        if let Some(gateway) = gateways.get(user_id) {
            return Ok(gateway.clone());
        }

        let gateway = self.build(user_id).await?;
        info!(user = %user_id, variant = %gateway.variant(), "Gateway selected");
        gateways.insert(user_id.to_string(), gateway.clone());
        Ok(gateway)
    }

    /// Drop the cached selection after the user's account settings change.
    pub async fn invalidate(&self, user_id: &str) {
        self.gateways.lock().await.remove(user_id);
    }

    async fn build(&self, user_id: &str) -> EngineResult<Arc<dyn TradingGateway>> {
        match self.db.get_exchange_account(user_id).await? {
            Some(account) if account.live_mode => Ok(Arc::new(LiveGateway::new(
                user_id,
                self.db.clone(),
                self.quotes.clone(),
                &self.exchange_base_url,
            ))),
            _ => Ok(Arc::new(VirtualGateway::new(
                user_id,
                self.ledger.clone(),
                self.quotes.clone(),
            ))),
        }
    }

    /// Fold remote realized P&L into `live_totals` for every enabled live user.
    pub async fn reconcile_all(&self) -> EngineResult<Vec<ReconcileReport>> {
        let mut reports = Vec::new();
        for user_id in self.db.get_live_users().await? {
            let gateway = LiveGateway::new(&user_id, self.db.clone(), self.quotes.clone(), &self.exchange_base_url);
            match gateway.reconcile().await {
                Ok(report) => reports.push(report),
                Err(e) => warn!(user = %user_id, error = %e, category = e.category(), "Reconciliation failed"),
            }
        }
        Ok(reports)
    }
}

/// Price for one symbol or `QuoteUnavailable`.
async fn quote_one(quotes: &dyn QuoteSource, symbol: &str) -> EngineResult<Decimal> {
    let symbol = symbol.to_uppercase();
    quotes
        .batch_price(std::slice::from_ref(&symbol))
        .await?
        .get(&symbol)
        .copied()
        .ok_or_else(|| EngineError::QuoteUnavailable(format!("no price for {}", symbol)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::StaticQuotes;
    use crate::trading::EngineConfig;

    #[tokio::test]
    async fn test_factory_selects_variant_once() {
        let db = Database::in_memory().await.unwrap();
        let ledger = PositionLedger::new(db.clone(), &EngineConfig::default());
        let factory = GatewayFactory::new(ledger, Arc::new(StaticQuotes::default()), "http://127.0.0.1:9");

        db.save_exchange_account("bob", "key", "secret", true, true).await.unwrap();

        let alice = factory.for_user("alice").await.unwrap();
        assert_eq!(alice.variant(), GatewayVariant::Virtual);
        let bob = factory.for_user("bob").await.unwrap();
        assert_eq!(bob.variant(), GatewayVariant::LiveExchange);
        assert_eq!(bob.user_id(), "bob");

        // Cached until invalidated
        db.save_exchange_account("alice", "key", "secret", true, true).await.unwrap();
        assert_eq!(factory.for_user("alice").await.unwrap().variant(), GatewayVariant::Virtual);
        factory.invalidate("alice").await;
        assert_eq!(factory.for_user("alice").await.unwrap().variant(), GatewayVariant::LiveExchange);
    }

    #[tokio::test]
    async fn test_quote_one_missing_symbol() {
        let quotes = StaticQuotes::default();
        quotes.set("BTCUSDT", rust_decimal_macros::dec!(60000));
        assert!(quote_one(&quotes, "btcusdt").await.is_ok());
        assert!(matches!(
            quote_one(&quotes, "ETHUSDT").await,
            Err(EngineError::QuoteUnavailable(_))
        ));
    }
}
