//! Virtual gateway: settles straight into the user's simulated wallet.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::api::QuoteSource;
use crate::error::{EngineError, EngineResult};
use crate::models::{CloseReason, Position, PositionStatus};
use crate::trading::{OpenRequest, PositionLedger};

use super::{quote_one, AccountSummary, CloseReport, GatewayVariant, OpenOrder, TradingGateway};

pub struct VirtualGateway {
    user_id: String,
    ledger: PositionLedger,
    quotes: Arc<dyn QuoteSource>,
}

impl VirtualGateway {
    pub fn new(user_id: &str, ledger: PositionLedger, quotes: Arc<dyn QuoteSource>) -> Self {
        Self {
            user_id: user_id.to_string(),
            ledger,
            quotes,
        }
    }

    async fn open_position(&self, symbol: &str) -> EngineResult<Position> {
        self.ledger
            .find_open(&self.user_id, symbol)
            .await?
            .ok_or_else(|| EngineError::InvalidRequest(format!("no open {} position", symbol.to_uppercase())))
    }
}

#[async_trait]
impl TradingGateway for VirtualGateway {
    fn variant(&self) -> GatewayVariant {
        GatewayVariant::Virtual
    }

    fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn open(&self, order: OpenOrder) -> EngineResult<Position> {
        let entry_price = quote_one(self.quotes.as_ref(), &order.symbol).await?;
        self.ledger
            .open(OpenRequest {
                user_id: self.user_id.clone(),
                symbol: order.symbol,
                direction: order.direction,
                margin: order.margin,
                leverage: order.leverage,
                entry_price,
                stop_loss: order.stop_loss,
                take_profit: order.take_profit,
            })
            .await
    }

    async fn close(&self, symbol: &str, percent: Decimal, reason: CloseReason) -> EngineResult<CloseReport> {
        let position = self.open_position(symbol).await?;
        let price = quote_one(self.quotes.as_ref(), &position.symbol).await?;
        let outcome = self.ledger.close(position.id, price, percent, reason).await?;

        Ok(CloseReport {
            symbol: position.symbol,
            closed_quantity: outcome.closed_quantity,
            price,
            realized_pnl: outcome.realized_pnl,
            fully_closed: outcome.fully_closed,
        })
    }

    async fn adjust_stop_loss(
        &self,
        symbol: &str,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> EngineResult<()> {
        let position = self.open_position(symbol).await?;
        self.ledger
            .adjust_stop_loss_take_profit(position.id, stop_loss, take_profit)
            .await?;
        Ok(())
    }

    async fn summarize(&self) -> EngineResult<AccountSummary> {
        let wallet = self.ledger.wallet_summary(&self.user_id).await?;
        let positions = self
            .ledger
            .list_positions(&self.user_id, Some(PositionStatus::Open))
            .await?;

        Ok(AccountSummary {
            variant: GatewayVariant::Virtual,
            wallet,
            positions,
        })
    }
}
