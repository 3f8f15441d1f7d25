//! Live gateway: passes trades through to the user's exchange account.
//!
//! Remote positions are translated into the local `Position` shape; remote
//! fills are not mirrored into the ledger. Realized P&L is pulled back
//! periodically into `live_totals` instead.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use tracing::{debug, info};

use crate::api::{ExchangeClient, OrderSide, PositionRisk, ProtectiveKind, QuoteSource};
use crate::db::{to_decimal, Database};
use crate::error::{EngineError, EngineResult};
use crate::models::{CloseReason, Direction, Position, PositionStatus, WalletSummary};

use super::{quote_one, AccountSummary, CloseReport, GatewayVariant, OpenOrder, TradingGateway};

/// Lookback used the first time an account is reconciled.
const INITIAL_SYNC_LOOKBACK_MS: i64 = 24 * 60 * 60 * 1000;

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub user_id: String,
    pub records: usize,
    pub pnl_delta: Decimal,
    pub wins: i64,
    pub synced_ms: i64,
}

pub struct LiveGateway {
    user_id: String,
    db: Database,
    quotes: Arc<dyn QuoteSource>,
    base_url: String,
}

impl LiveGateway {
    pub fn new(user_id: &str, db: Database, quotes: Arc<dyn QuoteSource>, base_url: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            db,
            quotes,
            base_url: base_url.to_string(),
        }
    }

    /// Signed client for this user, or why trading is not possible right now.
    async fn client(&self) -> EngineResult<ExchangeClient> {
        let account = self
            .db
            .get_exchange_account(&self.user_id)
            .await?
            .ok_or_else(|| EngineError::NotConfigured(self.user_id.clone()))?;

        if !account.trading_enabled {
            return Err(EngineError::TradingDisabled(self.user_id.clone()));
        }

        ExchangeClient::new(&self.base_url, &account.api_key, &account.api_secret)
            .map_err(|_| EngineError::NotConfigured(self.user_id.clone()))
    }

    async fn remote_position(&self, client: &ExchangeClient, symbol: &str) -> EngineResult<PositionRisk> {
        client
            .position_risk(Some(symbol))
            .await
            .map_err(remote)?
            .into_iter()
            .find(|r| r.symbol == symbol)
            .ok_or_else(|| EngineError::InvalidRequest(format!("no open {} position", symbol)))
    }

    async fn place_protection(
        &self,
        client: &ExchangeClient,
        symbol: &str,
        direction: Direction,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> EngineResult<()> {
        let exit_side = entry_side(direction).opposite();
        if let Some(sl) = stop_loss {
            client
                .protective_order(symbol, exit_side, ProtectiveKind::StopMarket, sl)
                .await
                .map_err(remote)?;
        }
        if let Some(tp) = take_profit {
            client
                .protective_order(symbol, exit_side, ProtectiveKind::TakeProfitMarket, tp)
                .await
                .map_err(remote)?;
        }
        Ok(())
    }

    /// Pull REALIZED_PNL income since the last cursor into `live_totals`.
    pub async fn reconcile(&self) -> EngineResult<ReconcileReport> {
        let client = self.client().await?;
        let cursor = match self.db.get_live_totals(&self.user_id).await? {
            Some(totals) => totals.last_synced_ms + 1,
            None => Utc::now().timestamp_millis() - INITIAL_SYNC_LOOKBACK_MS,
        };

        let records = client.realized_pnl_since(cursor).await.map_err(remote)?;
        let pnl_delta: Decimal = records.iter().map(|r| r.income).sum();
        let wins = records.iter().filter(|r| r.income > Decimal::ZERO).count() as i64;
        let synced_ms = records.iter().map(|r| r.time).max().unwrap_or(cursor - 1);

        if !records.is_empty() {
            self.db
                .add_live_totals(&self.user_id, pnl_delta, records.len() as i64, wins, synced_ms)
                .await?;
            info!(
                user = %self.user_id,
                records = records.len(),
                pnl = %pnl_delta,
                "Live account reconciled"
            );
        } else {
            debug!(user = %self.user_id, "No new realized P&L");
        }

        Ok(ReconcileReport {
            user_id: self.user_id.clone(),
            records: records.len(),
            pnl_delta,
            wins,
            synced_ms,
        })
    }
}

#[async_trait]
impl TradingGateway for LiveGateway {
    fn variant(&self) -> GatewayVariant {
        GatewayVariant::LiveExchange
    }

    fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn open(&self, order: OpenOrder) -> EngineResult<Position> {
        let client = self.client().await?;
        let symbol = order.symbol.to_uppercase();
        let price = quote_one(self.quotes.as_ref(), &symbol).await?;
        let quantity = order.margin * Decimal::from(order.leverage) / price;

        client.set_leverage(&symbol, order.leverage).await.map_err(remote)?;
        client
            .market_order(&symbol, entry_side(order.direction), quantity, false)
            .await
            .map_err(remote)?;
        self.place_protection(&client, &symbol, order.direction, order.stop_loss, order.take_profit)
            .await?;

        let risk = self.remote_position(&client, &symbol).await?;
        let mut position = translate_position(&self.user_id, &risk);
        position.stop_loss = order.stop_loss;
        position.take_profit = order.take_profit;
        Ok(position)
    }

    async fn close(&self, symbol: &str, percent: Decimal, reason: CloseReason) -> EngineResult<CloseReport> {
        if percent <= Decimal::ZERO || percent > dec!(100) {
            return Err(EngineError::InvalidRequest(format!("percent must be in (0, 100], got {}", percent)));
        }

        let client = self.client().await?;
        let symbol = symbol.to_uppercase();
        let risk = self.remote_position(&client, &symbol).await?;
        let position = translate_position(&self.user_id, &risk);
        let fully_closed = percent == dec!(100);
        let quantity = position.quantity * percent / dec!(100);

        let order = client
            .market_order(&symbol, entry_side(position.direction).opposite(), quantity, true)
            .await
            .map_err(remote)?;
        if fully_closed {
            client.cancel_all_open_orders(&symbol).await.map_err(remote)?;
        }

        let price = if order.avg_price > Decimal::ZERO { order.avg_price } else { risk.mark_price };
        let closed_quantity = if order.executed_qty > Decimal::ZERO { order.executed_qty } else { quantity };
        let realized_pnl = closed_quantity * (price - position.entry_price) * position.direction.sign();

        info!(
            user = %self.user_id,
            symbol = %symbol,
            reason = %reason,
            quantity = %closed_quantity,
            price = %price,
            "Live position closed"
        );

        Ok(CloseReport {
            symbol,
            closed_quantity,
            price,
            realized_pnl,
            fully_closed,
        })
    }

    /// Replaces the resting protective order of each side given. The omitted
    /// side keeps its current order.
    async fn adjust_stop_loss(
        &self,
        symbol: &str,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> EngineResult<()> {
        if stop_loss.is_none() && take_profit.is_none() {
            return Err(EngineError::InvalidRequest("nothing to adjust".into()));
        }

        let client = self.client().await?;
        let symbol = symbol.to_uppercase();
        let risk = self.remote_position(&client, &symbol).await?;
        let exit_side = entry_side(direction_of(&risk)).opposite();
        let resting = client.open_orders(&symbol).await.map_err(remote)?;

        let changes = [
            (ProtectiveKind::StopMarket, stop_loss),
            (ProtectiveKind::TakeProfitMarket, take_profit),
        ];
        for (kind, price) in changes {
            let Some(price) = price else { continue };
            for order in resting.iter().filter(|o| o.is_kind(kind)) {
                client.cancel_order(&symbol, order.order_id).await.map_err(remote)?;
            }
            client
                .protective_order(&symbol, exit_side, kind, price)
                .await
                .map_err(remote)?;
            debug!(user = %self.user_id, symbol = %symbol, kind = kind.as_str(), price = %price, "Protective order replaced");
        }
        Ok(())
    }

    async fn summarize(&self) -> EngineResult<AccountSummary> {
        let client = self.client().await?;
        let account = client.account().await.map_err(remote)?;
        let positions: Vec<Position> = client
            .position_risk(None)
            .await
            .map_err(remote)?
            .iter()
            .map(|r| translate_position(&self.user_id, r))
            .collect();

        let totals = self.db.get_live_totals(&self.user_id).await?;
        let (total_pnl, total_trades, win_trades) = totals
            .map(|t| (to_decimal(t.total_pnl), t.total_trades, t.win_trades))
            .unwrap_or((Decimal::ZERO, 0, 0));
        let win_rate = if total_trades > 0 {
            (Decimal::from(win_trades) / Decimal::from(total_trades)).round_dp(4)
        } else {
            Decimal::ZERO
        };

        Ok(AccountSummary {
            variant: GatewayVariant::LiveExchange,
            wallet: WalletSummary {
                user_id: self.user_id.clone(),
                balance: account.available_balance,
                margin_in_use: account.total_initial_margin,
                unrealized_pnl: account.total_unrealized_profit,
                equity: account.total_margin_balance,
                total_pnl,
                total_trades,
                win_trades,
                win_rate,
            },
            positions,
        })
    }
}

fn remote(err: anyhow::Error) -> EngineError {
    EngineError::RemoteGateway(format!("{:#}", err))
}

fn entry_side(direction: Direction) -> OrderSide {
    match direction {
        Direction::Long => OrderSide::Buy,
        Direction::Short => OrderSide::Sell,
    }
}

fn direction_of(risk: &PositionRisk) -> Direction {
    if risk.position_amt < Decimal::ZERO {
        Direction::Short
    } else {
        Direction::Long
    }
}

/// Express a remote position in the local shape. Remote positions carry id 0.
fn translate_position(user_id: &str, risk: &PositionRisk) -> Position {
    let direction = direction_of(risk);
    let quantity = risk.position_amt.abs();
    let leverage = risk.leverage.to_u32().unwrap_or(1).max(1);
    let notional_value = quantity * risk.entry_price;
    let margin = if risk.isolated_margin > Decimal::ZERO {
        risk.isolated_margin
    } else {
        (notional_value / Decimal::from(leverage)).round_dp(8)
    };
    let opened_at = Utc
        .timestamp_millis_opt(risk.update_time)
        .single()
        .unwrap_or_else(Utc::now);

    Position {
        id: 0,
        user_id: user_id.to_string(),
        symbol: risk.symbol.clone(),
        direction,
        leverage,
        margin,
        notional_value,
        entry_price: risk.entry_price,
        quantity,
        stop_loss: None,
        take_profit: None,
        current_price: risk.mark_price,
        unrealized_pnl: risk.unrealized_profit,
        closed_quantity: Decimal::ZERO,
        realized_pnl: Decimal::ZERO,
        status: PositionStatus::Open,
        close_reason: None,
        close_price: None,
        opened_at,
        closed_at: None,
        version: 0,
    }
}
