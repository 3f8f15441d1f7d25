//! Position ledger: the only writer of wallets, positions and orders.
//!
//! Every settlement follows the same shape: read the position with its
//! version, compute the cash movement in memory, then apply it through one
//! transaction that starts with a compare-and-swap on `(status, version)`.
//! Wallet cash moves as relative increments, so the scheduler and an
//! on-demand request can interleave freely. A close that loses the race
//! re-reads; if the position went terminal meanwhile it reports
//! `AlreadyClosed` and credits nothing.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info, warn};

use crate::db::{Database, NewPosition, Settlement};
use crate::error::{EngineError, EngineResult};
use crate::models::{
    CloseReason, Direction, Order, Position, PositionStatus, Wallet, WalletSummary,
};
use crate::trading::EngineConfig;

const MAX_SETTLE_ATTEMPTS: usize = 5;

/// Request to open a new position.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub user_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub margin: Decimal,
    pub leverage: u32,
    pub entry_price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

/// Result of a successful close or partial close.
#[derive(Debug, Clone)]
pub struct CloseOutcome {
    /// Position state after settlement
    pub position: Position,
    pub closed_quantity: Decimal,
    pub released_margin: Decimal,
    /// Net of fee, capped at the released margin
    pub realized_pnl: Decimal,
    pub fee: Decimal,
    /// Cash returned to the wallet (released margin + realized P&L)
    pub wallet_credit: Decimal,
    pub fully_closed: bool,
}

/// Durable ledger of wallets, positions and orders.
#[derive(Clone)]
pub struct PositionLedger {
    db: Database,
    initial_balance: Decimal,
    fee_rate: Decimal,
    max_leverage: u32,
}

impl PositionLedger {
    pub fn new(db: Database, config: &EngineConfig) -> Self {
        Self {
            db,
            initial_balance: config.initial_balance,
            fee_rate: config.fee_rate,
            max_leverage: config.max_leverage,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    // ==================== Wallets ====================

    /// Create the user's wallet on first reference and return it.
    pub async fn ensure_wallet(&self, user_id: &str) -> EngineResult<Wallet> {
        self.db.ensure_wallet(user_id, self.initial_balance).await?;
        self.db
            .get_wallet(user_id)
            .await?
            .ok_or_else(|| EngineError::InvalidRequest(format!("wallet for {} missing", user_id)))
    }

    pub async fn wallet_summary(&self, user_id: &str) -> EngineResult<WalletSummary> {
        let wallet = self.ensure_wallet(user_id).await?;
        let open = self
            .db
            .get_user_positions(user_id, Some(PositionStatus::Open))
            .await?;

        let margin_in_use: Decimal = open.iter().map(|p| p.margin_in_use()).sum();
        let unrealized_pnl: Decimal = open.iter().map(|p| p.unrealized_pnl).sum();

        Ok(WalletSummary {
            user_id: wallet.user_id.clone(),
            balance: wallet.current_balance,
            margin_in_use: margin_in_use.round_dp(8),
            unrealized_pnl: unrealized_pnl.round_dp(8),
            equity: (wallet.current_balance + margin_in_use + unrealized_pnl).round_dp(8),
            total_pnl: wallet.total_pnl,
            total_trades: wallet.total_trades,
            win_trades: wallet.win_trades,
            win_rate: wallet.win_rate().round_dp(4),
        })
    }

    // ==================== Open ====================

    /// Debit margin and open a position, appending an OPEN_* order.
    pub async fn open(&self, req: OpenRequest) -> EngineResult<Position> {
        self.validate_open(&req)?;
        self.ensure_wallet(&req.user_id).await?;

        let symbol = req.symbol.trim().to_uppercase();
        let notional = req.margin * Decimal::from(req.leverage);
        let quantity = (notional / req.entry_price).round_dp(8);
        let fee = (notional * self.fee_rate).round_dp(8);

        let new = NewPosition {
            user_id: &req.user_id,
            symbol: &symbol,
            direction: req.direction.as_str(),
            leverage: req.leverage,
            margin: req.margin,
            notional_value: notional,
            entry_price: req.entry_price,
            quantity,
            stop_loss: req.stop_loss,
            take_profit: req.take_profit,
            action: req.direction.open_action(),
            fee,
            reason: "open",
        };

        let position_id = match self.db.insert_open_position(&new).await? {
            Some(id) => id,
            None => {
                let available = self
                    .db
                    .get_wallet(&req.user_id)
                    .await?
                    .map(|w| w.current_balance)
                    .unwrap_or(Decimal::ZERO);
                return Err(EngineError::InsufficientFunds {
                    available,
                    required: req.margin + fee,
                });
            }
        };

        info!(
            user = %req.user_id,
            position_id = position_id,
            symbol = %symbol,
            direction = %req.direction,
            margin = %req.margin,
            leverage = req.leverage,
            entry = %req.entry_price,
            "Position opened"
        );

        self.db
            .get_position(position_id)
            .await?
            .ok_or(EngineError::PositionNotFound(position_id))
    }

    fn validate_open(&self, req: &OpenRequest) -> EngineResult<()> {
        if req.user_id.trim().is_empty() {
            return Err(EngineError::InvalidRequest("user id is empty".into()));
        }
        if req.symbol.trim().is_empty() {
            return Err(EngineError::InvalidRequest("symbol is empty".into()));
        }
        if req.margin <= Decimal::ZERO {
            return Err(EngineError::InvalidRequest(format!("margin must be positive, got {}", req.margin)));
        }
        if req.leverage < 1 || req.leverage > self.max_leverage {
            return Err(EngineError::InvalidRequest(format!(
                "leverage must be 1-{}, got {}",
                self.max_leverage, req.leverage
            )));
        }
        if req.entry_price <= Decimal::ZERO {
            return Err(EngineError::InvalidRequest(format!(
                "entry price must be positive, got {}",
                req.entry_price
            )));
        }

        let entry = req.entry_price;
        let (sl_ok, tp_ok) = match req.direction {
            Direction::Long => (
                req.stop_loss.map_or(true, |sl| sl > Decimal::ZERO && sl < entry),
                req.take_profit.map_or(true, |tp| tp > entry),
            ),
            Direction::Short => (
                req.stop_loss.map_or(true, |sl| sl > entry),
                req.take_profit.map_or(true, |tp| tp > Decimal::ZERO && tp < entry),
            ),
        };
        if !sl_ok {
            return Err(EngineError::InvalidRequest(format!(
                "stop loss on wrong side of entry {} for {}",
                entry, req.direction
            )));
        }
        if !tp_ok {
            return Err(EngineError::InvalidRequest(format!(
                "take profit on wrong side of entry {} for {}",
                entry, req.direction
            )));
        }

        Ok(())
    }

    // ==================== Reprice ====================

    /// Write mark price and unrealized P&L. Never changes status.
    pub async fn reprice(&self, position_id: i64, current_price: Decimal) -> EngineResult<()> {
        if current_price <= Decimal::ZERO {
            return Err(EngineError::InvalidRequest(format!("price must be positive, got {}", current_price)));
        }

        if self.db.update_position_price(position_id, current_price).await? {
            return Ok(());
        }

        match self.db.get_position(position_id).await? {
            None => Err(EngineError::PositionNotFound(position_id)),
            Some(_) => Err(EngineError::PositionNotOpen(position_id)),
        }
    }

    // ==================== Close ====================

    /// Close `percent` (0, 100] of the remaining quantity at `close_price`.
    ///
    /// A liquidation always exits the whole position.
    pub async fn close(
        &self,
        position_id: i64,
        close_price: Decimal,
        percent: Decimal,
        reason: CloseReason,
    ) -> EngineResult<CloseOutcome> {
        if percent <= Decimal::ZERO || percent > dec!(100) {
            return Err(EngineError::InvalidRequest(format!("percent must be in (0, 100], got {}", percent)));
        }
        if close_price <= Decimal::ZERO {
            return Err(EngineError::InvalidRequest(format!("close price must be positive, got {}", close_price)));
        }

        for attempt in 1..=MAX_SETTLE_ATTEMPTS {
            let position = self
                .db
                .get_position(position_id)
                .await?
                .ok_or(EngineError::PositionNotFound(position_id))?;

            if position.status.is_terminal() {
                return Err(EngineError::AlreadyClosed(position_id));
            }

            let plan = plan_close(&position, close_price, percent, reason, self.fee_rate)?;
            let settlement = Settlement {
                position_id,
                expected_version: position.version,
                user_id: &position.user_id,
                symbol: &position.symbol,
                close_price,
                close_quantity: plan.close_quantity,
                realized_pnl: plan.realized_pnl,
                fee: plan.fee,
                wallet_credit: plan.wallet_credit,
                unrealized_after: plan.unrealized_after,
                final_status: plan.final_status,
                is_win: position.realized_pnl + plan.realized_pnl > Decimal::ZERO,
                reason,
            };

            if !self.db.settle_close(&settlement).await? {
                debug!(position_id = position_id, attempt = attempt, "Close lost version race, retrying");
                continue;
            }

            let updated = self
                .db
                .get_position(position_id)
                .await?
                .ok_or(EngineError::PositionNotFound(position_id))?;

            info!(
                position_id = position_id,
                symbol = %updated.symbol,
                reason = %reason,
                price = %close_price,
                quantity = %plan.close_quantity,
                pnl = %plan.realized_pnl,
                status = %updated.status,
                "Position settled"
            );

            return Ok(CloseOutcome {
                position: updated,
                closed_quantity: plan.close_quantity,
                released_margin: plan.released_margin,
                realized_pnl: plan.realized_pnl,
                fee: plan.fee,
                wallet_credit: plan.wallet_credit,
                fully_closed: plan.final_status.is_some(),
            });
        }

        warn!(position_id = position_id, "Close abandoned after repeated version conflicts");
        Err(EngineError::Conflict(position_id))
    }

    // ==================== Adjust ====================

    /// Move stop-loss and/or take-profit on an OPEN position.
    pub async fn adjust_stop_loss_take_profit(
        &self,
        position_id: i64,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> EngineResult<Position> {
        if stop_loss.is_none() && take_profit.is_none() {
            return Err(EngineError::InvalidRequest("nothing to adjust".into()));
        }
        if stop_loss.is_some_and(|v| v <= Decimal::ZERO) || take_profit.is_some_and(|v| v <= Decimal::ZERO) {
            return Err(EngineError::InvalidRequest("stop loss / take profit must be positive".into()));
        }

        let position = self
            .db
            .get_position(position_id)
            .await?
            .ok_or(EngineError::PositionNotFound(position_id))?;
        if !position.is_open() {
            return Err(EngineError::PositionNotOpen(position_id));
        }

        let sl = stop_loss.or(position.stop_loss);
        let tp = take_profit.or(position.take_profit);
        if let (Some(sl), Some(tp)) = (sl, tp) {
            let ordered = match position.direction {
                Direction::Long => sl < tp,
                Direction::Short => sl > tp,
            };
            if !ordered {
                return Err(EngineError::InvalidRequest(format!(
                    "stop loss {} and take profit {} are inverted for {}",
                    sl, tp, position.direction
                )));
            }
        }

        if !self
            .db
            .update_stop_loss_take_profit(position_id, stop_loss, take_profit)
            .await?
        {
            return Err(EngineError::PositionNotOpen(position_id));
        }

        info!(
            position_id = position_id,
            stop_loss = ?stop_loss,
            take_profit = ?take_profit,
            "Stop loss / take profit adjusted"
        );

        self.db
            .get_position(position_id)
            .await?
            .ok_or(EngineError::PositionNotFound(position_id))
    }

    // ==================== Queries ====================

    pub async fn get_position(&self, position_id: i64) -> EngineResult<Position> {
        self.db
            .get_position(position_id)
            .await?
            .ok_or(EngineError::PositionNotFound(position_id))
    }

    pub async fn list_positions(
        &self,
        user_id: &str,
        status: Option<PositionStatus>,
    ) -> EngineResult<Vec<Position>> {
        Ok(self.db.get_user_positions(user_id, status).await?)
    }

    /// Every OPEN position across users.
    pub async fn open_positions(&self) -> EngineResult<Vec<Position>> {
        Ok(self.db.get_open_positions().await?)
    }

    /// Open position of `user_id` in `symbol`, newest first.
    pub async fn find_open(&self, user_id: &str, symbol: &str) -> EngineResult<Option<Position>> {
        let symbol = symbol.to_uppercase();
        Ok(self
            .db
            .get_user_positions(user_id, Some(PositionStatus::Open))
            .await?
            .into_iter()
            .find(|p| p.symbol == symbol))
    }

    pub async fn list_orders(&self, user_id: &str, limit: i64) -> EngineResult<Vec<Order>> {
        Ok(self.db.get_orders(user_id, limit).await?)
    }

    /// Audit trail of one position, oldest first.
    pub async fn position_orders(&self, position_id: i64) -> EngineResult<Vec<Order>> {
        self.get_position(position_id).await?;
        Ok(self.db.get_position_orders(position_id).await?)
    }
}

/// Cash movement of one close, computed from a version-stamped read.
#[derive(Debug, Clone, PartialEq)]
struct ClosePlan {
    close_quantity: Decimal,
    released_margin: Decimal,
    realized_pnl: Decimal,
    fee: Decimal,
    wallet_credit: Decimal,
    unrealized_after: Decimal,
    final_status: Option<PositionStatus>,
}

fn plan_close(
    position: &Position,
    close_price: Decimal,
    percent: Decimal,
    reason: CloseReason,
    fee_rate: Decimal,
) -> EngineResult<ClosePlan> {
    let remaining = position.remaining_quantity();
    if remaining.is_zero() {
        return Err(EngineError::AlreadyClosed(position.id));
    }

    let full = percent == dec!(100) || reason == CloseReason::Liquidated;
    let mut close_quantity = if full {
        remaining
    } else {
        (remaining * percent / dec!(100)).round_dp(8)
    };
    if close_quantity.is_zero() {
        return Err(EngineError::InvalidRequest(format!(
            "closing {}% of {} rounds to zero",
            percent, remaining
        )));
    }
    let final_close = full || close_quantity >= remaining;
    if final_close {
        close_quantity = remaining;
    }

    let released_margin = if final_close {
        position.margin_in_use()
    } else {
        position.margin * close_quantity / position.quantity
    }
    .round_dp(8);

    let sign = position.direction.sign();
    let gross = close_quantity * (close_price - position.entry_price) * sign;
    let fee = (close_quantity * close_price * fee_rate).round_dp(8);
    let realized_pnl = (gross - fee).max(-released_margin).round_dp(8);
    let wallet_credit = released_margin + realized_pnl;

    let unrealized_after = if final_close {
        Decimal::ZERO
    } else {
        ((remaining - close_quantity) * (close_price - position.entry_price) * sign).round_dp(8)
    };

    let final_status = final_close.then_some(if reason == CloseReason::Liquidated {
        PositionStatus::Liquidated
    } else {
        PositionStatus::Closed
    });

    Ok(ClosePlan {
        close_quantity,
        released_margin,
        realized_pnl,
        fee,
        wallet_credit,
        unrealized_after,
        final_status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{make_position, OrderAction};
    use futures::future::join_all;
    use tokio_test::{assert_err, assert_ok};

    async fn ledger() -> PositionLedger {
        let db = Database::in_memory().await.unwrap();
        PositionLedger::new(db, &EngineConfig::default())
    }

    fn long(user: &str, symbol: &str, margin: Decimal, leverage: u32, entry: Decimal) -> OpenRequest {
        OpenRequest {
            user_id: user.to_string(),
            symbol: symbol.to_string(),
            direction: Direction::Long,
            margin,
            leverage,
            entry_price: entry,
            stop_loss: None,
            take_profit: None,
        }
    }

    #[tokio::test]
    async fn test_round_trip_long() {
        let ledger = ledger().await;
        let before = ledger.ensure_wallet("admin").await.unwrap().current_balance;

        let pos = ledger
            .open(long("admin", "ETHUSDT", dec!(500), 10, dec!(100)))
            .await
            .unwrap();
        assert_eq!(pos.quantity, dec!(50));
        assert_eq!(pos.notional_value, dec!(5000));
        let after_open = ledger.ensure_wallet("admin").await.unwrap().current_balance;
        assert_eq!(after_open, before - dec!(500));

        let outcome = ledger
            .close(pos.id, dec!(110), dec!(100), CloseReason::Manual)
            .await
            .unwrap();
        assert!(outcome.fully_closed);
        assert_eq!(outcome.realized_pnl, pos.quantity * dec!(10));
        assert_eq!(outcome.wallet_credit, dec!(1000));
        assert_eq!(outcome.position.status, PositionStatus::Closed);
        assert_eq!(outcome.position.close_price, Some(dec!(110)));
        assert_eq!(outcome.position.realized_pnl, dec!(500));
        assert!(outcome.position.closed_at.is_some());

        let wallet = ledger.ensure_wallet("admin").await.unwrap();
        assert_eq!(wallet.current_balance, after_open + dec!(500) + dec!(500));
        assert_eq!(wallet.total_pnl, dec!(500));
        assert_eq!(wallet.total_trades, 1);
        assert_eq!(wallet.win_trades, 1);

        let orders = ledger.database().get_position_orders(pos.id).await.unwrap();
        let actions: Vec<OrderAction> = orders.iter().map(|o| o.action).collect();
        assert_eq!(actions, vec![OrderAction::OpenLong, OrderAction::Close]);
    }

    #[tokio::test]
    async fn test_insufficient_funds() {
        let ledger = ledger().await;
        let err = ledger
            .open(long("admin", "BTCUSDT", dec!(20000), 5, dec!(50000)))
            .await
            .unwrap_err();
        match err {
            EngineError::InsufficientFunds { available, required } => {
                assert_eq!(available, dec!(10000));
                assert_eq!(required, dec!(20000));
            }
            other => panic!("unexpected error: {other}"),
        }

        // Nothing was written
        assert!(ledger.list_positions("admin", None).await.unwrap().is_empty());
        assert_eq!(ledger.ensure_wallet("admin").await.unwrap().current_balance, dec!(10000));
    }

    #[tokio::test]
    async fn test_open_validation() {
        let ledger = ledger().await;
        assert_err!(ledger.open(long("admin", "BTCUSDT", dec!(0), 10, dec!(100))).await);
        assert_err!(ledger.open(long("admin", "BTCUSDT", dec!(10), 0, dec!(100))).await);
        assert_err!(ledger.open(long("admin", "BTCUSDT", dec!(10), 200, dec!(100))).await);

        let mut bad_sl = long("admin", "BTCUSDT", dec!(10), 10, dec!(100));
        bad_sl.stop_loss = Some(dec!(105));
        assert!(matches!(ledger.open(bad_sl).await, Err(EngineError::InvalidRequest(_))));

        let mut short = long("admin", "BTCUSDT", dec!(10), 10, dec!(100));
        short.direction = Direction::Short;
        short.stop_loss = Some(dec!(105));
        short.take_profit = Some(dec!(90));
        assert_ok!(ledger.open(short).await);
    }

    #[tokio::test]
    async fn test_concurrent_close_credits_once() {
        let ledger = ledger().await;
        let pos = ledger
            .open(long("admin", "BTCUSDT", dec!(1000), 10, dec!(50000)))
            .await
            .unwrap();
        let before = ledger.ensure_wallet("admin").await.unwrap().current_balance;

        let results = join_all(
            (0..8).map(|_| ledger.close(pos.id, dec!(51000), dec!(100), CloseReason::Manual)),
        )
        .await;

        let successes: Vec<&CloseOutcome> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(successes.len(), 1);
        assert!(successes[0].wallet_credit > Decimal::ZERO);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, EngineError::AlreadyClosed(_))));

        let wallet = ledger.ensure_wallet("admin").await.unwrap();
        assert_eq!(wallet.current_balance, before + dec!(1200));
        assert_eq!(wallet.total_trades, 1);
    }

    #[tokio::test]
    async fn test_close_after_close_is_already_closed() {
        let ledger = ledger().await;
        let pos = ledger
            .open(long("admin", "BTCUSDT", dec!(100), 2, dec!(100)))
            .await
            .unwrap();
        ledger.close(pos.id, dec!(100), dec!(100), CloseReason::Manual).await.unwrap();

        let second = ledger.close(pos.id, dec!(120), dec!(100), CloseReason::Manual).await;
        assert!(matches!(second, Err(EngineError::AlreadyClosed(id)) if id == pos.id));
        assert!(matches!(
            ledger.close(999, dec!(1), dec!(100), CloseReason::Manual).await,
            Err(EngineError::PositionNotFound(999))
        ));
    }

    #[tokio::test]
    async fn test_partial_closes_never_overdraw_quantity() {
        let ledger = ledger().await;
        let pos = ledger
            .open(long("admin", "SOLUSDT", dec!(300), 3, dec!(90)))
            .await
            .unwrap();

        for percent in [dec!(50), dec!(33.3), dec!(99.99), dec!(75)] {
            let outcome = ledger
                .close(pos.id, dec!(95), percent, CloseReason::Strategy)
                .await
                .unwrap();
            assert!(!outcome.fully_closed);
            assert!(outcome.position.remaining_quantity() > Decimal::ZERO);
            assert!(outcome.position.closed_quantity <= outcome.position.quantity);
            assert_eq!(outcome.position.status, PositionStatus::Open);
        }

        let last = ledger
            .close(pos.id, dec!(95), dec!(100), CloseReason::Strategy)
            .await
            .unwrap();
        assert!(last.fully_closed);
        assert_eq!(last.position.remaining_quantity(), Decimal::ZERO);
        assert_eq!(last.position.closed_quantity, last.position.quantity);

        // Realized: 10 qty × 5 = 50 over all exits, margin fully returned
        let wallet = ledger.ensure_wallet("admin").await.unwrap();
        assert_eq!(wallet.current_balance.round_dp(4), dec!(10050));
        assert_eq!(wallet.total_trades, 1);
        assert_eq!(wallet.win_trades, 1);

        let orders = ledger.database().get_position_orders(pos.id).await.unwrap();
        assert_eq!(
            orders.iter().filter(|o| o.action == OrderAction::PartialClose).count(),
            4
        );
    }

    #[tokio::test]
    async fn test_invalid_percent_rejected() {
        let ledger = ledger().await;
        let pos = ledger
            .open(long("admin", "BTCUSDT", dec!(100), 2, dec!(100)))
            .await
            .unwrap();
        for bad in [dec!(0), dec!(-5), dec!(100.01)] {
            assert!(matches!(
                ledger.close(pos.id, dec!(100), bad, CloseReason::Manual).await,
                Err(EngineError::InvalidRequest(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_liquidation_loses_exactly_margin() {
        let ledger = ledger().await;
        let pos = ledger
            .open(long("admin", "BTCUSDT", dec!(1000), 10, dec!(50000)))
            .await
            .unwrap();

        // Gap well past the liquidation price
        let outcome = ledger
            .close(pos.id, dec!(40000), dec!(25), CloseReason::Liquidated)
            .await
            .unwrap();
        assert!(outcome.fully_closed);
        assert_eq!(outcome.realized_pnl, dec!(-1000));
        assert_eq!(outcome.wallet_credit, Decimal::ZERO);
        assert_eq!(outcome.position.status, PositionStatus::Liquidated);
        assert_eq!(outcome.position.close_reason, Some(CloseReason::Liquidated));

        let wallet = ledger.ensure_wallet("admin").await.unwrap();
        assert_eq!(wallet.current_balance, dec!(9000));
        assert_eq!(wallet.total_pnl, dec!(-1000));
        assert_eq!(wallet.win_trades, 0);
    }

    #[tokio::test]
    async fn test_reprice_updates_pnl_only() {
        let ledger = ledger().await;
        let mut req = long("admin", "BTCUSDT", dec!(500), 5, dec!(100));
        req.direction = Direction::Short;
        let pos = ledger.open(req).await.unwrap();

        ledger.reprice(pos.id, dec!(90)).await.unwrap();
        let repriced = ledger.get_position(pos.id).await.unwrap();
        assert_eq!(repriced.current_price, dec!(90));
        assert_eq!(repriced.unrealized_pnl, dec!(250));
        assert_eq!(repriced.status, PositionStatus::Open);

        // Deep loss still leaves status alone
        ledger.reprice(pos.id, dec!(150)).await.unwrap();
        assert_eq!(ledger.get_position(pos.id).await.unwrap().status, PositionStatus::Open);

        ledger.close(pos.id, dec!(100), dec!(100), CloseReason::Manual).await.unwrap();
        assert!(matches!(
            ledger.reprice(pos.id, dec!(95)).await,
            Err(EngineError::PositionNotOpen(_))
        ));
    }

    #[tokio::test]
    async fn test_adjust_requires_open() {
        let ledger = ledger().await;
        let pos = ledger
            .open(long("admin", "BTCUSDT", dec!(100), 10, dec!(100)))
            .await
            .unwrap();

        let adjusted = ledger
            .adjust_stop_loss_take_profit(pos.id, Some(dec!(95)), None)
            .await
            .unwrap();
        assert_eq!(adjusted.stop_loss, Some(dec!(95)));
        assert_eq!(adjusted.take_profit, None);

        let adjusted = ledger
            .adjust_stop_loss_take_profit(pos.id, None, Some(dec!(130)))
            .await
            .unwrap();
        assert_eq!(adjusted.stop_loss, Some(dec!(95)));
        assert_eq!(adjusted.take_profit, Some(dec!(130)));

        assert!(matches!(
            ledger.adjust_stop_loss_take_profit(pos.id, Some(dec!(140)), None).await,
            Err(EngineError::InvalidRequest(_))
        ));

        ledger.close(pos.id, dec!(100), dec!(100), CloseReason::Manual).await.unwrap();
        assert!(matches!(
            ledger.adjust_stop_loss_take_profit(pos.id, Some(dec!(90)), None).await,
            Err(EngineError::PositionNotOpen(_))
        ));
    }

    #[tokio::test]
    async fn test_wallet_summary() {
        let ledger = ledger().await;
        let a = ledger
            .open(long("admin", "BTCUSDT", dec!(1000), 10, dec!(50000)))
            .await
            .unwrap();
        ledger
            .open(long("admin", "ETHUSDT", dec!(500), 5, dec!(2500)))
            .await
            .unwrap();
        ledger.reprice(a.id, dec!(51000)).await.unwrap();

        let summary = ledger.wallet_summary("admin").await.unwrap();
        assert_eq!(summary.balance, dec!(8500));
        assert_eq!(summary.margin_in_use, dec!(1500));
        assert_eq!(summary.unrealized_pnl, dec!(200));
        assert_eq!(summary.equity, dec!(10200));
        assert_eq!(summary.win_rate, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_fees_are_charged() {
        let db = Database::in_memory().await.unwrap();
        let config = EngineConfig {
            fee_rate: dec!(0.001),
            ..EngineConfig::default()
        };
        let ledger = PositionLedger::new(db, &config);

        let pos = ledger
            .open(long("admin", "ETHUSDT", dec!(500), 10, dec!(100)))
            .await
            .unwrap();
        // 5000 notional × 0.1% = 5
        assert_eq!(ledger.ensure_wallet("admin").await.unwrap().current_balance, dec!(9495));

        let outcome = ledger
            .close(pos.id, dec!(100), dec!(100), CloseReason::Manual)
            .await
            .unwrap();
        assert_eq!(outcome.fee, dec!(5));
        assert_eq!(outcome.realized_pnl, dec!(-5));
        assert_eq!(ledger.ensure_wallet("admin").await.unwrap().current_balance, dec!(9990));
    }

    #[test]
    fn test_plan_partial_close() {
        let pos = make_position(Direction::Long, dec!(1000), 10, dec!(100));
        let plan = plan_close(&pos, dec!(110), dec!(25), CloseReason::Manual, Decimal::ZERO).unwrap();
        assert_eq!(plan.close_quantity, dec!(25));
        assert_eq!(plan.released_margin, dec!(250));
        assert_eq!(plan.realized_pnl, dec!(250));
        assert_eq!(plan.wallet_credit, dec!(500));
        assert_eq!(plan.unrealized_after, dec!(750));
        assert_eq!(plan.final_status, None);
    }
}
