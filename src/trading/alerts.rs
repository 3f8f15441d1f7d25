//! Price alert monitor.
//!
//! Alerts fire at most once: the pending → triggered transition is a single
//! conditional update, so two ticks evaluating the same snapshot cannot both
//! claim the same alert.

use std::collections::{BTreeSet, HashMap};

use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::db::Database;
use crate::error::{EngineError, EngineResult};
use crate::models::{AlertCondition, AlertStatus, PriceAlert};

#[derive(Clone)]
pub struct AlertMonitor {
    db: Database,
}

impl AlertMonitor {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create_alert(
        &self,
        user_id: &str,
        symbol: &str,
        trigger_price: Decimal,
        condition: AlertCondition,
        strategy_context: Option<&str>,
    ) -> EngineResult<PriceAlert> {
        if trigger_price <= Decimal::ZERO {
            return Err(EngineError::InvalidRequest(format!(
                "trigger price must be positive, got {}",
                trigger_price
            )));
        }
        let symbol = symbol.trim().to_uppercase();
        if symbol.is_empty() {
            return Err(EngineError::InvalidRequest("symbol is empty".into()));
        }

        let id = self
            .db
            .insert_alert(user_id, &symbol, trigger_price, condition, strategy_context)
            .await?;

        info!(alert_id = id, symbol = %symbol, condition = %condition, price = %trigger_price, "Alert created");

        self.db.get_alert(id).await?.ok_or(EngineError::AlertNotFound(id))
    }

    /// Cancel a pending alert. Triggered or cancelled alerts are left untouched.
    pub async fn cancel_alert(&self, alert_id: i64) -> EngineResult<()> {
        if self.db.mark_alert_cancelled(alert_id).await? {
            info!(alert_id = alert_id, "Alert cancelled");
            Ok(())
        } else {
            Err(EngineError::AlertNotFound(alert_id))
        }
    }

    pub async fn list_alerts(&self, user_id: &str, status: Option<AlertStatus>) -> EngineResult<Vec<PriceAlert>> {
        Ok(self.db.get_user_alerts(user_id, status).await?)
    }

    /// Symbols with at least one pending alert.
    pub async fn pending_symbols(&self) -> EngineResult<Vec<String>> {
        let symbols: BTreeSet<String> = self
            .db
            .get_pending_alerts()
            .await?
            .into_iter()
            .map(|a| a.symbol)
            .collect();
        Ok(symbols.into_iter().collect())
    }

    /// Trigger every pending alert crossed by `prices` and return the ones this call won.
    pub async fn check_all(&self, prices: &HashMap<String, Decimal>) -> EngineResult<Vec<PriceAlert>> {
        let pending = self.db.get_pending_alerts().await?;
        let mut triggered = Vec::new();

        for alert in pending {
            let Some(price) = prices.get(&alert.symbol).copied() else {
                continue;
            };
            if !alert.is_crossed(price) {
                continue;
            }

            if !self.db.mark_alert_triggered(alert.id, price).await? {
                debug!(alert_id = alert.id, "Alert already claimed by another tick");
                continue;
            }

            info!(
                alert_id = alert.id,
                user = %alert.user_id,
                symbol = %alert.symbol,
                condition = %alert.trigger_condition,
                trigger = %alert.trigger_price,
                price = %price,
                "Alert triggered"
            );

            if let Some(updated) = self.db.get_alert(alert.id).await? {
                triggered.push(updated);
            }
        }

        Ok(triggered)
    }
}
