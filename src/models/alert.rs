//! Price alerts consumed by the alert monitor.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertCondition {
    Above,
    Below,
}

impl AlertCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertCondition::Above => "above",
            AlertCondition::Below => "below",
        }
    }

    /// Whether `price` has crossed `trigger`.
    pub fn is_met(&self, price: Decimal, trigger: Decimal) -> bool {
        match self {
            AlertCondition::Above => price >= trigger,
            AlertCondition::Below => price <= trigger,
        }
    }
}

impl fmt::Display for AlertCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertCondition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "above" => Ok(AlertCondition::Above),
            "below" => Ok(AlertCondition::Below),
            other => Err(format!("unknown alert condition: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Pending,
    Triggered,
    Cancelled,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Pending => "pending",
            AlertStatus::Triggered => "triggered",
            AlertStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(AlertStatus::Pending),
            "triggered" => Ok(AlertStatus::Triggered),
            "cancelled" => Ok(AlertStatus::Cancelled),
            other => Err(format!("unknown alert status: {}", other)),
        }
    }
}

/// A one-shot price alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceAlert {
    pub id: i64,
    pub user_id: String,
    pub symbol: String,
    pub trigger_price: Decimal,
    pub trigger_condition: AlertCondition,

    /// Free text passed through to the decision layer
    pub strategy_context: Option<String>,

    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
    pub triggered_at: Option<DateTime<Utc>>,
    pub triggered_price: Option<Decimal>,
}

impl PriceAlert {
    pub fn is_crossed(&self, price: Decimal) -> bool {
        self.status == AlertStatus::Pending && self.trigger_condition.is_met(price, self.trigger_price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_conditions() {
        assert!(AlertCondition::Above.is_met(dec!(61000), dec!(60000)));
        assert!(AlertCondition::Above.is_met(dec!(60000), dec!(60000)));
        assert!(!AlertCondition::Below.is_met(dec!(61000), dec!(40000)));
        assert!(AlertCondition::Below.is_met(dec!(39999), dec!(40000)));
    }
}
