//! Engine configuration.

use std::str::FromStr;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Configuration for the ledger, risk loop and remote endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Starting cash for a wallet created on first reference
    pub initial_balance: Decimal,

    /// Fee charged on notional for every open and close (0.0 to 1.0)
    pub fee_rate: Decimal,

    /// Highest leverage accepted on open
    pub max_leverage: u32,

    /// Risk/price tick interval (seconds)
    pub risk_interval_secs: u64,

    /// Alert tick interval (seconds)
    pub alert_interval_secs: u64,

    /// Minute past the hour at which the strategy tick fires
    pub strategy_minute: u32,

    /// Live account reconciliation interval (seconds)
    pub reconcile_interval_secs: u64,

    /// Symbols the strategy may trade
    pub symbols: Vec<String>,

    /// Users the hourly strategy tick runs for
    pub strategy_users: Vec<String>,

    /// Public quote source
    pub quote_base_url: String,

    /// Live futures exchange
    pub exchange_base_url: String,

    /// Decision layer endpoint. Without one the strategy holds.
    pub decision_webhook_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_balance: dec!(10000),
            fee_rate: Decimal::ZERO,
            max_leverage: 125,
            risk_interval_secs: 10,
            alert_interval_secs: 60,
            strategy_minute: 5,
            reconcile_interval_secs: 300,
            symbols: ["BTCUSDT", "ETHUSDT", "SOLUSDT", "BNBUSDT"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            strategy_users: vec!["admin".to_string()],
            quote_base_url: "https://fapi.binance.com".to_string(),
            exchange_base_url: "https://fapi.binance.com".to_string(),
            decision_webhook_url: None,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `FUTSIM_*` variables (a `.env` file is loaded first).
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("FUTSIM_INITIAL_BALANCE") {
            config.initial_balance = parse_var("FUTSIM_INITIAL_BALANCE", &v)?;
        }
        if let Some(v) = lookup("FUTSIM_FEE_RATE") {
            config.fee_rate = parse_var("FUTSIM_FEE_RATE", &v)?;
        }
        if let Some(v) = lookup("FUTSIM_MAX_LEVERAGE") {
            config.max_leverage = parse_var("FUTSIM_MAX_LEVERAGE", &v)?;
        }
        if let Some(v) = lookup("FUTSIM_RISK_INTERVAL_SECS") {
            config.risk_interval_secs = parse_var("FUTSIM_RISK_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("FUTSIM_ALERT_INTERVAL_SECS") {
            config.alert_interval_secs = parse_var("FUTSIM_ALERT_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("FUTSIM_STRATEGY_MINUTE") {
            config.strategy_minute = parse_var("FUTSIM_STRATEGY_MINUTE", &v)?;
        }
        if let Some(v) = lookup("FUTSIM_RECONCILE_INTERVAL_SECS") {
            config.reconcile_interval_secs = parse_var("FUTSIM_RECONCILE_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("FUTSIM_SYMBOLS") {
            config.symbols = split_list(&v);
        }
        if let Some(v) = lookup("FUTSIM_STRATEGY_USERS") {
            config.strategy_users = split_list(&v);
        }
        if let Some(v) = lookup("FUTSIM_QUOTE_URL") {
            config.quote_base_url = v;
        }
        if let Some(v) = lookup("FUTSIM_EXCHANGE_URL") {
            config.exchange_base_url = v;
        }
        if let Some(v) = lookup("FUTSIM_DECISION_WEBHOOK") {
            config.decision_webhook_url = Some(v).filter(|s| !s.trim().is_empty());
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.initial_balance < Decimal::ZERO {
            anyhow::bail!("initial balance must not be negative");
        }
        if self.fee_rate < Decimal::ZERO || self.fee_rate >= Decimal::ONE {
            anyhow::bail!("fee rate must be in [0, 1)");
        }
        if self.max_leverage == 0 {
            anyhow::bail!("max leverage must be at least 1");
        }
        if self.strategy_minute > 59 {
            anyhow::bail!("strategy minute must be 0-59");
        }
        if self.risk_interval_secs == 0 || self.alert_interval_secs == 0 || self.reconcile_interval_secs == 0 {
            anyhow::bail!("tick intervals must be positive");
        }
        if self.symbols.is_empty() {
            anyhow::bail!("symbol universe is empty");
        }
        Ok(())
    }

    pub fn is_tradable(&self, symbol: &str) -> bool {
        self.symbols.iter().any(|s| s.eq_ignore_ascii_case(symbol))
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("{}", e))
        .with_context(|| format!("Invalid value for {}: {:?}", key, value))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.initial_balance, dec!(10000));
        assert_eq!(config.risk_interval_secs, 10);
        assert_eq!(config.alert_interval_secs, 60);
        assert!(config.is_tradable("btcusdt"));
        assert!(!config.is_tradable("DOGEUSDT"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("FUTSIM_INITIAL_BALANCE", "2500"),
            ("FUTSIM_FEE_RATE", "0.0004"),
            ("FUTSIM_SYMBOLS", "btcusdt, ethusdt"),
            ("FUTSIM_STRATEGY_MINUTE", "30"),
        ]))
        .unwrap();

        assert_eq!(config.initial_balance, dec!(2500));
        assert_eq!(config.fee_rate, dec!(0.0004));
        assert_eq!(config.symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(config.strategy_minute, 30);
    }

    #[test]
    fn test_invalid_env_rejected() {
        assert!(EngineConfig::from_lookup(lookup_from(&[("FUTSIM_MAX_LEVERAGE", "lots")])).is_err());
        assert!(EngineConfig::from_lookup(lookup_from(&[("FUTSIM_STRATEGY_MINUTE", "75")])).is_err());
        assert!(EngineConfig::from_lookup(lookup_from(&[("FUTSIM_SYMBOLS", " , ")])).is_err());
    }
}
