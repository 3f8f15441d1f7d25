//! Trading core: ledger, risk engine, alert monitor, configuration.

mod alerts;
mod config;
mod ledger;
mod risk;

pub use alerts::AlertMonitor;
pub use config::EngineConfig;
pub use ledger::{CloseOutcome, OpenRequest, PositionLedger};
pub use risk::{RiskDecision, RiskEngine, RiskSnapshot};
