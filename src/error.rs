//! Typed errors for ledger, risk and gateway operations.

use rust_decimal::Decimal;
use thiserror::Error;

/// Errors raised by the position & risk engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Margin requested exceeds the wallet's free cash
    #[error("Insufficient funds: available={available}, required={required}")]
    InsufficientFunds { available: Decimal, required: Decimal },

    /// Operation requires an OPEN position
    #[error("Position {0} is not open")]
    PositionNotOpen(i64),

    /// Close raced with another close and lost
    #[error("Position {0} already closed")]
    AlreadyClosed(i64),

    #[error("Position {0} not found")]
    PositionNotFound(i64),

    /// Lost the optimistic version race too many times in a row
    #[error("Position {0} kept changing during settlement")]
    Conflict(i64),

    #[error("Alert {0} not found or no longer pending")]
    AlertNotFound(i64),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// User has no live exchange credentials
    #[error("Live trading not configured for user {0}")]
    NotConfigured(String),

    /// User has credentials but trading is switched off
    #[error("Live trading disabled for user {0}")]
    TradingDisabled(String),

    #[error("Quote unavailable: {0}")]
    QuoteUnavailable(String),

    #[error("Remote gateway error: {0}")]
    RemoteGateway(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl EngineError {
    /// Errors the caller can fix by changing the request (4xx-equivalent).
    pub fn is_user_actionable(&self) -> bool {
        matches!(
            self,
            EngineError::InsufficientFunds { .. }
                | EngineError::NotConfigured(_)
                | EngineError::TradingDisabled(_)
                | EngineError::InvalidRequest(_)
        )
    }

    /// Errors that may succeed on the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::QuoteUnavailable(_)
                | EngineError::RemoteGateway(_)
                | EngineError::Conflict(_)
        )
    }

    /// Short tag for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            EngineError::PositionNotOpen(_) => "POSITION_NOT_OPEN",
            EngineError::AlreadyClosed(_) => "ALREADY_CLOSED",
            EngineError::PositionNotFound(_) => "POSITION_NOT_FOUND",
            EngineError::Conflict(_) => "CONFLICT",
            EngineError::AlertNotFound(_) => "ALERT_NOT_FOUND",
            EngineError::InvalidRequest(_) => "INVALID_REQUEST",
            EngineError::NotConfigured(_) => "NOT_CONFIGURED",
            EngineError::TradingDisabled(_) => "TRADING_DISABLED",
            EngineError::QuoteUnavailable(_) => "QUOTE",
            EngineError::RemoteGateway(_) => "REMOTE",
            EngineError::Database(_) => "DATABASE",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_actionable_errors() {
        let err = EngineError::InsufficientFunds {
            available: dec!(100),
            required: dec!(500),
        };
        assert!(err.is_user_actionable());
        assert!(!err.is_transient());
        assert!(EngineError::NotConfigured("u1".into()).is_user_actionable());
        assert!(!EngineError::AlreadyClosed(7).is_user_actionable());
    }

    #[test]
    fn test_transient_errors() {
        assert!(EngineError::QuoteUnavailable("timeout".into()).is_transient());
        assert!(EngineError::RemoteGateway("502".into()).is_transient());
        assert_eq!(EngineError::AlreadyClosed(1).category(), "ALREADY_CLOSED");
    }
}
