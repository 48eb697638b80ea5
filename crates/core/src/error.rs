//! Error taxonomy for the lifecycle engine.
//!
//! Business-rule failures are typed and never retried; only `Storage`
//! failures are transient and eligible for retry at the call site.

use crate::types::Direction;
use rust_decimal::Decimal;
use thiserror::Error;

/// Errors produced by the ledger and its collaborators.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    /// Available balance (balance - frozen) cannot cover margin + fee.
    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientBalance {
        /// Margin plus fee required for the operation.
        required: Decimal,
        /// Balance minus frozen at the time of the check.
        available: Decimal,
    },

    /// Position id does not exist. Benign on close paths.
    #[error("position not found: {id}")]
    PositionNotFound {
        /// The missing position id.
        id: i64,
    },

    /// Order id does not exist.
    #[error("order not found: {id}")]
    OrderNotFound {
        /// The missing order id.
        id: i64,
    },

    /// Account id does not exist.
    #[error("account not found: {id}")]
    AccountNotFound {
        /// The missing account id.
        id: i64,
    },

    /// No price could be obtained. Callers must skip, never substitute zero.
    #[error("price unavailable for {symbol}")]
    PriceUnavailable {
        /// Symbol whose price was requested.
        symbol: String,
    },

    /// Quantity/price rounding violated the symbol's precision rules.
    #[error("precision error: {0}")]
    Precision(String),

    /// Quantity is zero, negative, or exceeds the open quantity.
    #[error("invalid quantity: {quantity}")]
    InvalidQuantity {
        /// The rejected quantity.
        quantity: Decimal,
    },

    /// A concurrent writer won the update race on a position.
    #[error("concurrent update lost for position {id}")]
    ConcurrencyConflict {
        /// The contested position id.
        id: i64,
    },

    /// The admission controller denied a real entry in this direction.
    #[error("admission denied for {direction}: {reason}")]
    AdmissionDenied {
        /// Trade direction that was denied.
        direction: Direction,
        /// Human-readable denial reason.
        reason: String,
    },

    /// Infrastructure failure (database connectivity, lost connection).
    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Creates an insufficient balance error.
    #[must_use]
    pub const fn insufficient_balance(required: Decimal, available: Decimal) -> Self {
        Self::InsufficientBalance {
            required,
            available,
        }
    }

    /// Creates a price unavailable error.
    pub fn price_unavailable(symbol: impl Into<String>) -> Self {
        Self::PriceUnavailable {
            symbol: symbol.into(),
        }
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// True for infrastructure failures that may succeed on retry.
    /// Business-rule failures are never transient.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn insufficient_balance_display() {
        let err = EngineError::insufficient_balance(dec!(1050), dec!(900));
        assert!(err.to_string().contains("1050"));
        assert!(err.to_string().contains("900"));
    }

    #[test]
    fn storage_is_transient() {
        assert!(EngineError::storage("connection reset").is_transient());
        assert!(!EngineError::PositionNotFound { id: 7 }.is_transient());
        assert!(!EngineError::insufficient_balance(dec!(1), dec!(0)).is_transient());
    }

    #[test]
    fn admission_denied_names_direction() {
        let err = EngineError::AdmissionDenied {
            direction: Direction::Short,
            reason: "4 consecutive losses".to_string(),
        };
        assert!(err.to_string().contains("short"));
        assert!(err.to_string().contains("consecutive"));
    }
}
