use crate::types::{BalanceType, FundingDirective, SourceRef};
use rust_decimal::Decimal;
use thiserror::Error;

/// Result type for cashbook operations.
pub type CashbookResult<T> = Result<T, CashbookError>;

/// Cashbook errors.
///
/// Business rejections (`InsufficientFunds`, `InvalidEntry`, ...) are kept
/// apart from contention failures (`LockTimeout`, `CommitConflict`) so a
/// service layer can decide between retrying and refusing.
#[derive(Debug, Error)]
pub enum CashbookError {
    #[error("balance '{0}' is not provisioned")]
    BalanceNotFound(BalanceType),

    #[error("insufficient funds from {from}: amount {amount}, available {available}")]
    InsufficientFunds {
        amount: Decimal,
        available: Decimal,
        from: FundingDirective,
    },

    #[error("invalid ledger entry: {0}")]
    InvalidEntry(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("timed out after {waited_ms}ms waiting for balance locks")]
    LockTimeout { waited_ms: u64 },

    #[error("commit conflict: {0}")]
    CommitConflict(String),

    #[error("balances are already provisioned")]
    AlreadyProvisioned,

    #[error("no live ledger entry for {0}")]
    SourceNotFound(SourceRef),

    #[error("unknown category '{0}'")]
    CategoryNotFound(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl CashbookError {
    /// Contention failures; the whole operation may be re-run from scratch.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::CommitConflict(_))
    }

    /// Failures caused by the request itself; retrying will not help.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::InsufficientFunds { .. }
                | Self::InvalidEntry(_)
                | Self::InvalidAmount(_)
                | Self::SourceNotFound(_)
                | Self::CategoryNotFound(_)
        )
    }

    pub(crate) fn insufficient(
        amount: Decimal,
        available: Decimal,
        from: FundingDirective,
    ) -> Self {
        Self::InsufficientFunds {
            amount,
            available,
            from,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn insufficient_funds_display_names_source() {
        let err = CashbookError::insufficient(
            dec!(5000000),
            dec!(1000000),
            FundingDirective::Shu,
        );
        let rendered = err.to_string();
        assert!(rendered.contains("from shu"));
        assert!(rendered.contains("5000000"));
        assert!(rendered.contains("1000000"));
    }

    #[test]
    fn classification_separates_retry_from_rejection() {
        let timeout = CashbookError::LockTimeout { waited_ms: 50 };
        let conflict = CashbookError::CommitConflict("serialization failure".into());
        let rejected =
            CashbookError::insufficient(dec!(1), dec!(0), FundingDirective::Auto);
        let invalid = CashbookError::InvalidEntry("zero total".into());

        assert!(timeout.is_retryable() && !timeout.is_rejection());
        assert!(conflict.is_retryable() && !conflict.is_rejection());
        assert!(rejected.is_rejection() && !rejected.is_retryable());
        assert!(invalid.is_rejection() && !invalid.is_retryable());

        let storage = CashbookError::Storage("connection reset".into());
        assert!(!storage.is_retryable() && !storage.is_rejection());
    }
}
