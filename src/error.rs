//! Error types for the rewards core.
//!
//! Validation and balance failures are recoverable and safe to retry with
//! corrected input. Persistence failures must always reach the caller.

use thiserror::Error;

/// A write to durable storage failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to persist {target}: {message}")]
pub struct PersistenceError {
    pub target: String,
    pub message: String,
}

impl PersistenceError {
    pub fn new(target: impl Into<String>, error: &anyhow::Error) -> Self {
        Self {
            target: target.into(),
            message: format!("{:#}", error),
        }
    }
}

/// Ledger operation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Accruals and redemptions must be positive, adjustments non-zero
    #[error("invalid amount {0}")]
    InvalidAmount(i64),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Exemption window errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExemptionError {
    /// A window is already active and the stacking policy is `block`
    #[error("an earned-time window is already active")]
    StackingPolicyViolation,

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Redemption errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RedemptionError {
    #[error("redemption of {points} points is below the minimum of {min}")]
    BelowMinimum { points: i64, min: i64 },

    #[error("redemption of {points} points is above the maximum of {max}")]
    AboveMaximum { points: i64, max: i64 },

    #[error("insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: i64, available: i64 },

    /// Extending the active window would pass the stacking cap
    #[error("only {max_redeemable_points} points can be added to the active window")]
    StackingCapExceeded { max_redeemable_points: i64 },

    #[error("an earned-time window is already active")]
    StackingPolicyViolation,

    /// Points convert to zero seconds of earned time
    #[error("{points} points do not buy any earned time")]
    NoEarnedTime { points: i64 },

    #[error("invalid redemption amount {0}")]
    InvalidAmount(i64),

    /// Nothing was deducted, or the deduction was compensated
    #[error(transparent)]
    Persistence(PersistenceError),

    /// The deduction could not be compensated
    #[error("redemption failed and could not be rolled back: {0}")]
    RollbackFailed(PersistenceError),
}

/// How a presentation layer should describe a failed redemption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Bad input or not enough points; correct and try again
    TryAgain,
    /// Something went wrong but the balance is unchanged
    PointsSafe,
    /// Something went wrong and the balance may be short
    PointsAtRisk,
}

impl RedemptionError {
    pub fn outcome(&self) -> FailureKind {
        match self {
            Self::Persistence(_) => FailureKind::PointsSafe,
            Self::RollbackFailed(_) => FailureKind::PointsAtRisk,
            _ => FailureKind::TryAgain,
        }
    }
}

impl From<LedgerError> for RedemptionError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InvalidAmount(points) => Self::InvalidAmount(points),
            LedgerError::Persistence(e) => Self::Persistence(e),
        }
    }
}

impl From<ExemptionError> for RedemptionError {
    fn from(err: ExemptionError) -> Self {
        match err {
            ExemptionError::StackingPolicyViolation => Self::StackingPolicyViolation,
            ExemptionError::Persistence(e) => Self::Persistence(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persistence() -> PersistenceError {
        PersistenceError::new("ledger", &anyhow::anyhow!("disk full"))
    }

    #[test]
    fn error_display_messages() {
        assert_eq!(
            RedemptionError::BelowMinimum { points: 5, min: 10 }.to_string(),
            "redemption of 5 points is below the minimum of 10"
        );
        assert_eq!(
            RedemptionError::InsufficientBalance {
                requested: 60,
                available: 5
            }
            .to_string(),
            "insufficient balance: requested 60, available 5"
        );
        assert_eq!(
            persistence().to_string(),
            "failed to persist ledger: disk full"
        );
    }

    #[test]
    fn outcome_distinguishes_retry_from_safe_failure() {
        assert_eq!(
            RedemptionError::AboveMaximum { points: 900, max: 600 }.outcome(),
            FailureKind::TryAgain
        );
        assert_eq!(
            RedemptionError::Persistence(persistence()).outcome(),
            FailureKind::PointsSafe
        );
        assert_eq!(
            RedemptionError::RollbackFailed(persistence()).outcome(),
            FailureKind::PointsAtRisk
        );
    }

    #[test]
    fn ledger_errors_convert() {
        let err: RedemptionError = LedgerError::Persistence(persistence()).into();
        assert_eq!(err, RedemptionError::Persistence(persistence()));

        let err: RedemptionError = ExemptionError::StackingPolicyViolation.into();
        assert_eq!(err, RedemptionError::StackingPolicyViolation);
    }
}
