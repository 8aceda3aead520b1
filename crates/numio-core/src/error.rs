use thiserror::Error;

use crate::state::ActivationState;
use crate::types::{ActivationId, Money, NumberId, ProviderId, ReservationId, UserId};

#[derive(Debug, Error)]
pub enum NumioError {
    // ── User errors ──────────────────────────────────────────────────────────
    #[error("insufficient balance: need {need}, have {have}")]
    InsufficientBalance { need: Money, have: Money },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("order does not belong to user {0}")]
    NotOrderOwner(UserId),

    // ── Upstream errors ──────────────────────────────────────────────────────
    #[error("no numbers available upstream")]
    NoNumbers,

    #[error("upstream balance exhausted")]
    NoBalance,

    #[error("service not offered by upstream: {0}")]
    BadService(String),

    #[error("upstream transport failure: {0}")]
    Transport(String),

    #[error("upstream call timed out after {timeout_secs}s")]
    UpstreamTimeout { timeout_secs: u64 },

    #[error("unknown provider: {0}")]
    UnknownProvider(ProviderId),

    #[error("operation not supported by provider {0}")]
    NotSupported(ProviderId),

    // ── Consistency errors ───────────────────────────────────────────────────
    #[error("activation {id} moved to {actual} while {expected} was expected")]
    ActivationConflict {
        id: ActivationId,
        expected: ActivationState,
        actual: ActivationState,
    },

    #[error("activation not found: {0}")]
    ActivationNotFound(ActivationId),

    #[error("number not found: {0}")]
    NumberNotFound(NumberId),

    #[error("reservation not found: {0}")]
    ReservationNotFound(ReservationId),

    #[error("no offer matches the requested service/country")]
    NoMatchingOffer,

    #[error("offer out of stock")]
    OutOfStock,

    // ── Logic errors (always a bug) ──────────────────────────────────────────
    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition {
        from: ActivationState,
        to: ActivationState,
    },

    // ── Wallet ───────────────────────────────────────────────────────────────
    #[error("wallet operation failed: {0}")]
    Wallet(String),

    // ── Serialization / storage ──────────────────────────────────────────────
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),

    // ── Coordination ─────────────────────────────────────────────────────────
    #[error("poll cycle lock held by another worker")]
    CycleLockHeld,

    #[error("outbox row already claimed by another worker")]
    OutboxClaimLost,

    #[error("{0}")]
    Other(String),
}

impl NumioError {
    /// Map an error raised on the purchase path to its user-facing code.
    pub fn purchase_code(&self) -> PurchaseErrorCode {
        match self {
            NumioError::InsufficientBalance { .. } => PurchaseErrorCode::InsufficientBalance,
            NumioError::InvalidRequest(_)
            | NumioError::NoMatchingOffer
            | NumioError::OutOfStock => PurchaseErrorCode::InvalidRequest,
            NumioError::NoNumbers
            | NumioError::NoBalance
            | NumioError::BadService(_)
            | NumioError::Transport(_)
            | NumioError::UpstreamTimeout { .. }
            | NumioError::UnknownProvider(_) => PurchaseErrorCode::ProviderError,
            NumioError::NotSupported(_) => PurchaseErrorCode::NotSupported,
            _ => PurchaseErrorCode::SystemError,
        }
    }
}

/// Tagged result codes for the purchase saga. The saga's expected branches are
/// data, not exceptions; only `InvalidTransition` stays a raised error.
#[derive(Clone, Copy, PartialEq, Eq, Debug, serde::Serialize, serde::Deserialize)]
pub enum PurchaseErrorCode {
    InsufficientBalance,
    ProviderError,
    InvalidRequest,
    SystemError,
    NotSupported,
}

impl PurchaseErrorCode {
    pub fn label(self) -> &'static str {
        match self {
            PurchaseErrorCode::InsufficientBalance => "INSUFFICIENT_BALANCE",
            PurchaseErrorCode::ProviderError => "PROVIDER_ERROR",
            PurchaseErrorCode::InvalidRequest => "INVALID_REQUEST",
            PurchaseErrorCode::SystemError => "SYSTEM_ERROR",
            PurchaseErrorCode::NotSupported => "NOT_SUPPORTED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purchase_code_mapping() {
        let e = NumioError::InsufficientBalance {
            need: Money::from_cents(100),
            have: Money::from_cents(50),
        };
        assert_eq!(e.purchase_code(), PurchaseErrorCode::InsufficientBalance);
        assert_eq!(
            NumioError::NoNumbers.purchase_code(),
            PurchaseErrorCode::ProviderError
        );
        assert_eq!(
            NumioError::Storage("io".into()).purchase_code(),
            PurchaseErrorCode::SystemError
        );
    }
}
