use crate::types::TransactionId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JuiceError {
    // ── Token errors ─────────────────────────────────────────────────────────
    #[error("invalid denomination: {got} (allowed: 1,2,5,10,20,50,100,200,500)")]
    InvalidDenomination { got: u64 },

    #[error("token is revoked: {0}")]
    TokenRevoked(String),

    #[error("token is expired: {0}")]
    TokenExpired(String),

    #[error("token not owned by {owner}: {token}")]
    TokenNotOwned { token: String, owner: String },

    #[error("insufficient balance: need {need} units, have {have}")]
    InsufficientBalance { need: u64, have: u64 },

    #[error("invalid token status transition: {from} → {to}")]
    InvalidStatusTransition { from: String, to: String },

    // ── WisselToken ──────────────────────────────────────────────────────────
    #[error("WisselToken must be the last token spent from its issuance")]
    WisselTokenProtected,

    // ── Telomeer errors ──────────────────────────────────────────────────────
    #[error("telomeer history tampered: recomputed head differs from stored head")]
    HistoryTampered,

    #[error("transfer into identical owner")]
    SameOwnerTransfer,

    #[error("invalid telomeer signature")]
    InvalidTelomeerSignature,

    // ── Personal chain errors ────────────────────────────────────────────────
    #[error("out-of-order chain sequence: expected {expected}, got {got}")]
    OutOfOrderSequence { expected: u64, got: u64 },

    #[error("bad signature")]
    BadSignature,

    // ── Time attestation ─────────────────────────────────────────────────────
    #[error("time integrity insufficient: confidence {confidence}, status {status}")]
    TimeIntegrityInsufficient { confidence: u8, status: String },

    // ── Transaction errors ───────────────────────────────────────────────────
    #[error("transaction {0} timed out")]
    TransactionTimeout(TransactionId),

    #[error("transaction {transaction_id} aborted: {reason}")]
    TransactionAborted {
        transaction_id: TransactionId,
        reason: String,
    },

    #[error("duplicate transaction seed")]
    DuplicateSeed,

    #[error("unknown transaction: {0}")]
    UnknownTransaction(TransactionId),

    #[error("transport failed: {0}")]
    TransportFailed(String),

    #[error("transaction {0} is inconclusive; resolution pending")]
    Inconclusive(TransactionId),

    // ── Wire format ──────────────────────────────────────────────────────────
    #[error("malformed wire message: {0}")]
    WireFormat(String),

    // ── Serialization / storage ──────────────────────────────────────────────
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),

    // ── Lifecycle ────────────────────────────────────────────────────────────
    #[error("egg stage transition not permitted: {from} → {to}")]
    InvalidEggTransition { from: String, to: String },

    #[error("hatching condition not satisfied: {0}")]
    HatchingConditionUnsatisfied(String),

    #[error("token not within its expiry warning window")]
    NotExpiring,
}

impl JuiceError {
    /// Whether retrying the failed operation is meaningful for the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JuiceError::TransportFailed(_)
                | JuiceError::TransactionTimeout(_)
                | JuiceError::Inconclusive(_)
                | JuiceError::TimeIntegrityInsufficient { .. }
                | JuiceError::Storage(_)
        )
    }

    /// The transaction this error concerns, when there is one, so the user
    /// can inspect resolution.
    pub fn transaction_id(&self) -> Option<TransactionId> {
        match self {
            JuiceError::TransactionTimeout(id)
            | JuiceError::UnknownTransaction(id)
            | JuiceError::Inconclusive(id)
            | JuiceError::TransactionAborted {
                transaction_id: id, ..
            } => Some(*id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(JuiceError::TransportFailed("peer gone".into()).is_retryable());
        assert!(!JuiceError::WisselTokenProtected.is_retryable());
        assert!(!JuiceError::SameOwnerTransfer.is_retryable());
    }

    #[test]
    fn transaction_errors_carry_id() {
        let id = TransactionId::generate();
        let err = JuiceError::TransactionAborted {
            transaction_id: id,
            reason: "pak validation failed".into(),
        };
        assert_eq!(err.transaction_id(), Some(id));
        assert_eq!(JuiceError::BadSignature.transaction_id(), None);
    }
}
