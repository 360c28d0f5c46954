use juice_core::types::{Amount, OwnerId, TimestampMs, TokenId, TransactionId};
use serde::{Deserialize, Serialize};

use crate::pak::Pak;

// ── Phases ───────────────────────────────────────────────────────────────────

/// Transaction phases. The happy path runs INITIATED through COMMITTED;
/// ABORTING is reachable until the local point of no return; FAILED is
/// terminal on unrecoverable errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxPhase {
    Initiated,
    Preparing,
    Prepared,
    Committing,
    Committed,
    Aborting,
    Aborted,
    Failed,
}

impl TxPhase {
    pub fn permits(&self, to: TxPhase) -> bool {
        use TxPhase::*;
        matches!(
            (self, to),
            (Initiated, Preparing)
                | (Preparing, Prepared)
                | (Prepared, Committing)
                | (Committing, Committed)
                | (Initiated, Aborting)
                | (Preparing, Aborting)
                | (Prepared, Aborting)
                | (Aborting, Aborted)
                | (_, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TxPhase::Committed | TxPhase::Aborted | TxPhase::Failed)
    }
}

impl std::fmt::Display for TxPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TxPhase::Initiated => "INITIATED",
            TxPhase::Preparing => "PREPARING",
            TxPhase::Prepared => "PREPARED",
            TxPhase::Committing => "COMMITTING",
            TxPhase::Committed => "COMMITTED",
            TxPhase::Aborting => "ABORTING",
            TxPhase::Aborted => "ABORTED",
            TxPhase::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

/// Which end of the protocol this engine is driving.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxRole {
    Sender,
    Receiver,
}

// ── Journaled record ─────────────────────────────────────────────────────────

/// Snapshot written ahead of every state-mutating step. Replaying the
/// latest record after a crash restores enough context to either resolve
/// (sender past the point of no return) or roll back.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub transaction_id: TransactionId,
    pub role: TxRole,
    pub phase: TxPhase,
    pub seed: [u8; 32],
    pub counterparty: OwnerId,
    pub amount: Amount,
    /// Tokens this side has put into RESERVED for the transaction.
    pub reserved: Vec<TokenId>,
    /// The counterparty's exo pak, once validated.
    pub their_exo: Option<Pak>,
    /// This side's retro pak (rollback safety).
    pub retro: Option<Pak>,
    /// Whether this side's WisselToken travels in its exo pak.
    pub wissel_spent: bool,
    /// Counterparty chain head as communicated in the handshake.
    pub counterparty_head: [u8; 32],
    pub deadline_ms: TimestampMs,
    pub updated_ms: TimestampMs,
}

impl TransactionRecord {
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("transaction record serialization is infallible")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, juice_core::error::JuiceError> {
        bincode::deserialize(bytes)
            .map_err(|e| juice_core::error::JuiceError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        use TxPhase::*;
        for (from, to) in [
            (Initiated, Preparing),
            (Preparing, Prepared),
            (Prepared, Committing),
            (Committing, Committed),
        ] {
            assert!(from.permits(to), "{from} → {to}");
        }
    }

    #[test]
    fn abort_reachable_only_before_commit_point() {
        use TxPhase::*;
        assert!(Initiated.permits(Aborting));
        assert!(Preparing.permits(Aborting));
        assert!(Prepared.permits(Aborting));
        assert!(!Committing.permits(Aborting), "past the point of no return");
        assert!(!Committed.permits(Aborting));
    }

    #[test]
    fn failed_terminal_from_anywhere() {
        use TxPhase::*;
        for phase in [Initiated, Preparing, Prepared, Committing, Aborting] {
            assert!(phase.permits(Failed));
        }
        assert!(Failed.is_terminal());
        assert!(Committed.is_terminal());
        assert!(Aborted.is_terminal());
    }

    #[test]
    fn record_round_trip() {
        let record = TransactionRecord {
            transaction_id: TransactionId::generate(),
            role: TxRole::Sender,
            phase: TxPhase::Committing,
            seed: [7u8; 32],
            counterparty: OwnerId::from_bytes([2u8; 32]),
            amount: Amount::from_units(10),
            reserved: vec![TokenId::from_bytes([1u8; 32])],
            their_exo: None,
            retro: None,
            wissel_spent: false,
            counterparty_head: [0u8; 32],
            deadline_ms: 30_000,
            updated_ms: 1_000,
        };
        let back = TransactionRecord::from_bytes(&record.to_bytes()).unwrap();
        assert_eq!(back.phase, TxPhase::Committing);
        assert_eq!(back.transaction_id, record.transaction_id);
    }
}
