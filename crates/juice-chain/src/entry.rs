use juice_core::types::{Amount, OwnerId, Signature, TimestampMs, TokenId, TransactionId};
use serde::{Deserialize, Serialize};

// ── ChainPayload ─────────────────────────────────────────────────────────────

/// Every state-changing event a participant journals is one of these
/// variants.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum ChainPayload {
    /// A completed (or aborted) token transfer with a counterparty.
    Transaction {
        transaction_id: TransactionId,
        counterparty: OwnerId,
        /// The counterparty's chain head at commit time, making the two
        /// chains mutually attesting. Zero when the abort was unilateral.
        counterparty_head: [u8; 32],
        amount: Amount,
        sent: Vec<TokenId>,
        received: Vec<TokenId>,
        aborted: bool,
        abort_reason: Option<String>,
    },

    /// A trust attestation this user issued about another participant.
    AttestationGiven {
        subject: OwnerId,
        attestation_key: String,
    },

    /// A trust attestation another participant issued about this user.
    AttestationReceived {
        issuer: OwnerId,
        attestation_key: String,
    },

    /// An ownership-chain mutation outside the transaction path (renewal,
    /// revocation).
    TelomeerUpdate {
        token_id: TokenId,
        new_owner: OwnerId,
    },

    /// An egg maturation step or hatch.
    EggLifecycle {
        egg_id: TokenId,
        stage: String,
        hatched_token: Option<TokenId>,
    },
}

impl ChainPayload {
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("chain payload serialization is infallible")
    }
}

// ── PersonalChainEntry ───────────────────────────────────────────────────────

/// One link of a user's append-only chain.
///
/// `entry_hash` covers the previous head, the sequence number, and the
/// payload; the signature covers the new cumulative head, so each entry
/// also re-attests everything before it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PersonalChainEntry {
    pub user_id: OwnerId,

    /// Gap-free, starting at 1.
    pub sequence_number: u64,

    pub timestamp_ms: TimestampMs,

    pub entry_hash: [u8; 32],

    pub payload: ChainPayload,

    pub signature: Signature,
}

/// entry_hash = SHA-256(prev_head ‖ sequence LE ‖ payload bytes).
pub fn compute_entry_hash(
    prev_head: &[u8; 32],
    sequence_number: u64,
    payload: &ChainPayload,
) -> [u8; 32] {
    juice_crypto::hash_stack(&[
        prev_head,
        &sequence_number.to_le_bytes(),
        &payload.to_bytes(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> ChainPayload {
        ChainPayload::TelomeerUpdate {
            token_id: TokenId::from_bytes([3u8; 32]),
            new_owner: OwnerId::from_bytes([4u8; 32]),
        }
    }

    #[test]
    fn entry_hash_binds_previous_head() {
        let p = payload();
        let a = compute_entry_hash(&[0u8; 32], 1, &p);
        let b = compute_entry_hash(&[1u8; 32], 1, &p);
        assert_ne!(a, b);
    }

    #[test]
    fn entry_hash_binds_sequence() {
        let p = payload();
        assert_ne!(
            compute_entry_hash(&[0u8; 32], 1, &p),
            compute_entry_hash(&[0u8; 32], 2, &p)
        );
    }

    #[test]
    fn payload_serde_round_trip() {
        let p = ChainPayload::Transaction {
            transaction_id: TransactionId::from_bytes([7u8; 16]),
            counterparty: OwnerId::from_bytes([8u8; 32]),
            counterparty_head: [9u8; 32],
            amount: Amount::from_units(15),
            sent: vec![TokenId::from_bytes([1u8; 32])],
            received: vec![],
            aborted: false,
            abort_reason: None,
        };
        let back: ChainPayload = bincode::deserialize(&p.to_bytes()).unwrap();
        assert_eq!(back, p);
    }
}
