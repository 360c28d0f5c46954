use serde::{Deserialize, Serialize};

use crate::constants::MAX_HISTORY;
use crate::error::JuiceError;
use crate::types::{sha256, OwnerHash, OwnerId, Signature, TimestampMs, TokenId, TransactionId};

// ── Telomeer ─────────────────────────────────────────────────────────────────

/// Per-token ownership chain with a bounded, self-compacting history.
///
/// The current owner is stored plaintext for immediate verification; the
/// immediately preceding owner as a single hash; everything older as an
/// ordered hash sequence whose oldest entries fold into composites so the
/// chain never outgrows `MAX_HISTORY`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Telomeer {
    pub token_id: TokenId,

    pub current_owner: OwnerId,

    /// SHA-256 of the previous owner's fingerprint; zero for a fresh token.
    pub hash_previous_owner: OwnerHash,

    /// Earlier-owner hashes, oldest first. Entry 0 may be a composite.
    pub hash_history: Vec<OwnerHash>,

    /// SHA-256 over the canonical telomeer body, recomputed on every
    /// mutation. A mismatch on load means `HistoryTampered`.
    pub head: [u8; 32],
}

impl Telomeer {
    /// Telomeer for a freshly issued (or hatched) token.
    pub fn genesis(token_id: TokenId, owner: OwnerId) -> Self {
        let mut t = Self {
            token_id,
            current_owner: owner,
            hash_previous_owner: OwnerHash::zero(),
            hash_history: Vec::new(),
            head: [0u8; 32],
        };
        t.head = t.compute_head();
        t
    }

    /// Canonical head hash: token id, current owner, previous-owner hash,
    /// and the full history in order.
    pub fn compute_head(&self) -> [u8; 32] {
        let mut buf =
            Vec::with_capacity(32 * (3 + self.hash_history.len()));
        buf.extend_from_slice(self.token_id.as_bytes());
        buf.extend_from_slice(self.current_owner.as_bytes());
        buf.extend_from_slice(self.hash_previous_owner.as_bytes());
        for h in &self.hash_history {
            buf.extend_from_slice(h.as_bytes());
        }
        sha256(&buf)
    }

    /// Check the stored head against a recomputation.
    pub fn verify_integrity(&self) -> Result<(), JuiceError> {
        if self.head != self.compute_head() {
            return Err(JuiceError::HistoryTampered);
        }
        Ok(())
    }

    /// Hand the token to `new_owner`. The departing owner's hash is
    /// appended to the history, folding the oldest entries if the bound
    /// would be exceeded.
    pub fn transfer(
        &mut self,
        new_owner: OwnerId,
        transaction_id: TransactionId,
    ) -> Result<(), JuiceError> {
        self.transfer_with_bound(new_owner, transaction_id, MAX_HISTORY)
    }

    /// `transfer` with an explicit history bound (from `EngineConfig`).
    pub fn transfer_with_bound(
        &mut self,
        new_owner: OwnerId,
        _transaction_id: TransactionId,
        max_history: usize,
    ) -> Result<(), JuiceError> {
        if new_owner == self.current_owner {
            return Err(JuiceError::SameOwnerTransfer);
        }
        self.verify_integrity()?;

        let departing = self.current_owner.hashed();
        self.hash_history.push(departing);
        if self.hash_history.len() > max_history {
            let fold_count = self.hash_history.len() - max_history + 1;
            let composite = fold(&self.hash_history[..fold_count]);
            self.hash_history.splice(..fold_count, [composite]);
        }

        self.hash_previous_owner = departing;
        self.current_owner = new_owner;
        self.head = self.compute_head();
        Ok(())
    }

    /// True iff `owner` was the immediately preceding owner or appears as
    /// an unfolded entry in the history. Folded owners match only as a
    /// group via [`Telomeer::verify_folded_group`].
    pub fn verify_previous_ownership(&self, owner: &OwnerId) -> bool {
        let h = owner.hashed();
        h == self.hash_previous_owner || self.hash_history.contains(&h)
    }

    /// Prove membership of a folded segment by re-exhibiting the folded
    /// entries in their original order.
    pub fn verify_folded_group(&self, folded: &[OwnerHash]) -> bool {
        if folded.is_empty() {
            return false;
        }
        self.hash_history.contains(&fold(folded))
    }

    /// Unsigned ownership-proof body; the owner signs it and a TEE may
    /// countersign.
    pub fn proof_body(&self, now: TimestampMs) -> OwnershipProofBody {
        let mut chain = Vec::with_capacity(2 + self.hash_history.len());
        chain.push(*self.current_owner.as_bytes());
        chain.push(*self.hash_previous_owner.as_bytes());
        chain.extend(self.hash_history.iter().map(|h| *h.as_bytes()));
        OwnershipProofBody {
            token_id: self.token_id,
            timestamp_ms: now,
            chain,
        }
    }
}

/// Deterministic composite over a folded segment:
/// SHA-256(concat(folded entries in order)).
pub fn fold(entries: &[OwnerHash]) -> OwnerHash {
    let mut buf = Vec::with_capacity(32 * entries.len());
    for e in entries {
        buf.extend_from_slice(e.as_bytes());
    }
    OwnerHash(sha256(&buf))
}

// ── Ownership proof ──────────────────────────────────────────────────────────

/// The signed portion of an ownership proof.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct OwnershipProofBody {
    pub token_id: TokenId,
    pub timestamp_ms: TimestampMs,
    /// `[current_owner, hash_previous_owner, hash_history...]`.
    pub chain: Vec<[u8; 32]>,
}

impl OwnershipProofBody {
    pub fn signing_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("proof body serialization is infallible")
    }
}

/// Ownership proof: the body, the owner's signature over it, and a TEE
/// countersignature when the hardware capability is present.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct OwnershipProof {
    pub body: OwnershipProofBody,
    pub owner: OwnerId,
    pub signature: Signature,
    pub tee_countersignature: Option<Vec<u8>>,
}
