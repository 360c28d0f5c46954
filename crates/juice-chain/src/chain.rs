use juice_core::error::JuiceError;
use juice_core::types::{OwnerId, TimestampMs};
use juice_crypto::{verify_signature, Signer};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::entry::{compute_entry_hash, ChainPayload, PersonalChainEntry};

/// A participant's append-only, signed sequence of state-changing events.
///
/// Only the owner's process appends; replicas held by backup peers are
/// verified with [`PersonalChain::verify`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PersonalChain {
    pub user_id: OwnerId,
    entries: Vec<PersonalChainEntry>,
}

impl PersonalChain {
    pub fn new(user_id: OwnerId) -> Self {
        Self {
            user_id,
            entries: Vec::new(),
        }
    }

    pub fn entries(&self) -> &[PersonalChainEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cumulative head hash; zero for an empty chain.
    pub fn head(&self) -> [u8; 32] {
        self.entries.last().map(|e| e.entry_hash).unwrap_or([0u8; 32])
    }

    pub fn latest_sequence(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Sign and append a new entry. The signer must be the chain owner.
    pub fn append(
        &mut self,
        payload: ChainPayload,
        now: TimestampMs,
        signer: &dyn Signer,
    ) -> Result<&PersonalChainEntry, JuiceError> {
        if signer.owner_id() != self.user_id {
            return Err(JuiceError::BadSignature);
        }
        let sequence_number = self.latest_sequence() + 1;
        let entry_hash = compute_entry_hash(&self.head(), sequence_number, &payload);
        let signature = signer.sign(&entry_hash);
        self.entries.push(PersonalChainEntry {
            user_id: self.user_id,
            sequence_number,
            timestamp_ms: now,
            entry_hash,
            payload,
            signature,
        });
        debug!(user = %self.user_id, sequence_number, "personal chain append");
        Ok(self.entries.last().expect("entry just pushed"))
    }

    /// Accept an already-signed entry (replica sync). Only the next
    /// sequence number is accepted; the head hash and signature are
    /// recomputed and checked before the entry lands.
    pub fn update_chain(&mut self, entry: PersonalChainEntry) -> Result<(), JuiceError> {
        let expected = self.latest_sequence() + 1;
        if entry.sequence_number != expected {
            return Err(JuiceError::OutOfOrderSequence {
                expected,
                got: entry.sequence_number,
            });
        }
        let recomputed = compute_entry_hash(&self.head(), entry.sequence_number, &entry.payload);
        if recomputed != entry.entry_hash {
            return Err(JuiceError::HistoryTampered);
        }
        verify_signature(&self.user_id, &entry.entry_hash, &entry.signature)?;
        self.entries.push(entry);
        Ok(())
    }

    /// Walk the chain recomputing every head and validating every
    /// signature against the user's public key.
    pub fn verify(&self) -> Result<(), JuiceError> {
        let mut prev_head = [0u8; 32];
        for (i, entry) in self.entries.iter().enumerate() {
            let expected_seq = i as u64 + 1;
            if entry.sequence_number != expected_seq {
                return Err(JuiceError::OutOfOrderSequence {
                    expected: expected_seq,
                    got: entry.sequence_number,
                });
            }
            let recomputed = compute_entry_hash(&prev_head, entry.sequence_number, &entry.payload);
            if recomputed != entry.entry_hash {
                return Err(JuiceError::HistoryTampered);
            }
            verify_signature(&self.user_id, &entry.entry_hash, &entry.signature)?;
            prev_head = entry.entry_hash;
        }
        Ok(())
    }

    /// Stable binary encoding for backup replicas.
    pub fn serialize(&self) -> Vec<u8> {
        bincode::serialize(self).expect("personal chain serialization is infallible")
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, JuiceError> {
        bincode::deserialize(bytes).map_err(|e| JuiceError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use juice_core::types::{OwnerId, TokenId};
    use juice_crypto::KeyPair;

    fn payload(n: u8) -> ChainPayload {
        ChainPayload::TelomeerUpdate {
            token_id: TokenId::from_bytes([n; 32]),
            new_owner: OwnerId::from_bytes([n; 32]),
        }
    }

    #[test]
    fn append_produces_gap_free_sequence() {
        let kp = KeyPair::generate();
        let mut chain = PersonalChain::new(kp.owner_id);
        for n in 1..=5u8 {
            chain.append(payload(n), 1_000 * n as u64, &kp).unwrap();
        }
        let seqs: Vec<u64> = chain.entries().iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        chain.verify().unwrap();
    }

    #[test]
    fn foreign_signer_rejected() {
        let kp = KeyPair::generate();
        let other = KeyPair::generate();
        let mut chain = PersonalChain::new(kp.owner_id);
        assert!(matches!(
            chain.append(payload(1), 1_000, &other),
            Err(JuiceError::BadSignature)
        ));
    }

    #[test]
    fn update_chain_rejects_sequence_gap() {
        let kp = KeyPair::generate();
        let mut source = PersonalChain::new(kp.owner_id);
        source.append(payload(1), 1_000, &kp).unwrap();
        source.append(payload(2), 2_000, &kp).unwrap();

        let mut replica = PersonalChain::new(kp.owner_id);
        let err = replica
            .update_chain(source.entries()[1].clone())
            .unwrap_err();
        assert!(matches!(
            err,
            JuiceError::OutOfOrderSequence { expected: 1, got: 2 }
        ));
    }

    #[test]
    fn replica_sync_entry_by_entry() {
        let kp = KeyPair::generate();
        let mut source = PersonalChain::new(kp.owner_id);
        for n in 1..=3u8 {
            source.append(payload(n), 1_000, &kp).unwrap();
        }
        let mut replica = PersonalChain::new(kp.owner_id);
        for entry in source.entries() {
            replica.update_chain(entry.clone()).unwrap();
        }
        assert_eq!(replica.head(), source.head());
    }

    #[test]
    fn tampered_payload_detected_on_verify() {
        let kp = KeyPair::generate();
        let mut chain = PersonalChain::new(kp.owner_id);
        chain.append(payload(1), 1_000, &kp).unwrap();
        chain.entries[0].payload = payload(9);
        assert!(matches!(chain.verify(), Err(JuiceError::HistoryTampered)));
    }

    #[test]
    fn serialize_round_trip() {
        let kp = KeyPair::generate();
        let mut chain = PersonalChain::new(kp.owner_id);
        for n in 1..=4u8 {
            chain.append(payload(n), 500 * n as u64, &kp).unwrap();
        }
        let restored = PersonalChain::deserialize(&chain.serialize()).unwrap();
        assert_eq!(restored, chain);
        restored.verify().unwrap();
    }
}
