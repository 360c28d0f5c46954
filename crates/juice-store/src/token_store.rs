use std::sync::Arc;

use juice_chain::PersonalChain;
use juice_core::error::JuiceError;
use juice_core::telomeer::Telomeer;
use juice_core::token::{Token, WisselToken};
use juice_core::types::{OwnerId, TimestampMs, TokenId, TransactionId};
use serde::{Deserialize, Serialize};

use crate::kv::Kv;

/// A seed the receiver has issued; retained for the replay-refusal
/// window even after the transaction resolves.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SeedRecord {
    pub transaction_id: TransactionId,
    pub seed: [u8; 32],
    pub issued_ms: TimestampMs,
    pub resolved: bool,
    /// After this instant the record may be garbage-collected.
    pub window_closes_ms: TimestampMs,
}

/// Typed persistence over the plain [`Kv`] interface.
///
/// Key layout (one logical tree per prefix):
///   token/<hex>          → bincode(Token)
///   telomeer/<hex>       → bincode(Telomeer)
///   wissel/<owner b58>   → bincode(WisselToken)
///   chain/<owner b58>    → PersonalChain bytes
///   seed/<uuid>          → bincode(SeedRecord)
///   journal/<uuid>/<seq> → raw write-ahead record
pub struct TokenStore {
    kv: Arc<dyn Kv>,
}

impl TokenStore {
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { kv }
    }

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, JuiceError> {
        bincode::serialize(value).map_err(|e| JuiceError::Serialization(e.to_string()))
    }

    fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, JuiceError> {
        bincode::deserialize(bytes).map_err(|e| JuiceError::Serialization(e.to_string()))
    }

    // ── Tokens ───────────────────────────────────────────────────────────────

    pub fn put_token(&self, token: &Token) -> Result<(), JuiceError> {
        self.kv
            .put(&format!("token/{}", token.token_id.to_hex()), &Self::encode(token)?)
    }

    pub fn get_token(&self, id: &TokenId) -> Result<Option<Token>, JuiceError> {
        match self.kv.get(&format!("token/{}", id.to_hex()))? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn require_token(&self, id: &TokenId) -> Result<Token, JuiceError> {
        self.get_token(id)?
            .ok_or_else(|| JuiceError::Storage(format!("token not found: {id}")))
    }

    // ── Telomeers ────────────────────────────────────────────────────────────

    pub fn put_telomeer(&self, telomeer: &Telomeer) -> Result<(), JuiceError> {
        self.kv.put(
            &format!("telomeer/{}", telomeer.token_id.to_hex()),
            &Self::encode(telomeer)?,
        )
    }

    pub fn get_telomeer(&self, id: &TokenId) -> Result<Option<Telomeer>, JuiceError> {
        match self.kv.get(&format!("telomeer/{}", id.to_hex()))? {
            Some(bytes) => {
                let t: Telomeer = Self::decode(&bytes)?;
                t.verify_integrity()?;
                Ok(Some(t))
            }
            None => Ok(None),
        }
    }

    pub fn require_telomeer(&self, id: &TokenId) -> Result<Telomeer, JuiceError> {
        self.get_telomeer(id)?
            .ok_or_else(|| JuiceError::Storage(format!("telomeer not found: {id}")))
    }

    /// Every token whose Telomeer names `owner` as current owner.
    pub fn tokens_owned_by(&self, owner: &OwnerId) -> Result<Vec<Token>, JuiceError> {
        let mut out = Vec::new();
        for (_, bytes) in self.kv.list("telomeer/")? {
            let telomeer: Telomeer = Self::decode(&bytes)?;
            if telomeer.current_owner == *owner {
                if let Some(token) = self.get_token(&telomeer.token_id)? {
                    out.push(token);
                }
            }
        }
        Ok(out)
    }

    // ── WisselTokens ─────────────────────────────────────────────────────────

    pub fn put_wissel(&self, owner: &OwnerId, wissel: &WisselToken) -> Result<(), JuiceError> {
        self.kv
            .put(&format!("wissel/{}", owner.to_b58()), &Self::encode(wissel)?)
    }

    pub fn get_wissel(&self, owner: &OwnerId) -> Result<Option<WisselToken>, JuiceError> {
        match self.kv.get(&format!("wissel/{}", owner.to_b58()))? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Remove the wissel record after its base token has been spent.
    pub fn delete_wissel(&self, owner: &OwnerId) -> Result<(), JuiceError> {
        self.kv.delete(&format!("wissel/{}", owner.to_b58()))
    }

    // ── Personal chains ──────────────────────────────────────────────────────

    pub fn put_chain(&self, chain: &PersonalChain) -> Result<(), JuiceError> {
        self.kv
            .put(&format!("chain/{}", chain.user_id.to_b58()), &chain.serialize())
    }

    pub fn get_chain(&self, user: &OwnerId) -> Result<Option<PersonalChain>, JuiceError> {
        match self.kv.get(&format!("chain/{}", user.to_b58()))? {
            Some(bytes) => Ok(Some(PersonalChain::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    // ── Seed replay window ───────────────────────────────────────────────────

    pub fn put_seed(&self, record: &SeedRecord) -> Result<(), JuiceError> {
        self.kv.put(
            &format!("seed/{}", record.transaction_id),
            &Self::encode(record)?,
        )
    }

    pub fn get_seed(&self, id: &TransactionId) -> Result<Option<SeedRecord>, JuiceError> {
        match self.kv.get(&format!("seed/{id}"))? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// True if the exact seed bytes were ever issued and already resolved.
    pub fn seed_already_used(&self, seed: &[u8; 32]) -> Result<bool, JuiceError> {
        for (_, bytes) in self.kv.list("seed/")? {
            let record: SeedRecord = Self::decode(&bytes)?;
            if record.seed == *seed && record.resolved {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Drop seed records whose refusal window has closed, resolved or not.
    pub fn prune_seeds(&self, now: TimestampMs) -> Result<(), JuiceError> {
        for (key, bytes) in self.kv.list("seed/")? {
            let record: SeedRecord = Self::decode(&bytes)?;
            if record.window_closes_ms <= now {
                self.kv.delete(&key)?;
            }
        }
        Ok(())
    }

    // ── Write-ahead journal ──────────────────────────────────────────────────

    pub fn append_journal(
        &self,
        id: &TransactionId,
        seq: u32,
        record: &[u8],
    ) -> Result<(), JuiceError> {
        self.kv.put(&format!("journal/{id}/{seq:06}"), record)
    }

    pub fn journal_entries(&self, id: &TransactionId) -> Result<Vec<Vec<u8>>, JuiceError> {
        Ok(self
            .kv
            .list(&format!("journal/{id}/"))?
            .into_iter()
            .map(|(_, v)| v)
            .collect())
    }

    /// All transaction ids that still hold journal records.
    pub fn journaled_transactions(&self) -> Result<Vec<TransactionId>, JuiceError> {
        let mut out = Vec::new();
        for (key, _) in self.kv.list("journal/")? {
            let id_part = key
                .strip_prefix("journal/")
                .and_then(|rest| rest.split('/').next())
                .unwrap_or_default();
            if let Ok(uuid) = id_part.parse() {
                let id = TransactionId(uuid);
                if !out.contains(&id) {
                    out.push(id);
                }
            }
        }
        Ok(out)
    }

    pub fn clear_journal(&self, id: &TransactionId) -> Result<(), JuiceError> {
        for (key, _) in self.kv.list(&format!("journal/{id}/"))? {
            self.kv.delete(&key)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn store() -> TokenStore {
        TokenStore::new(Arc::new(MemoryKv::new()))
    }

    fn owner(n: u8) -> OwnerId {
        OwnerId::from_bytes([n; 32])
    }

    #[test]
    fn token_round_trip() {
        let s = store();
        let t = Token::create("NL-AMS-001", 1, 50, owner(1), 1_000, None).unwrap();
        s.put_token(&t).unwrap();
        assert_eq!(s.get_token(&t.token_id).unwrap().unwrap(), t);
    }

    #[test]
    fn telomeer_integrity_checked_on_load() {
        let s = store();
        let t = Token::create("NL-AMS-001", 1, 5, owner(1), 1_000, None).unwrap();
        let mut telomeer = Telomeer::genesis(t.token_id, owner(1));
        s.put_telomeer(&telomeer).unwrap();
        assert!(s.get_telomeer(&t.token_id).unwrap().is_some());

        // Corrupt the stored head.
        telomeer.head[0] ^= 0xFF;
        s.put_telomeer(&telomeer).unwrap();
        assert!(matches!(
            s.get_telomeer(&t.token_id),
            Err(JuiceError::HistoryTampered)
        ));
    }

    #[test]
    fn ownership_scan() {
        let s = store();
        for (n, who) in [(1u64, owner(1)), (2, owner(1)), (3, owner(2))] {
            let t = Token::create("NL-AMS-001", n, 10, owner(9), 1_000, None).unwrap();
            s.put_token(&t).unwrap();
            s.put_telomeer(&Telomeer::genesis(t.token_id, who)).unwrap();
        }
        assert_eq!(s.tokens_owned_by(&owner(1)).unwrap().len(), 2);
        assert_eq!(s.tokens_owned_by(&owner(2)).unwrap().len(), 1);
    }

    #[test]
    fn seed_window_replay_detection() {
        let s = store();
        let record = SeedRecord {
            transaction_id: TransactionId::generate(),
            seed: [7u8; 32],
            issued_ms: 1_000,
            resolved: true,
            window_closes_ms: 151_000,
        };
        s.put_seed(&record).unwrap();
        assert!(s.seed_already_used(&[7u8; 32]).unwrap());
        assert!(!s.seed_already_used(&[8u8; 32]).unwrap());

        // Window still open at 150s, closed at 152s.
        s.prune_seeds(150_000).unwrap();
        assert!(s.seed_already_used(&[7u8; 32]).unwrap());
        s.prune_seeds(152_000).unwrap();
        assert!(!s.seed_already_used(&[7u8; 32]).unwrap());
    }

    #[test]
    fn journal_lifecycle() {
        let s = store();
        let id = TransactionId::generate();
        s.append_journal(&id, 0, b"reserve").unwrap();
        s.append_journal(&id, 1, b"commit-point").unwrap();
        assert_eq!(s.journal_entries(&id).unwrap().len(), 2);
        assert_eq!(s.journaled_transactions().unwrap(), vec![id]);

        s.clear_journal(&id).unwrap();
        assert!(s.journal_entries(&id).unwrap().is_empty());
        assert!(s.journaled_transactions().unwrap().is_empty());
    }
}
