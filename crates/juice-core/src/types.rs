use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unix timestamp in milliseconds (UTC).
pub type TimestampMs = u64;

/// Issuance scope identifier. An opaque interned string (the upstream
/// LOCATION-REFERENCE format is never parsed, only compared).
pub type IssuanceId = String;

// ── TokenId ──────────────────────────────────────────────────────────────────

/// 32-byte token identifier: SHA-256 over the issuance triple
/// `(issuance_id, sequence_number, creation_time_ms)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenId(pub [u8; 32]);

impl TokenId {
    pub fn from_bytes(b: [u8; 32]) -> Self {
        Self(b)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes[..32]);
        Ok(Self(arr))
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenId({}…)", &self.to_hex()[..16])
    }
}

// ── TransactionId ────────────────────────────────────────────────────────────

/// Transaction identifier: UUID v4, chosen by the receiver with the seed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub Uuid);

impl TransactionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn from_bytes(b: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(b))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({})", self.0)
    }
}

// ── OwnerId ──────────────────────────────────────────────────────────────────

/// A participant's public-key fingerprint: the raw 32-byte Ed25519
/// verifying key. Telomeers store this plaintext for the current owner and
/// SHA-256 hashes of it for earlier owners.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerId(pub [u8; 32]);

impl OwnerId {
    pub fn from_bytes(b: [u8; 32]) -> Self {
        Self(b)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Base-58 encoded string representation.
    pub fn to_b58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }

    pub fn from_b58(s: &str) -> Result<Self, bs58::decode::Error> {
        let bytes = bs58::decode(s).into_vec()?;
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes[..32]);
        Ok(Self(arr))
    }

    /// SHA-256 of the fingerprint, as stored in Telomeer histories.
    pub fn hashed(&self) -> OwnerHash {
        OwnerHash(sha256(&self.0))
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_b58())
    }
}

impl fmt::Debug for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnerId({})", &self.to_b58()[..8])
    }
}

// ── OwnerHash ────────────────────────────────────────────────────────────────

/// SHA-256 of an owner fingerprint. Telomeer history entries are either a
/// single owner's hash or a composite hash over a folded group.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerHash(pub [u8; 32]);

impl OwnerHash {
    pub fn zero() -> Self {
        Self([0u8; 32])
    }

    pub fn from_bytes(b: [u8; 32]) -> Self {
        Self(b)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for OwnerHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnerHash({}…)", &self.to_hex()[..16])
    }
}

// ── Signature ────────────────────────────────────────────────────────────────

/// Detached signature (64 bytes Ed25519 on the wire; the HMAC test signer
/// produces the same width).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(pub Vec<u8>);

impl Signature {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}b)", self.0.len())
    }
}

// ── Amount ───────────────────────────────────────────────────────────────────

/// A transfer amount: whole denomination units plus a sub-unit fraction in
/// cents. Only WisselToken buffers ever hold the fractional part.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amount {
    pub units: u64,
    /// 0..=99.
    pub cents: u8,
}

impl Amount {
    pub fn from_units(units: u64) -> Self {
        Self { units, cents: 0 }
    }

    pub fn new(units: u64, cents: u8) -> Self {
        debug_assert!(cents < 100);
        Self { units, cents }
    }

    pub fn total_cents(&self) -> u128 {
        self.units as u128 * 100 + self.cents as u128
    }

    pub fn is_zero(&self) -> bool {
        self.units == 0 && self.cents == 0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.units, self.cents)
    }
}

// ── Hash helpers ─────────────────────────────────────────────────────────────

/// SHA-256 of arbitrary bytes → 32-byte array. The only hash function in
/// the protocol; Telomeer folding, chain heads, and commitments all use it.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut h = Sha256::new();
    h.update(data);
    h.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_id_b58_round_trip() {
        let id = OwnerId::from_bytes([7u8; 32]);
        let s = id.to_b58();
        assert_eq!(OwnerId::from_b58(&s).unwrap(), id);
    }

    #[test]
    fn amount_total_cents() {
        assert_eq!(Amount::new(10, 25).total_cents(), 1025);
        assert_eq!(Amount::from_units(500).total_cents(), 50_000);
    }

    #[test]
    fn transaction_id_bytes_round_trip() {
        let id = TransactionId::generate();
        assert_eq!(TransactionId::from_bytes(*id.as_bytes()), id);
    }
}
