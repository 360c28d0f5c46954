use serde::{Deserialize, Serialize};

use crate::error::JuiceError;
use crate::types::{sha256, IssuanceId, OwnerId, TimestampMs, TokenId};

// ── Denomination ─────────────────────────────────────────────────────────────

/// One of the nine legal token denominations. Constructing any other value
/// fails; wire decoding treats it as a hard parse error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub enum Denomination {
    One,
    Two,
    Five,
    Ten,
    Twenty,
    Fifty,
    Hundred,
    TwoHundred,
    FiveHundred,
}

impl Denomination {
    /// All denominations, ascending.
    pub const ALL: [Denomination; 9] = [
        Denomination::One,
        Denomination::Two,
        Denomination::Five,
        Denomination::Ten,
        Denomination::Twenty,
        Denomination::Fifty,
        Denomination::Hundred,
        Denomination::TwoHundred,
        Denomination::FiveHundred,
    ];

    pub fn value(&self) -> u64 {
        match self {
            Denomination::One => 1,
            Denomination::Two => 2,
            Denomination::Five => 5,
            Denomination::Ten => 10,
            Denomination::Twenty => 20,
            Denomination::Fifty => 50,
            Denomination::Hundred => 100,
            Denomination::TwoHundred => 200,
            Denomination::FiveHundred => 500,
        }
    }

    /// Index into the denomination-aligned tables (ideal counts, vector
    /// clock lanes).
    pub fn index(&self) -> usize {
        Denomination::ALL.iter().position(|d| d == self).expect("ALL covers every variant")
    }
}

impl TryFrom<u64> for Denomination {
    type Error = JuiceError;

    fn try_from(v: u64) -> Result<Self, Self::Error> {
        Denomination::ALL
            .iter()
            .copied()
            .find(|d| d.value() == v)
            .ok_or(JuiceError::InvalidDenomination { got: v })
    }
}

impl From<Denomination> for u64 {
    fn from(d: Denomination) -> u64 {
        d.value()
    }
}

// ── TokenStatus ──────────────────────────────────────────────────────────────

/// Token lifecycle status. Legal transitions:
/// ACTIVE→RESERVED (pak built), RESERVED→ACTIVE (abort),
/// RESERVED→CONSUMED (commit), ACTIVE→EXPIRED (time), any→REVOKED.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenStatus {
    Active,
    Reserved,
    Expired,
    Revoked,
    Consumed,
}

impl TokenStatus {
    fn permits(&self, to: TokenStatus) -> bool {
        use TokenStatus::*;
        matches!(
            (self, to),
            (Active, Reserved)
                | (Reserved, Active)
                | (Reserved, Consumed)
                | (Active, Expired)
                | (_, Revoked)
        )
    }
}

// ── Token ────────────────────────────────────────────────────────────────────

/// A denominated token. Immutable after issuance except for `status`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Token {
    /// Stable opaque identifier derived from the issuance triple.
    pub token_id: TokenId,

    /// Issuance scope this token's sequence lives in.
    pub issuance_id: IssuanceId,

    /// Position within the issuance.
    pub sequence_number: u64,

    pub denomination: Denomination,

    pub issuer: OwnerId,

    pub creation_time_ms: TimestampMs,

    pub expiry_time_ms: Option<TimestampMs>,

    pub status: TokenStatus,
}

impl Token {
    /// Create a token. Fails with `InvalidDenomination` for any value
    /// outside the fixed set.
    pub fn create(
        issuance_id: &str,
        sequence_number: u64,
        denomination: u64,
        issuer: OwnerId,
        creation_time_ms: TimestampMs,
        expiry_time_ms: Option<TimestampMs>,
    ) -> Result<Self, JuiceError> {
        let denomination = Denomination::try_from(denomination)?;
        Ok(Self {
            token_id: derive_token_id(issuance_id, sequence_number, creation_time_ms),
            issuance_id: issuance_id.to_string(),
            sequence_number,
            denomination,
            issuer,
            creation_time_ms,
            expiry_time_ms,
            status: TokenStatus::Active,
        })
    }

    pub fn value(&self) -> u64 {
        self.denomination.value()
    }

    pub fn is_expired(&self, now: TimestampMs) -> bool {
        self.expiry_time_ms.map(|e| now >= e).unwrap_or(false)
    }

    /// Guarded status mutation; illegal transitions are errors, not panics.
    pub fn transition(&mut self, to: TokenStatus) -> Result<(), JuiceError> {
        if !self.status.permits(to) {
            return Err(JuiceError::InvalidStatusTransition {
                from: format!("{:?}", self.status),
                to: format!("{:?}", to),
            });
        }
        self.status = to;
        Ok(())
    }

    /// Whether this token may enter a pak right now.
    pub fn spendable(&self, now: TimestampMs) -> bool {
        self.status == TokenStatus::Active && !self.is_expired(now)
    }
}

/// token_id = SHA-256(issuance_id ‖ sequence LE ‖ creation_time LE).
pub fn derive_token_id(
    issuance_id: &str,
    sequence_number: u64,
    creation_time_ms: TimestampMs,
) -> TokenId {
    let mut buf = Vec::with_capacity(issuance_id.len() + 16);
    buf.extend_from_slice(issuance_id.as_bytes());
    buf.extend_from_slice(&sequence_number.to_le_bytes());
    buf.extend_from_slice(&creation_time_ms.to_le_bytes());
    TokenId(sha256(&buf))
}

// ── WisselToken ──────────────────────────────────────────────────────────────

/// A user's unique change token: wraps a base token and accumulates the
/// sub-unit rounding buffer (afrondingsbuffer) as integer cents.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WisselToken {
    pub token: Token,
    /// 0..=99 cents.
    afrondingsbuffer: u8,
}

impl WisselToken {
    pub fn new(token: Token) -> Self {
        Self {
            token,
            afrondingsbuffer: 0,
        }
    }

    pub fn buffer_cents(&self) -> u8 {
        self.afrondingsbuffer
    }

    /// Add `cents` to the buffer. Returns the whole-unit carry; the
    /// fractional remainder stays buffered. The buffer never reaches 1.00.
    pub fn credit(&mut self, cents: u64) -> u64 {
        let total = self.afrondingsbuffer as u64 + cents;
        self.afrondingsbuffer = (total % 100) as u8;
        total / 100
    }

    /// Remove `cents` from the buffer. Returns the whole units that must be
    /// borrowed into the transfer to cover the shortfall.
    pub fn debit(&mut self, cents: u64) -> u64 {
        let have = self.afrondingsbuffer as u64;
        if cents <= have {
            self.afrondingsbuffer = (have - cents) as u8;
            return 0;
        }
        let shortfall = cents - have;
        let borrow = shortfall.div_ceil(100);
        self.afrondingsbuffer = (borrow * 100 - shortfall) as u8;
        borrow
    }
}
