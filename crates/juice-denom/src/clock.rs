use juice_core::token::{Denomination, Token};
use serde::{Deserialize, Serialize};

// ── DenominationStatus ───────────────────────────────────────────────────────

/// 2-bit per-denomination portfolio status, derived from actual vs. ideal
/// holdings. Lower values are needier; selection serves them first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DenominationStatus {
    Lack = 0,
    SlightlyWanting = 1,
    Good = 2,
    Abundance = 3,
}

impl DenominationStatus {
    /// Status bands (integer arithmetic, no rounding drift):
    /// `c == 0` or `c < ideal/2` → LACK; `ideal/2 ≤ c < ideal` →
    /// SLIGHTLY_WANTING; `ideal ≤ c ≤ 1.5·ideal` → GOOD; above → ABUNDANCE.
    pub fn from_counts(current: u32, ideal: u32) -> Self {
        if ideal == 0 {
            // No target for this denomination: anything held is plenty.
            return if current == 0 {
                DenominationStatus::Good
            } else {
                DenominationStatus::Abundance
            };
        }
        if 2 * current < ideal {
            DenominationStatus::Lack
        } else if current < ideal {
            DenominationStatus::SlightlyWanting
        } else if 2 * current <= 3 * ideal {
            DenominationStatus::Good
        } else {
            DenominationStatus::Abundance
        }
    }

    fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0 => DenominationStatus::Lack,
            1 => DenominationStatus::SlightlyWanting,
            2 => DenominationStatus::Good,
            _ => DenominationStatus::Abundance,
        }
    }
}

// ── DenominationVectorClock ──────────────────────────────────────────────────

/// A user's per-denomination surplus/need snapshot, exchanged during the
/// transaction handshake to drive mutually-beneficial token selection.
/// Packs into a u32 (nine 2-bit lanes) on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenominationVectorClock {
    statuses: [DenominationStatus; 9],
}

impl DenominationVectorClock {
    pub fn from_counts(counts: &[u32; 9], ideals: &[u32; 9]) -> Self {
        let mut statuses = [DenominationStatus::Lack; 9];
        for i in 0..9 {
            statuses[i] = DenominationStatus::from_counts(counts[i], ideals[i]);
        }
        Self { statuses }
    }

    /// Snapshot over a holding set; counts every token regardless of
    /// status so reservations do not flap the clock mid-transaction.
    pub fn from_tokens<'a, I>(tokens: I, ideals: &[u32; 9]) -> Self
    where
        I: IntoIterator<Item = &'a Token>,
    {
        let mut counts = [0u32; 9];
        for t in tokens {
            counts[t.denomination.index()] += 1;
        }
        Self::from_counts(&counts, ideals)
    }

    pub fn status(&self, d: Denomination) -> DenominationStatus {
        self.statuses[d.index()]
    }

    /// Wire encoding: lane `i` occupies bits `2i..2i+2`.
    pub fn pack(&self) -> u32 {
        self.statuses
            .iter()
            .enumerate()
            .fold(0u32, |acc, (i, s)| acc | ((*s as u32) << (2 * i)))
    }

    pub fn unpack(packed: u32) -> Self {
        let mut statuses = [DenominationStatus::Lack; 9];
        for (i, s) in statuses.iter_mut().enumerate() {
            *s = DenominationStatus::from_bits(packed >> (2 * i));
        }
        Self { statuses }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use juice_core::constants::IDEAL_COUNTS;

    #[test]
    fn status_bands() {
        // ideal = 5
        assert_eq!(DenominationStatus::from_counts(0, 5), DenominationStatus::Lack);
        assert_eq!(DenominationStatus::from_counts(2, 5), DenominationStatus::Lack);
        assert_eq!(
            DenominationStatus::from_counts(3, 5),
            DenominationStatus::SlightlyWanting
        );
        assert_eq!(
            DenominationStatus::from_counts(4, 5),
            DenominationStatus::SlightlyWanting
        );
        assert_eq!(DenominationStatus::from_counts(5, 5), DenominationStatus::Good);
        assert_eq!(DenominationStatus::from_counts(7, 5), DenominationStatus::Good);
        assert_eq!(
            DenominationStatus::from_counts(8, 5),
            DenominationStatus::Abundance
        );
    }

    #[test]
    fn half_ideal_boundary_exact() {
        // ideal = 4: exactly half (2) is SLIGHTLY_WANTING, below is LACK.
        assert_eq!(DenominationStatus::from_counts(1, 4), DenominationStatus::Lack);
        assert_eq!(
            DenominationStatus::from_counts(2, 4),
            DenominationStatus::SlightlyWanting
        );
        // 1.5 * 4 = 6 is still GOOD.
        assert_eq!(DenominationStatus::from_counts(6, 4), DenominationStatus::Good);
        assert_eq!(
            DenominationStatus::from_counts(7, 4),
            DenominationStatus::Abundance
        );
    }

    #[test]
    fn pack_unpack_round_trip() {
        let clock = DenominationVectorClock::from_counts(
            &[0, 1, 3, 5, 8, 2, 0, 9, 1],
            &IDEAL_COUNTS,
        );
        assert_eq!(DenominationVectorClock::unpack(clock.pack()), clock);
    }

    #[test]
    fn pack_uses_two_bits_per_lane() {
        let clock = DenominationVectorClock::from_counts(&[9; 9], &IDEAL_COUNTS);
        // Everything abundant: all lanes 0b11 → 18 set bits.
        assert_eq!(clock.pack(), 0b11_11_11_11_11_11_11_11_11);
    }
}
