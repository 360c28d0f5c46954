use std::sync::Mutex;
use std::time::Instant;

use juice_core::constants::{CONSENSUS_DEVIATION_MS, VERIFIED_DEVIATION_MS};
use juice_core::types::TimestampMs;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::source::{SourceType, TimeSource, TimeSourceReading};
use crate::spoof::{SpoofDetector, SpoofKind};

// ── TimeStatus ───────────────────────────────────────────────────────────────

/// Integrity classification of a consensus timestamp.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeStatus {
    /// Primary sources up, deviations under one second.
    Verified,
    /// Degraded: primaries down or deviations between the bands.
    Consensus,
    /// Deviations at or above five seconds.
    Inadequate,
    /// Spoofing signals present. Transactions must refuse to commit.
    Compromised,
}

impl std::fmt::Display for TimeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TimeStatus::Verified => "VERIFIED",
            TimeStatus::Consensus => "CONSENSUS",
            TimeStatus::Inadequate => "INADEQUATE",
            TimeStatus::Compromised => "COMPROMISED",
        };
        write!(f, "{s}")
    }
}

// ── Weights ──────────────────────────────────────────────────────────────────

/// Per-source weights for the confidence combination. The combination is a
/// weighted mean; the weights are deliberately configurable because the
/// upstream semantics for mixing TEE-backed source types are only implied.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TimeWeights {
    pub system: u32,
    pub ntp: u32,
    pub gnss: u32,
    pub consensus: u32,
    pub tsa: u32,
}

impl Default for TimeWeights {
    fn default() -> Self {
        Self {
            system: 60,
            ntp: 80,
            gnss: 90,
            consensus: 70,
            tsa: 95,
        }
    }
}

impl TimeWeights {
    fn weight(&self, source: SourceType) -> u32 {
        match source {
            SourceType::System => self.system,
            SourceType::Ntp => self.ntp,
            SourceType::Gnss => self.gnss,
            SourceType::Consensus => self.consensus,
            SourceType::Tsa => self.tsa,
        }
    }
}

// ── TimeIntegrity ────────────────────────────────────────────────────────────

/// Result of an integrity query.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeIntegrity {
    pub consensus_ms: TimestampMs,
    /// Weighted-mean confidence, 0..=100.
    pub confidence: u8,
    pub status: TimeStatus,
    pub flags: Vec<SpoofKind>,
}

// ── TimeAuthority ────────────────────────────────────────────────────────────

/// Aggregates all configured time sources into a consensus timestamp with
/// a confidence score and spoof detection.
pub struct TimeAuthority {
    sources: Vec<Box<dyn TimeSource>>,
    weights: TimeWeights,
    detector: Mutex<SpoofDetector>,
    started: Instant,
}

impl TimeAuthority {
    pub fn new(sources: Vec<Box<dyn TimeSource>>, weights: TimeWeights) -> Self {
        Self {
            sources,
            weights,
            detector: Mutex::new(SpoofDetector::new()),
            started: Instant::now(),
        }
    }

    /// An authority backed only by the local system clock.
    pub fn system() -> Self {
        Self::new(
            vec![Box::new(crate::source::SystemTimeSource)],
            TimeWeights::default(),
        )
    }

    /// Sample every source and classify the result.
    pub fn integrity(&self) -> TimeIntegrity {
        let readings: Vec<TimeSourceReading> =
            self.sources.iter().map(|s| s.sample()).collect();
        self.classify(&readings)
    }

    /// Consensus timestamp only; status checks happen at commit points.
    pub fn now_ms(&self) -> TimestampMs {
        self.integrity().consensus_ms
    }

    fn classify(&self, readings: &[TimeSourceReading]) -> TimeIntegrity {
        if readings.is_empty() {
            return TimeIntegrity {
                consensus_ms: 0,
                confidence: 0,
                status: TimeStatus::Inadequate,
                flags: Vec::new(),
            };
        }

        let mut stamps: Vec<TimestampMs> = readings.iter().map(|r| r.timestamp_ms).collect();
        stamps.sort_unstable();
        let consensus_ms = stamps[stamps.len() / 2];

        let deviation = stamps
            .iter()
            .map(|&s| s.abs_diff(consensus_ms))
            .max()
            .unwrap_or(0);

        let weight_sum: u64 = readings
            .iter()
            .map(|r| self.weights.weight(r.source) as u64)
            .sum();
        let confidence = if weight_sum == 0 {
            0
        } else {
            let weighted: u64 = readings
                .iter()
                .map(|r| r.confidence as u64 * self.weights.weight(r.source) as u64)
                .sum();
            (weighted / weight_sum) as u8
        };

        let wall_ms = self.started.elapsed().as_millis() as u64;
        let flags = self
            .detector
            .lock()
            .expect("spoof detector lock")
            .observe(consensus_ms, wall_ms, readings);

        let primaries_up = readings.iter().any(|r| r.source.is_primary());
        let status = if !flags.is_empty() {
            TimeStatus::Compromised
        } else if deviation >= CONSENSUS_DEVIATION_MS {
            TimeStatus::Inadequate
        } else if primaries_up && deviation < VERIFIED_DEVIATION_MS {
            TimeStatus::Verified
        } else {
            TimeStatus::Consensus
        };

        debug!(consensus_ms, confidence, %status, "time integrity query");
        TimeIntegrity {
            consensus_ms,
            confidence,
            status,
            flags,
        }
    }

    /// Whether a transaction may commit under this integrity result.
    pub fn permits_commit(integrity: &TimeIntegrity, min_confidence: u8) -> bool {
        integrity.status != TimeStatus::Compromised && integrity.confidence >= min_confidence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::FixedTimeSource;

    fn authority(sources: Vec<Box<dyn TimeSource>>) -> TimeAuthority {
        TimeAuthority::new(sources, TimeWeights::default())
    }

    #[test]
    fn verified_when_primaries_agree() {
        let auth = authority(vec![
            Box::new(FixedTimeSource::at(SourceType::System, 1_000_000, 60)),
            Box::new(FixedTimeSource::at(SourceType::Ntp, 1_000_200, 85)),
            Box::new(FixedTimeSource::at(SourceType::Gnss, 1_000_400, 95)),
        ]);
        let integrity = auth.integrity();
        assert_eq!(integrity.status, TimeStatus::Verified);
        assert_eq!(integrity.consensus_ms, 1_000_200, "median of three");
        assert!(integrity.confidence >= 60);
    }

    #[test]
    fn consensus_when_primaries_down() {
        let auth = authority(vec![
            Box::new(FixedTimeSource::at(SourceType::System, 1_000_000, 60)),
            Box::new(FixedTimeSource::at(SourceType::Consensus, 1_002_000, 70)),
        ]);
        assert_eq!(auth.integrity().status, TimeStatus::Consensus);
    }

    #[test]
    fn large_spread_compromises() {
        let auth = authority(vec![
            Box::new(FixedTimeSource::at(SourceType::Ntp, 1_000_000, 85)),
            Box::new(FixedTimeSource::at(SourceType::Gnss, 1_000_000, 95)),
            Box::new(FixedTimeSource::at(SourceType::System, 1_008_000, 60)),
        ]);
        // An 8s source spread raises the INCONSISTENCY flag, which
        // dominates the deviation-band classification.
        let integrity = auth.integrity();
        assert_eq!(integrity.status, TimeStatus::Compromised);
        assert!(integrity.flags.contains(&SpoofKind::Inconsistency));
        assert!(!TimeAuthority::permits_commit(&integrity, 60));
    }

    #[test]
    fn inadequate_without_spoof_flags() {
        // INADEQUATE needs a deviation of at least 5s from the median
        // while the pairwise spread stays at or under 5s (the strict
        // inconsistency threshold). A two-source 5s gap sits exactly on
        // both boundaries.
        let auth = authority(vec![
            Box::new(FixedTimeSource::at(SourceType::Ntp, 1_000_000, 85)),
            Box::new(FixedTimeSource::at(SourceType::Gnss, 1_005_000, 95)),
        ]);
        let integrity = auth.integrity();
        assert_eq!(integrity.status, TimeStatus::Inadequate);
        assert!(integrity.flags.is_empty());
    }

    #[test]
    fn compromised_blocks_commit() {
        let auth = authority(vec![Box::new(FixedTimeSource::at(
            SourceType::Ntp,
            1_000_000,
            90,
        ))]);
        let first = auth.integrity();
        assert_eq!(first.status, TimeStatus::Verified);
        // Identical timestamp on the next query: REPEATED → COMPROMISED.
        let second = auth.integrity();
        assert_eq!(second.status, TimeStatus::Compromised);
        assert!(!TimeAuthority::permits_commit(&second, 60));
    }

    #[test]
    fn low_confidence_blocks_commit() {
        let auth = authority(vec![Box::new(FixedTimeSource::at(
            SourceType::System,
            1_000_000,
            30,
        ))]);
        let integrity = auth.integrity();
        assert!(!TimeAuthority::permits_commit(&integrity, 60));
    }

    #[test]
    fn weighted_confidence_mean() {
        let auth = authority(vec![
            Box::new(FixedTimeSource::at(SourceType::System, 1_000_000, 100)),
            Box::new(FixedTimeSource::at(SourceType::Tsa, 1_000_000, 100)),
        ]);
        // Equal confidences: the weighted mean is still 100 regardless of
        // weights. A REPEATED flag needs two queries, so only query once.
        assert_eq!(auth.integrity().confidence, 100);
    }
}
