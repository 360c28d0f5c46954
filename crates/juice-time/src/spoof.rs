use std::collections::VecDeque;

use juice_core::constants::{CONSENSUS_DEVIATION_MS, JUMP_THRESHOLD_MS};
use juice_core::types::TimestampMs;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::source::TimeSourceReading;

/// Spoofing signals. Any flag marks the integrity status COMPROMISED.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpoofKind {
    /// Consensus timestamp moved more than 60s beyond wall progress in one
    /// step.
    Jump,
    /// Consensus clock rate deviates abnormally from wall rate.
    Drift,
    /// Sources disagree by more than the consensus deviation band.
    Inconsistency,
    /// The same consensus timestamp observed twice in a row.
    Repeated,
    /// Three or more identical consecutive consensus deltas.
    Pattern,
}

/// Observed drift ratio beyond ±10% of wall rate flags DRIFT.
const DRIFT_TOLERANCE_PERMILLE: u64 = 100;

/// Minimum wall interval before a drift ratio is meaningful.
const DRIFT_MIN_INTERVAL_MS: u64 = 1_000;

const HISTORY_CAP: usize = 16;

/// Stateful detector fed one consensus observation per integrity query.
/// `wall_ms` is a monotonic local reference (elapsed milliseconds), not a
/// timestamp the adversary controls.
#[derive(Default)]
pub struct SpoofDetector {
    history: VecDeque<(TimestampMs, u64)>,
}

impl SpoofDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(
        &mut self,
        consensus_ms: TimestampMs,
        wall_ms: u64,
        readings: &[TimeSourceReading],
    ) -> Vec<SpoofKind> {
        let mut flags = Vec::new();

        if let Some(kind) = self.check_inconsistency(readings) {
            flags.push(kind);
        }

        if let Some(&(prev_consensus, prev_wall)) = self.history.back() {
            let consensus_delta = consensus_ms.abs_diff(prev_consensus);
            let wall_delta = wall_ms.saturating_sub(prev_wall);

            if consensus_ms == prev_consensus {
                flags.push(SpoofKind::Repeated);
            }
            if consensus_delta.abs_diff(wall_delta) > JUMP_THRESHOLD_MS {
                flags.push(SpoofKind::Jump);
            } else if wall_delta >= DRIFT_MIN_INTERVAL_MS {
                let permille_off = consensus_delta.abs_diff(wall_delta) * 1_000 / wall_delta;
                if permille_off > DRIFT_TOLERANCE_PERMILLE {
                    flags.push(SpoofKind::Drift);
                }
            }
        }

        if let Some(kind) = self.check_pattern(consensus_ms) {
            flags.push(kind);
        }

        self.history.push_back((consensus_ms, wall_ms));
        if self.history.len() > HISTORY_CAP {
            self.history.pop_front();
        }

        if !flags.is_empty() {
            warn!(?flags, consensus_ms, "time spoofing signals detected");
        }
        flags
    }

    fn check_inconsistency(&self, readings: &[TimeSourceReading]) -> Option<SpoofKind> {
        let min = readings.iter().map(|r| r.timestamp_ms).min()?;
        let max = readings.iter().map(|r| r.timestamp_ms).max()?;
        (max - min > CONSENSUS_DEVIATION_MS).then_some(SpoofKind::Inconsistency)
    }

    /// Three identical consecutive non-zero deltas, ending at the incoming
    /// observation.
    fn check_pattern(&self, consensus_ms: TimestampMs) -> Option<SpoofKind> {
        if self.history.len() < 3 {
            return None;
        }
        let mut recent: Vec<TimestampMs> = self
            .history
            .iter()
            .rev()
            .take(3)
            .map(|&(c, _)| c)
            .collect();
        recent.reverse();
        let deltas = [
            recent[1].abs_diff(recent[0]),
            recent[2].abs_diff(recent[1]),
            consensus_ms.abs_diff(recent[2]),
        ];
        (deltas[0] != 0 && deltas[0] == deltas[1] && deltas[1] == deltas[2])
            .then_some(SpoofKind::Pattern)
    }
}
