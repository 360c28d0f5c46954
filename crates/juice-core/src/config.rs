use crate::constants::{
    BASE_RETRY_MS, EXPIRY_WARNING_DAYS, IDEAL_COUNTS, ISSUANCE_MIN, MAX_CLOCK_SKEW_MS,
    MAX_HISTORY, MAX_RETRIES, MIN_TX_CONFIDENCE, RENEWAL_VALIDITY_DAYS, RESOLUTION_WINDOW_MS,
    TX_TIMEOUT_MS,
};

/// Default facilitator reward: one fifth of the expired value processed,
/// rounded down.
fn default_facilitation_reward(expired_value: u64) -> u64 {
    expired_value / 5
}

/// Every overridable protocol threshold, passed by handle to whichever
/// component needs it. There is no process-global configuration.
#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    /// Per-phase transaction deadline (ms).
    pub tx_timeout_ms: u64,
    /// Commitment delivery retries after the point of no return.
    pub max_retries: u32,
    /// Base delay for exponential retry backoff (ms).
    pub base_retry_ms: u64,
    /// Inconclusive-transaction resolution window (ms).
    pub resolution_window_ms: u64,
    /// Maximum tolerated peer clock skew (ms).
    pub max_clock_skew_ms: u64,
    /// Days before expiry at which renewal notifications fire.
    pub expiry_warning_days: u64,
    /// Validity of a renewed token (days).
    pub renewal_validity_days: u64,
    /// Telomeer history bound before folding.
    pub max_history: usize,
    /// Issuance tail size protected by the all-or-nothing rule.
    pub issuance_min: usize,
    /// Minimum time-attestation confidence to commit.
    pub min_tx_confidence: u8,
    /// Ideal holding per denomination, aligned with `DENOMINATIONS`.
    pub ideal_counts: [u32; 9],
    /// Facilitator reward for shepherding a renewal, from expired value.
    pub facilitation_reward: fn(u64) -> u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tx_timeout_ms: TX_TIMEOUT_MS,
            max_retries: MAX_RETRIES,
            base_retry_ms: BASE_RETRY_MS,
            resolution_window_ms: RESOLUTION_WINDOW_MS,
            max_clock_skew_ms: MAX_CLOCK_SKEW_MS,
            expiry_warning_days: EXPIRY_WARNING_DAYS,
            renewal_validity_days: RENEWAL_VALIDITY_DAYS,
            max_history: MAX_HISTORY,
            issuance_min: ISSUANCE_MIN,
            min_tx_confidence: MIN_TX_CONFIDENCE,
            ideal_counts: IDEAL_COUNTS,
            facilitation_reward: default_facilitation_reward,
        }
    }
}

impl EngineConfig {
    /// How long a resolved seed stays in the replay-refusal window.
    pub fn seed_window_ms(&self) -> u64 {
        self.tx_timeout_ms + 2 * self.max_clock_skew_ms
    }

    /// Exponential backoff delay for retry attempt `n` (0-based).
    pub fn retry_delay_ms(&self, n: u32) -> u64 {
        self.base_retry_ms.saturating_mul(1u64 << n.min(16))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.tx_timeout_ms, 30_000);
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.seed_window_ms(), 30_000 + 120_000);
    }

    #[test]
    fn retry_backoff_doubles() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.retry_delay_ms(0), 500);
        assert_eq!(cfg.retry_delay_ms(1), 1_000);
        assert_eq!(cfg.retry_delay_ms(2), 2_000);
    }

    #[test]
    fn default_reward_rounds_down() {
        let cfg = EngineConfig::default();
        assert_eq!((cfg.facilitation_reward)(101), 20);
    }
}
