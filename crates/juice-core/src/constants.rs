//! ─── JuiceTokens Protocol Constants ─────────────────────────────────────────
//!
//! Offline-capable denominated token exchange between mutually-distrusting
//! peers. Every threshold here is the normative default; `EngineConfig`
//! carries the overridable copies.

// ── Denominations ────────────────────────────────────────────────────────────

/// The normative denomination set. Any other value is a hard parse error.
pub const DENOMINATIONS: [u64; 9] = [1, 2, 5, 10, 20, 50, 100, 200, 500];

/// Default ideal holding per denomination, aligned index-for-index with
/// `DENOMINATIONS`: roughly five of each low denomination, decreasing for
/// higher ones.
pub const IDEAL_COUNTS: [u32; 9] = [5, 5, 5, 5, 3, 3, 2, 2, 1];

// ── Telomeer ─────────────────────────────────────────────────────────────────

/// Maximum raw entries retained in a Telomeer's hash history before the
/// oldest entries are folded into a composite.
pub const MAX_HISTORY: usize = 10;

// ── Issuance tail protection ─────────────────────────────────────────────────

/// Minimum tokens of an issuance a user keeps unless spending the whole
/// tail (the "all or nothing for tail" rule guarding the WisselToken).
pub const ISSUANCE_MIN: usize = 2;

// ── Transaction timing ───────────────────────────────────────────────────────

/// Deadline for each transaction phase before the abort path triggers.
pub const TX_TIMEOUT_MS: u64 = 30_000;

/// Commitment delivery retries after the point of no return.
pub const MAX_RETRIES: u32 = 3;

/// Base delay for exponential retry backoff.
pub const BASE_RETRY_MS: u64 = 500;

/// How long an inconclusive sender polls the attestation store for the
/// receiver's finalization before rolling back.
pub const RESOLUTION_WINDOW_MS: u64 = 5 * 60 * 1_000;

/// Maximum tolerated clock skew between peers. Seed replay windows are
/// retained for `timeout + 2 * MAX_CLOCK_SKEW_MS`.
pub const MAX_CLOCK_SKEW_MS: u64 = 60_000;

// ── Time attestation ─────────────────────────────────────────────────────────

/// Minimum consensus confidence required to commit a transaction.
pub const MIN_TX_CONFIDENCE: u8 = 60;

/// Deviation band for VERIFIED time status.
pub const VERIFIED_DEVIATION_MS: u64 = 1_000;

/// Deviation band for CONSENSUS time status; at or above this the status
/// is INADEQUATE.
pub const CONSENSUS_DEVIATION_MS: u64 = 5_000;

/// Single-step consensus jump flagged as spoofing.
pub const JUMP_THRESHOLD_MS: u64 = 60_000;

// ── Lifecycle ────────────────────────────────────────────────────────────────

/// Days before `expiry_time_ms` at which expiry notifications fire.
pub const EXPIRY_WARNING_DAYS: u64 = 7;

pub const MS_PER_DAY: u64 = 24 * 3600 * 1_000;

/// Validity of a renewed token.
pub const RENEWAL_VALIDITY_DAYS: u64 = 365;

/// Default incubation duration when the hatching condition does not imply
/// its own schedule.
pub const DEFAULT_INCUBATION_MS: u64 = 72 * 3600 * 1_000;

// ── Wire protocol ────────────────────────────────────────────────────────────

pub const PROTOCOL_VERSION: u8 = 1;

/// Transaction envelope body tags.
pub const BODY_TAG_SEED: u8 = 1;
pub const BODY_TAG_INITIATION: u8 = 2;
pub const BODY_TAG_PREPARATION: u8 = 3;
pub const BODY_TAG_COMMITMENT: u8 = 4;
pub const BODY_TAG_FINALIZATION: u8 = 5;
pub const BODY_TAG_ABORT: u8 = 6;
