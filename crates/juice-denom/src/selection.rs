use std::collections::BTreeMap;

use juice_core::constants::ISSUANCE_MIN;
use juice_core::error::JuiceError;
use juice_core::token::{Denomination, Token};
use juice_core::types::{TimestampMs, TokenId};
use tracing::debug;

use crate::clock::{DenominationStatus, DenominationVectorClock};

// ── Inputs / outputs ─────────────────────────────────────────────────────────

/// A user's spendable portfolio as seen by the selector.
pub struct Holdings<'a> {
    pub tokens: &'a [Token],
    /// The base token of this user's WisselToken, if it sits in `tokens`.
    pub wissel_id: Option<TokenId>,
    pub now: TimestampMs,
}

impl<'a> Holdings<'a> {
    fn spendable(&self) -> Vec<&'a Token> {
        self.tokens.iter().filter(|t| t.spendable(self.now)).collect()
    }

    fn wissel(&self) -> Option<&'a Token> {
        let id = self.wissel_id?;
        self.tokens.iter().find(|t| t.token_id == id)
    }
}

/// A multiset of tokens paying a target amount, with the unavoidable
/// overshoot (paid back as change by the counterparty).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selection {
    pub token_ids: Vec<TokenId>,
    pub total: u64,
    pub overshoot: u64,
    pub includes_wissel: bool,
}

impl Selection {
    fn empty() -> Self {
        Self {
            token_ids: Vec::new(),
            total: 0,
            overshoot: 0,
            includes_wissel: false,
        }
    }
}

// ── Selection ────────────────────────────────────────────────────────────────

/// Pick tokens summing to `target` (or the smallest feasible overshoot),
/// optimizing the receiver's portfolio when their vector clock is known.
///
/// The WisselToken is the last token spendable from its issuance: it only
/// enters a selection when at most one other token of its issuance is
/// held, and then only together with that token. Regular issuances obey
/// the all-or-nothing tail rule: a selection never leaves an issuance
/// holding below `ISSUANCE_MIN` without emptying it.
pub fn select_tokens(
    holdings: &Holdings<'_>,
    target: u64,
    receiver_clock: Option<&DenominationVectorClock>,
    ideals: &[u32; 9],
) -> Result<Selection, JuiceError> {
    select_tokens_with_tail(holdings, target, receiver_clock, ideals, ISSUANCE_MIN)
}

/// `select_tokens` with an explicit issuance tail size (from
/// `EngineConfig`).
pub fn select_tokens_with_tail(
    holdings: &Holdings<'_>,
    target: u64,
    receiver_clock: Option<&DenominationVectorClock>,
    ideals: &[u32; 9],
    issuance_min: usize,
) -> Result<Selection, JuiceError> {
    if target == 0 {
        return Ok(Selection::empty());
    }

    let spendable = holdings.spendable();
    let sender_clock = DenominationVectorClock::from_tokens(spendable.iter().copied(), ideals);

    let wissel = holdings.wissel().filter(|w| w.spendable(holdings.now));
    let issuance_others: Vec<&Token> = wissel
        .map(|w| {
            spendable
                .iter()
                .copied()
                .filter(|t| t.issuance_id == w.issuance_id && t.token_id != w.token_id)
                .collect()
        })
        .unwrap_or_default();
    let wissel_allowed = wissel.is_some() && issuance_others.len() < issuance_min;

    let total_held: u64 = spendable.iter().map(|t| t.value()).sum();
    let sum_without_wissel: u64 =
        total_held - wissel.map(|w| w.value()).unwrap_or(0);

    // First pass excludes the WisselToken entirely.
    let primary = if sum_without_wissel >= target {
        run_phases(
            &spendable,
            wissel.map(|w| w.token_id),
            false,
            target,
            &sender_clock,
            receiver_clock,
        )
    } else {
        None
    };

    let mut best = primary;

    // Retry with the WisselToken when the first pass overshoots (or could
    // not cover the amount at all) and the tail rule permits spending it.
    let needs_retry = best.as_ref().map(|s| s.overshoot > 0).unwrap_or(true);
    if needs_retry && wissel_allowed && total_held >= target {
        if let Some(mut alt) = run_phases(
            &spendable,
            wissel.map(|w| w.token_id),
            true,
            target,
            &sender_clock,
            receiver_clock,
        ) {
            if alt.includes_wissel {
                // Spending the Wissel empties its issuance tail.
                for other in &issuance_others {
                    if !alt.token_ids.contains(&other.token_id) {
                        alt.token_ids.push(other.token_id);
                        alt.total += other.value();
                        alt.overshoot = alt.total - target;
                    }
                }
            }
            best = match best {
                Some(current) if current.overshoot <= alt.overshoot => Some(current),
                _ => Some(alt),
            };
        }
    }

    let mut selection = match best {
        Some(s) => s,
        None => {
            if wissel.is_some() && !wissel_allowed && total_held >= target {
                return Err(JuiceError::WisselTokenProtected);
            }
            return Err(JuiceError::InsufficientBalance {
                need: target,
                have: total_held,
            });
        }
    };

    enforce_issuance_tails(
        &mut selection,
        &spendable,
        wissel.map(|w| w.token_id),
        target,
        issuance_min,
    );
    debug!(
        target,
        total = selection.total,
        overshoot = selection.overshoot,
        count = selection.token_ids.len(),
        "token selection complete"
    );
    Ok(selection)
}

/// Phase 1 (receiver need) + phase 2 (greedy) + smallest-cover residual.
/// Returns `None` when the pool cannot cover the target.
fn run_phases(
    spendable: &[&Token],
    wissel_id: Option<TokenId>,
    include_wissel: bool,
    target: u64,
    sender_clock: &DenominationVectorClock,
    receiver_clock: Option<&DenominationVectorClock>,
) -> Option<Selection> {
    // Buckets per denomination, deterministic order within each.
    let mut buckets: BTreeMap<Denomination, Vec<&Token>> = BTreeMap::new();
    for &t in spendable {
        if !include_wissel && Some(t.token_id) == wissel_id {
            continue;
        }
        buckets.entry(t.denomination).or_default().push(t);
    }
    for bucket in buckets.values_mut() {
        bucket.sort_by_key(|t| (t.sequence_number, t.token_id));
    }

    let mut remaining = target;
    let mut picked: Vec<&Token> = Vec::new();

    // ── Phase 1: serve the receiver's needs ──────────────────────────────
    if let Some(rc) = receiver_clock {
        let mut order: Vec<Denomination> = buckets.keys().copied().collect();
        order.sort_by_key(|d| (rc.status(*d), std::cmp::Reverse(d.value())));

        for d in order {
            if remaining == 0 {
                break;
            }
            if d.value() > remaining {
                continue;
            }
            let avail = buckets.get(&d).map(|b| b.len() as u64).unwrap_or(0);
            if avail == 0 {
                continue;
            }
            let abundant = sender_clock.status(d) == DenominationStatus::Abundance;
            let cap = match rc.status(d) {
                DenominationStatus::Lack => {
                    if abundant {
                        avail
                    } else {
                        avail.div_ceil(2)
                    }
                }
                DenominationStatus::SlightlyWanting => {
                    if abundant {
                        avail.div_ceil(2)
                    } else {
                        avail.div_ceil(3)
                    }
                }
                _ => {
                    if abundant {
                        avail.div_ceil(4)
                    } else {
                        0
                    }
                }
            };
            let take = (remaining / d.value()).min(avail).min(cap);
            drain(&mut buckets, d, take, &mut picked, &mut remaining);
        }
    }

    // ── Phase 2: greedy, largest denomination first ──────────────────────
    for d in Denomination::ALL.iter().rev() {
        if remaining == 0 {
            break;
        }
        let avail = buckets.get(d).map(|b| b.len() as u64).unwrap_or(0);
        let take = (remaining / d.value()).min(avail);
        drain(&mut buckets, *d, take, &mut picked, &mut remaining);
    }

    // ── Residual: single smallest token covering what is left ────────────
    let mut overshoot = 0;
    if remaining > 0 {
        let d = Denomination::ALL.iter().copied().find(|d| {
            d.value() >= remaining && buckets.get(d).map(|b| !b.is_empty()).unwrap_or(false)
        })?;
        overshoot = d.value() - remaining;
        drain(&mut buckets, d, 1, &mut picked, &mut remaining);
    }

    let total: u64 = picked.iter().map(|t| t.value()).sum();
    let includes_wissel = wissel_id
        .map(|id| picked.iter().any(|t| t.token_id == id))
        .unwrap_or(false);
    Some(Selection {
        token_ids: picked.iter().map(|t| t.token_id).collect(),
        total,
        overshoot,
        includes_wissel,
    })
}

fn drain<'a>(
    buckets: &mut BTreeMap<Denomination, Vec<&'a Token>>,
    d: Denomination,
    take: u64,
    picked: &mut Vec<&'a Token>,
    remaining: &mut u64,
) {
    if take == 0 {
        return;
    }
    if let Some(bucket) = buckets.get_mut(&d) {
        for _ in 0..take {
            if let Some(t) = bucket.pop() {
                picked.push(t);
                *remaining = remaining.saturating_sub(d.value());
            }
        }
    }
}

/// All-or-nothing tail: a selection that would leave an issuance holding
/// below `ISSUANCE_MIN` is extended to empty that issuance. A WisselToken
/// left alone as its issuance's final token is the permitted exception.
fn enforce_issuance_tails(
    selection: &mut Selection,
    spendable: &[&Token],
    wissel_id: Option<TokenId>,
    target: u64,
    issuance_min: usize,
) {
    let mut by_issuance: BTreeMap<&str, Vec<&Token>> = BTreeMap::new();
    for &t in spendable {
        by_issuance.entry(t.issuance_id.as_str()).or_default().push(t);
    }

    for (_, members) in by_issuance {
        let leftover: Vec<&&Token> = members
            .iter()
            .filter(|t| !selection.token_ids.contains(&t.token_id))
            .collect();
        if leftover.is_empty() || leftover.len() >= issuance_min {
            continue;
        }
        // The Wissel as sole survivor of its issuance is legal.
        if leftover.len() == 1 && Some(leftover[0].token_id) == wissel_id {
            continue;
        }
        // Wissel still among the leftovers: the selection never dipped
        // into a protected pair, so the tail stands.
        if leftover.iter().any(|t| Some(t.token_id) == wissel_id) {
            continue;
        }
        if members.len() == leftover.len() {
            // Issuance untouched by this selection.
            continue;
        }
        for t in leftover {
            selection.token_ids.push(t.token_id);
            selection.total += t.value();
        }
        selection.overshoot = selection.total - target;
    }
}

// ── Proposed-selection validation ────────────────────────────────────────────

/// Validate an externally proposed token set against the Wissel and tail
/// rules (the engine applies this before reserving tokens for a pak).
pub fn validate_selection(
    holdings: &Holdings<'_>,
    proposed: &[TokenId],
    target: u64,
    receiver_clock: Option<&DenominationVectorClock>,
    ideals: &[u32; 9],
) -> Result<(), JuiceError> {
    let Some(wissel) = holdings.wissel() else {
        return Ok(());
    };
    let spendable = holdings.spendable();
    let others: Vec<&Token> = spendable
        .iter()
        .copied()
        .filter(|t| t.issuance_id == wissel.issuance_id && t.token_id != wissel.token_id)
        .collect();

    if proposed.contains(&wissel.token_id) {
        if others.len() >= ISSUANCE_MIN {
            return Err(JuiceError::WisselTokenProtected);
        }
        if others.iter().any(|t| !proposed.contains(&t.token_id)) {
            return Err(JuiceError::WisselTokenProtected);
        }
        return Ok(());
    }

    // Leaving the Wissel alone is only legal when the canonical selection
    // would not have spent the issuance tail exactly.
    let leaves_wissel_alone = !others.is_empty()
        && others.iter().all(|t| proposed.contains(&t.token_id));
    if leaves_wissel_alone {
        if let Ok(canonical) = select_tokens(holdings, target, receiver_clock, ideals) {
            if canonical.includes_wissel {
                return Err(JuiceError::WisselTokenProtected);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use juice_core::constants::IDEAL_COUNTS;
    use juice_core::types::OwnerId;

    const NOW: TimestampMs = 1_700_000_000_000;

    fn issuer() -> OwnerId {
        OwnerId::from_bytes([0xEE; 32])
    }

    fn token(issuance: &str, seq: u64, denom: u64) -> Token {
        Token::create(issuance, seq, denom, issuer(), 1_000, None).unwrap()
    }

    fn ids(tokens: &[&Token]) -> Vec<TokenId> {
        tokens.iter().map(|t| t.token_id).collect()
    }

    #[test]
    fn exact_single_token_match() {
        // Alice pays 10 holding [5, 10, 10]: one ten, nothing else.
        let tokens = vec![token("X", 1, 5), token("X", 2, 10), token("X", 3, 10)];
        let holdings = Holdings { tokens: &tokens, wissel_id: None, now: NOW };
        let sel = select_tokens(&holdings, 10, None, &IDEAL_COUNTS).unwrap();
        assert_eq!(sel.total, 10);
        assert_eq!(sel.overshoot, 0);
        assert_eq!(sel.token_ids.len(), 1);
    }

    #[test]
    fn greedy_combines_denominations() {
        let tokens = vec![
            token("X", 1, 5),
            token("X", 2, 2),
            token("X", 3, 2),
            token("X", 4, 1),
        ];
        let holdings = Holdings { tokens: &tokens, wissel_id: None, now: NOW };
        let sel = select_tokens(&holdings, 10, None, &IDEAL_COUNTS).unwrap();
        assert_eq!(sel.total, 10, "5+2+2+1 covers exactly");
        assert_eq!(sel.token_ids.len(), 4);
    }

    #[test]
    fn overshoot_takes_smallest_cover() {
        // Pay 10 holding a single 20: overshoot 10 becomes change.
        let tokens = vec![token("X", 1, 20)];
        let holdings = Holdings { tokens: &tokens, wissel_id: None, now: NOW };
        let sel = select_tokens(&holdings, 10, None, &IDEAL_COUNTS).unwrap();
        assert_eq!(sel.total, 20);
        assert_eq!(sel.overshoot, 10);
    }

    #[test]
    fn insufficient_balance_reported() {
        let tokens = vec![token("X", 1, 5)];
        let holdings = Holdings { tokens: &tokens, wissel_id: None, now: NOW };
        let err = select_tokens(&holdings, 10, None, &IDEAL_COUNTS).unwrap_err();
        assert!(matches!(
            err,
            JuiceError::InsufficientBalance { need: 10, have: 5 }
        ));
    }

    #[test]
    fn expired_tokens_excluded() {
        let mut expiring = Token::create("X", 1, 10, issuer(), 1_000, Some(NOW - 1)).unwrap();
        expiring.status = juice_core::token::TokenStatus::Active;
        let tokens = vec![expiring, token("X", 2, 5)];
        let holdings = Holdings { tokens: &tokens, wissel_id: None, now: NOW };
        let err = select_tokens(&holdings, 10, None, &IDEAL_COUNTS).unwrap_err();
        assert!(matches!(err, JuiceError::InsufficientBalance { have: 5, .. }));
    }

    // ── Receiver-need phase ──────────────────────────────────────────────

    #[test]
    fn receiver_lack_served_with_small_denominations() {
        // Sender holds one 10 and four 5s; receiver LACKs 5s. The selector
        // should give 5s (capped at half when the sender is not abundant)
        // rather than the single 10.
        let tokens = vec![
            token("X", 1, 10),
            token("X", 2, 5),
            token("X", 3, 5),
            token("X", 4, 5),
            token("X", 5, 5),
        ];
        let holdings = Holdings { tokens: &tokens, wissel_id: None, now: NOW };
        let receiver = DenominationVectorClock::from_counts(
            &[5, 5, 0, 5, 3, 3, 2, 2, 1],
            &IDEAL_COUNTS,
        );
        let sel = select_tokens(&holdings, 10, Some(&receiver), &IDEAL_COUNTS).unwrap();
        assert_eq!(sel.total, 10);
        let fives = tokens_with_denom(&tokens, &sel, 5);
        assert_eq!(fives, 2, "two fives serve the receiver's lack");
    }

    #[test]
    fn receiver_phase_caps_slightly_wanting() {
        // Receiver is SLIGHTLY_WANTING on 5s; a non-abundant sender gives
        // up at most a third (rounded up) of their fives.
        let tokens = vec![
            token("X", 1, 5),
            token("X", 2, 5),
            token("X", 3, 5),
            token("X", 4, 5),
            token("Z", 1, 10),
        ];
        let holdings = Holdings { tokens: &tokens, wissel_id: None, now: NOW };
        let receiver = DenominationVectorClock::from_counts(
            &[5, 5, 3, 5, 3, 3, 2, 2, 1],
            &IDEAL_COUNTS,
        );
        let sel = select_tokens(&holdings, 10, Some(&receiver), &IDEAL_COUNTS).unwrap();
        assert_eq!(sel.total, 10);
        assert_eq!(tokens_with_denom(&tokens, &sel, 5), 2, "ceil(4/3) = 2 fives");
        assert_eq!(tokens_with_denom(&tokens, &sel, 10), 0);
    }

    fn tokens_with_denom(tokens: &[Token], sel: &Selection, denom: u64) -> usize {
        tokens
            .iter()
            .filter(|t| sel.token_ids.contains(&t.token_id) && t.value() == denom)
            .count()
    }

    // ── Issuance tail ────────────────────────────────────────────────────

    #[test]
    fn tail_extends_to_empty_issuance() {
        // Issuance Y holds two 5s; paying 5 must not leave a lone token,
        // so both go and the second becomes change.
        let tokens = vec![token("Y", 1, 5), token("Y", 2, 5)];
        let holdings = Holdings { tokens: &tokens, wissel_id: None, now: NOW };
        let sel = select_tokens(&holdings, 5, None, &IDEAL_COUNTS).unwrap();
        assert_eq!(sel.token_ids.len(), 2, "all-or-nothing tail");
        assert_eq!(sel.total, 10);
        assert_eq!(sel.overshoot, 5);
    }

    #[test]
    fn untouched_issuance_not_dragged_in() {
        let tokens = vec![token("X", 1, 10), token("Y", 1, 5), token("Y", 2, 5)];
        let holdings = Holdings { tokens: &tokens, wissel_id: None, now: NOW };
        let sel = select_tokens(&holdings, 10, None, &IDEAL_COUNTS).unwrap();
        assert_eq!(sel.token_ids.len(), 1);
        assert_eq!(sel.overshoot, 0);
    }

    // ── WisselToken protection ───────────────────────────────────────────

    fn wissel_setup() -> (Vec<Token>, TokenId) {
        // Issuance X: Wissel (denom 1) + one regular 1. Issuance Y: two 5s.
        let w = token("X", 0, 1);
        let wid = w.token_id;
        let tokens = vec![w, token("X", 1, 1), token("Y", 1, 5), token("Y", 2, 5)];
        (tokens, wid)
    }

    #[test]
    fn paying_one_takes_regular_not_wissel() {
        let (tokens, wid) = wissel_setup();
        let holdings = Holdings { tokens: &tokens, wissel_id: Some(wid), now: NOW };
        let sel = select_tokens(&holdings, 1, None, &IDEAL_COUNTS).unwrap();
        assert_eq!(sel.total, 1);
        assert!(!sel.includes_wissel, "the Wissel stays while an exact regular match exists");
    }

    #[test]
    fn paying_two_spends_the_tail_together() {
        let (tokens, wid) = wissel_setup();
        let holdings = Holdings { tokens: &tokens, wissel_id: Some(wid), now: NOW };
        let sel = select_tokens(&holdings, 2, None, &IDEAL_COUNTS).unwrap();
        assert_eq!(sel.total, 2, "W + T exactly, not a 5 with overshoot");
        assert!(sel.includes_wissel);
        assert_eq!(sel.token_ids.len(), 2);
    }

    #[test]
    fn proposing_regular_without_wissel_for_exact_tail_is_protected() {
        let (tokens, wid) = wissel_setup();
        let holdings = Holdings { tokens: &tokens, wissel_id: Some(wid), now: NOW };
        let regular: Vec<TokenId> = tokens
            .iter()
            .filter(|t| t.issuance_id == "X" && t.token_id != wid)
            .map(|t| t.token_id)
            .collect();
        let err = validate_selection(&holdings, &regular, 2, None, &IDEAL_COUNTS).unwrap_err();
        assert!(matches!(err, JuiceError::WisselTokenProtected));
    }

    #[test]
    fn wissel_with_two_other_tokens_is_protected() {
        // Issuance X: Wissel + two regulars. Proposing the Wissel at all
        // is refused.
        let w = token("X", 0, 1);
        let wid = w.token_id;
        let tokens = vec![w, token("X", 1, 1), token("X", 2, 1)];
        let holdings = Holdings { tokens: &tokens, wissel_id: Some(wid), now: NOW };
        let err =
            validate_selection(&holdings, &[wid], 1, None, &IDEAL_COUNTS).unwrap_err();
        assert!(matches!(err, JuiceError::WisselTokenProtected));
    }

    #[test]
    fn selection_never_reaches_protected_wissel() {
        // Only the Wissel plus two regulars of its issuance: paying the
        // full 3 would need the Wissel, which the tail rule forbids.
        let w = token("X", 0, 1);
        let wid = w.token_id;
        let tokens = vec![w, token("X", 1, 1), token("X", 2, 1)];
        let holdings = Holdings { tokens: &tokens, wissel_id: Some(wid), now: NOW };
        let err = select_tokens(&holdings, 3, None, &IDEAL_COUNTS).unwrap_err();
        assert!(matches!(err, JuiceError::WisselTokenProtected));
    }
}
