use juice_chain::{ChainPayload, PersonalChain};
use juice_core::config::EngineConfig;
use juice_core::constants::MS_PER_DAY;
use juice_core::error::JuiceError;
use juice_core::telomeer::Telomeer;
use juice_core::token::{Token, TokenStatus};
use juice_core::types::{OwnerId, Signature, TimestampMs, TokenId};
use juice_crypto::Signer;
use serde::{Deserialize, Serialize};
use tracing::info;

// ── Expiry notifications ─────────────────────────────────────────────────────

/// Emitted for tokens inside their expiry warning window (or already past
/// expiry) so the owner can request renewal.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ExpiryNotification {
    pub token_id: TokenId,
    pub expiry_time_ms: TimestampMs,
    pub notified_ms: TimestampMs,
}

/// Scan a holding set for tokens whose expiry falls within
/// `warning_days` of `now`.
pub fn scan_expiring(
    tokens: &[Token],
    now: TimestampMs,
    warning_days: u64,
) -> Vec<ExpiryNotification> {
    let window_ms = warning_days * MS_PER_DAY;
    tokens
        .iter()
        .filter(|t| t.status == TokenStatus::Active)
        .filter_map(|t| {
            let expiry = t.expiry_time_ms?;
            (expiry.saturating_sub(now) <= window_ms).then_some(ExpiryNotification {
                token_id: t.token_id,
                expiry_time_ms: expiry,
                notified_ms: now,
            })
        })
        .collect()
}

// ── Renewal transformation ───────────────────────────────────────────────────

/// A Telomeer transformation minting a successor token for one that is
/// expiring: same denomination and issuance lineage, fresh expiry, the old
/// token recorded as predecessor. Signed by the owner; countersigned by a
/// TEE when one is present. A facilitating third party earns the
/// configured reward.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RenewalTransformation {
    pub predecessor: TokenId,
    pub successor: TokenId,
    pub owner: OwnerId,
    pub facilitator: Option<OwnerId>,
    /// Whole units owed to the facilitator, rounded down.
    pub reward_units: u64,
    pub timestamp_ms: TimestampMs,
    pub owner_signature: Signature,
    pub tee_countersignature: Option<Vec<u8>>,
}

impl RenewalTransformation {
    pub fn signing_bytes(
        predecessor: &TokenId,
        successor: &TokenId,
        facilitator: Option<&OwnerId>,
        reward_units: u64,
        timestamp_ms: TimestampMs,
    ) -> Vec<u8> {
        let mut buf = Vec::with_capacity(96);
        buf.extend_from_slice(predecessor.as_bytes());
        buf.extend_from_slice(successor.as_bytes());
        if let Some(f) = facilitator {
            buf.extend_from_slice(f.as_bytes());
        }
        buf.extend_from_slice(&reward_units.to_le_bytes());
        buf.extend_from_slice(&timestamp_ms.to_le_bytes());
        buf
    }
}

/// Renew `token` in place: the old token is revoked under the signed
/// transformation, the successor is minted to the same owner, and the
/// owner's chain records the Telomeer update.
///
/// `tee_countersignature` is whatever the hardware capability attested
/// over the transformation's signing bytes; `None` when no TEE is present.
#[allow(clippy::too_many_arguments)]
pub fn renew(
    token: &mut Token,
    telomeer: &Telomeer,
    now: TimestampMs,
    config: &EngineConfig,
    signer: &dyn Signer,
    chain: &mut PersonalChain,
    facilitator: Option<OwnerId>,
    tee_countersignature: Option<Vec<u8>>,
) -> Result<(RenewalTransformation, Token, Telomeer), JuiceError> {
    let owner = signer.owner_id();
    if telomeer.current_owner != owner {
        return Err(JuiceError::TokenNotOwned {
            token: token.token_id.to_string(),
            owner: owner.to_string(),
        });
    }
    let expiry = token.expiry_time_ms.ok_or(JuiceError::NotExpiring)?;
    let window_ms = config.expiry_warning_days * MS_PER_DAY;
    if expiry.saturating_sub(now) > window_ms {
        return Err(JuiceError::NotExpiring);
    }

    let successor = Token::create(
        &token.issuance_id,
        token.sequence_number,
        token.denomination.value(),
        token.issuer,
        now,
        Some(now + config.renewal_validity_days * MS_PER_DAY),
    )?;
    let successor_telomeer = Telomeer::genesis(successor.token_id, owner);

    let reward_units = match facilitator {
        Some(_) => (config.facilitation_reward)(token.value()),
        None => 0,
    };
    let bytes = RenewalTransformation::signing_bytes(
        &token.token_id,
        &successor.token_id,
        facilitator.as_ref(),
        reward_units,
        now,
    );
    let transformation = RenewalTransformation {
        predecessor: token.token_id,
        successor: successor.token_id,
        owner,
        facilitator,
        reward_units,
        timestamp_ms: now,
        owner_signature: signer.sign(&bytes),
        tee_countersignature,
    };

    // The predecessor is withdrawn from circulation under this attestation.
    token.transition(TokenStatus::Revoked)?;

    chain.append(
        ChainPayload::TelomeerUpdate {
            token_id: successor.token_id,
            new_owner: owner,
        },
        now,
        signer,
    )?;
    info!(
        predecessor = %transformation.predecessor,
        successor = %transformation.successor,
        reward_units,
        "token renewed"
    );
    Ok((transformation, successor, successor_telomeer))
}
