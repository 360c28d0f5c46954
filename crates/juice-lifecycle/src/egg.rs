use juice_chain::{ChainPayload, PersonalChain};
use juice_core::constants::DEFAULT_INCUBATION_MS;
use juice_core::error::JuiceError;
use juice_core::telomeer::Telomeer;
use juice_core::token::{derive_token_id, Denomination, Token};
use juice_core::types::{IssuanceId, OwnerId, Signature, TimestampMs, TokenId};
use juice_crypto::{verify_signature, Signer};
use serde::{Deserialize, Serialize};
use tracing::info;

// ── Stages ───────────────────────────────────────────────────────────────────

/// Maturation stages of a dormant egg. Strictly forward-moving.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EggStage {
    Dormant,
    Fertilized,
    Incubating,
    Hatching,
    Active,
}

impl std::fmt::Display for EggStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EggStage::Dormant => "DORMANT",
            EggStage::Fertilized => "FERTILIZED",
            EggStage::Incubating => "INCUBATING",
            EggStage::Hatching => "HATCHING",
            EggStage::Active => "ACTIVE",
        };
        write!(f, "{s}")
    }
}

// ── Hatching condition ───────────────────────────────────────────────────────

/// What a fertilization trigger must demonstrate before the egg may begin
/// incubating.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum HatchingCondition {
    /// At least this many distinct attestors vouch for the activity.
    AttestationThreshold { required: u32 },
    /// A specific named activity was completed.
    ActivityCompletion { activity_id: String },
    /// Incubation runs until a fixed instant; any validly signed trigger
    /// fertilizes.
    TemporalTrigger { fire_at_ms: TimestampMs },
    /// A quorum of named parties must be among the attestors.
    MultiPartyAgreement {
        parties: Vec<OwnerId>,
        required: u32,
    },
}

// ── Fertilization trigger ────────────────────────────────────────────────────

/// Proof-of-activity: a signed reference to a qualifying external event,
/// optionally carrying the attestors that vouch for it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FertilizationTrigger {
    pub egg_id: TokenId,
    pub event_ref: String,
    pub attestors: Vec<OwnerId>,
    pub issued_ms: TimestampMs,
    pub issuer: OwnerId,
    pub signature: Signature,
}

impl FertilizationTrigger {
    pub fn signing_bytes(
        egg_id: &TokenId,
        event_ref: &str,
        attestors: &[OwnerId],
        issued_ms: TimestampMs,
    ) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(egg_id.as_bytes());
        buf.extend_from_slice(event_ref.as_bytes());
        for a in attestors {
            buf.extend_from_slice(a.as_bytes());
        }
        buf.extend_from_slice(&issued_ms.to_le_bytes());
        buf
    }

    pub fn create(
        egg_id: TokenId,
        event_ref: String,
        attestors: Vec<OwnerId>,
        issued_ms: TimestampMs,
        signer: &dyn Signer,
    ) -> Self {
        let bytes = Self::signing_bytes(&egg_id, &event_ref, &attestors, issued_ms);
        Self {
            egg_id,
            event_ref,
            attestors,
            issued_ms,
            issuer: signer.owner_id(),
            signature: signer.sign(&bytes),
        }
    }

    fn verify(&self) -> Result<(), JuiceError> {
        let bytes =
            Self::signing_bytes(&self.egg_id, &self.event_ref, &self.attestors, self.issued_ms);
        verify_signature(&self.issuer, &bytes, &self.signature)
    }
}

// ── DormantEgg ───────────────────────────────────────────────────────────────

/// A denomination-carrying egg whose maturation into an active token is
/// gated by its hatching condition.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DormantEgg {
    pub egg_id: TokenId,
    pub owner: OwnerId,
    pub issuer: OwnerId,
    pub issuance_id: IssuanceId,
    pub sequence_number: u64,
    pub denomination: Denomination,
    pub condition: HatchingCondition,
    pub stage: EggStage,
    pub stage_entered_ms: TimestampMs,
    /// Duration of the incubation stage; set at fertilization.
    pub incubation_ms: u64,
    pub created_ms: TimestampMs,
}

impl DormantEgg {
    pub fn new(
        issuance_id: &str,
        sequence_number: u64,
        denomination: u64,
        owner: OwnerId,
        issuer: OwnerId,
        condition: HatchingCondition,
        now: TimestampMs,
    ) -> Result<Self, JuiceError> {
        Ok(Self {
            egg_id: derive_token_id(issuance_id, sequence_number, now),
            owner,
            issuer,
            issuance_id: issuance_id.to_string(),
            sequence_number,
            denomination: Denomination::try_from(denomination)?,
            condition,
            stage: EggStage::Dormant,
            stage_entered_ms: now,
            incubation_ms: 0,
            created_ms: now,
        })
    }

    pub fn estimated_completion_ms(&self) -> TimestampMs {
        self.stage_entered_ms + self.incubation_ms
    }

    /// Validate the trigger against the hatching condition and enter
    /// FERTILIZED.
    pub fn fertilize(
        &mut self,
        trigger: &FertilizationTrigger,
        now: TimestampMs,
    ) -> Result<(), JuiceError> {
        if self.stage != EggStage::Dormant {
            return Err(JuiceError::InvalidEggTransition {
                from: self.stage.to_string(),
                to: EggStage::Fertilized.to_string(),
            });
        }
        if trigger.egg_id != self.egg_id {
            return Err(JuiceError::HatchingConditionUnsatisfied(
                "trigger references a different egg".into(),
            ));
        }
        trigger.verify()?;
        self.check_condition(trigger)?;

        self.incubation_ms = match &self.condition {
            HatchingCondition::TemporalTrigger { fire_at_ms } => fire_at_ms.saturating_sub(now),
            _ => DEFAULT_INCUBATION_MS,
        };
        self.stage = EggStage::Fertilized;
        self.stage_entered_ms = now;
        info!(egg = %self.egg_id, "egg fertilized");
        Ok(())
    }

    fn check_condition(&self, trigger: &FertilizationTrigger) -> Result<(), JuiceError> {
        match &self.condition {
            HatchingCondition::AttestationThreshold { required } => {
                if (trigger.attestors.len() as u32) < *required {
                    return Err(JuiceError::HatchingConditionUnsatisfied(format!(
                        "{} attestors, {} required",
                        trigger.attestors.len(),
                        required
                    )));
                }
            }
            HatchingCondition::ActivityCompletion { activity_id } => {
                if trigger.event_ref != *activity_id {
                    return Err(JuiceError::HatchingConditionUnsatisfied(format!(
                        "activity {} does not match {}",
                        trigger.event_ref, activity_id
                    )));
                }
            }
            HatchingCondition::TemporalTrigger { .. } => {}
            HatchingCondition::MultiPartyAgreement { parties, required } => {
                let agreeing = trigger
                    .attestors
                    .iter()
                    .filter(|a| parties.contains(a))
                    .count() as u32;
                if agreeing < *required {
                    return Err(JuiceError::HatchingConditionUnsatisfied(format!(
                        "{agreeing} of {required} required parties agree"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Time-driven stage progression. FERTILIZED moves straight into
    /// INCUBATING; INCUBATING becomes HATCHING once the incubation window
    /// has fully elapsed.
    pub fn advance(&mut self, now: TimestampMs) -> EggStage {
        match self.stage {
            EggStage::Fertilized => {
                self.stage = EggStage::Incubating;
                // Incubation is measured from fertilization, not from this
                // bookkeeping tick.
            }
            EggStage::Incubating => {
                if now >= self.estimated_completion_ms() {
                    self.stage = EggStage::Hatching;
                }
            }
            _ => {}
        }
        self.stage
    }

    /// Overall maturation percentage; non-decreasing under forward time,
    /// 100 exactly at ACTIVE.
    pub fn completion_percentage(&self, now: TimestampMs) -> u8 {
        match self.stage {
            EggStage::Dormant => 0,
            EggStage::Fertilized => 10,
            EggStage::Incubating => {
                if self.incubation_ms == 0 {
                    return 95;
                }
                let elapsed = now.saturating_sub(self.stage_entered_ms);
                let ratio = (elapsed * 85 / self.incubation_ms).min(85);
                10 + ratio as u8
            }
            EggStage::Hatching => 95,
            EggStage::Active => 100,
        }
    }

    /// Mint the token, hand its genesis Telomeer to the egg's owner, and
    /// journal the hatch on the owner's chain.
    pub fn hatch(
        &mut self,
        now: TimestampMs,
        chain: &mut PersonalChain,
        signer: &dyn Signer,
    ) -> Result<(Token, Telomeer), JuiceError> {
        if self.stage != EggStage::Hatching {
            return Err(JuiceError::InvalidEggTransition {
                from: self.stage.to_string(),
                to: EggStage::Active.to_string(),
            });
        }
        let token = Token::create(
            &self.issuance_id,
            self.sequence_number,
            self.denomination.value(),
            self.issuer,
            now,
            None,
        )?;
        let telomeer = Telomeer::genesis(token.token_id, self.owner);

        self.stage = EggStage::Active;
        self.stage_entered_ms = now;
        chain.append(
            ChainPayload::EggLifecycle {
                egg_id: self.egg_id,
                stage: self.stage.to_string(),
                hatched_token: Some(token.token_id),
            },
            now,
            signer,
        )?;
        info!(egg = %self.egg_id, token = %token.token_id, "egg hatched");
        Ok((token, telomeer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use juice_crypto::KeyPair;

    const T0: TimestampMs = 1_700_000_000_000;
    const H72: u64 = 72 * 3600 * 1_000;

    fn temporal_egg(owner: &KeyPair) -> DormantEgg {
        DormantEgg::new(
            "NL-AMS-001",
            1,
            10,
            owner.owner_id,
            OwnerId::from_bytes([0xEE; 32]),
            HatchingCondition::TemporalTrigger { fire_at_ms: T0 + H72 },
            T0,
        )
        .unwrap()
    }

    fn trigger_for(egg: &DormantEgg, signer: &KeyPair) -> FertilizationTrigger {
        FertilizationTrigger::create(
            egg.egg_id,
            "activity:first-exchange".into(),
            vec![],
            T0,
            signer,
        )
    }

    #[test]
    fn temporal_egg_full_maturation() {
        let owner = KeyPair::generate();
        let mut egg = temporal_egg(&owner);
        let mut chain = PersonalChain::new(owner.owner_id);

        assert_eq!(egg.completion_percentage(T0), 0);
        egg.fertilize(&trigger_for(&egg, &owner), T0).unwrap();
        assert_eq!(egg.stage, EggStage::Fertilized);
        assert_eq!(egg.incubation_ms, H72);

        // Progress is monotone through incubation.
        assert_eq!(egg.advance(T0), EggStage::Incubating);
        let mut last = 0;
        for hours in [0u64, 12, 24, 48, 71] {
            let p = egg.completion_percentage(T0 + hours * 3600 * 1_000);
            assert!(p >= last, "{p} < {last} at {hours}h");
            last = p;
        }

        assert_eq!(egg.advance(T0 + H72 - 1), EggStage::Incubating);
        assert_eq!(egg.advance(T0 + H72), EggStage::Hatching);
        assert_eq!(egg.completion_percentage(T0 + H72), 95);

        let (token, telomeer) = egg.hatch(T0 + H72, &mut chain, &owner).unwrap();
        assert_eq!(egg.stage, EggStage::Active);
        assert_eq!(egg.completion_percentage(T0 + H72), 100);
        assert_eq!(token.denomination.value(), 10);
        assert_eq!(telomeer.current_owner, owner.owner_id);
        assert_eq!(chain.len(), 1, "hatch journaled on the personal chain");
        chain.verify().unwrap();
    }

    #[test]
    fn fertilize_rejects_bad_signature() {
        let owner = KeyPair::generate();
        let mut egg = temporal_egg(&owner);
        let mut trigger = trigger_for(&egg, &owner);
        trigger.event_ref = "activity:forged".into();
        assert!(matches!(
            egg.fertilize(&trigger, T0),
            Err(JuiceError::BadSignature)
        ));
    }

    #[test]
    fn fertilize_rejects_foreign_egg_trigger() {
        let owner = KeyPair::generate();
        let mut egg = temporal_egg(&owner);
        let mut other = temporal_egg(&owner);
        other.sequence_number = 2;
        other.egg_id = derive_token_id("NL-AMS-001", 2, T0);
        let trigger = trigger_for(&other, &owner);
        assert!(matches!(
            egg.fertilize(&trigger, T0),
            Err(JuiceError::HatchingConditionUnsatisfied(_))
        ));
    }

    #[test]
    fn attestation_threshold_enforced() {
        let owner = KeyPair::generate();
        let mut egg = DormantEgg::new(
            "NL-AMS-001",
            3,
            5,
            owner.owner_id,
            OwnerId::from_bytes([0xEE; 32]),
            HatchingCondition::AttestationThreshold { required: 2 },
            T0,
        )
        .unwrap();

        let thin = FertilizationTrigger::create(
            egg.egg_id,
            "activity:x".into(),
            vec![OwnerId::from_bytes([1; 32])],
            T0,
            &owner,
        );
        assert!(matches!(
            egg.fertilize(&thin, T0),
            Err(JuiceError::HatchingConditionUnsatisfied(_))
        ));

        let enough = FertilizationTrigger::create(
            egg.egg_id,
            "activity:x".into(),
            vec![OwnerId::from_bytes([1; 32]), OwnerId::from_bytes([2; 32])],
            T0,
            &owner,
        );
        egg.fertilize(&enough, T0).unwrap();
        assert_eq!(egg.stage, EggStage::Fertilized);
    }

    #[test]
    fn multi_party_quorum_counts_named_parties_only() {
        let owner = KeyPair::generate();
        let alice = OwnerId::from_bytes([1; 32]);
        let bob = OwnerId::from_bytes([2; 32]);
        let stranger = OwnerId::from_bytes([9; 32]);
        let mut egg = DormantEgg::new(
            "NL-AMS-001",
            4,
            5,
            owner.owner_id,
            OwnerId::from_bytes([0xEE; 32]),
            HatchingCondition::MultiPartyAgreement {
                parties: vec![alice, bob],
                required: 2,
            },
            T0,
        )
        .unwrap();

        let outsiders = FertilizationTrigger::create(
            egg.egg_id,
            "activity:x".into(),
            vec![alice, stranger],
            T0,
            &owner,
        );
        assert!(egg.fertilize(&outsiders, T0).is_err());

        let quorum = FertilizationTrigger::create(
            egg.egg_id,
            "activity:x".into(),
            vec![alice, bob],
            T0,
            &owner,
        );
        egg.fertilize(&quorum, T0).unwrap();
    }

    #[test]
    fn hatch_requires_hatching_stage() {
        let owner = KeyPair::generate();
        let mut egg = temporal_egg(&owner);
        let mut chain = PersonalChain::new(owner.owner_id);
        assert!(matches!(
            egg.hatch(T0, &mut chain, &owner),
            Err(JuiceError::InvalidEggTransition { .. })
        ));
    }
}
