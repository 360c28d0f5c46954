use juice_core::error::JuiceError;
use juice_core::telomeer::Telomeer;
use juice_core::token::{Token, TokenStatus};
use juice_core::types::{OwnerId, Signature, TimestampMs, TokenId, TransactionId};
use juice_crypto::{verify_signature, Signer};
use serde::{Deserialize, Serialize};

/// Shared contents of every pak: the tokens it covers together with their
/// Telomeers (the counterparty has no other source for either), bound to
/// one transaction and its seed.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PakBody {
    pub transaction_id: TransactionId,
    pub transaction_seed: [u8; 32],
    pub tokens: Vec<Token>,
    pub telomeers: Vec<Telomeer>,
    /// Wissel buffer cents travelling with this pak (exo paks only).
    pub buffer_cents: u16,
    pub constructor: OwnerId,
}

/// A signed bundle of tokens playing one of the four roles of the
/// Four-Packet protocol. Exo paks change hands; retro paks are each
/// side's pledge of rollback safety.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum Pak {
    /// Tokens the sender transfers.
    SExo(PakBody, Signature),
    /// Change tokens the receiver returns.
    RExo(PakBody, Signature),
    /// Rollback-safety tokens retained by the sender.
    SRetro(PakBody, Signature),
    /// Rollback-safety tokens retained by the receiver.
    RRetro(PakBody, Signature),
}

impl Pak {
    pub fn body(&self) -> &PakBody {
        match self {
            Pak::SExo(b, _) | Pak::RExo(b, _) | Pak::SRetro(b, _) | Pak::RRetro(b, _) => b,
        }
    }

    pub fn signature(&self) -> &Signature {
        match self {
            Pak::SExo(_, s) | Pak::RExo(_, s) | Pak::SRetro(_, s) | Pak::RRetro(_, s) => s,
        }
    }

    fn role_tag(&self) -> u8 {
        match self {
            Pak::SExo(..) => 1,
            Pak::RExo(..) => 2,
            Pak::SRetro(..) => 3,
            Pak::RRetro(..) => 4,
        }
    }

    pub fn token_ids(&self) -> Vec<TokenId> {
        self.body().tokens.iter().map(|t| t.token_id).collect()
    }

    pub fn total_units(&self) -> u64 {
        self.body().tokens.iter().map(|t| t.value()).sum()
    }

    fn signing_bytes(role_tag: u8, body: &PakBody) -> Vec<u8> {
        let mut buf =
            bincode::serialize(body).expect("pak body serialization is infallible");
        buf.push(role_tag);
        buf
    }

    fn build(
        role_tag: u8,
        transaction_id: TransactionId,
        transaction_seed: [u8; 32],
        tokens: Vec<Token>,
        telomeers: Vec<Telomeer>,
        buffer_cents: u16,
        signer: &dyn Signer,
    ) -> (PakBody, Signature) {
        let body = PakBody {
            transaction_id,
            transaction_seed,
            tokens,
            telomeers,
            buffer_cents,
            constructor: signer.owner_id(),
        };
        let signature = signer.sign(&Self::signing_bytes(role_tag, &body));
        (body, signature)
    }

    pub fn s_exo(
        transaction_id: TransactionId,
        seed: [u8; 32],
        tokens: Vec<Token>,
        telomeers: Vec<Telomeer>,
        buffer_cents: u16,
        signer: &dyn Signer,
    ) -> Self {
        let (b, s) = Self::build(1, transaction_id, seed, tokens, telomeers, buffer_cents, signer);
        Pak::SExo(b, s)
    }

    pub fn r_exo(
        transaction_id: TransactionId,
        seed: [u8; 32],
        tokens: Vec<Token>,
        telomeers: Vec<Telomeer>,
        buffer_cents: u16,
        signer: &dyn Signer,
    ) -> Self {
        let (b, s) = Self::build(2, transaction_id, seed, tokens, telomeers, buffer_cents, signer);
        Pak::RExo(b, s)
    }

    pub fn s_retro(
        transaction_id: TransactionId,
        seed: [u8; 32],
        tokens: Vec<Token>,
        telomeers: Vec<Telomeer>,
        signer: &dyn Signer,
    ) -> Self {
        let (b, s) = Self::build(3, transaction_id, seed, tokens, telomeers, 0, signer);
        Pak::SRetro(b, s)
    }

    pub fn r_retro(
        transaction_id: TransactionId,
        seed: [u8; 32],
        tokens: Vec<Token>,
        telomeers: Vec<Telomeer>,
        signer: &dyn Signer,
    ) -> Self {
        let (b, s) = Self::build(4, transaction_id, seed, tokens, telomeers, 0, signer);
        Pak::RRetro(b, s)
    }

    /// Stable digest identifying this pak (sent in place of full retro
    /// paks during preparation).
    pub fn digest(&self) -> [u8; 32] {
        juice_crypto::sha256(&Self::signing_bytes(self.role_tag(), self.body()))
    }

    /// Verify the constructor's seed-bound signature and the internal
    /// consistency of the bundle against the expected transaction.
    pub fn validate(
        &self,
        expected_id: &TransactionId,
        expected_seed: &[u8; 32],
        expected_constructor: &OwnerId,
        now: TimestampMs,
    ) -> Result<(), JuiceError> {
        let body = self.body();
        let id = body.transaction_id;
        if body.transaction_id != *expected_id || body.transaction_seed != *expected_seed {
            return Err(JuiceError::TransactionAborted {
                transaction_id: id,
                reason: "pak bound to a different transaction".into(),
            });
        }
        if body.constructor != *expected_constructor {
            return Err(JuiceError::TransactionAborted {
                transaction_id: id,
                reason: "pak constructed by unexpected party".into(),
            });
        }
        verify_signature(
            &body.constructor,
            &Self::signing_bytes(self.role_tag(), body),
            self.signature(),
        )?;

        if body.tokens.len() != body.telomeers.len() {
            return Err(JuiceError::TransactionAborted {
                transaction_id: id,
                reason: "pak token/telomeer count mismatch".into(),
            });
        }
        for (token, telomeer) in body.tokens.iter().zip(&body.telomeers) {
            if token.token_id != telomeer.token_id {
                return Err(JuiceError::TransactionAborted {
                    transaction_id: id,
                    reason: "telomeer does not match its token".into(),
                });
            }
            telomeer.verify_integrity()?;
            if telomeer.current_owner != body.constructor {
                return Err(JuiceError::TokenNotOwned {
                    token: token.token_id.to_string(),
                    owner: body.constructor.to_string(),
                });
            }
            match token.status {
                TokenStatus::Revoked => {
                    return Err(JuiceError::TokenRevoked(token.token_id.to_string()))
                }
                TokenStatus::Consumed => {
                    return Err(JuiceError::TokenRevoked(token.token_id.to_string()))
                }
                _ => {}
            }
            if token.is_expired(now) {
                return Err(JuiceError::TokenExpired(token.token_id.to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use juice_crypto::KeyPair;

    const NOW: TimestampMs = 1_700_000_000_000;

    fn setup(kp: &KeyPair) -> (TransactionId, [u8; 32], Vec<Token>, Vec<Telomeer>) {
        let id = TransactionId::generate();
        let seed = [0x5E; 32];
        let token = Token::create("NL-AMS-001", 1, 10, kp.owner_id, 1_000, None).unwrap();
        let telomeer = Telomeer::genesis(token.token_id, kp.owner_id);
        (id, seed, vec![token], vec![telomeer])
    }

    #[test]
    fn build_and_validate() {
        let kp = KeyPair::generate();
        let (id, seed, tokens, telomeers) = setup(&kp);
        let pak = Pak::s_exo(id, seed, tokens, telomeers, 0, &kp);
        assert_eq!(pak.total_units(), 10);
        pak.validate(&id, &seed, &kp.owner_id, NOW).unwrap();
    }

    #[test]
    fn wrong_seed_rejected() {
        let kp = KeyPair::generate();
        let (id, seed, tokens, telomeers) = setup(&kp);
        let pak = Pak::s_exo(id, seed, tokens, telomeers, 0, &kp);
        assert!(pak.validate(&id, &[0u8; 32], &kp.owner_id, NOW).is_err());
    }

    #[test]
    fn tampered_tokens_break_signature() {
        let kp = KeyPair::generate();
        let (id, seed, tokens, telomeers) = setup(&kp);
        let pak = Pak::s_exo(id, seed, tokens, telomeers, 0, &kp);
        let Pak::SExo(mut body, sig) = pak else { unreachable!() };
        body.buffer_cents = 99;
        let forged = Pak::SExo(body, sig);
        assert!(matches!(
            forged.validate(&id, &seed, &kp.owner_id, NOW),
            Err(JuiceError::BadSignature)
        ));
    }

    #[test]
    fn foreign_owned_token_rejected() {
        let kp = KeyPair::generate();
        let other = KeyPair::generate();
        let id = TransactionId::generate();
        let seed = [0x5E; 32];
        let token = Token::create("NL-AMS-001", 1, 10, kp.owner_id, 1_000, None).unwrap();
        // Telomeer names someone else as owner.
        let telomeer = Telomeer::genesis(token.token_id, other.owner_id);
        let pak = Pak::s_exo(id, seed, vec![token], vec![telomeer], 0, &kp);
        assert!(matches!(
            pak.validate(&id, &seed, &kp.owner_id, NOW),
            Err(JuiceError::TokenNotOwned { .. })
        ));
    }

    #[test]
    fn revoked_token_rejected() {
        let kp = KeyPair::generate();
        let id = TransactionId::generate();
        let seed = [0x5E; 32];
        let mut token = Token::create("NL-AMS-001", 1, 10, kp.owner_id, 1_000, None).unwrap();
        token.transition(TokenStatus::Revoked).unwrap();
        let telomeer = Telomeer::genesis(token.token_id, kp.owner_id);
        let pak = Pak::s_exo(id, seed, vec![token], vec![telomeer], 0, &kp);
        assert!(matches!(
            pak.validate(&id, &seed, &kp.owner_id, NOW),
            Err(JuiceError::TokenRevoked(_))
        ));
    }

    #[test]
    fn serde_round_trip() {
        let kp = KeyPair::generate();
        let (id, seed, tokens, telomeers) = setup(&kp);
        let pak = Pak::r_retro(id, seed, tokens, telomeers, &kp);
        let bytes = bincode::serialize(&pak).unwrap();
        let back: Pak = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, pak);
        assert_eq!(back.digest(), pak.digest());
    }
}
