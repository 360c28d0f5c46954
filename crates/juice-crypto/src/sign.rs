use ed25519_dalek::{Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use juice_core::error::JuiceError;
use juice_core::types::{OwnerId, Signature};
use sha2::Sha256;

use crate::keypair::KeyPair;

/// Anything that can produce detached signatures under a stable owner
/// fingerprint. Production code signs with Ed25519 ([`KeyPair`]); tests may
/// substitute the HMAC implementation without changing call sites.
pub trait Signer: Send + Sync {
    fn sign(&self, message: &[u8]) -> Signature;
    fn owner_id(&self) -> OwnerId;
}

impl Signer for KeyPair {
    fn sign(&self, message: &[u8]) -> Signature {
        KeyPair::sign(self, message)
    }

    fn owner_id(&self) -> OwnerId {
        self.owner_id
    }
}

/// Verify a detached Ed25519 signature against an owner fingerprint (the
/// raw verifying-key bytes). Verification inside ed25519-dalek is
/// constant-time.
pub fn verify_signature(
    owner: &OwnerId,
    message: &[u8],
    signature: &Signature,
) -> Result<(), JuiceError> {
    let key = VerifyingKey::from_bytes(owner.as_bytes()).map_err(|_| JuiceError::BadSignature)?;
    let sig_bytes: [u8; 64] = signature
        .0
        .as_slice()
        .try_into()
        .map_err(|_| JuiceError::BadSignature)?;
    let sig = ed25519_dalek::Signature::from_bytes(&sig_bytes);
    key.verify(message, &sig).map_err(|_| JuiceError::BadSignature)
}

/// Verify a signed ownership proof against the owner fingerprint it
/// claims. A TEE countersignature, when present, is opaque evidence for
/// the caller; only the owner signature is checked here.
pub fn verify_ownership_proof(
    proof: &juice_core::telomeer::OwnershipProof,
) -> Result<(), JuiceError> {
    if proof.body.chain.first() != Some(proof.owner.as_bytes()) {
        return Err(JuiceError::InvalidTelomeerSignature);
    }
    verify_signature(&proof.owner, &proof.body.signing_bytes(), &proof.signature)
        .map_err(|_| JuiceError::InvalidTelomeerSignature)
}

// ── HMAC test signer ─────────────────────────────────────────────────────────

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 stand-in for tests that need deterministic keys without
/// Ed25519 key generation. Produces the same 64-byte signature width (the
/// 32-byte MAC doubled) so wire codecs are exercised unchanged.
pub struct HmacSigner {
    key: [u8; 32],
    owner: OwnerId,
}

impl HmacSigner {
    pub fn new(key: [u8; 32]) -> Self {
        let owner = OwnerId::from_bytes(crate::hash::derive_commitment(&key));
        Self { key, owner }
    }

    fn mac(&self, message: &[u8]) -> [u8; 32] {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(message);
        mac.finalize().into_bytes().into()
    }

    /// Verify with constant-time comparison of the recomputed MAC.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), JuiceError> {
        if signature.0.len() != 64 {
            return Err(JuiceError::BadSignature);
        }
        let expected = self.mac(message);
        let half: [u8; 32] = signature.0[..32].try_into().expect("length checked");
        if crate::hash::ct_eq32(&expected, &half) {
            Ok(())
        } else {
            Err(JuiceError::BadSignature)
        }
    }
}

impl Signer for HmacSigner {
    fn sign(&self, message: &[u8]) -> Signature {
        let mac = self.mac(message);
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&mac);
        out.extend_from_slice(&mac);
        Signature(out)
    }

    fn owner_id(&self) -> OwnerId {
        self.owner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ed25519_sign_verify_round_trip() {
        let kp = KeyPair::generate();
        let message = b"four-packet atomic commitment";
        let sig = Signer::sign(&kp, message);
        assert_eq!(sig.0.len(), 64);
        assert!(verify_signature(&kp.owner_id, message, &sig).is_ok());
    }

    #[test]
    fn tampered_message_fails() {
        let kp = KeyPair::generate();
        let sig = Signer::sign(&kp, b"original");
        assert!(matches!(
            verify_signature(&kp.owner_id, b"tampered", &sig),
            Err(JuiceError::BadSignature)
        ));
    }

    #[test]
    fn wrong_key_fails() {
        let kp = KeyPair::generate();
        let other = KeyPair::generate();
        let sig = Signer::sign(&kp, b"msg");
        assert!(verify_signature(&other.owner_id, b"msg", &sig).is_err());
    }

    #[test]
    fn truncated_signature_fails() {
        let kp = KeyPair::generate();
        let mut sig = Signer::sign(&kp, b"msg");
        sig.0.truncate(63);
        assert!(verify_signature(&kp.owner_id, b"msg", &sig).is_err());
    }

    #[test]
    fn ownership_proof_round_trip() {
        use juice_core::telomeer::Telomeer;
        use juice_core::types::{TokenId, TransactionId};

        let kp = KeyPair::generate();
        let previous = KeyPair::generate();
        let mut telomeer = Telomeer::genesis(TokenId::from_bytes([3u8; 32]), previous.owner_id);
        telomeer
            .transfer(kp.owner_id, TransactionId::generate())
            .unwrap();

        let body = telomeer.proof_body(9_000);
        let signature = Signer::sign(&kp, &body.signing_bytes());
        let proof = juice_core::telomeer::OwnershipProof {
            body,
            owner: kp.owner_id,
            signature,
            tee_countersignature: None,
        };
        verify_ownership_proof(&proof).unwrap();

        // A proof claiming someone else's ownership fails.
        let mut forged = proof.clone();
        forged.owner = previous.owner_id;
        assert!(matches!(
            verify_ownership_proof(&forged),
            Err(JuiceError::InvalidTelomeerSignature)
        ));
    }

    #[test]
    fn hmac_signer_round_trip() {
        let signer = HmacSigner::new([42u8; 32]);
        let sig = signer.sign(b"test vector");
        assert_eq!(sig.0.len(), 64);
        assert!(signer.verify(b"test vector", &sig).is_ok());
        assert!(signer.verify(b"other", &sig).is_err());
    }
}
