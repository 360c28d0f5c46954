use ed25519_dalek::{Signer as DalekSigner, SigningKey, VerifyingKey};
use juice_core::types::{OwnerId, Signature};
use rand::rngs::OsRng;
use zeroize::Zeroizing;

/// A participant keypair: Ed25519 verifying key plus the 32-byte seed held
/// in a `Zeroizing` buffer so it is wiped on drop.
pub struct KeyPair {
    pub owner_id: OwnerId,
    verifying: VerifyingKey,
    seed: Zeroizing<[u8; 32]>,
}

impl KeyPair {
    /// Generate a fresh Ed25519 keypair from the OS RNG.
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        Self::from_seed(signing.to_bytes())
    }

    /// Restore a keypair from a stored 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(&seed);
        let verifying = signing.verifying_key();
        Self {
            owner_id: OwnerId::from_bytes(verifying.to_bytes()),
            verifying,
            seed: Zeroizing::new(seed),
        }
    }

    /// Sign `message`, producing a 64-byte detached signature.
    pub fn sign(&self, message: &[u8]) -> Signature {
        let signing = SigningKey::from_bytes(&self.seed);
        Signature(signing.sign(message).to_bytes().to_vec())
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying
    }

    /// Read-only view of the seed bytes (wallet export).
    pub fn seed_bytes(&self) -> &[u8; 32] {
        &self.seed
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyPair {{ owner_id: {:?} }}", self.owner_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_id_is_verifying_key_bytes() {
        let kp = KeyPair::generate();
        assert_eq!(kp.owner_id.as_bytes(), &kp.verifying_key().to_bytes());
    }

    #[test]
    fn seed_restores_same_identity() {
        let kp = KeyPair::generate();
        let restored = KeyPair::from_seed(*kp.seed_bytes());
        assert_eq!(kp.owner_id, restored.owner_id);
    }

    #[test]
    fn debug_only_prints_owner_id() {
        let kp = KeyPair::generate();
        let rendered = format!("{:?}", kp);
        assert_eq!(rendered, format!("KeyPair {{ owner_id: {:?} }}", kp.owner_id));
    }
}
