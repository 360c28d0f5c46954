pub mod hash;
pub mod keypair;
pub mod sign;

pub use hash::{derive_commitment, hash_stack, random, random32, sha256};
pub use keypair::KeyPair;
pub use sign::{verify_ownership_proof, verify_signature, HmacSigner, Signer};
