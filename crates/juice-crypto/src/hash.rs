use rand::RngCore;

/// SHA-256 of arbitrary bytes → 32-byte array. Re-exported from the core
/// types so every crate hashes through one definition.
pub use juice_core::types::sha256;

/// Merkle-style hash stacking: SHA-256 over the concatenation of the parts
/// in order.
pub fn hash_stack(parts: &[&[u8]]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut h = Sha256::new();
    for p in parts {
        h.update(p);
    }
    h.finalize().into()
}

/// Commitment to entropy: SHA-256 of the entropy bytes.
pub fn derive_commitment(entropy: &[u8]) -> [u8; 32] {
    sha256(entropy)
}

/// `n` bytes from the OS RNG.
pub fn random(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

/// 32 random bytes, the transaction seed width.
pub fn random32() -> [u8; 32] {
    let mut buf = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

/// Constant-time 32-byte equality.
pub fn ct_eq32(a: &[u8; 32], b: &[u8; 32]) -> bool {
    use subtle::ConstantTimeEq;
    a.ct_eq(b).into()
}
