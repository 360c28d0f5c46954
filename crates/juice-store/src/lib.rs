pub mod dht;
pub mod kv;
pub mod tee;
pub mod token_store;

pub use dht::{AttestationEnvelope, AttestationQuery, AttestationStore, MemoryDht, QueryPage};
pub use kv::{Kv, MemoryKv, SledKv};
pub use tee::{HardwareSecurity, NullTee, TeeAttestation};
pub use token_store::{SeedRecord, TokenStore};
