use async_trait::async_trait;
use juice_core::error::JuiceError;
use serde::{Deserialize, Serialize};

/// Evidence returned by a hardware attestation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TeeAttestation {
    pub attestation_data: Vec<u8>,
    /// Vendor / enclave description string.
    pub tee_info: String,
}

/// The hardware security capability the core consumes. Absence is always
/// permitted; outputs produced without a TEE countersignature simply carry
/// a lower confidence.
#[async_trait]
pub trait HardwareSecurity: Send + Sync {
    fn is_available(&self) -> bool;

    /// Attest over a caller-chosen challenge; `None` when unavailable.
    async fn attest(&self, challenge: &[u8]) -> Result<Option<TeeAttestation>, JuiceError>;

    async fn execute_secure(&self, name: &str, args: &[u8]) -> Result<Vec<u8>, JuiceError>;

    async fn store_secure(&self, key: &str, data: &[u8]) -> Result<bool, JuiceError>;

    async fn retrieve_secure(&self, key: &str) -> Result<Option<Vec<u8>>, JuiceError>;
}

/// The no-hardware implementation: never available, never stores.
#[derive(Default)]
pub struct NullTee;

#[async_trait]
impl HardwareSecurity for NullTee {
    fn is_available(&self) -> bool {
        false
    }

    async fn attest(&self, _challenge: &[u8]) -> Result<Option<TeeAttestation>, JuiceError> {
        Ok(None)
    }

    async fn execute_secure(&self, name: &str, _args: &[u8]) -> Result<Vec<u8>, JuiceError> {
        Err(JuiceError::Storage(format!(
            "secure execution unavailable: {name}"
        )))
    }

    async fn store_secure(&self, _key: &str, _data: &[u8]) -> Result<bool, JuiceError> {
        Ok(false)
    }

    async fn retrieve_secure(&self, _key: &str) -> Result<Option<Vec<u8>>, JuiceError> {
        Ok(None)
    }
}
