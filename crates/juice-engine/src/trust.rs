//! Trust attestations about counterparties, replicated through the
//! attestation store and mirrored on the issuer's Personal Chain.

use juice_core::error::JuiceError;
use juice_core::types::{OwnerId, Signature, TimestampMs};
use juice_crypto::{verify_signature, Signer};
use juice_store::{AttestationEnvelope, AttestationQuery};
use serde::{Deserialize, Serialize};
use tracing::info;

/// A signed statement one participant publishes about another. The
/// payload is opaque to the core; the trust layer decides what it means.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TrustAttestation {
    pub issuer: OwnerId,
    pub subject: OwnerId,
    pub payload: Vec<u8>,
    pub timestamp_ms: TimestampMs,
    pub signature: Signature,
}

impl TrustAttestation {
    fn signing_bytes(
        issuer: &OwnerId,
        subject: &OwnerId,
        payload: &[u8],
        timestamp_ms: TimestampMs,
    ) -> Vec<u8> {
        let mut buf = Vec::with_capacity(72 + payload.len());
        buf.extend_from_slice(issuer.as_bytes());
        buf.extend_from_slice(subject.as_bytes());
        buf.extend_from_slice(payload);
        buf.extend_from_slice(&timestamp_ms.to_le_bytes());
        buf
    }

    pub fn create(
        subject: OwnerId,
        payload: Vec<u8>,
        timestamp_ms: TimestampMs,
        signer: &dyn Signer,
    ) -> Self {
        let issuer = signer.owner_id();
        let bytes = Self::signing_bytes(&issuer, &subject, &payload, timestamp_ms);
        Self {
            issuer,
            subject,
            payload,
            timestamp_ms,
            signature: signer.sign(&bytes),
        }
    }

    pub fn verify(&self) -> Result<(), JuiceError> {
        let bytes =
            Self::signing_bytes(&self.issuer, &self.subject, &self.payload, self.timestamp_ms);
        verify_signature(&self.issuer, &bytes, &self.signature)
    }

    /// DHT key: prefix-queryable by subject.
    pub fn key(&self) -> String {
        format!("trust/{}/{}", self.subject, self.issuer)
    }
}

impl crate::engine::TransactionEngine {
    /// Publish a trust attestation about `subject` and journal it on this
    /// user's chain.
    pub async fn attest_trust(
        &self,
        subject: OwnerId,
        payload: Vec<u8>,
        s2_cell_id: u64,
        ttl_seconds: u64,
    ) -> Result<String, JuiceError> {
        let attestation = TrustAttestation::create(
            subject,
            payload,
            self.time().now_ms(),
            self.keypair().as_ref(),
        );
        let key = attestation.key();
        let value =
            bincode::serialize(&attestation).expect("attestation serialization is infallible");
        self.dht().publish(&key, value, s2_cell_id, ttl_seconds, 3).await?;
        self.record_attestation_given(subject, &key)?;
        info!(%subject, key, "trust attestation published");
        Ok(key)
    }

    /// Fetch and verify every live trust attestation about `subject`.
    pub async fn trust_attestations(
        &self,
        subject: &OwnerId,
    ) -> Result<Vec<TrustAttestation>, JuiceError> {
        let mut out = Vec::new();
        let mut continuation = None;
        loop {
            let page = self
                .dht()
                .query(&AttestationQuery {
                    key_prefix: format!("trust/{subject}/"),
                    s2_cell_id: None,
                    max_results: 64,
                    continuation,
                })
                .await?;
            for envelope in &page.envelopes {
                if let Some(attestation) = decode_verified(envelope, subject) {
                    out.push(attestation);
                }
            }
            match page.continuation {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }
        Ok(out)
    }
}

fn decode_verified(envelope: &AttestationEnvelope, subject: &OwnerId) -> Option<TrustAttestation> {
    let attestation: TrustAttestation = bincode::deserialize(&envelope.value).ok()?;
    if attestation.subject != *subject || attestation.verify().is_err() {
        return None;
    }
    Some(attestation)
}
