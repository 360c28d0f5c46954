//! Post-hoc resolution of inconclusive transactions.
//!
//! Once a sender has passed the point of no return, only the replicated
//! attestation store can conclude the transaction: either the receiver's
//! finalization receipt appears within the resolution window and the
//! sender commits, or the sender rolls back from its RetroPak state and
//! publishes the abort.

use std::time::Duration;

use juice_core::error::JuiceError;
use juice_core::types::{OwnerId, Signature, TimestampMs, TransactionId};
use juice_crypto::{verify_signature, Signer};
use juice_store::AttestationQuery;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::engine::{TransactionEngine, TransactionReceipt};
use crate::state::TransactionRecord;
use crate::wire::encode_telomeer;

/// How long receipts stay queryable. Generous compared to the resolution
/// window so late resolvers still find them.
const RECEIPT_TTL_SECONDS: u64 = 24 * 3600;

const RECEIPT_REPLICATION: u8 = 3;

// ── Receipt attestations ─────────────────────────────────────────────────────

/// A commit receipt published to the attestation store: the finalization
/// flavor is the receiver's proof that the transaction concluded, which
/// an inconclusive sender resolves against. Telomeers travel in the
/// stable wire encoding so any implementation can re-verify ownership.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReceiptAttestation {
    pub transaction_id: TransactionId,
    pub issuer: OwnerId,
    pub counterparty: OwnerId,
    pub chain_head: [u8; 32],
    pub timestamp_ms: TimestampMs,
    /// Wire-encoded Telomeers of the tokens the issuer now holds.
    pub telomeers: Vec<Vec<u8>>,
    pub signature: Signature,
}

impl ReceiptAttestation {
    fn signing_bytes(
        transaction_id: &TransactionId,
        issuer: &OwnerId,
        counterparty: &OwnerId,
        chain_head: &[u8; 32],
        timestamp_ms: TimestampMs,
        telomeers: &[Vec<u8>],
    ) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(transaction_id.as_bytes());
        buf.extend_from_slice(issuer.as_bytes());
        buf.extend_from_slice(counterparty.as_bytes());
        buf.extend_from_slice(chain_head);
        buf.extend_from_slice(&timestamp_ms.to_le_bytes());
        for t in telomeers {
            buf.extend_from_slice(&juice_crypto::sha256(t));
        }
        buf
    }

    pub fn create(
        transaction_id: TransactionId,
        counterparty: OwnerId,
        chain_head: [u8; 32],
        timestamp_ms: TimestampMs,
        telomeers: Vec<Vec<u8>>,
        signer: &dyn Signer,
    ) -> Self {
        let issuer = signer.owner_id();
        let bytes = Self::signing_bytes(
            &transaction_id,
            &issuer,
            &counterparty,
            &chain_head,
            timestamp_ms,
            &telomeers,
        );
        Self {
            transaction_id,
            issuer,
            counterparty,
            chain_head,
            timestamp_ms,
            telomeers,
            signature: signer.sign(&bytes),
        }
    }

    pub fn verify(&self, expected_issuer: &OwnerId) -> Result<(), JuiceError> {
        if self.issuer != *expected_issuer {
            return Err(JuiceError::BadSignature);
        }
        let bytes = Self::signing_bytes(
            &self.transaction_id,
            &self.issuer,
            &self.counterparty,
            &self.chain_head,
            self.timestamp_ms,
            &self.telomeers,
        );
        verify_signature(&self.issuer, &bytes, &self.signature)
    }
}

/// Abort notice for counterparties resolving later.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AbortAttestation {
    pub transaction_id: TransactionId,
    pub issuer: OwnerId,
    pub reason: String,
    pub timestamp_ms: TimestampMs,
    pub signature: Signature,
}

impl AbortAttestation {
    fn signing_bytes(
        transaction_id: &TransactionId,
        issuer: &OwnerId,
        reason: &str,
        timestamp_ms: TimestampMs,
    ) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(transaction_id.as_bytes());
        buf.extend_from_slice(issuer.as_bytes());
        buf.extend_from_slice(reason.as_bytes());
        buf.extend_from_slice(&timestamp_ms.to_le_bytes());
        buf
    }

    pub fn create(
        transaction_id: TransactionId,
        reason: String,
        timestamp_ms: TimestampMs,
        signer: &dyn Signer,
    ) -> Self {
        let issuer = signer.owner_id();
        let bytes = Self::signing_bytes(&transaction_id, &issuer, &reason, timestamp_ms);
        Self {
            transaction_id,
            issuer,
            reason,
            timestamp_ms,
            signature: signer.sign(&bytes),
        }
    }
}

// ── Publication ──────────────────────────────────────────────────────────────

fn wire_telomeers(engine: &TransactionEngine, receipt: &TransactionReceipt) -> Vec<Vec<u8>> {
    receipt
        .received
        .iter()
        .filter_map(|id| engine.store().get_telomeer(id).ok().flatten())
        .map(|t| encode_telomeer(&t))
        .collect()
}

async fn publish_receipt(
    engine: &TransactionEngine,
    record: &TransactionRecord,
    receipt: &TransactionReceipt,
    kind: &str,
) {
    let attestation = ReceiptAttestation::create(
        record.transaction_id,
        record.counterparty,
        receipt.chain_head,
        engine.time().now_ms(),
        wire_telomeers(engine, receipt),
        engine.keypair().as_ref(),
    );
    let key = format!("tx/{}/{kind}", record.transaction_id);
    let value = bincode::serialize(&attestation).expect("attestation serialization is infallible");
    if let Err(err) = engine
        .dht()
        .publish(&key, value, 0, RECEIPT_TTL_SECONDS, RECEIPT_REPLICATION)
        .await
    {
        warn!(key, error = %err, "receipt publication failed");
    }
}

/// The receiver's finalization receipt; what an inconclusive sender
/// resolves against.
pub(crate) async fn publish_finalization(
    engine: &TransactionEngine,
    record: &TransactionRecord,
    receipt: &TransactionReceipt,
) {
    publish_receipt(engine, record, receipt, "finalization").await;
}

/// The sender's commit receipt, for future counterparties of these
/// tokens.
pub(crate) async fn publish_commitment(
    engine: &TransactionEngine,
    record: &TransactionRecord,
    receipt: &TransactionReceipt,
) {
    publish_receipt(engine, record, receipt, "commitment").await;
}

async fn publish_abort(engine: &TransactionEngine, record: &TransactionRecord, reason: &str) {
    let attestation = AbortAttestation::create(
        record.transaction_id,
        reason.to_string(),
        engine.time().now_ms(),
        engine.keypair().as_ref(),
    );
    let key = format!("tx/{}/abort", record.transaction_id);
    let value = bincode::serialize(&attestation).expect("attestation serialization is infallible");
    if let Err(err) = engine
        .dht()
        .publish(&key, value, 0, RECEIPT_TTL_SECONDS, RECEIPT_REPLICATION)
        .await
    {
        warn!(key, error = %err, "abort publication failed");
    }
}

// ── Resolution ───────────────────────────────────────────────────────────────

/// Poll the attestation store for the receiver's finalization. Found
/// within the window: apply the commit locally. Not found: roll back from
/// the RetroPak state and publish the abort. Only this function concludes
/// a transaction that passed the point of no return.
pub(crate) async fn resolve_inconclusive(
    engine: &TransactionEngine,
    record: &mut TransactionRecord,
    includes_wissel: bool,
) -> Result<TransactionReceipt, JuiceError> {
    let transaction_id = record.transaction_id;
    let deadline = engine.time().now_ms() + engine.config().resolution_window_ms;
    let key = format!("tx/{transaction_id}/finalization");
    info!(tx = %transaction_id, "resolving inconclusive transaction");

    let mut attempt = 0u32;
    loop {
        let page = engine
            .dht()
            .query(&AttestationQuery {
                key_prefix: key.clone(),
                s2_cell_id: None,
                max_results: 1,
                continuation: None,
            })
            .await?;

        if let Some(envelope) = page.envelopes.first() {
            let attestation: ReceiptAttestation = bincode::deserialize(&envelope.value)
                .map_err(|e| JuiceError::Serialization(e.to_string()))?;
            attestation.verify(&record.counterparty)?;
            record.counterparty_head = attestation.chain_head;

            let receipt = engine.commit_sender(record, includes_wissel)?;
            publish_commitment(engine, record, &receipt).await;
            engine.store().clear_journal(&transaction_id)?;
            info!(tx = %transaction_id, "resolution concluded: committed");
            return Ok(receipt);
        }

        if engine.time().now_ms() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(engine.config().retry_delay_ms(attempt))).await;
        attempt += 1;
    }

    // No finalization surfaced: unilateral rollback from local state.
    engine
        .abort_local(None, record, "resolution window elapsed without finalization")
        .await?;
    publish_abort(engine, record, "resolution window elapsed").await;
    info!(tx = %transaction_id, "resolution concluded: rolled back");
    Err(JuiceError::TransactionAborted {
        transaction_id,
        reason: "resolution window elapsed without finalization".into(),
    })
}
