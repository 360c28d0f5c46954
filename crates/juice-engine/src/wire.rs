use juice_core::constants::{
    BODY_TAG_ABORT, BODY_TAG_COMMITMENT, BODY_TAG_FINALIZATION, BODY_TAG_INITIATION,
    BODY_TAG_PREPARATION, BODY_TAG_SEED,
};
use juice_core::error::JuiceError;
use juice_core::telomeer::Telomeer;
use juice_core::types::{Amount, OwnerHash, OwnerId, Signature, TimestampMs, TokenId, TransactionId};
use juice_crypto::{verify_signature, Signer};
use serde::{Deserialize, Serialize};

// ── Message bodies ───────────────────────────────────────────────────────────

/// Protocol step payloads. Bincode-encoded inside the hand-coded envelope;
/// the envelope's tag byte must agree with the variant.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum MessageBody {
    /// Step 1, receiver → sender. Opens the transaction.
    Seed {
        seed: [u8; 32],
        /// Receiver's packed denomination vector clock.
        vector_clock: u32,
    },
    /// Step 2, sender → receiver.
    Initiation {
        context: String,
        amount: Amount,
        /// Whole units the sender materialized out of their Wissel buffer.
        sender_borrow: u8,
        s_exo: crate::pak::Pak,
        /// Sender's packed denomination vector clock.
        vector_clock: u32,
        /// Sender's chain head, referenced by the receiver's commit entry.
        chain_head: [u8; 32],
    },
    /// Step 3, receiver → sender.
    Preparation {
        r_exo: crate::pak::Pak,
        /// Digest of the receiver's retro pak, retained on their side.
        r_retro_id: [u8; 32],
    },
    /// Step 4, sender → receiver. The sender's point of no return; the
    /// envelope signature doubles as the commitment signature.
    Commitment { s_retro: crate::pak::Pak },
    /// Step 5, receiver → sender. The envelope signature is the
    /// finalization signature.
    Finalization {
        /// Receiver's chain head after its commit entry.
        chain_head: [u8; 32],
    },
    /// Either direction: structured abort.
    Abort { reason: String },
}

impl MessageBody {
    pub fn tag(&self) -> u8 {
        match self {
            MessageBody::Seed { .. } => BODY_TAG_SEED,
            MessageBody::Initiation { .. } => BODY_TAG_INITIATION,
            MessageBody::Preparation { .. } => BODY_TAG_PREPARATION,
            MessageBody::Commitment { .. } => BODY_TAG_COMMITMENT,
            MessageBody::Finalization { .. } => BODY_TAG_FINALIZATION,
            MessageBody::Abort { .. } => BODY_TAG_ABORT,
        }
    }
}

// ── Envelope ─────────────────────────────────────────────────────────────────

/// The stable on-the-wire transaction envelope:
///
/// ```text
/// 16B transaction_id | 1B type | 32B sender_pub | 32B receiver_pub |
/// 8B timestamp_ms LE | 4B body length LE | body | 64B signature
/// ```
///
/// The signature covers every preceding byte. All integers little-endian.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub transaction_id: TransactionId,
    pub sender: OwnerId,
    pub receiver: OwnerId,
    pub timestamp_ms: TimestampMs,
    pub body: MessageBody,
    pub signature: Signature,
}

const ENVELOPE_HEADER_LEN: usize = 16 + 1 + 32 + 32 + 8 + 4;
const SIGNATURE_LEN: usize = 64;

impl Envelope {
    fn preamble(
        transaction_id: &TransactionId,
        sender: &OwnerId,
        receiver: &OwnerId,
        timestamp_ms: TimestampMs,
        body: &MessageBody,
    ) -> Vec<u8> {
        let body_bytes =
            bincode::serialize(body).expect("message body serialization is infallible");
        let mut buf = Vec::with_capacity(ENVELOPE_HEADER_LEN + body_bytes.len() + SIGNATURE_LEN);
        buf.extend_from_slice(transaction_id.as_bytes());
        buf.push(body.tag());
        buf.extend_from_slice(sender.as_bytes());
        buf.extend_from_slice(receiver.as_bytes());
        buf.extend_from_slice(&timestamp_ms.to_le_bytes());
        buf.extend_from_slice(&(body_bytes.len() as u32).to_le_bytes());
        buf.extend_from_slice(&body_bytes);
        buf
    }

    /// Sign and encode for the wire.
    pub fn seal(
        transaction_id: TransactionId,
        receiver: OwnerId,
        timestamp_ms: TimestampMs,
        body: MessageBody,
        signer: &dyn Signer,
    ) -> Vec<u8> {
        let mut buf = Self::preamble(&transaction_id, &signer.owner_id(), &receiver, timestamp_ms, &body);
        let signature = signer.sign(&buf);
        buf.extend_from_slice(signature.as_bytes());
        buf
    }

    /// Decode and verify the sender's signature.
    pub fn open(bytes: &[u8]) -> Result<Self, JuiceError> {
        if bytes.len() < ENVELOPE_HEADER_LEN + SIGNATURE_LEN {
            return Err(JuiceError::WireFormat("envelope too short".into()));
        }
        let mut txid = [0u8; 16];
        txid.copy_from_slice(&bytes[0..16]);
        let tag = bytes[16];
        let mut sender = [0u8; 32];
        sender.copy_from_slice(&bytes[17..49]);
        let mut receiver = [0u8; 32];
        receiver.copy_from_slice(&bytes[49..81]);
        let timestamp_ms = u64::from_le_bytes(
            bytes[81..89].try_into().expect("eight bytes"),
        );
        let body_len = u32::from_le_bytes(bytes[89..93].try_into().expect("four bytes")) as usize;
        let expected_len = ENVELOPE_HEADER_LEN + body_len + SIGNATURE_LEN;
        if bytes.len() != expected_len {
            return Err(JuiceError::WireFormat(format!(
                "envelope length {} does not match header ({expected_len})",
                bytes.len()
            )));
        }
        let body_bytes = &bytes[ENVELOPE_HEADER_LEN..ENVELOPE_HEADER_LEN + body_len];
        let body: MessageBody = bincode::deserialize(body_bytes)
            .map_err(|e| JuiceError::WireFormat(format!("malformed body: {e}")))?;
        if body.tag() != tag {
            return Err(JuiceError::WireFormat(format!(
                "envelope tag {tag} does not match body tag {}",
                body.tag()
            )));
        }

        let sender = OwnerId::from_bytes(sender);
        let signed = &bytes[..ENVELOPE_HEADER_LEN + body_len];
        let signature = Signature(bytes[ENVELOPE_HEADER_LEN + body_len..].to_vec());
        verify_signature(&sender, signed, &signature)?;

        Ok(Self {
            transaction_id: TransactionId::from_bytes(txid),
            sender,
            receiver: OwnerId::from_bytes(receiver),
            timestamp_ms,
            body,
            signature,
        })
    }
}

// ── Telomeer wire codec ──────────────────────────────────────────────────────

/// Stable Telomeer encoding for attestations and cross-implementation
/// verification:
///
/// ```text
/// 32B token_id | 32B current_owner | 32B hash_previous_owner |
/// varint history count | 32B per entry
/// ```
pub fn encode_telomeer(t: &Telomeer) -> Vec<u8> {
    let mut buf = Vec::with_capacity(96 + 5 + 32 * t.hash_history.len());
    buf.extend_from_slice(t.token_id.as_bytes());
    buf.extend_from_slice(t.current_owner.as_bytes());
    buf.extend_from_slice(t.hash_previous_owner.as_bytes());
    write_varint(&mut buf, t.hash_history.len() as u64);
    for h in &t.hash_history {
        buf.extend_from_slice(h.as_bytes());
    }
    buf
}

pub fn decode_telomeer(bytes: &[u8]) -> Result<Telomeer, JuiceError> {
    if bytes.len() < 96 {
        return Err(JuiceError::WireFormat("telomeer too short".into()));
    }
    let take32 = |offset: usize| -> [u8; 32] {
        bytes[offset..offset + 32].try_into().expect("32 bytes")
    };
    let token_id = TokenId::from_bytes(take32(0));
    let current_owner = OwnerId::from_bytes(take32(32));
    let hash_previous_owner = OwnerHash::from_bytes(take32(64));

    let (count, mut offset) = read_varint(bytes, 96)?;
    let mut hash_history = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if offset + 32 > bytes.len() {
            return Err(JuiceError::WireFormat("telomeer history truncated".into()));
        }
        hash_history.push(OwnerHash::from_bytes(take32(offset)));
        offset += 32;
    }
    if offset != bytes.len() {
        return Err(JuiceError::WireFormat("trailing bytes after telomeer".into()));
    }

    let mut telomeer = Telomeer {
        token_id,
        current_owner,
        hash_previous_owner,
        hash_history,
        head: [0u8; 32],
    };
    telomeer.head = telomeer.compute_head();
    Ok(telomeer)
}

/// LEB128 unsigned varint.
fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

fn read_varint(bytes: &[u8], mut offset: usize) -> Result<(u64, usize), JuiceError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *bytes
            .get(offset)
            .ok_or_else(|| JuiceError::WireFormat("varint truncated".into()))?;
        offset += 1;
        value |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, offset));
        }
        shift += 7;
        if shift >= 64 {
            return Err(JuiceError::WireFormat("varint overflow".into()));
        }
    }
}
