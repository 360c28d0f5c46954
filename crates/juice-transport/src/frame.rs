use std::collections::BTreeMap;

use juice_core::constants::PROTOCOL_VERSION;
use juice_core::types::TimestampMs;
use serde::{Deserialize, Serialize};

/// Frame classes on the framed duplex.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameType {
    Data,
    Control,
    Ack,
}

/// One transport frame. Chunking is the transport's concern; the core's
/// framer only reassembles and deduplicates by sequence number.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    pub frame_id: u64,
    pub frame_type: FrameType,
    pub payload: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    pub timestamp_ms: TimestampMs,
    pub compression: Option<String>,
    pub chunk_index: u32,
    pub chunk_count: u32,
    pub protocol_version: u8,
    pub sequence_number: u64,
}

impl Frame {
    pub fn data(sequence_number: u64, payload: Vec<u8>, timestamp_ms: TimestampMs) -> Self {
        Self {
            frame_id: sequence_number,
            frame_type: FrameType::Data,
            payload,
            headers: BTreeMap::new(),
            timestamp_ms,
            compression: None,
            chunk_index: 0,
            chunk_count: 1,
            protocol_version: PROTOCOL_VERSION,
            sequence_number,
        }
    }

    pub fn ack(sequence_number: u64, timestamp_ms: TimestampMs) -> Self {
        Self {
            frame_type: FrameType::Ack,
            payload: Vec::new(),
            ..Self::data(sequence_number, Vec::new(), timestamp_ms)
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("frame serialization is infallible")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let mut frame = Frame::data(9, b"payload".to_vec(), 1_000);
        frame.headers.insert("route".into(), "ble".into());
        let back = Frame::from_bytes(&frame.to_bytes()).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn ack_has_no_payload() {
        let frame = Frame::ack(3, 1_000);
        assert_eq!(frame.frame_type, FrameType::Ack);
        assert!(frame.payload.is_empty());
        assert_eq!(frame.sequence_number, 3);
    }
}
