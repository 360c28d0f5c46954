use std::collections::BTreeMap;

use crate::frame::{Frame, FrameType};

/// Reorders and deduplicates incoming DATA frames by sequence number so
/// the protocol layer sees logical messages in order, whatever the
/// transport delivered.
#[derive(Default)]
pub struct Framer {
    next_sequence: u64,
    pending: BTreeMap<u64, Frame>,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one received frame; returns every payload that became
    /// deliverable in order. Duplicates and stale frames are dropped.
    pub fn push(&mut self, frame: Frame) -> Vec<Vec<u8>> {
        if frame.frame_type != FrameType::Data {
            return Vec::new();
        }
        if frame.sequence_number < self.next_sequence {
            return Vec::new(); // Duplicate of something already delivered.
        }
        self.pending.insert(frame.sequence_number, frame);

        let mut out = Vec::new();
        while let Some(frame) = self.pending.remove(&self.next_sequence) {
            out.push(frame.payload);
            self.next_sequence += 1;
        }
        out
    }

    /// Sequence number the next outgoing frame should carry.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(seq: u64) -> Frame {
        Frame::data(seq, vec![seq as u8], 1_000)
    }

    #[test]
    fn in_order_delivery() {
        let mut f = Framer::new();
        assert_eq!(f.push(data(0)), vec![vec![0]]);
        assert_eq!(f.push(data(1)), vec![vec![1]]);
    }

    #[test]
    fn reorders_out_of_order_frames() {
        let mut f = Framer::new();
        assert!(f.push(data(2)).is_empty());
        assert!(f.push(data(1)).is_empty());
        assert_eq!(f.push(data(0)), vec![vec![0], vec![1], vec![2]]);
        assert_eq!(f.in_flight(), 0);
    }

    #[test]
    fn drops_duplicates() {
        let mut f = Framer::new();
        f.push(data(0));
        assert!(f.push(data(0)).is_empty());
        assert_eq!(f.push(data(1)), vec![vec![1]]);
    }

    #[test]
    fn ignores_acks() {
        let mut f = Framer::new();
        assert!(f.push(Frame::ack(0, 1_000)).is_empty());
        assert_eq!(f.push(data(0)), vec![vec![0]]);
    }
}
