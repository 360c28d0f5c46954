use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use juice_core::error::JuiceError;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tracing::trace;

use crate::frame::Frame;
use crate::framer::Framer;

/// A bidirectional logical-message duplex. Implementations frame, chunk,
/// acknowledge, and reassemble; the protocol layer sends and receives
/// whole messages. Disconnection surfaces as `TransportFailed`.
#[async_trait]
pub trait MessagePipe: Send + Sync {
    async fn send(&self, message: Vec<u8>) -> Result<(), JuiceError>;
    async fn recv(&self) -> Result<Vec<u8>, JuiceError>;
}

// ── In-memory pipe ───────────────────────────────────────────────────────────

/// One endpoint of an in-process duplex. Messages travel as DATA frames
/// through the sequence-number framer, so the frame path is exercised even
/// in tests.
pub struct MemoryPipe {
    tx: StdMutex<Option<mpsc::UnboundedSender<Frame>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Frame>>,
    next_sequence: AtomicU64,
    framer: StdMutex<Framer>,
    ready: StdMutex<VecDeque<Vec<u8>>>,
}

/// A connected pair of endpoints.
pub fn memory_pipe() -> (MemoryPipe, MemoryPipe) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (MemoryPipe::new(a_tx, b_rx), MemoryPipe::new(b_tx, a_rx))
}

impl MemoryPipe {
    fn new(tx: mpsc::UnboundedSender<Frame>, rx: mpsc::UnboundedReceiver<Frame>) -> Self {
        Self {
            tx: StdMutex::new(Some(tx)),
            rx: Mutex::new(rx),
            next_sequence: AtomicU64::new(0),
            framer: StdMutex::new(Framer::new()),
            ready: StdMutex::new(VecDeque::new()),
        }
    }

    /// Simulate a mid-protocol disconnect: both directions die.
    pub fn sever(&self) {
        self.tx.lock().expect("pipe lock").take();
    }
}

#[async_trait]
impl MessagePipe for MemoryPipe {
    async fn send(&self, message: Vec<u8>) -> Result<(), JuiceError> {
        let seq = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let frame = Frame::data(seq, message, 0);
        trace!(seq, "pipe send");
        let guard = self.tx.lock().expect("pipe lock");
        let tx = guard
            .as_ref()
            .ok_or_else(|| JuiceError::TransportFailed("pipe severed".into()))?;
        tx.send(frame)
            .map_err(|_| JuiceError::TransportFailed("peer disconnected".into()))
    }

    async fn recv(&self) -> Result<Vec<u8>, JuiceError> {
        loop {
            if let Some(message) = self.ready.lock().expect("pipe lock").pop_front() {
                return Ok(message);
            }
            let frame = {
                let mut rx = self.rx.lock().await;
                rx.recv()
                    .await
                    .ok_or_else(|| JuiceError::TransportFailed("peer disconnected".into()))?
            };
            let delivered = self.framer.lock().expect("pipe lock").push(frame);
            self.ready.lock().expect("pipe lock").extend(delivered);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_both_directions() {
        let (alice, bob) = memory_pipe();
        alice.send(b"hello".to_vec()).await.unwrap();
        assert_eq!(bob.recv().await.unwrap(), b"hello");

        bob.send(b"world".to_vec()).await.unwrap();
        assert_eq!(alice.recv().await.unwrap(), b"world");
    }

    #[tokio::test]
    async fn messages_arrive_in_order() {
        let (alice, bob) = memory_pipe();
        for n in 0..10u8 {
            alice.send(vec![n]).await.unwrap();
        }
        for n in 0..10u8 {
            assert_eq!(bob.recv().await.unwrap(), vec![n]);
        }
    }

    #[tokio::test]
    async fn severed_pipe_fails_send_and_recv() {
        let (alice, bob) = memory_pipe();
        alice.sever();
        assert!(matches!(
            alice.send(b"x".to_vec()).await,
            Err(JuiceError::TransportFailed(_))
        ));
        assert!(matches!(
            bob.recv().await,
            Err(JuiceError::TransportFailed(_))
        ));
    }
}
