use tokio::sync::watch;

/// Cooperative cancellation for waiting operations. Every suspension
/// point in the engine selects over its token; cancellation mid-protocol
/// triggers the abort path, never a silent drop.
#[derive(Clone)]
pub struct CancelToken {
    rx: Option<watch::Receiver<bool>>,
}

/// The triggering end.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// A connected handle/token pair.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx: Some(rx) })
}

impl CancelToken {
    /// A token that never fires.
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Resolves when cancellation is requested (or the handle is dropped).
    pub async fn cancelled(&self) {
        let Some(rx) = &self.rx else {
            return std::future::pending().await;
        };
        let mut rx = rx.clone();
        if *rx.borrow() {
            return;
        }
        loop {
            if rx.changed().await.is_err() {
                return; // Handle dropped: treat as cancelled.
            }
            if *rx.borrow() {
                return;
            }
        }
    }
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}
