//! Physical channels.
//!
//! A channel moves opaque wire values in order from one origin to one peer.
//! It knows nothing about envelopes. `post` is fire-and-forget; `next` yields
//! `None` once the channel is closed on either side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use ctxbridge_core::error::{BridgeError, Result};
use ctxbridge_core::protocol::WireValue;

#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Short name used in logs.
    fn label(&self) -> &str;
    /// Queue a value for the peer. Fails once the channel is closed.
    fn post(&self, wire: WireValue) -> Result<()>;
    /// Next value from the peer, `None` when the channel is closed.
    async fn next(&self) -> Option<WireValue>;
    /// Close this end. The peer observes end-of-channel after draining.
    fn close(&self);
}

/// One end of an in-process channel pair (worker-port style).
pub struct MemoryChannel {
    label: String,
    tx: Mutex<Option<mpsc::UnboundedSender<WireValue>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<WireValue>>,
    closed: AtomicBool,
    shutdown: Notify,
}

/// Create two connected channel ends.
pub fn memory_pair(label: &str) -> (MemoryChannel, MemoryChannel) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        MemoryChannel::new(format!("{label}/a"), a_tx, a_rx),
        MemoryChannel::new(format!("{label}/b"), b_tx, b_rx),
    )
}

impl MemoryChannel {
    fn new(
        label: String,
        tx: mpsc::UnboundedSender<WireValue>,
        rx: mpsc::UnboundedReceiver<WireValue>,
    ) -> Self {
        Self {
            label,
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn post(&self, wire: WireValue) -> Result<()> {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let tx = guard.as_ref().ok_or(BridgeError::ChannelClosed)?;
        tx.send(wire).map_err(|_| BridgeError::ChannelClosed)
    }

    async fn next(&self) -> Option<WireValue> {
        if self.is_closed() {
            return None;
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            v = rx.recv() => v,
            _ = self.shutdown.notified() => None,
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        // notify_one stores a permit if nobody is waiting yet.
        self.shutdown.notify_one();
    }
}
