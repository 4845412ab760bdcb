//! Transport adapter: uniform `send(envelope)` / `on_receive(sink)` over any
//! `Channel`.
//!
//! Decode-once: every inbound wire value is decoded here and only well-formed
//! envelopes reach the sink. Malformed values are logged and dropped; they
//! never stop the receive loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use ctxbridge_core::error::{BridgeError, Result};
use ctxbridge_core::protocol::{codec, Envelope, WireFormat};

use crate::transport::channel::Channel;

/// Receiver side of an adapter. Exactly one sink is bound per adapter.
#[async_trait]
pub trait EnvelopeSink: Send + Sync + 'static {
    async fn on_envelope(&self, from: &Arc<TransportAdapter>, env: Envelope);
    /// The underlying channel ended. Treated as a disconnect by callers.
    async fn on_closed(&self, from: &Arc<TransportAdapter>);
    fn on_decode_error(&self, _from: &Arc<TransportAdapter>, _err: &BridgeError) {}
}

pub struct TransportAdapter {
    channel: Arc<dyn Channel>,
    format: WireFormat,
    bound: AtomicBool,
}

impl TransportAdapter {
    pub fn new(channel: Arc<dyn Channel>, format: WireFormat) -> Arc<Self> {
        Arc::new(Self {
            channel,
            format,
            bound: AtomicBool::new(false),
        })
    }

    pub fn label(&self) -> &str {
        self.channel.label()
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Encode and post one envelope (fire-and-forget).
    pub fn send(&self, env: &Envelope) -> Result<()> {
        let wire = codec::encode(env, self.format)?;
        tracing::trace!(
            channel = %self.label(),
            kind = env.kind.as_str(),
            id = ?env.id,
            bytes = wire.len(),
            "send"
        );
        self.channel.post(wire)
    }

    /// Bind the receive handler and start the receive loop.
    pub fn on_receive(self: &Arc<Self>, sink: Arc<dyn EnvelopeSink>) -> Result<JoinHandle<()>> {
        if self
            .bound
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BridgeError::AlreadyBound);
        }
        let adapter = Arc::clone(self);
        Ok(tokio::spawn(async move { adapter.pump(sink).await }))
    }

    pub fn close(&self) {
        self.channel.close();
    }

    async fn pump(self: Arc<Self>, sink: Arc<dyn EnvelopeSink>) {
        while let Some(wire) = self.channel.next().await {
            match codec::decode(wire) {
                Ok(env) => sink.on_envelope(&self, env).await,
                Err(e) => {
                    tracing::warn!(channel = %self.label(), error = %e, "dropping malformed envelope");
                    sink.on_decode_error(&self, &e);
                }
            }
        }
        tracing::debug!(channel = %self.label(), "channel closed");
        sink.on_closed(&self).await;
    }
}
