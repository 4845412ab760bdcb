//! Client end of a stream.
//!
//! The proxy's receive loop pushes items into a `ClientStream`; the caller
//! drains them through a `StreamReceiver`. A `stream-pull` is only sent when
//! the caller asks for the item after one it already received, so the
//! service never gets ahead of the consumer by more than one item.

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use futures_util::Stream;
use serde_json::Value;
use tokio::sync::mpsc;

use ctxbridge_core::error::{BridgeError, Result};
use ctxbridge_core::flow::StreamMachine;

use crate::client::proxy::ProxyShared;

pub(crate) enum StreamMsg {
    Item(Value),
    End(Result<()>),
}

pub(crate) struct ClientStream {
    tx: mpsc::UnboundedSender<StreamMsg>,
    machine: Mutex<StreamMachine>,
}

impl ClientStream {
    /// A stream whose `stream-open` is about to be sent.
    pub(crate) fn opened() -> (Arc<Self>, mpsc::UnboundedReceiver<StreamMsg>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut machine = StreamMachine::new();
        let _ = machine.open();
        (
            Arc::new(Self {
                tx,
                machine: Mutex::new(machine),
            }),
            rx,
        )
    }

    fn machine(&self) -> MutexGuard<'_, StreamMachine> {
        self.machine.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Accept one `stream-data`. Fails if the service sent it unpulled.
    pub(crate) fn deliver(&self, item: Value) -> Result<()> {
        self.machine().write()?;
        let _ = self.tx.send(StreamMsg::Item(item));
        Ok(())
    }

    pub(crate) fn pulled(&self) -> Result<()> {
        self.machine().pull()
    }

    pub(crate) fn finish(&self, outcome: Result<()>) {
        if self.machine().close(outcome.is_ok()) {
            let _ = self.tx.send(StreamMsg::End(outcome));
        }
    }
}

/// Items of one stream, in the order the service wrote them.
///
/// Yields `Ok(item)` per item, then ends with `None` on success or a final
/// `Err` when the stream failed or the connection went away.
pub struct StreamReceiver {
    id: u64,
    name: String,
    rx: mpsc::UnboundedReceiver<StreamMsg>,
    state: Arc<ClientStream>,
    link: Arc<ProxyShared>,
    owe_pull: bool,
    done: bool,
}

impl StreamReceiver {
    pub(crate) fn new(
        id: u64,
        name: &str,
        rx: mpsc::UnboundedReceiver<StreamMsg>,
        state: Arc<ClientStream>,
        link: Arc<ProxyShared>,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            rx,
            state,
            link,
            owe_pull: false,
            done: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn next(&mut self) -> Option<Result<Value>> {
        futures_util::StreamExt::next(self).await
    }

    /// Drain the stream, failing on the first error.
    pub async fn collect_all(mut self) -> Result<Vec<Value>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(items)
    }

    fn acknowledge(&mut self) {
        self.owe_pull = false;
        // Fails when the stream already ended; no pull is owed then.
        if self.state.pulled().is_ok() {
            self.link.send_pull(self.id);
        }
    }
}

impl Stream for StreamReceiver {
    type Item = Result<Value>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        if this.owe_pull {
            this.acknowledge();
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(StreamMsg::Item(v))) => {
                this.owe_pull = true;
                Poll::Ready(Some(Ok(v)))
            }
            Poll::Ready(Some(StreamMsg::End(Ok(())))) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(StreamMsg::End(Err(e)))) => {
                this.done = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(Some(Err(BridgeError::Disconnected)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for StreamReceiver {
    fn drop(&mut self) {
        if !self.done && self.link.abandon(self.id) {
            tracing::debug!(id = self.id, stream = %self.name, "stream abandoned by consumer");
        }
    }
}
