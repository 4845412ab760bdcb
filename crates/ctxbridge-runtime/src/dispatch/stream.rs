//! Service-side stream controller.
//!
//! Each open stream owns a `StreamMachine` and a one-permit credit semaphore.
//! A handler write consumes the credit and sends `stream-data`; the client's
//! `stream-pull` restores it. A handler that writes faster than the client
//! pulls simply waits in `write`, so nothing is buffered on either side.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;

use ctxbridge_core::error::{BridgeError, Result};
use ctxbridge_core::flow::{StreamMachine, StreamState};
use ctxbridge_core::protocol::{ClientId, Envelope, StreamEnd};

use crate::transport::TransportAdapter;

pub(crate) struct ServerStream {
    id: u64,
    name: String,
    service: Arc<str>,
    client: ClientId,
    adapter: Arc<TransportAdapter>,
    machine: Mutex<StreamMachine>,
    credit: Semaphore,
}

impl ServerStream {
    /// Accept a `stream-open`: the stream starts idle with one write credit.
    pub(crate) fn accept(
        service: Arc<str>,
        client: ClientId,
        id: u64,
        name: &str,
        adapter: Arc<TransportAdapter>,
    ) -> Arc<Self> {
        let mut machine = StreamMachine::new();
        let _ = machine.open();
        Arc::new(Self {
            id,
            name: name.to_string(),
            service,
            client,
            adapter,
            machine: Mutex::new(machine),
            credit: Semaphore::new(1),
        })
    }

    fn machine(&self) -> MutexGuard<'_, StreamMachine> {
        self.machine.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn state(&self) -> StreamState {
        self.machine().state()
    }

    pub(crate) async fn write(&self, item: Value) -> Result<()> {
        let permit = self
            .credit
            .acquire()
            .await
            .map_err(|_| BridgeError::Disconnected)?;
        permit.forget();

        let mut m = self.machine();
        m.write()?;
        self.adapter
            .send(&Envelope::stream_data(&self.service, &self.client, self.id, item))
    }

    /// Client acknowledged the outstanding item.
    pub(crate) fn on_pull(&self) -> Result<()> {
        self.machine().pull()?;
        self.credit.add_permits(1);
        Ok(())
    }

    /// Close with the terminal outcome. Sends the single `stream-end`; later
    /// calls are no-ops and return `false`.
    pub(crate) fn close(&self, outcome: &Result<()>) -> bool {
        let mut m = self.machine();
        if !m.close(outcome.is_ok()) {
            return false;
        }
        self.credit.close();

        let end = match outcome {
            Ok(()) => StreamEnd::ok(),
            Err(e) => StreamEnd::failed(e.to_remote()),
        };
        if let Err(e) = self
            .adapter
            .send(&Envelope::stream_end(&self.service, &self.client, self.id, &end))
        {
            tracing::debug!(
                service = %self.service,
                client_id = %self.client,
                id = self.id,
                error = %e,
                "stream-end not delivered"
            );
        }
        tracing::debug!(
            service = %self.service,
            client_id = %self.client,
            id = self.id,
            stream = %self.name,
            items = m.items(),
            ok = outcome.is_ok(),
            "stream closed"
        );
        true
    }
}

/// Write/close capability handed to a stream handler.
#[derive(Clone)]
pub struct StreamSink {
    stream: Arc<ServerStream>,
}

impl StreamSink {
    pub(crate) fn new(stream: Arc<ServerStream>) -> Self {
        Self { stream }
    }

    pub fn id(&self) -> u64 {
        self.stream.id
    }

    /// Send one item. Waits until the previous item has been pulled; fails
    /// with `Disconnected` once the stream is closed.
    pub async fn write(&self, item: Value) -> Result<()> {
        self.stream.write(item).await
    }

    pub async fn write_item<T: Serialize>(&self, item: &T) -> Result<()> {
        let v = serde_json::to_value(item)
            .map_err(|e| BridgeError::Encode(format!("stream item encode failed: {e}")))?;
        self.write(v).await
    }

    /// End the stream now, successfully or with `err`.
    pub fn close(&self, err: Option<BridgeError>) {
        let outcome = match err {
            None => Ok(()),
            Some(e) => Err(e),
        };
        self.stream.close(&outcome);
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.stream.state(), StreamState::Closed { .. })
    }
}
