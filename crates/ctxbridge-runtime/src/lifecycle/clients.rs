use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::{DashMap, DashSet};

use ctxbridge_core::error::{BridgeError, Result};
use ctxbridge_core::protocol::{ClientId, Envelope};

use crate::dispatch::stream::ServerStream;
use crate::transport::TransportAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    Connected,
    Disconnected,
}

/// One connected client of one service.
pub struct ClientSession {
    id: ClientId,
    service: Arc<str>,
    adapter: Arc<TransportAdapter>,
    state: Mutex<ClientState>,
    outstanding: DashSet<u64>,
    streams: DashMap<u64, Arc<ServerStream>>,
    created_seq: u64,
}

impl ClientSession {
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    pub fn state(&self) -> ClientState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: ClientState) -> ClientState {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *s, next)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    pub(crate) fn mark_connected(&self) {
        self.set_state(ClientState::Connected);
    }

    pub(crate) fn is_on(&self, adapter: &Arc<TransportAdapter>) -> bool {
        Arc::ptr_eq(&self.adapter, adapter)
    }

    pub(crate) fn adapter(&self) -> &Arc<TransportAdapter> {
        &self.adapter
    }

    /// Send to this client's channel; fails once the client is gone.
    pub(crate) fn send(&self, env: &Envelope) -> Result<()> {
        if !self.is_connected() {
            return Err(BridgeError::Disconnected);
        }
        self.adapter.send(env)
    }

    /// Claim a request id. Returns `false` if it is already outstanding.
    pub(crate) fn begin(&self, id: u64) -> bool {
        self.outstanding.insert(id)
    }

    pub(crate) fn finish(&self, id: u64) {
        self.outstanding.remove(&id);
        self.streams.remove(&id);
    }

    pub(crate) fn attach_stream(&self, id: u64, stream: Arc<ServerStream>) {
        self.streams.insert(id, stream);
    }

    pub(crate) fn stream(&self, id: u64) -> Option<Arc<ServerStream>> {
        self.streams.get(&id).map(|s| Arc::clone(s.value()))
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn open_streams(&self) -> usize {
        self.streams.len()
    }

    /// Mark disconnected and force-close every stream with `Disconnected`.
    /// In-flight call handlers keep running; their results are discarded.
    pub(crate) fn teardown(&self) -> (usize, usize) {
        if self.set_state(ClientState::Disconnected) == ClientState::Disconnected {
            return (0, 0);
        }
        let streams: Vec<Arc<ServerStream>> =
            self.streams.iter().map(|s| Arc::clone(s.value())).collect();
        self.streams.clear();
        let outcome = Err(BridgeError::Disconnected);
        for s in &streams {
            s.close(&outcome);
        }
        let calls = self.outstanding.len().saturating_sub(streams.len());
        self.outstanding.clear();
        (calls, streams.len())
    }
}

/// Client table of one service:
/// - `client_id -> ClientSession`
/// - capacity accounting and sequential id assignment (`c-1`, `c-2`, ...)
pub struct ClientTable {
    service: Arc<str>,
    clients: DashMap<ClientId, Arc<ClientSession>>,
    seq: AtomicU64,
    active: AtomicUsize,
    max_clients: usize,
}

impl ClientTable {
    pub fn new(service: Arc<str>, max_clients: usize) -> Self {
        Self {
            service,
            clients: DashMap::new(),
            seq: AtomicU64::new(1),
            active: AtomicUsize::new(0),
            max_clients,
        }
    }

    /// Admit a new client arriving on `adapter`, or refuse at capacity.
    pub fn admit(&self, adapter: Arc<TransportAdapter>) -> Result<Arc<ClientSession>> {
        let max = self.max_clients;
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .map_err(|_| BridgeError::CapacityExceeded(self.service.to_string()))?;

        let created_seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let id = ClientId::new(format!("c-{created_seq}"));
        let session = Arc::new(ClientSession {
            id: id.clone(),
            service: Arc::clone(&self.service),
            adapter,
            state: Mutex::new(ClientState::Connecting),
            outstanding: DashSet::new(),
            streams: DashMap::new(),
            created_seq,
        });
        self.clients.insert(id, Arc::clone(&session));
        Ok(session)
    }

    pub fn get(&self, id: &ClientId) -> Option<Arc<ClientSession>> {
        self.clients.get(id).map(|r| Arc::clone(r.value()))
    }

    /// Remove a client and tear down everything it owns.
    pub fn remove(&self, id: &ClientId) -> Option<Arc<ClientSession>> {
        let (_, session) = self.clients.remove(id)?;
        self.active.fetch_sub(1, Ordering::AcqRel);
        let (calls, streams) = session.teardown();
        tracing::info!(
            service = %session.service,
            client_id = %session.id,
            abandoned_calls = calls,
            closed_streams = streams,
            "client disconnected"
        );
        Some(session)
    }

    /// Remove every client that connected through `adapter`.
    pub fn remove_by_adapter(&self, adapter: &Arc<TransportAdapter>) -> Vec<Arc<ClientSession>> {
        let ids: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|r| r.value().is_on(adapter))
            .map(|r| r.key().clone())
            .collect();
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Connected clients in connection order.
    pub fn sessions(&self) -> Vec<Arc<ClientSession>> {
        let mut all: Vec<Arc<ClientSession>> = self
            .clients
            .iter()
            .filter(|r| r.value().is_connected())
            .map(|r| Arc::clone(r.value()))
            .collect();
        all.sort_by_key(|s| s.created_seq);
        all
    }

    pub fn len(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory_pair;
    use ctxbridge_core::protocol::WireFormat;

    fn adapter() -> Arc<TransportAdapter> {
        let (a, _b) = memory_pair("clients");
        TransportAdapter::new(Arc::new(a), WireFormat::Text)
    }

    #[test]
    fn ids_are_sequential_and_capacity_is_enforced() {
        let table = ClientTable::new("svc".into(), 2);
        let a = adapter();
        let c1 = table.admit(Arc::clone(&a)).unwrap();
        let c2 = table.admit(Arc::clone(&a)).unwrap();
        assert_eq!(c1.id().as_str(), "c-1");
        assert_eq!(c2.id().as_str(), "c-2");
        assert!(matches!(table.admit(Arc::clone(&a)), Err(BridgeError::CapacityExceeded(_))));

        table.remove(c1.id()).unwrap();
        let c3 = table.admit(a).unwrap();
        assert_eq!(c3.id().as_str(), "c-3");
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn removed_client_is_disconnected_and_forgotten() {
        let table = ClientTable::new("svc".into(), 8);
        let s = table.admit(adapter()).unwrap();
        s.mark_connected();
        assert!(s.begin(1));
        assert!(!s.begin(1));

        let removed = table.remove(s.id()).unwrap();
        assert_eq!(removed.state(), ClientState::Disconnected);
        assert_eq!(removed.outstanding(), 0);
        assert!(table.get(s.id()).is_none());
        assert!(table.remove(s.id()).is_none());
    }

    #[test]
    fn remove_by_adapter_only_touches_that_channel() {
        let table = ClientTable::new("svc".into(), 8);
        let a = adapter();
        let b = adapter();
        table.admit(Arc::clone(&a)).unwrap();
        table.admit(Arc::clone(&b)).unwrap();
        table.admit(Arc::clone(&a)).unwrap();

        let gone = table.remove_by_adapter(&a);
        assert_eq!(gone.len(), 2);
        assert_eq!(table.len(), 1);
    }
}
