//! Client proxy: connect handshake, unary calls, streams, and events over one
//! transport adapter.
//!
//! All inbound traffic is handled on the adapter's receive loop:
//! `result`/`error` settle correlation entries, `stream-data`/`stream-end`
//! feed stream receivers, `event`s fan out to local listeners. Envelopes for
//! another service or another client id are ignored, which lets several
//! clients share one broadcast-style channel.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;

use ctxbridge_core::error::{BridgeError, Result};
use ctxbridge_core::protocol::{ClientId, Envelope, Kind, ServiceManifest};

use crate::client::correlation::CorrelationRegistry;
use crate::client::events::{EventListeners, ListenerId};
use crate::client::stream::{ClientStream, StreamReceiver};
use crate::config::ClientSection;
use crate::lifecycle::ClientState;
use crate::transport::{EnvelopeSink, TransportAdapter};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone)]
struct Session {
    client_id: ClientId,
    manifest: ServiceManifest,
}

struct Handshake {
    nonce: u64,
    tx: oneshot::Sender<Result<Session>>,
}

pub(crate) struct ProxyShared {
    service: Arc<str>,
    adapter: Arc<TransportAdapter>,
    state: Mutex<ClientState>,
    session: OnceLock<Session>,
    handshake: Mutex<Option<Handshake>>,
    correlation: CorrelationRegistry,
    listeners: EventListeners,
}

impl ProxyShared {
    fn new(service: &str, adapter: Arc<TransportAdapter>) -> Self {
        Self {
            service: service.into(),
            adapter,
            state: Mutex::new(ClientState::Connecting),
            session: OnceLock::new(),
            handshake: Mutex::new(None),
            correlation: CorrelationRegistry::new(),
            listeners: EventListeners::new(),
        }
    }

    fn state(&self) -> ClientState {
        *lock(&self.state)
    }

    fn connected_client(&self) -> Result<&ClientId> {
        match (self.state(), self.session.get()) {
            (ClientState::Connected, Some(s)) => Ok(&s.client_id),
            _ => Err(BridgeError::Disconnected),
        }
    }

    /// Run `register` only while connected. The state lock is held across
    /// the insert so `teardown` either sees the new entry in `fail_all` or
    /// the request is refused here.
    fn register<T>(&self, register: impl FnOnce(&CorrelationRegistry) -> T) -> Result<(&ClientId, T)> {
        let state = lock(&self.state);
        let client = match (*state, self.session.get()) {
            (ClientState::Connected, Some(s)) => &s.client_id,
            _ => return Err(BridgeError::Disconnected),
        };
        let registered = register(&self.correlation);
        drop(state);
        Ok((client, registered))
    }

    pub(crate) fn send_pull(&self, id: u64) {
        let Ok(client) = self.connected_client() else { return };
        if let Err(e) = self
            .adapter
            .send(&Envelope::stream_pull(&self.service, client, id))
        {
            tracing::warn!(service = %self.service, id, error = %e, "stream-pull not delivered");
        }
    }

    pub(crate) fn abandon(&self, id: u64) -> bool {
        self.correlation.evict(id)
    }

    /// Connected/connecting -> disconnected. Everything outstanding fails
    /// with `Disconnected`; later envelopes are ignored.
    fn teardown(&self, reason: &str) {
        {
            let mut s = lock(&self.state);
            if *s == ClientState::Disconnected {
                return;
            }
            *s = ClientState::Disconnected;
        }
        if let Some(h) = lock(&self.handshake).take() {
            let _ = h.tx.send(Err(BridgeError::Disconnected));
        }
        let failed = self.correlation.fail_all(&BridgeError::Disconnected);
        tracing::info!(
            service = %self.service,
            client_id = ?self.session.get().map(|s| s.client_id.as_str()),
            failed,
            reason,
            "client proxy disconnected"
        );
    }

    /// Best-effort `disconnect` notice, then local teardown.
    fn leave(&self, reason: &str) {
        if let Ok(client) = self.connected_client() {
            if let Err(e) = self
                .adapter
                .send(&Envelope::disconnect(&self.service, client))
            {
                tracing::debug!(service = %self.service, error = %e, "disconnect notice not delivered");
            }
        }
        self.teardown(reason);
    }

    fn on_connect_ack(&self, env: Envelope) {
        let handshake = {
            let mut hs = lock(&self.handshake);
            match hs.as_ref() {
                Some(h) if env.id.map_or(true, |id| id == h.nonce) => hs.take(),
                _ => None,
            }
        };
        let Some(h) = handshake else {
            tracing::debug!(service = %self.service, nonce = ?env.id, "connect-ack for another client ignored");
            return;
        };

        let Some(client_id) = env.client_id else {
            let _ = h.tx.send(Err(BridgeError::Protocol("connect-ack without clientId".into())));
            return;
        };
        let manifest = match ServiceManifest::from_value(env.payload) {
            Ok(m) => m,
            Err(e) => {
                let _ = h.tx.send(Err(e));
                return;
            }
        };

        let session = Session { client_id, manifest };
        let _ = self.session.set(session.clone());
        *lock(&self.state) = ClientState::Connected;
        let _ = h.tx.send(Ok(session));
    }

    fn on_connect_rejected(&self, env: Envelope) {
        let handshake = {
            let mut hs = lock(&self.handshake);
            match hs.as_ref() {
                Some(h) if env.id.map_or(true, |id| id == h.nonce) => hs.take(),
                _ => None,
            }
        };
        if let Some(h) = handshake {
            let _ = h.tx.send(Err(env.remote_error().into()));
        }
    }

    fn on_session_envelope(&self, env: Envelope) {
        let Ok(client) = self.connected_client() else {
            tracing::debug!(service = %self.service, kind = env.kind.as_str(), "envelope after disconnect ignored");
            return;
        };
        if env.client_id.as_ref() != Some(client) {
            tracing::trace!(service = %self.service, client_id = ?env.client_id, "envelope for another client ignored");
            return;
        }

        match env.kind {
            Kind::Result | Kind::Error => {
                let Some(id) = env.id else {
                    tracing::warn!(service = %self.service, kind = env.kind.as_str(), "terminal envelope without id dropped");
                    return;
                };
                let outcome = if env.kind == Kind::Result {
                    Ok(env.payload)
                } else {
                    Err(env.remote_error().into())
                };
                self.correlation.settle(id, outcome);
            }
            Kind::StreamData => {
                let Some(id) = env.id else { return };
                let Some(stream) = self.correlation.stream(id) else {
                    tracing::debug!(service = %self.service, id, "stream-data for unknown stream ignored");
                    return;
                };
                if let Err(e) = stream.deliver(env.payload) {
                    tracing::warn!(service = %self.service, id, error = %e, "stream-data out of turn, stream failed");
                    self.correlation.end_stream(id, Err(e));
                }
            }
            Kind::StreamEnd => {
                let Some(id) = env.id else { return };
                let outcome = env.stream_end_payload().and_then(|end| match (end.ok, end.error) {
                    (true, _) => Ok(()),
                    (false, Some(e)) => Err(e.into()),
                    (false, None) => Err(BridgeError::handler("stream failed")),
                });
                self.correlation.end_stream(id, outcome);
            }
            Kind::Event => {
                let n = self.listeners.emit(env.name_str(), &env.payload);
                tracing::trace!(service = %self.service, event = env.name_str(), listeners = n, "event");
            }
            Kind::Disconnect => self.teardown("disconnected by service"),
            Kind::Connect | Kind::ConnectAck | Kind::Call | Kind::StreamOpen | Kind::StreamPull => {
                tracing::debug!(service = %self.service, kind = env.kind.as_str(), "service-bound envelope ignored by client");
            }
        }
    }
}

#[async_trait]
impl EnvelopeSink for ProxyShared {
    async fn on_envelope(&self, _from: &Arc<TransportAdapter>, env: Envelope) {
        if *env.service_name != *self.service {
            return;
        }
        match env.kind {
            Kind::ConnectAck => self.on_connect_ack(env),
            Kind::Error if env.client_id.is_none() => self.on_connect_rejected(env),
            _ => self.on_session_envelope(env),
        }
    }

    async fn on_closed(&self, _from: &Arc<TransportAdapter>) {
        self.teardown("channel closed");
    }
}

/// Evicts a call's correlation entry if the awaiting future is dropped.
struct EvictOnDrop<'a> {
    registry: &'a CorrelationRegistry,
    id: u64,
}

impl Drop for EvictOnDrop<'_> {
    fn drop(&mut self) {
        self.registry.evict(self.id);
    }
}

/// Shared by every clone of one `ClientProxy`. When the last clone goes
/// away the client leaves the service and the adapter is closed, which also
/// ends the receive loop.
struct Lease {
    shared: Arc<ProxyShared>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.shared.leave("proxy dropped");
        self.shared.adapter.close();
    }
}

/// Local, async-callable view of a remote service.
///
/// Clones share one connection. Dropping the last clone disconnects, as if
/// `disconnect` had been called; open `StreamReceiver`s then end with
/// `Disconnected`.
#[derive(Clone)]
pub struct ClientProxy {
    shared: Arc<ProxyShared>,
    session: Session,
    _lease: Arc<Lease>,
}

impl ClientProxy {
    /// Connect with default client settings.
    pub async fn connect(adapter: Arc<TransportAdapter>, service: &str) -> Result<Self> {
        Self::connect_with(adapter, service, &ClientSection::default()).await
    }

    /// Bind `adapter`, send `connect`, and wait for the `connect-ack`.
    /// An unanswered handshake counts as a disconnect; the adapter is closed
    /// on failure.
    pub async fn connect_with(
        adapter: Arc<TransportAdapter>,
        service: &str,
        settings: &ClientSection,
    ) -> Result<Self> {
        let shared = Arc::new(ProxyShared::new(service, Arc::clone(&adapter)));
        let nonce = shared.correlation.next_id();
        let (tx, rx) = oneshot::channel();
        *lock(&shared.handshake) = Some(Handshake { nonce, tx });

        adapter.on_receive(Arc::clone(&shared) as Arc<dyn EnvelopeSink>)?;

        let outcome = async {
            adapter.send(&Envelope::connect(service, Some(nonce)))?;
            match tokio::time::timeout(Duration::from_millis(settings.connect_timeout_ms), rx).await {
                Ok(Ok(res)) => res,
                Ok(Err(_)) => Err(BridgeError::Disconnected),
                Err(_) => {
                    tracing::warn!(service, timeout_ms = settings.connect_timeout_ms, "connect timed out");
                    Err(BridgeError::Disconnected)
                }
            }
        }
        .await;

        match outcome {
            Ok(session) => {
                tracing::info!(service, client_id = %session.client_id, channel = %adapter.label(), "connected");
                let lease = Arc::new(Lease {
                    shared: Arc::clone(&shared),
                });
                Ok(Self {
                    shared,
                    session,
                    _lease: lease,
                })
            }
            Err(e) => {
                shared.teardown("handshake failed");
                adapter.close();
                Err(e)
            }
        }
    }

    pub fn service(&self) -> &str {
        &self.shared.service
    }

    pub fn client_id(&self) -> &ClientId {
        &self.session.client_id
    }

    pub fn manifest(&self) -> &ServiceManifest {
        &self.session.manifest
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.session.manifest.has_method(name)
    }

    pub fn has_stream(&self, name: &str) -> bool {
        self.session.manifest.has_stream(name)
    }

    pub fn has_event(&self, name: &str) -> bool {
        self.session.manifest.has_event(name)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state() == ClientState::Connected
    }

    /// Requests awaiting a terminal envelope (calls and open streams).
    pub fn outstanding(&self) -> usize {
        self.shared.correlation.outstanding()
    }

    /// Call a method with raw JSON arguments (positional args as an array).
    ///
    /// There is no built-in timeout. Dropping the returned future abandons
    /// the call: its correlation entry is evicted and a late reply is ignored.
    pub async fn call_value(&self, name: &str, args: Value) -> Result<Value> {
        let (client, (id, rx)) = self.shared.register(CorrelationRegistry::register_call)?;
        let _guard = EvictOnDrop {
            registry: &self.shared.correlation,
            id,
        };
        self.shared
            .adapter
            .send(&Envelope::call(&self.shared.service, client, id, name, args))?;
        rx.await.map_err(|_| BridgeError::Disconnected)?
    }

    /// Typed call; `args` is usually a tuple of positional arguments.
    pub async fn call<A, R>(&self, name: &str, args: A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let args = serde_json::to_value(args)
            .map_err(|e| BridgeError::Encode(format!("arguments encode failed: {e}")))?;
        let out = self.call_value(name, args).await?;
        serde_json::from_value(out).map_err(|e| BridgeError::Decode(format!("unexpected result for {name}: {e}")))
    }

    /// Open a stream with raw JSON arguments.
    pub fn open_stream(&self, name: &str, args: Value) -> Result<StreamReceiver> {
        let (state, rx) = ClientStream::opened();
        let (client, id) = self.shared.register(|correlation| {
            let id = correlation.next_id();
            correlation.register_stream(id, Arc::clone(&state));
            id
        })?;

        if let Err(e) = self
            .shared
            .adapter
            .send(&Envelope::stream_open(&self.shared.service, client, id, name, args))
        {
            self.shared.correlation.evict(id);
            return Err(e);
        }
        Ok(StreamReceiver::new(id, name, rx, state, Arc::clone(&self.shared)))
    }

    pub fn stream<A: Serialize>(&self, name: &str, args: A) -> Result<StreamReceiver> {
        let args = serde_json::to_value(args)
            .map_err(|e| BridgeError::Encode(format!("arguments encode failed: {e}")))?;
        self.open_stream(name, args)
    }

    /// Listen for an event. Listeners run on the receive loop, in
    /// registration order.
    pub fn on<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.shared.listeners.on(event, Arc::new(listener))
    }

    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        self.shared.listeners.off(event, id)
    }

    /// Tell the service we are leaving and fail everything outstanding. A
    /// disconnected proxy cannot be reused; connect again for a new client id.
    pub fn disconnect(&self) {
        self.shared.leave("disconnect requested");
    }
}

