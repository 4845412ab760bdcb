//! Service registry: binds services to transport adapters and dispatches
//! inbound envelopes to their handlers.
//!
//! One registry can serve several services over several adapters. Envelopes
//! are namespaced by `serviceName`; clients by the `clientId` assigned at
//! connect time. Handler failures (errors and panics) become `error` /
//! `stream-end` envelopes for the caller and never reach the receive loop.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::task::JoinHandle;

use ctxbridge_core::error::{BridgeError, Result};
use ctxbridge_core::protocol::{ClientId, Envelope, Kind};

use crate::config::BridgeConfig;
use crate::dispatch::context::CallContext;
use crate::dispatch::service::ServiceDefinition;
use crate::dispatch::stream::{ServerStream, StreamSink};
use crate::lifecycle::{ClientSession, ClientTable};
use crate::obs::BridgeMetrics;
use crate::transport::{EnvelopeSink, TransportAdapter};

struct HostedService {
    name: Arc<str>,
    def: ServiceDefinition,
    clients: ClientTable,
}

struct RegistryInner {
    services: DashMap<String, Arc<HostedService>>,
    cfg: BridgeConfig,
    metrics: Arc<BridgeMetrics>,
}

#[derive(Clone)]
pub struct ServiceRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::with_config(BridgeConfig::default())
    }

    /// Registry with per-service capacity limits taken from `cfg`.
    pub fn with_config(cfg: BridgeConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                services: DashMap::new(),
                cfg,
                metrics: Arc::new(BridgeMetrics::new()),
            }),
        }
    }

    /// Register a service. Names are unique per registry.
    pub fn register(&self, def: ServiceDefinition) -> Result<()> {
        use dashmap::mapref::entry::Entry;

        let name = def.name().to_string();
        match self.inner.services.entry(name.clone()) {
            Entry::Occupied(_) => Err(BridgeError::DuplicateService(name)),
            Entry::Vacant(slot) => {
                let max_clients = self.inner.cfg.max_clients_for(&name);
                let name: Arc<str> = name.into();
                tracing::info!(service = %name, max_clients, entries = def.manifest().entries.len(), "service registered");
                slot.insert(Arc::new(HostedService {
                    clients: ClientTable::new(Arc::clone(&name), max_clients),
                    name,
                    def,
                }));
                Ok(())
            }
        }
    }

    pub fn registered_services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Start serving every registered service on `adapter`.
    pub fn attach(&self, adapter: &Arc<TransportAdapter>) -> Result<JoinHandle<()>> {
        adapter.on_receive(Arc::new(self.clone()))
    }

    pub fn metrics(&self) -> Arc<BridgeMetrics> {
        Arc::clone(&self.inner.metrics)
    }

    /// Connected clients of a service, in connection order.
    pub fn connected_clients(&self, service: &str) -> Vec<ClientId> {
        self.service(service)
            .map(|svc| svc.clients.sessions().iter().map(|s| s.id().clone()).collect())
            .unwrap_or_default()
    }

    /// Send one `event` envelope per selected connected client (all of them
    /// when `targets` is `None`). Returns how many envelopes were sent.
    pub fn broadcast(
        &self,
        service: &str,
        event: &str,
        payload: Value,
        targets: Option<&[ClientId]>,
    ) -> Result<usize> {
        let svc = self
            .service(service)
            .ok_or_else(|| BridgeError::Internal(format!("unknown service: {service}")))?;
        if !svc.def.manifest().has_event(event) {
            tracing::warn!(service = %svc.name, event, "broadcasting undeclared event");
        }

        let recipients: Vec<Arc<ClientSession>> = match targets {
            None => svc.clients.sessions(),
            Some(ids) => {
                let mut seen = HashSet::new();
                ids.iter()
                    .filter(|id| seen.insert(*id))
                    .filter_map(|id| svc.clients.get(id))
                    .filter(|s| s.is_connected())
                    .collect()
            }
        };

        let mut sent = 0;
        for session in recipients {
            let env = Envelope::event(&svc.name, session.id(), event, payload.clone());
            match session.send(&env) {
                Ok(()) => sent += 1,
                Err(e) => tracing::warn!(
                    service = %svc.name,
                    client_id = %session.id(),
                    event,
                    error = %e,
                    "event not delivered"
                ),
            }
        }
        self.inner
            .metrics
            .events_sent
            .add(&[("service", &*svc.name), ("event", event)], sent as u64);
        Ok(sent)
    }

    /// Service-initiated disconnect. The client is told with a `disconnect`
    /// envelope (best effort) and then torn down.
    pub fn disconnect_client(&self, service: &str, client: &ClientId) -> bool {
        let Some(svc) = self.service(service) else { return false };
        let Some(session) = svc.clients.get(client) else { return false };
        if let Err(e) = session.adapter().send(&Envelope::disconnect(&svc.name, client)) {
            tracing::debug!(service = %svc.name, client_id = %client, error = %e, "disconnect notice not delivered");
        }
        self.drop_client(&svc, client)
    }

    fn service(&self, name: &str) -> Option<Arc<HostedService>> {
        self.inner.services.get(name).map(|s| Arc::clone(s.value()))
    }

    fn drop_client(&self, svc: &HostedService, client: &ClientId) -> bool {
        match svc.clients.remove(client) {
            Some(_) => {
                self.inner.metrics.clients.dec(&[("service", &*svc.name)]);
                true
            }
            None => false,
        }
    }

    fn connected_session(&self, svc: &HostedService, env: &Envelope) -> Option<Arc<ClientSession>> {
        let session = env
            .client_id
            .as_ref()
            .and_then(|id| svc.clients.get(id))
            .filter(|s| s.is_connected());
        if session.is_none() {
            tracing::debug!(
                service = %svc.name,
                client_id = ?env.client_id,
                kind = env.kind.as_str(),
                "envelope from unknown or disconnected client ignored"
            );
        }
        session
    }

    fn on_connect(&self, svc: &HostedService, from: &Arc<TransportAdapter>, nonce: Option<u64>) {
        match svc.clients.admit(Arc::clone(from)) {
            Ok(session) => {
                session.mark_connected();
                let ack = Envelope::connect_ack(&svc.name, nonce, session.id(), svc.def.manifest().to_value());
                if let Err(e) = session.send(&ack) {
                    tracing::warn!(service = %svc.name, error = %e, "connect-ack not delivered");
                    svc.clients.remove(session.id());
                    return;
                }
                self.inner.metrics.clients.inc(&[("service", &*svc.name)]);
                tracing::info!(service = %svc.name, client_id = %session.id(), channel = %from.label(), "client connected");
            }
            Err(e) => {
                tracing::warn!(service = %svc.name, error = %e, "connect rejected");
                if let Err(e) = from.send(&Envelope::connect_rejected(&svc.name, nonce, &e.to_remote())) {
                    tracing::debug!(service = %svc.name, error = %e, "connect rejection not delivered");
                }
            }
        }
    }

    fn dispatch_call(&self, svc: Arc<HostedService>, session: Arc<ClientSession>, env: Envelope) {
        let Some(id) = env.id else {
            tracing::warn!(service = %svc.name, client_id = %session.id(), "call without id dropped");
            return;
        };
        let name = env.name_str().to_string();
        if !session.begin(id) {
            tracing::warn!(service = %svc.name, client_id = %session.id(), id, "duplicate outstanding id ignored");
            return;
        }

        let Some(handler) = svc.def.method(&name) else {
            session.finish(id);
            self.inner.metrics.calls.inc(&[("service", &*svc.name), ("outcome", "unknown")]);
            let err = BridgeError::UnknownMethod(name);
            if let Err(e) = session.send(&Envelope::error(&svc.name, session.id(), id, &err.to_remote())) {
                tracing::warn!(service = %svc.name, client_id = %session.id(), id, error = %e, "error not delivered");
            }
            return;
        };

        let ctx = CallContext::new(Arc::clone(&svc.name), session.id().clone(), id, self.clone());
        let metrics = Arc::clone(&self.inner.metrics);
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(handler.call(ctx, env.payload))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(BridgeError::handler("handler panicked")));
            session.finish(id);

            if !session.is_connected() {
                metrics.calls.inc(&[("service", &*svc.name), ("outcome", "discarded")]);
                tracing::debug!(service = %svc.name, client_id = %session.id(), id, method = %name, "result discarded, client gone");
                return;
            }

            let (reply, label) = match outcome {
                Ok(v) => (Envelope::result(&svc.name, session.id(), id, v), "ok"),
                Err(e) => {
                    tracing::debug!(service = %svc.name, client_id = %session.id(), id, method = %name, error = %e, "handler failed");
                    (Envelope::error(&svc.name, session.id(), id, &e.to_remote()), "error")
                }
            };
            metrics.calls.inc(&[("service", &*svc.name), ("outcome", label)]);
            if let Err(e) = session.send(&reply) {
                tracing::warn!(service = %svc.name, client_id = %session.id(), id, error = %e, "reply not delivered");
            }
        });
    }

    fn dispatch_stream_open(&self, svc: Arc<HostedService>, session: Arc<ClientSession>, env: Envelope) {
        let Some(id) = env.id else {
            tracing::warn!(service = %svc.name, client_id = %session.id(), "stream-open without id dropped");
            return;
        };
        let name = env.name_str().to_string();
        if !session.begin(id) {
            tracing::warn!(service = %svc.name, client_id = %session.id(), id, "duplicate outstanding id ignored");
            return;
        }

        let Some(handler) = svc.def.stream(&name) else {
            session.finish(id);
            self.inner.metrics.streams.inc(&[("service", &*svc.name), ("outcome", "unknown")]);
            let err = BridgeError::UnknownStream(name);
            if let Err(e) = session.send(&Envelope::error(&svc.name, session.id(), id, &err.to_remote())) {
                tracing::warn!(service = %svc.name, client_id = %session.id(), id, error = %e, "error not delivered");
            }
            return;
        };

        let stream = ServerStream::accept(
            Arc::clone(&svc.name),
            session.id().clone(),
            id,
            &name,
            Arc::clone(session.adapter()),
        );
        session.attach_stream(id, Arc::clone(&stream));

        let ctx = CallContext::new(Arc::clone(&svc.name), session.id().clone(), id, self.clone());
        let sink = StreamSink::new(Arc::clone(&stream));
        let metrics = Arc::clone(&self.inner.metrics);
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(handler.open(ctx, env.payload, sink))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(BridgeError::handler("handler panicked")));
            let label = if outcome.is_ok() { "ok" } else { "error" };
            if stream.close(&outcome) {
                metrics.streams.inc(&[("service", &*svc.name), ("outcome", label)]);
            }
            session.finish(id);
        });
    }

    fn on_pull(&self, svc: &HostedService, session: &ClientSession, env: &Envelope) {
        let Some(stream) = env.id.and_then(|id| session.stream(id)) else {
            tracing::debug!(service = %svc.name, client_id = %session.id(), id = ?env.id, "pull for unknown stream ignored");
            return;
        };
        if let Err(e) = stream.on_pull() {
            tracing::warn!(service = %svc.name, client_id = %session.id(), id = ?env.id, error = %e, "pull ignored");
        }
    }
}

#[async_trait]
impl EnvelopeSink for ServiceRegistry {
    async fn on_envelope(&self, from: &Arc<TransportAdapter>, env: Envelope) {
        let Some(svc) = self.service(&env.service_name) else {
            tracing::debug!(service = %env.service_name, kind = env.kind.as_str(), "envelope for unregistered service ignored");
            return;
        };
        self.inner
            .metrics
            .envelopes_in
            .inc(&[("service", &*svc.name), ("kind", env.kind.as_str())]);

        match env.kind {
            Kind::Connect => self.on_connect(&svc, from, env.connect_nonce()),
            Kind::Disconnect => {
                if let Some(session) = self.connected_session(&svc, &env) {
                    self.drop_client(&svc, session.id());
                }
            }
            Kind::Call => {
                if let Some(session) = self.connected_session(&svc, &env) {
                    self.dispatch_call(svc, session, env);
                }
            }
            Kind::StreamOpen => {
                if let Some(session) = self.connected_session(&svc, &env) {
                    self.dispatch_stream_open(svc, session, env);
                }
            }
            Kind::StreamPull => {
                if let Some(session) = self.connected_session(&svc, &env) {
                    self.on_pull(&svc, &session, &env);
                }
            }
            Kind::ConnectAck
            | Kind::Result
            | Kind::Error
            | Kind::StreamData
            | Kind::StreamEnd
            | Kind::Event => {
                tracing::debug!(service = %svc.name, kind = env.kind.as_str(), "client-bound envelope ignored by service");
            }
        }
    }

    async fn on_closed(&self, from: &Arc<TransportAdapter>) {
        let services: Vec<Arc<HostedService>> =
            self.inner.services.iter().map(|s| Arc::clone(s.value())).collect();
        for svc in services {
            let gone = svc.clients.remove_by_adapter(from);
            if !gone.is_empty() {
                self.inner
                    .metrics
                    .clients
                    .add(&[("service", &*svc.name)], -(gone.len() as i64));
            }
        }
    }

    fn on_decode_error(&self, from: &Arc<TransportAdapter>, _err: &BridgeError) {
        self.inner
            .metrics
            .decode_errors
            .inc(&[("channel", from.label())]);
    }
}
