#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use ctxbridge_core::error::BridgeError;
use ctxbridge_core::protocol::{codec, ClientId, Envelope, Kind, WireFormat, WireValue};
use ctxbridge_runtime::config::{self, BridgeConfig};
use ctxbridge_runtime::services::echo;
use ctxbridge_runtime::transport::{Channel, MemoryChannel};
use ctxbridge_runtime::{memory_pair, ClientProxy, ServiceDefinition, ServiceRegistry, TransportAdapter};

async fn connect(registry: &ServiceRegistry, service: &str) -> (ClientProxy, Arc<TransportAdapter>) {
    let (a, b) = memory_pair(service);
    let host = TransportAdapter::new(Arc::new(a), WireFormat::Text);
    registry.attach(&host).unwrap();
    let link = TransportAdapter::new(Arc::new(b), WireFormat::Text);
    (ClientProxy::connect(link, service).await.unwrap(), host)
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn client_ids_are_assigned_in_sequence() {
    let registry = ServiceRegistry::new();
    registry.register(echo::definition()).unwrap();

    let mut ids = Vec::new();
    let mut keep = Vec::new();
    for _ in 0..3 {
        let (proxy, host) = connect(&registry, echo::SERVICE).await;
        ids.push(proxy.client_id().as_str().to_string());
        keep.push((proxy, host));
    }
    assert_eq!(ids, vec!["c-1", "c-2", "c-3"]);
    assert_eq!(
        registry.connected_clients(echo::SERVICE),
        vec![ClientId::new("c-1"), ClientId::new("c-2"), ClientId::new("c-3")]
    );
}

#[tokio::test]
async fn broadcast_reaches_only_targeted_clients() {
    let registry = ServiceRegistry::new();
    registry.register(echo::definition()).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel::<(String, Value)>();
    let mut keep = Vec::new();
    for _ in 0..3 {
        let (proxy, host) = connect(&registry, echo::SERVICE).await;
        let tx = tx.clone();
        let me = proxy.client_id().as_str().to_string();
        proxy.on("tick", move |detail| {
            let _ = tx.send((me.clone(), detail.clone()));
        });
        keep.push((proxy, host));
    }

    let targets = [ClientId::new("c-2"), ClientId::new("c-2"), ClientId::new("c-9")];
    let sent = registry
        .broadcast(echo::SERVICE, "tick", json!({"n": 1}), Some(&targets))
        .unwrap();
    assert_eq!(sent, 1);

    let (who, detail) = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!(who, "c-2");
    assert_eq!(detail, json!({"n": 1}));
    assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.is_err());

    let sent = registry.broadcast(echo::SERVICE, "tick", json!(null), None).unwrap();
    assert_eq!(sent, 3);
}

#[tokio::test]
async fn handler_broadcast_precedes_its_result() {
    let registry = ServiceRegistry::new();
    registry.register(echo::definition()).unwrap();
    let (caller, _h1) = connect(&registry, echo::SERVICE).await;
    let (watcher, _h2) = connect(&registry, echo::SERVICE).await;

    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    let seen = tx.clone();
    caller.on("tick", move |d| {
        let _ = seen.send(d.clone());
    });
    watcher.on("tick", move |d| {
        let _ = tx.send(d.clone());
    });

    let sent = caller.call_value("notify", json!(["saved"])).await.unwrap();
    assert_eq!(sent, json!(2));
    // The caller's own tick was delivered before the result.
    let first = rx.try_recv().unwrap();
    assert_eq!(first["detail"], "saved");
    let second = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!(second["detail"], "saved");
}

#[tokio::test]
async fn off_removes_the_listener() {
    let registry = ServiceRegistry::new();
    registry.register(echo::definition()).unwrap();
    let (proxy, _host) = connect(&registry, echo::SERVICE).await;

    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    let id = proxy.on("tick", move |d| {
        let _ = tx.send(d.clone());
    });
    assert!(proxy.off("tick", id));
    assert!(!proxy.off("tick", id));

    proxy.call_value("notify", json!([1])).await.unwrap();
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn channel_loss_rejects_everything_outstanding() {
    let registry = ServiceRegistry::new();
    registry.register(echo::slow_count(Duration::from_secs(30))).unwrap();
    let (proxy, host) = connect(&registry, "slow-echo").await;

    let calls: Vec<_> = (0..5)
        .map(|_| {
            let proxy = proxy.clone();
            tokio::spawn(async move { proxy.call_value("wait", json!([])).await })
        })
        .collect();
    let mut streams = vec![
        proxy.stream("count", (3,)).unwrap(),
        proxy.stream("count", (3,)).unwrap(),
    ];
    eventually(|| proxy.outstanding() == 7).await;

    host.close();

    for call in calls {
        assert_eq!(call.await.unwrap().unwrap_err(), BridgeError::Disconnected);
    }
    for rx in &mut streams {
        assert_eq!(rx.next().await.unwrap().unwrap_err(), BridgeError::Disconnected);
    }
    assert_eq!(proxy.outstanding(), 0);
    assert!(!proxy.is_connected());

    let r = registry.clone();
    eventually(move || r.connected_clients("slow-echo").is_empty()).await;
}

#[tokio::test]
async fn client_disconnect_removes_its_session() {
    let registry = ServiceRegistry::new();
    registry.register(echo::definition()).unwrap();
    let (first, _h1) = connect(&registry, echo::SERVICE).await;
    let (second, _h2) = connect(&registry, echo::SERVICE).await;

    first.disconnect();
    let r = registry.clone();
    eventually(move || r.connected_clients(echo::SERVICE) == vec![ClientId::new("c-2")]).await;

    // Other clients are unaffected.
    let reply: String = second.call("echo", ("x",)).await.unwrap();
    assert_eq!(reply, "x");
    assert_eq!(registry.metrics().clients.get(&[("service", echo::SERVICE)]), 1);
}

#[tokio::test]
async fn service_initiated_disconnect_reaches_the_client() {
    let registry = ServiceRegistry::new();
    registry.register(echo::definition()).unwrap();
    let (proxy, _host) = connect(&registry, echo::SERVICE).await;

    assert!(registry.disconnect_client(echo::SERVICE, proxy.client_id()));
    assert!(!registry.disconnect_client(echo::SERVICE, proxy.client_id()));
    let p = proxy.clone();
    eventually(move || !p.is_connected()).await;
    assert_eq!(
        proxy.call_value("echo", json!(["x"])).await.unwrap_err(),
        BridgeError::Disconnected
    );
}

#[tokio::test]
async fn capacity_limit_rejects_extra_clients() {
    let cfg = config::load_from_str(
        r#"
version: 1
services:
  - name: "echo"
    max_clients: 1
"#,
    )
    .unwrap();
    let registry = ServiceRegistry::with_config(cfg);
    registry.register(echo::definition()).unwrap();
    let (_first, _h1) = connect(&registry, echo::SERVICE).await;

    let (a, b) = memory_pair("extra");
    let host = TransportAdapter::new(Arc::new(a), WireFormat::Text);
    registry.attach(&host).unwrap();
    let link = TransportAdapter::new(Arc::new(b), WireFormat::Text);
    let err = ClientProxy::connect(link, echo::SERVICE).await.err().expect("over capacity");
    assert_eq!(err, BridgeError::CapacityExceeded(echo::SERVICE.into()));
}

#[tokio::test]
async fn default_config_allows_many_clients() {
    let registry = ServiceRegistry::with_config(BridgeConfig::default());
    registry.register(echo::definition()).unwrap();
    let mut keep = Vec::new();
    for _ in 0..16 {
        keep.push(connect(&registry, echo::SERVICE).await);
    }
    assert_eq!(registry.connected_clients(echo::SERVICE).len(), 16);
}

#[tokio::test]
async fn explicit_disconnect_rejects_everything_outstanding() {
    let registry = ServiceRegistry::new();
    registry.register(echo::slow_count(Duration::from_secs(30))).unwrap();
    let (proxy, _host) = connect(&registry, "slow-echo").await;

    let calls: Vec<_> = (0..5)
        .map(|_| {
            let proxy = proxy.clone();
            tokio::spawn(async move { proxy.call_value("wait", json!([])).await })
        })
        .collect();
    let mut streams = vec![
        proxy.stream("count", (3,)).unwrap(),
        proxy.stream("count", (3,)).unwrap(),
    ];
    eventually(|| proxy.outstanding() == 7).await;

    proxy.disconnect();

    for call in calls {
        assert_eq!(call.await.unwrap().unwrap_err(), BridgeError::Disconnected);
    }
    for rx in &mut streams {
        assert_eq!(rx.next().await.unwrap().unwrap_err(), BridgeError::Disconnected);
        assert!(rx.next().await.is_none());
    }
    assert_eq!(proxy.outstanding(), 0);

    let r = registry.clone();
    eventually(move || r.connected_clients("slow-echo").is_empty()).await;
}

fn post(peer: &MemoryChannel, env: &Envelope) {
    peer.post(codec::encode(env, WireFormat::Text).unwrap()).unwrap();
}

async fn recv(peer: &MemoryChannel) -> Option<Envelope> {
    let wire = tokio::time::timeout(Duration::from_millis(200), peer.next()).await.ok()??;
    Some(codec::decode(wire).unwrap())
}

#[tokio::test]
async fn envelopes_from_a_removed_client_are_ignored() {
    let runs = Arc::new(AtomicUsize::new(0));
    let method_runs = Arc::clone(&runs);
    let stream_runs = Arc::clone(&runs);
    let registry = ServiceRegistry::new();
    registry
        .register(
            ServiceDefinition::builder("counter")
                .method("hit", move |_ctx, _args: Value| {
                    method_runs.fetch_add(1, Ordering::SeqCst);
                    async move { Ok::<_, BridgeError>(Value::Null) }
                })
                .stream("hits", move |_ctx, _args: Value, _sink| {
                    stream_runs.fetch_add(1, Ordering::SeqCst);
                    async move { Ok::<_, BridgeError>(()) }
                })
                .build(),
        )
        .unwrap();

    let (a, b) = memory_pair("raw");
    let host = TransportAdapter::new(Arc::new(a), WireFormat::Text);
    registry.attach(&host).unwrap();
    let peer = b;

    post(&peer, &Envelope::connect("counter", None));
    let ack = recv(&peer).await.unwrap();
    assert_eq!(ack.kind, Kind::ConnectAck);
    let me = ack.client_id.unwrap();
    assert_eq!(me.as_str(), "c-1");

    post(&peer, &Envelope::call("counter", &me, 1, "hit", json!([])));
    assert_eq!(recv(&peer).await.unwrap().kind, Kind::Result);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    assert!(registry.disconnect_client("counter", &me));
    assert_eq!(recv(&peer).await.unwrap().kind, Kind::Disconnect);

    post(&peer, &Envelope::call("counter", &me, 2, "hit", json!([])));
    post(&peer, &Envelope::stream_open("counter", &me, 3, "hits", json!([])));
    post(&peer, &Envelope::stream_pull("counter", &me, 3));
    assert!(recv(&peer).await.is_none());
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(registry.connected_clients("counter").is_empty());
}

#[tokio::test]
async fn malformed_values_leave_pending_calls_alone() {
    let registry = ServiceRegistry::new();
    registry.register(echo::slow_count(Duration::from_millis(100))).unwrap();

    let (a, b) = memory_pair("noisy");
    let host_end = Arc::new(a);
    let client_end = Arc::new(b);
    let host = TransportAdapter::new(Arc::clone(&host_end) as Arc<dyn Channel>, WireFormat::Text);
    registry.attach(&host).unwrap();
    let link = TransportAdapter::new(Arc::clone(&client_end) as Arc<dyn Channel>, WireFormat::Text);
    let proxy = ClientProxy::connect(link, "slow-echo").await.unwrap();

    let pending = {
        let proxy = proxy.clone();
        tokio::spawn(async move { proxy.call_value("wait", json!([])).await })
    };
    eventually(|| proxy.outstanding() == 1).await;

    // Toward the service: no `kind`.
    client_end
        .post(WireValue::Text(r#"{"serviceName":"slow-echo","clientId":"c-1","id":2}"#.into()))
        .unwrap();
    // Toward the client: no `serviceName`, then not JSON at all.
    host_end
        .post(WireValue::Text(r#"{"kind":"result","clientId":"c-1","id":2,"payload":"forged"}"#.into()))
        .unwrap();
    host_end.post(WireValue::Text("not json".into())).unwrap();

    assert_eq!(pending.await.unwrap().unwrap(), Value::Null);
    assert!(proxy.is_connected());
    assert_eq!(proxy.outstanding(), 0);
    assert_eq!(registry.metrics().decode_errors.get(&[("channel", host.label())]), 1);

    assert_eq!(proxy.call_value("wait", json!([])).await.unwrap(), Value::Null);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn calls_racing_a_service_disconnect_always_settle() {
    for _ in 0..50 {
        let registry = ServiceRegistry::new();
        registry.register(echo::definition()).unwrap();
        let (proxy, _host) = connect(&registry, echo::SERVICE).await;

        let calls: Vec<_> = (0..20)
            .map(|i| {
                let proxy = proxy.clone();
                tokio::spawn(async move {
                    tokio::time::timeout(Duration::from_secs(2), proxy.call_value("echo", json!([format!("{i}")]))).await
                })
            })
            .collect();
        assert!(registry.disconnect_client(echo::SERVICE, proxy.client_id()));

        for call in calls {
            match call.await.unwrap().expect("call never settled") {
                Ok(v) => assert!(v.is_string()),
                Err(e) => assert_eq!(e, BridgeError::Disconnected),
            }
        }
        assert_eq!(proxy.outstanding(), 0);
    }
}

#[tokio::test]
async fn panicking_listener_keeps_the_proxy_alive() {
    let registry = ServiceRegistry::new();
    registry.register(echo::definition()).unwrap();
    let (proxy, _host) = connect(&registry, echo::SERVICE).await;

    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    proxy.on("tick", |_| panic!("listener bug"));
    proxy.on("tick", move |d| {
        let _ = tx.send(d.clone());
    });

    assert_eq!(registry.broadcast(echo::SERVICE, "tick", json!(1), None).unwrap(), 1);
    let got = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!(got, json!(1));

    let reply: String = tokio::time::timeout(Duration::from_secs(1), proxy.call("echo", ("still up",)))
        .await
        .expect("receive loop stalled")
        .unwrap();
    assert_eq!(reply, "still up");
    assert!(proxy.is_connected());
}

#[tokio::test]
async fn dropping_the_last_proxy_leaves_the_service() {
    let registry = ServiceRegistry::new();
    registry.register(echo::definition()).unwrap();
    let (proxy, _host) = connect(&registry, echo::SERVICE).await;
    let (other, _h2) = connect(&registry, echo::SERVICE).await;

    let clone = proxy.clone();
    drop(proxy);
    assert!(clone.is_connected());
    assert_eq!(registry.connected_clients(echo::SERVICE).len(), 2);

    drop(clone);
    let r = registry.clone();
    eventually(move || r.connected_clients(echo::SERVICE) == vec![ClientId::new("c-2")]).await;
    assert!(other.is_connected());
}
