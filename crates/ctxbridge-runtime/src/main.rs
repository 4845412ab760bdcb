//! ctxbridge demo
//!
//! Hosts the built-in `echo` service and a client proxy on either end of an
//! in-memory channel pair, then runs one call, one stream, and one broadcast.
//! Usage: `ctxbridge-demo [config.yaml]`

use std::sync::Arc;

use serde_json::{json, Value};
use tracing_subscriber::{fmt, EnvFilter};

use ctxbridge_core::error::Result;
use ctxbridge_runtime::{config, memory_pair, services, ClientProxy, ServiceRegistry, TransportAdapter};

#[tokio::main]
async fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cfg = match std::env::args().nth(1) {
        Some(path) => config::load_from_file(&path)?,
        None => config::BridgeConfig::default(),
    };
    let format = cfg.transport.wire_format;
    let client_cfg = cfg.client.clone();

    let registry = ServiceRegistry::with_config(cfg);
    registry.register(services::echo::definition())?;

    let (host_end, client_end) = memory_pair("demo");
    let host = TransportAdapter::new(Arc::new(host_end), format);
    let link = TransportAdapter::new(Arc::new(client_end), format);
    registry.attach(&host)?;

    let proxy = ClientProxy::connect_with(link, services::echo::SERVICE, &client_cfg).await?;
    tracing::info!(client_id = %proxy.client_id(), manifest = ?proxy.manifest(), "connected to echo");

    let reply: String = proxy.call("echo", ("hello across contexts",)).await?;
    tracing::info!(%reply, "echo call");

    let items = proxy.stream("count", (5,))?.collect_all().await?;
    tracing::info!(?items, "count stream");

    proxy.on("tick", |detail: &Value| tracing::info!(%detail, "tick event"));
    let delivered = proxy.call_value("notify", json!(["demo"])).await?;
    tracing::info!(%delivered, "broadcast sent");

    // `tick` is posted before the `result`, so the listener already ran.
    proxy.disconnect();

    print!("{}", registry.metrics().render());
    Ok(())
}
