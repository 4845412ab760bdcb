use std::time::Duration;

use serde_json::{json, Value};

use ctxbridge_core::error::BridgeError;

use crate::dispatch::{CallContext, ServiceDefinition, StreamSink};

pub const SERVICE: &str = "echo";

/// Demo service proving each interaction style end to end.
///
/// - `echo(text)` returns `text`.
/// - `fail(message)` rejects with a handler error.
/// - `count(n)` streams `0..n`, one item per pull.
/// - `notify(detail)` broadcasts `tick` to every connected client and
///   returns how many received it.
pub fn definition() -> ServiceDefinition {
    ServiceDefinition::builder(SERVICE)
        .method_typed("echo", |_ctx: CallContext, (text,): (String,)| async move {
            Ok::<_, BridgeError>(text)
        })
        .method("fail", |_ctx, args: Value| async move {
            let msg = args
                .get(0)
                .and_then(Value::as_str)
                .unwrap_or("requested failure")
                .to_string();
            Err::<Value, _>(BridgeError::handler(msg))
        })
        .method("notify", |ctx: CallContext, args: Value| async move {
            let detail = args.get(0).cloned().unwrap_or(Value::Null);
            let sent = ctx.broadcast("tick", json!({ "from": ctx.client_id(), "detail": detail }), None)?;
            Ok::<_, BridgeError>(json!(sent))
        })
        .stream_typed("count", |_ctx: CallContext, (n,): (u64,), sink: StreamSink| async move {
            for i in 0..n {
                sink.write(json!(i)).await?;
            }
            Ok::<_, BridgeError>(())
        })
        .event("tick")
        .build()
}

/// `count` variant with a delay between items; used to exercise teardown of
/// in-flight streams.
pub fn slow_count(step: Duration) -> ServiceDefinition {
    ServiceDefinition::builder("slow-echo")
        .stream_typed("count", move |_ctx: CallContext, (n,): (u64,), sink: StreamSink| async move {
            for i in 0..n {
                tokio::time::sleep(step).await;
                sink.write(json!(i)).await?;
            }
            Ok::<_, BridgeError>(())
        })
        .method("wait", move |_ctx, _args: Value| async move {
            tokio::time::sleep(step).await;
            Ok::<_, BridgeError>(Value::Null)
        })
        .build()
}

