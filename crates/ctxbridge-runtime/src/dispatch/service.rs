//! Service definitions.
//!
//! A service is built once with `ServiceDefinition::builder` and is immutable
//! afterwards. The builder records each method, stream, and event in the
//! published manifest in registration order.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use ctxbridge_core::error::{BridgeError, Result};
use ctxbridge_core::protocol::{Descriptor, ServiceManifest};

use crate::dispatch::context::CallContext;
use crate::dispatch::stream::StreamSink;

/// Unary method handler.
#[async_trait]
pub trait MethodHandler: Send + Sync + 'static {
    async fn call(&self, ctx: CallContext, args: Value) -> Result<Value>;
}

/// Stream handler. Returning `Ok` ends the stream successfully unless the
/// handler already closed the sink; returning `Err` ends it with that error.
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    async fn open(&self, ctx: CallContext, args: Value, sink: StreamSink) -> Result<()>;
}

struct FnMethod<F>(F);

#[async_trait]
impl<F, Fut> MethodHandler for FnMethod<F>
where
    F: Fn(CallContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn call(&self, ctx: CallContext, args: Value) -> Result<Value> {
        (self.0)(ctx, args).await
    }
}

/// Wrapper that deserializes arguments and serializes the result.
struct TypedMethod<F, A, R, Fut> {
    handler: F,
    _phantom: PhantomData<fn(A) -> (R, Fut)>,
}

#[async_trait]
impl<F, A, R, Fut> MethodHandler for TypedMethod<F, A, R, Fut>
where
    F: Fn(CallContext, A) -> Fut + Send + Sync + 'static,
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    async fn call(&self, ctx: CallContext, args: Value) -> Result<Value> {
        let parsed: A = parse_args(args)?;
        let out = (self.handler)(ctx, parsed).await?;
        serde_json::to_value(out).map_err(|e| BridgeError::Encode(format!("result encode failed: {e}")))
    }
}

struct FnStream<F>(F);

#[async_trait]
impl<F, Fut> StreamHandler for FnStream<F>
where
    F: Fn(CallContext, Value, StreamSink) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn open(&self, ctx: CallContext, args: Value, sink: StreamSink) -> Result<()> {
        (self.0)(ctx, args, sink).await
    }
}

struct TypedStream<F, A, Fut> {
    handler: F,
    _phantom: PhantomData<fn(A) -> Fut>,
}

#[async_trait]
impl<F, A, Fut> StreamHandler for TypedStream<F, A, Fut>
where
    F: Fn(CallContext, A, StreamSink) -> Fut + Send + Sync + 'static,
    A: DeserializeOwned + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn open(&self, ctx: CallContext, args: Value, sink: StreamSink) -> Result<()> {
        let parsed: A = parse_args(args)?;
        (self.handler)(ctx, parsed, sink).await
    }
}

fn parse_args<A: DeserializeOwned>(args: Value) -> Result<A> {
    serde_json::from_value(args).map_err(|e| BridgeError::handler(format!("invalid arguments: {e}")))
}

/// A named service: its manifest plus the handlers behind it.
pub struct ServiceDefinition {
    manifest: ServiceManifest,
    methods: HashMap<String, Arc<dyn MethodHandler>>,
    streams: HashMap<String, Arc<dyn StreamHandler>>,
}

impl ServiceDefinition {
    pub fn builder(name: &str) -> ServiceBuilder {
        ServiceBuilder {
            manifest: ServiceManifest::new(name),
            methods: HashMap::new(),
            streams: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.manifest.service
    }

    pub fn manifest(&self) -> &ServiceManifest {
        &self.manifest
    }

    pub fn method(&self, name: &str) -> Option<Arc<dyn MethodHandler>> {
        self.methods.get(name).cloned()
    }

    pub fn stream(&self, name: &str) -> Option<Arc<dyn StreamHandler>> {
        self.streams.get(name).cloned()
    }
}

pub struct ServiceBuilder {
    manifest: ServiceManifest,
    methods: HashMap<String, Arc<dyn MethodHandler>>,
    streams: HashMap<String, Arc<dyn StreamHandler>>,
}

impl ServiceBuilder {
    /// Register a method taking and returning raw JSON values.
    pub fn method<F, Fut>(self, name: &str, handler: F) -> Self
    where
        F: Fn(CallContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.method_handler(name, Arc::new(FnMethod(handler)))
    }

    /// Register a method with typed arguments (a tuple for positional args)
    /// and a typed result.
    pub fn method_typed<F, A, R, Fut>(self, name: &str, handler: F) -> Self
    where
        F: Fn(CallContext, A) -> Fut + Send + Sync + 'static,
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        self.method_handler(
            name,
            Arc::new(TypedMethod {
                handler,
                _phantom: PhantomData,
            }),
        )
    }

    pub fn method_handler(mut self, name: &str, handler: Arc<dyn MethodHandler>) -> Self {
        if self.methods.insert(name.to_string(), handler).is_some() {
            tracing::warn!(service = %self.manifest.service, method = name, "method handler replaced");
        }
        self.manifest.push(Descriptor::Method(name.to_string()));
        self
    }

    pub fn stream<F, Fut>(self, name: &str, handler: F) -> Self
    where
        F: Fn(CallContext, Value, StreamSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.stream_handler(name, Arc::new(FnStream(handler)))
    }

    pub fn stream_typed<F, A, Fut>(self, name: &str, handler: F) -> Self
    where
        F: Fn(CallContext, A, StreamSink) -> Fut + Send + Sync + 'static,
        A: DeserializeOwned + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.stream_handler(
            name,
            Arc::new(TypedStream {
                handler,
                _phantom: PhantomData,
            }),
        )
    }

    pub fn stream_handler(mut self, name: &str, handler: Arc<dyn StreamHandler>) -> Self {
        if self.streams.insert(name.to_string(), handler).is_some() {
            tracing::warn!(service = %self.manifest.service, stream = name, "stream handler replaced");
        }
        self.manifest.push(Descriptor::Stream(name.to_string()));
        self
    }

    /// Declare an event the service broadcasts.
    pub fn event(mut self, name: &str) -> Self {
        self.manifest.push(Descriptor::Event(name.to_string()));
        self
    }

    pub fn build(self) -> ServiceDefinition {
        ServiceDefinition {
            manifest: self.manifest,
            methods: self.methods,
            streams: self.streams,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn manifest_follows_registration_order() {
        let def = ServiceDefinition::builder("contacts-service")
            .method("save", |_ctx, args| async move { Ok(args) })
            .stream("getAll", |_ctx, _args, _sink| async move { Ok(()) })
            .event("changed")
            .method("remove", |_ctx, _args| async move { Ok(Value::Null) })
            .build();

        let names: Vec<&str> = def.manifest().entries.iter().map(|d| d.name()).collect();
        assert_eq!(names, ["save", "getAll", "changed", "remove"]);
        assert!(def.method("save").is_some());
        assert!(def.method("getAll").is_none());
        assert!(def.stream("getAll").is_some());
    }

    #[test]
    fn parse_args_reports_handler_error() {
        let err = parse_args::<(u32,)>(json!(["not a number"])).unwrap_err();
        assert_eq!(err.kind(), ctxbridge_core::ErrorKind::HandlerError);
        let ok: (u32, String) = parse_args(json!([7, "x"])).unwrap();
        assert_eq!(ok, (7, "x".to_string()));
    }
}
