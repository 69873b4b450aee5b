//! Dispatcher - the request/response core shared by all transports.
//!
//! A transport adapter hands request bytes to [`Dispatcher::handle`] and
//! writes back whatever bytes it returns. In between:
//!
//! 1. `handle` starts the deadline and runs the [`IoHandler`] chain
//! 2. the innermost step, [`Dispatcher::process`], decodes the request and
//!    resolves the method
//! 3. the [`InvokeHandler`] chain runs, ending in [`Dispatcher::execute`]
//! 4. the outcome (value or error) is encoded into the response
//!
//! Errors raised by decoding, resolution or the method itself travel back
//! encoded in the response. `handle` only fails on timeout or when the codec
//! cannot encode.
//!
//! # Example
//!
//! ```ignore
//! let dispatcher = Dispatcher::builder()
//!     .timeout(Duration::from_secs(5))
//!     .build();
//!
//! dispatcher.methods().add_fn("sum", |a: i64, b: i64| async move {
//!     Ok::<_, RpcError>(a + b)
//! })?;
//!
//! let mut ctx = RequestContext::new();
//! let response = dispatcher.handle(request, &mut ctx).await?;
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use serde_json::Value;

use crate::codec::{MsgPackServiceCodec, Request, ServiceCodec};
use crate::error::{ProcwireError, Result, RpcError};
use crate::handler::{Chain, InvokeHandler, IoHandler, NextInvoke, NextIo, RequestContext};
use crate::method::{Invoker, MethodRegistry};
use crate::transport::{Binder, TransportRegistry};

/// Default dispatch timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default maximum request length in bytes (`i32::MAX`).
pub const DEFAULT_MAX_REQUEST_LENGTH: usize = i32::MAX as usize;

/// Dispatcher settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Upper bound for one `handle` call. Zero disables the timeout.
    pub timeout: Duration,
    /// Largest request transports should accept. Not checked by the
    /// dispatcher itself.
    pub max_request_length: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_request_length: DEFAULT_MAX_REQUEST_LENGTH,
        }
    }
}

/// Builder for a [`Dispatcher`].
pub struct DispatcherBuilder {
    config: DispatcherConfig,
    codec: Arc<dyn ServiceCodec>,
    transports: TransportRegistry,
}

impl DispatcherBuilder {
    /// Create a builder with default settings, the MsgPack codec and the
    /// global transport registry.
    pub fn new() -> Self {
        Self {
            config: DispatcherConfig::default(),
            codec: Arc::new(MsgPackServiceCodec),
            transports: TransportRegistry::global().clone(),
        }
    }

    /// Set the dispatch timeout. Zero disables it.
    ///
    /// Default: 30s
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set the maximum request length advertised to transports.
    ///
    /// Default: `i32::MAX`
    pub fn max_request_length(mut self, length: usize) -> Self {
        self.config.max_request_length = length;
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the codec.
    ///
    /// Default: [`MsgPackServiceCodec`]
    pub fn codec(mut self, codec: impl ServiceCodec) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Take transport handlers from `registry` instead of the global one.
    pub fn transports(mut self, registry: &TransportRegistry) -> Self {
        self.transports = registry.clone();
        self
    }

    /// Build the dispatcher.
    ///
    /// Snapshots the transport registry: one binder per registered handler
    /// name. Later registrations do not affect this dispatcher.
    pub fn build(self) -> Dispatcher {
        let DispatcherBuilder {
            config,
            codec,
            transports,
        } = self;

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let snapshot = transports.instantiate(&WeakDispatcher(weak.clone()));
            Inner {
                config,
                codec,
                methods: MethodRegistry::new(),
                io_handlers: Chain::new(),
                invoke_handlers: Chain::new(),
                binders: snapshot.binders,
                server_types: snapshot.server_types,
            }
        });

        tracing::debug!(
            "Dispatcher built with {} transport handler(s), timeout {:?}",
            inner.binders.len(),
            inner.config.timeout
        );

        Dispatcher { inner }
    }
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct Inner {
    config: DispatcherConfig,
    codec: Arc<dyn ServiceCodec>,
    methods: MethodRegistry,
    io_handlers: Chain<dyn IoHandler>,
    invoke_handlers: Chain<dyn InvokeHandler>,
    binders: HashMap<String, Arc<dyn Binder>>,
    server_types: HashMap<TypeId, Vec<String>>,
}

/// The dispatch core.
///
/// Cheap to clone; clones share methods, middleware and binders.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

/// Non-owning handle to a [`Dispatcher`], held by transport binders.
#[derive(Clone)]
pub struct WeakDispatcher(Weak<Inner>);

impl WeakDispatcher {
    /// Get the dispatcher back, if it is still alive.
    pub fn upgrade(&self) -> Option<Dispatcher> {
        self.0.upgrade().map(|inner| Dispatcher { inner })
    }
}

impl std::fmt::Debug for WeakDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakDispatcher")
            .field("alive", &(self.0.strong_count() > 0))
            .finish()
    }
}

impl Dispatcher {
    /// Create a dispatcher with default settings.
    pub fn new() -> Self {
        DispatcherBuilder::new().build()
    }

    /// Create a builder.
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    /// A weak handle to this dispatcher.
    pub fn downgrade(&self) -> WeakDispatcher {
        WeakDispatcher(Arc::downgrade(&self.inner))
    }

    /// The method registry.
    #[inline]
    pub fn methods(&self) -> &MethodRegistry {
        &self.inner.methods
    }

    /// The codec.
    #[inline]
    pub fn codec(&self) -> &Arc<dyn ServiceCodec> {
        &self.inner.codec
    }

    /// Current configuration.
    #[inline]
    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// Dispatch timeout (zero when disabled).
    #[inline]
    pub fn timeout(&self) -> Duration {
        self.inner.config.timeout
    }

    /// Maximum request length transports should accept.
    #[inline]
    pub fn max_request_length(&self) -> usize {
        self.inner.config.max_request_length
    }

    /// Handle one request end to end.
    ///
    /// Runs the IO chain and `process` under the configured timeout. On
    /// timeout the in-flight dispatch is dropped, the context's cancellation
    /// token is cancelled and [`ProcwireError::Timeout`] is returned.
    pub async fn handle(&self, request: Bytes, ctx: &mut RequestContext) -> Result<Bytes> {
        let timeout = self.inner.config.timeout;
        ctx.start_deadline(timeout);

        let chain = self.inner.io_handlers.load();
        let dispatch = NextIo::new(self, &chain).run(request, ctx);

        if timeout.is_zero() {
            return dispatch.await;
        }

        let outcome = tokio::time::timeout(timeout, dispatch).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                ctx.cancellation().cancel();
                tracing::warn!(
                    "Request {} timed out after {:?}",
                    ctx.method().map(|m| m.fullname()).unwrap_or("<undecoded>"),
                    timeout
                );
                Err(ProcwireError::Timeout(timeout))
            }
        }
    }

    /// Decode, resolve, invoke and encode. Innermost step of the IO chain.
    ///
    /// Any failure before encoding becomes an encoded error response,
    /// including a panic in the codec or in an invoke handler.
    pub async fn process(&self, request: Bytes, ctx: &mut RequestContext) -> Result<Bytes> {
        let result = match AssertUnwindSafe(self.decode_and_invoke(request, ctx))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let reason = panic_message(&*panic);
                Err(ProcwireError::Invocation(RpcError::internal(format!(
                    "dispatch panicked: {reason}"
                ))))
            }
        };

        let outcome = match result {
            Ok(value) => Ok(value),
            Err(err) => {
                tracing::debug!("Call failed: {}", err);
                Err(err.into_rpc_error())
            }
        };
        self.inner.codec.encode(outcome, ctx)
    }

    async fn decode_and_invoke(&self, request: Bytes, ctx: &mut RequestContext) -> Result<Value> {
        let Request { fullname, args } = self.inner.codec.decode(&request, ctx)?;
        let method = self.inner.methods.get(&fullname, args.len())?;
        ctx.set_method(method);

        let chain = self.inner.invoke_handlers.load();
        NextInvoke::new(self, &chain)
            .run(&fullname, args, ctx)
            .await
    }

    /// Invoke the method resolved for this call. Innermost step of the
    /// invoke chain.
    ///
    /// Resolves `name` against the registry when the context carries no
    /// method yet. Method errors come back as
    /// [`ProcwireError::Invocation`]; a panic is reported the same way with
    /// an internal error code.
    pub async fn execute(
        &self,
        name: &str,
        args: Vec<Value>,
        ctx: &mut RequestContext,
    ) -> Result<Value> {
        let method = match ctx.method() {
            Some(method) => Arc::clone(method),
            None => {
                let method = self.inner.methods.get(name, args.len())?;
                ctx.set_method(Arc::clone(&method));
                method
            }
        };

        let call = invoke(method.invoker().clone(), name.to_string(), args, ctx.clone());
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let reason = panic_message(&*panic);
                tracing::debug!("Method {} panicked: {}", method.fullname(), reason);
                Err(ProcwireError::Invocation(RpcError::internal(format!(
                    "method {} panicked: {}",
                    method.fullname(),
                    reason
                ))))
            }
        }
    }

    /// Append an IO handler. The first one registered is the outermost.
    pub fn use_io_handler(&self, handler: Arc<dyn IoHandler>) -> &Self {
        self.inner.io_handlers.push(handler);
        self
    }

    /// Remove an IO handler by identity. Returns whether it was registered.
    pub fn unuse_io_handler(&self, handler: &Arc<dyn IoHandler>) -> bool {
        self.inner.io_handlers.remove(handler)
    }

    /// Append an invoke handler. The first one registered is the outermost.
    pub fn use_invoke_handler(&self, handler: Arc<dyn InvokeHandler>) -> &Self {
        self.inner.invoke_handlers.push(handler);
        self
    }

    /// Remove an invoke handler by identity. Returns whether it was registered.
    pub fn unuse_invoke_handler(&self, handler: &Arc<dyn InvokeHandler>) -> bool {
        self.inner.invoke_handlers.remove(handler)
    }

    /// Number of installed `(io, invoke)` handlers.
    pub fn handler_counts(&self) -> (usize, usize) {
        (
            self.inner.io_handlers.len(),
            self.inner.invoke_handlers.len(),
        )
    }

    /// The binder created for transport handler `name`.
    pub fn transport_handler(&self, name: &str) -> Option<Arc<dyn Binder>> {
        self.inner.binders.get(name).cloned()
    }

    /// Attach this dispatcher to `server`.
    ///
    /// Every transport handler registered for `S` binds, or only the one
    /// called `name` when given.
    ///
    /// # Errors
    ///
    /// - [`ProcwireError::UnsupportedServerType`] if no handler serves `S`
    /// - [`ProcwireError::HandlerNotFound`] if `name` matches none of them
    /// - whatever the binder itself returns
    ///
    /// Handler names are all resolved before any binder runs. Binders run in
    /// registration order and stop at the first failure; the ones that
    /// already ran stay attached.
    pub fn bind<S: Any>(&self, server: &S, name: Option<&str>) -> Result<()> {
        let server_type = std::any::type_name::<S>();
        let names = self
            .inner
            .server_types
            .get(&TypeId::of::<S>())
            .ok_or(ProcwireError::UnsupportedServerType(server_type))?;

        let binders = names
            .iter()
            .filter(|n| name.map_or(true, |wanted| wanted == n.as_str()))
            .map(|handler_name| {
                self.inner
                    .binders
                    .get(handler_name)
                    .map(|binder| (handler_name, binder))
                    .ok_or_else(|| ProcwireError::HandlerNotFound(handler_name.clone()))
            })
            .collect::<Result<Vec<_>>>()?;

        if let (Some(wanted), true) = (name, binders.is_empty()) {
            return Err(ProcwireError::HandlerNotFound(wanted.to_string()));
        }

        for (handler_name, binder) in binders {
            tracing::debug!("Binding {} handler to {}", handler_name, server_type);
            binder.bind(server)?;
        }
        Ok(())
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.inner.config)
            .field("methods", &self.inner.methods.names())
            .field("io_handlers", &self.inner.io_handlers.len())
            .field("invoke_handlers", &self.inner.invoke_handlers.len())
            .field("transports", &self.inner.binders.keys().collect::<Vec<_>>())
            .finish()
    }
}

async fn invoke(
    invoker: Invoker,
    name: String,
    args: Vec<Value>,
    ctx: RequestContext,
) -> Result<Value> {
    match invoker {
        Invoker::Positional(f) => f(args, ctx).await,
        Invoker::Missing(f) => f(name, args, ctx).await,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{RequestEnvelope, ResponseEnvelope};
    use crate::error::codes;
    use crate::transport::TransportHandler;
    use futures::future::BoxFuture;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request(method: &str, args: Vec<Value>) -> Bytes {
        MsgPackServiceCodec::encode_request(&RequestEnvelope::new(method, args)).unwrap()
    }

    fn response(bytes: &[u8]) -> ResponseEnvelope {
        MsgPackServiceCodec::decode_response(bytes).unwrap()
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::builder()
            .transports(&TransportRegistry::new())
            .build()
    }

    #[test]
    fn test_builder_defaults() {
        let d = dispatcher();
        assert_eq!(d.timeout(), DEFAULT_TIMEOUT);
        assert_eq!(d.max_request_length(), i32::MAX as usize);
        assert_eq!(d.handler_counts(), (0, 0));
    }

    #[test]
    fn test_builder_custom() {
        let d = Dispatcher::builder()
            .timeout(Duration::from_millis(250))
            .max_request_length(1024)
            .transports(&TransportRegistry::new())
            .build();
        assert_eq!(d.timeout(), Duration::from_millis(250));
        assert_eq!(d.config().max_request_length, 1024);
    }

    #[tokio::test]
    async fn test_handle_round_trip() {
        let d = dispatcher();
        d.methods()
            .add_fn("sum", |a: i64, b: i64, c: i64| async move {
                Ok::<_, RpcError>(a + b + c)
            })
            .unwrap();

        let mut ctx = RequestContext::new();
        let out = d
            .handle(request("sum", vec![json!(1), json!(2), json!(3)]), &mut ctx)
            .await
            .unwrap();

        assert_eq!(response(&out).into_outcome(), Ok(json!(6)));
        assert_eq!(ctx.method().unwrap().fullname(), "sum");
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_timeout() {
        let d = Dispatcher::builder()
            .timeout(Duration::from_millis(100))
            .transports(&TransportRegistry::new())
            .build();
        d.methods()
            .add_fn("slow", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, RpcError>("done")
            })
            .unwrap();

        let mut ctx = RequestContext::new();
        let err = d.handle(request("slow", vec![]), &mut ctx).await.unwrap_err();

        assert!(matches!(err, ProcwireError::Timeout(t) if t == Duration::from_millis(100)));
        assert!(ctx.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_disables_timer() {
        let d = Dispatcher::builder()
            .timeout(Duration::ZERO)
            .transports(&TransportRegistry::new())
            .build();
        d.methods()
            .add_fn("slow", || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, RpcError>(1)
            })
            .unwrap();

        let mut ctx = RequestContext::new();
        let out = d.handle(request("slow", vec![]), &mut ctx).await.unwrap();
        assert_eq!(response(&out).into_outcome(), Ok(json!(1)));
        assert!(ctx.deadline().is_none());
    }

    #[tokio::test]
    async fn test_application_error_is_exact() {
        let d = dispatcher();
        let app = RpcError::new("E_DENIED", "not allowed").with_data(json!({"role": "guest"}));
        let returned = app.clone();
        d.methods()
            .add_fn("guarded", move || {
                let err = returned.clone();
                async move { Err::<(), _>(err) }
            })
            .unwrap();

        let out = d
            .handle(request("guarded", vec![]), &mut RequestContext::new())
            .await
            .unwrap();
        assert_eq!(response(&out).into_outcome(), Err(app));
    }

    #[tokio::test]
    async fn test_method_not_found_is_encoded() {
        let d = dispatcher();
        let out = d
            .handle(request("nope", vec![json!(1)]), &mut RequestContext::new())
            .await
            .unwrap();

        let err = response(&out).into_outcome().unwrap_err();
        assert_eq!(err.code, codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_decode_error_is_encoded() {
        let d = dispatcher();
        let out = d
            .handle(Bytes::from_static(b"\xc1\xc1"), &mut RequestContext::new())
            .await
            .unwrap();

        let err = response(&out).into_outcome().unwrap_err();
        assert_eq!(err.code, codes::DECODE_ERROR);
    }

    #[tokio::test]
    async fn test_invalid_params_is_encoded() {
        let d = dispatcher();
        d.methods()
            .add_sync_fn("double", |n: i64| Ok::<_, RpcError>(n * 2))
            .unwrap();

        let out = d
            .handle(request("double", vec![json!("x")]), &mut RequestContext::new())
            .await
            .unwrap();

        let err = response(&out).into_outcome().unwrap_err();
        assert_eq!(err.code, codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_missing_method_receives_name_and_args() {
        let d = dispatcher();
        d.methods().add_missing_method(|name: String, args: Vec<Value>| async move {
            Ok::<_, RpcError>(json!({ "name": name, "args": args }))
        });

        let out = d
            .handle(request("foo.bar", vec![json!(1), json!("x")]), &mut RequestContext::new())
            .await
            .unwrap();

        assert_eq!(
            response(&out).into_outcome(),
            Ok(json!({ "name": "foo.bar", "args": [1, "x"] }))
        );
    }

    #[tokio::test]
    async fn test_arity_selects_overload() {
        let d = dispatcher();
        d.methods()
            .add_sync_fn("f", |a: i64, b: i64| Ok::<_, RpcError>(a + b))
            .unwrap();
        d.methods()
            .add_sync_fn("f", |a: i64, b: i64, c: i64| Ok::<_, RpcError>(a * b * c))
            .unwrap();

        let two = d
            .handle(request("f", vec![json!(2), json!(3)]), &mut RequestContext::new())
            .await
            .unwrap();
        let three = d
            .handle(
                request("f", vec![json!(2), json!(3), json!(4)]),
                &mut RequestContext::new(),
            )
            .await
            .unwrap();

        assert_eq!(response(&two).into_outcome(), Ok(json!(5)));
        assert_eq!(response(&three).into_outcome(), Ok(json!(24)));
    }

    #[tokio::test]
    async fn test_panic_is_captured() {
        let d = dispatcher();
        d.methods()
            .add_sync_fn("boom", || -> std::result::Result<(), RpcError> {
                panic!("kaboom")
            })
            .unwrap();

        let out = d
            .handle(request("boom", vec![]), &mut RequestContext::new())
            .await
            .unwrap();

        let err = response(&out).into_outcome().unwrap_err();
        assert_eq!(err.code, codes::INTERNAL_ERROR);
        assert!(err.message.contains("kaboom"));
    }

    struct Exploding;

    impl InvokeHandler for Exploding {
        fn handle<'a>(
            &'a self,
            _name: &'a str,
            args: Vec<Value>,
            _ctx: &'a mut RequestContext,
            _next: NextInvoke<'a>,
        ) -> BoxFuture<'a, Result<Value>> {
            Box::pin(async move { Ok(args[5].clone()) })
        }
    }

    #[tokio::test]
    async fn test_invoke_handler_panic_is_encoded() {
        let d = dispatcher();
        d.methods()
            .add_sync_fn("ping", || Ok::<_, RpcError>("pong"))
            .unwrap();
        d.use_invoke_handler(Arc::new(Exploding));

        let out = AssertUnwindSafe(d.handle(request("ping", vec![]), &mut RequestContext::new()))
            .catch_unwind()
            .await
            .expect("panic escaped handle")
            .unwrap();

        let err = response(&out).into_outcome().unwrap_err();
        assert_eq!(err.code, codes::INTERNAL_ERROR);
        assert!(err.message.contains("panicked"));
    }

    struct PanickingCodec;

    impl ServiceCodec for PanickingCodec {
        fn decode(&self, _request: &[u8], _ctx: &mut RequestContext) -> Result<Request> {
            panic!("decoder bug")
        }

        fn encode(&self, outcome: crate::codec::Outcome, ctx: &RequestContext) -> Result<Bytes> {
            MsgPackServiceCodec.encode(outcome, ctx)
        }
    }

    #[tokio::test]
    async fn test_codec_panic_is_encoded() {
        let d = Dispatcher::builder()
            .codec(PanickingCodec)
            .transports(&TransportRegistry::new())
            .build();

        let out = d
            .handle(request("ping", vec![]), &mut RequestContext::new())
            .await
            .unwrap();

        let err = response(&out).into_outcome().unwrap_err();
        assert_eq!(err.code, codes::INTERNAL_ERROR);
        assert!(err.message.contains("decoder bug"));
    }

    #[tokio::test]
    async fn test_execute_without_resolved_method() {
        let d = dispatcher();
        d.methods()
            .add_sync_fn("inc", |n: i64| Ok::<_, RpcError>(n + 1))
            .unwrap();

        let mut ctx = RequestContext::new();
        let out = d.execute("inc", vec![json!(41)], &mut ctx).await.unwrap();
        assert_eq!(out, json!(42));
        assert_eq!(ctx.method().unwrap().fullname(), "inc");
    }

    struct Recorder {
        tag: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl InvokeHandler for Recorder {
        fn handle<'a>(
            &'a self,
            name: &'a str,
            args: Vec<Value>,
            ctx: &'a mut RequestContext,
            next: NextInvoke<'a>,
        ) -> BoxFuture<'a, Result<Value>> {
            Box::pin(async move {
                self.log.lock().push(format!("{}>{}", self.tag, name));
                let result = next.run(name, args, ctx).await;
                self.log.lock().push(format!("<{}", self.tag));
                result
            })
        }
    }

    impl IoHandler for Recorder {
        fn handle<'a>(
            &'a self,
            request: Bytes,
            ctx: &'a mut RequestContext,
            next: NextIo<'a>,
        ) -> BoxFuture<'a, Result<Bytes>> {
            Box::pin(async move {
                self.log.lock().push(format!("io:{}", self.tag));
                next.run(request, ctx).await
            })
        }
    }

    #[tokio::test]
    async fn test_middleware_onion_order() {
        let d = dispatcher();
        let log = Arc::new(Mutex::new(Vec::new()));
        d.methods()
            .add_sync_fn("ping", || Ok::<_, RpcError>("pong"))
            .unwrap();

        d.use_io_handler(Arc::new(Recorder { tag: "A", log: log.clone() }));
        d.use_invoke_handler(Arc::new(Recorder { tag: "outer", log: log.clone() }))
            .use_invoke_handler(Arc::new(Recorder { tag: "inner", log: log.clone() }));

        let out = d
            .handle(request("ping", vec![]), &mut RequestContext::new())
            .await
            .unwrap();

        assert_eq!(response(&out).into_outcome(), Ok(json!("pong")));
        assert_eq!(
            *log.lock(),
            vec!["io:A", "outer>ping", "inner>ping", "<inner", "<outer"]
        );
    }

    #[tokio::test]
    async fn test_unuse_by_identity() {
        let d = dispatcher();
        let log = Arc::new(Mutex::new(Vec::new()));
        d.methods()
            .add_sync_fn("ping", || Ok::<_, RpcError>("pong"))
            .unwrap();

        let handler: Arc<dyn InvokeHandler> = Arc::new(Recorder { tag: "x", log: log.clone() });
        d.use_invoke_handler(Arc::clone(&handler));
        assert!(d.unuse_invoke_handler(&handler));
        assert!(!d.unuse_invoke_handler(&handler));

        d.handle(request("ping", vec![]), &mut RequestContext::new())
            .await
            .unwrap();
        assert!(log.lock().is_empty());
    }

    struct ShortCircuit;

    impl InvokeHandler for ShortCircuit {
        fn handle<'a>(
            &'a self,
            _name: &'a str,
            _args: Vec<Value>,
            _ctx: &'a mut RequestContext,
            _next: NextInvoke<'a>,
        ) -> BoxFuture<'a, Result<Value>> {
            Box::pin(async { Err(ProcwireError::Invocation(RpcError::new("E_AUTH", "denied"))) })
        }
    }

    #[tokio::test]
    async fn test_invoke_handler_can_short_circuit() {
        let d = dispatcher();
        let called = Arc::new(AtomicUsize::new(0));
        let counter = called.clone();
        d.methods()
            .add_sync_fn("secret", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, RpcError>(42)
            })
            .unwrap();
        d.use_invoke_handler(Arc::new(ShortCircuit));

        let out = d
            .handle(request("secret", vec![]), &mut RequestContext::new())
            .await
            .unwrap();

        assert_eq!(response(&out).into_outcome(), Err(RpcError::new("E_AUTH", "denied")));
        assert_eq!(called.load(Ordering::SeqCst), 0);
    }

    struct Listener;
    struct Unknown;

    struct CountingBinder {
        dispatcher: WeakDispatcher,
        binds: Arc<AtomicUsize>,
    }

    impl Binder for CountingBinder {
        fn bind(&self, server: &dyn Any) -> Result<()> {
            crate::transport::downcast_server::<Listener>(server)?;
            assert!(self.dispatcher.upgrade().is_some());
            self.binds.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_bind_calls_binder_once() {
        let registry = TransportRegistry::new();
        let binds = Arc::new(AtomicUsize::new(0));
        let counter = binds.clone();
        registry.register_with::<Listener, _>("test", move |dispatcher| -> Arc<dyn Binder> {
            Arc::new(CountingBinder {
                dispatcher,
                binds: counter.clone(),
            })
        });

        let d = Dispatcher::builder().transports(&registry).build();
        d.bind(&Listener, None).unwrap();

        assert_eq!(binds.load(Ordering::SeqCst), 1);
        assert!(d.transport_handler("test").is_some());
    }

    #[test]
    fn test_bind_unsupported_type() {
        let d = dispatcher();
        let err = d.bind(&Unknown, None).unwrap_err();
        assert!(matches!(err, ProcwireError::UnsupportedServerType(_)));
    }

    #[test]
    fn test_bind_with_unknown_name() {
        struct Nop;
        impl Binder for Nop {
            fn bind(&self, _server: &dyn Any) -> Result<()> {
                Ok(())
            }
        }
        impl TransportHandler for Nop {
            fn new(_dispatcher: WeakDispatcher) -> Self {
                Nop
            }
        }

        let registry = TransportRegistry::new();
        registry.register::<Nop, Listener>("tcp");
        let d = Dispatcher::builder().transports(&registry).build();

        assert!(d.bind(&Listener, Some("tcp")).is_ok());
        let err = d.bind(&Listener, Some("http")).unwrap_err();
        assert!(matches!(err, ProcwireError::HandlerNotFound(name) if name == "http"));
    }

    struct FailingBinder;

    impl Binder for FailingBinder {
        fn bind(&self, _server: &dyn Any) -> Result<()> {
            Err(ProcwireError::HandlerNotFound("listener closed".to_string()))
        }
    }

    #[test]
    fn test_bind_stops_at_first_failure() {
        let registry = TransportRegistry::new();
        let binds = Arc::new(AtomicUsize::new(0));
        let counter = binds.clone();
        registry.register_with::<Listener, _>("first", move |dispatcher| -> Arc<dyn Binder> {
            Arc::new(CountingBinder {
                dispatcher,
                binds: counter.clone(),
            })
        });
        registry.register_with::<Listener, _>("broken", |_| -> Arc<dyn Binder> {
            Arc::new(FailingBinder)
        });

        let d = Dispatcher::builder().transports(&registry).build();
        assert!(d.bind(&Listener, None).is_err());
        assert_eq!(binds.load(Ordering::SeqCst), 1);

        // An unknown name fails before any binder runs.
        assert!(d.bind(&Listener, Some("missing")).is_err());
        assert_eq!(binds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_later_registration_not_seen() {
        let registry = TransportRegistry::new();
        let d = Dispatcher::builder().transports(&registry).build();

        registry.register_with::<Listener, _>("late", |dispatcher| -> Arc<dyn Binder> {
            Arc::new(CountingBinder {
                dispatcher,
                binds: Arc::new(AtomicUsize::new(0)),
            })
        });

        assert!(d.transport_handler("late").is_none());
        assert!(matches!(
            d.bind(&Listener, None),
            Err(ProcwireError::UnsupportedServerType(_))
        ));
    }

    #[test]
    fn test_weak_dispatcher_does_not_keep_alive() {
        let d = dispatcher();
        let weak = d.downgrade();
        assert!(weak.upgrade().is_some());
        drop(d);
        assert!(weak.upgrade().is_none());
    }
}
