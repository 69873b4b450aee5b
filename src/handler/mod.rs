//! Handler module - middleware chains around the dispatch core.
//!
//! Provides:
//! - [`IoHandler`] - sees raw request bytes, wraps `process`
//! - [`InvokeHandler`] - sees decoded calls, wraps `execute`
//! - [`RequestContext`] - per-request state shared along the chain
//!
//! Chains are onion-shaped: the first handler registered is the outermost,
//! it sees the call first and the result last. Each handler decides whether
//! (and how) to continue by calling `next.run(...)`.
//!
//! # Example
//!
//! ```ignore
//! struct Logging;
//!
//! impl InvokeHandler for Logging {
//!     fn handle<'a>(
//!         &'a self,
//!         name: &'a str,
//!         args: Vec<Value>,
//!         ctx: &'a mut RequestContext,
//!         next: NextInvoke<'a>,
//!     ) -> BoxFuture<'a, Result<Value>> {
//!         Box::pin(async move {
//!             tracing::info!("calling {}", name);
//!             next.run(name, args, ctx).await
//!         })
//!     }
//! }
//!
//! dispatcher.use_invoke_handler(Arc::new(Logging));
//! ```

mod context;

pub use context::RequestContext;

use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::Bytes;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::dispatcher::Dispatcher;
use crate::error::Result;

/// Stream-level middleware.
pub trait IoHandler: Send + Sync + 'static {
    /// Handle raw request bytes, usually by calling `next.run`.
    fn handle<'a>(
        &'a self,
        request: Bytes,
        ctx: &'a mut RequestContext,
        next: NextIo<'a>,
    ) -> BoxFuture<'a, Result<Bytes>>;
}

/// Call-level middleware.
pub trait InvokeHandler: Send + Sync + 'static {
    /// Handle a decoded call, usually by calling `next.run`.
    fn handle<'a>(
        &'a self,
        name: &'a str,
        args: Vec<Value>,
        ctx: &'a mut RequestContext,
        next: NextInvoke<'a>,
    ) -> BoxFuture<'a, Result<Value>>;
}

/// The rest of an [`IoHandler`] chain.
pub struct NextIo<'a> {
    dispatcher: &'a Dispatcher,
    rest: &'a [Arc<dyn IoHandler>],
}

impl<'a> NextIo<'a> {
    pub(crate) fn new(dispatcher: &'a Dispatcher, chain: &'a [Arc<dyn IoHandler>]) -> Self {
        Self {
            dispatcher,
            rest: chain,
        }
    }

    /// Continue with the next handler, or `process` at the end of the chain.
    pub fn run<'b>(self, request: Bytes, ctx: &'b mut RequestContext) -> BoxFuture<'b, Result<Bytes>>
    where
        'a: 'b,
    {
        match self.rest.split_first() {
            Some((head, rest)) => head.handle(
                request,
                ctx,
                NextIo {
                    dispatcher: self.dispatcher,
                    rest,
                },
            ),
            None => Box::pin(self.dispatcher.process(request, ctx)),
        }
    }
}

/// The rest of an [`InvokeHandler`] chain.
pub struct NextInvoke<'a> {
    dispatcher: &'a Dispatcher,
    rest: &'a [Arc<dyn InvokeHandler>],
}

impl<'a> NextInvoke<'a> {
    pub(crate) fn new(dispatcher: &'a Dispatcher, chain: &'a [Arc<dyn InvokeHandler>]) -> Self {
        Self {
            dispatcher,
            rest: chain,
        }
    }

    /// Continue with the next handler, or `execute` at the end of the chain.
    pub fn run<'b>(
        self,
        name: &'b str,
        args: Vec<Value>,
        ctx: &'b mut RequestContext,
    ) -> BoxFuture<'b, Result<Value>>
    where
        'a: 'b,
    {
        match self.rest.split_first() {
            Some((head, rest)) => head.handle(
                name,
                args,
                ctx,
                NextInvoke {
                    dispatcher: self.dispatcher,
                    rest,
                },
            ),
            None => Box::pin(self.dispatcher.execute(name, args, ctx)),
        }
    }
}

/// One copy-on-write middleware chain.
pub(crate) struct Chain<H: ?Sized> {
    handlers: ArcSwap<Vec<Arc<H>>>,
}

impl<H: ?Sized> Chain<H> {
    pub(crate) fn new() -> Self {
        Self {
            handlers: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Current snapshot.
    pub(crate) fn load(&self) -> Arc<Vec<Arc<H>>> {
        self.handlers.load_full()
    }

    /// Append (becomes the innermost handler so far).
    pub(crate) fn push(&self, handler: Arc<H>) {
        self.handlers.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(Arc::clone(&handler));
            next
        });
    }

    /// Remove by identity. Returns whether it was present.
    pub(crate) fn remove(&self, handler: &Arc<H>) -> bool {
        let mut found = false;
        self.handlers.rcu(|current| {
            let mut next = Vec::clone(current);
            let before = next.len();
            next.retain(|h| !Arc::ptr_eq(h, handler));
            found = next.len() != before;
            next
        });
        found
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.load().len()
    }
}
