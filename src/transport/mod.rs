//! Transport module - attaching a dispatcher to concrete servers.
//!
//! Transport adapters (HTTP, TCP, WebSocket, pipes...) live outside this
//! crate. Each adapter kind provides a [`Binder`]: an object bound to one
//! dispatcher that knows how to hook that dispatcher into a server value.
//!
//! Adapters declare themselves in a [`TransportRegistry`] before any
//! dispatcher is built. Every dispatcher snapshots the registry when it is
//! constructed and creates one binder per registered name.
//!
//! # Example
//!
//! ```ignore
//! struct HttpHandler { dispatcher: WeakDispatcher }
//!
//! impl Binder for HttpHandler {
//!     fn bind(&self, server: &dyn Any) -> Result<()> {
//!         let listener = downcast_server::<HttpListener>(server)?;
//!         listener.on_request(self.dispatcher.clone());
//!         Ok(())
//!     }
//! }
//!
//! impl TransportHandler for HttpHandler {
//!     fn new(dispatcher: WeakDispatcher) -> Self {
//!         Self { dispatcher }
//!     }
//! }
//!
//! TransportRegistry::global().register::<HttpHandler, HttpListener>("http");
//!
//! let dispatcher = Dispatcher::new();
//! dispatcher.bind(&listener, None)?;
//! ```

mod registry;

use std::any::Any;

use crate::dispatcher::WeakDispatcher;
use crate::error::{ProcwireError, Result};

pub use registry::{BinderFactory, TransportRegistry};

/// Capability of attaching a dispatcher to a server value.
pub trait Binder: Send + Sync + 'static {
    /// Attach the owning dispatcher to `server`.
    fn bind(&self, server: &dyn Any) -> Result<()>;
}

/// A binder constructible from a dispatcher handle alone.
///
/// Lets [`TransportRegistry::register`] take the handler type directly.
pub trait TransportHandler: Binder + Sized {
    /// Build the handler for a dispatcher under construction.
    ///
    /// The handle cannot be upgraded until construction has finished.
    fn new(dispatcher: WeakDispatcher) -> Self;
}

/// Recover the concrete server type inside [`Binder::bind`].
///
/// # Errors
///
/// Returns [`ProcwireError::UnsupportedServerType`] when `server` is not an `S`.
pub fn downcast_server<S: Any>(server: &dyn Any) -> Result<&S> {
    server
        .downcast_ref::<S>()
        .ok_or(ProcwireError::UnsupportedServerType(std::any::type_name::<S>()))
}
