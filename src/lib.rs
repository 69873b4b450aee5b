//! # procwire-server
//!
//! Server-side dispatch core for the Procwire RPC protocol.
//!
//! Transport adapters (pipes, TCP, HTTP, WebSocket...) hand raw request bytes
//! to a [`Dispatcher`], which decodes them, resolves the method by name and
//! argument count, runs it through the middleware chains and encodes the
//! outcome back into response bytes.
//!
//! ## Architecture
//!
//! - **Methods** ([`method`]): `(fullname, arity)` keyed registry with a
//!   missing-method fallback and the builtin `$methods` listing
//! - **Pipeline** ([`handler`]): `IoHandler` chain around `process`,
//!   `InvokeHandler` chain around `execute`
//! - **Codec** ([`codec`]): pluggable request/response encoding, MessagePack
//!   by default
//! - **Transports** ([`transport`]): registry of binders that attach a
//!   dispatcher to concrete servers
//!
//! ## Example
//!
//! ```ignore
//! use procwire_server::{Dispatcher, RequestContext, RpcError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dispatcher = Dispatcher::new();
//!
//!     dispatcher.methods().add_fn("hello", |name: String| async move {
//!         Ok::<_, RpcError>(format!("Hello {name}"))
//!     })?;
//!
//!     // bytes read by a transport
//!     let mut ctx = RequestContext::new();
//!     let response = dispatcher.handle(request, &mut ctx).await?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod error;
pub mod handler;
pub mod method;
pub mod transport;

mod dispatcher;

pub use dispatcher::{
    Dispatcher, DispatcherBuilder, DispatcherConfig, WeakDispatcher, DEFAULT_MAX_REQUEST_LENGTH,
    DEFAULT_TIMEOUT,
};
pub use error::{ProcwireError, Result, RpcError};
pub use handler::RequestContext;
pub use method::MethodRegistry;
pub use transport::TransportRegistry;
