//! Per-request context.
//!
//! A [`RequestContext`] is created by the transport adapter before calling
//! [`Dispatcher::handle`](crate::Dispatcher::handle) and dropped once the
//! response has been written. The dispatcher fills in the deadline and the
//! resolved method; everything else belongs to the transport and to
//! middleware.
//!
//! # Example
//!
//! ```ignore
//! let mut ctx = RequestContext::new().with_peer("127.0.0.1:4000");
//! ctx.set_request_header("trace", json!("abc"));
//! let response = dispatcher.handle(request, &mut ctx).await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::method::Method;

/// Context passed through the handler chains and into invoked methods.
///
/// # Thread Safety
///
/// `RequestContext` is `Clone`; clones share the cancellation token. Methods
/// receive a clone, so header changes they make are not seen by the
/// dispatcher.
#[derive(Clone, Default)]
pub struct RequestContext {
    /// Timeout applied by `handle` (zero when disabled).
    timeout: Duration,
    /// Absolute deadline, set when a timed `handle` starts.
    deadline: Option<Instant>,
    /// Method resolved for this call.
    method: Option<Arc<Method>>,
    /// Cancelled when the request times out.
    cancellation: CancellationToken,
    /// Remote address as reported by the transport.
    peer: Option<String>,
    /// Headers decoded from the request.
    request_headers: HashMap<String, Value>,
    /// Headers to encode into the response.
    response_headers: HashMap<String, Value>,
}

impl RequestContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the peer address (builder style, used by transports).
    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = Some(peer.into());
        self
    }

    /// Get the peer address.
    #[inline]
    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    /// Timeout the dispatcher applied to this request.
    #[inline]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Absolute deadline, if the request is time-bounded.
    #[inline]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline. `None` when no timeout applies.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub(crate) fn start_deadline(&mut self, timeout: Duration) {
        self.timeout = timeout;
        self.deadline = if timeout.is_zero() {
            None
        } else {
            Some(Instant::now() + timeout)
        };
    }

    /// The method resolved for this call, once decoding has finished.
    #[inline]
    pub fn method(&self) -> Option<&Arc<Method>> {
        self.method.as_ref()
    }

    pub(crate) fn set_method(&mut self, method: Arc<Method>) {
        self.method = Some(method);
    }

    /// Token cancelled when the request times out.
    ///
    /// Methods that spawn background work should watch it.
    #[inline]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Whether the request has been cancelled.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Headers decoded from the request.
    pub fn request_headers(&self) -> &HashMap<String, Value> {
        &self.request_headers
    }

    /// Get a single request header.
    pub fn request_header(&self, name: &str) -> Option<&Value> {
        self.request_headers.get(name)
    }

    /// Set a request header (codecs and transports).
    pub fn set_request_header(&mut self, name: impl Into<String>, value: Value) {
        self.request_headers.insert(name.into(), value);
    }

    /// Headers that will be encoded into the response.
    pub fn response_headers(&self) -> &HashMap<String, Value> {
        &self.response_headers
    }

    /// Set a response header.
    pub fn set_response_header(&mut self, name: impl Into<String>, value: Value) {
        self.response_headers.insert(name.into(), value);
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("timeout", &self.timeout)
            .field("deadline", &self.deadline)
            .field("method", &self.method.as_ref().map(|m| m.fullname()))
            .field("peer", &self.peer)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}
