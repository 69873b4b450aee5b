//! Codec module - request/response encoding at the wire boundary.
//!
//! The dispatcher only talks to a [`ServiceCodec`]: `decode` turns request
//! bytes into a [`Request`] (fullname + positional args), `encode` turns the
//! call's [`Outcome`] back into response bytes.
//!
//! Provided codecs:
//!
//! - [`MsgPackServiceCodec`] - MessagePack envelopes (default)
//! - [`JsonServiceCodec`] - JSON envelopes
//!
//! [`MsgPackCodec`] is the underlying typed MessagePack helper.
//!
//! # Envelopes
//!
//! Both codecs share the same envelope shape:
//!
//! ```text
//! request:  { "method": "math.sum", "args": [1, 2, 3], "headers": {...} }
//! response: { "result": 6, "headers": {...} }
//!           { "error": { "code": "...", "message": "...", "data": ... } }
//! ```
//!
//! # Example
//!
//! ```
//! use procwire_server::codec::{MsgPackServiceCodec, RequestEnvelope};
//! use serde_json::json;
//!
//! let bytes = MsgPackServiceCodec::encode_request(
//!     &RequestEnvelope::new("math.sum", vec![json!(1), json!(2)]),
//! ).unwrap();
//! assert!(!bytes.is_empty());
//! ```

mod json;
mod msgpack;

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProcwireError, Result, RpcError};
use crate::handler::RequestContext;

pub use json::JsonServiceCodec;
pub use msgpack::{MsgPackCodec, MsgPackServiceCodec};

/// Result of a call as seen by the codec: a value or a wire error.
pub type Outcome = std::result::Result<Value, RpcError>;

/// A decoded call.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Fully qualified method name.
    pub fullname: String,
    /// Positional arguments.
    pub args: Vec<Value>,
}

/// Encodes and decodes calls at the wire boundary.
///
/// Implementations must be able to encode any [`RpcError`], including
/// application errors produced by methods.
pub trait ServiceCodec: Send + Sync + 'static {
    /// Decode request bytes. May populate request headers on `ctx`.
    fn decode(&self, request: &[u8], ctx: &mut RequestContext) -> Result<Request>;

    /// Encode the outcome of a call. May read response headers from `ctx`.
    fn encode(&self, outcome: Outcome, ctx: &RequestContext) -> Result<Bytes>;
}

/// Request envelope shared by the provided codecs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Fully qualified method name.
    pub method: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Request headers.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, Value>,
}

impl RequestEnvelope {
    /// Create an envelope without headers.
    pub fn new(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            args,
            headers: HashMap::new(),
        }
    }

    /// Add a header.
    pub fn with_header(mut self, name: impl Into<String>, value: Value) -> Self {
        self.headers.insert(name.into(), value);
        self
    }

    /// Validate and split into a [`Request`], moving headers onto `ctx`.
    pub(crate) fn into_request(self, ctx: &mut RequestContext) -> Result<Request> {
        if self.method.is_empty() {
            return Err(ProcwireError::Decode("missing method name".to_string()));
        }
        for (name, value) in self.headers {
            ctx.set_request_header(name, value);
        }
        Ok(Request {
            fullname: self.method,
            args: self.args,
        })
    }
}

/// Response envelope shared by the provided codecs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Result value (`null` for void methods and on error).
    #[serde(default)]
    pub result: Value,
    /// Error, if the call failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    /// Response headers.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, Value>,
}

impl ResponseEnvelope {
    pub(crate) fn from_outcome(outcome: Outcome, ctx: &RequestContext) -> Self {
        let (result, error) = match outcome {
            Ok(value) => (value, None),
            Err(err) => (Value::Null, Some(err)),
        };
        Self {
            result,
            error,
            headers: ctx.response_headers().clone(),
        }
    }

    /// Convert back into an [`Outcome`].
    pub fn into_outcome(self) -> Outcome {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result),
        }
    }
}
