//! Error types for procwire-server.
//!
//! Two layers:
//!
//! - [`ProcwireError`] - everything that can go wrong inside the dispatcher.
//! - [`RpcError`] - the serializable error that travels back to the caller
//!   inside an encoded response.
//!
//! Failures raised while decoding, resolving or invoking a call are converted
//! into an [`RpcError`] with [`ProcwireError::into_rpc_error`] and encoded.
//! Only timeouts and binding errors are returned to the immediate caller.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Wire error codes.
pub mod codes {
    /// The request bytes could not be decoded.
    pub const DECODE_ERROR: &str = "DECODE_ERROR";
    /// No method matched and no missing-method handler is registered.
    pub const METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";
    /// Positional arguments did not match the method's parameter types.
    pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
    /// Anything else, including panics inside a method.
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
    /// Default code for application errors built from plain messages.
    pub const APPLICATION_ERROR: &str = "APPLICATION_ERROR";
}

/// Main error type for all procwire operations.
#[derive(Debug, Error)]
pub enum ProcwireError {
    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Malformed request envelope.
    #[error("Decode error: {0}")]
    Decode(String),

    /// No method registered for the given name and argument count.
    #[error("Method not found: {name}/{arity}")]
    MethodNotFound {
        /// Requested fullname.
        name: String,
        /// Number of arguments supplied by the caller.
        arity: usize,
    },

    /// Arguments could not be converted to the method's parameter types.
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// The invoked method failed. Wraps the application's own error.
    #[error("Invocation failed: {0}")]
    Invocation(RpcError),

    /// Dispatch did not complete within the configured timeout.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// No transport handler is registered for this server type.
    #[error("Unsupported server type: {0}")]
    UnsupportedServerType(&'static str),

    /// No transport handler with the given name.
    #[error("Transport handler not found: {0}")]
    HandlerNotFound(String),

    /// The name lives in the reserved `$` namespace.
    #[error("Reserved method name: {0}")]
    ReservedName(String),
}

impl ProcwireError {
    /// Convert into the error that is encoded into the response.
    ///
    /// An [`Invocation`](ProcwireError::Invocation) wrapper is unwrapped one
    /// level, so the caller sees exactly the error the method produced.
    pub fn into_rpc_error(self) -> RpcError {
        match self {
            ProcwireError::Invocation(inner) => inner,
            ProcwireError::Decode(_)
            | ProcwireError::Json(_)
            | ProcwireError::MsgPackDecode(_) => {
                RpcError::new(codes::DECODE_ERROR, self.to_string())
            }
            ProcwireError::MethodNotFound { .. } => {
                RpcError::new(codes::METHOD_NOT_FOUND, self.to_string())
            }
            ProcwireError::InvalidParams(_) => {
                RpcError::new(codes::INVALID_PARAMS, self.to_string())
            }
            other => RpcError::new(codes::INTERNAL_ERROR, other.to_string()),
        }
    }
}

/// Error carried inside an encoded response.
///
/// Application methods return `Result<T, E>` where `E: Into<RpcError>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Machine-readable code (see [`codes`]).
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional structured payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Create an error with a code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    /// Create an [`codes::INTERNAL_ERROR`] error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, message)
    }

    /// Attach structured data.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

impl From<String> for RpcError {
    fn from(message: String) -> Self {
        Self::new(codes::APPLICATION_ERROR, message)
    }
}

impl From<&str> for RpcError {
    fn from(message: &str) -> Self {
        Self::new(codes::APPLICATION_ERROR, message)
    }
}

impl From<ProcwireError> for RpcError {
    fn from(err: ProcwireError) -> Self {
        err.into_rpc_error()
    }
}

/// Result type alias using ProcwireError.
pub type Result<T> = std::result::Result<T, ProcwireError>;
