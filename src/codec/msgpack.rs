//! MsgPack codecs using `rmp-serde`.
//!
//! **CRITICAL**: Always use `to_vec_named`, NEVER `to_vec`!
//! Node.js `@msgpack/msgpack` expects struct-as-map format, and so do the
//! envelope readers on the other side of the wire.
//!
//! # Example
//!
//! ```
//! use procwire_server::codec::MsgPackCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Message {
//!     id: u32,
//!     content: String,
//! }
//!
//! let msg = Message { id: 42, content: "hello".to_string() };
//! let encoded = MsgPackCodec::encode(&msg).unwrap();
//! let decoded: Message = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, msg);
//! ```

use bytes::Bytes;

use super::{Outcome, Request, RequestEnvelope, ResponseEnvelope, ServiceCodec};
use crate::error::{ProcwireError, Result};
use crate::handler::RequestContext;

/// MessagePack codec for structured data.
///
/// Uses `rmp_serde::to_vec_named` so structs are serialized as maps
/// (with field names) rather than arrays (positional).
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        // CRITICAL: to_vec_named, NOT to_vec!
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Default [`ServiceCodec`]: MessagePack request/response envelopes.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackServiceCodec;

impl MsgPackServiceCodec {
    /// Encode a request envelope (for callers and tests).
    pub fn encode_request(request: &RequestEnvelope) -> Result<Bytes> {
        MsgPackCodec::encode(request).map(Bytes::from)
    }

    /// Decode a response envelope (for callers and tests).
    pub fn decode_response(response: &[u8]) -> Result<ResponseEnvelope> {
        MsgPackCodec::decode(response)
    }
}

impl ServiceCodec for MsgPackServiceCodec {
    fn decode(&self, request: &[u8], ctx: &mut RequestContext) -> Result<Request> {
        let envelope: RequestEnvelope = rmp_serde::from_slice(request)
            .map_err(|e| ProcwireError::Decode(e.to_string()))?;
        envelope.into_request(ctx)
    }

    fn encode(&self, outcome: Outcome, ctx: &RequestContext) -> Result<Bytes> {
        let envelope = ResponseEnvelope::from_outcome(outcome, ctx);
        MsgPackCodec::encode(&envelope).map(Bytes::from)
    }
}
