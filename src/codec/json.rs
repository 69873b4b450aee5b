//! JSON envelopes using `serde_json`.
//!
//! Same envelope shape as the MsgPack codec. Handy for text transports and
//! for debugging with plain tools.

use bytes::Bytes;

use super::{Outcome, Request, RequestEnvelope, ResponseEnvelope, ServiceCodec};
use crate::error::{ProcwireError, Result};
use crate::handler::RequestContext;

/// [`ServiceCodec`] using JSON envelopes.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonServiceCodec;

impl JsonServiceCodec {
    /// Encode a request envelope (for callers and tests).
    pub fn encode_request(request: &RequestEnvelope) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(request)?))
    }

    /// Decode a response envelope (for callers and tests).
    pub fn decode_response(response: &[u8]) -> Result<ResponseEnvelope> {
        Ok(serde_json::from_slice(response)?)
    }
}

impl ServiceCodec for JsonServiceCodec {
    fn decode(&self, request: &[u8], ctx: &mut RequestContext) -> Result<Request> {
        let envelope: RequestEnvelope = serde_json::from_slice(request)
            .map_err(|e| ProcwireError::Decode(e.to_string()))?;
        envelope.into_request(ctx)
    }

    fn encode(&self, outcome: Outcome, ctx: &RequestContext) -> Result<Bytes> {
        let envelope = ResponseEnvelope::from_outcome(outcome, ctx);
        Ok(Bytes::from(serde_json::to_vec(&envelope)?))
    }
}
