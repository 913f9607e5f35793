//! Payload codec seam between the queue engine and the backing store.
//!
//! The engine treats payloads as opaque JSON values; a [`PayloadCodec`] turns
//! them into the bytes persisted in the shared queue table and back. The
//! default [`JsonPayloadCodec`] persists compact JSON.

use crate::{Error, Result};

/// Converts payload values to and from their persisted byte representation.
pub trait PayloadCodec: Send + Sync {
    /// Encode a payload value to bytes.
    fn encode(&self, payload: &serde_json::Value) -> Result<Vec<u8>>;

    /// Decode persisted bytes back into a payload value.
    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value>;
}

/// JSON payload codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPayloadCodec;

impl PayloadCodec for JsonPayloadCodec {
    fn encode(&self, payload: &serde_json::Value) -> Result<Vec<u8>> {
        serde_json::to_vec(payload).map_err(|e| Error::PayloadCodec(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value> {
        serde_json::from_slice(bytes).map_err(|e| Error::PayloadCodec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_decode_roundtrip() {
        let codec = JsonPayloadCodec;
        let payload = json!({"order_id": "o-1", "amount": 1234});

        let bytes = codec.encode(&payload).unwrap();
        let decoded = codec.decode(&bytes).unwrap();

        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let codec = JsonPayloadCodec;
        let result = codec.decode(b"not json at all {");

        assert!(matches!(result, Err(Error::PayloadCodec(_))));
    }
}
