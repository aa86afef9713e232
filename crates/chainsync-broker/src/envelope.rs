//! Record envelope used by the confluent driver.
//!
//! The record value is a small JSON document that carries the publisher's
//! key alongside the payload, so consumers see the same key even when the
//! record key was rewritten by a proxy or connector.

use alloy_primitives::Bytes;
use serde::{Deserialize, Serialize};

use chainsync_core::error::SyncError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub request_id: String,
    #[serde(default)]
    pub data: Bytes,
    /// Assigned by the consumer for log correlation; empty on the wire.
    #[serde(default)]
    pub consume_id: String,
}

impl Envelope {
    pub fn new(request_id: impl Into<String>, data: &[u8]) -> Self {
        Self {
            request_id: request_id.into(),
            data: Bytes::copy_from_slice(data),
            consume_id: String::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        serde_json::to_vec(self).map_err(|e| SyncError::Broker(format!("envelope encode: {e}")))
    }

    /// Decodes a record value and stamps a fresh consume id.
    pub fn decode(value: &[u8]) -> Result<Self, SyncError> {
        let mut envelope: Self = serde_json::from_slice(value)
            .map_err(|e| SyncError::Decode(format!("envelope: {e}")))?;
        envelope.consume_id = uuid::Uuid::new_v4().to_string();
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_stamps_consume_id() {
        let wire = Envelope::new("req-1", br#"{"block_num":1}"#).encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&wire).unwrap();
        assert_eq!(value["request_id"], "req-1");
        assert_eq!(value["consume_id"], "");

        let decoded = Envelope::decode(&wire).unwrap();
        assert_eq!(decoded.data.as_ref(), br#"{"block_num":1}"#);
        assert!(!decoded.consume_id.is_empty());
    }

    #[test]
    fn rejects_non_envelope_values() {
        assert!(Envelope::decode(b"\x00\x01").unwrap_err().is_decode());
    }
}
