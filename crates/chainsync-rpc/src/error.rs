//! Transport-level error types.

use thiserror::Error;

use chainsync_core::error::SyncError;

use crate::request::JsonRpcError;

/// Errors that can occur while talking to the upstream node.
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP request failed (connection refused, reset, non-2xx status).
    #[error("HTTP error: {0}")]
    Http(String),

    /// Establishing a pooled connection failed.
    #[error("Dial error: {0}")]
    Dial(String),

    /// JSON-RPC protocol-level error returned by the node.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The node answered `null` for an object that does not exist (yet).
    #[error("{method} returned null for {target}")]
    Missing { method: String, target: String },

    #[error("Deserialization error in {method}: {source}")]
    Deserialization {
        method: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Connection pool is closed")]
    PoolClosed,
}

impl TransportError {
    /// Returns `true` if this error is transient and the call may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::Dial(_) | Self::Timeout { .. } | Self::Missing { .. }
        )
    }

    /// Returns `true` if the connection itself is suspect and should be re-dialed.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Http(_) | Self::Timeout { .. })
    }
}

impl From<TransportError> for SyncError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Missing { .. } => SyncError::NotFound(e.to_string()),
            TransportError::PoolClosed => SyncError::Closed("connection pool"),
            TransportError::Timeout { ms } => SyncError::Timeout { ms },
            other => SyncError::Rpc(other.to_string()),
        }
    }
}
