//! Error types for the chainsync pipeline.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur anywhere in the block pipeline.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Sender recovery failed for {tx_hash}: {reason}")]
    Recovery { tx_hash: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0} is closed")]
    Closed(&'static str),

    #[error("Handler panicked: {0}")]
    Panic(String),

    #[error("{0}")]
    Other(String),
}

impl SyncError {
    pub fn timeout(after: Duration) -> Self {
        Self::Timeout {
            ms: after.as_millis() as u64,
        }
    }

    /// Returns `true` if the error comes from malformed input.
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

/// Outcome of a failed message handler invocation.
///
/// The variant decides what the broker does with the delivery: a terminal
/// error is acknowledged (the message is never redelivered), a retryable one
/// is left uncommitted so the broker redelivers it. Both are reported to the
/// subscription's error callbacks.
#[derive(Debug, Error)]
pub enum HandleError {
    #[error("terminal: {0}")]
    Terminal(SyncError),

    #[error("retryable: {0}")]
    Retryable(SyncError),
}

impl HandleError {
    /// Whether the delivery should still be acknowledged.
    pub fn should_ack(&self) -> bool {
        matches!(self, Self::Terminal(_))
    }

    pub fn error(&self) -> &SyncError {
        match self {
            Self::Terminal(e) | Self::Retryable(e) => e,
        }
    }

    pub fn into_inner(self) -> SyncError {
        match self {
            Self::Terminal(e) | Self::Retryable(e) => e,
        }
    }
}
