//! chainsync-rpc: upstream node access for chainsync.
//!
//! # Overview
//!
//! - [`RpcTransport`]: one JSON-RPC endpoint connection
//! - [`HttpTransport`] / [`HttpDialer`]: `reqwest`-backed transport with retry
//! - [`ConnectionPool`]: bounded, lazily-dialed, round-robin pool of transports
//! - [`EvmChainClient`]: the [`ChainClient`](chainsync_core::ChainClient) used by the crawler
//! - [`recover_signer`]: signature-based sender recovery

pub mod client;
pub mod error;
pub mod http;
pub mod pool;
pub mod request;
pub mod retry;
pub mod signer;
pub mod transport;

pub use client::EvmChainClient;
pub use error::TransportError;
pub use http::{HttpDialer, HttpTransport};
pub use pool::{ConnectionPool, Dial, Pooled};
pub use request::{JsonRpcRequest, JsonRpcResponse, RpcId};
pub use retry::RetryPolicy;
pub use signer::{recover_signer, SignerError};
pub use transport::RpcTransport;
