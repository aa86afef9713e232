//! The `RpcTransport` trait: one JSON-RPC endpoint connection.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::TransportError;
use crate::request::{JsonRpcRequest, JsonRpcResponse};

#[async_trait]
pub trait RpcTransport: Send + Sync + 'static {
    /// Send a single JSON-RPC request and return the raw response.
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError>;

    /// Endpoint identifier for logs.
    fn url(&self) -> &str;

    /// Next request id for this connection.
    fn next_id(&self) -> u64;

    /// Call `method` and deserialize its result.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, TransportError>
    where
        Self: Sized,
    {
        let req = JsonRpcRequest::new(self.next_id(), method, params);
        let result = self.send(req).await?.into_result()?;
        serde_json::from_value(result).map_err(|source| TransportError::Deserialization {
            method: method.to_string(),
            source,
        })
    }
}
