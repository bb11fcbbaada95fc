//! The seam between readers and JSON-RPC backends.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::request::{JsonRpcRequest, JsonRpcResponse};
use crate::error::TransportError;

/// Sends one request and returns the node's raw response. Historical
/// readers are generic over this so tests can serve a scripted node.
#[async_trait]
pub trait RpcTransport: Send + Sync + 'static {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError>;

    /// Endpoint, used to name the client in logs.
    fn url(&self) -> &str;

    /// `send` plus error unwrapping and typed decoding of `result`.
    async fn call<R: DeserializeOwned + Send>(
        &self,
        id: u64,
        method: &str,
        params: Vec<Value>,
    ) -> Result<R, TransportError>
    where
        Self: Sized,
    {
        let result = self
            .send(JsonRpcRequest::new(id, method, params))
            .await?
            .into_result()
            .map_err(TransportError::Rpc)?;
        Ok(serde_json::from_value(result)?)
    }
}
