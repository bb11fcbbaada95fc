//! JSON-RPC 2.0 wire types.
//!
//! Requests always carry a numeric id. Responses are read leniently: some
//! providers echo string or null ids, and some omit `jsonrpc`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

const VERSION: &str = "2.0";

/// Response id as echoed back by the node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(u64),
    String(String),
    Null,
}

impl RpcId {
    /// Numeric ids, including decimal strings some proxies send back.
    pub fn as_number(&self) -> Option<u64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::String(s) => s.parse().ok(),
            Self::Null => None,
        }
    }
}

/// An outgoing call. Serialized only.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    pub params: Vec<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self { jsonrpc: VERSION, id, method: method.into(), params }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub id: RpcId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: u64, result: Value) -> Self {
        Self { id: RpcId::Number(id), result: Some(result), error: None }
    }

    pub fn failure(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            id: RpcId::Number(id),
            result: None,
            error: Some(JsonRpcError { code, message: message.into(), data: None }),
        }
    }

    /// The result, or the node's error. A missing result reads as `null`
    /// (`eth_getBlockByNumber` past the head).
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_logs_request_shape() {
        let req = JsonRpcRequest::new(7, "eth_getLogs", vec![json!({"fromBlock": "0x1"})]);
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], 7);
        assert_eq!(value["method"], "eth_getLogs");
        assert_eq!(value["params"][0]["fromBlock"], "0x1");
    }

    #[test]
    fn range_rejection_parses() {
        let raw = r#"{"jsonrpc":"2.0","id":3,"error":{"code":-32005,"message":"query returned more than 10000 results"}}"#;
        let resp: JsonRpcResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.id.as_number(), Some(3));
        assert_eq!(resp.into_result().unwrap_err().code, -32005);
    }

    #[test]
    fn lenient_ids_and_null_result() {
        let resp: JsonRpcResponse = serde_json::from_str(r#"{"id":"12","result":null}"#).unwrap();
        assert_eq!(resp.id.as_number(), Some(12));
        assert_eq!(resp.into_result().unwrap(), Value::Null);

        let resp: JsonRpcResponse = serde_json::from_str(r#"{"jsonrpc":"2.0","id":null}"#).unwrap();
        assert_eq!(resp.id.as_number(), None);
    }
}
