//! JSON-RPC plumbing shared by the historical and realtime clients.

pub mod http;
pub mod request;
pub mod retry;
pub mod transport;

pub use http::HttpTransport;
pub use request::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcId};
pub use retry::RetryPolicy;
pub use transport::RpcTransport;
