//! `reqwest` JSON-RPC transport.
//!
//! Connection errors, timeouts, 429 and 5xx are retried with the configured
//! backoff. Other HTTP statuses fail at once, and so does any JSON-RPC
//! error: range rejections are the reader's business, not the transport's.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{error, warn};

use chaingov_core::config::RpcConfig;

use super::request::{JsonRpcRequest, JsonRpcResponse};
use super::retry::RetryPolicy;
use super::transport::RpcTransport;
use crate::error::TransportError;

pub struct HttpTransport {
    url: String,
    http: reqwest::Client,
    retry: RetryPolicy,
    timeout_ms: u64,
}

/// Map a non-2xx status to an error; `Http` is the retryable class.
fn status_error(status: u16, body: &str) -> TransportError {
    let msg = format!("HTTP {status}: {}", body.chars().take(200).collect::<String>());
    if status == 429 || status >= 500 {
        TransportError::Http(msg)
    } else {
        TransportError::Other(msg)
    }
}

impl HttpTransport {
    pub fn new(config: &RpcConfig) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| TransportError::Other(format!("HTTP client: {e}")))?;
        Ok(Self {
            url: config.url.clone(),
            http,
            retry: RetryPolicy::new(&config.retry),
            timeout_ms: config.request_timeout_ms,
        })
    }

    async fn post(&self, req: &JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        let resp = self.http.post(&self.url).json(req).send().await.map_err(|e| match e.is_timeout() {
            true => TransportError::Timeout { ms: self.timeout_ms },
            false => TransportError::Http(e.to_string()),
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(status.as_u16(), &body));
        }
        resp.json().await.map_err(|e| TransportError::Http(format!("bad response body: {e}")))
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        let mut retries = 0u32;
        loop {
            let err = match self.post(&req).await {
                Ok(resp) => return Ok(resp),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => e,
            };
            retries += 1;
            let Some(delay) = self.retry.next_delay(retries) else {
                error!(method = %req.method, retries, error = %err, "giving up on request");
                return Err(err);
            };
            warn!(method = %req.method, retries, delay_ms = delay.as_millis() as u64, error = %err, "transient RPC failure");
            tokio::time::sleep(delay).await;
        }
    }

    fn url(&self) -> &str {
        &self.url
    }
}
