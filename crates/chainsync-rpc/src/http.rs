//! HTTP JSON-RPC transport backed by `reqwest`, with retry on transient errors.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::pool::Dial;
use crate::request::{IdGenerator, JsonRpcRequest, JsonRpcResponse};
use crate::retry::RetryPolicy;
use crate::transport::RpcTransport;

/// One HTTP endpoint connection.
pub struct HttpTransport {
    url: String,
    http: reqwest::Client,
    retry: RetryPolicy,
    request_timeout: Duration,
    ids: IdGenerator,
}

impl HttpTransport {
    pub fn new(
        url: impl Into<String>,
        request_timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TransportError::Dial(e.to_string()))?;
        Ok(Self {
            url: url.into(),
            http,
            retry,
            request_timeout,
            ids: IdGenerator::default(),
        })
    }

    async fn send_once(&self, req: &JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        let resp = self
            .http
            .post(&self.url)
            .json(req)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout {
                        ms: self.request_timeout.as_millis() as u64,
                    }
                } else {
                    TransportError::Http(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Http(format!("HTTP {status}: {body}")));
        }

        resp.json::<JsonRpcResponse>()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.send_once(&req).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_connection_error() => match self.retry.next_delay(attempt) {
                    Some(delay) => {
                        tracing::warn!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            method = %req.method,
                            error = %e,
                            url = %self.url,
                            "retrying request"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        tracing::error!(
                            attempt,
                            method = %req.method,
                            error = %e,
                            url = %self.url,
                            "max retries exceeded"
                        );
                        return Err(e);
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn next_id(&self) -> u64 {
        self.ids.next()
    }
}

/// Dials [`HttpTransport`] connections for the pool.
#[derive(Debug, Clone)]
pub struct HttpDialer {
    pub url: String,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

#[async_trait]
impl Dial for HttpDialer {
    type Conn = HttpTransport;

    async fn dial(&self) -> Result<HttpTransport, TransportError> {
        let transport = HttpTransport::new(&self.url, self.request_timeout, self.retry.clone())?;
        tracing::debug!(url = %self.url, "dialed upstream");
        Ok(transport)
    }
}
