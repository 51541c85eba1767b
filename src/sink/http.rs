use crate::config::BatchSinkConfig;
use crate::error::{Result, RustFlowError};
use crate::sink::batched::BatchTransport;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hyper::client::HttpConnector;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::{Body, Client, Method, Request};
use std::time::Duration;
use tracing::trace;

/// POSTs JSON batches to `<host>/<path>`
#[derive(Clone)]
pub struct HttpBatchTransport {
    client: Client<HttpConnector>,
    host: String,
    authorization: Option<String>,
    timeout: Duration,
}

impl HttpBatchTransport {
    pub fn new(host: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            host: host.into().trim_end_matches('/').to_string(),
            authorization: None,
            timeout,
        }
    }

    pub fn from_config(config: &BatchSinkConfig) -> Self {
        let transport = Self::new(config.host.clone(), Duration::from_millis(config.request_timeout_ms));
        match (&config.username, &config.password) {
            (Some(username), password) => {
                transport.with_basic_auth(username, password.as_deref().unwrap_or(""))
            }
            _ => transport,
        }
    }

    pub fn with_basic_auth(mut self, username: &str, password: &str) -> Self {
        let token = STANDARD.encode(format!("{}:{}", username, password));
        self.authorization = Some(format!("Basic {}", token));
        self
    }

    pub fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.host, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl BatchTransport for HttpBatchTransport {
    async fn send(&self, path: &str, body: Vec<u8>) -> Result<u16> {
        let url = self.url_for(path);
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(&url)
            .header(CONTENT_TYPE, "application/json");
        if let Some(authorization) = &self.authorization {
            builder = builder.header(AUTHORIZATION, authorization);
        }
        let request = builder
            .body(Body::from(body))
            .map_err(|e| RustFlowError::Delivery(format!("invalid request for {}: {}", url, e)))?;

        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| RustFlowError::Timeout)?
            .map_err(|e| RustFlowError::Delivery(format!("POST {} failed: {}", url, e)))?;

        let status = response.status().as_u16();
        trace!("POST {} -> {}", url, status);
        Ok(status)
    }
}
