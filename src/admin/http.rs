//! reqwest-backed admin API client

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Method;
use serde::de::DeserializeOwned;
use tracing::trace;
use zeroize::Zeroizing;

use super::{
    AdminApi, AdminConnector, HealthResponse, InitRequest, InitResponse, LeaderResponse,
    RaftJoinRequest, RaftJoinResponse, SealStatus, UnsealRequest,
};
use crate::pki::tls::NodeTlsConfig;
use crate::runtime::NodeEndpoint;
use crate::{Error, Result};

/// Header carrying the client token
pub const TOKEN_HEADER: &str = "X-Vault-Token";

/// Per-request timeout; polls must not hang on a single unresponsive node
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Health query that answers 2xx for sealed, uninitialized and standby nodes
///
/// Without these the server encodes state in the status code and the body
/// would be treated as an error.
const HEALTH_QUERY: [(&str, &str); 6] = [
    ("standbyok", "true"),
    ("perfstandbyok", "true"),
    ("uninitcode", "299"),
    ("sealedcode", "299"),
    ("standbycode", "299"),
    ("performancestandbycode", "299"),
];

/// Admin API client over mutually authenticated HTTPS
pub struct HttpAdminClient {
    base_url: String,
    http: reqwest::Client,
    token: RwLock<Option<Zeroizing<String>>>,
}

impl std::fmt::Debug for HttpAdminClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAdminClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpAdminClient {
    /// Create a client for `base_url` presenting the node identity in `tls`
    pub fn new(base_url: impl Into<String>, tls: &NodeTlsConfig, timeout: Duration) -> Result<Self> {
        let http = tls
            .http_client_builder()?
            .timeout(timeout)
            .build()
            .map_err(|e| Error::crypto(format!("failed to build admin HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            token: RwLock::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, self.url(path));
        match self.token.read().as_ref() {
            Some(token) => builder.header(TOKEN_HEADER, token.as_str()),
            None => builder,
        }
    }

    async fn send<T: DeserializeOwned>(&self, path: &str, builder: reqwest::RequestBuilder) -> Result<T> {
        trace!(url = %self.url(path), "Admin API request");

        let response = builder
            .send()
            .await
            .map_err(|e| Error::protocol(format!("request to {} failed: {}", self.url(path), e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::protocol(format!(
                "{} returned {}: {}",
                self.url(path),
                status,
                body.trim()
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::protocol(format!("failed to read {} response: {}", path, e)))?;
        decode_body(path, &body)
    }
}

/// Decode a JSON response body; an empty body is a protocol violation
fn decode_body<T: DeserializeOwned>(path: &str, body: &[u8]) -> Result<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(Error::protocol(format!("empty response to {}", path)));
    }
    serde_json::from_slice(body)
        .map_err(|e| Error::protocol(format!("malformed response to {}: {}", path, e)))
}

#[async_trait]
impl AdminApi for HttpAdminClient {
    fn address(&self) -> String {
        self.base_url.clone()
    }

    fn set_token(&self, token: &str) {
        *self.token.write() = Some(Zeroizing::new(token.to_string()));
    }

    async fn init(&self, request: &InitRequest) -> Result<InitResponse> {
        let path = "sys/init";
        self.send(path, self.request(Method::PUT, path).json(request))
            .await
    }

    async fn unseal(&self, key_hex: &str) -> Result<SealStatus> {
        let path = "sys/unseal";
        let body = UnsealRequest {
            key: key_hex.to_string(),
        };
        self.send(path, self.request(Method::PUT, path).json(&body))
            .await
    }

    async fn health(&self) -> Result<HealthResponse> {
        let path = "sys/health";
        self.send(path, self.request(Method::GET, path).query(&HEALTH_QUERY))
            .await
    }

    async fn leader(&self) -> Result<LeaderResponse> {
        let path = "sys/leader";
        self.send(path, self.request(Method::GET, path)).await
    }

    async fn raft_join(&self, request: &RaftJoinRequest) -> Result<RaftJoinResponse> {
        let path = "sys/storage/raft/join";
        self.send(path, self.request(Method::POST, path).json(request))
            .await
    }
}

/// Connects to nodes through their host-published API port
#[derive(Clone, Debug)]
pub struct HttpConnector {
    timeout: Duration,
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl HttpConnector {
    /// Create a connector whose clients use `timeout` per request
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl AdminConnector for HttpConnector {
    fn connect(&self, endpoint: &NodeEndpoint, tls: &NodeTlsConfig) -> Result<Arc<dyn AdminApi>> {
        let client = HttpAdminClient::new(endpoint.host_url(), tls, self.timeout)?;
        Ok(Arc::new(client))
    }
}
