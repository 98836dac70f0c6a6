//! Admin API of a cluster node
//!
//! The bootstrap sequence observes and drives a node only through this API:
//! initialize, unseal, health, leader and raft join. [`AdminApi`] is the seam
//! the bootstrapper depends on; [`HttpAdminClient`] is the real mTLS client.

mod http;

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::pki::tls::NodeTlsConfig;
use crate::runtime::NodeEndpoint;
use crate::Result;

pub use http::{HttpAdminClient, HttpConnector, DEFAULT_REQUEST_TIMEOUT, TOKEN_HEADER};

/// Request body of `PUT /v1/sys/init`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitRequest {
    /// Number of barrier key shares to split the root key into
    pub secret_shares: u32,
    /// Number of shares required to unseal
    pub secret_threshold: u32,
    /// Number of recovery key shares (auto-unseal only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_shares: Option<u32>,
    /// Recovery key threshold (auto-unseal only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_threshold: Option<u32>,
}

impl InitRequest {
    /// Shamir init with `shares` barrier shares and `threshold` required to unseal
    pub fn new(shares: u32, threshold: u32) -> Self {
        Self {
            secret_shares: shares,
            secret_threshold: threshold,
            recovery_shares: None,
            recovery_threshold: None,
        }
    }
}

/// Response of `PUT /v1/sys/init`
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct InitResponse {
    /// Hex-encoded barrier key shares
    #[serde(default)]
    pub keys: Vec<String>,
    /// Base64-encoded barrier key shares
    #[serde(default)]
    pub keys_base64: Vec<String>,
    /// Hex-encoded recovery key shares
    #[serde(default)]
    pub recovery_keys: Vec<String>,
    /// Base64-encoded recovery key shares
    #[serde(default)]
    pub recovery_keys_base64: Vec<String>,
    /// Root credential
    #[serde(default)]
    pub root_token: String,
}

impl std::fmt::Debug for InitResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitResponse")
            .field("keys", &self.keys.len())
            .field("recovery_keys", &self.recovery_keys.len())
            .field("root_token", &"<redacted>")
            .finish()
    }
}

/// Request body of `PUT /v1/sys/unseal`
#[derive(Clone, Serialize, Deserialize)]
pub struct UnsealRequest {
    /// One hex-encoded barrier key share
    pub key: String,
}

/// Seal status returned by `PUT /v1/sys/unseal`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealStatus {
    /// Whether the node is still sealed
    pub sealed: bool,
    /// Unseal threshold
    #[serde(default)]
    pub t: u32,
    /// Total number of shares
    #[serde(default)]
    pub n: u32,
    /// Shares submitted so far towards the threshold
    #[serde(default)]
    pub progress: u32,
    /// Whether the node has been initialized
    #[serde(default)]
    pub initialized: bool,
}

/// Response of `GET /v1/sys/health`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Whether the node has been initialized
    #[serde(default)]
    pub initialized: bool,
    /// Whether the node is sealed
    #[serde(default)]
    pub sealed: bool,
    /// Whether the node is a standby
    #[serde(default)]
    pub standby: bool,
    /// Cluster identifier, empty until the node is unsealed
    #[serde(default)]
    pub cluster_id: String,
    /// Cluster name
    #[serde(default)]
    pub cluster_name: String,
    /// Server version
    #[serde(default)]
    pub version: String,
}

/// Response of `GET /v1/sys/leader`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderResponse {
    /// Whether HA is enabled
    #[serde(default)]
    pub ha_enabled: bool,
    /// Whether the answering node is the active node
    #[serde(default)]
    pub is_self: bool,
    /// API address of the active node
    #[serde(default)]
    pub leader_address: String,
    /// Cluster address of the active node
    #[serde(default)]
    pub leader_cluster_address: String,
}

/// Request body of `POST /v1/sys/storage/raft/join`
#[derive(Clone, Serialize, Deserialize)]
pub struct RaftJoinRequest {
    /// API address of the node to join
    pub leader_api_addr: String,
    /// CA certificate PEM used to verify the leader
    pub leader_ca_cert: String,
    /// Certificate PEM presented by the joining node
    pub leader_client_cert: String,
    /// Private key PEM of the joining node
    pub leader_client_key: String,
}

impl std::fmt::Debug for RaftJoinRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftJoinRequest")
            .field("leader_api_addr", &self.leader_api_addr)
            .finish_non_exhaustive()
    }
}

/// Response of `POST /v1/sys/storage/raft/join`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftJoinResponse {
    /// Whether the node joined
    #[serde(default)]
    pub joined: bool,
}

/// Typed access to a node's admin API
///
/// Implementations must be shareable: the same client is used by the
/// bootstrapper and, after bootstrap, by every test holding the cluster.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AdminApi: Send + Sync {
    /// Base URL the client talks to
    fn address(&self) -> String;

    /// Authenticate all further requests with `token`
    fn set_token(&self, token: &str);

    /// Initialize the node's storage
    async fn init(&self, request: &InitRequest) -> Result<InitResponse>;

    /// Submit one hex-encoded barrier key share
    async fn unseal(&self, key_hex: &str) -> Result<SealStatus>;

    /// Fetch the node's health report
    async fn health(&self) -> Result<HealthResponse>;

    /// Fetch the node's view of the active node
    async fn leader(&self) -> Result<LeaderResponse>;

    /// Ask the node to join an existing raft cluster
    async fn raft_join(&self, request: &RaftJoinRequest) -> Result<RaftJoinResponse>;
}

/// Builds admin clients for started nodes
#[cfg_attr(test, automock)]
pub trait AdminConnector: Send + Sync {
    /// Build a client for the node reachable at `endpoint`, authenticating with `tls`
    fn connect(&self, endpoint: &NodeEndpoint, tls: &NodeTlsConfig) -> Result<Arc<dyn AdminApi>>;
}
