//! Cluster configuration
//!
//! Everything the bootstrapper needs is passed in explicitly through
//! [`ClusterConfig`]; there are no process-wide defaults to mutate.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pki::CaMaterial;
use crate::{Error, Result};

/// How non-seed nodes become raft members
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MembershipMode {
    /// The bootstrapper asks every non-seed node to join the seed
    #[default]
    DynamicJoin,
    /// Every node's server config names the seed as retry-join target
    Static,
}

/// Root CA supplied by the caller
///
/// Inline PEM takes precedence over files.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CaSource {
    /// CA certificate PEM
    pub cert_pem: Option<String>,
    /// CA private key PEM
    pub key_pem: Option<String>,
    /// File holding the CA certificate PEM
    pub cert_file: Option<PathBuf>,
    /// File holding the CA private key PEM
    pub key_file: Option<PathBuf>,
}

impl std::fmt::Debug for CaSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaSource")
            .field("cert_pem", &self.cert_pem.is_some())
            .field("key_pem", &self.key_pem.is_some())
            .field("cert_file", &self.cert_file)
            .field("key_file", &self.key_file)
            .finish()
    }
}

impl CaSource {
    /// Load the PEM material, reading files where no inline PEM is given
    pub fn resolve(&self) -> Result<CaMaterial> {
        Ok(CaMaterial {
            cert_pem: read_pem(self.cert_pem.as_ref(), self.cert_file.as_deref())?,
            key_pem: read_pem(self.key_pem.as_ref(), self.key_file.as_deref())?,
        })
    }
}

fn read_pem(inline: Option<&String>, file: Option<&Path>) -> Result<Option<String>> {
    match (inline, file) {
        (Some(pem), _) => Ok(Some(pem.clone())),
        (None, Some(path)) => std::fs::read_to_string(path)
            .map(Some)
            .map_err(|e| Error::io(path, e)),
        (None, None) => Ok(None),
    }
}

/// Configuration of a test cluster
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClusterConfig {
    /// Cluster name, prefix of every node name
    pub name: String,
    /// Number of nodes; node 0 is the seed
    pub node_count: usize,
    /// How non-seed nodes join the seed
    pub membership: MembershipMode,
    /// Whether node listeners require a client certificate
    pub require_client_auth: bool,
    /// Root CA to reuse instead of generating one
    pub ca: Option<CaSource>,
    /// Working directory; a fresh temp dir when unset
    pub work_dir: Option<PathBuf>,
    /// Plugin binary copied into every node
    pub plugin_artifact: Option<PathBuf>,
    /// Node container image
    pub image: String,
    /// Cluster network name
    pub network_name: String,
    /// Cluster network CIDR
    pub network_cidr: String,
    /// Admin API port inside the network
    pub api_port: u16,
    /// Barrier key shares requested at init
    pub key_shares: u32,
    /// Shares required to unseal
    pub key_threshold: u32,
    /// Budget for unseal, join and leader convergence
    pub convergence_timeout_secs: u64,
    /// Poll interval for convergence checks
    pub poll_interval_ms: u64,
    /// Start nodes but leave them uninitialized
    pub skip_init: bool,
    /// Node server log level
    pub log_level: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: crate::DEFAULT_CLUSTER_NAME.to_string(),
            node_count: 1,
            membership: MembershipMode::default(),
            require_client_auth: false,
            ca: None,
            work_dir: None,
            plugin_artifact: None,
            image: crate::DEFAULT_IMAGE.to_string(),
            network_name: crate::DEFAULT_CLUSTER_NAME.to_string(),
            network_cidr: crate::DEFAULT_NETWORK_CIDR.to_string(),
            api_port: crate::DEFAULT_API_PORT,
            key_shares: crate::DEFAULT_KEY_SHARES,
            key_threshold: crate::DEFAULT_KEY_SHARES,
            convergence_timeout_secs: 15,
            poll_interval_ms: 500,
            skip_init: false,
            log_level: "trace".to_string(),
        }
    }
}

impl ClusterConfig {
    /// Parse a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| Error::config(format!("invalid cluster config: {}", e)))
    }

    /// Read and parse a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::from_yaml(&yaml)
    }

    /// Check the configuration is usable
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(Error::config(format!(
                "cluster name '{}' must be non-empty and contain only alphanumerics and '-'",
                self.name
            )));
        }
        if self.node_count == 0 {
            return Err(Error::config("nodeCount must be at least 1"));
        }
        if self.key_shares == 0 || self.key_threshold == 0 {
            return Err(Error::config("keyShares and keyThreshold must be at least 1"));
        }
        if self.key_threshold > self.key_shares {
            return Err(Error::config(format!(
                "keyThreshold {} exceeds keyShares {}",
                self.key_threshold, self.key_shares
            )));
        }
        if self.api_port == 0 || self.api_port == u16::MAX {
            return Err(Error::config(format!("invalid apiPort {}", self.api_port)));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::config("pollIntervalMs must be positive"));
        }
        if let Some(ca) = &self.ca {
            let has_cert = ca.cert_pem.is_some() || ca.cert_file.is_some();
            let has_key = ca.key_pem.is_some() || ca.key_file.is_some();
            if has_cert && !has_key {
                return Err(Error::config("a CA certificate requires its private key"));
            }
        }
        Ok(())
    }

    /// Resolved CA material, if a CA was supplied
    pub fn resolve_ca(&self) -> Result<Option<CaMaterial>> {
        self.ca.as_ref().map(CaSource::resolve).transpose()
    }

    /// Convergence budget
    pub fn convergence_timeout(&self) -> Duration {
        Duration::from_secs(self.convergence_timeout_secs)
    }

    /// Poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Node identifier for index `i`
    pub fn node_id(&self, i: usize) -> String {
        format!("node-{}", i)
    }

    /// Network-unique node name for index `i`
    pub fn node_name(&self, i: usize) -> String {
        format!("{}-{}", self.name, self.node_id(i))
    }

    /// Admin API address of node `i` on the cluster network
    pub fn node_api_address(&self, i: usize) -> String {
        format!("https://{}:{}", self.node_name(i), self.api_port)
    }
}
