//! Node process runtime
//!
//! A [`NodeRuntime`] starts a node server on an isolated network, reports the
//! address its admin API is reachable at, and stops it again. The runtime owns
//! nothing about bootstrap: it receives a fully prepared [`NodeLaunchSpec`]
//! whose work directory already holds the node's identity and server config.

mod docker;

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde_json::json;

use crate::pki::tls::NodeTlsConfig;
use crate::pki::{IdentityFiles, CA_CERT_FILE, NODE_CERT_FILE, NODE_KEY_FILE};
use crate::{Error, Result};

pub use docker::DockerRuntime;

/// Directory the node work directory is copied to inside the runtime
pub const CONFIG_DIR: &str = "/vault/config";

/// Directory the CA directory is copied to inside the runtime
pub const CA_TRUST_DIR: &str = "/usr/local/share/ca-certificates";

/// Raft data directory inside the runtime
pub const STORAGE_DIR: &str = "/vault/file";

/// Name of the server config file written into the node work directory
pub const SERVER_CONFIG_FILE: &str = "local.json";

/// Everything needed to start one node
#[derive(Clone, Debug)]
pub struct NodeLaunchSpec {
    /// Node identifier within the cluster (e.g. `node-0`)
    pub node_id: String,
    /// Network-unique node name, used as hostname and container name
    pub name: String,
    /// Host directory with the node's certificate, key and server config
    pub work_dir: PathBuf,
    /// Host directory with the CA certificate
    pub ca_dir: PathBuf,
    /// Container image to run
    pub image: String,
    /// Network the node joins
    pub network: String,
    /// Admin API port inside the network
    pub api_port: u16,
    /// Server log level
    pub log_level: String,
    /// Optional plugin binary copied next to the server config
    pub plugin_artifact: Option<PathBuf>,
}

/// Opaque handle used to stop a node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeHandle {
    /// Runtime identifier (container ID for Docker)
    pub id: String,
    /// Node name the handle belongs to
    pub name: String,
}

/// Where a started node can be reached
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeEndpoint {
    /// Address of the node on the cluster network, if the runtime reports one
    pub network_address: Option<IpAddr>,
    /// Admin API port on the cluster network
    pub api_port: u16,
    /// Host loopback port the admin API is published on
    pub host_port: u16,
}

impl NodeEndpoint {
    /// Admin API URL reachable from the host running the harness
    pub fn host_url(&self) -> String {
        format!("https://127.0.0.1:{}", self.host_port)
    }
}

/// A node the runtime has started
#[derive(Clone, Debug)]
pub struct StartedNode {
    /// Handle to stop the node
    pub handle: NodeHandle,
    /// Reachable endpoint
    pub endpoint: NodeEndpoint,
}

/// Starts and stops node processes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeRuntime: Send + Sync {
    /// Make sure the cluster network exists with the given CIDR
    async fn ensure_network(&self, name: &str, cidr: &str) -> Result<()>;

    /// Start a node; returns once the process is running and its endpoint is known
    async fn start(&self, spec: &NodeLaunchSpec) -> Result<StartedNode>;

    /// Stop a node; stopping an already stopped node may fail
    async fn stop(&self, handle: &NodeHandle) -> Result<()>;
}

/// Static raft membership: the node joins `leader_api_addr` on its own once unsealed
#[derive(Clone, Debug)]
pub struct RetryJoin {
    /// API address of the seed node
    pub leader_api_addr: String,
}

/// Inputs of the node server config
#[derive(Clone, Debug)]
pub struct ServerConfig<'a> {
    /// Node identifier, used as raft node ID
    pub node_id: &'a str,
    /// Cluster name reported by the server
    pub cluster_name: &'a str,
    /// Admin API port
    pub api_port: u16,
    /// Server log level
    pub log_level: &'a str,
    /// Node TLS settings
    pub tls: &'a NodeTlsConfig,
    /// Static membership target, `None` when joins are requested explicitly
    pub retry_join: Option<RetryJoin>,
}

impl ServerConfig<'_> {
    /// Render the server config as seen from inside the runtime
    pub fn render(&self) -> serde_json::Value {
        let config_dir = Path::new(CONFIG_DIR);
        let files = IdentityFiles {
            cert_file: config_dir.join(NODE_CERT_FILE),
            key_file: config_dir.join(NODE_KEY_FILE),
        };
        let ca_file = Path::new(CA_TRUST_DIR).join(CA_CERT_FILE);

        let listener = self.tls.listener_config(
            &format!("0.0.0.0:{}", self.api_port),
            &files,
            &ca_file,
        );

        let mut raft = json!({
            "path": STORAGE_DIR,
            "node_id": self.node_id,
        });
        if let Some(join) = &self.retry_join {
            raft["retry_join"] = json!([{
                "leader_api_addr": join.leader_api_addr,
                "leader_ca_cert_file": ca_file.display().to_string(),
                "leader_client_cert_file": files.cert_file.display().to_string(),
                "leader_client_key_file": files.key_file.display().to_string(),
            }]);
        }

        json!({
            "listener": [listener],
            "telemetry": { "disable_hostname": true },
            "storage": { "raft": raft },
            "cluster_name": self.cluster_name,
            "log_level": self.log_level,
            "disable_mlock": true,
            "raw_storage_endpoint": true,
            "plugin_directory": CONFIG_DIR,
        })
    }

    /// Write the rendered config into `work_dir`, returning the file path
    pub async fn write_to(&self, work_dir: &Path) -> Result<PathBuf> {
        let path = work_dir.join(SERVER_CONFIG_FILE);
        let body = serde_json::to_vec_pretty(&self.render())
            .map_err(|e| Error::config(format!("failed to encode server config: {}", e)))?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| Error::io(&path, e))?;
        Ok(path)
    }
}
