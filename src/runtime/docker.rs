//! Docker CLI runtime
//!
//! Nodes run as containers on a dedicated bridge network. The node work
//! directory and CA directory are copied in before start; the admin API port
//! is published on host loopback so the harness can reach every node.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{
    NodeEndpoint, NodeHandle, NodeLaunchSpec, NodeRuntime, StartedNode, CA_TRUST_DIR, CONFIG_DIR,
    SERVER_CONFIG_FILE,
};
use crate::{Error, Result};

/// Runs nodes with the `docker` CLI
#[derive(Clone, Debug)]
pub struct DockerRuntime {
    docker: String,
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerRuntime {
    /// Create a runtime using the given docker binary
    pub fn new(docker: impl Into<String>) -> Self {
        Self {
            docker: docker.into(),
        }
    }

    /// Force-remove a container by name, running or not
    ///
    /// Reaches containers whose start was interrupted before a handle was
    /// returned.
    pub async fn remove(&self, name: &str) -> Result<()> {
        self.run(&["rm", "--force", name]).await?;
        Ok(())
    }

    /// Run a docker command and return its stdout
    async fn run(&self, args: &[&str]) -> Result<String> {
        debug!(command = %args.join(" "), "Running docker");
        let output = Command::new(&self.docker)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::process_start(format!("failed to run {}: {}", self.docker, e)))?;

        if !output.status.success() {
            return Err(Error::process_start(format!(
                "{} {} failed: {}",
                self.docker,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn copy_into(&self, container: &str, from: &Path, to: &str) -> Result<()> {
        let source = if from.is_dir() {
            format!("{}/.", from.display())
        } else {
            from.display().to_string()
        };
        let target = format!("{}:{}", container, to);
        self.run(&["cp", &source, &target]).await.map(|_| ())
    }

    /// Copy files, start and inspect an already created container
    async fn launch(&self, id: &str, spec: &NodeLaunchSpec) -> Result<NodeEndpoint> {
        self.copy_into(id, &spec.work_dir, CONFIG_DIR).await?;
        self.copy_into(id, &spec.ca_dir, CA_TRUST_DIR).await?;
        if let Some(plugin) = &spec.plugin_artifact {
            let name = plugin.file_name().ok_or_else(|| {
                Error::process_start(format!("plugin path {} has no file name", plugin.display()))
            })?;
            let target = format!("{}/{}", CONFIG_DIR, name.to_string_lossy());
            self.copy_into(id, plugin, &target).await?;
        }

        self.run(&["start", id]).await?;

        let settings = self
            .run(&["inspect", "--format", "{{json .NetworkSettings}}", id])
            .await?;
        parse_endpoint(&settings, &spec.network, spec.api_port)
    }
}

#[async_trait]
impl NodeRuntime for DockerRuntime {
    async fn ensure_network(&self, name: &str, cidr: &str) -> Result<()> {
        let existing = self
            .run(&[
                "network",
                "inspect",
                name,
                "--format",
                "{{range .IPAM.Config}}{{.Subnet}} {{end}}",
            ])
            .await;

        match existing {
            Ok(subnets) if subnets.split_whitespace().any(|s| s == cidr) => {
                debug!(network = %name, "Reusing existing network");
                return Ok(());
            }
            Ok(subnets) => {
                info!(network = %name, subnets = %subnets, cidr = %cidr, "Recreating network with different subnet");
                self.run(&["network", "rm", name]).await?;
            }
            Err(_) => {}
        }

        self.run(&["network", "create", "--driver", "bridge", "--subnet", cidr, name])
            .await?;
        info!(network = %name, cidr = %cidr, "Network created");
        Ok(())
    }

    async fn start(&self, spec: &NodeLaunchSpec) -> Result<StartedNode> {
        // A container left over from an aborted run would hold the name
        if let Err(e) = self.remove(&spec.name).await {
            debug!(node = %spec.name, error = %e, "No stale container removed");
        }

        let args = create_args(spec);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let id = self.run(&args).await?;

        match self.launch(&id, spec).await {
            Ok(endpoint) => {
                info!(node = %spec.name, container = %id, url = %endpoint.host_url(), "Node started");
                Ok(StartedNode {
                    handle: NodeHandle {
                        id,
                        name: spec.name.clone(),
                    },
                    endpoint,
                })
            }
            Err(e) => {
                if let Err(cleanup) = self.run(&["rm", "--force", &id]).await {
                    warn!(node = %spec.name, error = %cleanup, "Failed to remove container after start failure");
                }
                Err(e)
            }
        }
    }

    async fn stop(&self, handle: &NodeHandle) -> Result<()> {
        self.run(&["kill", &handle.id]).await?;
        info!(node = %handle.name, "Node stopped");
        Ok(())
    }
}

/// `docker create` arguments for a node
fn create_args(spec: &NodeLaunchSpec) -> Vec<String> {
    let entrypoint = format!(
        "update-ca-certificates && exec docker-entrypoint.sh vault server -log-level={} -config {}/{}",
        spec.log_level, CONFIG_DIR, SERVER_CONFIG_FILE
    );

    vec![
        "create".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--hostname".to_string(),
        spec.name.clone(),
        "--network".to_string(),
        spec.network.clone(),
        "--network-alias".to_string(),
        spec.name.clone(),
        "--publish".to_string(),
        format!("127.0.0.1::{}", spec.api_port),
        "--expose".to_string(),
        (spec.api_port + 1).to_string(),
        "--env".to_string(),
        "VAULT_CLUSTER_INTERFACE=eth0".to_string(),
        "--env".to_string(),
        format!("VAULT_REDIRECT_ADDR=https://{}:{}", spec.name, spec.api_port),
        "--entrypoint".to_string(),
        "/bin/sh".to_string(),
        spec.image.clone(),
        "-c".to_string(),
        entrypoint,
    ]
}

#[derive(Debug, Deserialize)]
struct NetworkSettings {
    #[serde(rename = "Ports", default)]
    ports: HashMap<String, Option<Vec<PortBinding>>>,
    #[serde(rename = "Networks", default)]
    networks: HashMap<String, NetworkAttachment>,
}

#[derive(Debug, Deserialize)]
struct PortBinding {
    #[serde(rename = "HostPort")]
    host_port: String,
}

#[derive(Debug, Deserialize)]
struct NetworkAttachment {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
}

/// Extract the node endpoint from `docker inspect` network settings
fn parse_endpoint(settings: &str, network: &str, api_port: u16) -> Result<NodeEndpoint> {
    let settings: NetworkSettings = serde_json::from_str(settings)
        .map_err(|e| Error::process_start(format!("unreadable network settings: {}", e)))?;

    let key = format!("{}/tcp", api_port);
    let host_port = settings
        .ports
        .get(&key)
        .and_then(|bindings| bindings.as_ref())
        .and_then(|bindings| bindings.iter().find_map(|b| b.host_port.parse::<u16>().ok()))
        .ok_or_else(|| Error::process_start(format!("port {} is not published", key)))?;

    let network_address = settings
        .networks
        .get(network)
        .and_then(|n| n.ip_address.parse::<IpAddr>().ok());

    Ok(NodeEndpoint {
        network_address,
        api_port,
        host_port,
    })
}
