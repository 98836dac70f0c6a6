//! Cluster descriptor handed to tests

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};
use zeroize::Zeroizing;

use super::config::MembershipMode;
use super::node::ClusterNode;
use crate::pki::CertificateAuthority;
use crate::runtime::NodeRuntime;
use crate::{Error, Result};

/// A bootstrapped test cluster
///
/// Key shares are stored zeroized and every accessor returns fresh copies,
/// so callers may mutate what they get without affecting the cluster.
pub struct TestCluster {
    pub(crate) name: String,
    pub(crate) work_dir: PathBuf,
    pub(crate) membership: MembershipMode,
    pub(crate) client_auth_required: bool,
    pub(crate) ca: CertificateAuthority,
    pub(crate) ca_cert_pem_file: PathBuf,
    pub(crate) barrier_keys: Vec<Zeroizing<Vec<u8>>>,
    pub(crate) recovery_keys: Vec<Zeroizing<Vec<u8>>>,
    pub(crate) root_token: Zeroizing<String>,
    pub(crate) cluster_id: String,
    pub(crate) nodes: Vec<ClusterNode>,
    pub(crate) runtime: Arc<dyn NodeRuntime>,
}

impl std::fmt::Debug for TestCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestCluster")
            .field("name", &self.name)
            .field("work_dir", &self.work_dir)
            .field("cluster_id", &self.cluster_id)
            .field("nodes", &self.nodes)
            .finish_non_exhaustive()
    }
}

fn copy_shares(shares: &[Zeroizing<Vec<u8>>]) -> Vec<Vec<u8>> {
    shares.iter().map(|share| share.to_vec()).collect()
}

impl TestCluster {
    /// Cluster name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Working directory holding every persisted artifact
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// How non-seed nodes joined
    pub fn membership(&self) -> MembershipMode {
        self.membership
    }

    /// Whether node listeners require client certificates
    pub fn client_auth_required(&self) -> bool {
        self.client_auth_required
    }

    /// Cluster id reported by the nodes; empty before unseal
    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Root credential; empty before initialization
    pub fn root_token(&self) -> &str {
        &self.root_token
    }

    /// Copies of the barrier key shares
    pub fn barrier_keys(&self) -> Vec<Vec<u8>> {
        copy_shares(&self.barrier_keys)
    }

    /// Copies of the recovery key shares
    pub fn recovery_keys(&self) -> Vec<Vec<u8>> {
        copy_shares(&self.recovery_keys)
    }

    /// Recovery shares when the cluster has any, barrier shares otherwise
    pub fn barrier_or_recovery_keys(&self) -> Vec<Vec<u8>> {
        if self.recovery_keys.is_empty() {
            self.barrier_keys()
        } else {
            self.recovery_keys()
        }
    }

    /// Replace the barrier key shares (e.g. after a rekey)
    pub fn set_barrier_keys(&mut self, keys: &[Vec<u8>]) {
        self.barrier_keys = keys.iter().cloned().map(Zeroizing::new).collect();
    }

    /// Replace the recovery key shares
    pub fn set_recovery_keys(&mut self, keys: &[Vec<u8>]) {
        self.recovery_keys = keys.iter().cloned().map(Zeroizing::new).collect();
    }

    /// Cluster CA
    pub fn ca(&self) -> &CertificateAuthority {
        &self.ca
    }

    /// CA certificate PEM
    pub fn ca_cert_pem(&self) -> &str {
        self.ca.cert_pem()
    }

    /// CA certificate DER
    pub fn ca_cert_der(&self) -> &[u8] {
        self.ca.cert_der()
    }

    /// Path of the persisted CA certificate
    pub fn ca_cert_pem_file(&self) -> &Path {
        &self.ca_cert_pem_file
    }

    /// All nodes, seed first
    pub fn nodes(&self) -> &[ClusterNode] {
        &self.nodes
    }

    /// Node `i`, if it exists
    pub fn node(&self, i: usize) -> Option<&ClusterNode> {
        self.nodes.get(i)
    }

    /// The seed node
    pub fn seed(&self) -> Result<&ClusterNode> {
        self.nodes
            .first()
            .ok_or_else(|| Error::config(format!("cluster {} has no nodes", self.name)))
    }

    /// Stop every running node
    ///
    /// Stop failures are logged and skipped so one stuck node does not keep
    /// the others alive. Calling this again is a no-op.
    pub async fn teardown(&mut self) {
        for node in &mut self.nodes {
            let Some(handle) = node.handle.take() else {
                continue;
            };
            match self.runtime.stop(&handle).await {
                Ok(()) => info!(cluster = %self.name, node = %node.name, "Node stopped"),
                Err(e) => warn!(
                    cluster = %self.name,
                    node = %node.name,
                    error = %e,
                    "Failed to stop node, continuing teardown"
                ),
            }
        }
    }

    /// Write root token and key shares into the work dir, one hex share per line
    pub(crate) async fn persist_secrets(&self) -> Result<()> {
        let path = self.work_dir.join(crate::ROOT_TOKEN_FILE);
        tokio::fs::write(&path, self.root_token.as_bytes())
            .await
            .map_err(|e| Error::io(&path, e))?;

        for (file, shares) in [
            (crate::BARRIER_KEYS_FILE, &self.barrier_keys),
            (crate::RECOVERY_KEYS_FILE, &self.recovery_keys),
        ] {
            let path = self.work_dir.join(file);
            let mut body = Zeroizing::new(String::new());
            for share in shares {
                body.push_str(&hex::encode(share.as_slice()));
                body.push('\n');
            }
            tokio::fs::write(&path, body.as_bytes())
                .await
                .map_err(|e| Error::io(&path, e))?;
        }
        Ok(())
    }
}
