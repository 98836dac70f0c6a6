//! Node descriptor

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::admin::AdminApi;
use crate::pki::tls::NodeTlsConfig;
use crate::pki::{IdentityFiles, NodeIdentity};
use crate::runtime::{NodeEndpoint, NodeHandle};
use crate::{Error, Result};

/// One node of a test cluster
///
/// Fields are filled in as bootstrap progresses: identity when issued,
/// endpoint and handle once the process runs, client once connected.
pub struct ClusterNode {
    pub(crate) node_id: String,
    pub(crate) name: String,
    pub(crate) cluster_name: String,
    pub(crate) client_auth_required: bool,
    pub(crate) work_dir: PathBuf,
    pub(crate) identity: Option<NodeIdentity>,
    pub(crate) identity_files: Option<IdentityFiles>,
    pub(crate) tls: Option<NodeTlsConfig>,
    pub(crate) api_port: u16,
    pub(crate) endpoint: Option<NodeEndpoint>,
    pub(crate) handle: Option<NodeHandle>,
    pub(crate) client: Option<Arc<dyn AdminApi>>,
}

impl std::fmt::Debug for ClusterNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterNode")
            .field("node_id", &self.node_id)
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl ClusterNode {
    pub(crate) fn new(
        node_id: String,
        name: String,
        cluster_name: &str,
        client_auth_required: bool,
        work_dir: PathBuf,
        api_port: u16,
    ) -> Self {
        Self {
            node_id,
            name,
            cluster_name: cluster_name.to_string(),
            client_auth_required,
            work_dir,
            identity: None,
            identity_files: None,
            tls: None,
            api_port,
            endpoint: None,
            handle: None,
            client: None,
        }
    }

    /// Stable identifier within the cluster (`node-<i>`)
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Network-unique name (`<cluster>-<node id>`)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the owning cluster
    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Whether the node's listener requires client certificates
    pub fn client_auth_required(&self) -> bool {
        self.client_auth_required
    }

    /// Host directory holding the node's files
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Leaf identity, once issued
    pub fn identity(&self) -> Option<&NodeIdentity> {
        self.identity.as_ref()
    }

    /// Persisted identity files, once issued
    pub fn identity_files(&self) -> Option<&IdentityFiles> {
        self.identity_files.as_ref()
    }

    /// TLS settings derived from the identity
    pub fn tls(&self) -> Option<&NodeTlsConfig> {
        self.tls.as_ref()
    }

    /// Endpoint assigned by the runtime
    pub fn endpoint(&self) -> Option<&NodeEndpoint> {
        self.endpoint.as_ref()
    }

    /// Runtime handle while the node runs
    pub fn handle(&self) -> Option<&NodeHandle> {
        self.handle.as_ref()
    }

    /// Admin API address on the cluster network, as other nodes reach it
    pub fn api_address(&self) -> String {
        format!("https://{}:{}", self.name, self.api_port)
    }

    /// Admin client, if the node has been started
    pub fn api_client(&self) -> Option<&Arc<dyn AdminApi>> {
        self.client.as_ref()
    }

    /// Admin client of a started node
    pub fn client(&self) -> Result<&Arc<dyn AdminApi>> {
        self.client
            .as_ref()
            .ok_or_else(|| Error::protocol(format!("node {} has no admin client", self.name)))
    }
}
