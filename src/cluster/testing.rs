//! In-memory node service and runtime for bootstrap tests
//!
//! `FakeService` keeps the state of a whole cluster behind one lock and
//! hands out one `FakeNodeClient` per node. Behavior deviations (rejected
//! joins, diverging cluster ids, wrong leaders) are scripted per node index.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::admin::{
    AdminApi, AdminConnector, HealthResponse, InitRequest, InitResponse, LeaderResponse,
    RaftJoinRequest, RaftJoinResponse, SealStatus,
};
use crate::pki::tls::NodeTlsConfig;
use crate::runtime::{NodeEndpoint, NodeHandle, NodeLaunchSpec, NodeRuntime, StartedNode};
use crate::{Error, Result};

pub(crate) const FAKE_CLUSTER_ID: &str = "3f1c9c2e-fake-cluster";
const BASE_HOST_PORT: u16 = 40000;

#[derive(Default)]
struct NodeState {
    member: bool,
    sealed: bool,
    progress: Vec<String>,
    token: Option<String>,
}

#[derive(Default)]
struct ServiceState {
    initialized: bool,
    threshold: usize,
    keys: Vec<String>,
    withheld_shares: usize,
    init_failures: u32,
    auto_join: bool,
    nodes: HashMap<usize, NodeState>,
    join_results: HashMap<usize, bool>,
    cluster_ids: HashMap<usize, String>,
    leaders: HashMap<usize, bool>,
    stuck_sealed: HashSet<usize>,
    calls: Vec<(usize, &'static str)>,
    join_requests: Vec<(usize, String)>,
}

impl ServiceState {
    fn node(&mut self, index: usize) -> &mut NodeState {
        self.nodes.entry(index).or_insert_with(|| NodeState {
            sealed: true,
            ..Default::default()
        })
    }

    fn is_member(&mut self, index: usize) -> bool {
        let auto_join = self.auto_join;
        let node = self.node(index);
        index == 0 || auto_join || node.member
    }
}

/// Scripted cluster of nodes
#[derive(Default)]
pub(crate) struct FakeService {
    state: Mutex<ServiceState>,
}

impl FakeService {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Node `index` answers its join request with `joined`
    pub(crate) fn join_result(&self, index: usize, joined: bool) {
        self.state.lock().join_results.insert(index, joined);
    }

    /// Node `index` reports `cluster_id` once unsealed
    pub(crate) fn cluster_id(&self, index: usize, cluster_id: &str) {
        self.state
            .lock()
            .cluster_ids
            .insert(index, cluster_id.to_string());
    }

    /// Node `index` always answers leader queries with `is_self`
    pub(crate) fn leader(&self, index: usize, is_self: bool) {
        self.state.lock().leaders.insert(index, is_self);
    }

    /// Node `index` accepts shares but never leaves the sealed state
    pub(crate) fn stays_sealed(&self, index: usize) {
        self.state.lock().stuck_sealed.insert(index);
    }

    /// Leave `count` shares out of the init response
    pub(crate) fn withhold_shares(&self, count: usize) {
        self.state.lock().withheld_shares = count;
    }

    /// Fail the first `count` init requests as if the node were still starting
    pub(crate) fn fail_init(&self, count: u32) {
        self.state.lock().init_failures = count;
    }

    /// Nodes become raft members without a join request
    pub(crate) fn auto_join(&self) {
        self.state.lock().auto_join = true;
    }

    /// Number of calls of `method` made against node `index`
    pub(crate) fn calls(&self, index: usize, method: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(i, m)| *i == index && *m == method)
            .count()
    }

    /// Leader addresses of the join requests, by node index
    pub(crate) fn join_requests(&self) -> Vec<(usize, String)> {
        self.state.lock().join_requests.clone()
    }

    /// Token node `index` was authenticated with
    pub(crate) fn token(&self, index: usize) -> Option<String> {
        self.state.lock().node(index).token.clone()
    }

    pub(crate) fn client(self: &Arc<Self>, index: usize) -> FakeNodeClient {
        FakeNodeClient {
            service: self.clone(),
            index,
        }
    }
}

/// Admin client of one fake node
pub(crate) struct FakeNodeClient {
    service: Arc<FakeService>,
    index: usize,
}

#[async_trait]
impl AdminApi for FakeNodeClient {
    fn address(&self) -> String {
        format!("https://127.0.0.1:{}", BASE_HOST_PORT as usize + self.index)
    }

    fn set_token(&self, token: &str) {
        let mut state = self.service.state.lock();
        state.node(self.index).token = Some(token.to_string());
    }

    async fn init(&self, request: &InitRequest) -> Result<InitResponse> {
        let mut state = self.service.state.lock();
        state.calls.push((self.index, "init"));

        if state.init_failures > 0 {
            state.init_failures -= 1;
            return Err(Error::protocol("connection refused"));
        }
        if state.initialized {
            return Err(Error::protocol("400 Bad Request: Vault is already initialized"));
        }

        state.initialized = true;
        state.threshold = request.secret_threshold as usize;
        state.keys = (0..request.secret_shares)
            .map(|i| hex::encode([i as u8 + 1; 32]))
            .collect();

        let returned = state.keys.len().saturating_sub(state.withheld_shares);
        Ok(InitResponse {
            keys: state.keys[..returned].to_vec(),
            root_token: "hvs.fake-root".to_string(),
            ..Default::default()
        })
    }

    async fn unseal(&self, key_hex: &str) -> Result<SealStatus> {
        let mut state = self.service.state.lock();
        state.calls.push((self.index, "unseal"));

        if !state.initialized || !state.is_member(self.index) {
            return Err(Error::protocol("400 Bad Request: Vault is not initialized"));
        }
        if !state.keys.iter().any(|k| k == key_hex) {
            return Err(Error::protocol("400 Bad Request: invalid key"));
        }

        let threshold = state.threshold;
        let shares = state.keys.len() as u32;
        let stuck = state.stuck_sealed.contains(&self.index);
        let node = state.node(self.index);
        if node.sealed {
            node.progress.push(key_hex.to_string());
            if node.progress.len() >= threshold && !stuck {
                node.sealed = false;
                node.progress.clear();
            }
        }

        Ok(SealStatus {
            sealed: node.sealed,
            t: threshold as u32,
            n: shares,
            progress: node.progress.len() as u32,
            initialized: true,
        })
    }

    async fn health(&self) -> Result<HealthResponse> {
        let mut state = self.service.state.lock();
        state.calls.push((self.index, "health"));

        let initialized = state.initialized && state.is_member(self.index);
        let override_id = state.cluster_ids.get(&self.index).cloned();
        let sealed = state.node(self.index).sealed;
        let cluster_id = if sealed {
            String::new()
        } else {
            override_id.unwrap_or_else(|| FAKE_CLUSTER_ID.to_string())
        };

        Ok(HealthResponse {
            initialized,
            sealed,
            standby: self.index != 0,
            cluster_id,
            cluster_name: "acctest".to_string(),
            version: "1.17.0".to_string(),
        })
    }

    async fn leader(&self) -> Result<LeaderResponse> {
        let mut state = self.service.state.lock();
        state.calls.push((self.index, "leader"));

        let scripted = state.leaders.get(&self.index).copied();
        let sealed = state.node(self.index).sealed;
        Ok(LeaderResponse {
            ha_enabled: true,
            is_self: scripted.unwrap_or(self.index == 0 && !sealed),
            leader_address: format!("https://127.0.0.1:{}", BASE_HOST_PORT),
            leader_cluster_address: String::new(),
        })
    }

    async fn raft_join(&self, request: &RaftJoinRequest) -> Result<RaftJoinResponse> {
        let mut state = self.service.state.lock();
        state.calls.push((self.index, "raft_join"));
        state
            .join_requests
            .push((self.index, request.leader_api_addr.clone()));

        let joined = state.join_results.get(&self.index).copied().unwrap_or(true);
        state.node(self.index).member = joined;
        Ok(RaftJoinResponse { joined })
    }
}

/// Connects to fake nodes by their published port
pub(crate) struct FakeConnector {
    pub(crate) service: Arc<FakeService>,
}

impl AdminConnector for FakeConnector {
    fn connect(&self, endpoint: &NodeEndpoint, _tls: &NodeTlsConfig) -> Result<Arc<dyn AdminApi>> {
        let index = usize::from(endpoint.host_port - BASE_HOST_PORT);
        Ok(Arc::new(self.service.client(index)))
    }
}

/// Runtime recording every start and stop
#[derive(Default)]
pub(crate) struct FakeRuntime {
    started: Mutex<Vec<NodeLaunchSpec>>,
    stopped: Mutex<Vec<String>>,
    networks: Mutex<Vec<(String, String)>>,
    fail_start_at: Option<usize>,
}

impl FakeRuntime {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn failing_start_at(index: usize) -> Arc<Self> {
        Arc::new(Self {
            fail_start_at: Some(index),
            ..Default::default()
        })
    }

    pub(crate) fn started(&self) -> Vec<NodeLaunchSpec> {
        self.started.lock().clone()
    }

    pub(crate) fn stopped(&self) -> Vec<String> {
        self.stopped.lock().clone()
    }

    pub(crate) fn networks(&self) -> Vec<(String, String)> {
        self.networks.lock().clone()
    }
}

#[async_trait]
impl NodeRuntime for FakeRuntime {
    async fn ensure_network(&self, name: &str, cidr: &str) -> Result<()> {
        self.networks
            .lock()
            .push((name.to_string(), cidr.to_string()));
        Ok(())
    }

    async fn start(&self, spec: &NodeLaunchSpec) -> Result<StartedNode> {
        let mut started = self.started.lock();
        let index = started.len();
        if self.fail_start_at == Some(index) {
            return Err(Error::process_start(format!("{} exited immediately", spec.name)));
        }
        started.push(spec.clone());

        Ok(StartedNode {
            handle: NodeHandle {
                id: format!("fake-{}", index),
                name: spec.name.clone(),
            },
            endpoint: NodeEndpoint {
                network_address: Some(IpAddr::from([192, 168, 128, index as u8 + 2])),
                api_port: spec.api_port,
                host_port: BASE_HOST_PORT + index as u16,
            },
        })
    }

    async fn stop(&self, handle: &NodeHandle) -> Result<()> {
        self.stopped.lock().push(handle.name.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fewer_shares_than_threshold_leave_node_sealed() {
        let service = FakeService::new();
        let seed = service.client(0);
        let init = seed.init(&InitRequest::new(3, 3)).await.unwrap();

        for key in &init.keys[..2] {
            assert!(seed.unseal(key).await.unwrap().sealed);
        }
        assert!(seed.health().await.unwrap().cluster_id.is_empty());

        let status = seed.unseal(&init.keys[2]).await.unwrap();
        assert!(!status.sealed);
        assert_eq!(seed.health().await.unwrap().cluster_id, FAKE_CLUSTER_ID);
    }

    #[tokio::test]
    async fn unjoined_node_cannot_unseal() {
        let service = FakeService::new();
        let init = service
            .client(0)
            .init(&InitRequest::new(1, 1))
            .await
            .unwrap();

        let other = service.client(1);
        assert!(other.unseal(&init.keys[0]).await.is_err());
    }
}
