//! Cluster bootstrap state machine
//!
//! Brings a cluster from nothing to a usable state:
//!
//! 1. create (or reuse) the root CA and persist it
//! 2. issue a leaf identity per node, write its server config and start it
//! 3. initialize the seed node (node 0) and persist the root token and shares
//! 4. unseal the seed and wait until it is healthy and active
//! 5. join every other node to the seed, unseal it and wait until it is healthy
//! 6. confirm every node agrees that the seed is the active node
//!
//! Each step is fatal on failure. Nothing is torn down implicitly: a failed
//! bootstrap leaves its nodes running for inspection until [`ClusterBootstrapper::teardown`].

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};
use zeroize::Zeroizing;

use super::config::{ClusterConfig, MembershipMode};
use super::descriptor::TestCluster;
use super::node::ClusterNode;
use super::observer::{BootstrapObserver, BootstrapPhase, NodeEvent, TracingObserver};
use crate::admin::{AdminConnector, HttpConnector, InitRequest, RaftJoinRequest};
use crate::pki::tls::{ClientAuthPolicy, NodeTlsConfig};
use crate::pki::CertificateAuthority;
use crate::poll::{self, PollContext};
use crate::runtime::{DockerRuntime, NodeLaunchSpec, NodeRuntime, RetryJoin, ServerConfig};
use crate::{Error, Result};

/// Callback run once after the cluster reaches [`BootstrapPhase::Ready`]
pub type PostReadyHook = Box<dyn FnOnce(&TestCluster) -> Result<()> + Send>;

/// Drives one cluster through bootstrap
pub struct ClusterBootstrapper {
    config: ClusterConfig,
    runtime: Arc<dyn NodeRuntime>,
    connector: Arc<dyn AdminConnector>,
    observer: Arc<dyn BootstrapObserver>,
    post_ready: Option<PostReadyHook>,
    phase: BootstrapPhase,
    cluster: Option<TestCluster>,
}

impl std::fmt::Debug for ClusterBootstrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterBootstrapper")
            .field("config", &self.config)
            .field("phase", &self.phase)
            .field("cluster", &self.cluster)
            .finish_non_exhaustive()
    }
}

impl ClusterBootstrapper {
    /// Create a bootstrapper; fails if `config` is invalid
    pub fn new(
        config: ClusterConfig,
        runtime: Arc<dyn NodeRuntime>,
        connector: Arc<dyn AdminConnector>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            runtime,
            connector,
            observer: Arc::new(TracingObserver),
            post_ready: None,
            phase: BootstrapPhase::Created,
            cluster: None,
        })
    }

    /// Bootstrapper running nodes in Docker and talking to them over HTTPS
    pub fn docker(config: ClusterConfig) -> Result<Self> {
        Self::new(
            config,
            Arc::new(DockerRuntime::default()),
            Arc::new(HttpConnector::default()),
        )
    }

    /// Report progress to `observer` instead of the tracing default
    pub fn with_observer(mut self, observer: Arc<dyn BootstrapObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Run `hook` once the cluster is ready
    pub fn with_post_ready_hook(
        mut self,
        hook: impl FnOnce(&TestCluster) -> Result<()> + Send + 'static,
    ) -> Self {
        self.post_ready = Some(Box::new(hook));
        self
    }

    /// Configuration in use
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Current phase
    pub fn phase(&self) -> BootstrapPhase {
        self.phase
    }

    /// The cluster, once the CA has been provisioned
    ///
    /// Available after a failed bootstrap too, so tests can inspect or tear
    /// down whatever was started.
    pub fn cluster(&self) -> Option<&TestCluster> {
        self.cluster.as_ref()
    }

    /// Take ownership of the cluster
    pub fn into_cluster(self) -> Option<TestCluster> {
        self.cluster
    }

    /// Stop every started node
    pub async fn teardown(&mut self) {
        if let Some(cluster) = self.cluster.as_mut() {
            cluster.teardown().await;
        }
    }

    /// Bootstrap the cluster
    ///
    /// `ctx` bounds the whole attempt; convergence waits are additionally
    /// bounded by the configured convergence timeout. A bootstrapper runs
    /// at most once.
    pub async fn bootstrap(&mut self, ctx: &PollContext) -> Result<&TestCluster> {
        if self.phase != BootstrapPhase::Created {
            return Err(Error::config(format!(
                "bootstrap of {} already attempted (phase {})",
                self.config.name, self.phase
            )));
        }

        if let Err(e) = self.run(ctx).await {
            self.observer.failed(&self.config.name, self.phase, &e);
            self.enter(BootstrapPhase::Failed);
            return Err(e);
        }

        self.cluster
            .as_ref()
            .ok_or_else(|| Error::protocol("bootstrap finished without a cluster"))
    }

    async fn run(&mut self, ctx: &PollContext) -> Result<()> {
        self.provision_ca()?;
        self.enter(BootstrapPhase::CAProvisioned);

        self.enter(BootstrapPhase::NodesStarting);
        self.start_nodes().await?;
        self.enter(BootstrapPhase::NodesStarted);

        if self.config.skip_init {
            info!(cluster = %self.config.name, "Skipping initialization, nodes left sealed");
        } else {
            self.enter(BootstrapPhase::Initializing);
            self.initialize(ctx).await?;

            let converge = ctx.child_with_timeout(self.config.convergence_timeout());

            self.enter(BootstrapPhase::Unsealing);
            self.bring_up(0, &converge).await?;

            self.enter(BootstrapPhase::Joining);
            for index in 1..self.config.node_count {
                self.bring_up(index, &converge).await?;
            }

            self.enter(BootstrapPhase::LeaderVerifying);
            self.verify_leaders(&converge).await?;
        }

        self.enter(BootstrapPhase::Ready);
        if let Some(hook) = self.post_ready.take() {
            hook(self.cluster_ref()?)?;
        }
        Ok(())
    }

    fn enter(&mut self, phase: BootstrapPhase) {
        let from = std::mem::replace(&mut self.phase, phase);
        debug!(cluster = %self.config.name, from = %from, to = %phase, "Entering phase");
        self.observer.phase_changed(&self.config.name, from, phase);
    }

    fn cluster_ref(&self) -> Result<&TestCluster> {
        self.cluster
            .as_ref()
            .ok_or_else(|| Error::config("cluster has not been provisioned"))
    }

    fn work_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.config.work_dir {
            std::fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
            return Ok(dir.clone());
        }
        tempfile::Builder::new()
            .prefix("acctest-cluster-")
            .tempdir()
            .map(|dir| dir.keep())
            .map_err(|e| Error::io(std::env::temp_dir(), e))
    }

    /// Create the work dir layout and the root CA
    fn provision_ca(&mut self) -> Result<()> {
        let work_dir = self.work_dir()?;
        let material = self.config.resolve_ca()?;
        let ca = CertificateAuthority::create(material.as_ref())?;
        let ca_cert_pem_file = ca.persist(&work_dir.join(crate::CA_DIR))?;

        let config = &self.config;
        let nodes = (0..config.node_count)
            .map(|i| {
                ClusterNode::new(
                    config.node_id(i),
                    config.node_name(i),
                    &config.name,
                    config.require_client_auth,
                    work_dir.join(config.node_id(i)),
                    config.api_port,
                )
            })
            .collect();

        info!(
            cluster = %config.name,
            work_dir = %work_dir.display(),
            pinned_ca = material.is_some(),
            "CA provisioned"
        );

        self.cluster = Some(TestCluster {
            name: config.name.clone(),
            work_dir,
            membership: config.membership,
            client_auth_required: config.require_client_auth,
            ca,
            ca_cert_pem_file,
            barrier_keys: Vec::new(),
            recovery_keys: Vec::new(),
            root_token: Zeroizing::new(String::new()),
            cluster_id: String::new(),
            nodes,
            runtime: self.runtime.clone(),
        });
        Ok(())
    }

    /// Issue identities and start every node in order
    async fn start_nodes(&mut self) -> Result<()> {
        let config = &self.config;
        self.runtime
            .ensure_network(&config.network_name, &config.network_cidr)
            .await?;

        let cluster = self
            .cluster
            .as_mut()
            .ok_or_else(|| Error::config("cluster has not been provisioned"))?;
        let policy = ClientAuthPolicy::from_required(config.require_client_auth);
        let ca_dir = cluster.work_dir.join(crate::CA_DIR);

        for (index, node) in cluster.nodes.iter_mut().enumerate() {
            let identity = cluster.ca.issue_leaf(&node.name, &[])?;
            let files = identity.persist(&node.work_dir)?;
            let tls = NodeTlsConfig::new(cluster.ca.cert_pem(), &identity, policy);

            let retry_join = (config.membership == MembershipMode::Static && index > 0).then(|| {
                RetryJoin {
                    leader_api_addr: config.node_api_address(0),
                }
            });
            ServerConfig {
                node_id: &node.node_id,
                cluster_name: &config.name,
                api_port: config.api_port,
                log_level: &config.log_level,
                tls: &tls,
                retry_join,
            }
            .write_to(&node.work_dir)
            .await?;

            node.identity = Some(identity);
            node.identity_files = Some(files);
            self.observer
                .node_event(&config.name, &node.name, &NodeEvent::IdentityIssued);

            let spec = NodeLaunchSpec {
                node_id: node.node_id.clone(),
                name: node.name.clone(),
                work_dir: node.work_dir.clone(),
                ca_dir: ca_dir.clone(),
                image: config.image.clone(),
                network: config.network_name.clone(),
                api_port: config.api_port,
                log_level: config.log_level.clone(),
                plugin_artifact: config.plugin_artifact.clone(),
            };
            let started = self.runtime.start(&spec).await?;
            node.handle = Some(started.handle);

            let client = self.connector.connect(&started.endpoint, &tls)?;
            let api_url = started.endpoint.host_url();
            node.endpoint = Some(started.endpoint);
            node.client = Some(client);
            node.tls = Some(tls);

            self.observer
                .node_event(&config.name, &node.name, &NodeEvent::Started { api_url });
        }
        Ok(())
    }

    /// Initialize the seed and record the shares and root token
    async fn initialize(&mut self, ctx: &PollContext) -> Result<()> {
        let config = &self.config;
        let cluster = self
            .cluster
            .as_mut()
            .ok_or_else(|| Error::config("cluster has not been provisioned"))?;
        let seed = cluster.seed()?;
        let seed_name = seed.name.clone();
        let client = seed.client()?.clone();

        let request = InitRequest::new(config.key_shares, config.key_threshold);
        let response = poll::retry_until(
            ctx,
            &format!("initialization of {}", seed_name),
            config.poll_interval(),
            || client.init(&request),
        )
        .await?;

        let barrier_keys = decode_shares(&response.keys, "barrier")?;
        let recovery_keys = decode_shares(&response.recovery_keys, "recovery")?;
        if barrier_keys.is_empty() && recovery_keys.is_empty() {
            return Err(Error::protocol("init response carried no key shares"));
        }
        if response.root_token.is_empty() {
            return Err(Error::protocol("init response carried no root token"));
        }

        cluster.barrier_keys = barrier_keys;
        cluster.recovery_keys = recovery_keys;
        cluster.root_token = Zeroizing::new(response.root_token.clone());
        cluster.persist_secrets().await?;

        info!(
            cluster = %config.name,
            node = %seed_name,
            shares = cluster.barrier_keys.len(),
            "Seed node initialized"
        );
        self.observer
            .node_event(&config.name, &seed_name, &NodeEvent::Initialized);
        Ok(())
    }

    /// Join (non-seed, dynamic membership), unseal and await health of node `index`
    async fn bring_up(&mut self, index: usize, ctx: &PollContext) -> Result<()> {
        let config = &self.config;
        let interval = config.poll_interval();
        let cluster = self
            .cluster
            .as_mut()
            .ok_or_else(|| Error::config("cluster has not been provisioned"))?;

        let seed_address = cluster.seed()?.api_address();
        let node = cluster
            .nodes
            .get(index)
            .ok_or_else(|| Error::config(format!("no node with index {}", index)))?;
        let name = node.name.clone();
        let client = node.client()?.clone();

        if index > 0 && config.membership == MembershipMode::DynamicJoin {
            let identity = node
                .identity
                .as_ref()
                .ok_or_else(|| Error::protocol(format!("node {} has no identity", name)))?;
            let request = RaftJoinRequest {
                leader_api_addr: seed_address,
                leader_ca_cert: cluster.ca.cert_pem().to_string(),
                leader_client_cert: identity.cert_pem().to_string(),
                leader_client_key: identity.key_pem().to_string(),
            };

            let response = client.raft_join(&request).await?;
            if !response.joined {
                return Err(Error::protocol(format!(
                    "node {} was not joined to {}",
                    name, request.leader_api_addr
                )));
            }
            info!(cluster = %config.name, node = %name, leader = %request.leader_api_addr, "Node joined raft cluster");
            self.observer
                .node_event(&config.name, &name, &NodeEvent::Joined);
        }

        // Shares are submitted in order; the last answer decides
        let mut unsealed = false;
        for share in &cluster.barrier_keys {
            let key = Zeroizing::new(hex::encode(share.as_slice()));
            unsealed = !client.unseal(&key).await?.sealed;
        }
        if index == 0 && !unsealed {
            return Err(Error::protocol(format!("could not unseal node {}", name)));
        }

        client.set_token(&cluster.root_token);

        let health = poll::wait_until_with_interval(
            ctx,
            &format!("{} to report unsealed", name),
            interval,
            || client.health(),
            |health| {
                if health.sealed {
                    Err(format!("node {} is sealed", name))
                } else if health.cluster_id.is_empty() {
                    Err(format!("node {} reports no cluster id", name))
                } else {
                    Ok(())
                }
            },
        )
        .await?;

        if cluster.cluster_id.is_empty() {
            cluster.cluster_id = health.cluster_id.clone();
        } else if cluster.cluster_id != health.cluster_id {
            return Err(Error::protocol(format!(
                "node {} reports cluster id {} but the cluster is {}",
                name, health.cluster_id, cluster.cluster_id
            )));
        }
        self.observer.node_event(
            &config.name,
            &name,
            &NodeEvent::Unsealed {
                cluster_id: health.cluster_id,
            },
        );

        if index == 0 {
            poll::wait_until_with_interval(
                ctx,
                &format!("{} to become active", name),
                interval,
                || client.leader(),
                |leader| {
                    if leader.is_self {
                        Ok(())
                    } else {
                        Err(format!("node {} is not the active node", name))
                    }
                },
            )
            .await?;
            self.observer.node_event(
                &config.name,
                &name,
                &NodeEvent::LeaderConfirmed { is_self: true },
            );
        }
        Ok(())
    }

    /// Every node must agree that the seed is the active node
    async fn verify_leaders(&self, ctx: &PollContext) -> Result<()> {
        let cluster = self.cluster_ref()?;
        let interval = self.config.poll_interval();

        for (index, node) in cluster.nodes.iter().enumerate() {
            let client = node.client()?;
            let expect_self = index == 0;

            poll::wait_until_with_interval(
                ctx,
                &format!("{} to agree on the active node", node.name),
                interval,
                || client.leader(),
                |leader| {
                    if leader.is_self == expect_self {
                        Ok(())
                    } else {
                        Err(format!(
                            "node {} reports is_self={}, expected {}",
                            node.name, leader.is_self, expect_self
                        ))
                    }
                },
            )
            .await?;

            self.observer.node_event(
                &self.config.name,
                &node.name,
                &NodeEvent::LeaderConfirmed {
                    is_self: expect_self,
                },
            );
        }

        info!(cluster = %cluster.name, nodes = cluster.nodes.len(), "Leader verified");
        Ok(())
    }
}

fn decode_shares(shares: &[String], kind: &str) -> Result<Vec<Zeroizing<Vec<u8>>>> {
    shares
        .iter()
        .map(|share| {
            hex::decode(share)
                .map(Zeroizing::new)
                .map_err(|e| Error::protocol(format!("malformed {} key share: {}", kind, e)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::admin::{AdminApi, MockAdminConnector};
    use crate::cluster::testing::{FakeConnector, FakeRuntime, FakeService, FAKE_CLUSTER_ID};
    use crate::pki::{verify_issued_by, CertificateInfo};
    use crate::runtime::MockNodeRuntime;

    struct Harness {
        service: Arc<FakeService>,
        runtime: Arc<FakeRuntime>,
        _dir: tempfile::TempDir,
        bootstrapper: ClusterBootstrapper,
    }

    fn config(dir: &tempfile::TempDir, node_count: usize) -> ClusterConfig {
        ClusterConfig {
            node_count,
            work_dir: Some(dir.path().to_path_buf()),
            poll_interval_ms: 100,
            convergence_timeout_secs: 2,
            ..Default::default()
        }
    }

    fn harness_with(runtime: Arc<FakeRuntime>, configure: impl FnOnce(&mut ClusterConfig), node_count: usize) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir, node_count);
        configure(&mut config);

        let service = FakeService::new();
        let connector = Arc::new(FakeConnector {
            service: service.clone(),
        });
        let bootstrapper = ClusterBootstrapper::new(config, runtime.clone(), connector).unwrap();

        Harness {
            service,
            runtime,
            _dir: dir,
            bootstrapper,
        }
    }

    fn harness(node_count: usize) -> Harness {
        harness_with(FakeRuntime::new(), |_| {}, node_count)
    }

    #[derive(Default)]
    struct RecordingObserver {
        phases: Mutex<Vec<BootstrapPhase>>,
        events: Mutex<Vec<(String, NodeEvent)>>,
        failures: Mutex<Vec<BootstrapPhase>>,
    }

    impl BootstrapObserver for RecordingObserver {
        fn phase_changed(&self, _cluster: &str, _from: BootstrapPhase, to: BootstrapPhase) {
            self.phases.lock().push(to);
        }

        fn node_event(&self, _cluster: &str, node: &str, event: &NodeEvent) {
            self.events.lock().push((node.to_string(), event.clone()));
        }

        fn failed(&self, _cluster: &str, phase: BootstrapPhase, _error: &Error) {
            self.failures.lock().push(phase);
        }
    }

    // =========================================================================
    // Happy Path Stories
    // =========================================================================

    #[tokio::test]
    async fn single_node_cluster_becomes_ready() {
        let mut h = harness(1);
        let cluster = h
            .bootstrapper
            .bootstrap(&PollContext::background())
            .await
            .unwrap();

        assert_eq!(cluster.cluster_id(), FAKE_CLUSTER_ID);
        assert_eq!(cluster.root_token(), "hvs.fake-root");
        assert_eq!(cluster.barrier_keys().len(), 3);
        assert!(cluster.recovery_keys().is_empty());
        assert_eq!(h.bootstrapper.phase(), BootstrapPhase::Ready);

        let seed = h.service.client(0);
        assert!(!seed.health().await.unwrap().sealed);
        assert!(seed.leader().await.unwrap().is_self);
        assert_eq!(h.service.token(0).as_deref(), Some("hvs.fake-root"));
        assert_eq!(h.service.calls(0, "raft_join"), 0);
    }

    #[tokio::test]
    async fn node_identity_chains_to_cluster_ca() {
        let mut h = harness(2);
        let cluster = h
            .bootstrapper
            .bootstrap(&PollContext::background())
            .await
            .unwrap();

        for node in cluster.nodes() {
            let identity = node.identity().unwrap();
            assert!(verify_issued_by(identity.cert_pem(), cluster.ca_cert_pem()).unwrap());

            let info = CertificateInfo::from_pem(identity.cert_pem()).unwrap();
            assert!(info.dns_names.contains(&node.name().to_string()));
            assert!(info.dns_names.contains(&"localhost".to_string()));
            assert!(info.ip_addresses.contains(&"127.0.0.1".parse().unwrap()));
        }
    }

    #[tokio::test]
    async fn three_node_cluster_joins_every_node_to_seed() {
        let mut h = harness(3);
        let cluster = h
            .bootstrapper
            .bootstrap(&PollContext::background())
            .await
            .unwrap();

        assert_eq!(cluster.nodes().len(), 3);
        assert_eq!(
            h.service.join_requests(),
            vec![
                (1, "https://acctest-node-0:8200".to_string()),
                (2, "https://acctest-node-0:8200".to_string()),
            ]
        );
        for i in 1..3 {
            assert_eq!(h.service.calls(i, "unseal"), 3);
            assert_eq!(h.service.token(i).as_deref(), Some("hvs.fake-root"));
        }
        assert_eq!(h.runtime.networks(), vec![("acctest".to_string(), "192.168.128.0/20".to_string())]);
        assert!(h.runtime.stopped().is_empty());
    }

    #[tokio::test]
    async fn artifacts_are_persisted_in_work_dir() {
        let mut h = harness(2);
        let cluster = h
            .bootstrapper
            .bootstrap(&PollContext::background())
            .await
            .unwrap();
        let dir = cluster.work_dir().to_path_buf();

        assert_eq!(cluster.ca_cert_pem_file(), dir.join("ca/ca.pem"));
        for file in ["ca/ca.pem", "ca/ca_key.pem", "root_token", "barrier_keys", "recovery_keys"] {
            assert!(dir.join(file).is_file(), "missing {}", file);
        }
        for node in ["node-0", "node-1"] {
            for file in ["cert.pem", "key.pem", "local.json"] {
                assert!(dir.join(node).join(file).is_file(), "missing {}/{}", node, file);
            }
        }

        let barrier = std::fs::read_to_string(dir.join("barrier_keys")).unwrap();
        assert_eq!(barrier.lines().count(), 3);
        let token = std::fs::read_to_string(dir.join("root_token")).unwrap();
        assert_eq!(token, "hvs.fake-root");
    }

    #[tokio::test]
    async fn barrier_key_copies_are_independent() {
        let mut h = harness(1);
        let cluster = h
            .bootstrapper
            .bootstrap(&PollContext::background())
            .await
            .unwrap();

        let mut first = cluster.barrier_keys();
        let second = cluster.barrier_keys();
        assert_eq!(first, second);

        first[0].fill(0);
        assert_ne!(first[0], cluster.barrier_keys()[0]);
        assert_eq!(second, cluster.barrier_keys());
    }

    #[tokio::test]
    async fn pinned_ca_is_reused() {
        let ca = CertificateAuthority::new().unwrap();
        let cert_pem = ca.cert_pem().to_string();
        let key_pem = ca.key_pem().to_string();

        let mut h = harness_with(
            FakeRuntime::new(),
            |config| {
                config.ca = Some(crate::cluster::CaSource {
                    cert_pem: Some(cert_pem.clone()),
                    key_pem: Some(key_pem.clone()),
                    ..Default::default()
                })
            },
            1,
        );
        let cluster = h
            .bootstrapper
            .bootstrap(&PollContext::background())
            .await
            .unwrap();

        assert_eq!(cluster.ca_cert_pem(), ca.cert_pem());
        let leaf = cluster.seed().unwrap().identity().unwrap();
        assert!(verify_issued_by(leaf.cert_pem(), ca.cert_pem()).unwrap());
    }

    #[tokio::test]
    async fn static_membership_relies_on_retry_join() {
        let mut h = harness_with(
            FakeRuntime::new(),
            |config| config.membership = MembershipMode::Static,
            3,
        );
        h.service.auto_join();

        let cluster = h
            .bootstrapper
            .bootstrap(&PollContext::background())
            .await
            .unwrap();

        assert!(h.service.join_requests().is_empty());

        let seed_config: serde_json::Value = serde_json::from_slice(
            &std::fs::read(cluster.work_dir().join("node-0/local.json")).unwrap(),
        )
        .unwrap();
        assert!(seed_config["storage"]["raft"].get("retry_join").is_none());

        let follower_config: serde_json::Value = serde_json::from_slice(
            &std::fs::read(cluster.work_dir().join("node-2/local.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(
            follower_config["storage"]["raft"]["retry_join"][0]["leader_api_addr"],
            "https://acctest-node-0:8200"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn init_is_retried_until_seed_answers() {
        let mut h = harness(1);
        h.service.fail_init(2);

        h.bootstrapper
            .bootstrap(&PollContext::background())
            .await
            .unwrap();

        assert_eq!(h.service.calls(0, "init"), 3);
    }

    #[tokio::test]
    async fn observer_sees_phases_in_order() {
        let observer = Arc::new(RecordingObserver::default());
        let mut h = harness(2);
        h.bootstrapper = h.bootstrapper.with_observer(observer.clone());

        h.bootstrapper
            .bootstrap(&PollContext::background())
            .await
            .unwrap();

        assert_eq!(
            *observer.phases.lock(),
            vec![
                BootstrapPhase::CAProvisioned,
                BootstrapPhase::NodesStarting,
                BootstrapPhase::NodesStarted,
                BootstrapPhase::Initializing,
                BootstrapPhase::Unsealing,
                BootstrapPhase::Joining,
                BootstrapPhase::LeaderVerifying,
                BootstrapPhase::Ready,
            ]
        );

        let events = observer.events.lock();
        assert!(events.contains(&("acctest-node-0".to_string(), NodeEvent::Initialized)));
        assert!(events.contains(&("acctest-node-1".to_string(), NodeEvent::Joined)));
        assert!(!events.contains(&("acctest-node-0".to_string(), NodeEvent::Joined)));
        assert!(observer.failures.lock().is_empty());
    }

    #[tokio::test]
    async fn post_ready_hook_runs_once_with_ready_cluster() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();

        let mut h = harness(1);
        h.bootstrapper = h.bootstrapper.with_post_ready_hook(move |cluster| {
            record.lock().push(cluster.cluster_id().to_string());
            Ok(())
        });

        h.bootstrapper
            .bootstrap(&PollContext::background())
            .await
            .unwrap();

        assert_eq!(*seen.lock(), vec![FAKE_CLUSTER_ID.to_string()]);
    }

    #[tokio::test]
    async fn skip_init_leaves_nodes_uninitialized() {
        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();

        let mut h = harness_with(FakeRuntime::new(), |config| config.skip_init = true, 2);
        h.bootstrapper = h.bootstrapper.with_post_ready_hook(move |_| {
            *flag.lock() = true;
            Ok(())
        });

        let cluster = h
            .bootstrapper
            .bootstrap(&PollContext::background())
            .await
            .unwrap();

        assert!(cluster.root_token().is_empty());
        assert!(cluster.barrier_keys().is_empty());
        assert!(cluster.cluster_id().is_empty());
        assert_eq!(h.runtime.started().len(), 2);
        assert_eq!(h.service.calls(0, "init"), 0);
        assert_eq!(h.bootstrapper.phase(), BootstrapPhase::Ready);
        assert!(*ran.lock());
    }

    // =========================================================================
    // Failure Stories
    // =========================================================================

    #[tokio::test]
    async fn rejected_join_fails_without_teardown() {
        let observer = Arc::new(RecordingObserver::default());
        let mut h = harness(3);
        h.bootstrapper = h.bootstrapper.with_observer(observer.clone());
        h.service.join_result(2, false);

        let err = h
            .bootstrapper
            .bootstrap(&PollContext::background())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Protocol(_)), "got {:?}", err);
        assert!(err.to_string().contains("acctest-node-2"));
        assert_eq!(h.bootstrapper.phase(), BootstrapPhase::Failed);
        assert_eq!(*observer.failures.lock(), vec![BootstrapPhase::Joining]);

        // Nodes stay up for inspection until an explicit teardown
        assert_eq!(h.runtime.started().len(), 3);
        assert!(h.runtime.stopped().is_empty());

        h.bootstrapper.teardown().await;
        assert_eq!(h.runtime.stopped().len(), 3);
    }

    #[tokio::test]
    async fn withheld_shares_leave_seed_sealed() {
        let mut h = harness(1);
        h.service.withhold_shares(1);

        let err = h
            .bootstrapper
            .bootstrap(&PollContext::background())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Protocol(_)));
        assert!(err.to_string().contains("could not unseal"));
        assert_eq!(h.service.calls(0, "unseal"), 2);
    }

    #[tokio::test]
    async fn diverging_cluster_id_is_fatal() {
        let mut h = harness(2);
        h.service.cluster_id(1, "some-other-cluster");

        let err = h
            .bootstrapper
            .bootstrap(&PollContext::background())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Protocol(_)));
        assert!(err.to_string().contains("some-other-cluster"));
        assert_eq!(
            h.bootstrapper.cluster().unwrap().cluster_id(),
            FAKE_CLUSTER_ID
        );
    }

    #[tokio::test(start_paused = true)]
    async fn follower_claiming_leadership_times_out() {
        let mut h = harness(2);
        h.service.leader(1, true);

        let err = h
            .bootstrapper
            .bootstrap(&PollContext::background())
            .await
            .unwrap_err();

        match err {
            Error::Timeout {
                operation,
                last_error,
            } => {
                assert!(operation.contains("acctest-node-1"));
                assert!(last_error.contains("is_self=true"));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn follower_that_never_unseals_times_out() {
        let mut h = harness(2);
        h.service.stays_sealed(1);

        let err = h
            .bootstrapper
            .bootstrap(&PollContext::background())
            .await
            .unwrap_err();

        match err {
            Error::Timeout {
                operation,
                last_error,
            } => {
                assert!(operation.contains("acctest-node-1"));
                assert!(last_error.contains("is sealed"));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        // Every share was offered before polling began
        assert_eq!(h.service.calls(1, "unseal"), 3);
        assert_eq!(h.bootstrapper.phase(), BootstrapPhase::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn seed_never_leading_times_out_within_budget() {
        let mut h = harness(1);
        h.service.leader(0, false);

        let start = tokio::time::Instant::now();
        let err = h
            .bootstrapper
            .bootstrap(&PollContext::background())
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(start.elapsed() <= Duration::from_secs(2) + Duration::from_millis(100));
    }

    #[tokio::test]
    async fn cancelled_context_stops_init() {
        let mut h = harness(1);
        let ctx = PollContext::background();
        ctx.cancel();

        let err = h.bootstrapper.bootstrap(&ctx).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(h.service.calls(0, "init"), 0);
        // Started nodes remain reachable through the cluster handle
        assert!(h.bootstrapper.cluster().unwrap().seed().unwrap().handle().is_some());
    }

    #[tokio::test]
    async fn start_failure_aborts_and_keeps_started_handles() {
        let mut h = harness_with(FakeRuntime::failing_start_at(1), |_| {}, 3);

        let err = h
            .bootstrapper
            .bootstrap(&PollContext::background())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ProcessStart(_)));
        assert_eq!(h.service.calls(0, "init"), 0);

        let cluster = h.bootstrapper.cluster().unwrap();
        assert!(cluster.node(0).unwrap().handle().is_some());
        assert!(cluster.node(1).unwrap().handle().is_none());

        h.bootstrapper.teardown().await;
        assert_eq!(h.runtime.stopped(), vec!["acctest-node-0".to_string()]);
    }

    #[tokio::test]
    async fn connector_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut connector = MockAdminConnector::new();
        connector
            .expect_connect()
            .times(1)
            .returning(|_, _| Err(Error::crypto("invalid node identity")));

        let mut bootstrapper = ClusterBootstrapper::new(
            config(&dir, 2),
            FakeRuntime::new(),
            Arc::new(connector),
        )
        .unwrap();

        let err = bootstrapper
            .bootstrap(&PollContext::background())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Crypto(_)));
    }

    #[tokio::test]
    async fn network_failure_prevents_node_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut runtime = MockNodeRuntime::new();
        runtime
            .expect_ensure_network()
            .times(1)
            .returning(|_, _| Err(Error::process_start("network create failed")));
        runtime.expect_start().never();

        let mut bootstrapper = ClusterBootstrapper::new(
            config(&dir, 1),
            Arc::new(runtime),
            Arc::new(MockAdminConnector::new()),
        )
        .unwrap();

        let err = bootstrapper
            .bootstrap(&PollContext::background())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProcessStart(_)));
        assert_eq!(bootstrapper.phase(), BootstrapPhase::Failed);
    }

    #[tokio::test]
    async fn bootstrap_runs_at_most_once() {
        let mut h = harness(1);
        h.bootstrapper
            .bootstrap(&PollContext::background())
            .await
            .unwrap();

        let err = h
            .bootstrapper
            .bootstrap(&PollContext::background())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(h.service.calls(0, "init"), 1);
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let config = ClusterConfig {
            node_count: 0,
            ..Default::default()
        };
        let err = ClusterBootstrapper::new(
            config,
            FakeRuntime::new(),
            Arc::new(MockAdminConnector::new()),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn malformed_shares_are_protocol_errors() {
        let err = decode_shares(&["zz".to_string()], "barrier").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        let ok = decode_shares(&["0a0b".to_string()], "barrier").unwrap();
        assert_eq!(ok[0].as_slice(), &[0x0a, 0x0b]);
    }
}
