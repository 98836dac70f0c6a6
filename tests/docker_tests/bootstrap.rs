//! Stories about bringing a cluster up from nothing

use acctest::admin::{AdminApi, HttpAdminClient, DEFAULT_REQUEST_TIMEOUT};
use acctest::pki::tls::{ClientAuthPolicy, NodeTlsConfig};
use acctest::pki::verify_issued_by;

use super::helpers::{bootstrap, test_config};

#[tokio::test]
#[ignore = "requires docker - run with: cargo test --test docker -- --ignored"]
async fn single_node_cluster_is_unsealed_and_active() {
    let mut bootstrapper = bootstrap(test_config("acctest-single", 1)).await;
    let cluster = bootstrapper.cluster().expect("cluster after bootstrap");

    assert!(!cluster.cluster_id().is_empty());
    assert!(!cluster.root_token().is_empty());
    assert_eq!(cluster.barrier_keys().len(), 3);

    let seed = cluster.seed().unwrap();
    let client = seed.client().unwrap();
    let health = client.health().await.unwrap();
    assert!(!health.sealed);
    assert!(client.leader().await.unwrap().is_self);

    bootstrapper.teardown().await;
}

#[tokio::test]
#[ignore = "requires docker - run with: cargo test --test docker -- --ignored"]
async fn three_node_cluster_agrees_on_leader() {
    let mut bootstrapper = bootstrap(test_config("acctest-raft", 3)).await;
    let cluster = bootstrapper.cluster().expect("cluster after bootstrap");

    for (i, node) in cluster.nodes().iter().enumerate() {
        let identity = node.identity().unwrap();
        assert!(verify_issued_by(identity.cert_pem(), cluster.ca_cert_pem()).unwrap());

        let client = node.client().unwrap();
        let health = client.health().await.unwrap();
        assert_eq!(health.cluster_id, cluster.cluster_id());
        assert_eq!(client.leader().await.unwrap().is_self, i == 0);
    }

    bootstrapper.teardown().await;
}

#[tokio::test]
#[ignore = "requires docker - run with: cargo test --test docker -- --ignored"]
async fn fresh_client_can_use_handed_out_credentials() {
    let mut bootstrapper = bootstrap(test_config("acctest-client", 1)).await;
    let cluster = bootstrapper.cluster().expect("cluster after bootstrap");
    let seed = cluster.seed().unwrap();

    // A client built only from the descriptor reaches the node like a test would
    let tls = NodeTlsConfig::new(
        cluster.ca_cert_pem(),
        seed.identity().unwrap(),
        ClientAuthPolicy::Request,
    );
    let client = HttpAdminClient::new(
        seed.endpoint().unwrap().host_url(),
        &tls,
        DEFAULT_REQUEST_TIMEOUT,
    )
    .unwrap();
    client.set_token(cluster.root_token());

    assert!(!client.health().await.unwrap().sealed);

    bootstrapper.teardown().await;
}
