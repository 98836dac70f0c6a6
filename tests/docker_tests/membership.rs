//! Stories about membership modes and listener policy

use acctest::admin::AdminApi;
use acctest::cluster::MembershipMode;

use super::helpers::{bootstrap, test_config};

#[tokio::test]
#[ignore = "requires docker - run with: cargo test --test docker -- --ignored"]
async fn static_membership_joins_through_retry_join() {
    let mut config = test_config("acctest-static", 3);
    config.membership = MembershipMode::Static;

    let mut bootstrapper = bootstrap(config).await;
    let cluster = bootstrapper.cluster().expect("cluster after bootstrap");

    for node in cluster.nodes().iter().skip(1) {
        let leader = node.client().unwrap().leader().await.unwrap();
        assert!(!leader.is_self);
    }

    bootstrapper.teardown().await;
}

#[tokio::test]
#[ignore = "requires docker - run with: cargo test --test docker -- --ignored"]
async fn client_auth_cluster_still_bootstraps() {
    let mut config = test_config("acctest-mtls", 1);
    config.require_client_auth = true;

    let mut bootstrapper = bootstrap(config).await;
    let cluster = bootstrapper.cluster().expect("cluster after bootstrap");
    assert!(cluster.client_auth_required());

    let listener_config =
        std::fs::read_to_string(cluster.work_dir().join("node-0/local.json")).unwrap();
    assert!(listener_config.contains("tls_require_and_verify_client_cert"));

    bootstrapper.teardown().await;
}
