//! Shared fixtures for Docker-backed tests

use std::sync::Once;
use std::time::Duration;

use acctest::cluster::{ClusterBootstrapper, ClusterConfig};
use acctest::poll::PollContext;

static TRACING: Once = Once::new();

/// Route harness logs to the test output, filtered by `RUST_LOG`
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Config for a test cluster with a unique name and network
pub fn test_config(name: &str, node_count: usize) -> ClusterConfig {
    let mut config = ClusterConfig {
        name: name.to_string(),
        network_name: format!("{}-net", name),
        node_count,
        ..Default::default()
    };
    if let Ok(image) = std::env::var("ACCTEST_IMAGE") {
        config.image = image;
    }
    config
}

/// Overall bound for one bootstrap in these tests
pub fn bootstrap_context() -> PollContext {
    PollContext::with_timeout(Duration::from_secs(300))
}

/// Bootstrap `config`, tearing the cluster down again if bootstrap fails
pub async fn bootstrap(config: ClusterConfig) -> ClusterBootstrapper {
    init_tracing();
    let mut bootstrapper =
        ClusterBootstrapper::docker(config).expect("test config should be valid");

    if let Err(e) = bootstrapper.bootstrap(&bootstrap_context()).await {
        bootstrapper.teardown().await;
        panic!("bootstrap failed: {}", e);
    }
    bootstrapper
}
