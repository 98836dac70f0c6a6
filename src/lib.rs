//! acctest - bootstrap TLS-secured test clusters for acceptance tests
//!
//! Brings up a multi-node cluster of a secrets-management server from
//! nothing: a throwaway CA, per-node leaf identities, one process per node
//! on an isolated network, initialization of the seed node, unseal of every
//! node, raft join, and verification that all nodes agree on the leader.
//!
//! # Modules
//!
//! - [`pki`] - CA creation, leaf issuance and TLS settings for nodes
//! - [`poll`] - Deadline-bound polling used for every convergence wait
//! - [`admin`] - Typed admin API client (init, unseal, health, leader, raft join)
//! - [`runtime`] - Node process runtime (Docker)
//! - [`cluster`] - Cluster configuration, descriptors and the bootstrap state machine
//! - [`error`] - Error types
//!
//! # Example
//!
//! ```no_run
//! use acctest::cluster::{ClusterBootstrapper, ClusterConfig};
//! use acctest::poll::PollContext;
//!
//! # async fn run() -> acctest::Result<()> {
//! let config = ClusterConfig {
//!     node_count: 3,
//!     ..Default::default()
//! };
//! let mut bootstrapper = ClusterBootstrapper::docker(config)?;
//! let cluster = bootstrapper.bootstrap(&PollContext::background()).await?;
//! println!("cluster {} is ready", cluster.cluster_id());
//! bootstrapper.teardown().await;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

pub mod admin;
pub mod cluster;
pub mod error;
pub mod pki;
pub mod poll;
pub mod runtime;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Default cluster name, also used as network name
pub const DEFAULT_CLUSTER_NAME: &str = "acctest";

/// Default node image
pub const DEFAULT_IMAGE: &str = "hashicorp/vault:latest";

/// Default cluster network CIDR
pub const DEFAULT_NETWORK_CIDR: &str = "192.168.128.0/20";

/// Default admin API port; the cluster port is the next one
pub const DEFAULT_API_PORT: u16 = 8200;

/// Default number of barrier key shares, also the default threshold
pub const DEFAULT_KEY_SHARES: u32 = 3;

// =============================================================================
// Work Directory Layout
// =============================================================================

/// Directory holding the CA certificate and key
pub const CA_DIR: &str = "ca";

/// File holding the root credential
pub const ROOT_TOKEN_FILE: &str = "root_token";

/// File holding the barrier key shares, one hex share per line
pub const BARRIER_KEYS_FILE: &str = "barrier_keys";

/// File holding the recovery key shares, one hex share per line
pub const RECOVERY_KEYS_FILE: &str = "recovery_keys";
