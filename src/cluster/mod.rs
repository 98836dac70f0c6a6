//! Test cluster bootstrap
//!
//! [`ClusterBootstrapper`] turns a [`ClusterConfig`] into a running
//! [`TestCluster`]: CA, node identities, started nodes, initialization,
//! unseal, raft membership and leader agreement.

mod bootstrap;
mod config;
mod descriptor;
mod node;
mod observer;
#[cfg(test)]
mod testing;

pub use bootstrap::{ClusterBootstrapper, PostReadyHook};
pub use config::{CaSource, ClusterConfig, MembershipMode};
pub use descriptor::TestCluster;
pub use node::ClusterNode;
pub use observer::{BootstrapObserver, BootstrapPhase, NodeEvent, TracingObserver};
