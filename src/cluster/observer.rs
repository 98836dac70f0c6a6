//! Bootstrap lifecycle observation

use std::fmt;

use tracing::{error, info};

use crate::Error;

/// Phases of a bootstrap attempt, in the order they are entered
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BootstrapPhase {
    /// Bootstrapper constructed, nothing done yet
    Created,
    /// Root CA created and persisted
    CAProvisioned,
    /// Node identities issued and processes being launched
    NodesStarting,
    /// Every node process is running with an admin client
    NodesStarted,
    /// Seed node being initialized
    Initializing,
    /// Seed node being unsealed and confirmed as leader
    Unsealing,
    /// Non-seed nodes joining, unsealing and reporting healthy
    Joining,
    /// Every node's leader view being confirmed
    LeaderVerifying,
    /// Cluster usable
    Ready,
    /// Bootstrap aborted
    Failed,
}

impl fmt::Display for BootstrapPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "Created",
            Self::CAProvisioned => "CAProvisioned",
            Self::NodesStarting => "NodesStarting",
            Self::NodesStarted => "NodesStarted",
            Self::Initializing => "Initializing",
            Self::Unsealing => "Unsealing",
            Self::Joining => "Joining",
            Self::LeaderVerifying => "LeaderVerifying",
            Self::Ready => "Ready",
            Self::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Per-node milestones
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeEvent {
    /// Leaf identity issued and persisted
    IdentityIssued,
    /// Process running, admin API published at `api_url`
    Started {
        /// Admin API URL reachable from the harness
        api_url: String,
    },
    /// Storage initialized (seed only)
    Initialized,
    /// Raft join accepted
    Joined,
    /// Node reports unsealed with a cluster id
    Unsealed {
        /// Cluster id the node reported
        cluster_id: String,
    },
    /// Node's leader view confirmed
    LeaderConfirmed {
        /// Whether the node is the active node
        is_self: bool,
    },
}

/// Receives bootstrap progress
///
/// All methods default to doing nothing so observers implement only what
/// they need.
pub trait BootstrapObserver: Send + Sync {
    /// The bootstrapper moved from `from` to `to`
    fn phase_changed(&self, _cluster: &str, _from: BootstrapPhase, _to: BootstrapPhase) {}

    /// A node reached a milestone
    fn node_event(&self, _cluster: &str, _node: &str, _event: &NodeEvent) {}

    /// Bootstrap failed while in `phase`
    fn failed(&self, _cluster: &str, _phase: BootstrapPhase, _error: &Error) {}
}

/// Emits every observation as a `tracing` event
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingObserver;

impl BootstrapObserver for TracingObserver {
    fn phase_changed(&self, cluster: &str, from: BootstrapPhase, to: BootstrapPhase) {
        info!(cluster = %cluster, from = %from, to = %to, "Bootstrap phase changed");
    }

    fn node_event(&self, cluster: &str, node: &str, event: &NodeEvent) {
        info!(cluster = %cluster, node = %node, event = ?event, "Node milestone");
    }

    fn failed(&self, cluster: &str, phase: BootstrapPhase, error: &Error) {
        error!(cluster = %cluster, phase = %phase, error = %error, "Bootstrap failed");
    }
}
