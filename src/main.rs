//! acctest - bring up a test cluster from the command line

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use acctest::cluster::{ClusterBootstrapper, ClusterConfig, MembershipMode, TestCluster};
use acctest::pki::{CaMaterial, CertificateAuthority};
use acctest::poll::PollContext;
use acctest::runtime::DockerRuntime;

/// acctest - TLS-secured test clusters for acceptance tests
#[derive(Parser, Debug)]
#[command(name = "acctest", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bootstrap a cluster and keep it running until Ctrl-C
    ///
    /// Nodes are torn down on Ctrl-C or on bootstrap failure unless `--keep`
    /// is given. A Ctrl-C during bootstrap also removes node containers by
    /// name, since a node being started has no handle yet.
    Up(UpArgs),

    /// Issue a CA and node identities into a directory without starting anything
    Certs(CertsArgs),
}

/// Up mode arguments
#[derive(Parser, Debug)]
struct UpArgs {
    /// Path to a cluster config YAML file; flags override its values
    #[arg(short = 'f', long = "config")]
    config_file: Option<PathBuf>,

    /// Cluster name
    #[arg(long)]
    name: Option<String>,

    /// Number of nodes
    #[arg(long)]
    nodes: Option<usize>,

    /// Node container image
    #[arg(long, env = "ACCTEST_IMAGE")]
    image: Option<String>,

    /// Working directory for certificates, configs and key shares
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Plugin binary copied into every node
    #[arg(long)]
    plugin: Option<PathBuf>,

    /// Let nodes join the seed through retry_join instead of join requests
    #[arg(long)]
    static_membership: bool,

    /// Require client certificates on node listeners
    #[arg(long)]
    require_client_auth: bool,

    /// Start nodes without initializing them
    #[arg(long)]
    skip_init: bool,

    /// Timeout for the entire bootstrap in seconds
    #[arg(long, default_value = "600")]
    timeout_secs: u64,

    /// Leave nodes running on exit and on failure (for debugging)
    #[arg(long)]
    keep: bool,
}

/// Certs mode arguments
#[derive(Parser, Debug)]
struct CertsArgs {
    /// Output directory
    #[arg(short, long)]
    out: PathBuf,

    /// Cluster name used to derive node names
    #[arg(long, default_value = acctest::DEFAULT_CLUSTER_NAME)]
    name: String,

    /// Number of node identities to issue
    #[arg(long, default_value = "1")]
    nodes: usize,

    /// Existing CA certificate PEM to sign with
    #[arg(long, requires = "ca_key")]
    ca_cert: Option<PathBuf>,

    /// Existing CA private key PEM
    #[arg(long)]
    ca_key: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Up(args) => run_up(args).await,
        Commands::Certs(args) => run_certs(args),
    }
}

fn up_config(args: &UpArgs) -> anyhow::Result<ClusterConfig> {
    let mut config = match &args.config_file {
        Some(path) => ClusterConfig::load(path)?,
        None => ClusterConfig::default(),
    };

    if let Some(name) = &args.name {
        config.name = name.clone();
    }
    if let Some(nodes) = args.nodes {
        config.node_count = nodes;
    }
    if let Some(image) = &args.image {
        config.image = image.clone();
    }
    if let Some(dir) = &args.work_dir {
        config.work_dir = Some(dir.clone());
    }
    if let Some(plugin) = &args.plugin {
        config.plugin_artifact = Some(plugin.clone());
    }
    if args.static_membership {
        config.membership = MembershipMode::Static;
    }
    config.require_client_auth |= args.require_client_auth;
    config.skip_init |= args.skip_init;

    Ok(config)
}

fn summary(cluster: &TestCluster) -> String {
    let mut out = format!(
        "Cluster {} is ready\n  work dir:   {}\n  CA:         {}\n  cluster id: {}\n  root token: {}\n",
        cluster.name(),
        cluster.work_dir().display(),
        cluster.ca_cert_pem_file().display(),
        cluster.cluster_id(),
        cluster.root_token(),
    );
    for node in cluster.nodes() {
        let url = node
            .endpoint()
            .map(|endpoint| endpoint.host_url())
            .unwrap_or_default();
        out.push_str(&format!("  {:<20} {}\n", node.name(), url));
    }
    out
}

/// Container names of every node the config would start
fn node_names(config: &ClusterConfig) -> Vec<String> {
    (0..config.node_count).map(|i| config.node_name(i)).collect()
}

/// Remove containers by name after an interrupted bootstrap
async fn remove_by_name(names: &[String]) {
    let docker = DockerRuntime::default();
    for name in names {
        if let Err(e) = docker.remove(name).await {
            warn!(node = %name, error = %e, "Failed to remove node container");
        }
    }
}

async fn run_up(args: UpArgs) -> anyhow::Result<()> {
    let config = up_config(&args)?;
    let names = node_names(&config);
    let mut bootstrapper = ClusterBootstrapper::docker(config)?;
    let ctx = PollContext::with_timeout(Duration::from_secs(args.timeout_secs));

    let mut interrupted = false;
    let outcome = tokio::select! {
        result = bootstrapper.bootstrap(&ctx) => result.map(summary).map_err(anyhow::Error::from),
        _ = tokio::signal::ctrl_c() => {
            interrupted = true;
            Err(anyhow::anyhow!("interrupted during bootstrap"))
        }
    };

    let summary = match outcome {
        Ok(summary) => summary,
        Err(e) => {
            if !args.keep {
                bootstrapper.teardown().await;
                if interrupted {
                    remove_by_name(&names).await;
                }
            }
            return Err(e);
        }
    };

    println!("{}", summary);
    if args.keep {
        info!("Leaving cluster running");
        return Ok(());
    }

    info!("Press Ctrl-C to tear the cluster down");
    tokio::signal::ctrl_c().await?;
    bootstrapper.teardown().await;
    Ok(())
}

fn run_certs(args: CertsArgs) -> anyhow::Result<()> {
    let material = match (&args.ca_cert, &args.ca_key) {
        (None, None) => None,
        (cert, key) => Some(CaMaterial {
            cert_pem: cert.as_ref().map(std::fs::read_to_string).transpose()?,
            key_pem: key.as_ref().map(std::fs::read_to_string).transpose()?,
        }),
    };

    let ca = CertificateAuthority::create(material.as_ref())?;
    let ca_file = ca.persist(&args.out.join(acctest::CA_DIR))?;
    println!("CA: {}", ca_file.display());

    let config = ClusterConfig {
        name: args.name,
        node_count: args.nodes,
        ..Default::default()
    };
    config.validate()?;

    for i in 0..config.node_count {
        let name = config.node_name(i);
        let identity = ca.issue_leaf(&name, &[])?;
        let files = identity.persist(&args.out.join(config.node_id(i)))?;
        println!("{}: {}", name, files.cert_file.display());
    }
    Ok(())
}
