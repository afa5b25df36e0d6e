//! trove-cluster CLI - Orchestrate database clusters

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use trove_cluster::guest::CommandGuestClient;
use trove_cluster::service::CreateRequest;
use trove_cluster::store::JsonFileStore;
use trove_cluster::{
    ClusterId, ClusterOrchestrator, ClusterRecordStore, ClusterService, ClusterTask, Error,
    GuestRpcClient, InstanceDef, NodeId, NodeStatus, OrchestratorConfig, Result,
};

#[derive(Parser)]
#[command(name = "trove-cluster")]
#[command(about = "Orchestrate database clusters", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List all clusters
    List,

    /// Show a cluster and its nodes
    Show {
        /// Cluster id
        cluster: String,
    },

    /// List the supported datastore engines and their service types
    Engines,

    /// Check a create request without recording anything
    Validate {
        /// Create request (JSON)
        request: PathBuf,
    },

    /// Record a cluster and build it once its nodes are ready
    Create {
        /// Create request (JSON)
        request: PathBuf,
        /// Only record the cluster; do not wait for nodes
        #[arg(long)]
        no_wait: bool,
    },

    /// Add instances to a cluster
    Grow {
        /// Cluster id
        cluster: String,
        /// Instances to add (JSON list)
        instances: PathBuf,
    },

    /// Remove nodes from a cluster
    Shrink {
        /// Cluster id
        cluster: String,
        /// Nodes to remove
        #[arg(required = true)]
        nodes: Vec<String>,
    },

    /// Upgrade every node of a cluster, one at a time
    Upgrade {
        /// Cluster id
        cluster: String,
        /// Target datastore version
        version: String,
    },

    /// Delete a cluster and all its nodes
    Delete {
        /// Cluster id
        cluster: String,
        /// Do not ask for confirmation
        #[arg(long)]
        yes: bool,
    },

    /// Release a stuck cluster and mark unfinished nodes FAILED
    ResetStatus {
        /// Cluster id
        cluster: String,
    },

    /// Record the status a node's guest reported
    NodeStatus {
        /// Node id
        node: String,
        /// new, building, build_pending, ready, upgrading, failed
        status: String,
        /// Address the guest is reachable at
        #[arg(long)]
        ip: Option<String>,
    },
}

fn info(msg: &str) {
    println!("{} {}", "[INFO]".blue(), msg);
}

fn success(msg: &str) {
    println!("{} {}", "[OK]".green(), msg);
}

fn warn(msg: &str) {
    println!("{} {}", "[WARN]".yellow(), msg);
}

fn error(msg: &str) {
    eprintln!("{} {}", "[ERROR]".red(), msg);
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn parse_cluster(s: &str) -> Result<ClusterId> {
    s.parse().map_err(Error::Other)
}

fn parse_node(s: &str) -> Result<NodeId> {
    s.parse().map_err(Error::Other)
}

type Orchestrator = ClusterOrchestrator<JsonFileStore, CommandGuestClient>;

fn service(orchestrator: &Orchestrator) -> ClusterService<'_, JsonFileStore> {
    ClusterService::new(orchestrator.store(), orchestrator.registry())
}

/// Run an accepted task and report how the cluster ended up
fn run_task<S, G>(orchestrator: &ClusterOrchestrator<S, G>, task: &ClusterTask) -> Result<()>
where
    S: ClusterRecordStore,
    G: GuestRpcClient,
{
    info(&format!("Running {} on cluster {}...", task.status(), task.cluster()));
    orchestrator.run(task)?;

    if let ClusterTask::Delete { cluster } = task {
        success(&format!("Cluster {} deleted", cluster));
        return Ok(());
    }

    let failed: Vec<NodeId> = orchestrator
        .store()
        .list_nodes(task.cluster())?
        .iter()
        .filter(|n| n.status == NodeStatus::Failed)
        .map(|n| n.id)
        .collect();
    if failed.is_empty() {
        success(&format!("{} finished", task.status()));
    } else {
        for node in &failed {
            warn(&format!("Node {} is FAILED", node));
        }
        warn("Inspect the cluster with: trove-cluster show <cluster>");
    }
    Ok(())
}

fn cmd_list(orchestrator: &Orchestrator) -> Result<()> {
    let clusters = service(orchestrator).list()?;
    if clusters.is_empty() {
        info("No clusters");
        return Ok(());
    }

    println!(
        "{:<38} {:<16} {:<20} {:<18} {}",
        "ID", "NAME", "DATASTORE", "TASK", "NODES"
    );
    println!(
        "{:<38} {:<16} {:<20} {:<18} {}",
        "--", "----", "---------", "----", "-----"
    );
    for cluster in clusters {
        let nodes = orchestrator.store().list_nodes(cluster.id)?.len();
        println!(
            "{:<38} {:<16} {:<20} {:<18} {}",
            cluster.id,
            cluster.name,
            cluster.datastore.to_string(),
            cluster.task_status.to_string(),
            nodes
        );
    }
    Ok(())
}

fn cmd_show(orchestrator: &Orchestrator, cluster: &str) -> Result<()> {
    let (cluster, nodes) = service(orchestrator).show(parse_cluster(cluster)?)?;

    info(&format!("Cluster {} ({})", cluster.name, cluster.id));
    println!("  tenant:    {}", cluster.tenant);
    println!("  datastore: {}", cluster.datastore);
    println!("  task:      {}", cluster.task_status);
    println!("  created:   {}", cluster.created.to_rfc3339());
    println!("  updated:   {}", cluster.updated.to_rfc3339());
    println!();
    println!(
        "{:<38} {:<20} {:<15} {:<14} {:<12} {}",
        "NODE", "NAME", "IP", "STATUS", "FLAVOR", "SERVICES"
    );
    for node in nodes {
        println!(
            "{:<38} {:<20} {:<15} {:<14} {:<12} {}",
            node.id,
            node.name,
            node.ip.as_deref().unwrap_or("-"),
            node.status.to_string(),
            node.flavor,
            node.services
        );
    }
    Ok(())
}

fn cmd_engines(orchestrator: &Orchestrator) -> Result<()> {
    let registry = orchestrator.registry();
    for engine in registry.engines() {
        let rules = registry.resolve(engine)?;
        println!(
            "  {:<12} valid: {:<40} required: {:<24} min nodes: {}",
            engine,
            rules.valid_types.to_string(),
            rules.required_types.to_string(),
            rules.min_nodes
        );
    }
    Ok(())
}

fn cmd_validate(orchestrator: &Orchestrator, request: &Path) -> Result<()> {
    let request: CreateRequest = read_json(request)?;
    let types = service(orchestrator).validate(&request)?;
    for (index, services) in types.iter().enumerate() {
        println!("  instance {}: {}", index + 1, services);
    }
    success(&format!("Request for '{}' is valid", request.name));
    Ok(())
}

fn cmd_create(orchestrator: &Orchestrator, request: &Path, no_wait: bool) -> Result<()> {
    let request: CreateRequest = read_json(request)?;
    let (cluster, task) = service(orchestrator).create(&request)?;
    success(&format!("Cluster '{}' recorded as {}", cluster.name, cluster.id));

    if no_wait {
        info("Report node readiness with: trove-cluster node-status <node> build_pending --ip <ip>");
        info(&format!(
            "The cluster stays {} until built or reset",
            cluster.task_status
        ));
        return Ok(());
    }

    info("Waiting for nodes to report ready...");
    run_task(orchestrator, &task)
}

fn cmd_grow(orchestrator: &Orchestrator, cluster: &str, instances: &Path) -> Result<()> {
    let instances: Vec<InstanceDef> = read_json(instances)?;
    let (nodes, task) = service(orchestrator).grow(parse_cluster(cluster)?, &instances)?;
    for node in &nodes {
        info(&format!("Recorded node {} ({})", node.name, node.id));
    }
    run_task(orchestrator, &task)
}

fn cmd_shrink(orchestrator: &Orchestrator, cluster: &str, nodes: &[String]) -> Result<()> {
    let nodes = nodes.iter().map(|n| parse_node(n)).collect::<Result<Vec<_>>>()?;
    let task = service(orchestrator).shrink(parse_cluster(cluster)?, &nodes)?;
    run_task(orchestrator, &task)
}

fn cmd_upgrade(orchestrator: &Orchestrator, cluster: &str, version: &str) -> Result<()> {
    let task = service(orchestrator).upgrade(parse_cluster(cluster)?, version)?;
    run_task(orchestrator, &task)
}

fn cmd_delete(orchestrator: &Orchestrator, cluster: &str, yes: bool) -> Result<()> {
    let cluster = parse_cluster(cluster)?;

    if !yes {
        warn(&format!(
            "This will delete cluster {} and all of its nodes!",
            cluster
        ));

        use std::io::{self, Write};
        print!("Type 'DELETE' to confirm: ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if input.trim() != "DELETE" {
            return Err(Error::Other("Aborted".to_string()));
        }
    }

    let task = service(orchestrator).delete(cluster)?;
    run_task(orchestrator, &task)
}

fn cmd_reset_status(orchestrator: &Orchestrator, cluster: &str) -> Result<()> {
    let cluster = parse_cluster(cluster)?;
    let failed = service(orchestrator).reset_status(cluster)?;
    for node in &failed {
        warn(&format!("Node {} marked FAILED", node));
    }
    success(&format!("Cluster {} task status reset", cluster));
    Ok(())
}

fn cmd_node_status(orchestrator: &Orchestrator, node: &str, status: &str, ip: Option<&str>) -> Result<()> {
    let node = parse_node(node)?;
    let status: NodeStatus = status.parse().map_err(Error::Other)?;
    service(orchestrator).report_node_status(node, status, ip)?;
    success(&format!("Node {} is {}", node, status));
    Ok(())
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let config = match &cli.config {
        Some(path) => OrchestratorConfig::from_file(path)?,
        None => OrchestratorConfig::default(),
    };

    let store = JsonFileStore::open(&config.store_path)?;
    let guest = CommandGuestClient::new(&config.guest);
    let orchestrator = ClusterOrchestrator::new(store, guest, config.registry(), config.timeouts())
        .with_rpc_version(config.guest.rpc_version.clone());

    match cli.command {
        None | Some(Commands::List) => cmd_list(&orchestrator),
        Some(Commands::Show { cluster }) => cmd_show(&orchestrator, &cluster),
        Some(Commands::Engines) => cmd_engines(&orchestrator),
        Some(Commands::Validate { request }) => cmd_validate(&orchestrator, &request),
        Some(Commands::Create { request, no_wait }) => cmd_create(&orchestrator, &request, no_wait),
        Some(Commands::Grow { cluster, instances }) => cmd_grow(&orchestrator, &cluster, &instances),
        Some(Commands::Shrink { cluster, nodes }) => cmd_shrink(&orchestrator, &cluster, &nodes),
        Some(Commands::Upgrade { cluster, version }) => cmd_upgrade(&orchestrator, &cluster, &version),
        Some(Commands::Delete { cluster, yes }) => cmd_delete(&orchestrator, &cluster, yes),
        Some(Commands::ResetStatus { cluster }) => cmd_reset_status(&orchestrator, &cluster),
        Some(Commands::NodeStatus { node, status, ip }) => {
            cmd_node_status(&orchestrator, &node, &status, ip.as_deref())
        }
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error(&e.to_string());
            ExitCode::FAILURE
        }
    }
}
