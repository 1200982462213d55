//! nvmekit
//!
//! Builds the host's NVMe topology and prints it.
//!
//! # Flow
//!
//! ```text
//! host identity ──► saved targets ──► sysfs scan ──► connect ──► refresh ──► print
//!   (/etc/nvme)      (config file)    (/sys/class/nvme)                       │
//!                                                                 save targets, disconnect
//! ```

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nvmekit::discovery::{scan_controllers, HostIdentity};
use nvmekit::error::{Error, Result};
use nvmekit::orchestrator::{DiscoveryEntryOutcome, Orchestrator, OrchestratorConfig};
use nvmekit::persist::JsonFileConfigStore;
use nvmekit::topology::Host;
use nvmekit::transport::{ConnectTarget, FabricsConfig, SystemConnector};
use nvmekit::NvmeMetrics;

/// Discovery controllers read per run, referrals included
const MAX_DISCOVERY_CONTROLLERS: usize = 16;

// =============================================================================
// CLI Arguments
// =============================================================================

/// nvmekit - NVMe topology discovery and fabrics connect
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding hostnqn and hostid
    #[arg(long, env = "NVMEKIT_HOST_DIR", default_value = "/etc/nvme")]
    host_dir: PathBuf,

    /// Host name recorded in the topology
    #[arg(long, env = "NVMEKIT_HOST_NAME", default_value = "localhost")]
    host_name: String,

    /// Persisted configuration file
    #[arg(long, env = "NVMEKIT_CONFIG", default_value = "/var/lib/nvmekit/config.json")]
    config: PathBuf,

    /// sysfs class directory of NVMe controllers
    #[arg(long, env = "NVMEKIT_SYSFS_ROOT", default_value = "/sys/class/nvme")]
    sysfs_root: PathBuf,

    /// Directory of controller character devices
    #[arg(long, env = "NVMEKIT_DEV_DIR", default_value = "/dev")]
    dev_dir: PathBuf,

    /// Discovery controller address to query and connect through; referrals are followed
    #[arg(long, env = "NVMEKIT_DISCOVER")]
    discover: Option<String>,

    /// Fabrics transport of the discovery controller
    #[arg(long, env = "NVMEKIT_TRANSPORT", default_value = "tcp")]
    transport: String,

    /// Discovery controller service id
    #[arg(long, env = "NVMEKIT_TRSVCID", default_value = "8009")]
    trsvcid: String,

    /// Skip the sysfs scan of local controllers
    #[arg(long, env = "NVMEKIT_NO_SCAN")]
    no_scan: bool,

    /// Print Prometheus metrics before exiting
    #[arg(long, env = "NVMEKIT_METRICS")]
    metrics: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let identity = HostIdentity::resolve(&args.host_dir)?;
    info!("Host {} ({})", identity.nqn, identity.id);
    let host = Host::new(identity.nqn.clone(), identity.id, args.host_name.clone())?;

    let store = JsonFileConfigStore::open(&args.config)?;
    let saved = Orchestrator::load_targets(&store)?;
    info!("{} saved target(s) in {}", saved.len(), store.path().display());

    let config = OrchestratorConfig::default();
    let metrics = Arc::new(NvmeMetrics::new()?);
    let connector = Arc::new(SystemConnector::new(config.transport.clone()));
    let orch = Orchestrator::new(host, connector, config).with_metrics(metrics.clone());

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling pending connects");
            ctrl_c.cancel();
        }
    });

    let mut defaults = FabricsConfig::default();
    defaults.host_nqn = Some(identity.nqn.clone());
    defaults.host_id = Some(identity.id.to_string());

    let mut targets: Vec<(String, ConnectTarget)> = saved
        .into_iter()
        .map(|t| (t.subsystem_nqn, t.target))
        .collect();

    if !args.no_scan {
        for local in scan_controllers(&args.sysfs_root)? {
            if !local.is_live() || local.is_fabrics() {
                continue;
            }
            match &local.subsysnqn {
                Some(nqn) => targets.push((nqn.clone(), local.connect_target(&args.dev_dir))),
                None => warn!("{} has no subsystem NQN, skipping", local.name),
            }
        }
    }

    if let Some(traddr) = &args.discover {
        let mut discovery = FabricsConfig::new(args.transport.as_str());
        discovery.traddr = Some(traddr.clone());
        discovery.trsvcid = Some(args.trsvcid.clone());
        discovery.merge_defaults(&defaults);

        let mut pending = VecDeque::from([ConnectTarget::Fabrics(discovery)]);
        let mut visited = HashSet::new();
        while let Some(target) = pending.pop_front() {
            let address = target.address();
            if visited.len() >= MAX_DISCOVERY_CONTROLLERS {
                warn!("Not following referral to {}, limit reached", address);
                continue;
            }
            if !visited.insert(address.clone()) {
                continue;
            }

            let log = match orch.fetch_discovery_log(target, &cancel).await {
                Ok(log) => log,
                Err(e) => {
                    error!("Discovery at {} failed: {}", address, e);
                    continue;
                }
            };
            for entry in &log.entries {
                match orch.connect_discovery_entry(entry, &defaults, &cancel).await {
                    Ok(DiscoveryEntryOutcome::Connected(report)) => info!(
                        "{}: {} namespace(s) via {}",
                        entry.subnqn,
                        report.namespaces.len(),
                        report.controller
                    ),
                    Ok(DiscoveryEntryOutcome::Referral(next)) => pending.push_back(next),
                    Err(Error::DuplicateIdentity { key }) => {
                        info!("{} already connected as {}", entry.subnqn, key)
                    }
                    Err(e) => error!("Connecting to {} failed: {}", entry.subnqn, e),
                }
            }
        }
    }

    for (nqn, target) in targets {
        match orch.connect(&nqn, target, &cancel).await {
            Ok(report) => info!(
                "{}: {} namespace(s) via {}",
                nqn,
                report.namespaces.len(),
                report.controller
            ),
            Err(Error::DuplicateIdentity { key }) => info!("{} already connected as {}", nqn, key),
            Err(e) => error!("Connecting to {} failed: {}", nqn, e),
        }
    }

    let diff = orch.refresh().await?;
    if !diff.is_empty() {
        info!(
            "Refresh: {} added, {} updated, {} removed",
            diff.added.len(),
            diff.updated.len(),
            diff.removed.len()
        );
    }

    let snapshot = orch.topology().snapshot();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    let saved = orch.save_config(&store)?;
    info!("Saved {} target(s)", saved);

    if args.metrics {
        print!("{}", metrics.encode_text()?);
    }

    orch.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // logs go to stderr so the printed topology stays parseable
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
