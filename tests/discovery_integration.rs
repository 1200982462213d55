//! Discovery Integration Tests
//!
//! Discovery log retrieval through the orchestrator, translation of log
//! entries into fabrics targets, host identity and the sysfs scan.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use assert_matches::assert_matches;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use nvmekit::codec::discovery_log::TREQ_DISABLE_SQFLOW;
use nvmekit::codec::{AddressFamily, DiscoveryLog, DiscoveryLogEntry, SubsystemType, TransportType};
use nvmekit::discovery::{scan_controllers, HostIdentity};
use nvmekit::error::Error;
use nvmekit::orchestrator::{
    target_from_discovery_entry, DiscoveryEntryOutcome, Orchestrator, OrchestratorConfig,
};
use nvmekit::topology::Host;
use nvmekit::transport::fabrics::DISCOVERY_NQN;
use nvmekit::transport::{ConnectTarget, FabricsConfig, MockConnector, MockDevice};

fn entry(trtype: TransportType, adrfam: AddressFamily, subnqn: &str, traddr: &str) -> DiscoveryLogEntry {
    DiscoveryLogEntry {
        trtype,
        adrfam,
        subtype: SubsystemType::Nvme,
        treq: 0,
        portid: 1,
        cntlid: 0xFFFF,
        asqsz: 32,
        eflags: 0,
        trsvcid: "4420".into(),
        subnqn: subnqn.into(),
        traddr: traddr.into(),
    }
}

fn discovery_device() -> MockDevice {
    let device = MockDevice::new(DISCOVERY_NQN, "DISC0001");
    let mut tcp = entry(
        TransportType::Tcp,
        AddressFamily::Ipv4,
        "nqn.2024-01.io.nvmekit:tcp",
        "192.168.10.2",
    );
    tcp.treq = TREQ_DISABLE_SQFLOW;
    let mut referral = entry(TransportType::Tcp, AddressFamily::Ipv4, DISCOVERY_NQN, "192.168.20.1");
    referral.subtype = SubsystemType::Discovery;
    referral.trsvcid = "8009".into();
    device.set_discovery_log(DiscoveryLog {
        genctr: 41,
        recfmt: 0,
        entries: vec![
            tcp,
            entry(
                TransportType::Fc,
                AddressFamily::Fc,
                "nqn.2024-01.io.nvmekit:fc",
                "nn-0x20000090fa942779:pn-0x10000090fa942779",
            ),
            referral,
        ],
    });
    device
}

fn orchestrator(connector: Arc<MockConnector>, host_dir: &Path) -> Orchestrator {
    let identity = HostIdentity::resolve(host_dir).unwrap();
    let host = Host::new(identity.nqn, identity.id, "discovery-host").unwrap();
    Orchestrator::new(host, connector, OrchestratorConfig::default())
}

#[tokio::test]
async fn test_fetch_discovery_log_leaves_no_trace() {
    let dir = TempDir::new().unwrap();
    let connector = Arc::new(MockConnector::new());
    let device = discovery_device();
    device.bump_generation(1);
    connector.add_device("disc", device.clone());
    let orch = orchestrator(connector.clone(), dir.path());

    let log = orch
        .fetch_discovery_log(
            ConnectTarget::Mock {
                name: "disc".into(),
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(log.genctr, 42);
    assert_eq!(log.entries.len(), 3);
    assert_eq!(log.entries[0].subnqn, "nqn.2024-01.io.nvmekit:tcp");
    assert_eq!(connector.open_handles(), 0);
    assert!(orch.topology().subsystems().is_empty());
}

#[tokio::test]
async fn test_fetch_discovery_log_cancelled() {
    let dir = TempDir::new().unwrap();
    let connector = Arc::new(MockConnector::new());
    connector.add_device("disc", discovery_device());
    let orch = orchestrator(connector.clone(), dir.path());
    let cancel = CancellationToken::new();
    cancel.cancel();

    assert_matches!(
        orch.fetch_discovery_log(
            ConnectTarget::Mock {
                name: "disc".into()
            },
            &cancel
        )
        .await,
        Err(Error::Cancelled)
    );
    assert_eq!(connector.open_handles(), 0);
}

#[tokio::test]
async fn test_discovery_entries_become_fabrics_targets() {
    let dir = TempDir::new().unwrap();
    let connector = Arc::new(MockConnector::new());
    connector.add_device("disc", discovery_device());
    let orch = orchestrator(connector, dir.path());

    let log = orch
        .fetch_discovery_log(
            ConnectTarget::Mock {
                name: "disc".into(),
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let mut defaults = FabricsConfig::default();
    defaults.host_nqn = Some(orch.topology().host().nqn.clone());
    defaults.ctrl_loss_tmo = 30;

    let tcp = target_from_discovery_entry(&log.entries[0], &defaults).unwrap();
    assert_eq!(tcp.transport, "tcp");
    assert_eq!(tcp.traddr.as_deref(), Some("192.168.10.2"));
    assert_eq!(tcp.trsvcid.as_deref(), Some("4420"));
    assert!(tcp.disable_sqflow);
    assert_eq!(tcp.ctrl_loss_tmo, 30);
    assert_eq!(tcp.host_nqn, defaults.host_nqn);

    let fc = target_from_discovery_entry(&log.entries[1], &defaults).unwrap();
    assert_eq!(fc.transport, "fc");
    assert!(fc.traddr.unwrap().starts_with("nn-0x"));
    assert!(!fc.disable_sqflow);

    // fabrics targets need a kernel; the mock connector refuses them
    assert_matches!(
        orch.connect_discovery_entry(&log.entries[0], &defaults, &CancellationToken::new())
            .await,
        Err(Error::ConnectFailed { .. })
    );
}

#[tokio::test]
async fn test_referral_entry_is_returned_not_connected() {
    let dir = TempDir::new().unwrap();
    let connector = Arc::new(MockConnector::new());
    connector.add_device("disc", discovery_device());
    let orch = orchestrator(connector.clone(), dir.path());

    let log = orch
        .fetch_discovery_log(
            ConnectTarget::Mock {
                name: "disc".into(),
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    let referral = &log.entries[2];
    assert!(referral.subtype.is_discovery());
    assert!(!log.entries[0].subtype.is_discovery());

    let outcome = orch
        .connect_discovery_entry(referral, &FabricsConfig::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert_matches!(
        outcome,
        DiscoveryEntryOutcome::Referral(ConnectTarget::Fabrics(ref cfg))
            if cfg.traddr.as_deref() == Some("192.168.20.1")
                && cfg.trsvcid.as_deref() == Some("8009")
    );
    assert_eq!(connector.open_handles(), 0);
    assert!(orch.topology().controllers().is_empty());
}

#[test]
fn test_host_identity_round_trip() {
    let dir = TempDir::new().unwrap();
    let generated = HostIdentity::resolve(dir.path()).unwrap();
    generated.save(dir.path()).unwrap();

    let loaded = HostIdentity::resolve(dir.path()).unwrap();
    assert_eq!(loaded, generated);
    assert!(Host::new(loaded.nqn, loaded.id, "h").is_ok());
}

#[test]
fn test_sysfs_scan_yields_char_device_targets() {
    let root = TempDir::new().unwrap();
    let ctrl = root.path().join("nvme0");
    fs::create_dir_all(&ctrl).unwrap();
    fs::write(ctrl.join("transport"), "pcie\n").unwrap();
    fs::write(ctrl.join("subsysnqn"), "nqn.2024-01.io.nvmekit:local\n").unwrap();
    fs::write(ctrl.join("state"), "live\n").unwrap();

    let found = scan_controllers(root.path()).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(
        found[0].connect_target(Path::new("/dev")),
        ConnectTarget::Pcie {
            device: "/dev/nvme0".into()
        }
    );
    assert!(scan_controllers(&root.path().join("missing"))
        .unwrap()
        .is_empty());
}
