//! Transport Channels
//!
//! A channel owns exactly one open device handle and submits one command at a
//! time. The variants form a closed set:
//!
//! ```text
//!            ┌──────────────────────────────────────────┐
//!            │                Channel                   │
//!            ├──────────────┬─────────────┬─────────────┤
//!            │    Pcie      │   Fabrics   │ Mock (opt.) │
//!            │ /dev/nvmeN   │ /dev/nvme-  │ in-memory   │
//!            │ ioctl        │ fabrics +   │ scripted    │
//!            │ passthrough  │ /dev/nvmeN  │ device      │
//!            └──────────────┴─────────────┴─────────────┘
//!                           │
//!                  ChannelWorker (one thread per channel)
//! ```
//!
//! The mock variant exists only in tests and with the `mock` feature.
//!
//! Channels never retry and never queue; the [`ChannelWorker`] serializes
//! async callers onto the blocking channel.

#[cfg(target_os = "linux")]
pub mod chardev;
pub mod fabrics;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod worker;

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::{Completion, CommandSet, DataBuffer, DataDirection, SubmissionEntry};
use crate::error::{Error, Result};

pub use fabrics::{build_options, FabricsConfig};
#[cfg(any(test, feature = "mock"))]
pub use mock::{Fault, MockChannel, MockConnector, MockDevice, OpenFault};
pub use worker::{ChannelWorker, CommandIssuer, CommandOutcome, DirectIssuer};

// =============================================================================
// Configuration
// =============================================================================

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Timeout for admin commands (kernel default admin timeout)
    pub admin_timeout: Duration,
    /// Timeout for I/O commands
    pub io_timeout: Duration,
    /// Extra time the worker waits past the command timeout before faulting
    pub watchdog_grace: Duration,
    /// Take an exclusive advisory lock on local character devices
    pub exclusive: bool,
    /// Fabrics control device
    pub fabrics_device: PathBuf,
    /// Directory holding `nvmeN` character devices
    pub dev_dir: PathBuf,
    /// sysfs class directory for NVMe controllers
    pub sysfs_root: PathBuf,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            admin_timeout: Duration::from_secs(60),
            io_timeout: Duration::from_secs(30),
            watchdog_grace: Duration::from_secs(5),
            exclusive: true,
            fabrics_device: PathBuf::from("/dev/nvme-fabrics"),
            dev_dir: PathBuf::from("/dev"),
            sysfs_root: PathBuf::from("/sys/class/nvme"),
        }
    }
}

impl TransportConfig {
    pub fn timeout_for(&self, set: CommandSet) -> Duration {
        match set {
            CommandSet::Admin => self.admin_timeout,
            CommandSet::Io => self.io_timeout,
        }
    }
}

// =============================================================================
// Addresses and targets
// =============================================================================

/// Transport variant of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    Pcie,
    Fabrics,
    #[cfg(any(test, feature = "mock"))]
    Mock,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Pcie => write!(f, "pcie"),
            TransportKind::Fabrics => write!(f, "fabrics"),
            #[cfg(any(test, feature = "mock"))]
            TransportKind::Mock => write!(f, "mock"),
        }
    }
}

/// Where a controller lives, independent of its kernel instance number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ControllerAddress {
    Pcie {
        device: PathBuf,
    },
    Fabrics {
        transport: String,
        traddr: Option<String>,
        trsvcid: Option<String>,
        host_traddr: Option<String>,
    },
    #[cfg(any(test, feature = "mock"))]
    Mock {
        name: String,
    },
}

impl ControllerAddress {
    pub fn kind(&self) -> TransportKind {
        match self {
            ControllerAddress::Pcie { .. } => TransportKind::Pcie,
            ControllerAddress::Fabrics { .. } => TransportKind::Fabrics,
            #[cfg(any(test, feature = "mock"))]
            ControllerAddress::Mock { .. } => TransportKind::Mock,
        }
    }
}

impl fmt::Display for ControllerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerAddress::Pcie { device } => write!(f, "pcie:{}", device.display()),
            ControllerAddress::Fabrics {
                transport,
                traddr,
                trsvcid,
                host_traddr,
            } => {
                write!(f, "{}:{}", transport, traddr.as_deref().unwrap_or("-"))?;
                if let Some(svc) = trsvcid {
                    write!(f, ":{}", svc)?;
                }
                if let Some(host) = host_traddr {
                    write!(f, "@{}", host)?;
                }
                Ok(())
            }
            #[cfg(any(test, feature = "mock"))]
            ControllerAddress::Mock { name } => write!(f, "mock:{}", name),
        }
    }
}

/// What `connect` is asked to reach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConnectTarget {
    /// An already-bound local controller character device
    Pcie { device: PathBuf },
    /// A fabrics controller created through the kernel fabrics device
    Fabrics(FabricsConfig),
    /// A [`MockDevice`] registered with a [`MockConnector`]
    #[cfg(any(test, feature = "mock"))]
    Mock { name: String },
}

impl ConnectTarget {
    pub fn address(&self) -> ControllerAddress {
        match self {
            ConnectTarget::Pcie { device } => ControllerAddress::Pcie {
                device: device.clone(),
            },
            ConnectTarget::Fabrics(cfg) => ControllerAddress::Fabrics {
                transport: cfg.transport.clone(),
                traddr: cfg.traddr.clone(),
                trsvcid: cfg.trsvcid.clone(),
                host_traddr: cfg.host_traddr.clone(),
            },
            #[cfg(any(test, feature = "mock"))]
            ConnectTarget::Mock { name } => ControllerAddress::Mock { name: name.clone() },
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.address().kind()
    }
}

// =============================================================================
// Data transfer
// =============================================================================

/// Data phase of a single command.
#[derive(Debug)]
pub enum DataTransfer<'a> {
    None,
    /// Controller to host
    Read(&'a mut DataBuffer),
    /// Host to controller
    Write(&'a DataBuffer),
}

impl DataTransfer<'_> {
    pub fn len(&self) -> usize {
        match self {
            DataTransfer::None => 0,
            DataTransfer::Read(buf) => buf.len(),
            DataTransfer::Write(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reject a buffer whose direction contradicts the opcode.
    pub fn check(&self, sqe: &SubmissionEntry) -> Result<()> {
        let ok = match (sqe.data_direction(), self) {
            (_, DataTransfer::None) => true,
            (DataDirection::Bidirectional, _) => true,
            (DataDirection::ControllerToHost, DataTransfer::Read(_)) => true,
            (DataDirection::HostToController, DataTransfer::Write(_)) => true,
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "opcode {:#04x} transfers {:?}, buffer given for the other direction",
                sqe.opcode,
                sqe.data_direction()
            )))
        }
    }
}

// =============================================================================
// Transport trait
// =============================================================================

/// Blocking, single-command-at-a-time access to one controller.
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Human-readable description of the endpoint (device path or address).
    fn target(&self) -> String;

    /// Kernel controller instance (`N` in `/dev/nvmeN`), once known.
    fn instance(&self) -> Option<u32>;

    /// Transport-specific connect step. For fabrics this creates the kernel
    /// controller; for local devices it is a no-op.
    fn establish(&mut self) -> Result<()>;

    fn submit(
        &mut self,
        set: CommandSet,
        sqe: &SubmissionEntry,
        data: DataTransfer<'_>,
        timeout: Duration,
    ) -> Result<Completion>;

    /// Release the handle. Calling it again is a no-op.
    fn close(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;
}

/// The closed set of channel variants.
#[derive(Debug)]
pub enum Channel {
    #[cfg(target_os = "linux")]
    Pcie(chardev::CharDevice),
    #[cfg(target_os = "linux")]
    Fabrics(fabrics::FabricsChannel),
    #[cfg(any(test, feature = "mock"))]
    Mock(MockChannel),
}

macro_rules! dispatch {
    ($self:ident, $ch:ident => $body:expr) => {
        match $self {
            #[cfg(target_os = "linux")]
            Channel::Pcie($ch) => $body,
            #[cfg(target_os = "linux")]
            Channel::Fabrics($ch) => $body,
            #[cfg(any(test, feature = "mock"))]
            Channel::Mock($ch) => $body,
        }
    };
}

impl Transport for Channel {
    fn kind(&self) -> TransportKind {
        dispatch!(self, ch => ch.kind())
    }

    fn target(&self) -> String {
        dispatch!(self, ch => ch.target())
    }

    fn instance(&self) -> Option<u32> {
        dispatch!(self, ch => ch.instance())
    }

    fn establish(&mut self) -> Result<()> {
        dispatch!(self, ch => ch.establish())
    }

    fn submit(
        &mut self,
        set: CommandSet,
        sqe: &SubmissionEntry,
        data: DataTransfer<'_>,
        timeout: Duration,
    ) -> Result<Completion> {
        data.check(sqe)?;
        dispatch!(self, ch => ch.submit(set, sqe, data, timeout))
    }

    fn close(&mut self) -> Result<()> {
        dispatch!(self, ch => ch.close())
    }

    fn is_open(&self) -> bool {
        dispatch!(self, ch => ch.is_open())
    }
}

// =============================================================================
// Handle accounting
// =============================================================================

/// Counts open device handles so leaks are observable.
#[derive(Debug, Clone, Default)]
pub struct HandleTracker {
    open: Arc<AtomicUsize>,
}

impl HandleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one open handle until the returned guard is dropped.
    pub fn acquire(&self) -> HandleGuard {
        self.open.fetch_add(1, Ordering::SeqCst);
        HandleGuard {
            open: self.open.clone(),
        }
    }

    pub fn open_handles(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

/// One open handle; decrements the tracker on drop.
#[derive(Debug)]
pub struct HandleGuard {
    open: Arc<AtomicUsize>,
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Connector
// =============================================================================

/// Opens channels for connect targets. Called from blocking context.
pub trait Connector: Send + Sync {
    fn open(&self, subsystem_nqn: &str, target: &ConnectTarget) -> Result<Channel>;

    fn handles(&self) -> &HandleTracker;
}

/// Opens real kernel devices.
#[derive(Debug, Clone)]
pub struct SystemConnector {
    config: TransportConfig,
    tracker: HandleTracker,
}

impl SystemConnector {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            tracker: HandleTracker::new(),
        }
    }
}

impl Connector for SystemConnector {
    #[cfg(target_os = "linux")]
    fn open(&self, subsystem_nqn: &str, target: &ConnectTarget) -> Result<Channel> {
        match target {
            ConnectTarget::Pcie { device } => Ok(Channel::Pcie(chardev::CharDevice::open(
                device,
                self.config.exclusive,
                &self.tracker,
            )?)),
            ConnectTarget::Fabrics(cfg) => Ok(Channel::Fabrics(fabrics::FabricsChannel::new(
                subsystem_nqn,
                cfg.clone(),
                &self.config,
                self.tracker.clone(),
            )?)),
            #[cfg(any(test, feature = "mock"))]
            ConnectTarget::Mock { name } => Err(Error::InvalidArgument(format!(
                "mock target {} needs a MockConnector",
                name
            ))),
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn open(&self, _subsystem_nqn: &str, target: &ConnectTarget) -> Result<Channel> {
        Err(Error::NotFound {
            path: target.address().to_string(),
        })
    }

    fn handles(&self) -> &HandleTracker {
        &self.tracker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Command;

    #[test]
    fn test_handle_tracker_counts_guards() {
        let tracker = HandleTracker::new();
        let a = tracker.acquire();
        let b = tracker.acquire();
        assert_eq!(tracker.open_handles(), 2);
        drop(a);
        assert_eq!(tracker.open_handles(), 1);
        drop(b);
        assert_eq!(tracker.open_handles(), 0);
    }

    #[test]
    fn test_data_direction_check() {
        let identify = Command::identify_controller().encode().unwrap();
        let mut buf = DataBuffer::new(4096).unwrap();
        assert!(DataTransfer::Read(&mut buf).check(&identify).is_ok());
        assert!(DataTransfer::Write(&buf).check(&identify).is_err());

        let keep_alive = Command::KeepAlive.encode().unwrap();
        assert!(DataTransfer::None.check(&keep_alive).is_ok());
        assert!(DataTransfer::Write(&buf).check(&keep_alive).is_err());
    }

    #[test]
    fn test_address_display() {
        let addr = ConnectTarget::Fabrics(FabricsConfig {
            traddr: Some("10.0.0.1".into()),
            trsvcid: Some("4420".into()),
            ..FabricsConfig::new("tcp")
        })
        .address();
        assert_eq!(addr.to_string(), "tcp:10.0.0.1:4420");
        assert_eq!(addr.kind(), TransportKind::Fabrics);

        let addr = ConnectTarget::Pcie {
            device: PathBuf::from("/dev/nvme0"),
        }
        .address();
        assert_eq!(addr.to_string(), "pcie:/dev/nvme0");
    }
}
