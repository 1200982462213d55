//! nvmekit - NVMe Device Management Core
//!
//! Discovers local and fabrics-attached NVMe controllers, keeps a live model
//! of what the host can reach, and passes commands through to the devices.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           Orchestrator                            │
//! │   connect / disconnect / reconnect / refresh / command passthru   │
//! ├───────────────────┬────────────────────┬─────────────────────────┤
//! │  IdentifyEngine   │     Topology       │      ConfigStore         │
//! │  (discovery)      │  (arena + diffs)   │      (persist)           │
//! ├───────────────────┴────────────────────┴─────────────────────────┤
//! │                 ChannelWorker (one thread per channel)            │
//! ├──────────────────────────────────────────────────────────────────┤
//! │   Channel: CharDevice (/dev/nvmeN) │ FabricsChannel │ [MockChannel]│
//! ├──────────────────────────────────────────────────────────────────┤
//! │          codec: SQE / CQE / status / Identify / discovery log     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`codec`] - Wire formats of commands, completions and data structures
//! - [`discovery`] - Identify sequence, discovery log, host identity, sysfs scan
//! - [`error`] - Error types
//! - [`metrics`] - Prometheus metrics
//! - [`orchestrator`] - Connect/disconnect lifecycle
//! - [`persist`] - Persisted configuration
//! - [`topology`] - Host/Subsystem/Controller/Namespace model
//! - [`transport`] - Device channels and the worker that drives them
//!
//! # Features
//!
//! - `mock` - In-memory scripted devices (`transport::mock`) for testing
//!   code built on this crate

pub mod codec;
pub mod discovery;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod persist;
pub mod topology;
pub mod transport;

// Re-export commonly used types
pub use codec::{Command, CommandSet, DataBuffer, Status, StatusKind};
pub use discovery::{DiscoveredController, HostIdentity, IdentifyEngine};
pub use error::{Error, Result};
pub use metrics::NvmeMetrics;
pub use orchestrator::{ConnectReport, Orchestrator, OrchestratorConfig};
pub use persist::{ConfigStore, JsonFileConfigStore, MemoryConfigStore};
pub use topology::{ControllerId, ControllerState, NamespaceId, SubsystemId, Topology, TopologyDiff};
pub use transport::{ConnectTarget, Connector, FabricsConfig, SystemConnector, TransportConfig};
