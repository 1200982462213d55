//! Topology entities and their identity keys.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::{ControllerInfo, NamespaceInfo, NvmeVersion, NQN_MAX_LEN};
use crate::error::{Error, Result};
use crate::transport::ControllerAddress;

// =============================================================================
// Handles
// =============================================================================

macro_rules! handle {
    ($name:ident, $prefix:literal) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub(crate) u64);

        impl $name {
            pub fn raw(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

handle!(SubsystemId, "subsystem");
handle!(ControllerId, "controller");
handle!(NamespaceId, "namespace");

/// Check an NQN is non-empty, at most 223 bytes and free of NUL and commas.
pub fn validate_nqn(nqn: &str) -> Result<()> {
    if nqn.is_empty() || nqn.len() > NQN_MAX_LEN {
        return Err(Error::InvalidArgument(format!(
            "NQN must be 1-{} bytes, got {}",
            NQN_MAX_LEN,
            nqn.len()
        )));
    }
    if nqn.contains('\0') || nqn.contains(',') {
        return Err(Error::InvalidArgument(format!(
            "NQN {:?} contains a forbidden character",
            nqn
        )));
    }
    Ok(())
}

// =============================================================================
// Host
// =============================================================================

/// Root of a topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub nqn: String,
    pub id: Uuid,
    pub name: String,
}

impl Host {
    pub fn new(nqn: impl Into<String>, id: Uuid, name: impl Into<String>) -> Result<Self> {
        let nqn = nqn.into();
        validate_nqn(&nqn)?;
        Ok(Self {
            nqn,
            id,
            name: name.into(),
        })
    }
}

// =============================================================================
// States
// =============================================================================

/// How complete an entity's data is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityStatus {
    /// Fully identified
    Active,
    /// Last refresh could not identify it
    Incomplete,
    /// Gone; excised when the diff reporting it is acknowledged
    Removed,
}

impl EntityStatus {
    pub fn is_removed(&self) -> bool {
        matches!(self, EntityStatus::Removed)
    }
}

/// Connection state of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControllerState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ControllerState {
    /// ```text
    /// Disconnected ──► Connecting ──► Connected ──► Disconnecting
    ///      ▲               │              │               │
    ///      └───────────────┴──────────────┴───────────────┘
    /// ```
    pub fn can_transition_to(&self, next: ControllerState) -> bool {
        use ControllerState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnecting)
                | (Connected, Disconnected)
                | (Disconnecting, Disconnected)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerState::Disconnected => "disconnected",
            ControllerState::Connecting => "connecting",
            ControllerState::Connected => "connected",
            ControllerState::Disconnecting => "disconnecting",
        }
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Entities
// =============================================================================

/// Identity of a controller across the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ControllerKey {
    pub address: ControllerAddress,
    /// Kernel instance (`nvmeN`); may change across reconnects
    pub instance: Option<u32>,
}

impl ControllerKey {
    pub fn new(address: ControllerAddress, instance: Option<u32>) -> Self {
        Self { address, instance }
    }
}

impl fmt::Display for ControllerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.instance {
            Some(n) => write!(f, "{}/nvme{}", self.address, n),
            None => write!(f, "{}", self.address),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subsystem {
    pub id: SubsystemId,
    pub nqn: String,
    pub status: EntityStatus,
    pub controllers: Vec<ControllerId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Controller {
    pub id: ControllerId,
    pub subsystem: SubsystemId,
    pub key: ControllerKey,
    pub state: ControllerState,
    pub status: EntityStatus,
    pub serial: Option<String>,
    pub model: Option<String>,
    pub firmware: Option<String>,
    pub version: Option<NvmeVersion>,
    pub cntlid: Option<u16>,
    /// Consecutive refreshes that failed to identify this controller
    pub failed_refreshes: u32,
    pub namespaces: Vec<NamespaceId>,
}

impl Controller {
    pub(crate) fn new(
        id: ControllerId,
        subsystem: SubsystemId,
        key: ControllerKey,
        state: ControllerState,
    ) -> Self {
        Self {
            id,
            subsystem,
            key,
            state,
            status: EntityStatus::Incomplete,
            serial: None,
            model: None,
            firmware: None,
            version: None,
            cntlid: None,
            failed_refreshes: 0,
            namespaces: Vec::new(),
        }
    }

    /// Copy Identify attributes in; returns whether anything changed.
    pub(crate) fn apply_info(&mut self, info: &ControllerInfo) -> bool {
        let before = (
            self.serial.clone(),
            self.model.clone(),
            self.firmware.clone(),
            self.version,
            self.cntlid,
            self.status,
        );
        self.serial = Some(info.serial.clone());
        self.model = Some(info.model.clone());
        self.firmware = Some(info.firmware.clone());
        self.version = Some(info.version);
        self.cntlid = Some(info.cntlid);
        self.status = EntityStatus::Active;
        self.failed_refreshes = 0;
        before
            != (
                self.serial.clone(),
                self.model.clone(),
                self.firmware.clone(),
                self.version,
                self.cntlid,
                self.status,
            )
    }

    pub fn is_connected(&self) -> bool {
        self.state == ControllerState::Connected
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub id: NamespaceId,
    pub controller: ControllerId,
    pub nsid: u32,
    pub status: EntityStatus,
    /// Size in logical blocks
    pub size: u64,
    /// Capacity in logical blocks
    pub capacity: u64,
    /// Utilization in logical blocks
    pub utilization: u64,
    pub lba_data_size: u64,
    pub metadata_size: u16,
    pub uuid: Option<Uuid>,
    pub eui64: Option<[u8; 8]>,
    pub nguid: Option<[u8; 16]>,
}

impl Namespace {
    pub(crate) fn new(id: NamespaceId, controller: ControllerId, info: &NamespaceInfo) -> Self {
        let mut ns = Self {
            id,
            controller,
            nsid: info.nsid,
            status: EntityStatus::Active,
            size: 0,
            capacity: 0,
            utilization: 0,
            lba_data_size: 0,
            metadata_size: 0,
            uuid: None,
            eui64: None,
            nguid: None,
        };
        ns.apply_info(info);
        ns
    }

    /// Copy Identify attributes in; returns whether anything changed.
    pub(crate) fn apply_info(&mut self, info: &NamespaceInfo) -> bool {
        let before = self.clone();
        self.size = info.nsze;
        self.capacity = info.ncap;
        self.utilization = info.nuse;
        self.lba_data_size = info.lba_data_size();
        self.metadata_size = info.metadata_size();
        self.uuid = info.uuid;
        self.eui64 = info.eui64;
        self.nguid = info.nguid;
        self.status = EntityStatus::Active;
        before != *self
    }

    pub fn size_bytes(&self) -> u64 {
        self.size.saturating_mul(self.lba_data_size)
    }
}
