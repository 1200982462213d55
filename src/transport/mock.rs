//! Scripted in-memory controller used as the library's test double.
//!
//! A [`MockDevice`] answers Identify, Get Log Page (discovery), features,
//! Keep Alive and NVM Read/Write/Flush from in-memory state, and can be told
//! to fail specific commands or opens. [`MockConnector`] hands out
//! [`MockChannel`]s bound to registered devices, counting handles exactly like
//! the system connector does.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{
    Channel, ConnectTarget, Connector, DataTransfer, HandleGuard, HandleTracker, Transport,
    TransportKind,
};
use crate::codec::discovery_log::DISCOVERY_LOG_HEADER_SIZE;
use crate::codec::identify::{encode_descriptor_list, encode_nsid_list, ACTIVE_NSID_PAGE_ENTRIES};
use crate::codec::{
    AdminOpcode, Cns, Command, CommandSet, Completion, ConnectCommand, ConnectData,
    ControllerInfo, ControllerType, DiscoveryLog, IoOpcode, LbaFormat, LogPageId,
    NamespaceDescriptor, NamespaceInfo, NvmeVersion, Status, StatusType, SubmissionEntry,
    DYNAMIC_CNTLID, FABRICS_OPCODE,
};
use crate::error::{Error, Result};

/// What an injected failure does.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Complete with this status
    Status(Status),
    /// Fail as if the kernel timed the command out
    Timeout,
    /// Drop the link; every later command also fails
    TransportLost,
    /// Block for this long, then complete normally
    Hang(Duration),
}

/// Failure when opening a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFault {
    NotFound,
    PermissionDenied,
    AlreadyInUse,
    TransportLost,
}

impl OpenFault {
    fn to_error(self, name: &str) -> Error {
        let path = format!("mock:{}", name);
        match self {
            OpenFault::NotFound => Error::NotFound { path },
            OpenFault::PermissionDenied => Error::PermissionDenied { path },
            OpenFault::AlreadyInUse => Error::AlreadyInUse { path },
            OpenFault::TransportLost => Error::TransportLost {
                reason: format!("{} unreachable", path),
            },
        }
    }
}

/// Matches commands by opcode (and optionally CNS / NSID).
#[derive(Debug, Clone)]
pub struct FaultRule {
    pub opcode: u8,
    pub cns: Option<Cns>,
    pub nsid: Option<u32>,
    pub fault: Fault,
    /// Remaining hits; `None` fires forever
    pub remaining: Option<usize>,
}

impl FaultRule {
    pub fn new(opcode: u8, fault: Fault) -> Self {
        Self {
            opcode,
            cns: None,
            nsid: None,
            fault,
            remaining: None,
        }
    }

    pub fn cns(mut self, cns: Cns) -> Self {
        self.cns = Some(cns);
        self
    }

    pub fn nsid(mut self, nsid: u32) -> Self {
        self.nsid = Some(nsid);
        self
    }

    pub fn times(mut self, n: usize) -> Self {
        self.remaining = Some(n);
        self
    }

    fn matches(&self, sqe: &SubmissionEntry) -> bool {
        self.opcode == sqe.opcode
            && self.cns.map_or(true, |c| (sqe.cdw10 & 0xFF) as u8 == c as u8)
            && self.nsid.map_or(true, |n| n == sqe.nsid)
            && self.remaining != Some(0)
    }
}

#[derive(Debug)]
struct MockState {
    controller: ControllerInfo,
    namespaces: BTreeMap<u32, NamespaceInfo>,
    descriptors: BTreeMap<u32, Vec<NamespaceDescriptor>>,
    features: HashMap<u8, u32>,
    blocks: HashMap<(u32, u64), Vec<u8>>,
    discovery_log: Option<DiscoveryLog>,
    generation_bumps: usize,
    faults: Vec<FaultRule>,
    open_faults: VecDeque<OpenFault>,
    lost: bool,
    history: Vec<SubmissionEntry>,
    last_host_nqn: Option<String>,
}

impl MockState {
    fn take_fault(&mut self, sqe: &SubmissionEntry) -> Option<Fault> {
        let rule = self.faults.iter_mut().find(|r| r.matches(sqe))?;
        if let Some(n) = rule.remaining.as_mut() {
            *n -= 1;
        }
        Some(rule.fault.clone())
    }
}

fn status(sct: StatusType, sc: u8) -> Error {
    Error::DeviceError {
        status: Status::new(sct, sc).with_dnr(true),
    }
}

fn copy_out(data: &mut DataTransfer<'_>, page: &[u8]) -> Result<()> {
    match data {
        DataTransfer::Read(buf) => {
            let n = buf.len().min(page.len());
            buf[..n].copy_from_slice(&page[..n]);
            if n < buf.len() {
                buf[n..].fill(0);
            }
            Ok(())
        }
        _ => Err(status(StatusType::Generic, 0x02)),
    }
}

/// Scripted controller state, shared between the test and its channels.
#[derive(Debug, Clone)]
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
}

impl MockDevice {
    pub fn new(subsystem_nqn: &str, serial: &str) -> Self {
        let controller = ControllerInfo {
            vid: 0x1B36,
            ssvid: 0x1AF4,
            serial: serial.to_string(),
            model: "nvmekit mock controller".into(),
            firmware: "1.0".into(),
            mdts: 7,
            cntlid: 1,
            version: NvmeVersion::new(1, 4, 0),
            controller_type: ControllerType::Io,
            oacs: 0x000A,
            nn: 256,
            oncs: 0x0015,
            subnqn: subsystem_nqn.to_string(),
            ioccsz: 0,
            iorcsz: 0,
            raw: Default::default(),
        };

        Self {
            state: Arc::new(Mutex::new(MockState {
                controller,
                namespaces: BTreeMap::new(),
                descriptors: BTreeMap::new(),
                features: HashMap::new(),
                blocks: HashMap::new(),
                discovery_log: None,
                generation_bumps: 0,
                faults: Vec::new(),
                open_faults: VecDeque::new(),
                lost: false,
                history: Vec::new(),
                last_host_nqn: None,
            })),
        }
    }

    /// A 512-byte-block namespace with identifiers derived from its NSID.
    pub fn namespace_info(nsid: u32, blocks: u64) -> NamespaceInfo {
        let id = nsid.to_be_bytes();
        let mut nguid = [0u8; 16];
        nguid[..4].copy_from_slice(&id);
        nguid[15] = 0xA5;
        let mut eui64 = [0u8; 8];
        eui64[4..].copy_from_slice(&id);
        eui64[0] = 0x5C;

        NamespaceInfo {
            nsid,
            nsze: blocks,
            ncap: blocks,
            nuse: 0,
            nsfeat: 0,
            nlbaf: 1,
            flbas: 0,
            nmic: 0,
            lba_formats: vec![
                LbaFormat {
                    ms: 0,
                    lbads: 9,
                    rp: 0,
                },
                LbaFormat {
                    ms: 0,
                    lbads: 12,
                    rp: 0,
                },
            ],
            nguid: Some(nguid),
            eui64: Some(eui64),
            uuid: None,
            csi: None,
        }
    }

    pub fn with_namespace(self, nsid: u32, blocks: u64) -> Self {
        self.add_namespace(nsid, blocks);
        self
    }

    pub fn add_namespace(&self, nsid: u32, blocks: u64) {
        let uuid = Uuid::from_u128(0x6e76_6d65_6b69_7400_0000_0000_0000_0000 | nsid as u128);
        self.set_namespace(Self::namespace_info(nsid, blocks));
        self.state.lock().descriptors.insert(
            nsid,
            vec![NamespaceDescriptor::Uuid(uuid), NamespaceDescriptor::Csi(0)],
        );
    }

    pub fn set_namespace(&self, info: NamespaceInfo) {
        self.state.lock().namespaces.insert(info.nsid, info);
    }

    pub fn remove_namespace(&self, nsid: u32) {
        let mut st = self.state.lock();
        st.namespaces.remove(&nsid);
        st.descriptors.remove(&nsid);
        st.blocks.retain(|(n, _), _| *n != nsid);
    }

    pub fn resize_namespace(&self, nsid: u32, blocks: u64) {
        if let Some(ns) = self.state.lock().namespaces.get_mut(&nsid) {
            ns.nsze = blocks;
            ns.ncap = blocks;
        }
    }

    pub fn update_controller(&self, f: impl FnOnce(&mut ControllerInfo)) {
        f(&mut self.state.lock().controller);
    }

    pub fn controller_info(&self) -> ControllerInfo {
        self.state.lock().controller.clone()
    }

    pub fn subsystem_nqn(&self) -> String {
        self.state.lock().controller.subnqn.clone()
    }

    pub fn set_discovery_log(&self, log: DiscoveryLog) {
        self.state.lock().discovery_log = Some(log);
    }

    /// Increment the discovery generation counter after each of the next `n`
    /// full log reads.
    pub fn bump_generation(&self, n: usize) {
        self.state.lock().generation_bumps = n;
    }

    pub fn inject(&self, rule: FaultRule) {
        self.state.lock().faults.push(rule);
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// Fail the next open with this fault.
    pub fn fail_open(&self, fault: OpenFault) {
        self.state.lock().open_faults.push_back(fault);
    }

    pub fn set_lost(&self, lost: bool) {
        self.state.lock().lost = lost;
    }

    pub fn is_lost(&self) -> bool {
        self.state.lock().lost
    }

    /// Every command submitted so far, in order.
    pub fn commands(&self) -> Vec<SubmissionEntry> {
        self.state.lock().history.clone()
    }

    pub fn count_commands(&self, opcode: u8) -> usize {
        self.state
            .lock()
            .history
            .iter()
            .filter(|s| s.opcode == opcode)
            .count()
    }

    pub fn last_host_nqn(&self) -> Option<String> {
        self.state.lock().last_host_nqn.clone()
    }

    fn take_open_fault(&self) -> Option<OpenFault> {
        self.state.lock().open_faults.pop_front()
    }

    /// Run one command against the device state.
    fn execute(
        &self,
        set: CommandSet,
        sqe: &SubmissionEntry,
        mut data: DataTransfer<'_>,
        timeout: Duration,
    ) -> Result<Completion> {
        let fault = {
            let mut st = self.state.lock();
            st.history.push(*sqe);
            if st.lost {
                return Err(Error::TransportLost {
                    reason: "mock link down".into(),
                });
            }
            st.take_fault(sqe)
        };

        match fault {
            Some(Fault::Status(s)) => return Err(Error::DeviceError { status: s }),
            Some(Fault::Timeout) => {
                return Err(Error::Timeout {
                    opcode: sqe.opcode,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            Some(Fault::TransportLost) => {
                self.state.lock().lost = true;
                return Err(Error::TransportLost {
                    reason: "mock link dropped".into(),
                });
            }
            Some(Fault::Hang(d)) => std::thread::sleep(d),
            None => {}
        }

        let mut st = self.state.lock();
        match set {
            CommandSet::Admin => st.admin(sqe, &mut data),
            CommandSet::Io => st.io(sqe, &mut data),
        }
    }

    /// Validate a Fabrics Connect exactly as a target would.
    fn connect(&self, sqe: &SubmissionEntry, data: &[u8]) -> Result<u16> {
        let fault = {
            let mut st = self.state.lock();
            st.history.push(*sqe);
            if st.lost {
                return Err(Error::TransportLost {
                    reason: "mock target unreachable".into(),
                });
            }
            st.take_fault(sqe)
        };
        if let Some(Fault::Status(s)) = fault {
            return Err(Error::DeviceError { status: s });
        }
        if let Some(Fault::TransportLost | Fault::Timeout) = fault {
            return Err(Error::TransportLost {
                reason: "mock connect dropped".into(),
            });
        }

        let mut st = self.state.lock();
        if sqe.fctype() != Some(crate::codec::command::FCTYPE_CONNECT) {
            return Err(status(StatusType::Generic, 0x02));
        }
        let request = ConnectData::decode(data)?;
        if request.subsystem_nqn != st.controller.subnqn {
            // Connect Invalid Parameters
            return Err(status(StatusType::CommandSpecific, 0x82));
        }
        st.last_host_nqn = Some(request.host_nqn);
        Ok(st.controller.cntlid)
    }
}

impl MockState {
    fn admin(&mut self, sqe: &SubmissionEntry, data: &mut DataTransfer<'_>) -> Result<Completion> {
        const IDENTIFY: u8 = AdminOpcode::Identify as u8;
        const GET_LOG_PAGE: u8 = AdminOpcode::GetLogPage as u8;
        const GET_FEATURES: u8 = AdminOpcode::GetFeatures as u8;
        const SET_FEATURES: u8 = AdminOpcode::SetFeatures as u8;
        const KEEP_ALIVE: u8 = AdminOpcode::KeepAlive as u8;

        match sqe.opcode {
            IDENTIFY => self.identify(sqe, data),
            GET_LOG_PAGE => self.get_log_page(sqe, data),
            GET_FEATURES => {
                let fid = (sqe.cdw10 & 0xFF) as u8;
                Ok(Completion::success(
                    self.features.get(&fid).copied().unwrap_or(0),
                ))
            }
            SET_FEATURES => {
                let fid = (sqe.cdw10 & 0xFF) as u8;
                self.features.insert(fid, sqe.cdw11);
                Ok(Completion::success(0))
            }
            KEEP_ALIVE => Ok(Completion::success(0)),
            // Connect on an established queue: Command Sequence Error
            FABRICS_OPCODE => Err(status(StatusType::Generic, 0x0C)),
            _ => Err(status(StatusType::Generic, 0x01)),
        }
    }

    fn identify(&mut self, sqe: &SubmissionEntry, data: &mut DataTransfer<'_>) -> Result<Completion> {
        let cns = (sqe.cdw10 & 0xFF) as u8;
        let page = match cns {
            c if c == Cns::Controller as u8 => self.controller.encode(),
            c if c == Cns::Namespace as u8 => match self.namespaces.get(&sqe.nsid) {
                Some(ns) => ns.encode(),
                None if sqe.nsid == 0 || sqe.nsid > self.controller.nn => {
                    return Err(status(StatusType::Generic, 0x0B))
                }
                // inactive NSID: zero-filled structure
                None => vec![0u8; crate::codec::IDENTIFY_DATA_SIZE],
            },
            c if c == Cns::ActiveNamespaceList as u8 => {
                let ids: Vec<u32> = self
                    .namespaces
                    .range(sqe.nsid.saturating_add(1)..)
                    .map(|(id, _)| *id)
                    .take(ACTIVE_NSID_PAGE_ENTRIES)
                    .collect();
                encode_nsid_list(&ids)
            }
            c if c == Cns::NamespaceDescriptorList as u8 => {
                if self.controller.version < NvmeVersion::V1_3 {
                    return Err(status(StatusType::Generic, 0x02));
                }
                if !self.namespaces.contains_key(&sqe.nsid) {
                    return Err(status(StatusType::Generic, 0x0B));
                }
                let mut descs = self.descriptors.get(&sqe.nsid).cloned().unwrap_or_default();
                if let Some(ns) = self.namespaces.get(&sqe.nsid) {
                    if let Some(eui) = ns.eui64 {
                        descs.insert(0, NamespaceDescriptor::Eui64(eui));
                    }
                }
                encode_descriptor_list(&descs)
            }
            _ => return Err(status(StatusType::Generic, 0x02)),
        };
        copy_out(data, &page)?;
        Ok(Completion::success(0))
    }

    fn get_log_page(&mut self, sqe: &SubmissionEntry, data: &mut DataTransfer<'_>) -> Result<Completion> {
        let lid = (sqe.cdw10 & 0xFF) as u8;
        if lid != LogPageId::Discovery.as_raw() {
            // Invalid Log Page
            return Err(status(StatusType::CommandSpecific, 0x09));
        }
        let log = match self.discovery_log.as_mut() {
            Some(log) => log,
            None => return Err(status(StatusType::CommandSpecific, 0x09)),
        };

        let numd = ((sqe.cdw10 >> 16) | ((sqe.cdw11 & 0xFFFF) << 16)) as usize;
        let len = (numd + 1) * 4;
        let offset = (sqe.cdw12 as u64 | ((sqe.cdw13 as u64) << 32)) as usize;

        let raw = log.encode();
        let mut page = vec![0u8; len];
        if offset < raw.len() {
            let n = (raw.len() - offset).min(len);
            page[..n].copy_from_slice(&raw[offset..offset + n]);
        }

        if len > DISCOVERY_LOG_HEADER_SIZE && self.generation_bumps > 0 {
            self.generation_bumps -= 1;
            log.genctr += 1;
        }

        copy_out(data, &page)?;
        Ok(Completion::success(0))
    }

    fn io(&mut self, sqe: &SubmissionEntry, data: &mut DataTransfer<'_>) -> Result<Completion> {
        let ns = self
            .namespaces
            .get(&sqe.nsid)
            .ok_or_else(|| status(StatusType::Generic, 0x0B))?;

        if sqe.opcode == IoOpcode::Flush as u8 {
            return Ok(Completion::success(0));
        }

        let bs = match ns.lba_data_size() {
            0 => 512,
            n => n as usize,
        };
        let slba = sqe.cdw10 as u64 | ((sqe.cdw11 as u64) << 32);
        let nlb = (sqe.cdw12 & 0xFFFF) as u64 + 1;
        if slba.saturating_add(nlb) > ns.nsze {
            // LBA Out of Range
            return Err(status(StatusType::Generic, 0x80));
        }
        if data.len() < nlb as usize * bs {
            // Data SGL Length Invalid
            return Err(status(StatusType::Generic, 0x0F));
        }

        let nsid = sqe.nsid;
        match (sqe.opcode, data) {
            (op, DataTransfer::Read(buf)) if op == IoOpcode::Read as u8 => {
                for i in 0..nlb {
                    let dst = &mut buf[i as usize * bs..(i as usize + 1) * bs];
                    match self.blocks.get(&(nsid, slba + i)) {
                        Some(block) => dst.copy_from_slice(block),
                        None => dst.fill(0),
                    }
                }
                Ok(Completion::success(0))
            }
            (op, DataTransfer::Write(buf)) if op == IoOpcode::Write as u8 => {
                for i in 0..nlb {
                    let src = &buf[i as usize * bs..(i as usize + 1) * bs];
                    self.blocks.insert((nsid, slba + i), src.to_vec());
                }
                Ok(Completion::success(0))
            }
            _ => Err(status(StatusType::Generic, 0x01)),
        }
    }
}

// =============================================================================
// Channel
// =============================================================================

/// A channel bound to a [`MockDevice`].
#[derive(Debug)]
pub struct MockChannel {
    name: String,
    device: MockDevice,
    subsystem_nqn: String,
    host_nqn: String,
    host_id: Uuid,
    instance: u32,
    guard: Option<HandleGuard>,
    established: bool,
}

impl MockChannel {
    pub fn device(&self) -> &MockDevice {
        &self.device
    }
}

impl Transport for MockChannel {
    fn kind(&self) -> TransportKind {
        TransportKind::Mock
    }

    fn target(&self) -> String {
        format!("mock:{}", self.name)
    }

    fn instance(&self) -> Option<u32> {
        Some(self.instance)
    }

    /// Perform the Fabrics Connect handshake against the device.
    fn establish(&mut self) -> Result<()> {
        if self.established {
            return Ok(());
        }
        if self.guard.is_none() {
            return Err(Error::TransportLost {
                reason: format!("{} is closed", self.target()),
            });
        }

        let sqe = Command::FabricsConnect(ConnectCommand::default()).encode()?;
        let data = ConnectData {
            host_id: *self.host_id.as_bytes(),
            cntlid: DYNAMIC_CNTLID,
            subsystem_nqn: self.subsystem_nqn.clone(),
            host_nqn: self.host_nqn.clone(),
        }
        .encode()?;

        self.device.connect(&sqe, &data)?;
        self.established = true;
        Ok(())
    }

    fn submit(
        &mut self,
        set: CommandSet,
        sqe: &SubmissionEntry,
        data: DataTransfer<'_>,
        timeout: Duration,
    ) -> Result<Completion> {
        if self.guard.is_none() {
            return Err(Error::TransportLost {
                reason: format!("{} is closed", self.target()),
            });
        }
        self.device.execute(set, sqe, data, timeout)
    }

    fn close(&mut self) -> Result<()> {
        self.guard = None;
        self.established = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.guard.is_some()
    }
}

// =============================================================================
// Connector
// =============================================================================

/// Hands out channels to registered mock devices.
#[derive(Debug)]
pub struct MockConnector {
    devices: DashMap<String, MockDevice>,
    tracker: HandleTracker,
    next_instance: AtomicU32,
    host_nqn: String,
    host_id: Uuid,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    pub fn new() -> Self {
        let host_id = Uuid::new_v4();
        Self {
            devices: DashMap::new(),
            tracker: HandleTracker::new(),
            next_instance: AtomicU32::new(0),
            host_nqn: format!("nqn.2014-08.org.nvmexpress:uuid:{}", host_id),
            host_id,
        }
    }

    pub fn with_host(mut self, host_nqn: &str, host_id: Uuid) -> Self {
        self.host_nqn = host_nqn.to_string();
        self.host_id = host_id;
        self
    }

    pub fn add_device(&self, name: &str, device: MockDevice) {
        self.devices.insert(name.to_string(), device);
    }

    pub fn remove_device(&self, name: &str) -> Option<MockDevice> {
        self.devices.remove(name).map(|(_, d)| d)
    }

    pub fn device(&self, name: &str) -> Option<MockDevice> {
        self.devices.get(name).map(|d| d.clone())
    }

    pub fn open_handles(&self) -> usize {
        self.tracker.open_handles()
    }

    /// Open a channel directly, bypassing `ConnectTarget`.
    pub fn open_channel(&self, subsystem_nqn: &str, name: &str) -> Result<MockChannel> {
        let device = self.device(name).ok_or_else(|| Error::NotFound {
            path: format!("mock:{}", name),
        })?;
        if let Some(fault) = device.take_open_fault() {
            return Err(fault.to_error(name));
        }

        Ok(MockChannel {
            name: name.to_string(),
            device,
            subsystem_nqn: subsystem_nqn.to_string(),
            host_nqn: self.host_nqn.clone(),
            host_id: self.host_id,
            instance: self.next_instance.fetch_add(1, Ordering::SeqCst),
            guard: Some(self.tracker.acquire()),
            established: false,
        })
    }
}

impl Connector for MockConnector {
    fn open(&self, subsystem_nqn: &str, target: &ConnectTarget) -> Result<Channel> {
        match target {
            ConnectTarget::Mock { name } => Ok(Channel::Mock(self.open_channel(subsystem_nqn, name)?)),
            other => Err(Error::InvalidArgument(format!(
                "mock connector cannot open {}",
                other.address()
            ))),
        }
    }

    fn handles(&self) -> &HandleTracker {
        &self.tracker
    }
}
