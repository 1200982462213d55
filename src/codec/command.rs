//! Submission-side command layouts
//!
//! Two fixed layouts are produced here:
//!
//! ```text
//! SubmissionEntry (64 bytes, NVMe SQE)       PassthruCommand (72 bytes, Linux)
//! ┌──────┬──────────────────────────────┐    ┌──────┬────────────────────────┐
//! │ 0    │ CDW0: opcode | flags | CID   │    │ 0    │ opcode, flags, rsvd1   │
//! │ 4    │ NSID                         │    │ 4    │ nsid                   │
//! │ 8    │ CDW2, CDW3                   │    │ 8    │ cdw2, cdw3             │
//! │ 16   │ MPTR                         │    │ 16   │ metadata (u64)         │
//! │ 24   │ PRP1, PRP2                   │    │ 24   │ addr (u64)             │
//! │ 40   │ CDW10 .. CDW15               │    │ 32   │ metadata_len, data_len │
//! └──────┴──────────────────────────────┘    │ 40   │ cdw10 .. cdw15         │
//!                                            │ 64   │ timeout_ms, result     │
//!                                            └──────┴────────────────────────┘
//! ```
//!
//! All multi-byte fields are little-endian. Builders in [`Command`] are pure:
//! they validate arguments and produce an entry, nothing else.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

/// Size of an NVMe submission queue entry.
pub const SQE_SIZE: usize = 64;

/// Size of `struct nvme_passthru_cmd`.
pub const PASSTHRU_CMD_SIZE: usize = 72;

/// Size of the Fabrics Connect data block.
pub const CONNECT_DATA_SIZE: usize = 1024;

/// Opcode shared by all Fabrics commands.
pub const FABRICS_OPCODE: u8 = 0x7F;

/// Fabrics command type for Connect.
pub const FCTYPE_CONNECT: u8 = 0x01;

/// CNTLID value requesting a dynamically allocated controller.
pub const DYNAMIC_CNTLID: u16 = 0xFFFF;

/// Longest NQN accepted (bytes, excluding the terminator).
pub const NQN_MAX_LEN: usize = 223;

/// Largest block count a single Read/Write can carry (zero-based 16-bit NLB).
pub const MAX_BLOCKS_PER_COMMAND: u32 = 1 << 16;

// =============================================================================
// Opcodes and selectors
// =============================================================================

/// Admin command opcodes used by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AdminOpcode {
    GetLogPage = 0x02,
    Identify = 0x06,
    Abort = 0x08,
    SetFeatures = 0x09,
    GetFeatures = 0x0A,
    AsyncEventRequest = 0x0C,
    KeepAlive = 0x18,
    Fabrics = FABRICS_OPCODE,
}

/// NVM command set I/O opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IoOpcode {
    Flush = 0x00,
    Write = 0x01,
    Read = 0x02,
}

/// Which queue (and ioctl) a command is submitted through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandSet {
    Admin,
    Io,
}

impl std::fmt::Display for CommandSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandSet::Admin => write!(f, "admin"),
            CommandSet::Io => write!(f, "io"),
        }
    }
}

/// Data transfer direction, encoded in opcode bits 1:0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    None,
    HostToController,
    ControllerToHost,
    Bidirectional,
}

impl DataDirection {
    pub fn from_opcode(opcode: u8) -> Self {
        match opcode & 0x3 {
            0 => DataDirection::None,
            1 => DataDirection::HostToController,
            2 => DataDirection::ControllerToHost,
            _ => DataDirection::Bidirectional,
        }
    }
}

/// Identify Controller or Namespace Structure (CNS) values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cns {
    Namespace = 0x00,
    Controller = 0x01,
    ActiveNamespaceList = 0x02,
    NamespaceDescriptorList = 0x03,
}

/// Log page identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogPageId {
    ErrorInformation,
    SmartHealth,
    FirmwareSlot,
    ChangedNamespaceList,
    Discovery,
    Other(u8),
}

impl LogPageId {
    pub fn as_raw(&self) -> u8 {
        match self {
            LogPageId::ErrorInformation => 0x01,
            LogPageId::SmartHealth => 0x02,
            LogPageId::FirmwareSlot => 0x03,
            LogPageId::ChangedNamespaceList => 0x04,
            LogPageId::Discovery => 0x70,
            LogPageId::Other(lid) => *lid,
        }
    }
}

// =============================================================================
// Submission Queue Entry
// =============================================================================

/// A 64-byte NVMe submission queue entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmissionEntry {
    pub opcode: u8,
    /// FUSE in bits 1:0, PSDT in bits 7:6
    pub flags: u8,
    pub cid: u16,
    pub nsid: u32,
    pub cdw2: u32,
    pub cdw3: u32,
    pub mptr: u64,
    pub prp1: u64,
    pub prp2: u64,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

impl SubmissionEntry {
    pub fn new(opcode: u8) -> Self {
        Self {
            opcode,
            ..Default::default()
        }
    }

    pub fn fuse(&self) -> u8 {
        self.flags & 0x3
    }

    pub fn psdt(&self) -> u8 {
        (self.flags >> 6) & 0x3
    }

    pub fn data_direction(&self) -> DataDirection {
        DataDirection::from_opcode(self.opcode)
    }

    /// Fabrics command type, meaningful only for opcode 7Fh.
    pub fn fctype(&self) -> Option<u8> {
        (self.opcode == FABRICS_OPCODE).then_some((self.nsid & 0xFF) as u8)
    }

    pub fn encode(&self) -> [u8; SQE_SIZE] {
        let mut buf = [0u8; SQE_SIZE];
        buf[0] = self.opcode;
        buf[1] = self.flags;
        put_u16(&mut buf, 2, self.cid);
        put_u32(&mut buf, 4, self.nsid);
        put_u32(&mut buf, 8, self.cdw2);
        put_u32(&mut buf, 12, self.cdw3);
        put_u64(&mut buf, 16, self.mptr);
        put_u64(&mut buf, 24, self.prp1);
        put_u64(&mut buf, 32, self.prp2);
        for (i, dw) in self.cdws().iter().enumerate() {
            put_u32(&mut buf, 40 + i * 4, *dw);
        }
        buf
    }

    pub fn decode(buf: &[u8; SQE_SIZE]) -> Self {
        Self {
            opcode: buf[0],
            flags: buf[1],
            cid: get_u16(buf, 2),
            nsid: get_u32(buf, 4),
            cdw2: get_u32(buf, 8),
            cdw3: get_u32(buf, 12),
            mptr: get_u64(buf, 16),
            prp1: get_u64(buf, 24),
            prp2: get_u64(buf, 32),
            cdw10: get_u32(buf, 40),
            cdw11: get_u32(buf, 44),
            cdw12: get_u32(buf, 48),
            cdw13: get_u32(buf, 52),
            cdw14: get_u32(buf, 56),
            cdw15: get_u32(buf, 60),
        }
    }

    fn cdws(&self) -> [u32; 6] {
        [
            self.cdw10, self.cdw11, self.cdw12, self.cdw13, self.cdw14, self.cdw15,
        ]
    }
}

// =============================================================================
// Command builders
// =============================================================================

/// Get Log Page parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPageRequest {
    pub lid: LogPageId,
    pub nsid: u32,
    /// Bytes to transfer; must be a non-zero multiple of 4
    pub len: u32,
    /// Byte offset into the log; must be a multiple of 4
    pub offset: u64,
    pub lsp: u8,
    pub lsi: u16,
    /// Retain Asynchronous Event
    pub rae: bool,
}

impl LogPageRequest {
    pub fn new(lid: LogPageId, len: u32) -> Self {
        Self {
            lid,
            nsid: 0,
            len,
            offset: 0,
            lsp: 0,
            lsi: 0,
            rae: false,
        }
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }
}

/// Fabrics Connect command fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectCommand {
    pub recfmt: u16,
    /// 0 for the admin queue
    pub qid: u16,
    /// Zero-based submission queue size
    pub sqsize: u16,
    pub cattr: u8,
    /// Keep-alive timeout in milliseconds
    pub kato_ms: u32,
}

impl Default for ConnectCommand {
    fn default() -> Self {
        Self {
            recfmt: 0,
            qid: 0,
            sqsize: 31,
            cattr: 0,
            kato_ms: 5_000,
        }
    }
}

/// Typed NVMe commands, encoded into a [`SubmissionEntry`] on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Identify {
        cns: Cns,
        nsid: u32,
        cntid: u16,
        csi: u8,
    },
    GetLogPage(LogPageRequest),
    GetFeatures {
        fid: u8,
        sel: u8,
        nsid: u32,
        cdw11: u32,
    },
    SetFeatures {
        fid: u8,
        nsid: u32,
        value: u32,
        save: bool,
    },
    KeepAlive,
    FabricsConnect(ConnectCommand),
    Flush {
        nsid: u32,
    },
    Read {
        nsid: u32,
        slba: u64,
        blocks: u32,
    },
    Write {
        nsid: u32,
        slba: u64,
        blocks: u32,
    },
}

impl Command {
    pub fn identify_controller() -> Self {
        Command::Identify {
            cns: Cns::Controller,
            nsid: 0,
            cntid: 0,
            csi: 0,
        }
    }

    pub fn identify_namespace(nsid: u32) -> Self {
        Command::Identify {
            cns: Cns::Namespace,
            nsid,
            cntid: 0,
            csi: 0,
        }
    }

    /// Active NSIDs strictly greater than `after`.
    pub fn identify_active_namespaces(after: u32) -> Self {
        Command::Identify {
            cns: Cns::ActiveNamespaceList,
            nsid: after,
            cntid: 0,
            csi: 0,
        }
    }

    pub fn identify_descriptors(nsid: u32) -> Self {
        Command::Identify {
            cns: Cns::NamespaceDescriptorList,
            nsid,
            cntid: 0,
            csi: 0,
        }
    }

    pub fn opcode(&self) -> u8 {
        match self {
            Command::Identify { .. } => AdminOpcode::Identify as u8,
            Command::GetLogPage(_) => AdminOpcode::GetLogPage as u8,
            Command::GetFeatures { .. } => AdminOpcode::GetFeatures as u8,
            Command::SetFeatures { .. } => AdminOpcode::SetFeatures as u8,
            Command::KeepAlive => AdminOpcode::KeepAlive as u8,
            Command::FabricsConnect(_) => AdminOpcode::Fabrics as u8,
            Command::Flush { .. } => IoOpcode::Flush as u8,
            Command::Read { .. } => IoOpcode::Read as u8,
            Command::Write { .. } => IoOpcode::Write as u8,
        }
    }

    pub fn command_set(&self) -> CommandSet {
        match self {
            Command::Flush { .. } | Command::Read { .. } | Command::Write { .. } => CommandSet::Io,
            _ => CommandSet::Admin,
        }
    }

    /// Bytes of data the command moves, when fixed by the command itself.
    pub fn fixed_transfer_len(&self) -> Option<usize> {
        match self {
            Command::Identify { .. } => Some(4096),
            Command::GetLogPage(req) => Some(req.len as usize),
            Command::FabricsConnect(_) => Some(CONNECT_DATA_SIZE),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<SubmissionEntry> {
        let mut sqe = SubmissionEntry::new(self.opcode());

        match *self {
            Command::Identify {
                cns,
                nsid,
                cntid,
                csi,
            } => {
                sqe.nsid = nsid;
                sqe.cdw10 = cns as u32 | ((cntid as u32) << 16);
                sqe.cdw11 = (csi as u32) << 24;
            }
            Command::GetLogPage(req) => {
                if req.len == 0 || req.len % 4 != 0 {
                    return Err(Error::InvalidArgument(format!(
                        "log page length {} must be a non-zero multiple of 4",
                        req.len
                    )));
                }
                if req.offset % 4 != 0 {
                    return Err(Error::InvalidArgument(format!(
                        "log page offset {} must be dword aligned",
                        req.offset
                    )));
                }
                if req.lsp > 0x7F {
                    return Err(Error::InvalidArgument(format!(
                        "log specific field {:#x} exceeds 7 bits",
                        req.lsp
                    )));
                }
                let numd = req.len / 4 - 1;
                sqe.nsid = req.nsid;
                sqe.cdw10 = req.lid.as_raw() as u32
                    | ((req.lsp as u32) << 8)
                    | ((req.rae as u32) << 15)
                    | ((numd & 0xFFFF) << 16);
                sqe.cdw11 = (numd >> 16) | ((req.lsi as u32) << 16);
                sqe.cdw12 = req.offset as u32;
                sqe.cdw13 = (req.offset >> 32) as u32;
            }
            Command::GetFeatures {
                fid,
                sel,
                nsid,
                cdw11,
            } => {
                if sel > 0x7 {
                    return Err(Error::InvalidArgument(format!(
                        "feature select {} exceeds 3 bits",
                        sel
                    )));
                }
                sqe.nsid = nsid;
                sqe.cdw10 = fid as u32 | ((sel as u32) << 8);
                sqe.cdw11 = cdw11;
            }
            Command::SetFeatures {
                fid,
                nsid,
                value,
                save,
            } => {
                sqe.nsid = nsid;
                sqe.cdw10 = fid as u32 | ((save as u32) << 31);
                sqe.cdw11 = value;
            }
            Command::KeepAlive => {}
            Command::FabricsConnect(cmd) => {
                sqe.nsid = FCTYPE_CONNECT as u32;
                sqe.cdw10 = cmd.recfmt as u32 | ((cmd.qid as u32) << 16);
                sqe.cdw11 = cmd.sqsize as u32 | ((cmd.cattr as u32) << 16);
                sqe.cdw12 = cmd.kato_ms;
            }
            Command::Flush { nsid } => {
                sqe.nsid = nsid;
            }
            Command::Read { nsid, slba, blocks } | Command::Write { nsid, slba, blocks } => {
                if blocks == 0 || blocks > MAX_BLOCKS_PER_COMMAND {
                    return Err(Error::InvalidArgument(format!(
                        "block count {} outside 1..={}",
                        blocks, MAX_BLOCKS_PER_COMMAND
                    )));
                }
                sqe.nsid = nsid;
                sqe.cdw10 = slba as u32;
                sqe.cdw11 = (slba >> 32) as u32;
                sqe.cdw12 = blocks - 1;
            }
        }

        Ok(sqe)
    }
}

// =============================================================================
// Fabrics Connect data
// =============================================================================

/// The 1024-byte data block sent with a Fabrics Connect command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectData {
    pub host_id: [u8; 16],
    pub cntlid: u16,
    pub subsystem_nqn: String,
    pub host_nqn: String,
}

impl ConnectData {
    const HOSTID_OFFSET: usize = 0;
    const CNTLID_OFFSET: usize = 16;
    const SUBNQN_OFFSET: usize = 256;
    const HOSTNQN_OFFSET: usize = 512;
    const NQN_FIELD_LEN: usize = 256;

    pub fn encode(&self) -> Result<[u8; CONNECT_DATA_SIZE]> {
        let mut buf = [0u8; CONNECT_DATA_SIZE];
        buf[Self::HOSTID_OFFSET..Self::HOSTID_OFFSET + 16].copy_from_slice(&self.host_id);
        put_u16(&mut buf, Self::CNTLID_OFFSET, self.cntlid);
        put_nqn(&mut buf, Self::SUBNQN_OFFSET, &self.subsystem_nqn)?;
        put_nqn(&mut buf, Self::HOSTNQN_OFFSET, &self.host_nqn)?;
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < CONNECT_DATA_SIZE {
            return Err(Error::Malformed {
                structure: "connect data",
                reason: format!("{} bytes, expected {}", buf.len(), CONNECT_DATA_SIZE),
            });
        }
        let mut host_id = [0u8; 16];
        host_id.copy_from_slice(&buf[Self::HOSTID_OFFSET..Self::HOSTID_OFFSET + 16]);
        Ok(Self {
            host_id,
            cntlid: get_u16(buf, Self::CNTLID_OFFSET),
            subsystem_nqn: fixed_str(&buf[Self::SUBNQN_OFFSET..Self::SUBNQN_OFFSET + Self::NQN_FIELD_LEN]),
            host_nqn: fixed_str(&buf[Self::HOSTNQN_OFFSET..Self::HOSTNQN_OFFSET + Self::NQN_FIELD_LEN]),
        })
    }
}

fn put_nqn(buf: &mut [u8], offset: usize, nqn: &str) -> Result<()> {
    if nqn.len() > NQN_MAX_LEN {
        return Err(Error::InvalidArgument(format!(
            "NQN is {} bytes, limit is {}",
            nqn.len(),
            NQN_MAX_LEN
        )));
    }
    buf[offset..offset + nqn.len()].copy_from_slice(nqn.as_bytes());
    Ok(())
}

// =============================================================================
// Linux passthrough command
// =============================================================================

/// `struct nvme_passthru_cmd` storage, 8-byte aligned for the ioctl.
#[derive(Debug, Clone, Copy)]
#[repr(C, align(8))]
pub struct PassthruBuffer(pub [u8; PASSTHRU_CMD_SIZE]);

impl PassthruBuffer {
    const RESULT_OFFSET: usize = 68;

    /// The `result` field written back by the kernel (completion DW0).
    pub fn result(&self) -> u32 {
        get_u32(&self.0, Self::RESULT_OFFSET)
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.0.as_mut_ptr()
    }
}

/// Field-level view of `struct nvme_passthru_cmd`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassthruCommand {
    pub opcode: u8,
    pub flags: u8,
    pub nsid: u32,
    pub cdw2: u32,
    pub cdw3: u32,
    pub metadata: u64,
    pub addr: u64,
    pub metadata_len: u32,
    pub data_len: u32,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
    pub timeout_ms: u32,
    pub result: u32,
}

impl PassthruCommand {
    /// Build from an SQE. The kernel assigns the CID and builds the PRPs from
    /// `addr`/`data_len`, so those SQE fields are not carried.
    pub fn from_entry(sqe: &SubmissionEntry, addr: u64, data_len: u32, timeout_ms: u32) -> Self {
        Self {
            opcode: sqe.opcode,
            flags: sqe.flags,
            nsid: sqe.nsid,
            cdw2: sqe.cdw2,
            cdw3: sqe.cdw3,
            metadata: sqe.mptr,
            addr,
            metadata_len: 0,
            data_len,
            cdw10: sqe.cdw10,
            cdw11: sqe.cdw11,
            cdw12: sqe.cdw12,
            cdw13: sqe.cdw13,
            cdw14: sqe.cdw14,
            cdw15: sqe.cdw15,
            timeout_ms,
            result: 0,
        }
    }

    pub fn encode(&self) -> PassthruBuffer {
        let mut buf = [0u8; PASSTHRU_CMD_SIZE];
        buf[0] = self.opcode;
        buf[1] = self.flags;
        put_u32(&mut buf, 4, self.nsid);
        put_u32(&mut buf, 8, self.cdw2);
        put_u32(&mut buf, 12, self.cdw3);
        put_u64(&mut buf, 16, self.metadata);
        put_u64(&mut buf, 24, self.addr);
        put_u32(&mut buf, 32, self.metadata_len);
        put_u32(&mut buf, 36, self.data_len);
        put_u32(&mut buf, 40, self.cdw10);
        put_u32(&mut buf, 44, self.cdw11);
        put_u32(&mut buf, 48, self.cdw12);
        put_u32(&mut buf, 52, self.cdw13);
        put_u32(&mut buf, 56, self.cdw14);
        put_u32(&mut buf, 60, self.cdw15);
        put_u32(&mut buf, 64, self.timeout_ms);
        put_u32(&mut buf, 68, self.result);
        PassthruBuffer(buf)
    }

    pub fn decode(buf: &PassthruBuffer) -> Self {
        let b = &buf.0;
        Self {
            opcode: b[0],
            flags: b[1],
            nsid: get_u32(b, 4),
            cdw2: get_u32(b, 8),
            cdw3: get_u32(b, 12),
            metadata: get_u64(b, 16),
            addr: get_u64(b, 24),
            metadata_len: get_u32(b, 32),
            data_len: get_u32(b, 36),
            cdw10: get_u32(b, 40),
            cdw11: get_u32(b, 44),
            cdw12: get_u32(b, 48),
            cdw13: get_u32(b, 52),
            cdw14: get_u32(b, 56),
            cdw15: get_u32(b, 60),
            timeout_ms: get_u32(b, 64),
            result: get_u32(b, 68),
        }
    }
}

// =============================================================================
// Little-endian helpers
// =============================================================================

pub(crate) fn put_u16(buf: &mut [u8], offset: usize, v: u16) {
    buf[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u32(buf: &mut [u8], offset: usize, v: u32) {
    buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u64(buf: &mut [u8], offset: usize, v: u64) {
    buf[offset..offset + 8].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn get_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

pub(crate) fn get_u32(buf: &[u8], offset: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(b)
}

pub(crate) fn get_u64(buf: &[u8], offset: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(b)
}

/// Decode a fixed-width, NUL- or space-padded ASCII field.
pub(crate) fn fixed_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqe_layout_offsets() {
        let sqe = SubmissionEntry {
            opcode: 0x06,
            flags: 0x41,
            cid: 0xBEEF,
            nsid: 0x1122_3344,
            prp1: 0x0102_0304_0506_0708,
            cdw10: 0xAABB_CCDD,
            cdw15: 0x0F0F_0F0F,
            ..Default::default()
        };
        let raw = sqe.encode();
        assert_eq!(raw[0], 0x06);
        assert_eq!(raw[1], 0x41);
        assert_eq!(&raw[2..4], &[0xEF, 0xBE]);
        assert_eq!(&raw[4..8], &[0x44, 0x33, 0x22, 0x11]);
        assert_eq!(&raw[24..32], &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&raw[40..44], &[0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(&raw[60..64], &[0x0F; 4]);
        assert_eq!(sqe.fuse(), 1);
        assert_eq!(sqe.psdt(), 1);
        assert_eq!(SubmissionEntry::decode(&raw), sqe);
    }

    #[test]
    fn test_identify_encoding() {
        let sqe = Command::identify_controller().encode().unwrap();
        assert_eq!(sqe.opcode, 0x06);
        assert_eq!(sqe.cdw10, 0x01);
        assert_eq!(sqe.nsid, 0);

        let sqe = Command::Identify {
            cns: Cns::NamespaceDescriptorList,
            nsid: 7,
            cntid: 0x12,
            csi: 2,
        }
        .encode()
        .unwrap();
        assert_eq!(sqe.cdw10, 0x0012_0003);
        assert_eq!(sqe.cdw11, 0x0200_0000);
        assert_eq!(sqe.nsid, 7);
        assert_eq!(sqe.data_direction(), DataDirection::ControllerToHost);
    }

    #[test]
    fn test_get_log_page_numd_split() {
        // 512 KiB -> numd = 131071 = 0x1_FFFF
        let req = LogPageRequest {
            rae: true,
            lsp: 0x3,
            ..LogPageRequest::new(LogPageId::Discovery, 512 * 1024)
        }
        .with_offset(0x1_0000_0010);
        let sqe = Command::GetLogPage(req).encode().unwrap();
        assert_eq!(sqe.cdw10 & 0xFF, 0x70);
        assert_eq!((sqe.cdw10 >> 8) & 0x7F, 0x3);
        assert_eq!((sqe.cdw10 >> 15) & 1, 1);
        assert_eq!(sqe.cdw10 >> 16, 0xFFFF);
        assert_eq!(sqe.cdw11 & 0xFFFF, 0x1);
        assert_eq!(sqe.cdw12, 0x10);
        assert_eq!(sqe.cdw13, 0x1);
    }

    #[test]
    fn test_get_log_page_rejects_unaligned() {
        let err = Command::GetLogPage(LogPageRequest::new(LogPageId::SmartHealth, 6))
            .encode()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let err = Command::GetLogPage(LogPageRequest::new(LogPageId::SmartHealth, 512).with_offset(2))
            .encode()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_read_write_zero_based_nlb() {
        let sqe = Command::Read {
            nsid: 1,
            slba: 0x0000_0001_0000_0002,
            blocks: 8,
        }
        .encode()
        .unwrap();
        assert_eq!(sqe.opcode, 0x02);
        assert_eq!(sqe.cdw10, 2);
        assert_eq!(sqe.cdw11, 1);
        assert_eq!(sqe.cdw12, 7);

        assert!(Command::Write {
            nsid: 1,
            slba: 0,
            blocks: 0
        }
        .encode()
        .is_err());
        assert_eq!(
            Command::Write {
                nsid: 1,
                slba: 0,
                blocks: 1
            }
            .command_set(),
            CommandSet::Io
        );
    }

    #[test]
    fn test_fabrics_connect_layout() {
        let sqe = Command::FabricsConnect(ConnectCommand {
            recfmt: 0,
            qid: 0,
            sqsize: 31,
            cattr: 0,
            kato_ms: 120_000,
        })
        .encode()
        .unwrap();
        let raw = sqe.encode();
        assert_eq!(raw[0], FABRICS_OPCODE);
        assert_eq!(raw[4], FCTYPE_CONNECT);
        assert_eq!(u16::from_le_bytes([raw[44], raw[45]]), 31);
        assert_eq!(
            u32::from_le_bytes([raw[48], raw[49], raw[50], raw[51]]),
            120_000
        );
        assert_eq!(sqe.fctype(), Some(FCTYPE_CONNECT));
    }

    #[test]
    fn test_connect_data_fields() {
        let data = ConnectData {
            host_id: [0xAB; 16],
            cntlid: DYNAMIC_CNTLID,
            subsystem_nqn: "nqn.2024-01.io.example:sub1".into(),
            host_nqn: "nqn.2014-08.org.nvmexpress:uuid:host".into(),
        };
        let raw = data.encode().unwrap();
        assert_eq!(&raw[0..16], &[0xAB; 16]);
        assert_eq!(&raw[16..18], &[0xFF, 0xFF]);
        assert_eq!(&raw[256..256 + 27], data.subsystem_nqn.as_bytes());
        assert_eq!(raw[256 + 27], 0);
        assert_eq!(ConnectData::decode(&raw).unwrap(), data);

        let too_long = ConnectData {
            subsystem_nqn: "n".repeat(NQN_MAX_LEN + 1),
            ..data
        };
        assert!(too_long.encode().is_err());
    }

    #[test]
    fn test_passthru_layout() {
        let sqe = Command::identify_namespace(3).encode().unwrap();
        let cmd = PassthruCommand::from_entry(&sqe, 0xDEAD_0000, 4096, 60_000);
        let buf = cmd.encode();
        assert_eq!(std::mem::size_of::<PassthruBuffer>(), PASSTHRU_CMD_SIZE);
        assert_eq!(std::mem::align_of::<PassthruBuffer>(), 8);
        assert_eq!(buf.0[0], 0x06);
        assert_eq!(get_u32(&buf.0, 4), 3);
        assert_eq!(get_u64(&buf.0, 24), 0xDEAD_0000);
        assert_eq!(get_u32(&buf.0, 36), 4096);
        assert_eq!(get_u32(&buf.0, 64), 60_000);
        assert_eq!(buf.result(), 0);
        assert_eq!(PassthruCommand::decode(&buf), cmd);
    }
}
