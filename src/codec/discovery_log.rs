//! Discovery log page (LID 70h)
//!
//! ```text
//! ┌────────────────────────────┐ 0
//! │ GENCTR u64 | NUMREC u64    │
//! │ RECFMT u16 | reserved      │
//! ├────────────────────────────┤ 1024
//! │ entry 0 (1024 bytes)       │
//! ├────────────────────────────┤ 2048
//! │ entry 1 ...                │
//! └────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};

use super::command::{fixed_str, get_u16, get_u64, put_u16, put_u64};
use crate::error::{Error, Result};

/// Size of the log header.
pub const DISCOVERY_LOG_HEADER_SIZE: usize = 1024;

/// Size of one discovery log entry.
pub const DISCOVERY_LOG_ENTRY_SIZE: usize = 1024;

/// Largest record count accepted from a discovery controller.
pub const MAX_DISCOVERY_RECORDS: u64 = 4096;

/// TREQ bit: SQ flow control disable supported.
pub const TREQ_DISABLE_SQFLOW: u8 = 0x4;

// Entry offsets
const E_TRTYPE: usize = 0;
const E_ADRFAM: usize = 1;
const E_SUBTYPE: usize = 2;
const E_TREQ: usize = 3;
const E_PORTID: usize = 4;
const E_CNTLID: usize = 6;
const E_ASQSZ: usize = 8;
const E_EFLAGS: usize = 10;
const E_TRSVCID: (usize, usize) = (32, 32);
const E_SUBNQN: (usize, usize) = (256, 256);
const E_TRADDR: (usize, usize) = (512, 256);

/// Transport type (TRTYPE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportType {
    Rdma,
    Fc,
    Tcp,
    Loop,
    Other(u8),
}

impl TransportType {
    pub fn from_raw(v: u8) -> Self {
        match v {
            1 => TransportType::Rdma,
            2 => TransportType::Fc,
            3 => TransportType::Tcp,
            254 => TransportType::Loop,
            other => TransportType::Other(other),
        }
    }

    pub fn as_raw(&self) -> u8 {
        match self {
            TransportType::Rdma => 1,
            TransportType::Fc => 2,
            TransportType::Tcp => 3,
            TransportType::Loop => 254,
            TransportType::Other(v) => *v,
        }
    }

    /// Name used in the kernel fabrics option string.
    pub fn kernel_name(&self) -> Option<&'static str> {
        match self {
            TransportType::Rdma => Some("rdma"),
            TransportType::Fc => Some("fc"),
            TransportType::Tcp => Some("tcp"),
            TransportType::Loop => Some("loop"),
            TransportType::Other(_) => None,
        }
    }
}

/// Address family (ADRFAM).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
    Ib,
    Fc,
    Loop,
    Other(u8),
}

impl AddressFamily {
    pub fn from_raw(v: u8) -> Self {
        match v {
            1 => AddressFamily::Ipv4,
            2 => AddressFamily::Ipv6,
            3 => AddressFamily::Ib,
            4 => AddressFamily::Fc,
            254 => AddressFamily::Loop,
            other => AddressFamily::Other(other),
        }
    }

    pub fn as_raw(&self) -> u8 {
        match self {
            AddressFamily::Ipv4 => 1,
            AddressFamily::Ipv6 => 2,
            AddressFamily::Ib => 3,
            AddressFamily::Fc => 4,
            AddressFamily::Loop => 254,
            AddressFamily::Other(v) => *v,
        }
    }
}

/// Subsystem type (SUBTYPE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubsystemType {
    /// Referral to another discovery service
    Discovery,
    Nvme,
    CurrentDiscovery,
    Other(u8),
}

impl SubsystemType {
    pub fn from_raw(v: u8) -> Self {
        match v {
            1 => SubsystemType::Discovery,
            2 => SubsystemType::Nvme,
            3 => SubsystemType::CurrentDiscovery,
            other => SubsystemType::Other(other),
        }
    }

    /// Entry names a discovery controller rather than an NVM subsystem.
    pub fn is_discovery(&self) -> bool {
        matches!(self, SubsystemType::Discovery | SubsystemType::CurrentDiscovery)
    }

    pub fn as_raw(&self) -> u8 {
        match self {
            SubsystemType::Discovery => 1,
            SubsystemType::Nvme => 2,
            SubsystemType::CurrentDiscovery => 3,
            SubsystemType::Other(v) => *v,
        }
    }
}

/// Log header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryLogHeader {
    pub genctr: u64,
    pub numrec: u64,
    pub recfmt: u16,
}

impl DiscoveryLogHeader {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 18 {
            return Err(Error::Malformed {
                structure: "discovery log header",
                reason: format!("{} bytes", buf.len()),
            });
        }
        let header = Self {
            genctr: get_u64(buf, 0),
            numrec: get_u64(buf, 8),
            recfmt: get_u16(buf, 16),
        };
        header.log_len()?;
        Ok(header)
    }

    /// Total bytes of a log with `numrec` entries.
    ///
    /// The record count comes from the device; counts above
    /// [`MAX_DISCOVERY_RECORDS`] are malformed.
    pub fn log_len(&self) -> Result<usize> {
        let too_many = || Error::Malformed {
            structure: "discovery log header",
            reason: format!(
                "{} records exceeds the limit of {}",
                self.numrec, MAX_DISCOVERY_RECORDS
            ),
        };
        if self.numrec > MAX_DISCOVERY_RECORDS {
            return Err(too_many());
        }
        usize::try_from(self.numrec)
            .ok()
            .and_then(|n| n.checked_mul(DISCOVERY_LOG_ENTRY_SIZE))
            .and_then(|n| n.checked_add(DISCOVERY_LOG_HEADER_SIZE))
            .ok_or_else(too_many)
    }
}

/// One discovery log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryLogEntry {
    pub trtype: TransportType,
    pub adrfam: AddressFamily,
    pub subtype: SubsystemType,
    pub treq: u8,
    pub portid: u16,
    pub cntlid: u16,
    pub asqsz: u16,
    pub eflags: u16,
    pub trsvcid: String,
    pub subnqn: String,
    pub traddr: String,
}

impl DiscoveryLogEntry {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < DISCOVERY_LOG_ENTRY_SIZE {
            return Err(Error::Malformed {
                structure: "discovery log entry",
                reason: format!("{} bytes", buf.len()),
            });
        }
        let field = |(o, l): (usize, usize)| fixed_str(&buf[o..o + l]);
        Ok(Self {
            trtype: TransportType::from_raw(buf[E_TRTYPE]),
            adrfam: AddressFamily::from_raw(buf[E_ADRFAM]),
            subtype: SubsystemType::from_raw(buf[E_SUBTYPE]),
            treq: buf[E_TREQ],
            portid: get_u16(buf, E_PORTID),
            cntlid: get_u16(buf, E_CNTLID),
            asqsz: get_u16(buf, E_ASQSZ),
            eflags: get_u16(buf, E_EFLAGS),
            trsvcid: field(E_TRSVCID),
            subnqn: field(E_SUBNQN),
            traddr: field(E_TRADDR),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; DISCOVERY_LOG_ENTRY_SIZE];
        buf[E_TRTYPE] = self.trtype.as_raw();
        buf[E_ADRFAM] = self.adrfam.as_raw();
        buf[E_SUBTYPE] = self.subtype.as_raw();
        buf[E_TREQ] = self.treq;
        put_u16(&mut buf, E_PORTID, self.portid);
        put_u16(&mut buf, E_CNTLID, self.cntlid);
        put_u16(&mut buf, E_ASQSZ, self.asqsz);
        put_u16(&mut buf, E_EFLAGS, self.eflags);
        for ((o, l), s) in [
            (E_TRSVCID, &self.trsvcid),
            (E_SUBNQN, &self.subnqn),
            (E_TRADDR, &self.traddr),
        ] {
            let n = s.len().min(l - 1);
            buf[o..o + n].copy_from_slice(&s.as_bytes()[..n]);
        }
        buf
    }

    pub fn supports_disable_sqflow(&self) -> bool {
        self.treq & TREQ_DISABLE_SQFLOW != 0
    }
}

/// A complete, generation-consistent discovery log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryLog {
    pub genctr: u64,
    pub recfmt: u16,
    pub entries: Vec<DiscoveryLogEntry>,
}

impl DiscoveryLog {
    /// Parse a full log buffer (header plus `numrec` entries).
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let header = DiscoveryLogHeader::parse(buf)?;
        let needed = header.log_len()?;
        if buf.len() < needed {
            return Err(Error::Malformed {
                structure: "discovery log",
                reason: format!(
                    "{} records need {} bytes, got {}",
                    header.numrec,
                    needed,
                    buf.len()
                ),
            });
        }

        let entries = (0..header.numrec as usize)
            .map(|i| {
                let off = DISCOVERY_LOG_HEADER_SIZE + i * DISCOVERY_LOG_ENTRY_SIZE;
                DiscoveryLogEntry::parse(&buf[off..off + DISCOVERY_LOG_ENTRY_SIZE])
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            genctr: header.genctr,
            recfmt: header.recfmt,
            entries,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; DISCOVERY_LOG_HEADER_SIZE];
        put_u64(&mut buf, 0, self.genctr);
        put_u64(&mut buf, 8, self.entries.len() as u64);
        put_u16(&mut buf, 16, self.recfmt);
        for entry in &self.entries {
            buf.extend_from_slice(&entry.encode());
        }
        buf
    }
}
