//! Identify data structures
//!
//! Parsers for the 4096-byte pages returned by Identify (CNS 00h-03h). Numeric
//! fields are passed through unmodified; only the structure is validated.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::command::{fixed_str, get_u16, get_u32, get_u64, put_u16, put_u32, put_u64};
use crate::error::{Error, Result};

/// Size of every Identify data page.
pub const IDENTIFY_DATA_SIZE: usize = 4096;

/// NSIDs per Active Namespace ID list page.
pub const ACTIVE_NSID_PAGE_ENTRIES: usize = IDENTIFY_DATA_SIZE / 4;

// Identify Controller offsets
const CTRL_VID: usize = 0;
const CTRL_SSVID: usize = 2;
const CTRL_SN: (usize, usize) = (4, 20);
const CTRL_MN: (usize, usize) = (24, 40);
const CTRL_FR: (usize, usize) = (64, 8);
const CTRL_MDTS: usize = 77;
const CTRL_CNTLID: usize = 78;
const CTRL_VER: usize = 80;
const CTRL_CNTRLTYPE: usize = 111;
const CTRL_OACS: usize = 256;
const CTRL_NN: usize = 516;
const CTRL_ONCS: usize = 520;
const CTRL_SUBNQN: (usize, usize) = (768, 256);
const CTRL_IOCCSZ: usize = 1792;
const CTRL_IORCSZ: usize = 1796;

// Identify Namespace offsets
const NS_NSZE: usize = 0;
const NS_NCAP: usize = 8;
const NS_NUSE: usize = 16;
const NS_NSFEAT: usize = 24;
const NS_NLBAF: usize = 25;
const NS_FLBAS: usize = 26;
const NS_NMIC: usize = 30;
const NS_NGUID: usize = 104;
const NS_EUI64: usize = 120;
const NS_LBAF: usize = 128;
const NS_MAX_LBAF: usize = 64;

fn check_len(buf: &[u8], structure: &'static str) -> Result<()> {
    if buf.len() < IDENTIFY_DATA_SIZE {
        return Err(Error::Malformed {
            structure,
            reason: format!("{} bytes, expected {}", buf.len(), IDENTIFY_DATA_SIZE),
        });
    }
    Ok(())
}

fn put_str(buf: &mut [u8], (offset, len): (usize, usize), s: &str, pad: u8) {
    let field = &mut buf[offset..offset + len];
    field.fill(pad);
    let n = s.len().min(len);
    field[..n].copy_from_slice(&s.as_bytes()[..n]);
}

// =============================================================================
// Controller
// =============================================================================

/// NVMe version (VER field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NvmeVersion {
    pub major: u16,
    pub minor: u8,
    pub tertiary: u8,
}

impl NvmeVersion {
    pub const V1_2: NvmeVersion = NvmeVersion::new(1, 2, 0);
    pub const V1_3: NvmeVersion = NvmeVersion::new(1, 3, 0);

    pub const fn new(major: u16, minor: u8, tertiary: u8) -> Self {
        Self {
            major,
            minor,
            tertiary,
        }
    }

    pub fn from_raw(raw: u32) -> Self {
        Self {
            major: (raw >> 16) as u16,
            minor: (raw >> 8) as u8,
            tertiary: raw as u8,
        }
    }

    pub fn as_raw(&self) -> u32 {
        ((self.major as u32) << 16) | ((self.minor as u32) << 8) | self.tertiary as u32
    }
}

impl std::fmt::Display for NvmeVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.tertiary)
    }
}

/// Controller type (CNTRLTYPE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControllerType {
    /// Not reported (pre-1.4 controllers)
    Unreported,
    Io,
    Discovery,
    Administrative,
    Reserved(u8),
}

impl ControllerType {
    pub fn from_raw(v: u8) -> Self {
        match v {
            0 => ControllerType::Unreported,
            1 => ControllerType::Io,
            2 => ControllerType::Discovery,
            3 => ControllerType::Administrative,
            other => ControllerType::Reserved(other),
        }
    }

    pub fn as_raw(&self) -> u8 {
        match self {
            ControllerType::Unreported => 0,
            ControllerType::Io => 1,
            ControllerType::Discovery => 2,
            ControllerType::Administrative => 3,
            ControllerType::Reserved(v) => *v,
        }
    }
}

/// Parsed Identify Controller data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerInfo {
    pub vid: u16,
    pub ssvid: u16,
    pub serial: String,
    pub model: String,
    pub firmware: String,
    /// Maximum data transfer size as a power of two of the minimum page size; 0 = no limit
    pub mdts: u8,
    pub cntlid: u16,
    pub version: NvmeVersion,
    pub controller_type: ControllerType,
    pub oacs: u16,
    pub nn: u32,
    pub oncs: u16,
    pub subnqn: String,
    pub ioccsz: u32,
    pub iorcsz: u32,
    /// The page as returned by the device
    #[serde(skip)]
    pub raw: Bytes,
}

impl ControllerInfo {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        check_len(buf, "identify controller")?;
        let field = |(o, l): (usize, usize)| fixed_str(&buf[o..o + l]);

        Ok(Self {
            vid: get_u16(buf, CTRL_VID),
            ssvid: get_u16(buf, CTRL_SSVID),
            serial: field(CTRL_SN),
            model: field(CTRL_MN),
            firmware: field(CTRL_FR),
            mdts: buf[CTRL_MDTS],
            cntlid: get_u16(buf, CTRL_CNTLID),
            version: NvmeVersion::from_raw(get_u32(buf, CTRL_VER)),
            controller_type: ControllerType::from_raw(buf[CTRL_CNTRLTYPE]),
            oacs: get_u16(buf, CTRL_OACS),
            nn: get_u32(buf, CTRL_NN),
            oncs: get_u16(buf, CTRL_ONCS),
            subnqn: field(CTRL_SUBNQN),
            ioccsz: get_u32(buf, CTRL_IOCCSZ),
            iorcsz: get_u32(buf, CTRL_IORCSZ),
            raw: Bytes::copy_from_slice(&buf[..IDENTIFY_DATA_SIZE]),
        })
    }

    /// Lay the parsed fields back out as an Identify Controller page.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; IDENTIFY_DATA_SIZE];
        put_u16(&mut buf, CTRL_VID, self.vid);
        put_u16(&mut buf, CTRL_SSVID, self.ssvid);
        put_str(&mut buf, CTRL_SN, &self.serial, b' ');
        put_str(&mut buf, CTRL_MN, &self.model, b' ');
        put_str(&mut buf, CTRL_FR, &self.firmware, b' ');
        buf[CTRL_MDTS] = self.mdts;
        put_u16(&mut buf, CTRL_CNTLID, self.cntlid);
        put_u32(&mut buf, CTRL_VER, self.version.as_raw());
        buf[CTRL_CNTRLTYPE] = self.controller_type.as_raw();
        put_u16(&mut buf, CTRL_OACS, self.oacs);
        put_u32(&mut buf, CTRL_NN, self.nn);
        put_u16(&mut buf, CTRL_ONCS, self.oncs);
        put_str(&mut buf, CTRL_SUBNQN, &self.subnqn, 0);
        put_u32(&mut buf, CTRL_IOCCSZ, self.ioccsz);
        put_u32(&mut buf, CTRL_IORCSZ, self.iorcsz);
        buf
    }

    /// Identify CNS 03h is mandatory from NVMe 1.3 on.
    pub fn supports_ns_descriptors(&self) -> bool {
        self.version >= NvmeVersion::V1_3
    }

    pub fn supports_namespace_management(&self) -> bool {
        self.oacs & (1 << 3) != 0
    }

    /// Largest transfer in bytes for a given minimum memory page size.
    pub fn max_transfer_bytes(&self, min_page_size: u64) -> Option<u64> {
        if self.mdts == 0 {
            None
        } else {
            min_page_size.checked_shl(self.mdts as u32)
        }
    }
}

// =============================================================================
// Namespace
// =============================================================================

/// One entry of the LBA format table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbaFormat {
    /// Metadata bytes per LBA
    pub ms: u16,
    /// LBA data size as a power of two
    pub lbads: u8,
    /// Relative performance
    pub rp: u8,
}

impl LbaFormat {
    fn parse(raw: u32) -> Self {
        Self {
            ms: raw as u16,
            lbads: (raw >> 16) as u8,
            rp: ((raw >> 24) & 0x3) as u8,
        }
    }

    fn as_raw(&self) -> u32 {
        self.ms as u32 | ((self.lbads as u32) << 16) | (((self.rp & 0x3) as u32) << 24)
    }

    /// Data bytes per LBA; 0 when the format is unused.
    pub fn data_size(&self) -> u64 {
        if self.lbads == 0 {
            0
        } else {
            1u64.checked_shl(self.lbads as u32).unwrap_or(0)
        }
    }
}

/// Namespace Identification Descriptor (CNS 03h).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceDescriptor {
    Eui64([u8; 8]),
    Nguid([u8; 16]),
    Uuid(Uuid),
    Csi(u8),
}

impl NamespaceDescriptor {
    fn nidt(&self) -> u8 {
        match self {
            NamespaceDescriptor::Eui64(_) => 1,
            NamespaceDescriptor::Nguid(_) => 2,
            NamespaceDescriptor::Uuid(_) => 3,
            NamespaceDescriptor::Csi(_) => 4,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            NamespaceDescriptor::Eui64(v) => v.to_vec(),
            NamespaceDescriptor::Nguid(v) => v.to_vec(),
            NamespaceDescriptor::Uuid(u) => u.as_bytes().to_vec(),
            NamespaceDescriptor::Csi(c) => vec![*c],
        }
    }
}

/// Parsed Identify Namespace data, merged with descriptors when available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceInfo {
    pub nsid: u32,
    /// Namespace size in LBAs
    pub nsze: u64,
    /// Namespace capacity in LBAs
    pub ncap: u64,
    /// Namespace utilization in LBAs
    pub nuse: u64,
    pub nsfeat: u8,
    /// Zero-based count of LBA formats
    pub nlbaf: u8,
    pub flbas: u8,
    pub nmic: u8,
    pub lba_formats: Vec<LbaFormat>,
    pub nguid: Option<[u8; 16]>,
    pub eui64: Option<[u8; 8]>,
    pub uuid: Option<Uuid>,
    pub csi: Option<u8>,
}

impl NamespaceInfo {
    pub fn parse(nsid: u32, buf: &[u8]) -> Result<Self> {
        check_len(buf, "identify namespace")?;

        let nlbaf = buf[NS_NLBAF];
        let count = nlbaf as usize + 1;
        if count > NS_MAX_LBAF {
            return Err(Error::Malformed {
                structure: "identify namespace",
                reason: format!("NLBAF {} exceeds table size", nlbaf),
            });
        }

        let lba_formats = (0..count)
            .map(|i| LbaFormat::parse(get_u32(buf, NS_LBAF + i * 4)))
            .collect();

        let mut nguid = [0u8; 16];
        nguid.copy_from_slice(&buf[NS_NGUID..NS_NGUID + 16]);
        let mut eui64 = [0u8; 8];
        eui64.copy_from_slice(&buf[NS_EUI64..NS_EUI64 + 8]);

        let info = Self {
            nsid,
            nsze: get_u64(buf, NS_NSZE),
            ncap: get_u64(buf, NS_NCAP),
            nuse: get_u64(buf, NS_NUSE),
            nsfeat: buf[NS_NSFEAT],
            nlbaf,
            flbas: buf[NS_FLBAS],
            nmic: buf[NS_NMIC],
            lba_formats,
            nguid: non_zero(nguid),
            eui64: non_zero(eui64),
            uuid: None,
            csi: None,
        };

        if info.format_index() as usize >= count {
            return Err(Error::Malformed {
                structure: "identify namespace",
                reason: format!(
                    "FLBAS selects format {} of {}",
                    info.format_index(),
                    count
                ),
            });
        }

        Ok(info)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; IDENTIFY_DATA_SIZE];
        put_u64(&mut buf, NS_NSZE, self.nsze);
        put_u64(&mut buf, NS_NCAP, self.ncap);
        put_u64(&mut buf, NS_NUSE, self.nuse);
        buf[NS_NSFEAT] = self.nsfeat;
        buf[NS_NLBAF] = self.nlbaf;
        buf[NS_FLBAS] = self.flbas;
        buf[NS_NMIC] = self.nmic;
        if let Some(nguid) = self.nguid {
            buf[NS_NGUID..NS_NGUID + 16].copy_from_slice(&nguid);
        }
        if let Some(eui64) = self.eui64 {
            buf[NS_EUI64..NS_EUI64 + 8].copy_from_slice(&eui64);
        }
        for (i, fmt) in self.lba_formats.iter().take(NS_MAX_LBAF).enumerate() {
            put_u32(&mut buf, NS_LBAF + i * 4, fmt.as_raw());
        }
        buf
    }

    /// Index of the formatted LBA format, including the upper FLBAS bits 6:5.
    pub fn format_index(&self) -> u8 {
        (self.flbas & 0x0F) | (((self.flbas >> 5) & 0x3) << 4)
    }

    pub fn active_format(&self) -> Option<&LbaFormat> {
        self.lba_formats.get(self.format_index() as usize)
    }

    /// Bytes of data per logical block.
    pub fn lba_data_size(&self) -> u64 {
        self.active_format().map(|f| f.data_size()).unwrap_or(0)
    }

    /// Bytes of metadata per logical block.
    pub fn metadata_size(&self) -> u16 {
        self.active_format().map(|f| f.ms).unwrap_or(0)
    }

    /// Namespace size in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.nsze.saturating_mul(self.lba_data_size())
    }

    /// Identify data for an inactive NSID is all zeros.
    pub fn is_active(&self) -> bool {
        self.nsze != 0
    }

    /// Fill identifiers from a descriptor list; descriptors win over the
    /// Identify Namespace fields.
    pub fn apply_descriptors(&mut self, descriptors: &[NamespaceDescriptor]) {
        for desc in descriptors {
            match *desc {
                NamespaceDescriptor::Eui64(v) => self.eui64 = Some(v),
                NamespaceDescriptor::Nguid(v) => self.nguid = Some(v),
                NamespaceDescriptor::Uuid(u) => self.uuid = Some(u),
                NamespaceDescriptor::Csi(c) => self.csi = Some(c),
            }
        }
    }
}

fn non_zero<const N: usize>(v: [u8; N]) -> Option<[u8; N]> {
    if v.iter().all(|&b| b == 0) {
        None
    } else {
        Some(v)
    }
}

// =============================================================================
// Lists
// =============================================================================

/// Parse an Active Namespace ID list page: ascending, zero-terminated.
pub fn parse_nsid_list(buf: &[u8]) -> Result<Vec<u32>> {
    check_len(buf, "active namespace list")?;

    let mut ids = Vec::new();
    for i in 0..ACTIVE_NSID_PAGE_ENTRIES {
        let nsid = get_u32(buf, i * 4);
        if nsid == 0 {
            break;
        }
        if let Some(&last) = ids.last() {
            if nsid <= last {
                return Err(Error::Malformed {
                    structure: "active namespace list",
                    reason: format!("NSID {} follows {}", nsid, last),
                });
            }
        }
        ids.push(nsid);
    }
    Ok(ids)
}

pub fn encode_nsid_list(ids: &[u32]) -> Vec<u8> {
    let mut buf = vec![0u8; IDENTIFY_DATA_SIZE];
    for (i, id) in ids.iter().take(ACTIVE_NSID_PAGE_ENTRIES).enumerate() {
        put_u32(&mut buf, i * 4, *id);
    }
    buf
}

/// Parse a Namespace Identification Descriptor list.
pub fn parse_descriptor_list(buf: &[u8]) -> Result<Vec<NamespaceDescriptor>> {
    check_len(buf, "namespace descriptor list")?;

    let malformed = |reason: String| Error::Malformed {
        structure: "namespace descriptor list",
        reason,
    };

    let mut out = Vec::new();
    let mut off = 0;
    while off + 4 <= IDENTIFY_DATA_SIZE {
        let nidt = buf[off];
        if nidt == 0 {
            break;
        }
        let nidl = buf[off + 1] as usize;
        let start = off + 4;
        let end = start + nidl;
        if end > IDENTIFY_DATA_SIZE {
            return Err(malformed(format!("descriptor at {} overruns page", off)));
        }
        let nid = &buf[start..end];

        let expected = match nidt {
            1 => Some(8),
            2 | 3 => Some(16),
            4 => Some(1),
            _ => None,
        };
        if let Some(len) = expected {
            if nidl != len {
                return Err(malformed(format!(
                    "type {} has length {}, expected {}",
                    nidt, nidl, len
                )));
            }
        }

        match nidt {
            1 => {
                let mut v = [0u8; 8];
                v.copy_from_slice(nid);
                out.push(NamespaceDescriptor::Eui64(v));
            }
            2 => {
                let mut v = [0u8; 16];
                v.copy_from_slice(nid);
                out.push(NamespaceDescriptor::Nguid(v));
            }
            3 => {
                let mut v = [0u8; 16];
                v.copy_from_slice(nid);
                out.push(NamespaceDescriptor::Uuid(Uuid::from_bytes(v)));
            }
            4 => out.push(NamespaceDescriptor::Csi(nid[0])),
            // unknown types are skipped
            _ => {}
        }

        off = end;
    }
    Ok(out)
}

pub fn encode_descriptor_list(descriptors: &[NamespaceDescriptor]) -> Vec<u8> {
    let mut buf = vec![0u8; IDENTIFY_DATA_SIZE];
    let mut off = 0;
    for desc in descriptors {
        let payload = desc.payload();
        if off + 4 + payload.len() > IDENTIFY_DATA_SIZE {
            break;
        }
        buf[off] = desc.nidt();
        buf[off + 1] = payload.len() as u8;
        buf[off + 4..off + 4 + payload.len()].copy_from_slice(&payload);
        off += 4 + payload.len();
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_controller() -> ControllerInfo {
        ControllerInfo {
            vid: 0x144D,
            ssvid: 0x144D,
            serial: "S4EWNX0R123456".into(),
            model: "Example NVMe SSD 1TB".into(),
            firmware: "2B2QEXM7".into(),
            mdts: 5,
            cntlid: 0x41,
            version: NvmeVersion::new(1, 4, 0),
            controller_type: ControllerType::Io,
            oacs: 0x0017,
            nn: 32,
            oncs: 0x005F,
            subnqn: "nqn.2024-01.io.example:ssd".into(),
            ioccsz: 0,
            iorcsz: 0,
            raw: Bytes::new(),
        }
    }

    #[test]
    fn test_controller_fields() {
        let page = sample_controller().encode();
        // padded with spaces on the wire
        assert_eq!(page[4 + 14], b' ');
        let info = ControllerInfo::parse(&page).unwrap();
        assert_eq!(info.vid, 0x144D);
        assert_eq!(info.serial, "S4EWNX0R123456");
        assert_eq!(info.model, "Example NVMe SSD 1TB");
        assert_eq!(info.firmware, "2B2QEXM7");
        assert_eq!(info.mdts, 5);
        assert_eq!(info.cntlid, 0x41);
        assert_eq!(info.version.to_string(), "1.4.0");
        assert_eq!(info.controller_type, ControllerType::Io);
        assert_eq!(info.nn, 32);
        assert_eq!(info.subnqn, "nqn.2024-01.io.example:ssd");
        assert_eq!(info.raw.len(), IDENTIFY_DATA_SIZE);
        assert!(info.supports_ns_descriptors());
        assert!(info.supports_namespace_management());
        assert_eq!(info.max_transfer_bytes(4096), Some(128 * 1024));
    }

    #[test]
    fn test_short_page_is_malformed() {
        assert!(matches!(
            ControllerInfo::parse(&[0u8; 100]),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn test_namespace_upper_flbas_bits() {
        let mut formats = vec![
            LbaFormat {
                ms: 0,
                lbads: 9,
                rp: 0
            };
            20
        ];
        formats[17] = LbaFormat {
            ms: 8,
            lbads: 12,
            rp: 1,
        };
        let ns = NamespaceInfo {
            nsid: 1,
            nsze: 1000,
            ncap: 1000,
            nuse: 10,
            nsfeat: 0,
            nlbaf: 19,
            // index 17 = 0b01_0001: low nibble 1, bits 6:5 = 01
            flbas: 0x01 | (0x1 << 5),
            nmic: 0,
            lba_formats: formats,
            nguid: None,
            eui64: Some([1, 2, 3, 4, 5, 6, 7, 8]),
            uuid: None,
            csi: None,
        };
        let parsed = NamespaceInfo::parse(1, &ns.encode()).unwrap();
        assert_eq!(parsed.format_index(), 17);
        assert_eq!(parsed.lba_data_size(), 4096);
        assert_eq!(parsed.metadata_size(), 8);
        assert_eq!(parsed.size_bytes(), 1000 * 4096);
        assert_eq!(parsed.nguid, None);
        assert_eq!(parsed.eui64, Some([1, 2, 3, 4, 5, 6, 7, 8]));
    }

    #[test]
    fn test_flbas_out_of_table_is_malformed() {
        let mut page = vec![0u8; IDENTIFY_DATA_SIZE];
        page[NS_NSZE] = 1;
        page[NS_NLBAF] = 0;
        page[NS_FLBAS] = 2;
        assert!(matches!(
            NamespaceInfo::parse(1, &page),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn test_nsid_list_zero_terminated() {
        let ids = parse_nsid_list(&encode_nsid_list(&[1, 2, 7])).unwrap();
        assert_eq!(ids, vec![1, 2, 7]);
        assert!(parse_nsid_list(&encode_nsid_list(&[])).unwrap().is_empty());
        assert!(parse_nsid_list(&encode_nsid_list(&[3, 2])).is_err());
    }

    #[test]
    fn test_descriptor_list() {
        let uuid = Uuid::from_bytes([7u8; 16]);
        let descs = vec![
            NamespaceDescriptor::Eui64([9; 8]),
            NamespaceDescriptor::Uuid(uuid),
            NamespaceDescriptor::Csi(0),
        ];
        let page = encode_descriptor_list(&descs);
        assert_eq!(page[0], 1);
        assert_eq!(page[1], 8);
        let parsed = parse_descriptor_list(&page).unwrap();
        assert_eq!(parsed, descs);

        let mut ns = NamespaceInfo::parse(1, &vec![0u8; IDENTIFY_DATA_SIZE]).unwrap();
        assert!(!ns.is_active());
        ns.apply_descriptors(&parsed);
        assert_eq!(ns.uuid, Some(uuid));
        assert_eq!(ns.csi, Some(0));
    }

    #[test]
    fn test_descriptor_bad_length() {
        let mut page = vec![0u8; IDENTIFY_DATA_SIZE];
        page[0] = 3;
        page[1] = 8;
        assert!(matches!(
            parse_descriptor_list(&page),
            Err(Error::Malformed { .. })
        ));
    }
}
