//! Identify & Discovery Engine
//!
//! Enumerates a controller and its namespaces through any [`CommandIssuer`]
//! (a live [`ChannelWorker`](crate::transport::ChannelWorker) or a blocking
//! transport wrapped in [`DirectIssuer`](crate::transport::DirectIssuer)).
//!
//! ```text
//! discover()
//!   ├── Identify CNS 01h ───────────────► ControllerInfo
//!   ├── Identify CNS 02h (paged) ───────► [nsid, ...]
//!   └── for each nsid
//!         ├── Identify CNS 00h ─────────► NamespaceInfo
//!         └── Identify CNS 03h (≥ 1.3) ─► descriptors merged in
//! ```
//!
//! A pass either yields a complete [`DiscoveredController`] or fails with
//! `DiscoveryIncomplete`; partial results are never returned.

pub mod host;
pub mod sysfs;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::codec::discovery_log::{DiscoveryLogHeader, DISCOVERY_LOG_HEADER_SIZE};
use crate::codec::identify::{parse_descriptor_list, parse_nsid_list, ACTIVE_NSID_PAGE_ENTRIES};
use crate::codec::{
    Command, ControllerInfo, DataBuffer, DiscoveryLog, LogPageId, LogPageRequest,
    NamespaceInfo, StatusKind, IDENTIFY_DATA_SIZE,
};
use crate::error::{Error, Result};
use crate::transport::CommandIssuer;

pub use host::HostIdentity;
pub use sysfs::{scan_controllers, LocalController};

/// Discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Fetch Namespace Identification Descriptors when the controller supports them
    pub fetch_descriptors: bool,
    /// Re-reads allowed while the discovery log generation counter keeps changing
    pub discovery_log_retries: usize,
    /// Bytes per Get Log Page command
    pub log_chunk_size: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            fetch_descriptors: true,
            discovery_log_retries: 10,
            log_chunk_size: 4096,
        }
    }
}

/// Everything one discovery pass learned about a controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredController {
    pub info: ControllerInfo,
    pub namespaces: Vec<NamespaceInfo>,
}

/// Issues Identify / Get Log Page and parses the results.
#[derive(Debug, Clone, Default)]
pub struct IdentifyEngine {
    config: DiscoveryConfig,
}

impl IdentifyEngine {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    async fn read(&self, issuer: &dyn CommandIssuer, cmd: Command, len: usize) -> Result<DataBuffer> {
        let outcome = issuer.issue(&cmd, Some(DataBuffer::new(len)?)).await?;
        outcome
            .data
            .ok_or_else(|| Error::Internal(format!("opcode {:#04x} returned no buffer", cmd.opcode())))
    }

    pub async fn identify_controller(&self, issuer: &dyn CommandIssuer) -> Result<ControllerInfo> {
        let page = self
            .read(issuer, Command::identify_controller(), IDENTIFY_DATA_SIZE)
            .await?;
        ControllerInfo::parse(&page)
    }

    /// Identify one namespace. With `with_descriptors`, also fetch CNS 03h;
    /// an Invalid Field answer there is tolerated, anything else aborts.
    pub async fn identify_namespace(
        &self,
        issuer: &dyn CommandIssuer,
        nsid: u32,
        with_descriptors: bool,
    ) -> Result<NamespaceInfo> {
        let page = self
            .read(issuer, Command::identify_namespace(nsid), IDENTIFY_DATA_SIZE)
            .await?;
        let mut info = NamespaceInfo::parse(nsid, &page)?;

        if with_descriptors {
            match self
                .read(issuer, Command::identify_descriptors(nsid), IDENTIFY_DATA_SIZE)
                .await
            {
                Ok(page) => info.apply_descriptors(&parse_descriptor_list(&page)?),
                Err(Error::DeviceError { status })
                    if status.kind() == StatusKind::InvalidFieldInCommand =>
                {
                    debug!("NSID {} has no descriptor list", nsid);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(info)
    }

    /// Every active NSID in ascending order, following full pages.
    pub async fn list_namespace_ids(&self, issuer: &dyn CommandIssuer) -> Result<Vec<u32>> {
        let mut all: Vec<u32> = Vec::new();
        let mut after = 0u32;

        loop {
            let page = self
                .read(issuer, Command::identify_active_namespaces(after), IDENTIFY_DATA_SIZE)
                .await?;
            let ids = parse_nsid_list(&page)?;

            if let Some(&first) = ids.first() {
                if first <= after {
                    return Err(Error::Malformed {
                        structure: "active namespace list",
                        reason: format!("page after {} starts at {}", after, first),
                    });
                }
            }

            let full = ids.len() == ACTIVE_NSID_PAGE_ENTRIES;
            all.extend_from_slice(&ids);

            match (full, all.last()) {
                (true, Some(&last)) => after = last,
                _ => break,
            }
        }

        Ok(all)
    }

    /// Identify the controller and every active namespace.
    #[instrument(skip(self, issuer))]
    pub async fn discover(&self, issuer: &dyn CommandIssuer) -> Result<DiscoveredController> {
        self.discover_inner(issuer)
            .await
            .map_err(Error::discovery_incomplete)
    }

    async fn discover_inner(&self, issuer: &dyn CommandIssuer) -> Result<DiscoveredController> {
        let info = self.identify_controller(issuer).await?;
        let with_descriptors = self.config.fetch_descriptors && info.supports_ns_descriptors();

        let ids = self.list_namespace_ids(issuer).await?;
        let mut namespaces = Vec::with_capacity(ids.len());
        for nsid in ids {
            let ns = self.identify_namespace(issuer, nsid, with_descriptors).await?;
            if !ns.is_active() {
                // detached between the list and the identify
                debug!("NSID {} went inactive during discovery", nsid);
                continue;
            }
            namespaces.push(ns);
        }

        debug!(
            "Discovered {} ({}) with {} namespace(s)",
            info.subnqn,
            info.serial,
            namespaces.len()
        );
        Ok(DiscoveredController { info, namespaces })
    }

    /// Read `len` bytes of a log page in chunks.
    async fn read_log(
        &self,
        issuer: &dyn CommandIssuer,
        lid: LogPageId,
        len: usize,
        rae: bool,
    ) -> Result<Vec<u8>> {
        let chunk = self.config.log_chunk_size.max(4) as usize & !3;
        let mut out = Vec::with_capacity(len);
        let mut offset = 0usize;

        while offset < len {
            let this = chunk.min(len - offset);
            let req = LogPageRequest {
                rae,
                ..LogPageRequest::new(lid, this as u32)
            }
            .with_offset(offset as u64);
            let buf = self.read(issuer, Command::GetLogPage(req), this).await?;
            out.extend_from_slice(&buf);
            offset += this;
        }

        Ok(out)
    }

    async fn read_discovery_header(&self, issuer: &dyn CommandIssuer) -> Result<DiscoveryLogHeader> {
        let raw = self
            .read_log(issuer, LogPageId::Discovery, DISCOVERY_LOG_HEADER_SIZE, true)
            .await?;
        DiscoveryLogHeader::parse(&raw)
    }

    /// Read a generation-consistent discovery log.
    ///
    /// The header is read, then the full log, then the header again; the
    /// sequence repeats while the generation counter moved. A counter still
    /// moving after `max_retries` fails with a retryable `WouldBlock` I/O
    /// error. A record count that changed under a stable counter is malformed.
    #[instrument(skip(self, issuer))]
    pub async fn get_discovery_log(
        &self,
        issuer: &dyn CommandIssuer,
        max_retries: usize,
    ) -> Result<DiscoveryLog> {
        let mut header = self.read_discovery_header(issuer).await?;
        let mut retries = 0usize;

        loop {
            if header.numrec == 0 {
                return Ok(DiscoveryLog {
                    genctr: header.genctr,
                    recfmt: header.recfmt,
                    entries: Vec::new(),
                });
            }

            let raw = self
                .read_log(issuer, LogPageId::Discovery, header.log_len()?, true)
                .await?;
            let full = DiscoveryLogHeader::parse(&raw)?;
            let after = self.read_discovery_header(issuer).await?;

            if full.genctr == after.genctr {
                if full.numrec != header.numrec {
                    return Err(Error::Malformed {
                        structure: "discovery log",
                        reason: format!(
                            "record count changed from {} to {} under generation {}",
                            header.numrec, full.numrec, full.genctr
                        ),
                    });
                }
                return DiscoveryLog::parse(&raw);
            }

            retries += 1;
            if retries >= max_retries {
                warn!(
                    "Discovery log generation still changing after {} retries",
                    retries
                );
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::WouldBlock,
                    format!(
                        "discovery log generation changed ({} -> {})",
                        full.genctr, after.genctr
                    ),
                )));
            }
            debug!(
                "Discovery log generation moved {} -> {}, re-reading",
                full.genctr, after.genctr
            );
            header = after;
        }
    }
}
