//! NVMe Command Codec
//!
//! Fixed binary layouts for everything that crosses the kernel boundary:
//!
//! - [`command`]: 64-byte submission entries, the 72-byte Linux passthrough
//!   structure, typed command builders and Fabrics Connect data
//! - [`completion`]: 16-byte completion entries
//! - [`status`]: status field decoding and the status taxonomy
//! - [`identify`]: Identify Controller / Namespace / NSID list / descriptors
//! - [`discovery_log`]: the fabrics discovery log page
//! - [`buffer`]: 4 KiB aligned data buffers
//!
//! Nothing in this module performs I/O.

pub mod buffer;
pub mod command;
pub mod completion;
pub mod discovery_log;
pub mod identify;
pub mod status;

pub use buffer::{DataBuffer, DATA_BUFFER_ALIGNMENT};
pub use command::{
    AdminOpcode, Cns, Command, CommandSet, ConnectCommand, ConnectData, DataDirection,
    IoOpcode, LogPageId, LogPageRequest, PassthruBuffer, PassthruCommand, SubmissionEntry,
    CONNECT_DATA_SIZE, DYNAMIC_CNTLID, FABRICS_OPCODE, NQN_MAX_LEN,
};
pub use completion::{decode_completion, Completion, CompletionEntry, DecodedCompletion};
pub use discovery_log::{
    AddressFamily, DiscoveryLog, DiscoveryLogEntry, DiscoveryLogHeader, SubsystemType,
    TransportType,
};
pub use identify::{
    ControllerInfo, ControllerType, LbaFormat, NamespaceDescriptor, NamespaceInfo, NvmeVersion,
    IDENTIFY_DATA_SIZE,
};
pub use status::{Status, StatusKind, StatusType};
