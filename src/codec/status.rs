//! NVMe completion status decoding
//!
//! The status field is carried in bits 31:17 of completion dword 3. The Linux
//! passthrough ioctl returns the same field already shifted right by one (the
//! phase tag removed), so [`Status`] stores that 15-bit form:
//!
//! ```text
//!  14    13    12..11   10..8   7..0
//! ┌─────┬─────┬────────┬───────┬──────┐
//! │ DNR │  M  │  CRD   │  SCT  │  SC  │
//! └─────┴─────┴────────┴───────┴──────┘
//! ```
//!
//! Status codes are classified against the NVMe Base Specification 2.0 tables
//! (figures 101-105) and the NVMe over Fabrics 1.1 Connect response codes.

use serde::{Deserialize, Serialize};

use super::command::FABRICS_OPCODE;

// =============================================================================
// Status Type
// =============================================================================

/// Status Code Type (SCT) field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusType {
    /// Generic Command Status (0h)
    Generic,
    /// Command Specific Status (1h)
    CommandSpecific,
    /// Media and Data Integrity Errors (2h)
    MediaDataIntegrity,
    /// Path Related Status (3h)
    PathRelated,
    /// Vendor Specific (7h)
    VendorSpecific,
    /// Reserved type values (4h-6h)
    Reserved(u8),
}

impl StatusType {
    /// Decode the 3-bit SCT value.
    pub fn from_raw(sct: u8) -> Self {
        match sct & 0x7 {
            0 => StatusType::Generic,
            1 => StatusType::CommandSpecific,
            2 => StatusType::MediaDataIntegrity,
            3 => StatusType::PathRelated,
            7 => StatusType::VendorSpecific,
            other => StatusType::Reserved(other),
        }
    }

    /// The 3-bit SCT value.
    pub fn as_raw(&self) -> u8 {
        match self {
            StatusType::Generic => 0,
            StatusType::CommandSpecific => 1,
            StatusType::MediaDataIntegrity => 2,
            StatusType::PathRelated => 3,
            StatusType::VendorSpecific => 7,
            StatusType::Reserved(v) => v & 0x7,
        }
    }
}

impl std::fmt::Display for StatusType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusType::Generic => write!(f, "generic"),
            StatusType::CommandSpecific => write!(f, "command-specific"),
            StatusType::MediaDataIntegrity => write!(f, "media/data-integrity"),
            StatusType::PathRelated => write!(f, "path-related"),
            StatusType::VendorSpecific => write!(f, "vendor-specific"),
            StatusType::Reserved(v) => write!(f, "reserved({})", v),
        }
    }
}

// =============================================================================
// Status Field
// =============================================================================

const SC_MASK: u16 = 0x00FF;
const SCT_SHIFT: u16 = 8;
const CRD_SHIFT: u16 = 11;
const MORE_BIT: u16 = 1 << 13;
const DNR_BIT: u16 = 1 << 14;

/// The 15-bit NVMe status field (phase tag removed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Status(u16);

impl Status {
    /// Successful completion.
    pub const SUCCESS: Status = Status(0);

    /// Build from the value the Linux passthrough ioctl returns.
    pub fn from_raw(raw: u16) -> Self {
        Status(raw & 0x7FFF)
    }

    /// Build from the upper half of completion dword 3 (phase tag in bit 0).
    pub fn from_cqe_field(field: u16) -> Self {
        Status(field >> 1)
    }

    /// Build from a status type and code with all flag bits clear.
    pub fn new(status_type: StatusType, code: u8) -> Self {
        Status(((status_type.as_raw() as u16) << SCT_SHIFT) | code as u16)
    }

    /// Set or clear the Do Not Retry bit.
    pub fn with_dnr(self, dnr: bool) -> Self {
        if dnr {
            Status(self.0 | DNR_BIT)
        } else {
            Status(self.0 & !DNR_BIT)
        }
    }

    /// The raw 15-bit value.
    pub fn raw(&self) -> u16 {
        self.0
    }

    /// The value as stored in a completion entry (shifted left past the phase tag).
    pub fn to_cqe_field(&self, phase: bool) -> u16 {
        (self.0 << 1) | phase as u16
    }

    pub fn status_type(&self) -> StatusType {
        StatusType::from_raw(((self.0 >> SCT_SHIFT) & 0x7) as u8)
    }

    pub fn status_code(&self) -> u8 {
        (self.0 & SC_MASK) as u8
    }

    /// Command Retry Delay index (0 = retry immediately).
    pub fn crd(&self) -> u8 {
        ((self.0 >> CRD_SHIFT) & 0x3) as u8
    }

    /// More information is available in the Error Information log.
    pub fn more(&self) -> bool {
        self.0 & MORE_BIT != 0
    }

    /// Do Not Retry.
    pub fn dnr(&self) -> bool {
        self.0 & DNR_BIT != 0
    }

    pub fn is_success(&self) -> bool {
        self.status_type() == StatusType::Generic && self.status_code() == 0
    }

    /// Classify without command context (NVM command set assumed).
    pub fn kind(&self) -> StatusKind {
        classify(self.status_type(), self.status_code(), None)
    }

    /// Classify in the context of the opcode that produced this status.
    pub fn kind_for(&self, opcode: u8) -> StatusKind {
        classify(self.status_type(), self.status_code(), Some(opcode))
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} (sct={}, sc={:#04x}{})",
            self.kind(),
            self.status_type(),
            self.status_code(),
            if self.dnr() { ", dnr" } else { "" }
        )
    }
}

// =============================================================================
// Status Kinds
// =============================================================================

/// Named (status type, status code) pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusKind {
    // Generic command status
    Success,
    InvalidCommandOpcode,
    InvalidFieldInCommand,
    CommandIdConflict,
    DataTransferError,
    AbortedPowerLoss,
    InternalError,
    AbortRequested,
    AbortedSqDeletion,
    AbortedFailedFusedCommand,
    AbortedMissingFusedCommand,
    InvalidNamespaceOrFormat,
    CommandSequenceError,
    InvalidSglSegmentDescriptor,
    InvalidNumberOfSglDescriptors,
    DataSglLengthInvalid,
    MetadataSglLengthInvalid,
    SglDescriptorTypeInvalid,
    InvalidUseOfControllerMemoryBuffer,
    PrpOffsetInvalid,
    AtomicWriteUnitExceeded,
    OperationDenied,
    SglOffsetInvalid,
    HostIdentifierInconsistentFormat,
    KeepAliveTimerExpired,
    KeepAliveTimeoutInvalid,
    AbortedPreemptAndAbort,
    SanitizeFailed,
    SanitizeInProgress,
    SglDataBlockGranularityInvalid,
    CommandNotSupportedForQueueInCmb,
    NamespaceWriteProtected,
    CommandInterrupted,
    TransientTransportError,
    ProhibitedByCommandAndFeatureLockdown,
    AdminCommandMediaNotReady,
    LbaOutOfRange,
    CapacityExceeded,
    NamespaceNotReady,
    ReservationConflict,
    FormatInProgress,

    // Command specific status
    CompletionQueueInvalid,
    InvalidQueueIdentifier,
    InvalidQueueSize,
    AbortCommandLimitExceeded,
    AsyncEventRequestLimitExceeded,
    InvalidFirmwareSlot,
    InvalidFirmwareImage,
    InvalidInterruptVector,
    InvalidLogPage,
    InvalidFormat,
    FirmwareActivationRequiresConventionalReset,
    InvalidQueueDeletion,
    FeatureIdentifierNotSaveable,
    FeatureNotChangeable,
    FeatureNotNamespaceSpecific,
    FirmwareActivationRequiresSubsystemReset,
    FirmwareActivationRequiresControllerReset,
    FirmwareActivationRequiresMaxTimeViolation,
    FirmwareActivationProhibited,
    OverlappingRange,
    NamespaceInsufficientCapacity,
    NamespaceIdentifierUnavailable,
    NamespaceAlreadyAttached,
    NamespaceIsPrivate,
    NamespaceNotAttached,
    ThinProvisioningNotSupported,
    ControllerListInvalid,
    DeviceSelfTestInProgress,
    BootPartitionWriteProhibited,
    InvalidControllerIdentifier,
    InvalidSecondaryControllerState,
    InvalidNumberOfControllerResources,
    InvalidResourceIdentifier,
    SanitizeProhibitedWhilePmrEnabled,
    AnaGroupIdentifierInvalid,
    AnaAttachFailed,
    ConflictingAttributes,
    InvalidProtectionInformation,
    AttemptedWriteToReadOnlyRange,

    // Fabrics Connect / Discovery specific status
    ConnectIncompatibleFormat,
    ConnectControllerBusy,
    ConnectInvalidParameters,
    ConnectRestartDiscovery,
    ConnectInvalidHost,
    DiscoverRestart,
    AuthenticationRequired,

    // Media and data integrity errors
    WriteFault,
    UnrecoveredReadError,
    EndToEndGuardCheckError,
    EndToEndApplicationTagCheckError,
    EndToEndReferenceTagCheckError,
    CompareFailure,
    AccessDenied,
    DeallocatedOrUnwrittenLogicalBlock,
    EndToEndStorageTagCheckError,

    // Path related status
    InternalPathError,
    AsymmetricAccessPersistentLoss,
    AsymmetricAccessInaccessible,
    AsymmetricAccessTransition,
    ControllerPathingError,
    HostPathingError,
    CommandAbortedByHost,

    /// A pair the taxonomy does not name; raw values kept for diagnostics
    Unclassified { status_type: StatusType, status_code: u8 },
}

impl std::fmt::Display for StatusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusKind::Unclassified {
                status_type,
                status_code,
            } => write!(f, "unclassified {} status {:#04x}", status_type, status_code),
            other => write!(f, "{:?}", other),
        }
    }
}

impl StatusKind {
    pub fn is_success(&self) -> bool {
        matches!(self, StatusKind::Success)
    }

    pub fn is_unclassified(&self) -> bool {
        matches!(self, StatusKind::Unclassified { .. })
    }
}

/// Map a (type, code) pair to its named kind.
///
/// `opcode` disambiguates command-specific codes 80h-BFh, which mean
/// different things for Fabrics commands and NVM I/O commands.
pub fn classify(status_type: StatusType, code: u8, opcode: Option<u8>) -> StatusKind {
    let kind = match status_type {
        StatusType::Generic => classify_generic(code),
        StatusType::CommandSpecific => {
            if opcode == Some(FABRICS_OPCODE) {
                classify_fabrics(code).or_else(|| classify_command_specific(code))
            } else {
                classify_command_specific(code).or_else(|| classify_nvm_command_specific(code))
            }
        }
        StatusType::MediaDataIntegrity => classify_media(code),
        StatusType::PathRelated => classify_path(code),
        StatusType::VendorSpecific | StatusType::Reserved(_) => None,
    };

    kind.unwrap_or(StatusKind::Unclassified {
        status_type,
        status_code: code,
    })
}

fn classify_generic(code: u8) -> Option<StatusKind> {
    use StatusKind::*;

    Some(match code {
        0x00 => Success,
        0x01 => InvalidCommandOpcode,
        0x02 => InvalidFieldInCommand,
        0x03 => CommandIdConflict,
        0x04 => DataTransferError,
        0x05 => AbortedPowerLoss,
        0x06 => InternalError,
        0x07 => AbortRequested,
        0x08 => AbortedSqDeletion,
        0x09 => AbortedFailedFusedCommand,
        0x0A => AbortedMissingFusedCommand,
        0x0B => InvalidNamespaceOrFormat,
        0x0C => CommandSequenceError,
        0x0D => InvalidSglSegmentDescriptor,
        0x0E => InvalidNumberOfSglDescriptors,
        0x0F => DataSglLengthInvalid,
        0x10 => MetadataSglLengthInvalid,
        0x11 => SglDescriptorTypeInvalid,
        0x12 => InvalidUseOfControllerMemoryBuffer,
        0x13 => PrpOffsetInvalid,
        0x14 => AtomicWriteUnitExceeded,
        0x15 => OperationDenied,
        0x16 => SglOffsetInvalid,
        0x18 => HostIdentifierInconsistentFormat,
        0x19 => KeepAliveTimerExpired,
        0x1A => KeepAliveTimeoutInvalid,
        0x1B => AbortedPreemptAndAbort,
        0x1C => SanitizeFailed,
        0x1D => SanitizeInProgress,
        0x1E => SglDataBlockGranularityInvalid,
        0x1F => CommandNotSupportedForQueueInCmb,
        0x20 => NamespaceWriteProtected,
        0x21 => CommandInterrupted,
        0x22 => TransientTransportError,
        0x23 => ProhibitedByCommandAndFeatureLockdown,
        0x24 => AdminCommandMediaNotReady,
        0x80 => LbaOutOfRange,
        0x81 => CapacityExceeded,
        0x82 => NamespaceNotReady,
        0x83 => ReservationConflict,
        0x84 => FormatInProgress,
        _ => return None,
    })
}

fn classify_command_specific(code: u8) -> Option<StatusKind> {
    use StatusKind::*;

    Some(match code {
        0x00 => CompletionQueueInvalid,
        0x01 => InvalidQueueIdentifier,
        0x02 => InvalidQueueSize,
        0x03 => AbortCommandLimitExceeded,
        0x05 => AsyncEventRequestLimitExceeded,
        0x06 => InvalidFirmwareSlot,
        0x07 => InvalidFirmwareImage,
        0x08 => InvalidInterruptVector,
        0x09 => InvalidLogPage,
        0x0A => InvalidFormat,
        0x0B => FirmwareActivationRequiresConventionalReset,
        0x0C => InvalidQueueDeletion,
        0x0D => FeatureIdentifierNotSaveable,
        0x0E => FeatureNotChangeable,
        0x0F => FeatureNotNamespaceSpecific,
        0x10 => FirmwareActivationRequiresSubsystemReset,
        0x11 => FirmwareActivationRequiresControllerReset,
        0x12 => FirmwareActivationRequiresMaxTimeViolation,
        0x13 => FirmwareActivationProhibited,
        0x14 => OverlappingRange,
        0x15 => NamespaceInsufficientCapacity,
        0x16 => NamespaceIdentifierUnavailable,
        0x18 => NamespaceAlreadyAttached,
        0x19 => NamespaceIsPrivate,
        0x1A => NamespaceNotAttached,
        0x1B => ThinProvisioningNotSupported,
        0x1C => ControllerListInvalid,
        0x1D => DeviceSelfTestInProgress,
        0x1E => BootPartitionWriteProhibited,
        0x1F => InvalidControllerIdentifier,
        0x20 => InvalidSecondaryControllerState,
        0x21 => InvalidNumberOfControllerResources,
        0x22 => InvalidResourceIdentifier,
        0x23 => SanitizeProhibitedWhilePmrEnabled,
        0x24 => AnaGroupIdentifierInvalid,
        0x25 => AnaAttachFailed,
        _ => return None,
    })
}

fn classify_nvm_command_specific(code: u8) -> Option<StatusKind> {
    use StatusKind::*;

    Some(match code {
        0x80 => ConflictingAttributes,
        0x81 => InvalidProtectionInformation,
        0x82 => AttemptedWriteToReadOnlyRange,
        _ => return None,
    })
}

fn classify_fabrics(code: u8) -> Option<StatusKind> {
    use StatusKind::*;

    Some(match code {
        0x80 => ConnectIncompatibleFormat,
        0x81 => ConnectControllerBusy,
        0x82 => ConnectInvalidParameters,
        0x83 => ConnectRestartDiscovery,
        0x84 => ConnectInvalidHost,
        0x90 => DiscoverRestart,
        0x91 => AuthenticationRequired,
        _ => return None,
    })
}

fn classify_media(code: u8) -> Option<StatusKind> {
    use StatusKind::*;

    Some(match code {
        0x80 => WriteFault,
        0x81 => UnrecoveredReadError,
        0x82 => EndToEndGuardCheckError,
        0x83 => EndToEndApplicationTagCheckError,
        0x84 => EndToEndReferenceTagCheckError,
        0x85 => CompareFailure,
        0x86 => AccessDenied,
        0x87 => DeallocatedOrUnwrittenLogicalBlock,
        0x88 => EndToEndStorageTagCheckError,
        _ => return None,
    })
}

fn classify_path(code: u8) -> Option<StatusKind> {
    use StatusKind::*;

    Some(match code {
        0x00 => InternalPathError,
        0x01 => AsymmetricAccessPersistentLoss,
        0x02 => AsymmetricAccessInaccessible,
        0x03 => AsymmetricAccessTransition,
        0x60 => ControllerPathingError,
        0x70 => HostPathingError,
        0x71 => CommandAbortedByHost,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generic_success_and_invalid_field() {
        let ok = Status::new(StatusType::Generic, 0x00);
        assert!(ok.is_success());
        assert_eq!(ok.kind(), StatusKind::Success);

        let invalid = Status::new(StatusType::Generic, 0x02);
        assert!(!invalid.is_success());
        assert_eq!(invalid.kind(), StatusKind::InvalidFieldInCommand);
        assert!(!invalid.kind().is_unclassified());
    }

    #[test]
    fn test_raw_bit_layout() {
        // DNR | SCT=2 | SC=0x81
        let status = Status::from_raw(0x4281);
        assert!(status.dnr());
        assert!(!status.more());
        assert_eq!(status.status_type(), StatusType::MediaDataIntegrity);
        assert_eq!(status.status_code(), 0x81);
        assert_eq!(status.kind(), StatusKind::UnrecoveredReadError);
    }

    #[test]
    fn test_cqe_field_strips_phase() {
        let status = Status::new(StatusType::Generic, 0x0B).with_dnr(true);
        let field = status.to_cqe_field(true);
        assert_eq!(field & 1, 1);
        assert_eq!(Status::from_cqe_field(field), status);
    }

    #[test]
    fn test_crd_bits() {
        let status = Status::from_raw((2 << 11) | 0x06);
        assert_eq!(status.crd(), 2);
        assert_eq!(status.kind(), StatusKind::InternalError);
    }

    #[test]
    fn test_fabrics_codes_depend_on_opcode() {
        let status = Status::new(StatusType::CommandSpecific, 0x82);
        assert_eq!(
            status.kind_for(FABRICS_OPCODE),
            StatusKind::ConnectInvalidParameters
        );
        assert_eq!(status.kind_for(0x01), StatusKind::AttemptedWriteToReadOnlyRange);
    }

    #[test]
    fn test_unknown_pairs_are_unclassified() {
        let vendor = Status::new(StatusType::VendorSpecific, 0xC4);
        assert_eq!(
            vendor.kind(),
            StatusKind::Unclassified {
                status_type: StatusType::VendorSpecific,
                status_code: 0xC4
            }
        );

        let gap = Status::new(StatusType::Generic, 0x17);
        assert!(gap.kind().is_unclassified());

        let reserved = Status::from_raw(5 << 8);
        assert_eq!(reserved.status_type(), StatusType::Reserved(5));
        assert!(reserved.kind().is_unclassified());
    }

    #[test]
    fn test_path_related() {
        let status = Status::new(StatusType::PathRelated, 0x03);
        assert_eq!(status.kind(), StatusKind::AsymmetricAccessTransition);
    }
}
