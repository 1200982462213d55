//! Completion queue entry decoding

use super::command::{get_u16, get_u32, put_u16, put_u32};
use super::status::{Status, StatusKind, StatusType};
use crate::error::{Error, Result};

/// Size of an NVMe completion queue entry.
pub const CQE_SIZE: usize = 16;

/// A 16-byte NVMe completion queue entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletionEntry {
    /// Command specific result (DW0)
    pub result: u32,
    pub dw1: u32,
    pub sq_head: u16,
    pub sq_id: u16,
    pub cid: u16,
    /// Status field including the phase tag in bit 0
    pub status_field: u16,
}

impl CompletionEntry {
    pub fn phase(&self) -> bool {
        self.status_field & 1 != 0
    }

    pub fn status(&self) -> Status {
        Status::from_cqe_field(self.status_field)
    }

    pub fn encode(&self) -> [u8; CQE_SIZE] {
        let mut buf = [0u8; CQE_SIZE];
        put_u32(&mut buf, 0, self.result);
        put_u32(&mut buf, 4, self.dw1);
        put_u16(&mut buf, 8, self.sq_head);
        put_u16(&mut buf, 10, self.sq_id);
        put_u16(&mut buf, 12, self.cid);
        put_u16(&mut buf, 14, self.status_field);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < CQE_SIZE {
            return Err(Error::Malformed {
                structure: "completion entry",
                reason: format!("{} bytes, expected {}", buf.len(), CQE_SIZE),
            });
        }
        Ok(Self {
            result: get_u32(buf, 0),
            dw1: get_u32(buf, 4),
            sq_head: get_u16(buf, 8),
            sq_id: get_u16(buf, 10),
            cid: get_u16(buf, 12),
            status_field: get_u16(buf, 14),
        })
    }
}

/// What a transport hands back for a finished command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub result: u32,
    pub status: Status,
}

impl Completion {
    pub fn success(result: u32) -> Self {
        Self {
            result,
            status: Status::SUCCESS,
        }
    }

    /// Convert a non-success status into `Error::DeviceError`.
    pub fn into_result(self) -> Result<u32> {
        if self.status.is_success() {
            Ok(self.result)
        } else {
            Err(Error::DeviceError {
                status: self.status,
            })
        }
    }
}

impl From<CompletionEntry> for Completion {
    fn from(cqe: CompletionEntry) -> Self {
        Self {
            result: cqe.result,
            status: cqe.status(),
        }
    }
}

/// A fully classified completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedCompletion {
    pub status_type: StatusType,
    pub status_code: u8,
    pub kind: StatusKind,
    pub result: u32,
    pub dnr: bool,
    pub more: bool,
}

/// Decode a raw CQE and classify its status. `opcode` is the command that
/// produced it, used for command-specific codes.
pub fn decode_completion(buf: &[u8], opcode: Option<u8>) -> Result<DecodedCompletion> {
    let cqe = CompletionEntry::decode(buf)?;
    let status = cqe.status();
    let kind = match opcode {
        Some(op) => status.kind_for(op),
        None => status.kind(),
    };

    Ok(DecodedCompletion {
        status_type: status.status_type(),
        status_code: status.status_code(),
        kind,
        result: cqe.result,
        dnr: status.dnr(),
        more: status.more(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cqe_with(status: Status, result: u32) -> [u8; CQE_SIZE] {
        CompletionEntry {
            result,
            sq_head: 4,
            sq_id: 0,
            cid: 9,
            status_field: status.to_cqe_field(true),
            ..Default::default()
        }
        .encode()
    }

    #[test]
    fn test_generic_zero_is_success() {
        let raw = cqe_with(Status::SUCCESS, 0x55);
        let decoded = decode_completion(&raw, None).unwrap();
        assert_eq!(decoded.status_type, StatusType::Generic);
        assert_eq!(decoded.status_code, 0x00);
        assert_eq!(decoded.kind, StatusKind::Success);
        assert_eq!(decoded.result, 0x55);
    }

    #[test]
    fn test_generic_two_is_invalid_field() {
        let raw = cqe_with(Status::new(StatusType::Generic, 0x02).with_dnr(true), 0);
        let decoded = decode_completion(&raw, Some(0x06)).unwrap();
        assert_eq!(decoded.status_type, StatusType::Generic);
        assert_eq!(decoded.status_code, 0x02);
        assert_eq!(decoded.kind, StatusKind::InvalidFieldInCommand);
        assert!(decoded.dnr);
    }

    #[test]
    fn test_status_bits_in_raw_entry() {
        // phase=1, SC=0x81, SCT=2, DNR=1
        let field: u16 = 1 | (0x81 << 1) | (2 << 9) | (1 << 15);
        let mut raw = [0u8; CQE_SIZE];
        raw[14..16].copy_from_slice(&field.to_le_bytes());
        let cqe = CompletionEntry::decode(&raw).unwrap();
        assert!(cqe.phase());
        let status = cqe.status();
        assert_eq!(status.status_code(), 0x81);
        assert_eq!(status.status_type(), StatusType::MediaDataIntegrity);
        assert!(status.dnr());
    }

    #[test]
    fn test_short_buffer_is_malformed() {
        assert!(matches!(
            CompletionEntry::decode(&[0u8; 8]),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn test_into_result() {
        assert_eq!(Completion::success(3).into_result().unwrap(), 3);
        let err = Completion {
            result: 0,
            status: Status::new(StatusType::PathRelated, 0x71),
        }
        .into_result()
        .unwrap_err();
        assert!(matches!(err, Error::DeviceError { .. }));
    }
}
