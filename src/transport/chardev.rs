//! Linux NVMe character device passthrough
//!
//! Commands are handed to the kernel with `NVME_IOCTL_ADMIN_CMD` /
//! `NVME_IOCTL_IO_CMD` on `/dev/nvmeN`. The ioctl returns 0 on success, a
//! positive NVMe status (phase tag removed) on device error, or -1 with errno.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use super::{DataTransfer, HandleGuard, HandleTracker, Transport, TransportKind};
use crate::codec::{CommandSet, Completion, PassthruCommand, Status, SubmissionEntry};
use crate::error::{Error, Result};

// _IO('N', 0x40)
const NVME_IOCTL_ID: u64 = 0x4E40;
// _IOWR('N', 0x41, struct nvme_passthru_cmd)
const NVME_IOCTL_ADMIN_CMD: u64 = 0xC048_4E41;
// _IOWR('N', 0x43, struct nvme_passthru_cmd)
const NVME_IOCTL_IO_CMD: u64 = 0xC048_4E43;

/// Re-issues of a passthrough interrupted by a signal
const EINTR_RETRIES: usize = 3;

/// An open `/dev/nvmeN` controller node.
#[derive(Debug)]
pub struct CharDevice {
    path: PathBuf,
    file: Option<File>,
    guard: Option<HandleGuard>,
}

impl CharDevice {
    /// Open read-write. With `exclusive`, take a non-blocking advisory lock so
    /// a second owner is refused with `AlreadyInUse`.
    pub fn open(path: &Path, exclusive: bool, tracker: &HandleTracker) -> Result<Self> {
        let target = path.display().to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::from_open_error(e, &target))?;

        if exclusive {
            // SAFETY: fd is valid for the lifetime of `file`
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if rc != 0 {
                return Err(Error::from_open_error(
                    std::io::Error::last_os_error(),
                    &target,
                ));
            }
        }

        debug!("Opened {}", target);
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            guard: Some(tracker.acquire()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn fd(&self) -> Result<i32> {
        self.file
            .as_ref()
            .map(|f| f.as_raw_fd())
            .ok_or_else(|| Error::TransportLost {
                reason: format!("{} is closed", self.path.display()),
            })
    }

    /// NSID bound to a namespace node (`NVME_IOCTL_ID`).
    pub fn namespace_id(&self) -> Result<u32> {
        let fd = self.fd()?;
        // SAFETY: NVME_IOCTL_ID takes no argument
        let rc = unsafe { libc::ioctl(fd, NVME_IOCTL_ID as _) };
        if rc < 0 {
            return Err(map_errno(std::io::Error::last_os_error(), &self.path));
        }
        Ok(rc as u32)
    }

    fn passthru(
        &mut self,
        set: CommandSet,
        sqe: &SubmissionEntry,
        mut data: DataTransfer<'_>,
        timeout: Duration,
    ) -> Result<Completion> {
        let fd = self.fd()?;
        let (addr, len) = match &mut data {
            DataTransfer::None => (0u64, 0u32),
            DataTransfer::Read(buf) => (buf.as_mut_ptr() as u64, buf.len() as u32),
            DataTransfer::Write(buf) => (buf.as_ptr() as u64, buf.len() as u32),
        };
        let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);

        let request = match set {
            CommandSet::Admin => NVME_IOCTL_ADMIN_CMD,
            CommandSet::Io => NVME_IOCTL_IO_CMD,
        };

        debug!(
            "{} {} opcode={:#04x} nsid={} len={}",
            self.path.display(),
            set,
            sqe.opcode,
            sqe.nsid,
            len
        );

        let mut interrupted = 0;
        let (rc, cmd) = loop {
            let mut cmd = PassthruCommand::from_entry(sqe, addr, len, timeout_ms).encode();
            // SAFETY: cmd is a 72-byte, 8-byte aligned nvme_passthru_cmd; the data
            // buffer (if any) outlives the call and matches addr/len.
            let rc = unsafe { libc::ioctl(fd, request as _, cmd.as_mut_ptr()) };
            if rc >= 0 {
                break (rc, cmd);
            }

            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) && interrupted < EINTR_RETRIES {
                interrupted += 1;
                debug!(
                    "{} opcode={:#04x} interrupted, retrying",
                    self.path.display(),
                    sqe.opcode
                );
                continue;
            }
            return Err(ioctl_error(err, sqe.opcode, timeout_ms, &self.path));
        };

        if rc > 0 {
            return Err(Error::DeviceError {
                status: Status::from_raw(rc as u16),
            });
        }

        Ok(Completion::success(cmd.result()))
    }
}

/// Classify a failed passthrough ioctl. Only `ETIMEDOUT` is a command
/// timeout; an interrupt left after retries stays a transient I/O error.
fn ioctl_error(err: std::io::Error, opcode: u8, timeout_ms: u32, path: &Path) -> Error {
    match err.raw_os_error() {
        Some(libc::ETIMEDOUT) => Error::Timeout {
            opcode,
            timeout_ms: timeout_ms as u64,
        },
        _ => map_errno(err, path),
    }
}

/// Classify a failed syscall on an open device.
fn map_errno(err: std::io::Error, path: &Path) -> Error {
    match err.raw_os_error() {
        Some(libc::ENODEV) | Some(libc::ENXIO) | Some(libc::EIO) | Some(libc::ENOTCONN)
        | Some(libc::EBADF) => Error::TransportLost {
            reason: format!("{}: {}", path.display(), err),
        },
        _ => Error::Io(err),
    }
}

impl Transport for CharDevice {
    fn kind(&self) -> TransportKind {
        TransportKind::Pcie
    }

    fn target(&self) -> String {
        self.path.display().to_string()
    }

    fn instance(&self) -> Option<u32> {
        instance_from_path(&self.path)
    }

    fn establish(&mut self) -> Result<()> {
        self.fd().map(|_| ())
    }

    fn submit(
        &mut self,
        set: CommandSet,
        sqe: &SubmissionEntry,
        data: DataTransfer<'_>,
        timeout: Duration,
    ) -> Result<Completion> {
        self.passthru(set, sqe, data, timeout)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            drop(file);
            self.guard = None;
            debug!("Closed {}", self.path.display());
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }
}

impl Drop for CharDevice {
    fn drop(&mut self) {
        if self.file.is_some() {
            warn!("{} dropped while open", self.path.display());
        }
    }
}

/// `N` from a path ending in `nvmeN`.
pub(crate) fn instance_from_path(path: &Path) -> Option<u32> {
    path.file_name()?
        .to_str()?
        .strip_prefix("nvme")?
        .parse()
        .ok()
}
