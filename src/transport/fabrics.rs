//! NVMe over Fabrics controller creation
//!
//! The kernel creates a fabrics controller when an option string is written to
//! `/dev/nvme-fabrics`; reading the device back yields `instance=N,cntlid=M`.
//! The new controller is then reachable as `/dev/nvmeN` and is torn down by
//! writing to `/sys/class/nvme/nvmeN/delete_controller`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{DataTransfer, HandleTracker, Transport, TransportConfig, TransportKind};
use crate::codec::{CommandSet, Completion, SubmissionEntry, NQN_MAX_LEN};
use crate::error::{Error, Result};

/// Kernel default controller loss timeout, in seconds.
pub const DEFAULT_CTRL_LOSS_TMO: i32 = 600;

/// Well-known NQN of a discovery controller.
pub const DISCOVERY_NQN: &str = "nqn.2014-08.org.nvmexpress.discovery";

/// Fabrics connection parameters.
///
/// Integer options use 0 (or -1 for `tos`) as "unset"; unset values are
/// filled from defaults by [`FabricsConfig::merge_defaults`] and omitted from
/// the option string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricsConfig {
    pub transport: String,
    pub traddr: Option<String>,
    pub trsvcid: Option<String>,
    pub host_traddr: Option<String>,
    pub host_nqn: Option<String>,
    pub host_id: Option<String>,
    pub nr_io_queues: i32,
    pub nr_write_queues: i32,
    pub nr_poll_queues: i32,
    pub queue_size: i32,
    pub keep_alive_tmo: i32,
    pub reconnect_delay: i32,
    pub ctrl_loss_tmo: i32,
    pub tos: i32,
    pub duplicate_connect: bool,
    pub disable_sqflow: bool,
    pub hdr_digest: bool,
    pub data_digest: bool,
}

impl Default for FabricsConfig {
    fn default() -> Self {
        Self {
            transport: String::new(),
            traddr: None,
            trsvcid: None,
            host_traddr: None,
            host_nqn: None,
            host_id: None,
            nr_io_queues: 0,
            nr_write_queues: 0,
            nr_poll_queues: 0,
            queue_size: 0,
            keep_alive_tmo: 0,
            reconnect_delay: 0,
            ctrl_loss_tmo: DEFAULT_CTRL_LOSS_TMO,
            tos: -1,
            duplicate_connect: false,
            disable_sqflow: false,
            hdr_digest: false,
            data_digest: false,
        }
    }
}

impl FabricsConfig {
    pub fn new(transport: impl Into<String>) -> Self {
        Self {
            transport: transport.into(),
            ..Default::default()
        }
    }

    /// Take each option still at its unset value from `defaults`.
    pub fn merge_defaults(&mut self, defaults: &FabricsConfig) {
        let unset = FabricsConfig::default();

        macro_rules! update {
            ($($field:ident),*) => {
                $(if self.$field == unset.$field {
                    self.$field = defaults.$field.clone();
                })*
            };
        }

        update!(
            host_traddr,
            host_nqn,
            host_id,
            nr_io_queues,
            nr_write_queues,
            nr_poll_queues,
            queue_size,
            keep_alive_tmo,
            reconnect_delay,
            ctrl_loss_tmo,
            tos,
            duplicate_connect,
            disable_sqflow,
            hdr_digest,
            data_digest
        );
    }
}

// =============================================================================
// Option string
// =============================================================================

/// Unset and `"none"` values are omitted; anything else, the empty string
/// included, is passed through for the kernel to judge.
fn add_argument(out: &mut String, tok: &str, arg: Option<&str>) {
    match arg {
        None | Some("none") => {}
        Some(v) => out.push_str(&format!(",{}={}", tok, v)),
    }
}

fn add_int_argument(out: &mut String, tok: &str, arg: i32, allow_zero: bool) {
    if arg < 0 || (arg == 0 && !allow_zero) {
        return;
    }
    out.push_str(&format!(",{}={}", tok, arg));
}

fn add_bool_argument(out: &mut String, tok: &str, arg: bool) {
    if arg {
        out.push(',');
        out.push_str(tok);
    }
}

/// Build the string written to the fabrics device. `nqn=` always comes first.
pub fn build_options(subsystem_nqn: &str, cfg: &FabricsConfig) -> Result<String> {
    if subsystem_nqn.is_empty() || subsystem_nqn.len() > NQN_MAX_LEN {
        return Err(Error::InvalidArgument(format!(
            "subsystem NQN must be 1..={} bytes",
            NQN_MAX_LEN
        )));
    }
    if cfg.transport.is_empty() {
        return Err(Error::InvalidArgument("fabrics transport is required".into()));
    }
    if cfg.transport != "loop" && cfg.traddr.as_deref().map_or(true, str::is_empty) {
        return Err(Error::InvalidArgument(format!(
            "transport {} needs a traddr",
            cfg.transport
        )));
    }
    if subsystem_nqn.contains(',') {
        return Err(Error::InvalidArgument(format!(
            "NQN {} contains a comma",
            subsystem_nqn
        )));
    }

    let mut s = format!("nqn={}", subsystem_nqn);
    add_argument(&mut s, "transport", Some(&cfg.transport));
    add_argument(&mut s, "traddr", cfg.traddr.as_deref());
    add_argument(&mut s, "host_traddr", cfg.host_traddr.as_deref());
    add_argument(&mut s, "trsvcid", cfg.trsvcid.as_deref());
    add_argument(&mut s, "hostnqn", cfg.host_nqn.as_deref());
    add_argument(&mut s, "hostid", cfg.host_id.as_deref());
    add_int_argument(&mut s, "nr_write_queues", cfg.nr_write_queues, false);
    add_int_argument(&mut s, "nr_poll_queues", cfg.nr_poll_queues, false);
    add_int_argument(&mut s, "reconnect_delay", cfg.reconnect_delay, false);
    add_int_argument(&mut s, "ctrl_loss_tmo", cfg.ctrl_loss_tmo, false);
    add_int_argument(&mut s, "tos", cfg.tos, true);
    add_bool_argument(&mut s, "duplicate_connect", cfg.duplicate_connect);
    add_bool_argument(&mut s, "disable_sqflow", cfg.disable_sqflow);
    add_bool_argument(&mut s, "hdr_digest", cfg.hdr_digest);
    add_bool_argument(&mut s, "data_digest", cfg.data_digest);
    add_int_argument(&mut s, "queue_size", cfg.queue_size, false);
    add_int_argument(&mut s, "keep_alive_tmo", cfg.keep_alive_tmo, false);
    add_int_argument(&mut s, "nr_io_queues", cfg.nr_io_queues, false);
    Ok(s)
}

/// Parse `instance=N` out of the fabrics device read-back.
pub fn parse_instance(reply: &str) -> Result<u32> {
    reply
        .split(|c| c == ',' || c == '\n')
        .filter_map(|tok| tok.trim().strip_prefix("instance="))
        .find_map(|v| v.parse().ok())
        .ok_or_else(|| Error::Malformed {
            structure: "fabrics reply",
            reason: format!("no instance in {:?}", reply.trim()),
        })
}

// =============================================================================
// Kernel interaction
// =============================================================================

/// Write the options to the fabrics device and return the new instance.
pub fn add_ctrl(fabrics_device: &Path, options: &str) -> Result<u32> {
    use std::io::{Read, Write};

    let display = fabrics_device.display().to_string();
    let mut dev = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(fabrics_device)
        .map_err(|e| Error::from_open_error(e, &display))?;

    debug!("Writing fabrics options: {}", options);
    dev.write_all(options.as_bytes())?;

    let mut reply = String::new();
    dev.read_to_string(&mut reply)?;
    parse_instance(&reply)
}

/// Ask the kernel to delete a fabrics controller. Already gone is success.
pub fn delete_controller(sysfs_root: &Path, instance: u32) -> Result<()> {
    let path = sysfs_root
        .join(format!("nvme{}", instance))
        .join("delete_controller");
    match std::fs::write(&path, "1") {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn is_invalid_argument(err: &Error) -> bool {
    match err {
        Error::Io(e) => e.kind() == std::io::ErrorKind::InvalidInput,
        _ => false,
    }
}

// =============================================================================
// Fabrics channel
// =============================================================================

/// A fabrics controller: created on `establish`, deleted on `close`.
#[derive(Debug)]
pub struct FabricsChannel {
    subsystem_nqn: String,
    config: FabricsConfig,
    fabrics_device: PathBuf,
    dev_dir: PathBuf,
    sysfs_root: PathBuf,
    exclusive: bool,
    tracker: HandleTracker,
    instance: Option<u32>,
    #[cfg(target_os = "linux")]
    device: Option<super::chardev::CharDevice>,
}

impl FabricsChannel {
    pub fn new(
        subsystem_nqn: &str,
        config: FabricsConfig,
        transport: &TransportConfig,
        tracker: HandleTracker,
    ) -> Result<Self> {
        // validate early so a bad target fails before touching the kernel
        build_options(subsystem_nqn, &config)?;

        Ok(Self {
            subsystem_nqn: subsystem_nqn.to_string(),
            config,
            fabrics_device: transport.fabrics_device.clone(),
            dev_dir: transport.dev_dir.clone(),
            sysfs_root: transport.sysfs_root.clone(),
            exclusive: transport.exclusive,
            tracker,
            instance: None,
            #[cfg(target_os = "linux")]
            device: None,
        })
    }

    fn create_controller(&mut self) -> Result<u32> {
        let options = build_options(&self.subsystem_nqn, &self.config)?;
        match add_ctrl(&self.fabrics_device, &options) {
            Err(e) if self.config.disable_sqflow && is_invalid_argument(&e) => {
                warn!("Kernel rejected disable_sqflow, retrying without it");
                self.config.disable_sqflow = false;
                let options = build_options(&self.subsystem_nqn, &self.config)?;
                add_ctrl(&self.fabrics_device, &options)
            }
            other => other,
        }
    }
}

#[cfg(target_os = "linux")]
impl Transport for FabricsChannel {
    fn kind(&self) -> TransportKind {
        TransportKind::Fabrics
    }

    fn target(&self) -> String {
        format!(
            "{}:{}:{}",
            self.config.transport,
            self.config.traddr.as_deref().unwrap_or("-"),
            self.config.trsvcid.as_deref().unwrap_or("-")
        )
    }

    fn instance(&self) -> Option<u32> {
        self.instance
    }

    fn establish(&mut self) -> Result<()> {
        if self.device.is_some() {
            return Ok(());
        }

        let instance = self.create_controller()?;
        self.instance = Some(instance);
        info!(
            "Created fabrics controller nvme{} for {}",
            instance, self.subsystem_nqn
        );

        let path = self.dev_dir.join(format!("nvme{}", instance));
        match super::chardev::CharDevice::open(&path, self.exclusive, &self.tracker) {
            Ok(dev) => {
                self.device = Some(dev);
                Ok(())
            }
            Err(e) => {
                // do not leave a kernel controller behind
                if let Err(del) = delete_controller(&self.sysfs_root, instance) {
                    warn!("Failed to delete nvme{}: {}", instance, del);
                }
                self.instance = None;
                Err(e)
            }
        }
    }

    fn submit(
        &mut self,
        set: CommandSet,
        sqe: &SubmissionEntry,
        data: DataTransfer<'_>,
        timeout: Duration,
    ) -> Result<Completion> {
        match self.device.as_mut() {
            Some(dev) => dev.submit(set, sqe, data, timeout),
            None => Err(Error::TransportLost {
                reason: format!("fabrics controller for {} not established", self.subsystem_nqn),
            }),
        }
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut dev) = self.device.take() {
            dev.close()?;
        }
        if let Some(instance) = self.instance.take() {
            delete_controller(&self.sysfs_root, instance)?;
            info!("Deleted fabrics controller nvme{}", instance);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.device.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_order_and_omissions() {
        let cfg = FabricsConfig {
            traddr: Some("192.168.0.5".into()),
            trsvcid: Some("4420".into()),
            host_traddr: Some("none".into()),
            host_nqn: Some("nqn.2014-08.org.nvmexpress:uuid:abc".into()),
            keep_alive_tmo: 30,
            tos: 0,
            disable_sqflow: true,
            ..FabricsConfig::new("tcp")
        };
        let s = build_options("nqn.2024-01.io.example:sub", &cfg).unwrap();
        assert_eq!(
            s,
            "nqn=nqn.2024-01.io.example:sub,transport=tcp,traddr=192.168.0.5,trsvcid=4420,\
             hostnqn=nqn.2014-08.org.nvmexpress:uuid:abc,ctrl_loss_tmo=600,tos=0,\
             disable_sqflow,keep_alive_tmo=30"
        );
    }

    #[test]
    fn test_empty_value_is_passed_through() {
        let mut s = String::new();
        add_argument(&mut s, "host_traddr", Some(""));
        add_argument(&mut s, "trsvcid", None);
        add_argument(&mut s, "hostid", Some("none"));
        assert_eq!(s, ",host_traddr=");
    }

    #[test]
    fn test_options_validation() {
        assert!(build_options("", &FabricsConfig::new("tcp")).is_err());
        assert!(build_options("nqn.x", &FabricsConfig::new("tcp")).is_err());
        assert!(build_options("nqn.x", &FabricsConfig::default()).is_err());
        let lp = build_options("nqn.x", &FabricsConfig::new("loop")).unwrap();
        assert_eq!(lp, "nqn=nqn.x,transport=loop,ctrl_loss_tmo=600");
        let long = "n".repeat(NQN_MAX_LEN + 1);
        assert!(build_options(&long, &FabricsConfig::new("loop")).is_err());
    }

    #[test]
    fn test_merge_defaults_only_fills_unset() {
        let defaults = FabricsConfig {
            nr_io_queues: 8,
            ctrl_loss_tmo: 60,
            tos: 4,
            hdr_digest: true,
            host_nqn: Some("nqn.host".into()),
            ..FabricsConfig::default()
        };
        let mut cfg = FabricsConfig {
            nr_io_queues: 2,
            ..FabricsConfig::new("rdma")
        };
        cfg.merge_defaults(&defaults);
        assert_eq!(cfg.nr_io_queues, 2);
        assert_eq!(cfg.ctrl_loss_tmo, 60);
        assert_eq!(cfg.tos, 4);
        assert!(cfg.hdr_digest);
        assert_eq!(cfg.host_nqn.as_deref(), Some("nqn.host"));
        assert_eq!(cfg.transport, "rdma");
    }

    #[test]
    fn test_parse_instance() {
        assert_eq!(parse_instance("instance=3,cntlid=1\n").unwrap(), 3);
        assert_eq!(parse_instance("cntlid=1,instance=12").unwrap(), 12);
        assert!(matches!(
            parse_instance("cntlid=1"),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn test_delete_controller_writes_sysfs() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("nvme4")).unwrap();
        std::fs::write(root.path().join("nvme4/delete_controller"), "").unwrap();
        delete_controller(root.path(), 4).unwrap();
        assert_eq!(
            std::fs::read_to_string(root.path().join("nvme4/delete_controller")).unwrap(),
            "1"
        );
        // already gone
        delete_controller(root.path(), 9).unwrap();
    }

    #[test]
    fn test_add_ctrl_missing_device() {
        let dir = tempfile::tempdir().unwrap();
        let err = add_ctrl(&dir.path().join("nvme-fabrics"), "nqn=x").unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
