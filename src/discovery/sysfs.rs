//! Enumeration of kernel-bound controllers under `/sys/class/nvme`.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::transport::ConnectTarget;

/// A controller the kernel already has bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalController {
    /// `nvmeN`
    pub name: String,
    pub instance: u32,
    /// `pcie`, `tcp`, `rdma`, `fc` or `loop`
    pub transport: Option<String>,
    pub address: Option<String>,
    pub subsysnqn: Option<String>,
    pub state: Option<String>,
    pub serial: Option<String>,
    pub model: Option<String>,
    pub firmware_rev: Option<String>,
    pub cntlid: Option<u16>,
}

fn attr(dir: &Path, name: &str) -> Option<String> {
    fs::read_to_string(dir.join(name))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn instance_of(name: &str) -> Option<u32> {
    name.strip_prefix("nvme")?.parse().ok()
}

impl LocalController {
    fn read(dir: &Path, name: &str, instance: u32) -> Self {
        Self {
            name: name.to_string(),
            instance,
            transport: attr(dir, "transport"),
            address: attr(dir, "address"),
            subsysnqn: attr(dir, "subsysnqn"),
            state: attr(dir, "state"),
            serial: attr(dir, "serial"),
            model: attr(dir, "model"),
            firmware_rev: attr(dir, "firmware_rev"),
            cntlid: attr(dir, "cntlid").and_then(|s| s.parse().ok()),
        }
    }

    /// `live` (or no state attribute at all).
    pub fn is_live(&self) -> bool {
        self.state.as_deref().map_or(true, |s| s == "live")
    }

    pub fn is_fabrics(&self) -> bool {
        matches!(
            self.transport.as_deref(),
            Some("tcp") | Some("rdma") | Some("fc") | Some("loop")
        )
    }

    pub fn device_path(&self, dev_dir: &Path) -> PathBuf {
        dev_dir.join(&self.name)
    }

    /// Target that opens this controller's character device.
    pub fn connect_target(&self, dev_dir: &Path) -> ConnectTarget {
        ConnectTarget::Pcie {
            device: self.device_path(dev_dir),
        }
    }
}

/// Every `nvmeN` entry under `sysfs_root`, ordered by instance.
///
/// A missing root yields an empty list.
pub fn scan_controllers(sysfs_root: &Path) -> Result<Vec<LocalController>> {
    let entries = match fs::read_dir(sysfs_root) {
        Ok(e) => e,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("{} does not exist", sysfs_root.display());
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    let mut found = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Skipping unreadable entry in {}: {}", sysfs_root.display(), e);
                continue;
            }
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(instance) = instance_of(&name) {
            found.push(LocalController::read(&entry.path(), &name, instance));
        }
    }

    found.sort_by_key(|c| c.instance);
    debug!("Found {} local controller(s)", found.len());
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn controller(root: &Path, name: &str, attrs: &[(&str, &str)]) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        for (k, v) in attrs {
            fs::write(dir.join(k), format!("{}\n", v)).unwrap();
        }
    }

    #[test]
    fn test_scan_orders_and_filters() {
        let root = TempDir::new().unwrap();
        controller(
            root.path(),
            "nvme10",
            &[("transport", "tcp"), ("state", "connecting")],
        );
        controller(
            root.path(),
            "nvme2",
            &[
                ("transport", "pcie"),
                ("address", "0000:01:00.0"),
                ("subsysnqn", "nqn.2024-01.io.nvmekit:local"),
                ("state", "live"),
                ("serial", "S1  "),
                ("cntlid", "4"),
            ],
        );
        controller(root.path(), "nvme-subsys0", &[]);
        controller(root.path(), "nvme2n1", &[]);

        let found = scan_controllers(root.path()).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].name, "nvme2");
        assert_eq!(found[0].serial.as_deref(), Some("S1"));
        assert_eq!(found[0].cntlid, Some(4));
        assert!(found[0].is_live());
        assert!(!found[0].is_fabrics());
        assert_eq!(found[1].instance, 10);
        assert!(!found[1].is_live());
        assert!(found[1].is_fabrics());

        assert_eq!(
            found[0].connect_target(Path::new("/dev")),
            ConnectTarget::Pcie {
                device: PathBuf::from("/dev/nvme2")
            }
        );
    }

    #[test]
    fn test_missing_root_is_empty() {
        let root = TempDir::new().unwrap();
        assert!(scan_controllers(&root.path().join("absent"))
            .unwrap()
            .is_empty());
    }
}
