//! Host identity (NQN and host ID) resolution.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::topology::validate_nqn;

/// Prefix of UUID-based host NQNs.
pub const UUID_NQN_PREFIX: &str = "nqn.2014-08.org.nvmexpress:uuid:";

/// Default location of the host identity files.
pub const DEFAULT_HOST_DIR: &str = "/etc/nvme";

/// The identity this host presents to fabrics targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostIdentity {
    pub nqn: String,
    pub id: Uuid,
}

/// First line of a file, or `None` when it is missing or blank.
fn read_first_line(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(s
            .lines()
            .next()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::from_open_error(e, &path.display().to_string())),
    }
}

impl HostIdentity {
    pub fn new(nqn: impl Into<String>, id: Uuid) -> Result<Self> {
        let nqn = nqn.into();
        validate_nqn(&nqn)?;
        Ok(Self { nqn, id })
    }

    /// A fresh UUID-based identity.
    pub fn generate() -> Self {
        let id = Uuid::new_v4();
        Self {
            nqn: format!("{}{}", UUID_NQN_PREFIX, id),
            id,
        }
    }

    /// The UUID embedded in a UUID-based NQN.
    pub fn uuid_from_nqn(nqn: &str) -> Option<Uuid> {
        nqn.strip_prefix(UUID_NQN_PREFIX)
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    /// Read `hostnqn` and `hostid` from `dir`, filling in whichever is missing.
    ///
    /// A missing ID is taken from a UUID-based NQN when possible; a missing
    /// NQN is derived from the ID. With neither file present a new identity is
    /// generated.
    pub fn resolve(dir: &Path) -> Result<Self> {
        let nqn = read_first_line(&dir.join("hostnqn"))?;
        let id = match read_first_line(&dir.join("hostid"))? {
            Some(s) => Some(Uuid::parse_str(&s).map_err(|e| {
                Error::Config(format!("{}/hostid: {}", dir.display(), e))
            })?),
            None => None,
        };

        let identity = match (nqn, id) {
            (Some(nqn), Some(id)) => Self::new(nqn, id)?,
            (Some(nqn), None) => {
                let id = Self::uuid_from_nqn(&nqn).unwrap_or_else(Uuid::new_v4);
                Self::new(nqn, id)?
            }
            (None, Some(id)) => Self::new(format!("{}{}", UUID_NQN_PREFIX, id), id)?,
            (None, None) => {
                let generated = Self::generate();
                info!(
                    "No host identity under {}, generated {}",
                    dir.display(),
                    generated.nqn
                );
                return Ok(generated);
            }
        };

        debug!("Host identity {} ({})", identity.nqn, identity.id);
        Ok(identity)
    }

    /// Write both identity files into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        fs::write(dir.join("hostnqn"), format!("{}\n", self.nqn))?;
        fs::write(dir.join("hostid"), format!("{}\n", self.id))?;
        Ok(())
    }

    pub fn default_dir() -> PathBuf {
        PathBuf::from(DEFAULT_HOST_DIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    #[test]
    fn test_reads_first_line() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("hostnqn"),
            "nqn.2024-01.io.nvmekit:host1\nignored\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("hostid"),
            "2b7c1c0e-6d3e-4e1f-9f0a-5a4b3c2d1e0f\n",
        )
        .unwrap();

        let id = HostIdentity::resolve(dir.path()).unwrap();
        assert_eq!(id.nqn, "nqn.2024-01.io.nvmekit:host1");
        assert_eq!(id.id.to_string(), "2b7c1c0e-6d3e-4e1f-9f0a-5a4b3c2d1e0f");
    }

    #[test]
    fn test_id_from_uuid_nqn() {
        let dir = TempDir::new().unwrap();
        let uuid = Uuid::new_v4();
        fs::write(
            dir.path().join("hostnqn"),
            format!("{}{}", UUID_NQN_PREFIX, uuid),
        )
        .unwrap();
        assert_eq!(HostIdentity::resolve(dir.path()).unwrap().id, uuid);
    }

    #[test]
    fn test_generate_when_missing_and_save() {
        let dir = TempDir::new().unwrap();
        let generated = HostIdentity::resolve(dir.path()).unwrap();
        assert!(generated.nqn.starts_with(UUID_NQN_PREFIX));
        assert_eq!(HostIdentity::uuid_from_nqn(&generated.nqn), Some(generated.id));

        generated.save(dir.path()).unwrap();
        assert_eq!(HostIdentity::resolve(dir.path()).unwrap(), generated);
    }

    #[test]
    fn test_bad_hostid_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("hostid"), "not-a-uuid\n").unwrap();
        assert_matches!(HostIdentity::resolve(dir.path()), Err(Error::Config(_)));
    }
}
