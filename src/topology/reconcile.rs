//! Refresh reconciliation.
//!
//! ```text
//!   discovery results ──► apply_refresh ──► TopologyDiff ──► acknowledge
//!                             │                                  │
//!                 match by identity key                 excise entities still
//!                 update in place / mark removed        marked Removed
//! ```

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::entities::{ControllerId, EntityStatus, NamespaceId, SubsystemId};
use super::model::Topology;
use crate::discovery::DiscoveredController;
use crate::error::{Error, Result};

/// Handle of any entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityRef {
    Subsystem(SubsystemId),
    Controller(ControllerId),
    Namespace(NamespaceId),
}

/// What one refresh changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyDiff {
    pub generation: u64,
    pub added: Vec<EntityRef>,
    /// Attribute changes and revivals
    pub updated: Vec<EntityRef>,
    /// Marked removed; still resolvable until acknowledged
    pub removed: Vec<EntityRef>,
}

impl TopologyDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

impl Topology {
    /// Reconcile one round of discovery results in a single write.
    ///
    /// Controllers absent from `results` are left alone. A failed result
    /// marks its controller incomplete; once the failures exceed
    /// `max_incomplete_refreshes` the controller and its namespaces are
    /// marked removed, and so is a subsystem whose controllers are all gone.
    pub fn apply_refresh(
        &self,
        results: Vec<(ControllerId, Result<DiscoveredController>)>,
    ) -> TopologyDiff {
        let max_failures = self.config().max_incomplete_refreshes;
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        inner.generation += 1;
        let mut diff = TopologyDiff {
            generation: inner.generation,
            ..Default::default()
        };
        let mut touched: HashSet<SubsystemId> = HashSet::new();

        for (cid, result) in results {
            let (subsystem, nqn) = match inner.controllers.get(&cid) {
                Some(c) => match inner.subsystems.get(&c.subsystem) {
                    Some(s) => (s.id, s.nqn.clone()),
                    None => continue,
                },
                None => {
                    debug!("{} vanished before reconcile", cid);
                    continue;
                }
            };
            touched.insert(subsystem);

            let result = result.and_then(|d| {
                if d.info.subnqn == nqn {
                    Ok(d)
                } else {
                    Err(Error::InvalidState {
                        entity: cid.to_string(),
                        reason: format!("now reports {} instead of {}", d.info.subnqn, nqn),
                    })
                }
            });

            match result {
                Ok(found) => {
                    let was_removed = inner
                        .subsystems
                        .get(&subsystem)
                        .map_or(false, |s| s.status.is_removed());
                    if was_removed {
                        if let Some(s) = inner.subsystems.get_mut(&subsystem) {
                            s.status = EntityStatus::Active;
                        }
                        diff.updated.push(EntityRef::Subsystem(subsystem));
                    }

                    let changed = inner
                        .controllers
                        .get_mut(&cid)
                        .map_or(false, |c| c.apply_info(&found.info));
                    if changed {
                        diff.updated.push(EntityRef::Controller(cid));
                    }

                    let present: HashSet<u32> = found.namespaces.iter().map(|n| n.nsid).collect();
                    for ns in &found.namespaces {
                        match inner.namespace_by_nsid(cid, ns.nsid) {
                            Some(id) => {
                                let changed = inner
                                    .namespaces
                                    .get_mut(&id)
                                    .map_or(false, |n| n.apply_info(ns));
                                if changed {
                                    diff.updated.push(EntityRef::Namespace(id));
                                }
                            }
                            None => match inner.insert_namespace(cid, ns) {
                                Ok(id) => diff.added.push(EntityRef::Namespace(id)),
                                Err(e) => warn!("Skipping NSID {} on {}: {}", ns.nsid, cid, e),
                            },
                        }
                    }

                    let gone: Vec<NamespaceId> = inner
                        .controllers
                        .get(&cid)
                        .map(|c| c.namespaces.clone())
                        .unwrap_or_default()
                        .into_iter()
                        .filter(|id| {
                            inner
                                .namespaces
                                .get(id)
                                .map_or(false, |n| !n.status.is_removed() && !present.contains(&n.nsid))
                        })
                        .collect();
                    for id in gone {
                        if let Some(n) = inner.namespaces.get_mut(&id) {
                            n.status = EntityStatus::Removed;
                            diff.removed.push(EntityRef::Namespace(id));
                        }
                    }
                }
                Err(e) => {
                    let ctrl = match inner.controllers.get_mut(&cid) {
                        Some(c) => c,
                        None => continue,
                    };
                    if ctrl.status.is_removed() {
                        continue;
                    }
                    ctrl.failed_refreshes += 1;
                    warn!(
                        "Refresh of {} ({}) failed ({}/{}): {}",
                        cid, ctrl.key, ctrl.failed_refreshes, max_failures, e
                    );

                    if ctrl.failed_refreshes > max_failures {
                        ctrl.status = EntityStatus::Removed;
                        let namespaces = ctrl.namespaces.clone();
                        diff.removed.push(EntityRef::Controller(cid));
                        for id in namespaces {
                            if let Some(n) = inner.namespaces.get_mut(&id) {
                                if !n.status.is_removed() {
                                    n.status = EntityStatus::Removed;
                                    diff.removed.push(EntityRef::Namespace(id));
                                }
                            }
                        }
                    } else if ctrl.status == EntityStatus::Active {
                        ctrl.status = EntityStatus::Incomplete;
                        diff.updated.push(EntityRef::Controller(cid));
                    }
                }
            }
        }

        for sid in touched {
            let orphaned = match inner.subsystems.get(&sid) {
                Some(s) if !s.status.is_removed() && !s.controllers.is_empty() => {
                    s.controllers.iter().all(|c| {
                        inner
                            .controllers
                            .get(c)
                            .map_or(true, |c| c.status.is_removed())
                    })
                }
                _ => false,
            };
            if orphaned {
                if let Some(s) = inner.subsystems.get_mut(&sid) {
                    s.status = EntityStatus::Removed;
                    diff.removed.push(EntityRef::Subsystem(sid));
                }
            }
        }

        if !diff.is_empty() {
            info!(
                "Refresh generation {}: {} added, {} updated, {} removed",
                diff.generation,
                diff.added.len(),
                diff.updated.len(),
                diff.removed.len()
            );
        }
        diff
    }

    /// Excise everything `diff` reported removed that is still marked removed.
    ///
    /// Entities revived since the diff are kept. Returns how many were excised.
    pub fn acknowledge(&self, diff: &TopologyDiff) -> usize {
        let mut inner = self.inner.write();
        let mut excised = 0;

        for entity in &diff.removed {
            if let EntityRef::Namespace(id) = entity {
                let removed = inner.namespaces.get(id).map_or(false, |n| n.status.is_removed());
                if removed && inner.delete_namespace(*id).is_ok() {
                    excised += 1;
                }
            }
        }
        for entity in &diff.removed {
            if let EntityRef::Controller(id) = entity {
                let removed = inner.controllers.get(id).map_or(false, |c| c.status.is_removed());
                if removed {
                    if let Ok(c) = inner.delete_controller(*id) {
                        excised += 1 + c.namespaces.len();
                    }
                }
            }
        }
        for entity in &diff.removed {
            if let EntityRef::Subsystem(id) = entity {
                let removed = inner.subsystems.get(id).map_or(false, |s| s.status.is_removed());
                if removed && inner.delete_subsystem(*id).is_ok() {
                    excised += 1;
                }
            }
        }

        debug!("Acknowledged generation {}: {} excised", diff.generation, excised);
        excised
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::NamespaceInfo;
    use crate::topology::{ControllerKey, ControllerState, Host, TopologyConfig};
    use crate::transport::{ControllerAddress, MockDevice};
    use uuid::Uuid;

    const NQN: &str = "nqn.2024-01.io.nvmekit:refresh";

    fn setup(nsids: &[u32]) -> (Topology, ControllerId) {
        let host = Host::new("nqn.2024-01.io.nvmekit:host", Uuid::new_v4(), "t").unwrap();
        let topo = Topology::new(host, TopologyConfig::default());
        let reg = topo
            .register_controller(
                ControllerKey::new(ControllerAddress::Mock { name: "a".into() }, Some(0)),
                ControllerState::Connected,
                &found(nsids),
            )
            .unwrap();
        (topo, reg.controller)
    }

    fn found(nsids: &[u32]) -> DiscoveredController {
        DiscoveredController {
            info: MockDevice::new(NQN, "SER").controller_info(),
            namespaces: nsids
                .iter()
                .map(|n| MockDevice::namespace_info(*n, 1024))
                .collect::<Vec<NamespaceInfo>>(),
        }
    }

    fn lost() -> Error {
        Error::TransportLost {
            reason: "test".into(),
        }
    }

    #[test]
    fn test_unchanged_refresh_is_empty() {
        let (topo, cid) = setup(&[1, 2]);
        let diff = topo.apply_refresh(vec![(cid, Ok(found(&[1, 2])))]);
        assert!(diff.is_empty());
        assert_eq!(diff.generation, topo.generation());
    }

    #[test]
    fn test_namespace_removed_then_acknowledged() {
        let (topo, cid) = setup(&[1, 2]);
        let ns1 = topo.find_namespace(cid, 1).unwrap().id;
        let ns2 = topo.find_namespace(cid, 2).unwrap().id;

        let diff = topo.apply_refresh(vec![(cid, Ok(found(&[1])))]);
        assert_eq!(diff.removed, vec![EntityRef::Namespace(ns2)]);
        assert_eq!(topo.namespaces_of(cid).len(), 1);
        assert_eq!(topo.namespace(ns2).unwrap().status, EntityStatus::Removed);
        assert_eq!(topo.namespaces_of(cid)[0].id, ns1);

        assert_eq!(topo.acknowledge(&diff), 1);
        assert!(topo.namespace(ns2).is_none());
        assert_eq!(topo.namespace(ns1).unwrap().status, EntityStatus::Active);
        topo.check_invariants().unwrap();
    }

    #[test]
    fn test_reappearing_namespace_revived_in_place() {
        let (topo, cid) = setup(&[1, 2]);
        let ns2 = topo.find_namespace(cid, 2).unwrap().id;
        let first = topo.apply_refresh(vec![(cid, Ok(found(&[1])))]);
        let second = topo.apply_refresh(vec![(cid, Ok(found(&[1, 2])))]);
        assert_eq!(second.updated, vec![EntityRef::Namespace(ns2)]);
        assert!(second.added.is_empty());

        assert_eq!(topo.acknowledge(&first), 0);
        assert_eq!(topo.namespace(ns2).unwrap().status, EntityStatus::Active);
    }

    #[test]
    fn test_resize_and_new_namespace() {
        let (topo, cid) = setup(&[1]);
        let mut refreshed = found(&[1, 3]);
        refreshed.namespaces[0].nsze = 4096;
        let diff = topo.apply_refresh(vec![(cid, Ok(refreshed))]);
        assert_eq!(diff.updated.len(), 1);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(topo.find_namespace(cid, 1).unwrap().size, 4096);
    }

    #[test]
    fn test_failures_mark_incomplete_then_removed() {
        let (topo, cid) = setup(&[1]);
        let sid = topo.controller(cid).unwrap().subsystem;

        let d1 = topo.apply_refresh(vec![(cid, Err(lost()))]);
        assert_eq!(d1.updated, vec![EntityRef::Controller(cid)]);
        assert_eq!(topo.controller(cid).unwrap().status, EntityStatus::Incomplete);
        assert_eq!(topo.namespaces_of(cid).len(), 1);

        topo.apply_refresh(vec![(cid, Err(lost()))]);
        topo.apply_refresh(vec![(cid, Err(lost()))]);
        assert_eq!(topo.controller(cid).unwrap().status, EntityStatus::Incomplete);

        let d4 = topo.apply_refresh(vec![(cid, Err(lost()))]);
        assert!(d4.removed.contains(&EntityRef::Controller(cid)));
        assert!(d4.removed.contains(&EntityRef::Subsystem(sid)));
        assert!(topo.subsystems().is_empty());

        assert_eq!(topo.acknowledge(&d4), 3);
        assert!(topo.controller(cid).is_none());
        assert!(topo.find_subsystem(NQN).is_none());
        topo.check_invariants().unwrap();
    }

    #[test]
    fn test_success_clears_incomplete() {
        let (topo, cid) = setup(&[1]);
        topo.apply_refresh(vec![(cid, Err(lost()))]);
        let diff = topo.apply_refresh(vec![(cid, Ok(found(&[1])))]);
        assert_eq!(diff.updated, vec![EntityRef::Controller(cid)]);
        let ctrl = topo.controller(cid).unwrap();
        assert_eq!(ctrl.status, EntityStatus::Active);
        assert_eq!(ctrl.failed_refreshes, 0);
    }

    #[test]
    fn test_subsystem_change_counts_as_failure() {
        let (topo, cid) = setup(&[1]);
        let mut moved = found(&[1]);
        moved.info.subnqn = "nqn.2024-01.io.nvmekit:other".into();
        topo.apply_refresh(vec![(cid, Ok(moved))]);
        assert_eq!(topo.controller(cid).unwrap().failed_refreshes, 1);
        assert!(topo.find_subsystem("nqn.2024-01.io.nvmekit:other").is_none());
    }
}
