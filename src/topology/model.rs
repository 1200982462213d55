//! Arena-backed topology store.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::entities::{
    validate_nqn, Controller, ControllerId, ControllerKey, ControllerState, EntityStatus, Host,
    Namespace, NamespaceId, Subsystem, SubsystemId,
};
use crate::codec::{ControllerInfo, NamespaceInfo};
use crate::discovery::DiscoveredController;
use crate::error::{Error, Result};

/// Topology configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Consecutive failed refreshes an entity survives before it is marked removed
    pub max_incomplete_refreshes: u32,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            max_incomplete_refreshes: 3,
        }
    }
}

/// Handles created by [`Topology::register_controller`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub subsystem: SubsystemId,
    pub controller: ControllerId,
    pub namespaces: Vec<NamespaceId>,
}

/// Consistent copy of the whole graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub generation: u64,
    pub host: Host,
    pub subsystems: Vec<SubsystemView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubsystemView {
    pub subsystem: Subsystem,
    pub controllers: Vec<ControllerView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerView {
    pub controller: Controller,
    pub namespaces: Vec<Namespace>,
}

#[derive(Debug, Default)]
pub(crate) struct Inner {
    pub(crate) generation: u64,
    next_id: u64,
    pub(crate) subsystems: BTreeMap<SubsystemId, Subsystem>,
    pub(crate) controllers: BTreeMap<ControllerId, Controller>,
    pub(crate) namespaces: BTreeMap<NamespaceId, Namespace>,
    by_nqn: HashMap<String, SubsystemId>,
    by_key: HashMap<ControllerKey, ControllerId>,
    by_nsid: HashMap<(ControllerId, u32), NamespaceId>,
}

fn not_found(key: impl ToString) -> Error {
    Error::EntityNotFound {
        key: key.to_string(),
    }
}

impl Inner {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub(crate) fn insert_subsystem(&mut self, nqn: &str) -> Result<SubsystemId> {
        validate_nqn(nqn)?;
        if self.by_nqn.contains_key(nqn) {
            return Err(Error::DuplicateIdentity {
                key: nqn.to_string(),
            });
        }
        let id = SubsystemId(self.next());
        self.subsystems.insert(
            id,
            Subsystem {
                id,
                nqn: nqn.to_string(),
                status: EntityStatus::Active,
                controllers: Vec::new(),
            },
        );
        self.by_nqn.insert(nqn.to_string(), id);
        Ok(id)
    }

    pub(crate) fn insert_controller(
        &mut self,
        subsystem: SubsystemId,
        key: ControllerKey,
        state: ControllerState,
    ) -> Result<ControllerId> {
        if !self.subsystems.contains_key(&subsystem) {
            return Err(not_found(subsystem));
        }
        if self.by_key.contains_key(&key) {
            return Err(Error::DuplicateIdentity {
                key: key.to_string(),
            });
        }
        let id = ControllerId(self.next());
        self.by_key.insert(key.clone(), id);
        self.controllers
            .insert(id, Controller::new(id, subsystem, key, state));
        if let Some(s) = self.subsystems.get_mut(&subsystem) {
            s.controllers.push(id);
        }
        Ok(id)
    }

    pub(crate) fn insert_namespace(
        &mut self,
        controller: ControllerId,
        info: &NamespaceInfo,
    ) -> Result<NamespaceId> {
        if !self.controllers.contains_key(&controller) {
            return Err(not_found(controller));
        }
        if self.by_nsid.contains_key(&(controller, info.nsid)) {
            return Err(Error::DuplicateIdentity {
                key: format!("{}/nsid {}", controller, info.nsid),
            });
        }
        let id = NamespaceId(self.next());
        self.namespaces
            .insert(id, Namespace::new(id, controller, info));
        self.by_nsid.insert((controller, info.nsid), id);
        if let Some(c) = self.controllers.get_mut(&controller) {
            c.namespaces.push(id);
        }
        Ok(id)
    }

    pub(crate) fn delete_namespace(&mut self, id: NamespaceId) -> Result<Namespace> {
        let ns = self.namespaces.remove(&id).ok_or_else(|| not_found(id))?;
        self.by_nsid.remove(&(ns.controller, ns.nsid));
        if let Some(c) = self.controllers.get_mut(&ns.controller) {
            c.namespaces.retain(|n| *n != id);
        }
        Ok(ns)
    }

    pub(crate) fn delete_controller(&mut self, id: ControllerId) -> Result<Controller> {
        let ctrl = self.controllers.remove(&id).ok_or_else(|| not_found(id))?;
        for ns in &ctrl.namespaces {
            if let Some(removed) = self.namespaces.remove(ns) {
                self.by_nsid.remove(&(id, removed.nsid));
            }
        }
        self.by_key.remove(&ctrl.key);
        if let Some(s) = self.subsystems.get_mut(&ctrl.subsystem) {
            s.controllers.retain(|c| *c != id);
        }
        Ok(ctrl)
    }

    pub(crate) fn delete_subsystem(&mut self, id: SubsystemId) -> Result<Subsystem> {
        let controllers = self
            .subsystems
            .get(&id)
            .ok_or_else(|| not_found(id))?
            .controllers
            .clone();
        for c in controllers {
            self.delete_controller(c)?;
        }
        let subsystem = self.subsystems.remove(&id).ok_or_else(|| not_found(id))?;
        self.by_nqn.remove(&subsystem.nqn);
        Ok(subsystem)
    }

    pub(crate) fn namespace_by_nsid(&self, controller: ControllerId, nsid: u32) -> Option<NamespaceId> {
        self.by_nsid.get(&(controller, nsid)).copied()
    }

    fn live_namespaces(&self, controller: &Controller) -> Vec<Namespace> {
        let mut out: Vec<Namespace> = controller
            .namespaces
            .iter()
            .filter_map(|id| self.namespaces.get(id))
            .filter(|ns| !ns.status.is_removed())
            .cloned()
            .collect();
        out.sort_by_key(|ns| ns.nsid);
        out
    }
}

/// Host → Subsystem → Controller → Namespace graph.
///
/// Entities live in arenas keyed by stable handles; every mutation holds the
/// write lock for its whole duration so readers only ever see complete states.
#[derive(Debug)]
pub struct Topology {
    host: Host,
    config: TopologyConfig,
    pub(crate) inner: RwLock<Inner>,
}

impl Topology {
    pub fn new(host: Host, config: TopologyConfig) -> Self {
        Self {
            host,
            config,
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn config(&self) -> &TopologyConfig {
        &self.config
    }

    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    pub fn add_subsystem(&self, nqn: &str) -> Result<SubsystemId> {
        let id = self.inner.write().insert_subsystem(nqn)?;
        debug!("Added {} ({})", id, nqn);
        Ok(id)
    }

    /// Remove a subsystem with all its controllers and namespaces.
    pub fn remove_subsystem(&self, id: SubsystemId) -> Result<()> {
        let s = self.inner.write().delete_subsystem(id)?;
        debug!("Removed {} ({})", id, s.nqn);
        Ok(())
    }

    pub fn add_controller(
        &self,
        subsystem: SubsystemId,
        key: ControllerKey,
        state: ControllerState,
    ) -> Result<ControllerId> {
        self.inner.write().insert_controller(subsystem, key, state)
    }

    /// Remove a controller with its namespaces.
    pub fn remove_controller(&self, id: ControllerId) -> Result<()> {
        self.inner.write().delete_controller(id).map(|_| ())
    }

    pub fn add_namespace(&self, controller: ControllerId, info: &NamespaceInfo) -> Result<NamespaceId> {
        self.inner.write().insert_namespace(controller, info)
    }

    pub fn remove_namespace(&self, id: NamespaceId) -> Result<()> {
        self.inner.write().delete_namespace(id).map(|_| ())
    }

    /// Copy Identify Controller data onto an existing controller.
    pub fn set_controller_info(&self, id: ControllerId, info: &ControllerInfo) -> Result<bool> {
        let mut inner = self.inner.write();
        let ctrl = inner.controllers.get_mut(&id).ok_or_else(|| not_found(id))?;
        Ok(ctrl.apply_info(info))
    }

    /// Insert subsystem (if new), controller and namespaces in one step.
    ///
    /// Nothing is inserted when any part fails.
    pub fn register_controller(
        &self,
        key: ControllerKey,
        state: ControllerState,
        discovered: &DiscoveredController,
    ) -> Result<Registration> {
        let nqn = discovered.info.subnqn.as_str();
        validate_nqn(nqn)?;

        let mut inner = self.inner.write();
        if inner.by_key.contains_key(&key) {
            return Err(Error::DuplicateIdentity {
                key: key.to_string(),
            });
        }
        let mut seen = std::collections::HashSet::new();
        for ns in &discovered.namespaces {
            if !seen.insert(ns.nsid) {
                return Err(Error::DuplicateIdentity {
                    key: format!("{}/nsid {}", key, ns.nsid),
                });
            }
        }

        let existing = inner.by_nqn.get(nqn).copied();
        let subsystem = match existing {
            Some(id) => {
                if let Some(s) = inner.subsystems.get_mut(&id) {
                    s.status = EntityStatus::Active;
                }
                id
            }
            None => inner.insert_subsystem(nqn)?,
        };
        let controller = inner.insert_controller(subsystem, key.clone(), state)?;
        if let Some(c) = inner.controllers.get_mut(&controller) {
            c.apply_info(&discovered.info);
        }
        let namespaces = discovered
            .namespaces
            .iter()
            .map(|ns| inner.insert_namespace(controller, ns))
            .collect::<Result<Vec<_>>>()?;
        inner.generation += 1;

        info!(
            "Registered {} ({}) under {} with {} namespace(s)",
            controller,
            key,
            nqn,
            namespaces.len()
        );
        Ok(Registration {
            subsystem,
            controller,
            namespaces,
        })
    }

    /// Move a controller along its state machine; returns the previous state.
    ///
    /// Setting the current state again is a no-op.
    pub fn set_controller_state(&self, id: ControllerId, next: ControllerState) -> Result<ControllerState> {
        let mut inner = self.inner.write();
        let ctrl = inner.controllers.get_mut(&id).ok_or_else(|| not_found(id))?;
        let prev = ctrl.state;
        if prev == next {
            return Ok(prev);
        }
        if !prev.can_transition_to(next) {
            return Err(Error::InvalidState {
                entity: id.to_string(),
                reason: format!("cannot go from {} to {}", prev, next),
            });
        }
        ctrl.state = next;
        info!("{} ({}) {} -> {}", id, ctrl.key, prev, next);
        Ok(prev)
    }

    /// Replace a controller's key, e.g. after a reconnect picked a new instance.
    pub fn rekey_controller(&self, id: ControllerId, key: ControllerKey) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(&owner) = inner.by_key.get(&key) {
            if owner == id {
                return Ok(());
            }
            return Err(Error::DuplicateIdentity {
                key: key.to_string(),
            });
        }
        let ctrl = inner.controllers.get_mut(&id).ok_or_else(|| not_found(id))?;
        let old = std::mem::replace(&mut ctrl.key, key.clone());
        inner.by_key.remove(&old);
        inner.by_key.insert(key, id);
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn find_subsystem(&self, nqn: &str) -> Option<Subsystem> {
        let inner = self.inner.read();
        let id = inner.by_nqn.get(nqn)?;
        inner.subsystems.get(id).cloned()
    }

    pub fn subsystem(&self, id: SubsystemId) -> Option<Subsystem> {
        self.inner.read().subsystems.get(&id).cloned()
    }

    /// Subsystems not marked removed.
    pub fn subsystems(&self) -> Vec<Subsystem> {
        self.inner
            .read()
            .subsystems
            .values()
            .filter(|s| !s.status.is_removed())
            .cloned()
            .collect()
    }

    pub fn find_controller(&self, key: &ControllerKey) -> Option<Controller> {
        let inner = self.inner.read();
        let id = inner.by_key.get(key)?;
        inner.controllers.get(id).cloned()
    }

    pub fn find_controller_by<F>(&self, predicate: F) -> Option<Controller>
    where
        F: Fn(&Controller) -> bool,
    {
        self.inner
            .read()
            .controllers
            .values()
            .find(|c| predicate(c))
            .cloned()
    }

    pub fn controller(&self, id: ControllerId) -> Option<Controller> {
        self.inner.read().controllers.get(&id).cloned()
    }

    /// Every controller, removed ones included.
    pub fn controllers(&self) -> Vec<Controller> {
        self.inner.read().controllers.values().cloned().collect()
    }

    /// Controllers of a subsystem not marked removed.
    pub fn controllers_of(&self, subsystem: SubsystemId) -> Vec<Controller> {
        let inner = self.inner.read();
        inner
            .subsystems
            .get(&subsystem)
            .map(|s| {
                s.controllers
                    .iter()
                    .filter_map(|id| inner.controllers.get(id))
                    .filter(|c| !c.status.is_removed())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Namespaces of a controller not marked removed, by NSID.
    pub fn namespaces_of(&self, controller: ControllerId) -> Vec<Namespace> {
        let inner = self.inner.read();
        inner
            .controllers
            .get(&controller)
            .map(|c| inner.live_namespaces(c))
            .unwrap_or_default()
    }

    /// Resolves until the namespace is excised, even when marked removed.
    pub fn namespace(&self, id: NamespaceId) -> Option<Namespace> {
        self.inner.read().namespaces.get(&id).cloned()
    }

    pub fn find_namespace(&self, controller: ControllerId, nsid: u32) -> Option<Namespace> {
        let inner = self.inner.read();
        let id = inner.namespace_by_nsid(controller, nsid)?;
        inner.namespaces.get(&id).cloned()
    }

    pub fn controller_states(&self) -> HashMap<ControllerState, usize> {
        let mut counts = HashMap::new();
        for c in self.inner.read().controllers.values() {
            *counts.entry(c.state).or_insert(0) += 1;
        }
        counts
    }

    /// Everything not marked removed, taken under one read lock.
    pub fn snapshot(&self) -> TopologySnapshot {
        let inner = self.inner.read();
        let subsystems = inner
            .subsystems
            .values()
            .filter(|s| !s.status.is_removed())
            .map(|s| SubsystemView {
                subsystem: s.clone(),
                controllers: s
                    .controllers
                    .iter()
                    .filter_map(|id| inner.controllers.get(id))
                    .filter(|c| !c.status.is_removed())
                    .map(|c| ControllerView {
                        controller: c.clone(),
                        namespaces: inner.live_namespaces(c),
                    })
                    .collect(),
            })
            .collect();

        TopologySnapshot {
            generation: inner.generation,
            host: self.host.clone(),
            subsystems,
        }
    }

    /// Verify identity indexes and ownership edges agree with the arenas.
    pub fn check_invariants(&self) -> Result<()> {
        let inner = self.inner.read();
        let broken = |what: String| Err(Error::Internal(format!("topology invariant: {}", what)));

        if inner.by_nqn.len() != inner.subsystems.len() {
            return broken("subsystem index size".into());
        }
        for (nqn, id) in &inner.by_nqn {
            match inner.subsystems.get(id) {
                Some(s) if &s.nqn == nqn => {}
                _ => return broken(format!("NQN {} indexes a missing subsystem", nqn)),
            }
        }

        if inner.by_key.len() != inner.controllers.len() {
            return broken("controller index size".into());
        }
        for c in inner.controllers.values() {
            if inner.by_key.get(&c.key) != Some(&c.id) {
                return broken(format!("{} key not indexed", c.id));
            }
            let owners = inner
                .subsystems
                .values()
                .filter(|s| s.controllers.contains(&c.id))
                .count();
            if owners != 1 || !inner
                .subsystems
                .get(&c.subsystem)
                .map_or(false, |s| s.controllers.contains(&c.id))
            {
                return broken(format!("{} owned by {} subsystems", c.id, owners));
            }
            let mut nsids: Vec<u32> = c
                .namespaces
                .iter()
                .filter_map(|n| inner.namespaces.get(n))
                .map(|n| n.nsid)
                .collect();
            let total = nsids.len();
            nsids.sort_unstable();
            nsids.dedup();
            if total != nsids.len() || total != c.namespaces.len() {
                return broken(format!("{} has duplicate or dangling namespaces", c.id));
            }
        }

        if inner.by_nsid.len() != inner.namespaces.len() {
            return broken("namespace index size".into());
        }
        for ns in inner.namespaces.values() {
            if inner.by_nsid.get(&(ns.controller, ns.nsid)) != Some(&ns.id) {
                return broken(format!("{} not indexed", ns.id));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ControllerAddress, MockDevice};
    use assert_matches::assert_matches;
    use uuid::Uuid;

    const NQN: &str = "nqn.2024-01.io.nvmekit:model";

    fn topology() -> Topology {
        let host = Host::new("nqn.2024-01.io.nvmekit:host", Uuid::new_v4(), "test").unwrap();
        Topology::new(host, TopologyConfig::default())
    }

    fn key(name: &str) -> ControllerKey {
        ControllerKey::new(
            ControllerAddress::Mock {
                name: name.to_string(),
            },
            Some(0),
        )
    }

    fn discovered(nsids: &[u32]) -> DiscoveredController {
        let device = MockDevice::new(NQN, "SER");
        DiscoveredController {
            info: device.controller_info(),
            namespaces: nsids
                .iter()
                .map(|n| MockDevice::namespace_info(*n, 1024))
                .collect(),
        }
    }

    #[test]
    fn test_register_one_subsystem_two_namespaces() {
        let topo = topology();
        let reg = topo
            .register_controller(key("a"), ControllerState::Connected, &discovered(&[1, 2]))
            .unwrap();

        assert_eq!(topo.subsystems().len(), 1);
        assert_eq!(topo.find_subsystem(NQN).unwrap().id, reg.subsystem);
        assert_eq!(topo.controllers_of(reg.subsystem).len(), 1);
        let ns = topo.namespaces_of(reg.controller);
        assert_eq!(ns.iter().map(|n| n.nsid).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(topo.controller(reg.controller).unwrap().status, EntityStatus::Active);
        topo.check_invariants().unwrap();
    }

    #[test]
    fn test_register_duplicate_is_atomic() {
        let topo = topology();
        topo.register_controller(key("a"), ControllerState::Connected, &discovered(&[1]))
            .unwrap();
        assert_matches!(
            topo.register_controller(key("a"), ControllerState::Connected, &discovered(&[1])),
            Err(Error::DuplicateIdentity { .. })
        );
        assert_matches!(
            topo.register_controller(key("b"), ControllerState::Connected, &discovered(&[3, 3])),
            Err(Error::DuplicateIdentity { .. })
        );
        assert_eq!(topo.controllers().len(), 1);
        topo.check_invariants().unwrap();
    }

    #[test]
    fn test_second_controller_joins_subsystem() {
        let topo = topology();
        let a = topo
            .register_controller(key("a"), ControllerState::Connected, &discovered(&[1]))
            .unwrap();
        let b = topo
            .register_controller(key("b"), ControllerState::Connected, &discovered(&[1]))
            .unwrap();
        assert_eq!(a.subsystem, b.subsystem);
        assert_eq!(topo.controllers_of(a.subsystem).len(), 2);
    }

    #[test]
    fn test_primitives_and_errors() {
        let topo = topology();
        let s = topo.add_subsystem(NQN).unwrap();
        assert_matches!(topo.add_subsystem(NQN), Err(Error::DuplicateIdentity { .. }));
        assert_matches!(topo.add_subsystem(""), Err(Error::InvalidArgument(_)));

        let c = topo
            .add_controller(s, key("a"), ControllerState::Disconnected)
            .unwrap();
        assert_eq!(topo.controller(c).unwrap().status, EntityStatus::Incomplete);
        let n = topo
            .add_namespace(c, &MockDevice::namespace_info(7, 8))
            .unwrap();
        assert_matches!(
            topo.add_namespace(c, &MockDevice::namespace_info(7, 8)),
            Err(Error::DuplicateIdentity { .. })
        );
        assert_eq!(topo.find_namespace(c, 7).unwrap().id, n);

        topo.remove_namespace(n).unwrap();
        assert_matches!(topo.remove_namespace(n), Err(Error::EntityNotFound { .. }));
        topo.remove_subsystem(s).unwrap();
        assert!(topo.controller(c).is_none());
        topo.check_invariants().unwrap();
    }

    #[test]
    fn test_state_transitions_validated() {
        let topo = topology();
        let s = topo.add_subsystem(NQN).unwrap();
        let c = topo
            .add_controller(s, key("a"), ControllerState::Disconnected)
            .unwrap();
        assert_matches!(
            topo.set_controller_state(c, ControllerState::Connected),
            Err(Error::InvalidState { .. })
        );
        topo.set_controller_state(c, ControllerState::Connecting).unwrap();
        assert_eq!(
            topo.set_controller_state(c, ControllerState::Connected).unwrap(),
            ControllerState::Connecting
        );
        topo.set_controller_state(c, ControllerState::Connected).unwrap();
        assert_eq!(topo.controller_states()[&ControllerState::Connected], 1);
    }

    #[test]
    fn test_rekey_controller() {
        let topo = topology();
        let a = topo
            .register_controller(key("a"), ControllerState::Connected, &discovered(&[]))
            .unwrap();
        let mut moved = key("a");
        moved.instance = Some(4);
        topo.rekey_controller(a.controller, moved.clone()).unwrap();
        assert!(topo.find_controller(&key("a")).is_none());
        assert_eq!(topo.find_controller(&moved).unwrap().id, a.controller);
        topo.check_invariants().unwrap();
    }

    #[test]
    fn test_snapshot_serializes() {
        let topo = topology();
        topo.register_controller(key("a"), ControllerState::Connected, &discovered(&[1, 2]))
            .unwrap();
        let snap = topo.snapshot();
        assert_eq!(snap.subsystems[0].controllers[0].namespaces.len(), 2);
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains(NQN));
    }
}
