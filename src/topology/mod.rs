//! Topology Model
//!
//! In-memory graph of everything one host can reach:
//!
//! ```text
//! Host
//!  └── Subsystem (NQN)
//!       └── Controller (transport address + instance)
//!            └── Namespace (NSID)
//! ```
//!
//! Entities are stored in arenas and refer to each other by handle
//! ([`SubsystemId`], [`ControllerId`], [`NamespaceId`]). Handles survive
//! in-place updates, so a caller holding one across a refresh still resolves
//! the same entity.

pub mod entities;
pub mod model;
mod proptest;
pub mod reconcile;

pub use entities::{
    validate_nqn, Controller, ControllerId, ControllerKey, ControllerState, EntityStatus, Host,
    Namespace, NamespaceId, Subsystem, SubsystemId,
};
pub use model::{
    ControllerView, Registration, SubsystemView, Topology, TopologyConfig, TopologySnapshot,
};
pub use reconcile::{EntityRef, TopologyDiff};
