//! Property-Based Tests for the Topology Model
//!
//! Random sequences of refresh outcomes are applied to a topology and the
//! identity invariants are checked after every step.
//!
//! # Test Properties
//!
//! 1. **Uniqueness**: NQNs, controller keys and per-controller NSIDs never repeat
//! 2. **Stable handles**: a namespace present in consecutive refreshes keeps its handle
//! 3. **Visibility**: `namespaces_of` lists exactly the NSIDs last discovered

#![cfg(test)]

use std::collections::{BTreeSet, HashMap};

use proptest::prelude::*;
use uuid::Uuid;

use super::{ControllerId, ControllerKey, ControllerState, Host, Topology, TopologyConfig};
use crate::discovery::DiscoveredController;
use crate::error::Error;
use crate::transport::{ControllerAddress, MockDevice};

// =============================================================================
// Strategies
// =============================================================================

/// One refresh step for one of three controllers: a set of NSIDs or a failure.
#[derive(Debug, Clone)]
enum Step {
    Found(usize, BTreeSet<u32>),
    Failed(usize),
    Acknowledge,
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (0usize..3, prop::collection::btree_set(1u32..12, 0..6))
            .prop_map(|(c, ids)| Step::Found(c, ids)),
        1 => (0usize..3).prop_map(Step::Failed),
        1 => Just(Step::Acknowledge),
    ]
}

fn nqn(i: usize) -> String {
    // controllers 0 and 1 share a subsystem
    format!("nqn.2024-01.io.nvmekit:prop{}", i / 2)
}

fn found(i: usize, ids: &BTreeSet<u32>) -> DiscoveredController {
    DiscoveredController {
        info: MockDevice::new(&nqn(i), &format!("S{}", i)).controller_info(),
        namespaces: ids
            .iter()
            .map(|n| MockDevice::namespace_info(*n, 64 + *n as u64))
            .collect(),
    }
}

fn setup() -> (Topology, Vec<ControllerId>) {
    let host = Host::new("nqn.2024-01.io.nvmekit:prophost", Uuid::new_v4(), "prop").unwrap();
    let topo = Topology::new(host, TopologyConfig::default());
    let ids = (0..3)
        .map(|i| {
            topo.register_controller(
                ControllerKey::new(
                    ControllerAddress::Mock {
                        name: format!("c{}", i),
                    },
                    Some(i as u32),
                ),
                ControllerState::Connected,
                &found(i, &BTreeSet::new()),
            )
            .unwrap()
            .controller
        })
        .collect();
    (topo, ids)
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: identity keys stay unique across any refresh sequence.
    #[test]
    fn prop_refresh_never_duplicates(steps in prop::collection::vec(step_strategy(), 1..25)) {
        let (topo, ids) = setup();
        let mut pending = Vec::new();

        for step in steps {
            match step {
                Step::Found(c, nsids) => {
                    let diff = topo.apply_refresh(vec![(ids[c], Ok(found(c, &nsids)))]);
                    pending.push(diff);
                }
                Step::Failed(c) => {
                    let diff = topo.apply_refresh(vec![(
                        ids[c],
                        Err(Error::TransportLost { reason: "prop".into() }),
                    )]);
                    pending.push(diff);
                }
                Step::Acknowledge => {
                    for diff in pending.drain(..) {
                        topo.acknowledge(&diff);
                    }
                }
            }
            prop_assert!(topo.check_invariants().is_ok());
        }
    }

    /// Property: handles survive in-place updates and listings match discovery.
    #[test]
    fn prop_handles_stable(rounds in prop::collection::vec(prop::collection::btree_set(1u32..8, 0..5), 1..10)) {
        let (topo, ids) = setup();
        let cid = ids[2];
        let mut handles: HashMap<u32, _> = HashMap::new();

        for nsids in rounds {
            topo.apply_refresh(vec![(cid, Ok(found(2, &nsids)))]);

            let listed: BTreeSet<u32> = topo.namespaces_of(cid).iter().map(|n| n.nsid).collect();
            prop_assert_eq!(&listed, &nsids);

            for nsid in &nsids {
                let id = topo.find_namespace(cid, *nsid).map(|n| n.id);
                prop_assert!(id.is_some());
                if let Some(prev) = handles.get(nsid) {
                    prop_assert_eq!(Some(*prev), id);
                }
                if let Some(id) = id {
                    handles.insert(*nsid, id);
                }
            }
        }
    }
}
