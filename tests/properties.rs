// Copyright 2018 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Randomized invariant checks, a round-trip law, and boundary behaviors,
//! run over small bounded inputs with plain `rand` rather than a dedicated
//! property-testing framework.

use std::collections::HashSet;
use std::time::Duration;

use rand::rngs::ThreadRng;
use rand::seq::SliceRandom;
use rand::Rng;

use resource_graph::{CoordinatedGraph, HubConfig, ResourceCell, ResourceHooks, ResourceHub, ResourceState};

const T: Duration = Duration::from_millis(200);
const ITERATIONS: usize = 200;

fn random_key(rng: &mut ThreadRng, pool: usize) -> u32 {
    rng.gen_range(0..pool as u32)
}

/// Property 1: acyclicity. After any sequence of add-node / add-edge /
/// remove-node operations, a topological sort returns all nodes, or the
/// graph is empty.
#[test]
fn property_acyclicity_holds_under_random_mutation() {
    let mut rng = rand::thread_rng();
    for _ in 0..ITERATIONS {
        let g: CoordinatedGraph<u32, ()> = CoordinatedGraph::new();
        let mut present: HashSet<u32> = HashSet::new();
        for _ in 0..30 {
            match rng.gen_range(0..3) {
                0 => {
                    let k = random_key(&mut rng, 8);
                    g.ensure_node(k, (), T).unwrap();
                    present.insert(k);
                }
                1 => {
                    let a = random_key(&mut rng, 8);
                    let b = random_key(&mut rng, 8);
                    if present.contains(&a) && present.contains(&b) {
                        let _ = g.add_edge(&a, &b, T); // rejected edges are a no-op, not a bug
                    }
                }
                _ => {
                    let k = random_key(&mut rng, 8);
                    if g.remove_node(&k, T).unwrap() {
                        present.remove(&k);
                    }
                }
            }
        }
        let order = g.topo_sort(T).unwrap();
        assert_eq!(order.len(), present.len(), "topo_sort must cover every node in an acyclic graph");
        let ordered: HashSet<u32> = order.into_iter().collect();
        assert_eq!(ordered, present);
    }
}

/// Property 2: adjacency symmetry. For every edge `u -> v`, `v` is in
/// `u`'s dependency set and `u` is in `v`'s dependent set.
#[test]
fn property_adjacency_symmetry() {
    let mut rng = rand::thread_rng();
    let g: CoordinatedGraph<u32, ()> = CoordinatedGraph::new();
    for k in 0..10 {
        g.ensure_node(k, (), T).unwrap();
    }
    let mut edges: Vec<(u32, u32)> = Vec::new();
    for _ in 0..40 {
        let a = random_key(&mut rng, 10);
        let b = random_key(&mut rng, 10);
        if g.add_edge(&a, &b, T).is_ok() {
            edges.push((a, b));
        }
    }
    for (a, b) in edges {
        assert!(g.dependencies_of(&a, T).unwrap().contains(&b));
        assert!(g.dependents_of(&b, T).unwrap().contains(&a));
    }
}

struct SizedResource {
    bytes: usize,
}
impl ResourceHooks for SizedResource {
    fn estimated_bytes_in_memory(&self) -> usize {
        self.bytes
    }
    fn load(&mut self) -> Result<(), String> {
        Ok(())
    }
    fn unload(&mut self) {}
}

/// Property 3: no-eviction-of-depended-upon. Any resource the eviction
/// pass removes had no in-edges (no dependents) at the moment it was
/// selected.
#[test]
fn property_eviction_never_takes_a_depended_upon_resource() {
    let mut rng = rand::thread_rng();
    for _ in 0..20 {
        let hub: ResourceHub<u32> = ResourceHub::new(HubConfig::new().worker_count(1).memory_budget(150));
        hub.register_type("t", || Box::new(SizedResource { bytes: 50 }));
        for k in 0..6u32 {
            drop(hub.load("t", &k).unwrap());
        }
        // random acyclic dependency edges over 0..6, only forward (a -> b, a < b)
        // so they can never close a cycle.
        for _ in 0..6 {
            let a = rng.gen_range(0..5u32);
            let b = rng.gen_range(a + 1..6u32);
            hub.add_dependency(&a, &b);
        }
        let before: Vec<(u32, usize)> = (0..6u32)
            .map(|k| (k, hub.dependents_of(&k).map(|d| d.len()).unwrap_or(0)))
            .collect();
        hub.enforce_memory_budget();
        for (key, dependents) in before {
            if !hub.has_resource(&key) {
                assert_eq!(dependents, 0, "evicted key {key} had dependents at the time of eviction");
            }
        }
    }
}

/// Property 4: reference-count monotonicity. Successful loads (handle
/// clones) strictly increase the reference count; drops strictly decrease
/// it; it never goes negative (expressed here as never underflowing below
/// the baseline).
#[test]
fn property_reference_count_monotonicity() {
    let mut rng = rand::thread_rng();
    let mut cell = ResourceCell::new("t");
    cell.set_loaded(Box::new(SizedResource { bytes: 1 }));
    let mut live = Vec::new();
    let mut expected = 1usize; // the cell's own baseline
    assert_eq!(cell.reference_count(), expected);
    for _ in 0..ITERATIONS {
        if live.is_empty() || rng.gen_bool(0.6) {
            live.push(cell.handle().unwrap());
            expected += 1;
        } else {
            live.pop();
            expected -= 1;
        }
        assert_eq!(cell.reference_count(), expected);
        assert!(cell.reference_count() >= 1);
    }
}

/// Property 5: state-machine conformance. `ResourceState::can_transition_to`
/// agrees exactly with the table in the component design: any pair not
/// explicitly listed is rejected.
#[test]
fn property_state_machine_conformance() {
    use ResourceState::*;
    let allowed: &[(ResourceState, ResourceState)] = &[
        (Unloaded, Loading),
        (Loading, Loaded),
        (Loading, LoadingFailed),
        (Loaded, Unloading),
        (Unloading, Unloaded),
        (LoadingFailed, Loading),
        (LoadingFailed, Unloaded),
    ];
    let all = [Unloaded, Loading, Loaded, LoadingFailed, Unloading];
    for &from in &all {
        for &to in &all {
            let expected = allowed.contains(&(from, to));
            assert_eq!(from.can_transition_to(to), expected, "{from:?} -> {to:?}");
        }
    }
}

/// Property 6: deadlock freedom for forward-order acquisition. Several
/// threads locking nodes strictly in dependency order (never reverse) all
/// complete within their timeouts.
#[test]
fn property_forward_order_locking_is_deadlock_free() {
    let g: CoordinatedGraph<u32, u32> = CoordinatedGraph::new();
    for k in 0..5u32 {
        g.ensure_node(k, 0, T).unwrap();
    }
    for k in 0..4u32 {
        g.add_edge(&k, &(k + 1), T).unwrap();
    }
    let locks = resource_graph::LockTable::new(g);
    let mut handles = Vec::new();
    for _ in 0..4 {
        let locks = locks.clone();
        handles.push(std::thread::spawn(move || {
            let keys: Vec<u32> = (0..5).collect();
            locks
                .lock_all(&keys, resource_graph::LockMode::Shared, Duration::from_millis(500))
                .unwrap()
        }));
    }
    for h in handles {
        assert!(h.join().is_ok());
    }
}

/// Property 7: idempotent shutdown. Any number of repeated `shutdown`
/// calls behave the same as one.
#[test]
fn property_shutdown_is_idempotent_under_repetition() {
    let hub: ResourceHub<u32> = ResourceHub::new(HubConfig::new().worker_count(2));
    for _ in 0..5 {
        hub.shutdown();
    }
    assert_eq!(hub.worker_count(), 0);
}

/// Round-trip law: `add_dependency` then `remove_dependency` is
/// equivalent to neither having been called, with respect to topological
/// order and dependency queries.
#[test]
fn round_trip_add_then_remove_dependency_is_a_no_op() {
    let mut rng = rand::thread_rng();
    for _ in 0..50 {
        let g: CoordinatedGraph<u32, ()> = CoordinatedGraph::new();
        for k in 0..6u32 {
            g.ensure_node(k, (), T).unwrap();
        }
        let mut keys: Vec<u32> = (0..6).collect();
        keys.shuffle(&mut rng);
        let a = keys[0];
        let b = keys[1];
        let before = g.topo_sort(T).unwrap();
        let before_deps = g.dependencies_of(&a, T).unwrap();

        if g.add_edge(&a, &b, T).is_ok() {
            g.remove_edge(&a, &b, T).unwrap();
        }

        let after = g.topo_sort(T).unwrap();
        let after_deps = g.dependencies_of(&a, T).unwrap();
        assert_eq!(before.iter().collect::<HashSet<_>>(), after.iter().collect::<HashSet<_>>());
        assert_eq!(before_deps, after_deps);
    }
}

/// Boundary: empty graph returns empty topological sort.
#[test]
fn boundary_empty_graph_topo_sort_is_empty() {
    let g: CoordinatedGraph<u32, ()> = CoordinatedGraph::new();
    assert!(g.topo_sort(T).unwrap().is_empty());
}

/// Boundary: a node with no edges traverses to itself only.
#[test]
fn boundary_node_with_no_edges_traverses_to_itself_only() {
    let g: CoordinatedGraph<u32, u32> = CoordinatedGraph::new();
    g.ensure_node(1, 99, T).unwrap();
    let visited = g
        .traverse_with(&[1], petgraph::Direction::Outgoing, T, |k, p| (*k, *p))
        .unwrap();
    assert_eq!(visited, vec![(1, 99)]);
}

/// Boundary: `set_worker_count(0)` is rejected.
#[test]
fn boundary_zero_workers_is_rejected() {
    let hub: ResourceHub<u32> = ResourceHub::new(HubConfig::new().worker_count(2));
    assert!(hub.set_worker_count(0).is_err());
    assert_eq!(hub.worker_count(), 2);
}

/// Boundary: a budget below the footprint of a single loaded resource
/// evicts every evictable resource but leaves those with outstanding
/// handles alone.
#[test]
fn boundary_budget_below_single_footprint_evicts_all_but_referenced() {
    let hub: ResourceHub<u32> = ResourceHub::new(HubConfig::new().worker_count(1));
    hub.register_type("t", || Box::new(SizedResource { bytes: 100 }));
    let kept = hub.load("t", &1).unwrap();
    drop(hub.load("t", &2).unwrap());
    drop(hub.load("t", &3).unwrap());

    hub.set_memory_budget(1);
    let evicted = hub.enforce_memory_budget();

    assert_eq!(evicted, 2);
    assert!(hub.has_resource(&1));
    assert!(!hub.has_resource(&2));
    assert!(!hub.has_resource(&3));
    drop(kept);
}
