// Copyright 2018 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! End-to-end scenarios exercised against the public facade, one per
//! scenario described for this system: a shared cache, cycle rejection,
//! cascade unload, budget-driven eviction, deadlock prevention, and
//! asynchronous completion.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use resource_graph::{
    CoordinatedGraph, GraphError, HubConfig, HubError, LockMode, Priority, ResourceHooks,
    ResourceHub,
};

struct CountingResource {
    bytes: usize,
    load_calls: Arc<AtomicUsize>,
}

impl ResourceHooks for CountingResource {
    fn estimated_bytes_in_memory(&self) -> usize {
        self.bytes
    }
    fn load(&mut self) -> Result<(), String> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn unload(&mut self) {}
}

fn hub_with_counted_type(bytes: usize) -> (ResourceHub<String>, Arc<AtomicUsize>) {
    let hub = ResourceHub::new(HubConfig::new().worker_count(2));
    let load_calls = Arc::new(AtomicUsize::new(0));
    let counter = load_calls.clone();
    hub.register_type("mesh", move || {
        Box::new(CountingResource { bytes, load_calls: counter.clone() })
    });
    (hub, load_calls)
}

#[test]
fn s1_shared_cache() {
    let (hub, load_calls) = hub_with_counted_type(10);
    let h1 = hub.load("mesh", &"cube".to_string()).unwrap();
    let h2 = hub.load("mesh", &"cube".to_string()).unwrap();
    assert_eq!(load_calls.load(Ordering::SeqCst), 1);
    assert!(hub.is_loaded(&"cube".to_string()));
    assert_eq!(h1.read().estimated_bytes_in_memory(), h2.read().estimated_bytes_in_memory());
}

#[test]
fn s2_cycle_rejection() {
    let (hub, _) = hub_with_counted_type(1);
    for k in ["a", "b", "c"] {
        hub.load("mesh", &k.to_string()).unwrap();
    }
    assert!(hub.add_dependency(&"a".to_string(), &"b".to_string()));
    assert!(hub.add_dependency(&"b".to_string(), &"c".to_string()));
    assert!(!hub.add_dependency(&"c".to_string(), &"a".to_string()));

    assert_eq!(hub.dependencies_of(&"a".to_string()).unwrap(), vec!["b".to_string()]);
    assert_eq!(hub.dependencies_of(&"b".to_string()).unwrap(), vec!["c".to_string()]);
    assert!(hub.dependencies_of(&"c".to_string()).unwrap().is_empty());
}

#[test]
fn s3_cascade_unload() {
    let (hub, _) = hub_with_counted_type(1);
    for k in ["p", "e1", "e2"] {
        hub.load("mesh", &k.to_string()).unwrap();
    }
    assert!(hub.add_dependency(&"p".to_string(), &"e1".to_string()));
    assert!(hub.add_dependency(&"p".to_string(), &"e2".to_string()));

    // p depends on e1/e2, so neither can be unloaded non-cascading while
    // p still exists.
    assert_eq!(hub.unload(&"e1".to_string(), false), Err(HubError::WouldOrphanDependents));
    assert!(hub.has_resource(&"e1".to_string()));

    // p itself has no dependents, so it unloads cleanly on its own.
    assert!(hub.unload(&"p".to_string(), false).unwrap());
    assert!(!hub.has_resource(&"p".to_string()));

    // now that nothing depends on e1/e2, plain unloads succeed too.
    assert!(hub.unload(&"e1".to_string(), false).unwrap());
    assert!(hub.unload(&"e2".to_string(), false).unwrap());
    assert!(!hub.has_resource(&"e1".to_string()));
    assert!(!hub.has_resource(&"e2".to_string()));
}

#[test]
fn s4_budget_eviction() {
    let (hub, _) = hub_with_counted_type(100);
    for k in ["a", "b", "c"] {
        drop(hub.load("mesh", &k.to_string()).unwrap());
    }
    assert_eq!(hub.memory_usage(), 300);

    hub.set_memory_budget(250);
    drop(hub.load("mesh", &"d".to_string()).unwrap());

    // loading d brings usage to 400; eviction walks LRU order (a, then b)
    // until usage is back under budget, which takes two evictions here.
    assert!(hub.memory_usage() <= 250);
    assert_eq!(hub.stats().evictions_performed, 2);
    assert!(!hub.has_resource(&"a".to_string()));
    assert!(!hub.has_resource(&"b".to_string()));
    assert!(hub.has_resource(&"c".to_string()));
    assert!(hub.has_resource(&"d".to_string()));
}

#[test]
fn s5_deadlock_prevention() {
    let graph: CoordinatedGraph<&str, u32> = CoordinatedGraph::new();
    graph.ensure_node("x", 0, Duration::from_millis(100)).unwrap();
    graph.ensure_node("y", 0, Duration::from_millis(100)).unwrap();
    graph.add_edge(&"x", &"y", Duration::from_millis(100)).unwrap();

    let locks = resource_graph::LockTable::new(graph);
    let held_on_y = locks
        .lock(&"y", LockMode::Exclusive, Duration::from_millis(100))
        .unwrap();

    let attempt = locks.lock(&"x", LockMode::Exclusive, Duration::from_millis(50));
    assert_eq!(attempt, Err(GraphError::DeadlockDetected));
    assert_eq!(held_on_y.status(), resource_graph::LockStatus::Exclusive);
}

#[test]
fn s6_async_completion() {
    let (hub, load_calls) = hub_with_counted_type(5);
    let (tx, rx) = mpsc::channel();
    hub.load_async("mesh", &"sphere".to_string(), Priority::Normal, move |handle| {
        tx.send(handle.is_some()).unwrap();
    });
    let completed = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(completed);
    assert_eq!(load_calls.load(Ordering::SeqCst), 1);

    // A subsequent synchronous load must not invoke `loadImpl` again.
    let _h = hub.load("mesh", &"sphere".to_string()).unwrap();
    assert_eq!(load_calls.load(Ordering::SeqCst), 1);
}
