// Copyright 2018 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! A coordinated, intent-aware DAG of keyed nodes.
//!
//! A `petgraph::graph::DiGraph` sits behind one graph-level lock, while each
//! node's own payload sits behind a second, finer-grained lock: a timed,
//! `Arc`-owned `parking_lot::RwLock`. The two are acquired and released
//! independently so that a caller can hold a node's payload lock across
//! explicit, caller-visible calls (the resource lock protocol builds on
//! this) without blocking unrelated structural reads of the graph.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fixedbitset::FixedBitSet;
use fnv::FnvHashMap;
use log::debug;
use parking_lot::{Mutex, RwLock};
use petgraph::graph::DiGraph;
use petgraph::visit::{EdgeRef, VisitMap, Visitable};
use petgraph::Direction;

use crate::error::GraphError;
use crate::key::Key;

pub(crate) type NodeId = petgraph::graph::NodeIndex<u32>;

/// The declared purpose for acquiring a lock, used to coordinate priorities
/// between graph-level and node-level lockers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum LockIntent {
    Read,
    NodeModify,
    GraphStructure,
}

/// Status delivered to a node's registered callbacks on a lock-status
/// change.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CallbackStatus {
    Acquired,
    Released,
    Preempted,
    BackgroundWait,
    Failed,
}

pub type CallbackId = u64;

type NodeCallback = Arc<dyn Fn(CallbackStatus) + Send + Sync>;
type RemovalCallback<K> = Arc<dyn Fn(&K) + Send + Sync>;

/// A node's adjacency-independent state: its payload lock, last-access
/// timestamp, and lock-status callback registry.
///
/// Edges are a property of the graph (the `petgraph` adjacency), never of
/// the node itself.
pub(crate) struct NodeEntry<K: Key, P: Send + Sync + 'static> {
    key: K,
    payload: Arc<RwLock<P>>,
    last_access: AtomicU64,
    callbacks: Mutex<Vec<(LockIntent, CallbackId, NodeCallback)>>,
}

impl<K: Key, P: Send + Sync + 'static> NodeEntry<K, P> {
    fn new(key: K, payload: P) -> Self {
        NodeEntry {
            key,
            payload: Arc::new(RwLock::new(payload)),
            last_access: AtomicU64::new(0),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    fn notify(&self, status: CallbackStatus) {
        // The callback mutex is independent of `payload`'s lock (its own
        // leaf lock), so this may be called while a caller holds the graph
        // write lock: only the node's payload lock may never be held
        // alongside the graph write lock, not this bookkeeping mutex.
        let callbacks = self.callbacks.lock();
        for (_, _, cb) in callbacks.iter() {
            cb(status);
        }
    }
}

struct Inner<K: Key, P: Send + Sync + 'static> {
    nodes: FnvHashMap<K, NodeId>,
    pg: DiGraph<Arc<NodeEntry<K, P>>, (), u32>,
}

impl<K: Key, P: Send + Sync + 'static> Inner<K, P> {
    fn node_id(&self, key: &K) -> Option<NodeId> {
        self.nodes.get(key).copied()
    }

    fn entry(&self, id: NodeId) -> Option<&Arc<NodeEntry<K, P>>> {
        self.pg.node_weight(id)
    }
}

/// A DAG (enforced on every mutation) of keyed nodes, each carrying a
/// payload behind its own timed lock.
pub struct CoordinatedGraph<K: Key, P: Send + Sync + 'static> {
    inner: Arc<RwLock<Inner<K, P>>>,
    /// Set while a structural mutation holds the graph write lock; read by
    /// node lockers that want to back off rather than contend.
    structural_intent: Arc<AtomicBool>,
    removal_callbacks: Arc<Mutex<Vec<(CallbackId, RemovalCallback<K>)>>>,
    next_callback_id: Arc<AtomicU64>,
    /// A logical clock for last-access ordering: deterministic under test,
    /// unlike a wall-clock `Instant`.
    clock: Arc<AtomicU64>,
}

impl<K: Key, P: Send + Sync + 'static> Clone for CoordinatedGraph<K, P> {
    fn clone(&self) -> Self {
        CoordinatedGraph {
            inner: self.inner.clone(),
            structural_intent: self.structural_intent.clone(),
            removal_callbacks: self.removal_callbacks.clone(),
            next_callback_id: self.next_callback_id.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl<K: Key, P: Send + Sync + 'static> Default for CoordinatedGraph<K, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key, P: Send + Sync + 'static> CoordinatedGraph<K, P> {
    pub fn new() -> Self {
        CoordinatedGraph {
            inner: Arc::new(RwLock::new(Inner {
                nodes: FnvHashMap::default(),
                pg: DiGraph::new(),
            })),
            structural_intent: Arc::new(AtomicBool::new(false)),
            removal_callbacks: Arc::new(Mutex::new(Vec::new())),
            next_callback_id: Arc::new(AtomicU64::new(0)),
            clock: Arc::new(AtomicU64::new(0)),
        }
    }

    fn next_id(&self) -> CallbackId {
        self.next_callback_id.fetch_add(1, Ordering::Relaxed)
    }

    /// A monotonically increasing tick, used as the last-access timestamp.
    /// Kept as a logical clock (rather than `Instant::now()`) so that tests
    /// can assert exact LRU ordering deterministically.
    pub fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn len(&self) -> usize {
        self.inner.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write_guard(&self, timeout: Duration) -> Result<parking_lot::RwLockWriteGuard<'_, Inner<K, P>>, GraphError> {
        self.inner
            .try_write_for(timeout)
            .ok_or(GraphError::LockTimeout)
    }

    fn read_guard(&self, timeout: Duration) -> Result<parking_lot::RwLockReadGuard<'_, Inner<K, P>>, GraphError> {
        self.inner
            .try_read_for(timeout)
            .ok_or(GraphError::LockTimeout)
    }

    fn begin_structural(&self, inner: &Inner<K, P>) {
        self.structural_intent.store(true, Ordering::SeqCst);
        for entry in inner.pg.node_weights() {
            entry.notify(CallbackStatus::BackgroundWait);
        }
    }

    fn end_structural(&self) {
        self.structural_intent.store(false, Ordering::SeqCst);
    }

    pub fn structural_intent_active(&self) -> bool {
        self.structural_intent.load(Ordering::SeqCst)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.read().nodes.contains_key(key)
    }

    /// A snapshot of every key currently in the graph, in no particular
    /// order. Used by diagnostics and by the hub's memory-accounting and
    /// eviction-candidate scans, which need to see every node rather than
    /// just those reachable from a set of roots.
    pub fn all_keys(&self, timeout: Duration) -> Result<Vec<K>, GraphError> {
        let inner = self.read_guard(timeout)?;
        Ok(inner.nodes.keys().cloned().collect())
    }

    /// Ensures a node for `key` exists, creating it with `payload` if
    /// absent. Returns whether a new node was created.
    pub fn ensure_node(
        &self,
        key: K,
        payload: P,
        timeout: Duration,
    ) -> Result<bool, GraphError> {
        let mut inner = self.write_guard(timeout)?;
        if inner.nodes.contains_key(&key) {
            return Ok(false);
        }
        self.begin_structural(&inner);
        let id = inner.pg.add_node(Arc::new(NodeEntry::new(key.clone(), payload)));
        inner.nodes.insert(key, id);
        self.end_structural();
        Ok(true)
    }

    /// Removes a node (and its incident edges), notifying `Preempted` on the
    /// node's own callbacks and firing every registered removal hook.
    pub fn remove_node(&self, key: &K, timeout: Duration) -> Result<bool, GraphError> {
        let mut inner = self.write_guard(timeout)?;
        let Some(id) = inner.node_id(key) else {
            return Ok(false);
        };
        self.begin_structural(&inner);
        if let Some(entry) = inner.entry(id) {
            entry.notify(CallbackStatus::Preempted);
        }
        inner.pg.remove_node(id);
        inner.nodes.remove(key);
        self.end_structural();

        let removal_callbacks = self.removal_callbacks.lock();
        for (_, cb) in removal_callbacks.iter() {
            cb(key);
        }
        Ok(true)
    }

    /// Inserts `from -> to` ("`from` depends on `to`"), rejecting self-loops
    /// and anything that would close a cycle. The edge is inserted first and
    /// removed again on rejection: cheaper than pre-checking reachability on
    /// the common (acyclic) path.
    pub fn add_edge(&self, from: &K, to: &K, timeout: Duration) -> Result<(), GraphError> {
        if from == to {
            return Err(GraphError::CycleDetected);
        }
        let mut inner = self.write_guard(timeout)?;
        let from_id = inner.node_id(from).ok_or(GraphError::UnknownNode)?;
        let to_id = inner.node_id(to).ok_or(GraphError::UnknownNode)?;

        self.begin_structural(&inner);
        let edge_id = inner.pg.add_edge(from_id, to_id, ());
        let closes_cycle = reaches(&inner.pg, to_id, from_id);
        if closes_cycle {
            inner.pg.remove_edge(edge_id);
            self.end_structural();
            debug!("rejected edge {from:?} -> {to:?}: would close a cycle");
            return Err(GraphError::CycleDetected);
        }
        self.end_structural();
        debug!("inserted edge {from:?} -> {to:?}");
        Ok(())
    }

    pub fn remove_edge(&self, from: &K, to: &K, timeout: Duration) -> Result<bool, GraphError> {
        let mut inner = self.write_guard(timeout)?;
        let Some(from_id) = inner.node_id(from) else {
            return Ok(false);
        };
        let Some(to_id) = inner.node_id(to) else {
            return Ok(false);
        };
        self.begin_structural(&inner);
        let edge = inner.pg.find_edge(from_id, to_id);
        let removed = if let Some(edge) = edge {
            inner.pg.remove_edge(edge);
            true
        } else {
            false
        };
        self.end_structural();
        Ok(removed)
    }

    pub fn clear(&self, timeout: Duration) -> Result<(), GraphError> {
        let mut inner = self.write_guard(timeout)?;
        self.begin_structural(&inner);
        for entry in inner.pg.node_weights() {
            entry.notify(CallbackStatus::Preempted);
        }
        inner.pg.clear();
        inner.nodes.clear();
        self.end_structural();
        Ok(())
    }

    /// Topological sort over a snapshot of adjacency taken under the shared
    /// graph lock. Returns an empty vector if the snapshot is cyclic, which
    /// can only happen under a concurrent mutation racing this read (the
    /// invariant already violated elsewhere).
    pub fn topo_sort(&self, timeout: Duration) -> Result<Vec<K>, GraphError> {
        let inner = self.read_guard(timeout)?;
        match petgraph::algo::toposort(&inner.pg, None) {
            Ok(order) => Ok(order
                .into_iter()
                .map(|id| inner.entry(id).unwrap().key.clone())
                .collect()),
            Err(_cycle) => Ok(Vec::new()),
        }
    }

    pub fn dependencies_of(&self, key: &K, timeout: Duration) -> Result<Vec<K>, GraphError> {
        self.neighbors(key, Direction::Outgoing, timeout)
    }

    pub fn dependents_of(&self, key: &K, timeout: Duration) -> Result<Vec<K>, GraphError> {
        self.neighbors(key, Direction::Incoming, timeout)
    }

    fn neighbors(&self, key: &K, direction: Direction, timeout: Duration) -> Result<Vec<K>, GraphError> {
        let inner = self.read_guard(timeout)?;
        let id = inner.node_id(key).ok_or(GraphError::UnknownNode)?;
        Ok(inner
            .pg
            .neighbors_directed(id, direction)
            .map(|n| inner.entry(n).unwrap().key.clone())
            .collect())
    }

    pub fn in_degree(&self, key: &K, timeout: Duration) -> Result<usize, GraphError> {
        let inner = self.read_guard(timeout)?;
        let id = inner.node_id(key).ok_or(GraphError::UnknownNode)?;
        Ok(inner.pg.neighbors_directed(id, Direction::Incoming).count())
    }

    /// BFS/DFS traversal: walks a snapshot of adjacency from `roots`, taking
    /// a short-lived node read lock per step to obtain a consistent payload
    /// view, and invoking `visit` with no lock held.
    pub fn traverse_with<R>(
        &self,
        roots: &[K],
        direction: Direction,
        timeout: Duration,
        mut visit: impl FnMut(&K, &P) -> R,
    ) -> Result<Vec<R>, GraphError> {
        let (root_ids, entries): (Vec<NodeId>, FnvHashMap<NodeId, Arc<NodeEntry<K, P>>>) = {
            let inner = self.read_guard(timeout)?;
            let root_ids = roots
                .iter()
                .filter_map(|k| inner.node_id(k))
                .collect::<Vec<_>>();
            let entries = inner
                .pg
                .node_indices()
                .map(|id| (id, inner.entry(id).unwrap().clone()))
                .collect();
            (root_ids, entries)
        };

        let mut walked = FixedBitSet::with_capacity(entries.len());
        let mut deque: VecDeque<NodeId> = root_ids.into_iter().collect();
        let mut out = Vec::new();
        while let Some(id) = deque.pop_front() {
            if !walked.visit(id) {
                continue;
            }
            let Some(entry) = entries.get(&id) else {
                continue;
            };
            let guard = entry
                .payload
                .try_read_for(timeout)
                .ok_or(GraphError::LockTimeout)?;
            out.push(visit(&entry.key, &guard));
            drop(guard);

            let inner = self.read_guard(timeout)?;
            deque.extend(inner.pg.neighbors_directed(id, direction));
        }
        Ok(out)
    }

    pub fn with_node_read<R>(
        &self,
        key: &K,
        timeout: Duration,
        f: impl FnOnce(&P) -> R,
    ) -> Result<R, GraphError> {
        let arc = self.node_payload_arc(key, timeout)?;
        let guard = arc.try_read_for(timeout).ok_or(GraphError::LockTimeout)?;
        Ok(f(&guard))
    }

    pub fn with_node_write<R>(
        &self,
        key: &K,
        timeout: Duration,
        f: impl FnOnce(&mut P) -> R,
    ) -> Result<R, GraphError> {
        let arc = self.node_payload_arc(key, timeout)?;
        let mut guard = arc.try_write_for(timeout).ok_or(GraphError::LockTimeout)?;
        Ok(f(&mut guard))
    }

    pub fn touch(&self, key: &K, timeout: Duration) -> Result<(), GraphError> {
        let inner = self.read_guard(timeout)?;
        let id = inner.node_id(key).ok_or(GraphError::UnknownNode)?;
        let entry = inner.entry(id).unwrap();
        entry.last_access.store(self.tick(), Ordering::Relaxed);
        Ok(())
    }

    pub fn last_access(&self, key: &K, timeout: Duration) -> Result<u64, GraphError> {
        let inner = self.read_guard(timeout)?;
        let id = inner.node_id(key).ok_or(GraphError::UnknownNode)?;
        Ok(inner.entry(id).unwrap().last_access.load(Ordering::Relaxed))
    }

    pub fn register_callback(
        &self,
        key: &K,
        intent: LockIntent,
        callback: impl Fn(CallbackStatus) + Send + Sync + 'static,
    ) -> Result<CallbackId, GraphError> {
        let inner = self.inner.read();
        let id = inner.node_id(key).ok_or(GraphError::UnknownNode)?;
        let entry = inner.entry(id).unwrap();
        let cb_id = self.next_id();
        entry
            .callbacks
            .lock()
            .push((intent, cb_id, Arc::new(callback)));
        Ok(cb_id)
    }

    /// Removes a callback, matched by `intent` rather than precise identity
    /// (a caller owns at most one callback per intent on a given node).
    pub fn remove_callback(&self, key: &K, intent: LockIntent) -> Result<(), GraphError> {
        let inner = self.inner.read();
        let id = inner.node_id(key).ok_or(GraphError::UnknownNode)?;
        let entry = inner.entry(id).unwrap();
        entry.callbacks.lock().retain(|(i, ..)| *i != intent);
        Ok(())
    }

    pub fn register_removal_callback(
        &self,
        callback: impl Fn(&K) + Send + Sync + 'static,
    ) -> CallbackId {
        let id = self.next_id();
        self.removal_callbacks.lock().push((id, Arc::new(callback)));
        id
    }

    pub fn remove_removal_callback(&self, id: CallbackId) {
        self.removal_callbacks.lock().retain(|(cid, _)| *cid != id);
    }

    /// The node's payload lock as a timed, `Arc`-owned `RwLock`, for use by
    /// [`crate::lock::LockTable`], which holds acquired guards across
    /// caller-visible `lock`/`unlock` calls rather than one scoped closure.
    pub(crate) fn node_payload_arc(
        &self,
        key: &K,
        timeout: Duration,
    ) -> Result<Arc<RwLock<P>>, GraphError> {
        let inner = self.read_guard(timeout)?;
        let id = inner.node_id(key).ok_or(GraphError::UnknownNode)?;
        Ok(inner.entry(id).unwrap().payload.clone())
    }

    /// True if there is a path `from -> to` in the DAG. Used by the resource
    /// lock protocol's ordering check.
    pub(crate) fn path_exists(&self, from: &K, to: &K) -> bool {
        let inner = self.inner.read();
        let (Some(from_id), Some(to_id)) = (inner.node_id(from), inner.node_id(to)) else {
            return false;
        };
        reaches(&inner.pg, from_id, to_id)
    }

    /// A topological order of the induced subgraph over `keys`, or `None` if
    /// that subgraph (which can only be cyclic under a concurrent structural
    /// race) is cyclic. Used by `lock_all`'s safe-ordering computation.
    pub(crate) fn induced_topo_order(&self, keys: &[K]) -> Option<Vec<K>> {
        let inner = self.inner.read();
        // Build a small standalone graph over just `keys`, since
        // `DiGraph::filter_map` does not preserve node indices across the
        // call and we need to translate back to `K` afterward.
        let mut sub: DiGraph<K, (), u32> = DiGraph::new();
        let mut orig_to_sub: FnvHashMap<NodeId, NodeId> = FnvHashMap::default();
        for key in keys {
            if let Some(orig_id) = inner.node_id(key) {
                let sub_id = sub.add_node(key.clone());
                orig_to_sub.insert(orig_id, sub_id);
            }
        }
        for (&orig_from, &sub_from) in &orig_to_sub {
            for edge in inner.pg.edges_directed(orig_from, Direction::Outgoing) {
                if let Some(&sub_to) = orig_to_sub.get(&edge.target()) {
                    sub.add_edge(sub_from, sub_to, ());
                }
            }
        }
        match petgraph::algo::toposort(&sub, None) {
            Ok(order) => Some(order.into_iter().map(|id| sub[id].clone()).collect()),
            Err(_) => None,
        }
    }
}

fn reaches<N, E>(pg: &DiGraph<N, E, u32>, from: NodeId, to: NodeId) -> bool {
    if from == to {
        return true;
    }
    let mut visited = pg.visit_map();
    let mut deque = VecDeque::new();
    deque.push_back(from);
    while let Some(id) = deque.pop_front() {
        if !visited.visit(id) {
            continue;
        }
        for edge in pg.edges_directed(id, Direction::Outgoing) {
            let target = edge.target();
            if target == to {
                return true;
            }
            deque.push_back(target);
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const T: Duration = Duration::from_millis(200);

    fn graph() -> CoordinatedGraph<&'static str, u32> {
        CoordinatedGraph::new()
    }

    #[test]
    fn add_and_contains() {
        let g = graph();
        assert!(g.ensure_node("a", 1, T).unwrap());
        assert!(!g.ensure_node("a", 2, T).unwrap());
        assert!(g.contains(&"a"));
        assert_eq!(g.len(), 1);
    }

    #[test]
    fn self_loop_rejected() {
        let g = graph();
        g.ensure_node("a", 0, T).unwrap();
        assert_eq!(g.add_edge(&"a", &"a", T), Err(GraphError::CycleDetected));
    }

    #[test]
    fn cycle_rejected_and_graph_unchanged() {
        let g = graph();
        for k in ["a", "b", "c"] {
            g.ensure_node(k, 0, T).unwrap();
        }
        g.add_edge(&"a", &"b", T).unwrap();
        g.add_edge(&"b", &"c", T).unwrap();
        assert_eq!(g.add_edge(&"c", &"a", T), Err(GraphError::CycleDetected));

        assert_eq!(g.dependencies_of(&"a", T).unwrap(), vec!["b"]);
        assert_eq!(g.dependencies_of(&"b", T).unwrap(), vec!["c"]);
        assert!(g.dependencies_of(&"c", T).unwrap().is_empty());
        assert_eq!(g.topo_sort(T).unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn adjacency_symmetry() {
        let g = graph();
        g.ensure_node("a", 0, T).unwrap();
        g.ensure_node("b", 0, T).unwrap();
        g.add_edge(&"a", &"b", T).unwrap();
        assert_eq!(g.dependencies_of(&"a", T).unwrap(), vec!["b"]);
        assert_eq!(g.dependents_of(&"b", T).unwrap(), vec!["a"]);
    }

    #[test]
    fn remove_edge_round_trip() {
        let g = graph();
        g.ensure_node("a", 0, T).unwrap();
        g.ensure_node("b", 0, T).unwrap();
        let before = g.topo_sort(T).unwrap();
        g.add_edge(&"a", &"b", T).unwrap();
        assert!(g.remove_edge(&"a", &"b", T).unwrap());
        let after = g.topo_sort(T).unwrap();
        assert_eq!(before.len(), after.len());
        assert!(g.dependencies_of(&"a", T).unwrap().is_empty());
    }

    #[test]
    fn empty_graph_topo_sort_is_empty() {
        let g: CoordinatedGraph<&'static str, u32> = graph();
        assert!(g.topo_sort(T).unwrap().is_empty());
    }

    #[test]
    fn single_node_traverses_to_itself_only() {
        let g = graph();
        g.ensure_node("a", 42, T).unwrap();
        let visited = g
            .traverse_with(&["a"], Direction::Outgoing, T, |k, p| (*k, *p))
            .unwrap();
        assert_eq!(visited, vec![("a", 42)]);
    }

    #[test]
    fn remove_node_fires_removal_callback() {
        let g = graph();
        g.ensure_node("a", 0, T).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        g.register_removal_callback(move |k| seen2.lock().push(*k));
        assert!(g.remove_node(&"a", T).unwrap());
        assert_eq!(*seen.lock(), vec!["a"]);
        assert!(!g.contains(&"a"));
    }

    #[test]
    fn lock_timeout_surfaces_as_error() {
        let g = graph();
        g.ensure_node("a", 0, T).unwrap();
        let arc = g.node_payload_arc(&"a", T).unwrap();
        let _held = arc.write();
        let err = g.with_node_write(&"a", Duration::from_millis(10), |_| ());
        assert_eq!(err, Err(GraphError::LockTimeout));
    }
}
