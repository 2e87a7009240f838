// Copyright 2018 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The resource lock protocol.
//!
//! Lock modes map onto the node intents already exposed by
//! [`crate::graph::CoordinatedGraph`]; what this module adds is the
//! thread-held-keys bookkeeping needed to prevent deadlock before a node
//! lock is even attempted. That bookkeeping lives in its own leaf mutex,
//! independent of the graph's own lock, so a deadlock-prevention check
//! never has to contend with ordinary graph traffic.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use fnv::{FnvHashMap, FnvHashSet};
use log::{debug, warn};
use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, Mutex, RawRwLock};

use crate::error::GraphError;
use crate::graph::CoordinatedGraph;
use crate::key::Key;

/// The mode under which a node is locked.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum LockMode {
    /// Many readers, no writers.
    Shared,
    /// One writer, no readers.
    Exclusive,
    /// A shared lock that may later be promoted to exclusive in place.
    Upgrade,
    /// Advisory claim over a node's place in the graph's structure, used by
    /// callers that are about to add or remove edges/nodes touching it.
    Intention,
}

/// The lock state a [`LockHandle`] can observably be in across its
/// lifetime. A live handle is always `Shared`, `Exclusive`, or `Intention`;
/// `Unlocked` and `Pending` describe the moments before acquisition and
/// after release, where no handle value exists to query.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockStatus {
    Unlocked,
    Pending,
    Shared,
    Exclusive,
    Intention,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum LockAction {
    Attempt,
    Acquire,
    Release,
    Upgrade,
    Fail,
}

/// One entry in the bounded lock-history log (optional diagnostics).
#[derive(Clone, Debug)]
pub struct LockHistoryEntry<K> {
    pub key: K,
    pub mode: LockMode,
    pub thread: ThreadId,
    pub tick: u64,
    action: LockAction,
}

impl<K: Key> LockHistoryEntry<K> {
    pub fn description(&self) -> &'static str {
        match self.action {
            LockAction::Attempt => "attempt",
            LockAction::Acquire => "acquire",
            LockAction::Release => "release",
            LockAction::Upgrade => "upgrade",
            LockAction::Fail => "fail",
        }
    }
}

enum Guard<P: Send + Sync + 'static> {
    Read(ArcRwLockReadGuard<RawRwLock, P>),
    Write(ArcRwLockWriteGuard<RawRwLock, P>),
}

/// An acquired lock on a single node. Dropping it without calling
/// [`LockHandle::release`] releases it implicitly, but does not log the
/// release against the table (the table has already gone out of scope by
/// construction in that case only if the table itself was dropped; in the
/// ordinary case the `Drop` impl still reaches back into the table).
pub struct LockHandle<K: Key, P: Send + Sync + 'static> {
    table: LockTable<K, P>,
    key: K,
    mode: LockMode,
    status: LockStatus,
    guard: Option<Guard<P>>,
}

impl<K: Key, P: Send + Sync + 'static> LockHandle<K, P> {
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn status(&self) -> LockStatus {
        self.status
    }

    /// Read access to the guarded payload. Panics if this handle has
    /// already been released — a programmer error, not a recoverable one,
    /// since a released handle is a logical contradiction (the caller no
    /// longer owns the lock they are dereferencing).
    pub fn read(&self) -> &P {
        match self.guard.as_ref().expect("lock handle already released") {
            Guard::Read(g) => g,
            Guard::Write(g) => g,
        }
    }

    /// Write access to the guarded payload. Only valid while held in
    /// `Exclusive` or `Intention` mode.
    pub fn write(&mut self) -> &mut P {
        match self.guard.as_mut().expect("lock handle already released") {
            Guard::Write(g) => g,
            Guard::Read(_) => panic!("lock handle is not held exclusively"),
        }
    }

    /// Promotes a `LockMode::Upgrade` handle held as `Shared` to
    /// `Exclusive`, in place. On timeout the handle falls back to holding
    /// no lock at all (a best-effort shared re-acquisition is attempted,
    /// but is not guaranteed under contention), so the caller must check
    /// the returned error.
    pub fn upgrade(&mut self, timeout: Duration) -> Result<(), GraphError> {
        if self.mode != LockMode::Upgrade || self.status != LockStatus::Shared {
            return Err(GraphError::InvalidLockState);
        }
        self.guard = None;
        let arc = self.table.graph.node_payload_arc(&self.key, timeout)?;
        match arc.try_write_arc_for(timeout) {
            Some(g) => {
                self.status = LockStatus::Exclusive;
                self.guard = Some(Guard::Write(g));
                self.table.log(LockAction::Upgrade, &self.key, self.mode);
                Ok(())
            }
            None => {
                if let Some(g) = arc.try_read_arc_for(timeout) {
                    self.status = LockStatus::Shared;
                    self.guard = Some(Guard::Read(g));
                } else {
                    self.status = LockStatus::Unlocked;
                }
                self.table.log(LockAction::Fail, &self.key, self.mode);
                warn!("upgrade of {:?} timed out", self.key);
                Err(GraphError::LockTimeout)
            }
        }
    }

    /// Explicitly releases this lock. Equivalent to dropping the handle,
    /// but lets the caller observe the moment of release rather than
    /// relying on scope exit.
    pub fn release(mut self) {
        self.do_release();
    }

    fn do_release(&mut self) {
        if self.guard.take().is_none() {
            return;
        }
        self.table.forget(&self.key);
        self.status = LockStatus::Unlocked;
        self.table.log(LockAction::Release, &self.key, self.mode);
        debug!("released lock on {:?} ({:?})", self.key, self.mode);
    }
}

impl<K: Key, P: Send + Sync + 'static> Drop for LockHandle<K, P> {
    fn drop(&mut self) {
        self.do_release();
    }
}

struct ThreadState<K: Key> {
    held_by_thread: FnvHashMap<ThreadId, FnvHashSet<K>>,
    holders_of_key: FnvHashMap<K, FnvHashSet<ThreadId>>,
}

impl<K: Key> ThreadState<K> {
    fn new() -> Self {
        ThreadState {
            held_by_thread: FnvHashMap::default(),
            holders_of_key: FnvHashMap::default(),
        }
    }

    fn record(&mut self, thread: ThreadId, key: &K) {
        self.held_by_thread
            .entry(thread)
            .or_default()
            .insert(key.clone());
        self.holders_of_key
            .entry(key.clone())
            .or_default()
            .insert(thread);
    }

    fn forget(&mut self, thread: ThreadId, key: &K) {
        if let Some(held) = self.held_by_thread.get_mut(&thread) {
            held.remove(key);
            if held.is_empty() {
                self.held_by_thread.remove(&thread);
            }
        }
        if let Some(holders) = self.holders_of_key.get_mut(key) {
            holders.remove(&thread);
            if holders.is_empty() {
                self.holders_of_key.remove(key);
            }
        }
    }
}

/// Coordinates lock acquisition over a [`CoordinatedGraph`]'s nodes,
/// preventing deadlock via a DAG-ordering check and a wait-for intersection
/// check before ever attempting the underlying node lock.
pub struct LockTable<K: Key, P: Send + Sync + 'static> {
    graph: CoordinatedGraph<K, P>,
    state: Arc<Mutex<ThreadState<K>>>,
    history: Arc<Mutex<Option<VecDeque<LockHistoryEntry<K>>>>>,
    history_capacity: usize,
}

impl<K: Key, P: Send + Sync + 'static> Clone for LockTable<K, P> {
    fn clone(&self) -> Self {
        LockTable {
            graph: self.graph.clone(),
            state: self.state.clone(),
            history: self.history.clone(),
            history_capacity: self.history_capacity,
        }
    }
}

impl<K: Key, P: Send + Sync + 'static> LockTable<K, P> {
    pub fn new(graph: CoordinatedGraph<K, P>) -> Self {
        LockTable {
            graph,
            state: Arc::new(Mutex::new(ThreadState::new())),
            history: Arc::new(Mutex::new(None)),
            history_capacity: 0,
        }
    }

    /// Enables the bounded lock-history log, retaining at most
    /// `capacity` entries (oldest dropped first).
    pub fn with_history(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        if capacity > 0 {
            self.history = Arc::new(Mutex::new(Some(VecDeque::with_capacity(capacity))));
        }
        self
    }

    pub fn lock_history(&self) -> Vec<LockHistoryEntry<K>> {
        match self.history.lock().as_ref() {
            Some(log) => log.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    fn log(&self, action: LockAction, key: &K, mode: LockMode) {
        let mut slot = self.history.lock();
        if let Some(log) = slot.as_mut() {
            if log.len() >= self.history_capacity {
                log.pop_front();
            }
            log.push_back(LockHistoryEntry {
                key: key.clone(),
                mode,
                thread: std::thread::current().id(),
                tick: self.graph.tick(),
                action,
            });
        }
    }

    fn forget(&self, key: &K) {
        let thread = std::thread::current().id();
        self.state.lock().forget(thread, key);
    }

    /// Acquires `key` under `mode`, rejecting the attempt with
    /// [`GraphError::DeadlockDetected`] before ever touching the node lock
    /// if either:
    /// - there is a DAG path from `key` to a key the calling thread already
    ///   holds (ordering violation), or
    /// - `key` is currently held or attempted by another thread whose own
    ///   held set intersects the calling thread's held set (wait-for
    ///   intersection).
    pub fn lock(&self, key: &K, mode: LockMode, timeout: Duration) -> Result<LockHandle<K, P>, GraphError> {
        let thread = std::thread::current().id();
        {
            let state = self.state.lock();
            if let Some(held) = state.held_by_thread.get(&thread) {
                for other in held {
                    if other != key && self.graph.path_exists(key, other) {
                        drop(state);
                        self.log(LockAction::Fail, key, mode);
                        warn!("rejected lock on {key:?} ({mode:?}): ordering violation against held key {other:?}");
                        return Err(GraphError::DeadlockDetected);
                    }
                }
            }
            if let Some(holders) = state.holders_of_key.get(key) {
                let held = state.held_by_thread.get(&thread);
                for holder in holders {
                    if *holder == thread {
                        continue;
                    }
                    if let (Some(held), Some(holder_held)) =
                        (held, state.held_by_thread.get(holder))
                    {
                        if held.intersection(holder_held).next().is_some() {
                            drop(state);
                            self.log(LockAction::Fail, key, mode);
                            warn!("rejected lock on {key:?} ({mode:?}): wait-for intersection with thread {holder:?}");
                            return Err(GraphError::DeadlockDetected);
                        }
                    }
                }
            }
        }

        self.state.lock().record(thread, key);
        self.log(LockAction::Attempt, key, mode);

        let result = self.acquire_node_lock(key, mode, timeout);
        match result {
            Ok((status, guard)) => {
                self.log(LockAction::Acquire, key, mode);
                debug!("acquired lock on {key:?} ({mode:?}) as {status:?}");
                Ok(LockHandle {
                    table: self.clone(),
                    key: key.clone(),
                    mode,
                    status,
                    guard: Some(guard),
                })
            }
            Err(e) => {
                self.state.lock().forget(thread, key);
                self.log(LockAction::Fail, key, mode);
                warn!("failed to acquire lock on {key:?} ({mode:?}): {e}");
                Err(e)
            }
        }
    }

    fn acquire_node_lock(
        &self,
        key: &K,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<(LockStatus, Guard<P>), GraphError> {
        let arc = self.graph.node_payload_arc(key, timeout)?;
        match mode {
            LockMode::Shared | LockMode::Upgrade => {
                let g = arc.try_read_arc_for(timeout).ok_or(GraphError::LockTimeout)?;
                Ok((LockStatus::Shared, Guard::Read(g)))
            }
            LockMode::Exclusive => {
                let g = arc.try_write_arc_for(timeout).ok_or(GraphError::LockTimeout)?;
                Ok((LockStatus::Exclusive, Guard::Write(g)))
            }
            LockMode::Intention => {
                let g = arc.try_write_arc_for(timeout).ok_or(GraphError::LockTimeout)?;
                Ok((LockStatus::Intention, Guard::Write(g)))
            }
        }
    }

    /// Locks `keys` atomically with respect to ordering: computes a safe
    /// acquisition order from the induced subgraph's topological sort
    /// (falling back to a deterministic key-sorted order if that subgraph
    /// happens to be cyclic, which can only arise from a stale snapshot
    /// racing a structural mutation), then acquires in that order, rolling
    /// back everything already acquired if any step fails.
    pub fn lock_all(
        &self,
        keys: &[K],
        mode: LockMode,
        timeout: Duration,
    ) -> Result<Vec<LockHandle<K, P>>, GraphError> {
        let order = self.graph.induced_topo_order(keys).unwrap_or_else(|| {
            let mut sorted = keys.to_vec();
            sorted.sort();
            sorted
        });

        let mut acquired = Vec::with_capacity(order.len());
        for key in &order {
            match self.lock(key, mode, timeout) {
                Ok(handle) => acquired.push(handle),
                Err(e) => {
                    for handle in acquired {
                        handle.release();
                    }
                    return Err(e);
                }
            }
        }
        Ok(acquired)
    }
}
