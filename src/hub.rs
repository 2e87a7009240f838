// Copyright 2018 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The resource hub: the facade that coordinates the type registry, the
//! coordinated DAG, synchronous and prioritized-asynchronous loading,
//! dependency-aware cascading unload, and memory-budget eviction.
//!
//! One object wraps an inner DAG plus a per-entry state machine, exposing
//! `load`/`unload`-shaped public operations and a background driver (a
//! `std::thread` worker pool) that advances entries to completion off the
//! caller's own thread.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use fnv::FnvHashSet;
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::error::HubError;
use crate::graph::CoordinatedGraph;
use crate::key::{Key, Priority};
use crate::lock::{LockHistoryEntry, LockTable};
use crate::queue::{LoadRequest, PriorityQueue, SequenceSource};
use crate::resource::{Handle, ResourceCell, ResourceHooks, ResourceState, TypeRegistry};

/// Tunable configuration for a [`ResourceHub`], built once at construction
/// time through a small builder rather than a config-file/CLI surface.
#[derive(Clone, Debug)]
pub struct HubConfig {
    worker_count: usize,
    memory_budget: usize,
    default_lock_timeout: Duration,
    history_capacity: usize,
    worker_poll_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            worker_count: num_cpus::get().max(1),
            memory_budget: usize::MAX,
            default_lock_timeout: Duration::from_millis(50),
            history_capacity: 0,
            worker_poll_interval: Duration::from_millis(25),
        }
    }
}

impl HubConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn worker_count(mut self, n: usize) -> Self {
        self.worker_count = n;
        self
    }

    pub fn memory_budget(mut self, bytes: usize) -> Self {
        self.memory_budget = bytes;
        self
    }

    pub fn default_lock_timeout(mut self, timeout: Duration) -> Self {
        self.default_lock_timeout = timeout;
        self
    }

    /// Enables the lock-history diagnostic log at the given bounded
    /// capacity; `0` (the default) disables it.
    pub fn history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    pub fn worker_poll_interval(mut self, interval: Duration) -> Self {
        self.worker_poll_interval = interval;
        self
    }
}

/// A point-in-time snapshot of the hub's worker statistics.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct HubStats {
    pub loads_completed: u64,
    pub loads_failed: u64,
    pub evictions_performed: u64,
}

#[derive(Default)]
struct StatsInner {
    loads_completed: AtomicU64,
    loads_failed: AtomicU64,
    evictions_performed: AtomicU64,
}

struct HubJob<K: Key> {
    type_id: String,
    key: K,
    callback: Option<Box<dyn FnOnce(Option<Handle>) + Send>>,
}

struct HubInner<K: Key> {
    graph: CoordinatedGraph<K, ResourceCell>,
    locks: LockTable<K, ResourceCell>,
    types: TypeRegistry,
    queue: PriorityQueue<LoadRequest<HubJob<K>>>,
    seq: SequenceSource,
    memory_budget: AtomicUsize,
    budget_mutex: Mutex<()>,
    default_lock_timeout: Duration,
    worker_poll_interval: Duration,
    worker_count: AtomicUsize,
    workers: Mutex<Vec<JoinHandle<()>>>,
    pool_generation: AtomicU64,
    shutting_down: AtomicBool,
    quiesced: AtomicBool,
    stats: StatsInner,
}

/// Facade coordinating the type registry, the coordinated DAG, and a
/// worker pool driving asynchronous loads.
///
/// Cheaply `Clone`-able: every field lives behind an `Arc`, the same
/// pattern `CoordinatedGraph` itself uses, so worker threads and callers
/// alike hold an independent handle to shared state rather than a
/// reference with a tied lifetime.
pub struct ResourceHub<K: Key> {
    inner: Arc<HubInner<K>>,
}

impl<K: Key> Clone for ResourceHub<K> {
    fn clone(&self) -> Self {
        ResourceHub {
            inner: self.inner.clone(),
        }
    }
}

impl<K: Key> ResourceHub<K> {
    pub fn new(config: HubConfig) -> Self {
        let graph = CoordinatedGraph::new();
        let locks = LockTable::new(graph.clone()).with_history(config.history_capacity);
        let hub = ResourceHub {
            inner: Arc::new(HubInner {
                graph,
                locks,
                types: TypeRegistry::new(),
                queue: PriorityQueue::new(),
                seq: SequenceSource::default(),
                memory_budget: AtomicUsize::new(config.memory_budget),
                budget_mutex: Mutex::new(()),
                default_lock_timeout: config.default_lock_timeout,
                worker_poll_interval: config.worker_poll_interval,
                worker_count: AtomicUsize::new(0),
                workers: Mutex::new(Vec::new()),
                pool_generation: AtomicU64::new(0),
                shutting_down: AtomicBool::new(false),
                quiesced: AtomicBool::new(false),
                stats: StatsInner::default(),
            }),
        };
        hub.spawn_workers(config.worker_count.max(1));
        hub
    }

    fn timeout(&self) -> Duration {
        self.inner.default_lock_timeout
    }

    pub fn register_type(
        &self,
        type_id: impl Into<String>,
        factory: impl Fn() -> Box<dyn ResourceHooks> + Send + Sync + 'static,
    ) {
        self.inner.types.register(type_id, factory);
    }

    /// Manual multi-node locking, sharing this hub's underlying graph.
    pub fn locks(&self) -> &LockTable<K, ResourceCell> {
        &self.inner.locks
    }

    pub fn lock_history(&self) -> Vec<LockHistoryEntry<K>> {
        self.inner.locks.lock_history()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            loads_completed: self.inner.stats.loads_completed.load(Ordering::Relaxed),
            loads_failed: self.inner.stats.loads_failed.load(Ordering::Relaxed),
            evictions_performed: self.inner.stats.evictions_performed.load(Ordering::Relaxed),
        }
    }

    // ---- synchronous / asynchronous loading ----------------------------

    pub fn load(&self, type_id: &str, key: &K) -> Result<Handle, HubError> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(HubError::ShuttingDown);
        }
        if !self.inner.types.is_registered(type_id) {
            return Err(HubError::UnknownType(type_id.to_string()));
        }
        self.ensure_and_drive(type_id, key)
    }

    /// Fast path invokes `callback` synchronously if already `Loaded`;
    /// otherwise enqueues a request and returns immediately. `callback`
    /// always runs exactly once, with `None` standing in for an empty
    /// result on `UnknownType` and `ShuttingDown` outcomes.
    pub fn load_async(
        &self,
        type_id: &str,
        key: &K,
        priority: Priority,
        callback: impl FnOnce(Option<Handle>) + Send + 'static,
    ) {
        if self.inner.shutting_down.load(Ordering::SeqCst) || !self.inner.types.is_registered(type_id) {
            callback(None);
            return;
        }
        let t = self.timeout();
        if self.inner.graph.contains(key) {
            if let Ok(Some(handle)) = self
                .inner
                .graph
                .with_node_read(key, t, |cell| cell.handle())
            {
                callback(Some(handle));
                return;
            }
        }
        let job = HubJob {
            type_id: type_id.to_string(),
            key: key.clone(),
            callback: Some(Box::new(callback)),
        };
        let seq = self.inner.seq.next();
        self.inner.queue.push(LoadRequest::new(job, priority, seq));
    }

    /// Enqueues one request per `(type_id, key)` pair with no callback.
    pub fn preload(&self, type_ids: &[String], keys: &[K], priority: Priority) {
        for (type_id, key) in type_ids.iter().zip(keys.iter()) {
            self.load_async(type_id, key, priority, |_| {});
        }
    }

    fn ensure_and_drive(&self, type_id: &str, key: &K) -> Result<Handle, HubError> {
        let t = self.timeout();
        self.inner
            .graph
            .ensure_node(key.clone(), ResourceCell::new(type_id), t)?;

        if let Some(handle) = self
            .inner
            .graph
            .with_node_read(key, t, |cell| cell.handle())?
        {
            self.inner.graph.touch(key, t)?;
            self.enforce_memory_budget_opportunistic();
            return Ok(handle);
        }

        let outcome = self.inner.graph.with_node_write(key, t, |cell| {
            if cell.state == ResourceState::Loaded {
                return Ok(cell.handle());
            }
            let Some(mut resource) = self.inner.types.create(type_id) else {
                return Err(HubError::UnknownType(type_id.to_string()));
            };
            let from = cell.state;
            if !cell.transition_to(ResourceState::Loading) {
                return Err(HubError::InvalidStateTransition(from, ResourceState::Loading));
            }
            debug!("{key:?} -> Loading");
            match resource.load() {
                Ok(()) => {
                    cell.set_loaded(resource);
                    debug!("{key:?} -> Loaded");
                    Ok(cell.handle())
                }
                Err(msg) => {
                    cell.transition_to(ResourceState::LoadingFailed);
                    debug!("{key:?} -> LoadingFailed: {msg}");
                    Err(HubError::LoadFailed(msg))
                }
            }
        })?;

        match outcome {
            Ok(Some(handle)) => {
                self.inner.graph.touch(key, t)?;
                self.inner.stats.loads_completed.fetch_add(1, Ordering::Relaxed);
                self.enforce_memory_budget_opportunistic();
                Ok(handle)
            }
            Ok(None) => {
                error!("{key:?}: Loaded transition left no handle behind, this is an internal invariant violation");
                Err(HubError::LoadFailed(
                    "resource was not present after a successful load transition".to_string(),
                ))
            }
            Err(e) => {
                if matches!(e, HubError::LoadFailed(_)) {
                    self.inner.stats.loads_failed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e)
            }
        }
    }

    // ---- dependency graph -----------------------------------------------

    pub fn add_dependency(&self, dependent: &K, dependency: &K) -> bool {
        self.inner
            .graph
            .add_edge(dependent, dependency, self.timeout())
            .is_ok()
    }

    pub fn remove_dependency(&self, dependent: &K, dependency: &K) -> bool {
        self.inner
            .graph
            .remove_edge(dependent, dependency, self.timeout())
            .unwrap_or(false)
    }

    pub fn dependencies_of(&self, key: &K) -> Result<Vec<K>, HubError> {
        Ok(self.inner.graph.dependencies_of(key, self.timeout())?)
    }

    pub fn dependents_of(&self, key: &K) -> Result<Vec<K>, HubError> {
        Ok(self.inner.graph.dependents_of(key, self.timeout())?)
    }

    // ---- unload / cascade -------------------------------------------------

    /// Unloads a single resource. Non-cascading: refuses with
    /// [`HubError::WouldOrphanDependents`] if anything still depends on it,
    /// or [`HubError::StillReferenced`] if outstanding handles remain.
    /// Cascading: unloads the node and its transitive dependents first — a
    /// dependent is always unloaded before the thing it depends on, walking
    /// up the in-edges (dependents) before the node itself.
    pub fn unload(&self, key: &K, cascade: bool) -> Result<bool, HubError> {
        let t = self.timeout();
        if !self.inner.graph.contains(key) {
            return Ok(false);
        }
        if cascade {
            let targets = self.cascade_targets(key, t)?;
            let mut any = false;
            for target in &targets {
                if self.unload_single(target, t)? {
                    any = true;
                }
            }
            Ok(any)
        } else {
            let dependents = self.inner.graph.dependents_of(key, t)?;
            if !dependents.is_empty() {
                return Err(HubError::WouldOrphanDependents);
            }
            self.unload_single(key, t)
        }
    }

    fn cascade_targets(&self, key: &K, t: Duration) -> Result<Vec<K>, HubError> {
        let mut seen: FnvHashSet<K> = FnvHashSet::default();
        let mut frontier = vec![key.clone()];
        seen.insert(key.clone());
        while let Some(k) = frontier.pop() {
            for dependent in self.inner.graph.dependents_of(&k, t)? {
                if seen.insert(dependent.clone()) {
                    frontier.push(dependent);
                }
            }
        }
        let keys: Vec<K> = seen.into_iter().collect();
        Ok(self.inner.graph.induced_topo_order(&keys).unwrap_or_else(|| {
            let mut sorted = keys;
            sorted.sort();
            sorted
        }))
    }

    fn unload_single(&self, key: &K, t: Duration) -> Result<bool, HubError> {
        let taken = self.inner.graph.with_node_write(key, t, |cell| {
            if cell.state != ResourceState::Loaded {
                return Ok(None);
            }
            if cell.reference_count() > 1 {
                return Err(HubError::StillReferenced);
            }
            Ok(Some(cell.take_value_for_unload()))
        })?;
        match taken {
            Ok(None) => Ok(false),
            Err(e) => Err(e),
            Ok(Some(value)) => {
                debug!("{key:?} -> Unloading");
                value.write().unload();
                self.inner
                    .graph
                    .with_node_write(key, t, |cell| cell.finish_unload())?;
                debug!("{key:?} -> Unloaded");
                self.inner.graph.remove_node(key, t)?;
                Ok(true)
            }
        }
    }

    // ---- memory budget / eviction -----------------------------------------

    pub fn memory_usage(&self) -> usize {
        let t = self.timeout();
        let Ok(keys) = self.inner.graph.all_keys(t) else {
            return 0;
        };
        keys.iter()
            .map(|k| {
                self.inner
                    .graph
                    .with_node_read(k, t, |cell| {
                        if cell.state == ResourceState::Loaded {
                            cell.estimated_bytes()
                        } else {
                            0
                        }
                    })
                    .unwrap_or(0)
            })
            .sum()
    }

    pub fn memory_budget(&self) -> usize {
        self.inner.memory_budget.load(Ordering::Relaxed)
    }

    pub fn set_memory_budget(&self, bytes: usize) {
        self.inner.memory_budget.store(bytes, Ordering::Relaxed);
    }

    fn enforce_memory_budget_opportunistic(&self) {
        self.enforce_memory_budget();
    }

    /// Runs the eviction policy: LRU order among resources with no
    /// outstanding handles and no dependents, stopping
    /// once enough bytes have been freed. Serialized by a dedicated
    /// mutex; a concurrent caller that cannot acquire it returns `0`
    /// immediately rather than waiting, since another thread is already
    /// enforcing.
    pub fn enforce_memory_budget(&self) -> usize {
        let Some(_guard) = self.inner.budget_mutex.try_lock() else {
            return 0;
        };
        let t = self.timeout();
        let budget = self.memory_budget();
        let usage = self.memory_usage();
        if usage <= budget {
            return 0;
        }
        let to_free = usage - budget;

        let Ok(keys) = self.inner.graph.all_keys(t) else {
            return 0;
        };
        let mut candidates: Vec<(K, u64)> = Vec::new();
        for key in &keys {
            let evictable = self
                .inner
                .graph
                .with_node_read(key, t, |cell| {
                    cell.state == ResourceState::Loaded && cell.reference_count() == 1
                })
                .unwrap_or(false);
            if !evictable {
                continue;
            }
            if self.inner.graph.in_degree(key, t).unwrap_or(usize::MAX) != 0 {
                continue;
            }
            let last_access = self.inner.graph.last_access(key, t).unwrap_or(0);
            candidates.push((key.clone(), last_access));
        }
        candidates.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        let mut freed = 0usize;
        let mut evicted = 0usize;
        for (key, _) in candidates {
            if freed >= to_free {
                break;
            }
            let taken = self.inner.graph.with_node_write(&key, t, |cell| {
                if cell.state == ResourceState::Loaded && cell.reference_count() == 1 {
                    Some(cell.take_value_for_unload())
                } else {
                    None
                }
            });
            let Ok(Some(value)) = taken else {
                continue;
            };
            value.write().unload();
            let bytes = value.read().estimated_bytes_in_memory();
            let _ = self
                .inner
                .graph
                .with_node_write(&key, t, |cell| cell.finish_unload());
            if self.inner.graph.remove_node(&key, t).is_ok() {
                freed += bytes;
                evicted += 1;
                self.inner.stats.evictions_performed.fetch_add(1, Ordering::Relaxed);
            }
        }
        evicted
    }

    // ---- worker pool -------------------------------------------------------

    pub fn worker_count(&self) -> usize {
        self.inner.worker_count.load(Ordering::SeqCst)
    }

    pub fn set_worker_count(&self, n: usize) -> Result<(), HubError> {
        if n == 0 {
            return Err(HubError::InvalidWorkerCount);
        }
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(HubError::ShuttingDown);
        }
        self.inner.pool_generation.fetch_add(1, Ordering::SeqCst);
        let old = std::mem::take(&mut *self.inner.workers.lock());
        for handle in old {
            let _ = handle.join();
        }
        self.spawn_workers(n);
        info!("resource hub worker pool resized to {n}");
        Ok(())
    }

    /// Testing hook: workers stop popping new requests but do not exit,
    /// so the pool can be resumed without re-spawning threads.
    pub fn quiesce_workers(&self) {
        self.inner.quiesced.store(true, Ordering::SeqCst);
    }

    pub fn resume_workers(&self) {
        self.inner.quiesced.store(false, Ordering::SeqCst);
    }

    fn spawn_workers(&self, n: usize) {
        let generation = self.inner.pool_generation.load(Ordering::SeqCst);
        let mut handles = Vec::with_capacity(n);
        for _ in 0..n {
            let hub = self.clone();
            handles.push(std::thread::spawn(move || hub.worker_loop(generation)));
        }
        *self.inner.workers.lock() = handles;
        self.inner.worker_count.store(n, Ordering::SeqCst);
    }

    fn worker_loop(&self, generation: u64) {
        loop {
            if self.inner.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            if self.inner.pool_generation.load(Ordering::SeqCst) != generation {
                return;
            }
            if self.inner.quiesced.load(Ordering::SeqCst) {
                std::thread::sleep(self.inner.worker_poll_interval);
                continue;
            }
            match self.inner.queue.pop(self.inner.worker_poll_interval) {
                Some(request) => self.run_job(request.key),
                None => return, // queue closed and drained
            }
        }
    }

    fn run_job(&self, job: HubJob<K>) {
        let result = self.ensure_and_drive(&job.type_id, &job.key);
        if let Err(e) = &result {
            warn!("async load of `{:?}` failed: {e}", job.key);
        }
        if let Some(callback) = job.callback {
            callback(result.ok());
        }
    }

    /// Idempotent: signals workers, closes the queue, joins workers with
    /// each worker bounded by one poll interval, then clears every node.
    pub fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("resource hub shutting down");
        self.inner.queue.close();
        let handles = std::mem::take(&mut *self.inner.workers.lock());
        for handle in handles {
            let _ = handle.join();
        }
        self.inner.worker_count.store(0, Ordering::SeqCst);
        let t = self.timeout();
        if let Err(e) = self.inner.graph.clear(t) {
            warn!("hub shutdown: failed to clear graph within timeout: {e}");
        }
    }

    // ---- diagnostics -------------------------------------------------------

    pub fn has_resource(&self, key: &K) -> bool {
        self.inner.graph.contains(key)
    }

    pub fn is_loaded(&self, key: &K) -> bool {
        self.inner
            .graph
            .with_node_read(key, self.timeout(), |cell| cell.state == ResourceState::Loaded)
            .unwrap_or(false)
    }
}
