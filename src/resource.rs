// Copyright 2018 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Resource lifecycle: the per-resource state machine, the type registry
//! mapping a `typeId` to a loader, and the reference-counted payload cell
//! a [`crate::hub::ResourceHub`] hands out as a [`Handle`].
//!
//! The capability trait here ([`ResourceHooks`]) is the associated behavior
//! set a concrete resource type implements, stored behind a trait object
//! rather than monomorphized per type, since a hub holds many different
//! resource types in one graph.

use std::fmt;
use std::sync::Arc;

use fnv::FnvHashMap;
use parking_lot::RwLock;

/// The state machine a resource passes through.
///
/// Allowed transitions: `Unloaded -> Loading`, `Loading -> Loaded`,
/// `Loading -> LoadingFailed`, `Loaded -> Unloading`,
/// `Unloading -> Unloaded`, `LoadingFailed -> Loading` (retry),
/// `LoadingFailed -> Unloaded` (giving up). Every other transition is
/// rejected; [`ResourceCell::transition_to`] is the only way a
/// [`crate::hub::ResourceHub`] is allowed to move a cell's state, so an
/// operation racing another (e.g. a load arriving while the same resource
/// is mid-unload) is refused rather than silently clobbering state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResourceState {
    Unloaded,
    Loading,
    Loaded,
    LoadingFailed,
    Unloading,
}

impl ResourceState {
    pub fn can_transition_to(self, next: ResourceState) -> bool {
        use ResourceState::*;
        matches!(
            (self, next),
            (Unloaded, Loading)
                | (Loading, Loaded)
                | (Loading, LoadingFailed)
                | (Loaded, Unloading)
                | (Unloading, Unloaded)
                | (LoadingFailed, Loading)
                | (LoadingFailed, Unloaded)
        )
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceState::Unloaded => "unloaded",
            ResourceState::Loading => "loading",
            ResourceState::Loaded => "loaded",
            ResourceState::LoadingFailed => "loading_failed",
            ResourceState::Unloading => "unloading",
        };
        write!(f, "{s}")
    }
}

/// The capability set a concrete resource type must provide. Implementors
/// are typically a thin struct wrapping the decoded asset; `load`/`unload`
/// do the actual I/O or GPU-upload work and run on a hub worker thread, not
/// on the caller's.
pub trait ResourceHooks: Send + Sync {
    /// An estimate used by the hub's memory-budget eviction policy. Need
    /// not be exact; it is never used for correctness, only for choosing
    /// eviction order.
    fn estimated_bytes_in_memory(&self) -> usize;

    /// Performs the actual load. Returning `Err` drives the resource to
    /// `ResourceState::LoadingFailed`.
    fn load(&mut self) -> Result<(), String>;

    /// Releases whatever `load` acquired. Called with the resource already
    /// in `ResourceState::Unloading`.
    fn unload(&mut self);
}

/// A factory that produces a fresh, unloaded resource instance for a given
/// `typeId`. Registered once per type with a [`TypeRegistry`].
pub type ResourceFactory = Arc<dyn Fn() -> Box<dyn ResourceHooks> + Send + Sync>;

/// Maps a `typeId` to the factory that knows how to construct instances of
/// it. Registering the same `typeId` twice silently replaces the previous
/// factory: a plain overwrite-on-insert map, not an insert-or-fail one.
pub struct TypeRegistry {
    factories: RwLock<FnvHashMap<String, ResourceFactory>>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    pub fn new() -> Self {
        TypeRegistry {
            factories: RwLock::new(FnvHashMap::default()),
        }
    }

    pub fn register(
        &self,
        type_id: impl Into<String>,
        factory: impl Fn() -> Box<dyn ResourceHooks> + Send + Sync + 'static,
    ) {
        self.factories
            .write()
            .insert(type_id.into(), Arc::new(factory));
    }

    pub fn is_registered(&self, type_id: &str) -> bool {
        self.factories.read().contains_key(type_id)
    }

    pub fn create(&self, type_id: &str) -> Option<Box<dyn ResourceHooks>> {
        self.factories.read().get(type_id).map(|f| f())
    }
}

/// The payload a [`crate::hub::ResourceHub`] stores in each graph node: the
/// resource's state machine position plus its loaded value, if any.
///
/// `value` is wrapped in its own `Arc` so that [`Handle`] can clone out a
/// live reference independent of the node's own lock; the hub keeps one
/// baseline clone alongside `state`, and every [`Handle`] in circulation is
/// another clone of the same `Arc`. `Arc::strong_count` on `value` is
/// therefore exactly "1 (the hub's own baseline) + number of outstanding
/// handles", which is the reference count the eviction policy and
/// `unload`'s `StillReferenced` check both read directly: counting live
/// `Arc` clones instead of reimplementing a manual retain/release protocol.
pub struct ResourceCell {
    pub state: ResourceState,
    pub type_id: String,
    value: Option<Arc<RwLock<Box<dyn ResourceHooks>>>>,
}

impl ResourceCell {
    pub fn new(type_id: impl Into<String>) -> Self {
        ResourceCell {
            state: ResourceState::Unloaded,
            type_id: type_id.into(),
            value: None,
        }
    }

    /// Attempts to move to `next`, applying the state change only if
    /// [`ResourceState::can_transition_to`] allows it. Returns whether the
    /// transition was applied; a caller on the rejected path must not
    /// assume anything about the cell changed.
    pub fn transition_to(&mut self, next: ResourceState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }

    /// Completes a `Loading -> Loaded` transition, storing the freshly
    /// loaded value. Returns whether the transition was applied; on `false`
    /// the cell is left untouched and the caller's value is dropped.
    pub fn set_loaded(&mut self, resource: Box<dyn ResourceHooks>) -> bool {
        if self.transition_to(ResourceState::Loaded) {
            self.value = Some(Arc::new(RwLock::new(resource)));
            true
        } else {
            false
        }
    }

    pub fn clear(&mut self) {
        self.value = None;
    }

    /// The number of live references to the loaded value: the hub's own
    /// baseline plus every outstanding [`Handle`]. `0` if unloaded.
    pub fn reference_count(&self) -> usize {
        self.value.as_ref().map(Arc::strong_count).unwrap_or(0)
    }

    pub fn estimated_bytes(&self) -> usize {
        self.value
            .as_ref()
            .map(|v| v.read().estimated_bytes_in_memory())
            .unwrap_or(0)
    }

    /// Clones out a new [`Handle`] onto the loaded value. `None` if the
    /// resource is not currently `Loaded`.
    pub fn handle(&self) -> Option<Handle> {
        self.value.clone().map(Handle)
    }

    /// Transitions to `Unloading` and hands back the loaded value so the
    /// caller can run `unload()` on it outside the node lock's critical
    /// section. Callers must have already verified `state == Loaded` and
    /// `reference_count() == 1`; panics otherwise, since taking a value
    /// that's still referenced elsewhere would silently break the
    /// strong-count-based reference accounting documented above.
    pub fn take_value_for_unload(&mut self) -> Arc<RwLock<Box<dyn ResourceHooks>>> {
        assert!(
            self.transition_to(ResourceState::Unloading),
            "take_value_for_unload requires Loaded, found {:?}",
            self.state
        );
        self.value.take().expect("Loaded state implies a value is present")
    }

    /// Completes the `Unloading -> Unloaded` transition started by
    /// [`ResourceCell::take_value_for_unload`].
    pub fn finish_unload(&mut self) {
        let applied = self.transition_to(ResourceState::Unloaded);
        debug_assert!(applied, "finish_unload called outside of Unloading");
    }
}

/// A live reference to a loaded resource, cloned from a
/// [`crate::hub::ResourceHub`]'s internal cell. Dropping the last `Handle`
/// (and the hub's own baseline clone, if the hub has since unloaded it)
/// drops the resource's value; there is no explicit release call, this is
/// ordinary `Arc` drop rather than a manual retain/release protocol.
#[derive(Clone)]
pub struct Handle(Arc<RwLock<Box<dyn ResourceHooks>>>);

impl Handle {
    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, Box<dyn ResourceHooks>> {
        self.0.read()
    }

    pub fn write(&self) -> parking_lot::RwLockWriteGuard<'_, Box<dyn ResourceHooks>> {
        self.0.write()
    }

    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}
