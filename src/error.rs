// Copyright 2018 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;

use crate::resource::ResourceState;

/// Errors raised by the coordinated DAG and the resource lock protocol.
///
/// These are values, not exceptions: no core operation panics on
/// well-formed input.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum GraphError {
    /// Inserting an edge would have closed a cycle; the edge was rejected
    /// before being committed.
    CycleDetected,
    /// A lock would have violated the DAG-ordering invariant, or the
    /// wait-for intersection check found another thread blocking the
    /// requester.
    DeadlockDetected,
    /// A `try_lock` exhausted its caller-supplied timeout budget.
    LockTimeout,
    /// The node referenced by a key does not exist in the graph.
    UnknownNode,
    /// A structural mutation was attempted while the graph does not permit
    /// it (currently unused by the public API, reserved for future
    /// structural-intent preemption policies).
    StructuralConflict,
    /// An operation (e.g. `upgrade`) was attempted on a lock handle in a
    /// state that does not support it.
    InvalidLockState,
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::CycleDetected => write!(f, "edge would introduce a cycle"),
            GraphError::DeadlockDetected => write!(f, "lock acquisition would deadlock"),
            GraphError::LockTimeout => write!(f, "lock acquisition timed out"),
            GraphError::UnknownNode => write!(f, "no such node in the graph"),
            GraphError::StructuralConflict => {
                write!(f, "graph structure is being mutated concurrently")
            }
            GraphError::InvalidLockState => {
                write!(f, "lock handle is not in a state that supports this operation")
            }
        }
    }
}

impl std::error::Error for GraphError {}

/// Errors raised by the resource hub.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum HubError {
    /// No factory has been registered for the requested `typeId`.
    UnknownType(String),
    /// The hub has been shut down; the operation was rejected without
    /// attempting any work.
    ShuttingDown,
    /// A resource's `load` returned failure.
    LoadFailed(String),
    /// `unload(id, cascade=false)` was called on a node that still has
    /// dependents.
    WouldOrphanDependents,
    /// `unload` was called on a resource with outstanding external handles
    /// (`Arc` strong count greater than the hub's own baseline reference).
    /// Distinguished from [`HubError::WouldOrphanDependents`], which is
    /// about dependency edges rather than outstanding handles.
    StillReferenced,
    /// A resource's state machine rejected an attempted transition, most
    /// likely because a load raced an in-flight unload of the same
    /// resource.
    InvalidStateTransition(ResourceState, ResourceState),
    /// Propagated from the graph/lock layer.
    Graph(GraphError),
    /// `set_worker_count(0)` was rejected; the pool may never be emptied.
    InvalidWorkerCount,
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HubError::UnknownType(t) => write!(f, "no factory registered for type `{t}`"),
            HubError::ShuttingDown => write!(f, "hub is shutting down"),
            HubError::LoadFailed(msg) => write!(f, "load failed: {msg}"),
            HubError::WouldOrphanDependents => {
                write!(f, "unload refused: resource still has dependents")
            }
            HubError::StillReferenced => {
                write!(f, "unload refused: resource has outstanding handles")
            }
            HubError::InvalidStateTransition(from, to) => {
                write!(f, "resource cannot move from {from} to {to}")
            }
            HubError::Graph(e) => write!(f, "{e}"),
            HubError::InvalidWorkerCount => write!(f, "worker count must be at least 1"),
        }
    }
}

impl std::error::Error for HubError {}

impl From<GraphError> for HubError {
    fn from(e: GraphError) -> Self {
        HubError::Graph(e)
    }
}
