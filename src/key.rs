// Copyright 2018 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt::Debug;
use std::hash::Hash;

/// Identifies a node in a [`crate::graph::CoordinatedGraph`].
///
/// Equality and hashing are used for the node index; `Ord` is used only as a
/// deterministic tiebreak (lock ordering, eviction candidate ordering) and is
/// never load-bearing for correctness on its own.
pub trait Key: Clone + Eq + Ord + Hash + Debug + Send + Sync + 'static {}

impl<T> Key for T where T: Clone + Eq + Ord + Hash + Debug + Send + Sync + 'static {}

/// Priority of an asynchronous load request, highest first.
///
/// `Ord` is derived in declaration order, so `Highest > High > Normal > Low >
/// Lowest`; the priority queue is a max-heap over this ordering.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Priority {
    Lowest,
    Low,
    Normal,
    High,
    Highest,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}
