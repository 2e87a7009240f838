// Copyright 2018 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
#![allow(clippy::match_ref_pats)]
#![allow(clippy::too_many_arguments, clippy::new_without_default)]
// `parking_lot::{Mutex, RwLock}` over `std::sync` equivalents throughout:
// Arc<Mutex<_>> reads more plainly than the poison-aware std variant, and
// the try-lock-with-timeout API this crate leans on isn't in std at all.
#![allow(clippy::mutex_atomic)]

//! A coordinated resource dependency graph: a keyed DAG with intent-aware,
//! deadlock-preventing locking, a reference-counted resource lifecycle, and
//! a facade that loads, evicts, and caches resources against a memory
//! budget.

pub mod error;
pub mod graph;
pub mod hub;
pub mod key;
pub mod lock;
pub mod queue;
pub mod resource;

pub use crate::error::{GraphError, HubError};
pub use crate::graph::{CallbackId, CallbackStatus, CoordinatedGraph, LockIntent};
pub use crate::hub::{HubConfig, HubStats, ResourceHub};
pub use crate::key::{Key, Priority};
pub use crate::lock::{LockHandle, LockHistoryEntry, LockMode, LockStatus, LockTable};
pub use crate::resource::{Handle, ResourceCell, ResourceHooks, ResourceState, TypeRegistry};
