//! Persistence of typed records and their associations over a Redis-like store.
//!
//! ## Storage Layout
//!
//! Every record owns up to three path segments below `[NAMESPACE]:[ID]:`:
//!
//! - `attrs`: A hash holding all scalar attributes, one field each.
//! - `assocs`: The `belongs_to` hash of foreign ids, and one set per `has_many`.
//! - `indices`: Namespace-level sets of ids, keyed by attribute and encoded value.
//!
//! See [`Key`] for the exact path rules and [`core::encoding`] for scalar encodings.
//!
//! ## Consistency
//!
//! Writes are applied through a [`Backend`], which buffers them in a transaction when one
//! is open and otherwise applies each immediately. Mutations spanning two namespaces run
//! under a [`LockScope`] covering both, which is re-entrant for nested operations.

#[macro_use]
extern crate derive_more;
#[macro_use]
extern crate tracing;

pub mod associations;
pub mod backend;
pub mod core;
pub mod filter;
pub mod kv;
pub mod lock;
pub mod record;

pub use crate::{
    associations::{Association, AssociationDef, AssociationKind, BelongsTo, HasMany, Registry},
    backend::{Backend, BackendConfig, LockConfig, Scoped},
    core::{Key, LinkError, LinkResult, StorageKind, Value, ValueType},
    filter::{Filter, Operand},
    kv::{Coordination, InMemoryStore, Store},
    lock::{LockScope, Locker, NoLock, StoreLock},
    record::RecordRef,
};
