//! # Umbra Store
//!
//! Durable object and name-binding store with serializable transactions.
//!
//! The store maps 64-bit object IDs to serialized payloads and textual
//! names to object IDs. Isolation is pessimistic: readers take shared
//! locks, writers exclusive locks, all held to end of transaction, with
//! wait-for-graph deadlock detection choosing the youngest transaction as
//! victim. Durability is a write-ahead log over an opaque
//! [`StorageBackend`](umbra_storage::StorageBackend) plus checkpoint
//! snapshots.
//!
//! The store is one participant in a two-phase commit:
//! [`prepare`](ObjectStore::prepare) durably logs a transaction's staged
//! mutations (or votes [`Vote::ReadOnly`]), and
//! [`commit`](ObjectStore::commit) / [`abort`](ObjectStore::abort) settle
//! the decision.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod dir;
mod error;
mod lock;
mod scheduler;
mod snapshot;
mod store;
mod txn;
mod types;
mod wal;

pub use dir::StoreDir;
pub use error::{StoreError, StoreResult};
pub use scheduler::{Scheduler, TaskHandle, ThreadScheduler};
pub use store::{DataStore, ObjectStore, StoreConfig, Vote};
pub use types::{ClassId, ObjectId, TxnId};
