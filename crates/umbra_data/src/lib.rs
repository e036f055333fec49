//! # Umbra Data
//!
//! Transactional managed-object data service for persistent multi-user
//! server applications.
//!
//! Application code works with an object graph of *managed objects*
//! through [`Obj`] handles and [`Ref`] references, while every read and
//! write participates in a serializable transaction against an
//! [`ObjectStore`](umbra_store::ObjectStore). Tasks run inside
//! [`DataService::run`], which retries them when a transaction loses a
//! conflict, times out, or falls victim to deadlock detection.
//!
//! ```no_run
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//! use umbra_data::{DataConfig, DataService};
//! use umbra_store::{DataStore, StoreConfig};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Counter {
//!     value: u64,
//! }
//!
//! # fn main() -> Result<(), umbra_data::DataError> {
//! let store = DataStore::open_in_memory(StoreConfig::default())?;
//! let service = DataService::new(DataConfig::new("demo"), store)?;
//!
//! service.run(|| {
//!     let counter = match service.get_binding::<Counter>("counter") {
//!         Ok(counter) => counter,
//!         Err(umbra_data::DataError::NameNotBound { .. }) => {
//!             let counter = service.create(Counter { value: 0 })?;
//!             service.set_binding("counter", &counter)?;
//!             counter
//!         }
//!         Err(err) => return Err(err),
//!     };
//!     service.mark_for_update(&counter)?;
//!     counter.write().value += 1;
//!     Ok(())
//! })?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod classes;
mod config;
mod context;
mod coordinator;
mod error;
mod hooks;
mod managed;
mod reference;
mod service;

pub use config::DataConfig;
pub use coordinator::Participant;
pub use error::{DataError, DataResult};
pub use hooks::{HookedDataService, IdentityHook, ReplacementHook};
pub use managed::ManagedObject;
pub use reference::{Obj, Ref};
pub use service::{DataService, ServiceHeader, SERVICE_VERSION};

// The store types application code meets at the service surface.
pub use umbra_store::{ObjectId, Vote};
