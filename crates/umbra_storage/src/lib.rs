//! # Umbra Storage
//!
//! Byte-level storage backends for the Umbra data service.
//!
//! Backends are **opaque append-only byte stores**: they provide reads at an
//! offset, appends at the tail, and durability barriers. All framing (log
//! records, snapshot images, checksums) belongs to the layers above.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::MemoryBackend;
