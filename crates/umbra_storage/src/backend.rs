//! Storage backend trait definition.

use crate::error::StorageResult;

/// A low-level byte store for the Umbra data service.
///
/// Backends are opaque: they hold a single growable sequence of bytes and
/// know nothing about log records, snapshots, or object payloads. The store
/// layer owns all format interpretation.
///
/// # Invariants
///
/// - `append` returns the offset at which the data begins
/// - `read_at` returns exactly the bytes previously written at that offset
/// - after `flush` returns, all appended data survives process termination
/// - after `sync` returns, data *and* file metadata are durable
/// - backends are `Send + Sync` so one store can be shared across threads
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ReadPastEnd`](crate::StorageError::ReadPastEnd)
    /// if the requested range extends beyond the current size, or an I/O
    /// error from the underlying medium.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends `data` at the tail and returns the offset where it begins.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Flushes buffered writes so they survive process termination.
    fn flush(&mut self) -> StorageResult<()>;

    /// Syncs data and metadata to the underlying medium.
    ///
    /// A stronger barrier than [`flush`](Self::flush): it also makes file
    /// metadata (size) durable, so the data survives power loss.
    fn sync(&mut self) -> StorageResult<()>;

    /// Returns the current size in bytes, which is the offset of the next
    /// append.
    fn size(&self) -> StorageResult<u64>;

    /// Truncates the storage to `new_size` bytes, discarding the tail.
    ///
    /// Used by the store to reclaim log space after a checkpoint.
    ///
    /// # Errors
    ///
    /// Fails if `new_size` exceeds the current size.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;
}
