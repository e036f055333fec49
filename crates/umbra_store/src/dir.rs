//! Store directory management.
//!
//! On-disk layout:
//!
//! ```text
//! <store_path>/
//! ├─ LOCK          # advisory lock, one process at a time
//! ├─ SNAPSHOT      # last checkpoint image
//! └─ wal.log       # write-ahead log since the checkpoint
//! ```

use crate::error::{StoreError, StoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const SNAPSHOT_FILE: &str = "SNAPSHOT";
/// Temporary file for atomic snapshot writes.
const SNAPSHOT_TEMP: &str = "SNAPSHOT.tmp";
const WAL_FILE: &str = "wal.log";

/// Holds the store directory and its exclusive advisory lock.
///
/// Only one `StoreDir` can exist per directory at a time; the lock is
/// released when the value is dropped.
#[derive(Debug)]
pub struct StoreDir {
    path: PathBuf,
    _lock_file: File,
}

impl StoreDir {
    /// Opens or creates a store directory and takes its lock.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::StoreLocked`] if another process holds the
    /// lock, or an I/O error if the directory cannot be created.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if !path.exists() {
            fs::create_dir_all(path).map_err(StoreError::from_io)?;
        }
        if !path.is_dir() {
            return Err(StoreError::invalid_argument(format!(
                "store path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))
            .map_err(StoreError::from_io)?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StoreError::StoreLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the store directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path of the write-ahead log file.
    #[must_use]
    pub fn wal_path(&self) -> PathBuf {
        self.path.join(WAL_FILE)
    }

    /// Returns the path of the snapshot file.
    #[must_use]
    pub fn snapshot_path(&self) -> PathBuf {
        self.path.join(SNAPSHOT_FILE)
    }

    /// Reads the snapshot image, or `None` if no checkpoint was taken yet.
    pub fn read_snapshot(&self) -> StoreResult<Option<Vec<u8>>> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Ok(None);
        }
        fs::read(&path).map(Some).map_err(StoreError::from_io)
    }

    /// Writes the snapshot image atomically: temp file, sync, rename.
    ///
    /// A crash mid-write leaves the previous snapshot intact.
    pub fn write_snapshot(&self, bytes: &[u8]) -> StoreResult<()> {
        let temp_path = self.path.join(SNAPSHOT_TEMP);
        {
            let mut file = File::create(&temp_path).map_err(StoreError::from_io)?;
            use std::io::Write;
            file.write_all(bytes).map_err(StoreError::from_io)?;
            file.sync_all().map_err(StoreError::from_io)?;
        }
        fs::rename(&temp_path, self.snapshot_path()).map_err(StoreError::from_io)?;
        Ok(())
    }
}

impl StoreError {
    pub(crate) fn from_io(err: std::io::Error) -> Self {
        Self::Storage(umbra_storage::StorageError::Io(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        let store_dir = StoreDir::open(&path).unwrap();
        assert!(path.is_dir());
        assert_eq!(store_dir.path(), path);
    }

    #[test]
    fn second_open_is_locked() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        let _held = StoreDir::open(&path).unwrap();
        assert!(matches!(
            StoreDir::open(&path).unwrap_err(),
            StoreError::StoreLocked
        ));
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        drop(StoreDir::open(&path).unwrap());
        assert!(StoreDir::open(&path).is_ok());
    }

    #[test]
    fn snapshot_roundtrip() {
        let dir = tempdir().unwrap();
        let store_dir = StoreDir::open(&dir.path().join("store")).unwrap();
        assert_eq!(store_dir.read_snapshot().unwrap(), None);

        store_dir.write_snapshot(b"image-1").unwrap();
        assert_eq!(store_dir.read_snapshot().unwrap().unwrap(), b"image-1");

        store_dir.write_snapshot(b"image-2").unwrap();
        assert_eq!(store_dir.read_snapshot().unwrap().unwrap(), b"image-2");
    }

    #[test]
    fn paths_are_inside_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        let store_dir = StoreDir::open(&path).unwrap();
        assert!(store_dir.wal_path().starts_with(&path));
        assert!(store_dir.snapshot_path().starts_with(&path));
    }
}
