//! Error types for store operations.

use crate::types::{ClassId, ObjectId, TxnId};
use thiserror::Error;
use umbra_storage::StorageError;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested object does not exist or has been removed.
    #[error("object not found: {id}")]
    ObjectNotFound {
        /// The object that was requested.
        id: ObjectId,
    },

    /// The requested name has no binding.
    #[error("name not bound: {name:?}")]
    NameNotBound {
        /// The name that was looked up.
        name: String,
    },

    /// The transaction lost a serialization conflict and must be retried.
    #[error("transaction conflict in {txn} (deadlock victim: {deadlock})")]
    TransactionConflict {
        /// The aborted transaction.
        txn: TxnId,
        /// Whether the transaction was chosen as a deadlock victim.
        deadlock: bool,
    },

    /// The transaction exceeded its deadline and was aborted.
    #[error("transaction timed out: {txn}")]
    TransactionTimeout {
        /// The timed-out transaction.
        txn: TxnId,
    },

    /// The transaction is not active (unknown, committed, or aborted).
    #[error("transaction not active: {txn}")]
    TransactionNotActive {
        /// The transaction in question.
        txn: TxnId,
    },

    /// The store is shutting down or shut down and accepts no new work.
    #[error("store is shutting down")]
    ShuttingDown,

    /// `shutdown` was called again after a successful shutdown.
    #[error("store is already shut down")]
    AlreadyShutDown,

    /// Another process holds the store directory lock.
    #[error("store directory locked: another process has exclusive access")]
    StoreLocked,

    /// A class ID that was never assigned by the class table.
    #[error("unknown class id: {id}")]
    UnknownClass {
        /// The unrecognized class ID.
        id: ClassId,
    },

    /// An invalid argument was passed to a store operation.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the argument issue.
        message: String,
    },

    /// The on-disk state is damaged or inconsistent.
    #[error("store corrupt: {message}")]
    Corrupt {
        /// Description of the corruption.
        message: String,
    },

    /// An error from the storage backend.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl StoreError {
    /// Creates a corruption error.
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Whether a fresh transaction attempting the same work may succeed.
    ///
    /// Conflicts, deadlock-victim aborts, and timeouts are retryable; every
    /// other error reflects a condition a retry cannot fix.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransactionConflict { .. } | Self::TransactionTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(StoreError::TransactionConflict {
            txn: TxnId::new(1),
            deadlock: false,
        }
        .is_retryable());
        assert!(StoreError::TransactionTimeout { txn: TxnId::new(1) }.is_retryable());
        assert!(!StoreError::ObjectNotFound {
            id: ObjectId::new(1).unwrap(),
        }
        .is_retryable());
        assert!(!StoreError::ShuttingDown.is_retryable());
    }

    #[test]
    fn deadlock_message() {
        let err = StoreError::TransactionConflict {
            txn: TxnId::new(5),
            deadlock: true,
        };
        assert!(err.to_string().contains("deadlock victim"));
    }
}
