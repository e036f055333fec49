//! The public error taxonomy of the data service.

use thiserror::Error;
use umbra_store::{ObjectId, StoreError};

/// Result type for data service operations.
pub type DataResult<T> = Result<T, DataError>;

/// Errors surfaced by the data service.
///
/// Errors fall into classes with different handling contracts:
///
/// - **retryable**: the transaction lost a race; the coordinator discards
///   it and re-runs the task ([`is_retryable`](DataError::is_retryable))
/// - **caller bug**: invalid IDs, type mismatches, unmanaged handles
/// - **data absent**: unbound names, missing objects
/// - **lifecycle**: the service or transaction is not in a state to serve
///   the call
/// - **fatal**: corrupt storage, incompatible versions
///   ([`is_fatal`](DataError::is_fatal)); logged at error level
#[derive(Debug, Error)]
pub enum DataError {
    /// The transaction lost a serialization conflict; retryable.
    #[error("transaction conflict (deadlock victim: {deadlock})")]
    TransactionConflict {
        /// Whether this transaction was a deadlock victim.
        deadlock: bool,
    },

    /// The transaction exceeded its deadline; retryable.
    #[error("transaction timed out")]
    TransactionTimeout,

    /// The retry budget was exhausted; the last cause was retryable but no
    /// further attempts will be made.
    #[error("transaction aborted after {attempts} attempts")]
    TransactionAborted {
        /// How many attempts were made.
        attempts: u32,
    },

    /// A raw object ID was zero or otherwise unusable.
    #[error("invalid object id: {id}")]
    InvalidId {
        /// The offending raw ID.
        id: u64,
    },

    /// The stored object is of a different type than requested.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// The requested type.
        expected: &'static str,
        /// The stored type descriptor.
        found: String,
    },

    /// The handle does not belong to the current transaction's context.
    #[error("object is not managed by the current transaction")]
    ObjectNotManaged,

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the problem.
        message: String,
    },

    /// The name has no binding.
    #[error("name not bound: {name:?}")]
    NameNotBound {
        /// The (external) name that was looked up.
        name: String,
    },

    /// The object does not exist or has been removed.
    #[error("object not found: {id}")]
    ObjectNotFound {
        /// The missing object.
        id: ObjectId,
    },

    /// The service has not finished construction.
    #[error("service is not ready")]
    ServiceNotReady,

    /// The service is shutting down and rejects new transactions.
    #[error("service is shutting down")]
    ServiceShuttingDown,

    /// The service has shut down.
    #[error("service is shut down")]
    ServiceShutDown,

    /// `shutdown` was called again after a successful shutdown.
    #[error("service is already shut down")]
    AlreadyShutDown,

    /// No transaction is active on the calling thread.
    #[error("transaction not active")]
    TransactionNotActive,

    /// The underlying store is damaged.
    #[error("storage corrupt: {message}")]
    StorageCorrupt {
        /// Description of the corruption.
        message: String,
    },

    /// The persisted header was written by an incompatible version.
    #[error(
        "incompatible data service version: store has {}.{}, code expects {}.{}",
        .found.0, .found.1, .expected.0, .expected.1
    )]
    VersionIncompatible {
        /// Version found in the store header.
        found: (u16, u16),
        /// Version this code writes.
        expected: (u16, u16),
    },

    /// A payload or class record could not be encoded or decoded.
    #[error("serialization format error: {message}")]
    SerializationFormat {
        /// Description of the problem.
        message: String,
    },

    /// An internal invariant was violated; indicates a service bug.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the violation.
        message: String,
    },
}

impl DataError {
    /// Creates a serialization format error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationFormat {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether a fresh transaction attempting the same work may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransactionConflict { .. } | Self::TransactionTimeout
        )
    }

    /// Whether this error indicates an unrecoverable service condition.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::StorageCorrupt { .. }
                | Self::VersionIncompatible { .. }
                | Self::SerializationFormat { .. }
        )
    }
}

impl From<StoreError> for DataError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ObjectNotFound { id } => Self::ObjectNotFound { id },
            StoreError::NameNotBound { name } => Self::NameNotBound { name },
            StoreError::TransactionConflict { deadlock, .. } => {
                Self::TransactionConflict { deadlock }
            }
            StoreError::TransactionTimeout { .. } => Self::TransactionTimeout,
            StoreError::TransactionNotActive { .. } => Self::TransactionNotActive,
            StoreError::ShuttingDown => Self::ServiceShuttingDown,
            StoreError::AlreadyShutDown => Self::AlreadyShutDown,
            StoreError::UnknownClass { id } => Self::SerializationFormat {
                message: format!("unknown class id: {id}"),
            },
            StoreError::Corrupt { message } => Self::StorageCorrupt { message },
            StoreError::Storage(err) => Self::StorageCorrupt {
                message: err.to_string(),
            },
            StoreError::StoreLocked => Self::internal("store directory is locked"),
            StoreError::InvalidArgument { message } => Self::internal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_store::TxnId;

    #[test]
    fn retryable_classes() {
        assert!(DataError::TransactionConflict { deadlock: false }.is_retryable());
        assert!(DataError::TransactionTimeout.is_retryable());
        assert!(!DataError::TransactionAborted { attempts: 3 }.is_retryable());
        assert!(!DataError::ObjectNotManaged.is_retryable());
        assert!(!DataError::ServiceShutDown.is_retryable());
    }

    #[test]
    fn fatal_classes() {
        assert!(DataError::VersionIncompatible {
            found: (2, 0),
            expected: (1, 0),
        }
        .is_fatal());
        assert!(DataError::serialization("bad payload").is_fatal());
        assert!(!DataError::TransactionTimeout.is_fatal());
    }

    #[test]
    fn store_errors_map_losslessly() {
        let err: DataError = StoreError::TransactionConflict {
            txn: TxnId::new(1),
            deadlock: true,
        }
        .into();
        assert!(matches!(
            err,
            DataError::TransactionConflict { deadlock: true }
        ));
        assert!(err.is_retryable());

        let err: DataError = StoreError::NameNotBound {
            name: "a.x".to_string(),
        }
        .into();
        assert!(matches!(err, DataError::NameNotBound { .. }));
    }
}
