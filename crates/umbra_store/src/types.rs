//! Core identifier types for the store.

use std::fmt;
use std::num::NonZeroU64;

/// Unique identifier for a stored object.
///
/// Object IDs are 64-bit, assigned monotonically starting at 1, stable
/// across restarts, and never reused. Zero is not a valid ID, which the
/// type makes unrepresentable.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(NonZeroU64);

impl ObjectId {
    /// Creates an object ID from a raw value.
    ///
    /// Returns `None` for zero.
    #[must_use]
    pub const fn new(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(n) => Some(Self(n)),
            None => None,
        }
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "oid:{}", self.0)
    }
}

/// Unique identifier for a transaction.
///
/// Transaction IDs are monotonically increasing, so a larger ID always
/// denotes a younger transaction. Deadlock victim selection relies on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxnId(pub u64);

impl TxnId {
    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Identifier assigned to a class descriptor by the class table.
///
/// Class IDs are small integers assigned on first encounter; payloads embed
/// the ID instead of the descriptor bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClassId(pub u32);

impl ClassId {
    /// Creates a new class ID.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_id_rejects_zero() {
        assert!(ObjectId::new(0).is_none());
        assert!(ObjectId::new(1).is_some());
    }

    #[test]
    fn object_id_roundtrip() {
        let id = ObjectId::new(42).unwrap();
        assert_eq!(id.as_u64(), 42);
    }

    #[test]
    fn txn_id_ordering() {
        assert!(TxnId::new(1) < TxnId::new(2));
    }

    #[test]
    fn display_forms() {
        assert_eq!(format!("{}", ObjectId::new(7).unwrap()), "oid:7");
        assert_eq!(format!("{}", TxnId::new(3)), "txn:3");
        assert_eq!(format!("{}", ClassId::new(9)), "class:9");
    }
}
