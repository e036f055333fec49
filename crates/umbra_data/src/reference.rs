//! Managed references and object handles.
//!
//! [`Ref<T>`] is the durable edge of the object graph: it carries only an
//! object ID, serializes as that ID, and resolves through the current
//! transaction's context. [`Obj<T>`] is the in-memory handle a resolve
//! hands back: a shared view of the context-cached instance.

use crate::coordinator::current_context;
use crate::error::DataResult;
use crate::managed::ManagedObject;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;
use umbra_store::ObjectId;

/// A reference to a managed object.
///
/// References are lightweight and copyable; they own no object state.
/// Two references are equal iff their IDs are equal. Serializing a
/// reference writes only the ID, so cross-object edges in a serialized
/// graph record identities, not payloads.
pub struct Ref<T> {
    id: ObjectId,
    _marker: PhantomData<fn() -> T>,
}

impl<T: ManagedObject> Ref<T> {
    pub(crate) fn from_id(id: ObjectId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    /// The referenced object's stable ID.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id.as_u64()
    }

    pub(crate) fn object_id(&self) -> ObjectId {
        self.id
    }

    /// Resolves the reference for reading through the current transaction.
    ///
    /// # Errors
    ///
    /// - [`TransactionNotActive`](crate::DataError::TransactionNotActive)
    ///   outside a transaction with a joined context
    /// - [`ObjectNotFound`](crate::DataError::ObjectNotFound) if the object
    ///   was removed
    /// - [`TypeMismatch`](crate::DataError::TypeMismatch) if the stored
    ///   object is of a different type
    pub fn get(&self) -> DataResult<Obj<T>> {
        current_context()?.get(self.id)
    }

    /// Resolves the reference for update: takes the write lock up front
    /// and marks the object dirty.
    pub fn get_for_update(&self) -> DataResult<Obj<T>> {
        current_context()?.get_for_update(self.id)
    }
}

impl<T> Clone for Ref<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Ref<T> {}

impl<T> PartialEq for Ref<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Ref<T> {}

impl<T> Hash for Ref<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ref({})", self.id)
    }
}

impl<T> Serialize for Ref<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.id.as_u64())
    }
}

impl<'de, T> Deserialize<'de> for Ref<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = u64::deserialize(deserializer)?;
        let id = ObjectId::new(raw)
            .ok_or_else(|| D::Error::custom("invalid object id: 0"))?;
        Ok(Self {
            id,
            _marker: PhantomData,
        })
    }
}

/// A handle to a resolved managed object.
///
/// Handles are cheap clones of the context-cached instance: every resolve
/// of the same ID within one transaction observes the same underlying
/// cell, so a mutation through one handle is visible through all of them.
///
/// Reading goes through [`read`](Obj::read). Mutating goes through
/// [`write`](Obj::write) and should be preceded by
/// [`mark_for_update`](crate::DataService::mark_for_update) (or a resolve
/// via [`Ref::get_for_update`]); an unmarked mutation is persisted anyway
/// when modification detection is enabled, at the cost of a serialization
/// pass and a diagnostic.
pub struct Obj<T> {
    id: ObjectId,
    cell: Arc<RwLock<T>>,
}

impl<T: ManagedObject> Obj<T> {
    pub(crate) fn from_parts(id: ObjectId, cell: Arc<RwLock<T>>) -> Self {
        Self { id, cell }
    }

    /// The object's stable ID.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id.as_u64()
    }

    pub(crate) fn object_id(&self) -> ObjectId {
        self.id
    }

    /// A reference to this object, suitable for storing in other managed
    /// objects.
    #[must_use]
    pub fn reference(&self) -> Ref<T> {
        Ref::from_id(self.id)
    }

    /// Read access to the object's state.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.cell.read()
    }

    /// Write access to the object's state.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.cell.write()
    }

    /// Whether two handles denote the same in-memory instance.
    #[must_use]
    pub fn same_instance(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    /// Address of the cached cell, for identity checks against the cache.
    pub(crate) fn cell_addr(&self) -> usize {
        Arc::as_ptr(&self.cell) as *const () as usize
    }
}

impl<T> Clone for Obj<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> fmt::Debug for Obj<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Obj({})", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    struct Dummy {
        value: u32,
    }

    fn oid(n: u64) -> ObjectId {
        ObjectId::new(n).unwrap()
    }

    #[test]
    fn refs_equal_by_id() {
        let a: Ref<Dummy> = Ref::from_id(oid(1));
        let b: Ref<Dummy> = Ref::from_id(oid(1));
        let c: Ref<Dummy> = Ref::from_id(oid(2));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn ref_serializes_as_bare_id() {
        let r: Ref<Dummy> = Ref::from_id(oid(9));
        let bytes = bincode::serialize(&r).unwrap();
        assert_eq!(bytes, 9u64.to_le_bytes());

        let back: Ref<Dummy> = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn zero_id_rejected_on_deserialize() {
        let bytes = 0u64.to_le_bytes();
        assert!(bincode::deserialize::<Ref<Dummy>>(&bytes).is_err());
    }

    #[test]
    fn obj_handles_share_the_cell() {
        let obj = Obj::from_parts(oid(1), Arc::new(RwLock::new(Dummy { value: 1 })));
        let other = obj.clone();
        obj.write().value = 5;
        assert_eq!(other.read().value, 5);
        assert!(obj.same_instance(&other));
    }

    #[test]
    fn get_outside_transaction_fails() {
        let r: Ref<Dummy> = Ref::from_id(oid(3));
        assert!(matches!(
            r.get().unwrap_err(),
            crate::DataError::TransactionNotActive
        ));
    }
}
