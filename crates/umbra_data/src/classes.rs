//! Shared cache over the store's durable class table.
//!
//! The store assigns a small integer to each distinct class descriptor the
//! first time it is written; payloads embed that integer. The catalog
//! caches committed assignments so steady-state encoding and decoding
//! never touch the store's class table.
//!
//! Cache updates are transactional: a freshly assigned ID is only cached
//! once the assigning transaction commits ([`confirm`](ClassCatalog::confirm)).
//! Until then, lookups fall back to the store, which sees the
//! transaction's own staged assignment.

use crate::error::{DataError, DataResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use umbra_store::{ClassId, ObjectStore, TxnId};

#[derive(Default)]
struct CatalogCache {
    by_descriptor: HashMap<String, ClassId>,
    by_id: HashMap<ClassId, String>,
}

/// Process-wide descriptor ↔ class-ID cache.
pub(crate) struct ClassCatalog {
    cache: RwLock<CatalogCache>,
}

impl ClassCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self {
            cache: RwLock::new(CatalogCache::default()),
        }
    }

    /// Returns the class ID for `descriptor`, assigning one through the
    /// store on first encounter.
    ///
    /// The second component is `true` when the ID came from the store and
    /// should be [`confirm`](Self::confirm)ed after the transaction
    /// commits.
    pub fn class_id(
        &self,
        store: &dyn ObjectStore,
        txn: TxnId,
        descriptor: &str,
    ) -> DataResult<(ClassId, bool)> {
        if let Some(class) = self.cache.read().by_descriptor.get(descriptor) {
            return Ok((*class, false));
        }
        let class = store.get_class_id(txn, descriptor.as_bytes())?;
        Ok((class, true))
    }

    /// Returns the descriptor for `class`.
    ///
    /// Unknown IDs are a [`DataError::SerializationFormat`] error: a
    /// payload referenced a class the table never assigned.
    pub fn descriptor(
        &self,
        store: &dyn ObjectStore,
        txn: TxnId,
        class: ClassId,
    ) -> DataResult<String> {
        if let Some(descriptor) = self.cache.read().by_id.get(&class) {
            return Ok(descriptor.clone());
        }
        let bytes = store.get_class_descriptor(txn, class)?;
        String::from_utf8(bytes)
            .map_err(|_| DataError::serialization("class descriptor is not valid UTF-8"))
    }

    /// Publishes committed assignments to the shared cache.
    pub fn confirm(&self, assignments: &[(String, ClassId)]) {
        if assignments.is_empty() {
            return;
        }
        let mut cache = self.cache.write();
        for (descriptor, class) in assignments {
            cache
                .by_descriptor
                .insert(descriptor.clone(), *class);
            cache.by_id.insert(*class, descriptor.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use umbra_store::{DataStore, StoreConfig};

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(10)
    }

    #[test]
    fn assignment_roundtrip_through_store() {
        let store = DataStore::open_in_memory(StoreConfig::default()).unwrap();
        let catalog = ClassCatalog::new();

        let txn = store.begin(far()).unwrap();
        let (class, fresh) = catalog
            .class_id(store.as_ref(), txn, "demo::Player")
            .unwrap();
        assert!(fresh);
        assert_eq!(
            catalog.descriptor(store.as_ref(), txn, class).unwrap(),
            "demo::Player"
        );
        store.prepare(txn).unwrap();
        store.commit(txn).unwrap();

        catalog.confirm(&[("demo::Player".to_string(), class)]);

        // Cached now; no store transaction involved in the lookup.
        let txn = store.begin(far()).unwrap();
        let (cached, fresh) = catalog
            .class_id(store.as_ref(), txn, "demo::Player")
            .unwrap();
        assert_eq!(cached, class);
        assert!(!fresh);
        store.abort(txn).unwrap();
    }

    #[test]
    fn unknown_class_is_strict() {
        let store = DataStore::open_in_memory(StoreConfig::default()).unwrap();
        let catalog = ClassCatalog::new();
        let txn = store.begin(far()).unwrap();
        let err = catalog
            .descriptor(store.as_ref(), txn, ClassId::new(42))
            .unwrap_err();
        assert!(matches!(err, DataError::SerializationFormat { .. }));
        store.abort(txn).unwrap();
    }

    #[test]
    fn unconfirmed_assignment_not_cached() {
        let store = DataStore::open_in_memory(StoreConfig::default()).unwrap();
        let catalog = ClassCatalog::new();

        let txn = store.begin(far()).unwrap();
        let (class, fresh) = catalog.class_id(store.as_ref(), txn, "demo::A").unwrap();
        assert!(fresh);
        store.abort(txn).unwrap();

        // The assigning transaction aborted and nothing was confirmed: a
        // later transaction is handed the same ID from the store again.
        let txn = store.begin(far()).unwrap();
        let (again, fresh) = catalog.class_id(store.as_ref(), txn, "demo::B").unwrap();
        assert!(fresh);
        assert_eq!(class, again);
        store.abort(txn).unwrap();
    }
}
