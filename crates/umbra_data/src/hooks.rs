//! Argument-rewriting decorator for the data service.
//!
//! Some hosts substitute managed objects on their way into the service,
//! wrapping or interning them. The decorator
//! applies a [`ReplacementHook`] to the object argument of exactly the
//! operations that accept one, and delegates everything else untouched.

use crate::error::DataResult;
use crate::managed::ManagedObject;
use crate::reference::{Obj, Ref};
use crate::service::DataService;
use std::sync::Arc;

/// Rewrites managed-object arguments before they reach the service.
pub trait ReplacementHook: Send + Sync {
    /// Returns the handle to use in place of `obj`.
    fn replace<T: ManagedObject>(&self, obj: Obj<T>) -> Obj<T>;
}

/// A hook that replaces nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityHook;

impl ReplacementHook for IdentityHook {
    fn replace<T: ManagedObject>(&self, obj: Obj<T>) -> Obj<T> {
        obj
    }
}

/// A [`DataService`] wrapper that routes every object argument through a
/// [`ReplacementHook`].
///
/// The hooked operations are the ones that take a managed object:
/// `set_binding` (both namespaces), `remove_object`, `mark_for_update`,
/// `create_reference`, and `object_id`. Operations without an object
/// argument pass straight through.
pub struct HookedDataService<H: ReplacementHook> {
    inner: Arc<DataService>,
    hook: H,
}

impl<H: ReplacementHook> HookedDataService<H> {
    /// Wraps `inner` with `hook`.
    pub fn new(inner: Arc<DataService>, hook: H) -> Self {
        Self { inner, hook }
    }

    /// The undecorated service.
    #[must_use]
    pub fn inner(&self) -> &Arc<DataService> {
        &self.inner
    }

    // -- Hooked operations --

    /// See [`DataService::set_binding`].
    pub fn set_binding<T: ManagedObject>(&self, name: &str, obj: &Obj<T>) -> DataResult<()> {
        let obj = self.hook.replace(obj.clone());
        self.inner.set_binding(name, &obj)
    }

    /// See [`DataService::set_service_binding`].
    pub fn set_service_binding<T: ManagedObject>(
        &self,
        name: &str,
        obj: &Obj<T>,
    ) -> DataResult<()> {
        let obj = self.hook.replace(obj.clone());
        self.inner.set_service_binding(name, &obj)
    }

    /// See [`DataService::remove_object`].
    pub fn remove_object<T: ManagedObject>(&self, obj: &Obj<T>) -> DataResult<()> {
        let obj = self.hook.replace(obj.clone());
        self.inner.remove_object(&obj)
    }

    /// See [`DataService::mark_for_update`].
    pub fn mark_for_update<T: ManagedObject>(&self, obj: &Obj<T>) -> DataResult<()> {
        let obj = self.hook.replace(obj.clone());
        self.inner.mark_for_update(&obj)
    }

    /// See [`DataService::create_reference`].
    pub fn create_reference<T: ManagedObject>(&self, obj: &Obj<T>) -> DataResult<Ref<T>> {
        let obj = self.hook.replace(obj.clone());
        self.inner.create_reference(&obj)
    }

    /// See [`DataService::object_id`].
    pub fn object_id<T: ManagedObject>(&self, obj: &Obj<T>) -> DataResult<u64> {
        let obj = self.hook.replace(obj.clone());
        self.inner.object_id(&obj)
    }

    // -- Pass-through operations --

    /// See [`DataService::run`].
    pub fn run<F, R>(&self, task: F) -> DataResult<R>
    where
        F: FnMut() -> DataResult<R>,
    {
        self.inner.run(task)
    }

    /// See [`DataService::get_binding`].
    pub fn get_binding<T: ManagedObject>(&self, name: &str) -> DataResult<Obj<T>> {
        self.inner.get_binding(name)
    }

    /// See [`DataService::get_service_binding`].
    pub fn get_service_binding<T: ManagedObject>(&self, name: &str) -> DataResult<Obj<T>> {
        self.inner.get_service_binding(name)
    }

    /// See [`DataService::remove_binding`].
    pub fn remove_binding(&self, name: &str) -> DataResult<()> {
        self.inner.remove_binding(name)
    }

    /// See [`DataService::remove_service_binding`].
    pub fn remove_service_binding(&self, name: &str) -> DataResult<()> {
        self.inner.remove_service_binding(name)
    }

    /// See [`DataService::next_bound_name`].
    pub fn next_bound_name(&self, name: Option<&str>) -> DataResult<Option<String>> {
        self.inner.next_bound_name(name)
    }

    /// See [`DataService::next_service_bound_name`].
    pub fn next_service_bound_name(&self, name: Option<&str>) -> DataResult<Option<String>> {
        self.inner.next_service_bound_name(name)
    }

    /// See [`DataService::create`].
    pub fn create<T: ManagedObject>(&self, value: T) -> DataResult<Obj<T>> {
        self.inner.create(value)
    }

    /// See [`DataService::reference_for_id`].
    pub fn reference_for_id<T: ManagedObject>(&self, id: u64) -> DataResult<Ref<T>> {
        self.inner.reference_for_id(id)
    }

    /// See [`DataService::shutdown`].
    pub fn shutdown(&self) -> DataResult<bool> {
        self.inner.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataConfig;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use umbra_store::{DataStore, StoreConfig};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        text: String,
    }

    /// Records the IDs of every object argument it is shown.
    struct RecordingHook {
        seen: Mutex<Vec<u64>>,
    }

    impl ReplacementHook for RecordingHook {
        fn replace<T: ManagedObject>(&self, obj: Obj<T>) -> Obj<T> {
            self.seen.lock().push(obj.id());
            obj
        }
    }

    fn service() -> Arc<DataService> {
        let store = DataStore::open_in_memory(StoreConfig::default()).unwrap();
        Arc::new(DataService::new(DataConfig::new("hook-test"), store).unwrap())
    }

    #[test]
    fn hook_sees_object_arguments() {
        let hooked = HookedDataService::new(
            service(),
            RecordingHook {
                seen: Mutex::new(Vec::new()),
            },
        );

        hooked
            .run(|| {
                let note = hooked.create(Note {
                    text: "hi".to_string(),
                })?;
                hooked.set_binding("note", &note)?;
                hooked.mark_for_update(&note)?;
                let _ = hooked.create_reference(&note)?;
                let _ = hooked.object_id(&note)?;
                hooked.remove_object(&note)?;
                Ok(note.id())
            })
            .map(|id| {
                let seen = hooked.hook.seen.lock();
                assert_eq!(seen.len(), 5);
                assert!(seen.iter().all(|s| *s == id));
            })
            .unwrap();
    }

    #[test]
    fn pass_through_operations_skip_the_hook() {
        let hooked = HookedDataService::new(
            service(),
            RecordingHook {
                seen: Mutex::new(Vec::new()),
            },
        );

        hooked
            .run(|| {
                let note = hooked.inner().create(Note {
                    text: "hi".to_string(),
                })?;
                hooked.inner().set_binding("note", &note)?;
                let _ = hooked.get_binding::<Note>("note")?;
                let _ = hooked.next_bound_name(None)?;
                Ok(())
            })
            .unwrap();
        assert!(hooked.hook.seen.lock().is_empty());
    }

    #[test]
    fn identity_hook_is_transparent() {
        let hooked = HookedDataService::new(service(), IdentityHook);
        hooked
            .run(|| {
                let note = hooked.create(Note {
                    text: "hello".to_string(),
                })?;
                hooked.set_binding("note", &note)?;
                Ok(())
            })
            .unwrap();
        hooked
            .run(|| {
                let note = hooked.get_binding::<Note>("note")?;
                assert_eq!(note.read().text, "hello");
                Ok(())
            })
            .unwrap();
    }
}
