//! Per-transaction context: the identity map, dirty tracking, and
//! modification detection.
//!
//! One context exists per joined transaction. It caches every resolved
//! object so repeated resolves observe the same instance, tracks which
//! entries must be written back, and (when modification detection is on)
//! snapshots the payload of clean reads to catch mutations that were never
//! marked for update.

use crate::classes::ClassCatalog;
use crate::coordinator::Participant;
use crate::error::{DataError, DataResult};
use crate::managed::{
    decode_body, descriptor_of, encode_cell_body, encode_payload, split_payload, EncodeBodyFn,
    ManagedObject,
};
use crate::reference::{Obj, Ref};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, trace};
use umbra_store::{ClassId, ObjectId, ObjectStore, TxnId, Vote};

/// Write-back state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryFlag {
    /// Resolved for read; not scheduled for write-back.
    Clean,
    /// Scheduled for write-back at prepare.
    Dirty,
    /// Created in this transaction; written at prepare under a fresh ID.
    New,
    /// Removal scheduled; resolves fail with object-not-found.
    Removed,
    /// Created and removed in the same transaction; nothing reaches the
    /// store.
    RemovedNew,
}

struct CacheEntry {
    /// The shared instance: an `Arc<RwLock<T>>` behind `dyn Any`.
    cell: Arc<dyn Any + Send + Sync>,
    descriptor: &'static str,
    /// Known for loaded entries; assigned at prepare for created ones.
    class_id: Option<ClassId>,
    flag: EntryFlag,
    /// Stored payload at first clean resolve, for modification detection.
    snapshot: Option<Vec<u8>>,
    encode_body: EncodeBodyFn,
}

struct ContextState {
    cache: HashMap<ObjectId, CacheEntry>,
    /// Class IDs handed out by the store in this transaction; published to
    /// the shared catalog iff the transaction commits.
    assigned_classes: Vec<(String, ClassId)>,
    op_count: u32,
    ended: bool,
}

/// Per-transaction state of the data service.
pub struct Context {
    txn: TxnId,
    store: Arc<dyn ObjectStore>,
    catalog: Arc<ClassCatalog>,
    detect_modifications: bool,
    debug_check_interval: u32,
    state: Mutex<ContextState>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("txn", &self.txn)
            .field("detect_modifications", &self.detect_modifications)
            .field("debug_check_interval", &self.debug_check_interval)
            .finish_non_exhaustive()
    }
}

impl Context {
    pub(crate) fn new(
        txn: TxnId,
        store: Arc<dyn ObjectStore>,
        catalog: Arc<ClassCatalog>,
        detect_modifications: bool,
        debug_check_interval: u32,
    ) -> Self {
        Self {
            txn,
            store,
            catalog,
            detect_modifications,
            debug_check_interval,
            state: Mutex::new(ContextState {
                cache: HashMap::new(),
                assigned_classes: Vec::new(),
                op_count: 0,
                ended: false,
            }),
        }
    }

    /// Counts an operation and periodically checks cache consistency.
    fn tick(&self, state: &mut ContextState) -> DataResult<()> {
        if state.ended {
            return Err(DataError::TransactionNotActive);
        }
        state.op_count = state.op_count.wrapping_add(1);
        if self.debug_check_interval != 0
            && self.debug_check_interval != u32::MAX
            && state.op_count % self.debug_check_interval == 0
        {
            Self::check_cache(state)?;
        }
        Ok(())
    }

    /// Asserts cache consistency: no instance may be cached under two IDs.
    fn check_cache(state: &ContextState) -> DataResult<()> {
        let mut seen = HashSet::with_capacity(state.cache.len());
        for (id, entry) in &state.cache {
            let addr = Arc::as_ptr(&entry.cell) as *const () as usize;
            if !seen.insert(addr) {
                error!(%id, "reference cache check failed: instance cached twice");
                return Err(DataError::internal(
                    "reference cache inconsistency: instance cached under two ids",
                ));
            }
        }
        trace!(entries = state.cache.len(), "reference cache check passed");
        Ok(())
    }

    fn obj_from_entry<T: ManagedObject>(id: ObjectId, entry: &CacheEntry) -> DataResult<Obj<T>> {
        let cell = Arc::clone(&entry.cell)
            .downcast::<RwLock<T>>()
            .map_err(|_| DataError::TypeMismatch {
                expected: descriptor_of::<T>(),
                found: entry.descriptor.to_string(),
            })?;
        Ok(Obj::from_parts(id, cell))
    }

    /// Resolve-for-read.
    pub(crate) fn get<T: ManagedObject>(&self, id: ObjectId) -> DataResult<Obj<T>> {
        {
            let mut state = self.state.lock();
            self.tick(&mut state)?;
            if let Some(entry) = state.cache.get(&id) {
                return match entry.flag {
                    EntryFlag::Removed | EntryFlag::RemovedNew => {
                        Err(DataError::ObjectNotFound { id })
                    }
                    _ => Self::obj_from_entry(id, entry),
                };
            }
        }
        self.load(id, false)
    }

    /// Resolve-for-update: write lock up front, entry marked dirty.
    pub(crate) fn get_for_update<T: ManagedObject>(&self, id: ObjectId) -> DataResult<Obj<T>> {
        {
            let mut state = self.state.lock();
            self.tick(&mut state)?;
            if let Some(entry) = state.cache.get(&id) {
                match entry.flag {
                    EntryFlag::Removed | EntryFlag::RemovedNew => {
                        return Err(DataError::ObjectNotFound { id });
                    }
                    EntryFlag::Dirty | EntryFlag::New => {
                        return Self::obj_from_entry(id, entry);
                    }
                    EntryFlag::Clean => {} // fall through to upgrade
                }
            } else {
                drop(state);
                return self.load(id, true);
            }
        }
        // Upgrade the store lock without holding the context state across
        // the (possibly blocking) acquisition.
        self.store.get_object(self.txn, id, true)?;
        let mut state = self.state.lock();
        let entry = state
            .cache
            .get_mut(&id)
            .ok_or_else(|| DataError::internal("cache entry vanished during lock upgrade"))?;
        if entry.flag == EntryFlag::Clean {
            entry.flag = EntryFlag::Dirty;
        }
        Self::obj_from_entry(id, entry)
    }

    /// Fetches, decodes, and caches an uncached object.
    fn load<T: ManagedObject>(&self, id: ObjectId, for_update: bool) -> DataResult<Obj<T>> {
        let payload = self.store.get_object(self.txn, id, for_update)?;
        let (class, body) = split_payload(&payload)?;
        let stored = self
            .catalog
            .descriptor(self.store.as_ref(), self.txn, class)?;
        if stored != descriptor_of::<T>() {
            return Err(DataError::TypeMismatch {
                expected: descriptor_of::<T>(),
                found: stored,
            });
        }
        let value: T = decode_body(body)?;
        let cell = Arc::new(RwLock::new(value));

        let mut state = self.state.lock();
        let snapshot = (self.detect_modifications && !for_update).then(|| payload.clone());
        let entry = state.cache.entry(id).or_insert_with(|| CacheEntry {
            cell: cell.clone(),
            descriptor: descriptor_of::<T>(),
            class_id: Some(class),
            flag: if for_update {
                EntryFlag::Dirty
            } else {
                EntryFlag::Clean
            },
            snapshot,
            encode_body: encode_cell_body::<T>,
        });
        Self::obj_from_entry(id, entry)
    }

    /// Creates a managed object: allocates its ID and caches it new+dirty.
    pub(crate) fn create<T: ManagedObject>(&self, value: T) -> DataResult<Obj<T>> {
        {
            let mut state = self.state.lock();
            self.tick(&mut state)?;
        }
        let id = self.store.allocate_id(self.txn)?;
        let cell = Arc::new(RwLock::new(value));
        let mut state = self.state.lock();
        state.cache.insert(
            id,
            CacheEntry {
                cell: cell.clone(),
                descriptor: descriptor_of::<T>(),
                class_id: None,
                flag: EntryFlag::New,
                snapshot: None,
                encode_body: encode_cell_body::<T>,
            },
        );
        trace!(txn = %self.txn, %id, "created managed object");
        Ok(Obj::from_parts(id, cell))
    }

    /// Verifies `obj` is the instance cached under its ID in this context.
    fn check_identity<T: ManagedObject>(
        state: &ContextState,
        obj: &Obj<T>,
    ) -> DataResult<EntryFlag> {
        let entry = state
            .cache
            .get(&obj.object_id())
            .ok_or(DataError::ObjectNotManaged)?;
        let addr = Arc::as_ptr(&entry.cell) as *const () as usize;
        if addr != obj.cell_addr() {
            return Err(DataError::ObjectNotManaged);
        }
        Ok(entry.flag)
    }

    /// Mark-for-update: upgrade to the write lock and flip to dirty.
    pub(crate) fn mark_for_update<T: ManagedObject>(&self, obj: &Obj<T>) -> DataResult<()> {
        let id = obj.object_id();
        {
            let mut state = self.state.lock();
            self.tick(&mut state)?;
            match Self::check_identity(&state, obj)? {
                EntryFlag::Removed | EntryFlag::RemovedNew => {
                    return Err(DataError::ObjectNotFound { id });
                }
                EntryFlag::Dirty | EntryFlag::New => return Ok(()),
                EntryFlag::Clean => {}
            }
        }
        self.store.get_object(self.txn, id, true)?;
        let mut state = self.state.lock();
        let entry = state
            .cache
            .get_mut(&id)
            .ok_or_else(|| DataError::internal("cache entry vanished during lock upgrade"))?;
        if entry.flag == EntryFlag::Clean {
            entry.flag = EntryFlag::Dirty;
        }
        Ok(())
    }

    /// Schedules removal; later resolves of the ID fail object-not-found.
    pub(crate) fn remove<T: ManagedObject>(&self, obj: &Obj<T>) -> DataResult<()> {
        let id = obj.object_id();
        let mut state = self.state.lock();
        self.tick(&mut state)?;
        let flag = Self::check_identity(&state, obj)?;
        let entry = state
            .cache
            .get_mut(&id)
            .ok_or(DataError::ObjectNotManaged)?;
        match flag {
            EntryFlag::Removed | EntryFlag::RemovedNew => Err(DataError::ObjectNotFound { id }),
            EntryFlag::New => {
                entry.flag = EntryFlag::RemovedNew;
                Ok(())
            }
            EntryFlag::Clean | EntryFlag::Dirty => {
                entry.flag = EntryFlag::Removed;
                Ok(())
            }
        }
    }

    /// A reference for a managed handle, identity-checked.
    pub(crate) fn reference_for<T: ManagedObject>(&self, obj: &Obj<T>) -> DataResult<Ref<T>> {
        let mut state = self.state.lock();
        self.tick(&mut state)?;
        Self::check_identity(&state, obj)?;
        Ok(Ref::from_id(obj.object_id()))
    }

    /// The stable ID of a managed handle, identity-checked.
    pub(crate) fn object_id_for<T: ManagedObject>(&self, obj: &Obj<T>) -> DataResult<ObjectId> {
        let mut state = self.state.lock();
        self.tick(&mut state)?;
        Self::check_identity(&state, obj)?;
        Ok(obj.object_id())
    }

    /// Builds a reference from a raw ID without touching the store.
    pub(crate) fn reference_for_id<T: ManagedObject>(&self, id: ObjectId) -> DataResult<Ref<T>> {
        let mut state = self.state.lock();
        self.tick(&mut state)?;
        Ok(Ref::from_id(id))
    }

    // Binding operations delegate straight to the store, which stages them
    // with read-your-writes semantics under its own locks.

    pub(crate) fn get_binding(&self, name: &str) -> DataResult<ObjectId> {
        {
            let mut state = self.state.lock();
            self.tick(&mut state)?;
        }
        Ok(self.store.get_binding(self.txn, name)?)
    }

    pub(crate) fn set_binding(&self, name: &str, id: ObjectId) -> DataResult<()> {
        {
            let mut state = self.state.lock();
            self.tick(&mut state)?;
        }
        Ok(self.store.set_binding(self.txn, name, id)?)
    }

    pub(crate) fn remove_binding(&self, name: &str) -> DataResult<()> {
        {
            let mut state = self.state.lock();
            self.tick(&mut state)?;
        }
        Ok(self.store.remove_binding(self.txn, name)?)
    }

    pub(crate) fn next_bound_name(&self, name: &str) -> DataResult<Option<String>> {
        {
            let mut state = self.state.lock();
            self.tick(&mut state)?;
        }
        Ok(self.store.next_bound_name(self.txn, name)?)
    }

    /// First phase of commit for this context.
    ///
    /// Serializes every non-clean entry, re-checks clean entries against
    /// their snapshots when modification detection is on, pushes
    /// puts/removes to the store, and runs the store's own prepare. A
    /// read-only vote closes the store transaction immediately; the
    /// commit call is skipped for read-only participants.
    fn prepare_impl(&self) -> DataResult<Vote> {
        let mut state = self.state.lock();
        if state.ended {
            return Err(DataError::TransactionNotActive);
        }

        let ContextState {
            cache,
            assigned_classes,
            ..
        } = &mut *state;

        for (id, entry) in cache.iter_mut() {
            match entry.flag {
                EntryFlag::RemovedNew => {}
                EntryFlag::Removed => {
                    self.store.remove_object(self.txn, *id)?;
                }
                EntryFlag::Clean => {
                    if !self.detect_modifications {
                        continue;
                    }
                    let class = entry.class_id.ok_or_else(|| {
                        DataError::internal("clean cache entry without a class id")
                    })?;
                    let body = (entry.encode_body)(entry.cell.as_ref())?;
                    let payload = encode_payload(class, &body);
                    if entry.snapshot.as_deref() != Some(payload.as_slice()) {
                        trace!(
                            target: "umbra_data::detect",
                            txn = %self.txn,
                            %id,
                            "object modified without mark_for_update"
                        );
                        self.store.put_object(self.txn, *id, payload)?;
                    }
                }
                EntryFlag::Dirty | EntryFlag::New => {
                    let body = (entry.encode_body)(entry.cell.as_ref())?;
                    let class = match entry.class_id {
                        Some(class) => class,
                        None => {
                            let (class, fresh) = self.catalog.class_id(
                                self.store.as_ref(),
                                self.txn,
                                entry.descriptor,
                            )?;
                            if fresh {
                                assigned_classes.push((entry.descriptor.to_string(), class));
                            }
                            entry.class_id = Some(class);
                            class
                        }
                    };
                    self.store
                        .put_object(self.txn, *id, encode_payload(class, &body))?;
                }
            }
        }

        let vote = self.store.prepare(self.txn)?;
        if vote == Vote::ReadOnly {
            // Nothing to decide later; close the store transaction now.
            self.store.commit(self.txn)?;
            state.ended = true;
            state.cache.clear();
        }
        debug!(txn = %self.txn, ?vote, "context prepared");
        Ok(vote)
    }

    fn commit_impl(&self) -> DataResult<()> {
        let mut state = self.state.lock();
        if state.ended {
            return Err(DataError::TransactionNotActive);
        }
        self.store.commit(self.txn)?;
        self.catalog.confirm(&state.assigned_classes);
        state.ended = true;
        state.cache.clear();
        debug!(txn = %self.txn, "context committed");
        Ok(())
    }

    fn abort_impl(&self) {
        let mut state = self.state.lock();
        if state.ended {
            return;
        }
        if let Err(err) = self.store.abort(self.txn) {
            debug!(txn = %self.txn, %err, "store abort reported an error");
        }
        state.ended = true;
        state.cache.clear();
        debug!(txn = %self.txn, "context aborted");
    }
}

impl Participant for Context {
    fn name(&self) -> &str {
        crate::service::SERVICE_CLASS_NAME
    }

    fn prepare(&self) -> DataResult<Vote> {
        self.prepare_impl()
    }

    fn commit(&self) -> DataResult<()> {
        self.commit_impl()
    }

    fn abort(&self) {
        self.abort_impl();
    }
}
