//! The data service front-end.
//!
//! Exposes the application-facing operation surface plus the
//! service-internal twins that address the `s.` namespace. Every operation
//! validates its arguments, checks the service state, routes to the
//! current transaction's context, and logs.
//!
//! Application bindings and service bindings share one key space in the
//! store, kept disjoint by prefix: `a.` for application names, `s.` for
//! service names. The unprefixed single letters sort before every
//! prefixed name of their namespace, which is what makes `None` a valid
//! enumeration start.

use crate::classes::ClassCatalog;
use crate::config::DataConfig;
use crate::context::Context;
use crate::coordinator::{Coordinator, Participant};
use crate::error::{DataError, DataResult};
use crate::managed::ManagedObject;
use crate::reference::{Obj, Ref};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, trace, warn};
use umbra_store::{ObjectId, ObjectStore};

/// The version this code writes into the store header.
///
/// A `major` mismatch on startup is fatal; a `minor` mismatch is logged
/// and accepted.
pub const SERVICE_VERSION: (u16, u16) = (1, 0);

/// Name under which the service registers its own bindings.
pub(crate) const SERVICE_CLASS_NAME: &str = "umbra.data.DataService";

/// Sentinel object bound on first startup and checked on every startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHeader {
    /// Application this store belongs to.
    pub app_name: String,
    /// Major format version; mismatches are fatal.
    pub major: u16,
    /// Minor format version; mismatches are tolerated.
    pub minor: u16,
}

/// The transactional data service.
///
/// Application tasks run inside [`run`](DataService::run); within a task,
/// the service's operations read and mutate managed objects and name
/// bindings under the transaction the coordinator installed on the
/// calling thread.
pub struct DataService {
    config: DataConfig,
    store: Arc<dyn ObjectStore>,
    catalog: Arc<ClassCatalog>,
    coordinator: Coordinator,
}

impl std::fmt::Debug for DataService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn internal_name(name: &str, service: bool) -> String {
    if service {
        format!("s.{name}")
    } else {
        format!("a.{name}")
    }
}

/// Start key for enumeration: the bare namespace letter sorts before
/// every prefixed name, so `None` starts at the beginning.
fn enumeration_start(name: Option<&str>, service: bool) -> String {
    match name {
        None => if service { "s" } else { "a" }.to_string(),
        Some(name) => internal_name(name, service),
    }
}

/// Strips the namespace prefix, or `None` when enumeration has crossed
/// into the other namespace.
fn external_name(internal: &str, service: bool) -> Option<String> {
    let prefix = if service { "s." } else { "a." };
    internal.strip_prefix(prefix).map(str::to_string)
}

impl DataService {
    /// Creates a data service over `store`.
    ///
    /// Validates the configuration, then runs the header check in its own
    /// transaction: the first startup binds a [`ServiceHeader`]; later
    /// startups verify it.
    ///
    /// # Errors
    ///
    /// [`DataError::InvalidConfig`] for bad configuration,
    /// [`DataError::VersionIncompatible`] if the store was written by a
    /// different major version, or any store error from the header
    /// transaction.
    pub fn new(config: DataConfig, store: Arc<dyn ObjectStore>) -> DataResult<Self> {
        Self::new_with_version(config, store, SERVICE_VERSION)
    }

    /// Creates a data service advertising `version` instead of
    /// [`SERVICE_VERSION`].
    ///
    /// Exposed for compatibility testing.
    #[doc(hidden)]
    pub fn new_with_version(
        config: DataConfig,
        store: Arc<dyn ObjectStore>,
        version: (u16, u16),
    ) -> DataResult<Self> {
        config.validate()?;
        info!(app_name = %config.app_name, "creating data service");
        let coordinator = Coordinator::new(
            Arc::clone(&store),
            config.txn_timeout,
            config.retry_timeout,
            config.max_retries,
            config.shutdown_timeout,
        );
        let service = Self {
            config,
            store,
            catalog: Arc::new(ClassCatalog::new()),
            coordinator,
        };
        service.coordinator.set_running();
        if let Err(err) = service.check_header(version) {
            error!(%err, "data service initialization failed");
            let _ = service.store.shutdown();
            return Err(err);
        }
        Ok(service)
    }

    /// Verifies or creates the store header under its own transaction.
    fn check_header(&self, version: (u16, u16)) -> DataResult<()> {
        let name = format!("{SERVICE_CLASS_NAME}.header");
        let app_name = self.config.app_name.clone();
        self.run(|| {
            match self.get_service_binding::<ServiceHeader>(&name) {
                Ok(header) => {
                    let header = header.read().clone();
                    if header.major != version.0 {
                        return Err(DataError::VersionIncompatible {
                            found: (header.major, header.minor),
                            expected: version,
                        });
                    }
                    if header.minor != version.1 {
                        warn!(
                            found = ?(header.major, header.minor),
                            expected = ?version,
                            "minor version differs; proceeding"
                        );
                    } else {
                        info!(?header, "found existing service header");
                    }
                    Ok(())
                }
                Err(DataError::NameNotBound { .. }) => {
                    let header = self.create(ServiceHeader {
                        app_name: app_name.clone(),
                        major: version.0,
                        minor: version.1,
                    })?;
                    self.set_service_binding(&name, &header)?;
                    info!(app_name = %app_name, ?version, "created service header");
                    Ok(())
                }
                Err(err) => Err(err),
            }
        })
    }

    /// The application this service serves.
    #[must_use]
    pub fn app_name(&self) -> &str {
        &self.config.app_name
    }

    /// Number of transactions that were discarded and retried so far.
    #[must_use]
    pub fn retry_count(&self) -> u64 {
        self.coordinator.retry_count()
    }

    /// Runs `task` under a transaction with retry-on-abort semantics.
    ///
    /// The task may be re-executed after a conflict, deadlock, or timeout,
    /// so it must be idempotent up to its transactional effects. The retry
    /// budget is bounded by wall clock and attempt count; exhaustion
    /// surfaces as [`DataError::TransactionAborted`].
    pub fn run<F, R>(&self, task: F) -> DataResult<R>
    where
        F: FnMut() -> DataResult<R>,
    {
        self.coordinator.run(task)
    }

    /// Registers an external two-phase-commit participant with the
    /// current transaction.
    pub fn join_participant(&self, participant: Arc<dyn Participant>) -> DataResult<()> {
        self.coordinator.join_participant(participant)
    }

    /// The current transaction's context, joining on first use.
    fn context(&self) -> DataResult<Arc<Context>> {
        self.coordinator.join(|txn| {
            Context::new(
                txn,
                Arc::clone(&self.store),
                Arc::clone(&self.catalog),
                self.config.detect_modifications,
                self.config.debug_check_interval,
            )
        })
    }

    // -- Application namespace --

    /// Returns the managed object bound to `name`, checked to be of type
    /// `T`.
    pub fn get_binding<T: ManagedObject>(&self, name: &str) -> DataResult<Obj<T>> {
        self.get_binding_internal(name, false)
    }

    /// Binds `name` to a managed object.
    pub fn set_binding<T: ManagedObject>(&self, name: &str, obj: &Obj<T>) -> DataResult<()> {
        self.set_binding_internal(name, obj, false)
    }

    /// Removes the binding for `name`; the object itself is untouched.
    pub fn remove_binding(&self, name: &str) -> DataResult<()> {
        self.remove_binding_internal(name, false)
    }

    /// Lexicographic successor of `name` among application bindings;
    /// `None` input starts at the beginning, `None` output is the end.
    pub fn next_bound_name(&self, name: Option<&str>) -> DataResult<Option<String>> {
        self.next_bound_name_internal(name, false)
    }

    // -- Service namespace --

    /// [`get_binding`](Self::get_binding) in the service namespace.
    pub fn get_service_binding<T: ManagedObject>(&self, name: &str) -> DataResult<Obj<T>> {
        self.get_binding_internal(name, true)
    }

    /// [`set_binding`](Self::set_binding) in the service namespace.
    pub fn set_service_binding<T: ManagedObject>(
        &self,
        name: &str,
        obj: &Obj<T>,
    ) -> DataResult<()> {
        self.set_binding_internal(name, obj, true)
    }

    /// [`remove_binding`](Self::remove_binding) in the service namespace.
    pub fn remove_service_binding(&self, name: &str) -> DataResult<()> {
        self.remove_binding_internal(name, true)
    }

    /// [`next_bound_name`](Self::next_bound_name) in the service
    /// namespace.
    pub fn next_service_bound_name(&self, name: Option<&str>) -> DataResult<Option<String>> {
        self.next_bound_name_internal(name, true)
    }

    // -- Object operations --

    /// Brings `value` under management: allocates its ID and schedules it
    /// for persistence at commit.
    pub fn create<T: ManagedObject>(&self, value: T) -> DataResult<Obj<T>> {
        let result = self.context().and_then(|context| context.create(value));
        trace_op("create", &result);
        result
    }

    /// A reference to a managed object.
    pub fn create_reference<T: ManagedObject>(&self, obj: &Obj<T>) -> DataResult<Ref<T>> {
        let result = self
            .context()
            .and_then(|context| context.reference_for(obj));
        trace_op("create_reference", &result);
        result
    }

    /// Schedules `obj` for deletion at commit. Subsequent resolves of its
    /// ID in this transaction fail with object-not-found.
    pub fn remove_object<T: ManagedObject>(&self, obj: &Obj<T>) -> DataResult<()> {
        let result = self.context().and_then(|context| context.remove(obj));
        trace_op("remove_object", &result);
        result
    }

    /// Upgrades `obj` to the write lock and marks it dirty, so its state
    /// is persisted at commit without relying on modification detection.
    pub fn mark_for_update<T: ManagedObject>(&self, obj: &Obj<T>) -> DataResult<()> {
        let result = self
            .context()
            .and_then(|context| context.mark_for_update(obj));
        trace_op("mark_for_update", &result);
        result
    }

    /// The stable ID of a managed object.
    pub fn object_id<T: ManagedObject>(&self, obj: &Obj<T>) -> DataResult<u64> {
        let result = self
            .context()
            .and_then(|context| context.object_id_for(obj))
            .map(|id| id.as_u64());
        trace_op("object_id", &result);
        result
    }

    /// Builds a reference from a raw object ID.
    ///
    /// The ID is validated for form only; a dangling ID surfaces as
    /// object-not-found at first resolve.
    pub fn reference_for_id<T: ManagedObject>(&self, id: u64) -> DataResult<Ref<T>> {
        let result = match ObjectId::new(id) {
            None => Err(DataError::InvalidId { id }),
            Some(id) => self
                .context()
                .and_then(|context| context.reference_for_id(id)),
        };
        trace_op("reference_for_id", &result);
        result
    }

    /// Shuts the service down.
    ///
    /// Waits for in-flight transactions to drain, then closes the store.
    /// Returns `Ok(false)` if the drain deadline passed; the service stays
    /// running and `shutdown` may be called again. Calling again after a
    /// successful shutdown fails with
    /// [`DataError::AlreadyShutDown`].
    pub fn shutdown(&self) -> DataResult<bool> {
        info!(app_name = %self.config.app_name, "data service shutdown requested");
        self.coordinator.shutdown()
    }

    // -- Generic binding plumbing --

    fn get_binding_internal<T: ManagedObject>(
        &self,
        name: &str,
        service: bool,
    ) -> DataResult<Obj<T>> {
        let result = (|| {
            let context = self.context()?;
            let id = match context.get_binding(&internal_name(name, service)) {
                // Re-raise with the external name.
                Err(DataError::NameNotBound { .. }) => {
                    return Err(DataError::NameNotBound {
                        name: name.to_string(),
                    })
                }
                other => other?,
            };
            context.get::<T>(id)
        })();
        trace_named_op(
            if service {
                "get_service_binding"
            } else {
                "get_binding"
            },
            name,
            &result,
        );
        result
    }

    fn set_binding_internal<T: ManagedObject>(
        &self,
        name: &str,
        obj: &Obj<T>,
        service: bool,
    ) -> DataResult<()> {
        let result = (|| {
            let context = self.context()?;
            let id = context.object_id_for(obj)?;
            context.set_binding(&internal_name(name, service), id)
        })();
        trace_named_op(
            if service {
                "set_service_binding"
            } else {
                "set_binding"
            },
            name,
            &result,
        );
        result
    }

    fn remove_binding_internal(&self, name: &str, service: bool) -> DataResult<()> {
        let result = (|| {
            let context = self.context()?;
            match context.remove_binding(&internal_name(name, service)) {
                Err(DataError::NameNotBound { .. }) => Err(DataError::NameNotBound {
                    name: name.to_string(),
                }),
                other => other,
            }
        })();
        trace_named_op(
            if service {
                "remove_service_binding"
            } else {
                "remove_binding"
            },
            name,
            &result,
        );
        result
    }

    fn next_bound_name_internal(
        &self,
        name: Option<&str>,
        service: bool,
    ) -> DataResult<Option<String>> {
        let result = (|| {
            let context = self.context()?;
            let next = context.next_bound_name(&enumeration_start(name, service))?;
            // A successor from the other namespace means this namespace is
            // exhausted.
            Ok(next.and_then(|internal| external_name(&internal, service)))
        })();
        trace_named_op(
            if service {
                "next_service_bound_name"
            } else {
                "next_bound_name"
            },
            name.unwrap_or(""),
            &result,
        );
        result
    }
}

fn trace_op<T>(op: &str, result: &DataResult<T>) {
    match result {
        Ok(_) => trace!(target: "umbra_data::service", op, "returns"),
        Err(err) => trace!(target: "umbra_data::service", op, %err, "throws"),
    }
}

fn trace_named_op<T>(op: &str, name: &str, result: &DataResult<T>) {
    match result {
        Ok(_) => trace!(target: "umbra_data::service", op, name, "returns"),
        Err(err) => trace!(target: "umbra_data::service", op, name, %err, "throws"),
    }
}
