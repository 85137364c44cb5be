//! Connection lifecycle and schema-version management.
//!
//! One `ConnectionManager` is the single point of truth for a store's
//! physical connection: it owns the state machine
//! `Closed → Opening → {Open | Upgrading → Open} → Closed`, the open
//! refcount, and the pending-open waiters. At most one engine-level
//! open-and-possibly-upgrade sequence is in flight at a time; callers
//! arriving mid-sequence either block (`acquire`) or queue as one-shot
//! waiters on the internal event bus (`open`).
//!
//! A blocked open (another consumer holds an older version of the
//! database) is logged as a warning and waits indefinitely: there is no
//! timeout and no forced abort.

use crate::config::{Callbacks, Options};
use crate::error::{DbError, DbResult};
use crate::events::{EventBus, Trigger};
use crate::schema::{IndexSpec, SchemaReconciler, StoreSchema};
use clientdb_engine::{BlockedEvent, Engine, EngineResult, Handle, SchemaScope};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Observable connection phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseKind {
    /// No physical handle is open.
    Closed,
    /// An engine-level open sequence is in flight.
    Opening,
    /// A handle is open and usable.
    Open,
    /// An explicit version bump is reopening the database.
    Upgrading,
}

enum Phase {
    Closed,
    Opening,
    Open { handle: Arc<dyn Handle> },
    Upgrading,
}

impl Phase {
    fn kind(&self) -> PhaseKind {
        match self {
            Phase::Closed => PhaseKind::Closed,
            Phase::Opening => PhaseKind::Opening,
            Phase::Open { .. } => PhaseKind::Open,
            Phase::Upgrading => PhaseKind::Upgrading,
        }
    }
}

struct ConnState {
    phase: Phase,
    /// Last known on-disk version; 0 before the first open.
    version: u32,
    /// Outstanding logical consumers.
    refs: usize,
    destroyed: bool,
}

struct ConnInner {
    engine: Arc<dyn Engine>,
    name: String,
    declared_version: u32,
    allow_schema_update: bool,
    schema: RwLock<Vec<StoreSchema>>,
    state: Mutex<ConnState>,
    cond: Condvar,
    bus: EventBus<u32>,
    callbacks: Callbacks,
}

/// Owns the single logical connection to a named database.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ConnInner>,
}

/// A refcounted checkout of the open connection.
///
/// Dropping the guard (or calling [`ConnectionRef::release`]) decrements
/// the open refcount; the physical handle closes when the count reaches
/// zero.
pub struct ConnectionRef {
    manager: ConnectionManager,
    handle: Arc<dyn Handle>,
    released: bool,
}

impl ConnectionRef {
    /// The engine handle backing this checkout.
    #[must_use]
    pub fn handle(&self) -> &dyn Handle {
        self.handle.as_ref()
    }

    /// On-disk version of the handle.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.handle.version()
    }

    /// Releases the checkout explicitly.
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.manager.release();
        }
    }
}

impl Drop for ConnectionRef {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl ConnectionManager {
    /// Creates a manager for the database named in `options`.
    ///
    /// No engine-level open happens until the first consumer arrives.
    #[must_use]
    pub fn new(engine: Arc<dyn Engine>, options: &Options, callbacks: Callbacks) -> Self {
        Self {
            inner: Arc::new(ConnInner {
                engine,
                name: options.name.clone(),
                declared_version: options.version,
                allow_schema_update: options.allow_schema_update,
                schema: RwLock::new(options.stores.clone()),
                state: Mutex::new(ConnState {
                    phase: Phase::Closed,
                    version: 0,
                    refs: 0,
                    destroyed: false,
                }),
                cond: Condvar::new(),
                bus: EventBus::new(),
                callbacks,
            }),
        }
    }

    /// Database name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Last known on-disk version (0 before the first open).
    #[must_use]
    pub fn version(&self) -> u32 {
        self.inner.state.lock().version
    }

    /// Current phase of the state machine.
    #[must_use]
    pub fn phase(&self) -> PhaseKind {
        self.inner.state.lock().phase.kind()
    }

    /// Number of outstanding checkouts.
    #[must_use]
    pub fn open_ref_count(&self) -> usize {
        self.inner.state.lock().refs
    }

    /// Whether a physical handle is currently open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.phase() == PhaseKind::Open
    }

    /// Declared collection layouts.
    #[must_use]
    pub fn declared_schema(&self) -> Vec<StoreSchema> {
        self.inner.schema.read().clone()
    }

    /// Checks out the connection, opening the database first if needed.
    ///
    /// Blocks while another consumer's open or upgrade is in flight.
    pub fn acquire(&self) -> DbResult<ConnectionRef> {
        let mut state = self.inner.state.lock();
        loop {
            if state.destroyed {
                return Err(DbError::closed("store has been destroyed"));
            }
            match &state.phase {
                Phase::Open { handle } => {
                    let handle = Arc::clone(handle);
                    state.refs += 1;
                    return Ok(ConnectionRef {
                        manager: self.clone(),
                        handle,
                        released: false,
                    });
                }
                Phase::Opening | Phase::Upgrading => self.inner.cond.wait(&mut state),
                Phase::Closed => return self.open_locked(state),
            }
        }
    }

    /// Hands the connection to `consumer` once it is open.
    ///
    /// If the connection is already open, `consumer` runs immediately.
    /// Otherwise it is queued as a one-shot waiter on the `"open"` event,
    /// and the engine-level open sequence starts only when no open or
    /// upgrade is already in flight. Every waiter fires exactly once per
    /// successful open; waiters queued when an open fails stay pending
    /// until the next successful one.
    pub fn open<F>(&self, consumer: F)
    where
        F: FnOnce(ConnectionRef) + Send + 'static,
    {
        let state = self.inner.state.lock();
        if state.destroyed {
            tracing::warn!(database = %self.inner.name, "open requested on a destroyed store");
            return;
        }
        match &state.phase {
            Phase::Open { handle } => {
                let handle = Arc::clone(handle);
                let mut state = state;
                state.refs += 1;
                drop(state);
                consumer(ConnectionRef {
                    manager: self.clone(),
                    handle,
                    released: false,
                });
            }
            Phase::Opening | Phase::Upgrading => {
                // Enqueued under the state lock so the in-flight opener
                // cannot fire "open" before this waiter is registered.
                self.enqueue_waiter(consumer);
                drop(state);
            }
            Phase::Closed => {
                self.enqueue_waiter(consumer);
                match self.open_locked(state) {
                    Ok(bootstrap) => drop(bootstrap),
                    Err(error) => {
                        tracing::debug!(database = %self.inner.name, %error, "open failed; waiters stay pending");
                    }
                }
            }
        }
    }

    /// Explicit schema evolution: declares (or re-declares) a collection
    /// and reopens at version+1 with full reconciliation.
    pub fn create_store(&self, schema: StoreSchema) -> DbResult<u32> {
        self.ensure_schema_updates_allowed(&schema.name)?;
        {
            let mut declared = self.inner.schema.write();
            declared.retain(|existing| existing.name != schema.name);
            declared.push(schema);
        }
        let declared = self.declared_schema();
        self.bump_version(move |scope| {
            SchemaReconciler::new(&declared).reconcile(scope).map(|_| ())
        })
    }

    /// Explicit schema evolution: undeclares a collection and reopens at
    /// version+1; reconciliation deletes it from disk.
    pub fn remove_store(&self, name: &str) -> DbResult<u32> {
        self.ensure_schema_updates_allowed(name)?;
        {
            let mut declared = self.inner.schema.write();
            let before = declared.len();
            declared.retain(|existing| existing.name != name);
            if declared.len() == before {
                return Err(DbError::schema_conflict(name, "collection is not declared"));
            }
        }
        let declared = self.declared_schema();
        self.bump_version(move |scope| {
            SchemaReconciler::new(&declared).reconcile(scope).map(|_| ())
        })
    }

    /// Explicit schema evolution: replaces a collection's index set and
    /// reopens at version+1 with index-level reconciliation. On-disk
    /// indexes absent from `keys` are deleted, missing ones created.
    pub fn update_keys(&self, name: &str, keys: BTreeMap<String, IndexSpec>) -> DbResult<u32> {
        self.ensure_schema_updates_allowed(name)?;
        {
            let mut declared = self.inner.schema.write();
            match declared.iter_mut().find(|store| store.name == name) {
                Some(store) => store.keys = keys.clone(),
                None => return Err(DbError::schema_conflict(name, "collection is not declared")),
            }
        }
        let store = name.to_string();
        self.bump_version(move |scope| {
            SchemaReconciler::reconcile_indexes(scope, &store, &keys).map(|_| ())
        })
    }

    /// Deletes the database. Terminal: every subsequent operation fails
    /// with [`DbError::Closed`].
    pub fn destroy(&self) -> DbResult<()> {
        let handle = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return Ok(());
            }
            state.destroyed = true;
            let phase = std::mem::replace(&mut state.phase, Phase::Closed);
            self.inner.cond.notify_all();
            match phase {
                Phase::Open { handle } => Some(handle),
                _ => None,
            }
        };
        if let Some(handle) = handle {
            handle.close();
        }
        self.inner
            .engine
            .delete_database(&self.inner.name, &mut Self::blocked_warning)?;
        tracing::debug!(database = %self.inner.name, "store destroyed");
        Ok(())
    }

    fn ensure_schema_updates_allowed(&self, store: &str) -> DbResult<()> {
        if self.inner.allow_schema_update {
            Ok(())
        } else {
            Err(DbError::schema_conflict(
                store,
                "schema updates are disabled; open with allow_schema_update",
            ))
        }
    }

    fn enqueue_waiter<F>(&self, consumer: F)
    where
        F: FnOnce(ConnectionRef) + Send + 'static,
    {
        let manager = self.clone();
        let mut slot = Some(consumer);
        self.inner.bus.subscribe(
            "open",
            Trigger::new(move |_event, _version: &u32| {
                if let Some(consumer) = slot.take() {
                    if let Some(connection) = manager.checkout() {
                        consumer(connection);
                    }
                }
            })
            .once(),
            false,
        );
    }

    /// Checks out an already-open connection without starting an open.
    fn checkout(&self) -> Option<ConnectionRef> {
        let mut state = self.inner.state.lock();
        if state.destroyed {
            return None;
        }
        match &state.phase {
            Phase::Open { handle } => {
                let handle = Arc::clone(handle);
                state.refs += 1;
                Some(ConnectionRef {
                    manager: self.clone(),
                    handle,
                    released: false,
                })
            }
            _ => None,
        }
    }

    /// Runs the engine-level open sequence. Caller must hold the state
    /// lock with the phase `Closed`; the lock is dropped for the duration
    /// of the engine call.
    fn open_locked(&self, mut state: MutexGuard<'_, ConnState>) -> DbResult<ConnectionRef> {
        state.phase = Phase::Opening;
        let target = self.inner.declared_version.max(state.version);
        drop(state);

        let result = self.physical_open(target);

        let mut state = self.inner.state.lock();
        match result {
            Ok(handle) => {
                let handle: Arc<dyn Handle> = Arc::from(handle);
                if state.destroyed {
                    state.phase = Phase::Closed;
                    self.inner.cond.notify_all();
                    drop(state);
                    handle.close();
                    return Err(DbError::closed("store was destroyed during open"));
                }
                state.version = handle.version();
                state.refs += 1;
                state.phase = Phase::Open {
                    handle: Arc::clone(&handle),
                };
                let version = state.version;
                self.inner.cond.notify_all();
                drop(state);

                tracing::debug!(database = %self.inner.name, version, "connection open");
                if let Some(hook) = &self.inner.callbacks.on_success {
                    hook(version);
                }
                self.inner.bus.fire("open", &version);
                Ok(ConnectionRef {
                    manager: self.clone(),
                    handle,
                    released: false,
                })
            }
            Err(error) => {
                state.phase = Phase::Closed;
                self.inner.cond.notify_all();
                drop(state);

                let error: DbError = error.into();
                if let Some(hook) = &self.inner.callbacks.on_error {
                    hook(&error);
                }
                Err(error)
            }
        }
    }

    fn physical_open(&self, version: u32) -> EngineResult<Box<dyn Handle>> {
        let declared = self.declared_schema();
        let name = self.inner.name.clone();
        self.inner.engine.open(
            &self.inner.name,
            version,
            &mut |scope| {
                let report = SchemaReconciler::new(&declared).reconcile(scope)?;
                if !report.is_empty() {
                    tracing::debug!(
                        database = %name,
                        mutations = report.mutation_count(),
                        "schema reconciled"
                    );
                }
                Ok(())
            },
            &mut Self::blocked_warning,
        )
    }

    /// Closes the cached handle and reopens at version+1 with `reconcile`
    /// inside the upgrade transaction.
    fn bump_version<F>(&self, reconcile: F) -> DbResult<u32>
    where
        F: FnOnce(&mut dyn SchemaScope) -> EngineResult<()>,
    {
        let guard = self.acquire()?;

        let mut state = self.inner.state.lock();
        let old_handle = loop {
            if state.destroyed {
                return Err(DbError::closed("store has been destroyed"));
            }
            match std::mem::replace(&mut state.phase, Phase::Upgrading) {
                Phase::Open { handle } => break handle,
                Phase::Closed => {
                    // A concurrent upgrade failed and left the connection
                    // closed; restore it before bumping.
                    state.phase = Phase::Closed;
                    let reopened = self.open_locked(state)?;
                    drop(reopened);
                    state = self.inner.state.lock();
                }
                other => {
                    state.phase = other;
                    self.inner.cond.wait(&mut state);
                }
            }
        };
        let next = state.version + 1;
        drop(state);

        old_handle.close();
        tracing::debug!(database = %self.inner.name, version = next, "upgrading");

        let mut reconcile = Some(reconcile);
        let result = self.inner.engine.open(
            &self.inner.name,
            next,
            &mut |scope| match reconcile.take() {
                Some(hook) => hook(scope),
                None => Ok(()),
            },
            &mut Self::blocked_warning,
        );

        let mut state = self.inner.state.lock();
        match result {
            Ok(handle) => {
                let handle: Arc<dyn Handle> = Arc::from(handle);
                state.version = next;
                state.phase = Phase::Open { handle };
                self.inner.cond.notify_all();
                drop(state);

                if let Some(hook) = &self.inner.callbacks.on_success {
                    hook(next);
                }
                self.inner.bus.fire("open", &next);
                guard.release();
                Ok(next)
            }
            Err(error) => {
                state.phase = Phase::Closed;
                self.inner.cond.notify_all();
                drop(state);

                let error: DbError = error.into();
                if let Some(hook) = &self.inner.callbacks.on_error {
                    hook(&error);
                }
                guard.release();
                Err(error)
            }
        }
    }

    fn release(&self) {
        let mut state = self.inner.state.lock();
        state.refs = state.refs.saturating_sub(1);
        if state.refs == 0 {
            match std::mem::replace(&mut state.phase, Phase::Closed) {
                Phase::Open { handle } => {
                    drop(state);
                    handle.close();
                    tracing::debug!(database = %self.inner.name, "connection closed");
                }
                other => state.phase = other,
            }
        }
    }

    fn blocked_warning(blocked: &BlockedEvent) {
        tracing::warn!(
            database = %blocked.name,
            held_version = blocked.held_version,
            requested_version = blocked.requested_version,
            "open blocked by another consumer; waiting without timeout"
        );
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ConnectionManager")
            .field("name", &self.inner.name)
            .field("phase", &state.phase.kind())
            .field("version", &state.version)
            .field("refs", &state.refs)
            .finish_non_exhaustive()
    }
}
