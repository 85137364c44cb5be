//! Store facade.

use crate::config::{Callbacks, Options};
use crate::connection::ConnectionManager;
use crate::error::DbResult;
use crate::schema::{IndexSpec, StoreSchema};
use crate::store::Store;
use clientdb_engine::Engine;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// The main store handle.
///
/// `ClientDb` owns the connection manager and one [`Store`] handle per
/// collection. Declared collections get their handles eagerly; handles
/// for collections added through [`ClientDb::create_store`] are created
/// with them. At most one handle exists per collection name.
///
/// # Opening a store
///
/// ```rust,ignore
/// use clientdb_core::{ClientDb, IndexSpec, Options, StoreSchema};
/// use clientdb_engine::MemoryEngine;
/// use std::sync::Arc;
///
/// let db = ClientDb::open(
///     Arc::new(MemoryEngine::new()),
///     Options::new()
///         .name("app")
///         .store(StoreSchema::new("users").key("name", IndexSpec::plain())),
/// )?;
///
/// let users = db.collect("users").unwrap();
/// users.insert_one(record)?;
/// ```
pub struct ClientDb {
    connection: ConnectionManager,
    stores: RwLock<HashMap<String, Arc<Store>>>,
}

impl ClientDb {
    /// Opens a store: reconciles the declared layout against disk and
    /// creates the collection handles.
    pub fn open(engine: Arc<dyn Engine>, options: Options) -> DbResult<Self> {
        Self::open_with_callbacks(engine, options, Callbacks::new())
    }

    /// Opens a store with open-outcome callbacks.
    ///
    /// The callbacks observe every physical open: `on_success` with the
    /// opened version, `on_error` with the failure.
    pub fn open_with_callbacks(
        engine: Arc<dyn Engine>,
        options: Options,
        callbacks: Callbacks,
    ) -> DbResult<Self> {
        let connection = ConnectionManager::new(engine, &options, callbacks);

        let mut stores = HashMap::new();
        for schema in &options.stores {
            stores.insert(
                schema.name.clone(),
                Arc::new(Store::new(
                    schema.name.clone(),
                    schema.primary_key.clone(),
                    connection.clone(),
                )),
            );
        }

        let db = Self {
            connection,
            stores: RwLock::new(stores),
        };

        // Initial open: runs reconciliation up front so construction
        // surfaces schema problems instead of the first operation.
        db.connection.acquire()?.release();
        Ok(db)
    }

    /// Selects a collection handle by name.
    #[must_use]
    pub fn collect(&self, name: &str) -> Option<Arc<Store>> {
        self.stores.read().get(name).cloned()
    }

    /// Names of the collections with handles.
    #[must_use]
    pub fn store_names(&self) -> Vec<String> {
        self.stores.read().keys().cloned().collect()
    }

    /// Last known on-disk version.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.connection.version()
    }

    /// The connection manager, for lifecycle-level access (waiter-style
    /// opens, refcount observation).
    #[must_use]
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Declares a new collection keyed by `_id` and reopens at
    /// version+1. Resolves with the new version.
    ///
    /// Requires `allow_schema_update`.
    pub fn create_store(
        &self,
        name: &str,
        keys: BTreeMap<String, IndexSpec>,
    ) -> DbResult<u32> {
        let mut schema = StoreSchema::new(name);
        schema.keys = keys;
        let primary_key = schema.primary_key.clone();

        let version = self.connection.create_store(schema)?;
        self.stores
            .write()
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Store::new(
                    name.to_string(),
                    primary_key,
                    self.connection.clone(),
                ))
            });
        Ok(version)
    }

    /// Logically removes a collection: undeclares it, drops its handle,
    /// and reopens at version+1, deleting it from disk. Resolves with
    /// the new version.
    ///
    /// Requires `allow_schema_update`.
    pub fn remove_store(&self, name: &str) -> DbResult<u32> {
        let version = self.connection.remove_store(name)?;
        self.stores.write().remove(name);
        Ok(version)
    }

    /// Replaces a collection's index set and reopens at version+1 with
    /// index-level reconciliation. Resolves with the new version.
    ///
    /// Requires `allow_schema_update`; fails with a schema conflict when
    /// the collection is not declared.
    pub fn update_keys(&self, name: &str, keys: BTreeMap<String, IndexSpec>) -> DbResult<u32> {
        self.connection.update_keys(name, keys)
    }

    /// Deletes the entire store. Terminal.
    pub fn destroy(&self) -> DbResult<()> {
        self.stores.write().clear();
        self.connection.destroy()
    }
}

impl std::fmt::Debug for ClientDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientDb")
            .field("connection", &self.connection)
            .field("stores", &self.store_names())
            .finish_non_exhaustive()
    }
}
