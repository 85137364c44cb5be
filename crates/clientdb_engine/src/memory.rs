//! In-memory reference engine.
//!
//! `MemoryEngine` implements the engine contract for tests and ephemeral
//! stores. It is not durable: all databases live in process memory.
//!
//! Transactions take a copy-on-write snapshot of their collections at
//! begin and install it atomically at commit, so readers never observe a
//! half-applied write set. Upgrade hooks run against a working copy of
//! the whole collection map; a hook error discards the copy, leaving no
//! partial schema behind.

use crate::error::{EngineError, EngineResult};
use crate::key::{Key, KeyRange};
use crate::traits::{
    BlockedEvent, BlockedHook, Cursor, Document, Engine, Handle, SchemaScope, Transaction, TxnMode,
    UpgradeHook,
};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
struct IndexMeta {
    unique: bool,
}

#[derive(Debug, Clone)]
struct CollectionState {
    primary_key: String,
    indexes: BTreeMap<String, IndexMeta>,
    records: BTreeMap<Key, Document>,
}

impl CollectionState {
    fn new(primary_key: &str) -> Self {
        Self {
            primary_key: primary_key.to_string(),
            indexes: BTreeMap::new(),
            records: BTreeMap::new(),
        }
    }

    fn extract_key(&self, document: &Document) -> EngineResult<Key> {
        let value = document.get(&self.primary_key).ok_or_else(|| {
            EngineError::invalid_key(format!(
                "document is missing primary key field {:?}",
                self.primary_key
            ))
        })?;
        Key::try_from_value(value)
    }

    /// Fails if any unique index would collide with `document` stored
    /// under `key`.
    fn check_unique(&self, name: &str, key: &Key, document: &Document) -> EngineResult<()> {
        for (field, meta) in &self.indexes {
            if !meta.unique {
                continue;
            }
            let Some(candidate) = document.get(field).and_then(Key::from_value) else {
                continue;
            };
            for (existing_key, existing) in &self.records {
                if existing_key == key {
                    continue;
                }
                if existing.get(field).and_then(Key::from_value) == Some(candidate.clone()) {
                    return Err(EngineError::constraint(
                        name,
                        field,
                        format!("unique index violated by key {candidate}"),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct DbState {
    version: u32,
    collections: BTreeMap<String, CollectionState>,
    handles: usize,
}

#[derive(Debug, Default)]
struct DbEntry {
    state: Mutex<DbState>,
    cond: Condvar,
}

/// An in-memory storage engine.
///
/// Databases are created on first open and report on-disk version 0
/// until the first upgrade commits.
///
/// # Example
///
/// ```rust
/// use clientdb_engine::{Engine, MemoryEngine};
///
/// let engine = MemoryEngine::new();
/// let handle = engine
///     .open("app", 1, &mut |schema| schema.create_collection("users", "_id"), &mut |_| {})
///     .unwrap();
/// assert_eq!(handle.version(), 1);
/// ```
#[derive(Default)]
pub struct MemoryEngine {
    databases: Mutex<HashMap<String, Arc<DbEntry>>>,
}

impl MemoryEngine {
    /// Creates an engine with no databases.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, name: &str) -> Arc<DbEntry> {
        let mut databases = self.databases.lock();
        Arc::clone(databases.entry(name.to_string()).or_default())
    }
}

impl Engine for MemoryEngine {
    fn open(
        &self,
        name: &str,
        version: u32,
        on_upgrade: UpgradeHook<'_>,
        on_blocked: BlockedHook<'_>,
    ) -> EngineResult<Box<dyn Handle>> {
        let entry = self.entry(name);
        let mut state = entry.state.lock();

        if version < state.version {
            return Err(EngineError::VersionMismatch {
                requested: version,
                current: state.version,
            });
        }

        if version > state.version && state.handles > 0 {
            on_blocked(&BlockedEvent {
                name: name.to_string(),
                held_version: state.version,
                requested_version: version,
            });
            while state.handles > 0 {
                entry.cond.wait(&mut state);
            }
            // Another opener may have upgraded past us while we waited.
            if version < state.version {
                return Err(EngineError::VersionMismatch {
                    requested: version,
                    current: state.version,
                });
            }
        }

        if version > state.version {
            let mut working = state.collections.clone();
            let mut scope = MemorySchemaScope {
                old_version: state.version,
                new_version: version,
                collections: &mut working,
            };
            on_upgrade(&mut scope)?;
            state.collections = working;
            state.version = version;
            tracing::debug!(database = name, version, "schema upgrade committed");
        }

        state.handles += 1;
        Ok(Box::new(MemoryHandle {
            name: name.to_string(),
            version: state.version,
            entry: Arc::clone(&entry),
            open: AtomicBool::new(true),
        }))
    }

    fn delete_database(&self, name: &str, on_blocked: BlockedHook<'_>) -> EngineResult<()> {
        let entry = {
            let databases = self.databases.lock();
            databases.get(name).cloned()
        };
        let Some(entry) = entry else {
            return Ok(());
        };

        {
            let mut state = entry.state.lock();
            if state.handles > 0 {
                on_blocked(&BlockedEvent {
                    name: name.to_string(),
                    held_version: state.version,
                    requested_version: 0,
                });
                while state.handles > 0 {
                    entry.cond.wait(&mut state);
                }
            }
            state.collections.clear();
            state.version = 0;
        }

        self.databases.lock().remove(name);
        tracing::debug!(database = name, "database deleted");
        Ok(())
    }
}

struct MemoryHandle {
    name: String,
    version: u32,
    entry: Arc<DbEntry>,
    open: AtomicBool,
}

impl Handle for MemoryHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn collection_names(&self) -> Vec<String> {
        self.entry.state.lock().collections.keys().cloned().collect()
    }

    fn begin<'a>(
        &'a self,
        collections: &[&str],
        mode: TxnMode,
    ) -> EngineResult<Box<dyn Transaction + 'a>> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }

        let state = self.entry.state.lock();
        let mut working = BTreeMap::new();
        for &name in collections {
            let collection = state
                .collections
                .get(name)
                .ok_or_else(|| EngineError::unknown_collection(name))?;
            working.insert(name.to_string(), collection.clone());
        }

        Ok(Box::new(MemoryTxn {
            entry: Arc::clone(&self.entry),
            mode,
            working,
        }))
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let mut state = self.entry.state.lock();
            state.handles -= 1;
            self.entry.cond.notify_all();
        }
    }
}

impl Drop for MemoryHandle {
    fn drop(&mut self) {
        self.close();
    }
}

struct MemoryTxn {
    entry: Arc<DbEntry>,
    mode: TxnMode,
    working: BTreeMap<String, CollectionState>,
}

impl MemoryTxn {
    fn collection(&self, name: &str) -> EngineResult<&CollectionState> {
        self.working
            .get(name)
            .ok_or_else(|| EngineError::unknown_collection(name))
    }

    fn collection_mut(&mut self, name: &str) -> EngineResult<&mut CollectionState> {
        if self.mode == TxnMode::ReadOnly {
            return Err(EngineError::invalid_operation(
                "write attempted in a read-only transaction",
            ));
        }
        self.working
            .get_mut(name)
            .ok_or_else(|| EngineError::unknown_collection(name))
    }
}

impl Transaction for MemoryTxn {
    fn mode(&self) -> TxnMode {
        self.mode
    }

    fn add(&mut self, collection: &str, document: &Document) -> EngineResult<Key> {
        let target = self.collection_mut(collection)?;
        let key = target.extract_key(document)?;
        if target.records.contains_key(&key) {
            let property = target.primary_key.clone();
            return Err(EngineError::constraint(
                collection,
                property,
                format!("key {key} already exists"),
            ));
        }
        target.check_unique(collection, &key, document)?;
        target.records.insert(key.clone(), document.clone());
        Ok(key)
    }

    fn put(&mut self, collection: &str, document: &Document) -> EngineResult<Key> {
        let target = self.collection_mut(collection)?;
        let key = target.extract_key(document)?;
        target.check_unique(collection, &key, document)?;
        target.records.insert(key.clone(), document.clone());
        Ok(key)
    }

    fn get(&self, collection: &str, key: &Key) -> EngineResult<Option<Document>> {
        Ok(self.collection(collection)?.records.get(key).cloned())
    }

    fn get_all(&self, collection: &str) -> EngineResult<Vec<Document>> {
        Ok(self.collection(collection)?.records.values().cloned().collect())
    }

    fn delete(&mut self, collection: &str, key: &Key) -> EngineResult<()> {
        self.collection_mut(collection)?.records.remove(key);
        Ok(())
    }

    fn clear(&mut self, collection: &str) -> EngineResult<()> {
        self.collection_mut(collection)?.records.clear();
        Ok(())
    }

    fn count(&self, collection: &str) -> EngineResult<u64> {
        Ok(self.collection(collection)?.records.len() as u64)
    }

    fn open_cursor<'a>(
        &'a self,
        collection: &str,
        index: &str,
        range: &KeyRange,
    ) -> EngineResult<Box<dyn Cursor + 'a>> {
        let target = self.collection(collection)?;
        if !target.indexes.contains_key(index) {
            return Err(EngineError::unknown_index(collection, index));
        }

        let mut rows: Vec<(Key, Key, Document)> = Vec::new();
        for (primary, document) in &target.records {
            let Some(indexed) = document.get(index).and_then(|v| Key::from_value(v)) else {
                continue;
            };
            if range.contains(&indexed) {
                rows.push((indexed, primary.clone(), document.clone()));
            }
        }
        rows.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));

        Ok(Box::new(MemoryCursor {
            rows: rows.into_iter().map(|(_, _, doc)| doc).collect(),
        }))
    }

    fn commit(self: Box<Self>) -> EngineResult<()> {
        if self.mode == TxnMode::ReadWrite {
            let mut state = self.entry.state.lock();
            for (name, collection) in self.working {
                state.collections.insert(name, collection);
            }
        }
        Ok(())
    }

    fn abort(self: Box<Self>) {}
}

struct MemoryCursor {
    rows: VecDeque<Document>,
}

impl Cursor for MemoryCursor {
    fn step(&mut self) -> EngineResult<Option<Document>> {
        Ok(self.rows.pop_front())
    }
}

struct MemorySchemaScope<'a> {
    old_version: u32,
    new_version: u32,
    collections: &'a mut BTreeMap<String, CollectionState>,
}

impl SchemaScope for MemorySchemaScope<'_> {
    fn old_version(&self) -> u32 {
        self.old_version
    }

    fn new_version(&self) -> u32 {
        self.new_version
    }

    fn collection_names(&self) -> Vec<String> {
        self.collections.keys().cloned().collect()
    }

    fn index_names(&self, collection: &str) -> EngineResult<Vec<String>> {
        let target = self
            .collections
            .get(collection)
            .ok_or_else(|| EngineError::unknown_collection(collection))?;
        Ok(target.indexes.keys().cloned().collect())
    }

    fn create_collection(&mut self, name: &str, primary_key: &str) -> EngineResult<()> {
        if self.collections.contains_key(name) {
            return Err(EngineError::invalid_operation(format!(
                "collection {name} already exists"
            )));
        }
        self.collections
            .insert(name.to_string(), CollectionState::new(primary_key));
        Ok(())
    }

    fn delete_collection(&mut self, name: &str) -> EngineResult<()> {
        self.collections
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| EngineError::unknown_collection(name))
    }

    fn create_index(&mut self, collection: &str, field: &str, unique: bool) -> EngineResult<()> {
        let target = self
            .collections
            .get_mut(collection)
            .ok_or_else(|| EngineError::unknown_collection(collection))?;
        if target.indexes.contains_key(field) {
            return Err(EngineError::invalid_operation(format!(
                "index {field} already exists on {collection}"
            )));
        }

        if unique {
            let mut seen = BTreeMap::new();
            for (primary, document) in &target.records {
                let Some(indexed) = document.get(field).and_then(Key::from_value) else {
                    continue;
                };
                if seen.insert(indexed.clone(), primary.clone()).is_some() {
                    return Err(EngineError::constraint(
                        collection,
                        field,
                        format!("existing records collide on {indexed}"),
                    ));
                }
            }
        }

        target
            .indexes
            .insert(field.to_string(), IndexMeta { unique });
        Ok(())
    }

    fn delete_index(&mut self, collection: &str, field: &str) -> EngineResult<()> {
        let target = self
            .collections
            .get_mut(collection)
            .ok_or_else(|| EngineError::unknown_collection(collection))?;
        target
            .indexes
            .remove(field)
            .map(|_| ())
            .ok_or_else(|| EngineError::unknown_index(collection, field))
    }
}
