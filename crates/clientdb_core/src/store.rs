//! Per-collection CRUD with event emission.
//!
//! Every mutation runs as one engine transaction and, on success, fires a
//! named event (`insert`/`update`/`remove`) on the collection's event bus
//! carrying the change summary. The bus's catch-all tap sees every event
//! regardless of name.

use crate::connection::ConnectionManager;
use crate::error::{DbError, DbResult};
use crate::events::{EventBus, Trigger};
use crate::filter::Filter;
use clientdb_engine::{Document, EngineError, Key, TxnMode};
use serde::Serialize;
use serde_json::Value;

/// Post-hoc change summary for one mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Changes {
    /// Records inserted.
    pub inserted: usize,
    /// Records updated in place.
    pub updated: usize,
    /// Records removed. For `remove`, this is the requested id count,
    /// whether or not the ids existed.
    pub removed: usize,
    /// Records left untouched (for example, failed sibling inserts).
    pub unchanged: usize,
}

/// A per-record failure collected without aborting sibling writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordError {
    /// Field the failure is attributed to.
    pub property: String,
    /// Diagnostic message.
    pub message: String,
}

/// Result of one mutation, also the payload of its event.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MutationOutcome {
    /// Records the mutation touched (shape depends on the operation).
    pub items: Vec<Document>,
    /// Per-record failures.
    pub errors: Vec<RecordError>,
    /// Change summary.
    pub changes: Changes,
}

/// One removable reference: a bare primary key or an id-bearing record.
#[derive(Debug, Clone)]
pub enum RemoveTarget {
    /// A primary key.
    Key(Key),
    /// A record whose primary key field identifies the victim.
    Record(Document),
}

/// Normalized input to [`Store::remove`]: one target or a batch.
#[derive(Debug, Clone)]
pub enum RemoveSpec {
    /// A single target.
    One(RemoveTarget),
    /// A batch of targets.
    Many(Vec<RemoveTarget>),
}

impl From<Key> for RemoveSpec {
    fn from(key: Key) -> Self {
        RemoveSpec::One(RemoveTarget::Key(key))
    }
}

impl From<&str> for RemoveSpec {
    fn from(id: &str) -> Self {
        RemoveSpec::One(RemoveTarget::Key(Key::from(id)))
    }
}

impl From<String> for RemoveSpec {
    fn from(id: String) -> Self {
        RemoveSpec::One(RemoveTarget::Key(Key::from(id)))
    }
}

impl From<Document> for RemoveSpec {
    fn from(record: Document) -> Self {
        RemoveSpec::One(RemoveTarget::Record(record))
    }
}

impl From<RemoveTarget> for RemoveSpec {
    fn from(target: RemoveTarget) -> Self {
        RemoveSpec::One(target)
    }
}

impl From<Vec<RemoveTarget>> for RemoveSpec {
    fn from(targets: Vec<RemoveTarget>) -> Self {
        RemoveSpec::Many(targets)
    }
}

impl From<Vec<Key>> for RemoveSpec {
    fn from(keys: Vec<Key>) -> Self {
        RemoveSpec::Many(keys.into_iter().map(RemoveTarget::Key).collect())
    }
}

impl From<Vec<&str>> for RemoveSpec {
    fn from(ids: Vec<&str>) -> Self {
        RemoveSpec::Many(ids.into_iter().map(|id| RemoveTarget::Key(Key::from(id))).collect())
    }
}

impl From<Vec<Document>> for RemoveSpec {
    fn from(records: Vec<Document>) -> Self {
        RemoveSpec::Many(records.into_iter().map(RemoveTarget::Record).collect())
    }
}

impl RemoveSpec {
    fn into_targets(self) -> Vec<RemoveTarget> {
        match self {
            RemoveSpec::One(target) => vec![target],
            RemoveSpec::Many(targets) => targets,
        }
    }
}

/// Handle to one named collection.
///
/// At most one `Store` exists per collection name at a time; handles are
/// created by the database facade and shared.
pub struct Store {
    name: String,
    primary_key: String,
    connection: ConnectionManager,
    events: EventBus<MutationOutcome>,
}

impl Store {
    pub(crate) fn new(name: String, primary_key: String, connection: ConnectionManager) -> Self {
        Self {
            name,
            primary_key,
            connection,
            events: EventBus::new(),
        }
    }

    /// Collection name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Primary key field.
    #[must_use]
    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    /// Inserts records inside one read-write transaction.
    ///
    /// Per-record failures (missing or duplicate primary key, unique
    /// index violations) are collected into the outcome without aborting
    /// sibling writes. Fires `"insert"` with the outcome.
    pub fn insert(&self, records: Vec<Document>) -> DbResult<MutationOutcome> {
        let connection = self.connection.acquire()?;
        let mut txn = connection.handle().begin(&[&self.name], TxnMode::ReadWrite)?;

        let mut outcome = MutationOutcome::default();
        for record in records {
            match txn.add(&self.name, &record) {
                Ok(_) => {
                    outcome.changes.inserted += 1;
                    outcome.items.push(record);
                }
                Err(error) => {
                    outcome.changes.unchanged += 1;
                    outcome.errors.push(self.record_error(&error));
                }
            }
        }
        txn.commit()?;
        drop(connection);

        self.events.fire("insert", &outcome);
        Ok(outcome)
    }

    /// Inserts a single record. See [`Store::insert`].
    pub fn insert_one(&self, record: Document) -> DbResult<MutationOutcome> {
        self.insert(vec![record])
    }

    /// Read-modify-writes a single record: shallow-merges `changes` into
    /// the stored document and writes it back.
    ///
    /// Fails with [`DbError::NotFound`] when `id` is absent. Fires
    /// `"update"` carrying the partial changes as items.
    pub fn update(&self, id: impl Into<Key>, changes: Document) -> DbResult<MutationOutcome> {
        let id = id.into();
        let connection = self.connection.acquire()?;
        let mut txn = connection.handle().begin(&[&self.name], TxnMode::ReadWrite)?;

        let Some(mut current) = txn.get(&self.name, &id)? else {
            return Err(DbError::not_found(&id));
        };
        for (field, value) in changes.clone() {
            current.insert(field, value);
        }
        txn.put(&self.name, &current)?;
        txn.commit()?;
        drop(connection);

        let outcome = MutationOutcome {
            items: vec![changes],
            errors: Vec::new(),
            changes: Changes {
                updated: 1,
                ..Changes::default()
            },
        };
        self.events.fire("update", &outcome);
        Ok(outcome)
    }

    /// Deletes records by id inside one transaction.
    ///
    /// Accepts a bare id, an id-bearing record, or batches of either; the
    /// reported `removed` count is the requested id count, whether or not
    /// the ids existed. Fires `"remove"`.
    pub fn remove(&self, target: impl Into<RemoveSpec>) -> DbResult<MutationOutcome> {
        let mut keys = Vec::new();
        for target in target.into().into_targets() {
            match target {
                RemoveTarget::Key(key) => keys.push(key),
                RemoveTarget::Record(record) => {
                    let key = record
                        .get(&self.primary_key)
                        .and_then(Key::from_value)
                        .ok_or_else(|| {
                            DbError::parse(format!(
                                "record has no usable {:?} field to delete by",
                                self.primary_key
                            ))
                        })?;
                    keys.push(key);
                }
            }
        }

        let connection = self.connection.acquire()?;
        let mut txn = connection.handle().begin(&[&self.name], TxnMode::ReadWrite)?;
        for key in &keys {
            txn.delete(&self.name, key)?;
        }
        txn.commit()?;
        drop(connection);

        let outcome = MutationOutcome {
            items: Vec::new(),
            errors: Vec::new(),
            changes: Changes {
                removed: keys.len(),
                ..Changes::default()
            },
        };
        self.events.fire("remove", &outcome);
        Ok(outcome)
    }

    /// Clears the collection, reporting the pre-clear record count as
    /// removed. Fires `"remove"`.
    pub fn remove_all_records(&self) -> DbResult<MutationOutcome> {
        let connection = self.connection.acquire()?;
        let mut txn = connection.handle().begin(&[&self.name], TxnMode::ReadWrite)?;
        let total = txn.count(&self.name)?;
        txn.clear(&self.name)?;
        txn.commit()?;
        drop(connection);

        let outcome = MutationOutcome {
            items: Vec::new(),
            errors: Vec::new(),
            changes: Changes {
                removed: total as usize,
                ..Changes::default()
            },
        };
        self.events.fire("remove", &outcome);
        Ok(outcome)
    }

    /// Fetches a record by primary key.
    pub fn get(&self, id: impl Into<Key>) -> DbResult<Option<Document>> {
        let id = id.into();
        let connection = self.connection.acquire()?;
        let txn = connection.handle().begin(&[&self.name], TxnMode::ReadOnly)?;
        Ok(txn.get(&self.name, &id)?)
    }

    /// Fetches records for each requested key, aligned with the input.
    pub fn get_all(&self, ids: &[Key]) -> DbResult<Vec<Option<Document>>> {
        let connection = self.connection.acquire()?;
        let txn = connection.handle().begin(&[&self.name], TxnMode::ReadOnly)?;
        ids.iter().map(|id| Ok(txn.get(&self.name, id)?)).collect()
    }

    /// Fetches every record in the collection, in primary-key order.
    pub fn records(&self) -> DbResult<Vec<Document>> {
        let connection = self.connection.acquire()?;
        let txn = connection.handle().begin(&[&self.name], TxnMode::ReadOnly)?;
        Ok(txn.get_all(&self.name)?)
    }

    /// Counts the records in the collection.
    pub fn count(&self) -> DbResult<u64> {
        let connection = self.connection.acquire()?;
        let txn = connection.handle().begin(&[&self.name], TxnMode::ReadOnly)?;
        Ok(txn.count(&self.name)?)
    }

    /// Builds a query over this collection's indexes from a declarative
    /// predicate map. See [`Filter`] for the predicate shapes and the
    /// OR-merge semantics of `run`.
    #[must_use]
    pub fn filter(&self, queries: serde_json::Map<String, Value>) -> Filter {
        Filter::new(
            self.connection.clone(),
            self.name.clone(),
            self.primary_key.clone(),
            queries,
        )
    }

    /// Subscribes a callback to a named mutation event
    /// (`insert`/`update`/`remove`).
    pub fn subscribe(
        &self,
        event: &str,
        callback: impl FnMut(&str, &MutationOutcome) + Send + 'static,
    ) {
        self.events.subscribe(event, Trigger::new(callback), false);
    }

    /// Alias for [`Store::subscribe`].
    pub fn on(
        &self,
        event: &str,
        callback: impl FnMut(&str, &MutationOutcome) + Send + 'static,
    ) {
        self.subscribe(event, callback);
    }

    /// Registers a catch-all tap that observes every event on this
    /// collection.
    pub fn tap(&self, callback: impl FnMut(&str, &MutationOutcome) + Send + 'static) {
        self.events.tap(callback);
    }

    /// The collection's event bus, for id/once/override subscriptions.
    #[must_use]
    pub fn events(&self) -> &EventBus<MutationOutcome> {
        &self.events
    }

    fn record_error(&self, error: &EngineError) -> RecordError {
        let property = match error {
            EngineError::Constraint { property, .. } => property.clone(),
            _ => self.primary_key.clone(),
        };
        RecordError {
            property,
            message: error.to_string(),
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.name)
            .field("primary_key", &self.primary_key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Callbacks, Options};
    use crate::schema::{IndexSpec, StoreSchema};
    use clientdb_engine::MemoryEngine;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    fn users_store() -> Store {
        let options = Options::new().name("store-test").store(
            StoreSchema::new("users")
                .key("name", IndexSpec::plain())
                .key("age", IndexSpec::plain()),
        );
        let connection =
            ConnectionManager::new(Arc::new(MemoryEngine::new()), &options, Callbacks::new());
        Store::new("users".into(), "_id".into(), connection)
    }

    #[test]
    fn insert_reports_post_hoc_counts() {
        let store = users_store();
        let outcome = store
            .insert(vec![
                doc(json!({"_id": "a", "name": "x"})),
                doc(json!({"_id": "b", "name": "y"})),
            ])
            .unwrap();

        assert_eq!(outcome.changes.inserted, 2);
        assert_eq!(outcome.changes.unchanged, 0);
        assert!(outcome.errors.is_empty());
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn failed_record_does_not_abort_siblings() {
        let store = users_store();
        store.insert_one(doc(json!({"_id": "a"}))).unwrap();

        let outcome = store
            .insert(vec![
                doc(json!({"_id": "a"})),          // duplicate key
                doc(json!({"name": "no id"})),     // missing key
                doc(json!({"_id": "b"})),          // fine
            ])
            .unwrap();

        assert_eq!(outcome.changes.inserted, 1);
        assert_eq!(outcome.changes.unchanged, 2);
        assert_eq!(outcome.errors.len(), 2);
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn update_shallow_merges_changes() {
        let store = users_store();
        store
            .insert_one(doc(json!({"_id": "a", "name": "x", "age": 30})))
            .unwrap();

        store.update("a", doc(json!({"age": 31}))).unwrap();

        let updated = store.get("a").unwrap().unwrap();
        assert_eq!(updated.get("age"), Some(&json!(31)));
        assert_eq!(updated.get("name"), Some(&json!("x")));
    }

    #[test]
    fn update_missing_record_is_not_found() {
        let store = users_store();
        let result = store.update("ghost", doc(json!({"age": 1})));
        assert!(matches!(result, Err(DbError::NotFound { .. })));
    }

    #[test]
    fn remove_accepts_bare_id_record_and_batches() {
        let store = users_store();
        for id in ["a", "b", "c", "d"] {
            store.insert_one(doc(json!({"_id": id}))).unwrap();
        }

        store.remove("a").unwrap();
        store.remove(doc(json!({"_id": "b", "name": "whatever"}))).unwrap();
        store.remove(vec!["c", "d"]).unwrap();

        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn remove_reports_requested_count_for_missing_ids() {
        let store = users_store();
        let outcome = store.remove(vec!["never", "existed"]).unwrap();
        assert_eq!(outcome.changes.removed, 2);
    }

    #[test]
    fn remove_record_without_primary_key_is_a_parse_error() {
        let store = users_store();
        let result = store.remove(doc(json!({"name": "anonymous"})));
        assert!(matches!(result, Err(DbError::Parse { .. })));
    }

    #[test]
    fn remove_all_records_reports_pre_clear_count() {
        let store = users_store();
        for id in ["a", "b", "c"] {
            store.insert_one(doc(json!({"_id": id}))).unwrap();
        }

        let outcome = store.remove_all_records().unwrap();
        assert_eq!(outcome.changes.removed, 3);
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn get_all_aligns_with_requested_keys() {
        let store = users_store();
        store.insert_one(doc(json!({"_id": "a", "name": "x"}))).unwrap();

        let fetched = store
            .get_all(&[Key::from("ghost"), Key::from("a")])
            .unwrap();
        assert!(fetched[0].is_none());
        assert_eq!(fetched[1].as_ref().unwrap().get("name"), Some(&json!("x")));
    }

    #[test]
    fn mutations_fire_named_events_and_taps() {
        let store = users_store();
        let inserts = Arc::new(AtomicUsize::new(0));
        let taps = Arc::new(Mutex::new(Vec::new()));

        {
            let inserts = Arc::clone(&inserts);
            store.subscribe("insert", move |_, outcome| {
                assert_eq!(outcome.changes.inserted, 1);
                inserts.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let taps = Arc::clone(&taps);
            store.tap(move |event, _| taps.lock().push(event.to_string()));
        }

        store.insert_one(doc(json!({"_id": "a", "age": 1}))).unwrap();
        store.update("a", doc(json!({"age": 2}))).unwrap();
        store.remove("a").unwrap();

        assert_eq!(inserts.load(Ordering::SeqCst), 1);
        assert_eq!(*taps.lock(), vec!["insert", "update", "remove"]);
    }

    #[test]
    fn update_event_carries_partial_changes_as_items() {
        let store = users_store();
        store.insert_one(doc(json!({"_id": "a", "age": 1}))).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            store.on("update", move |_, outcome| {
                seen.lock().push(outcome.items.clone());
            });
        }
        store.update("a", doc(json!({"age": 2}))).unwrap();

        let batches = seen.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0], doc(json!({"age": 2})));
    }
}
