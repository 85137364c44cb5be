//! Declared collection layouts and schema reconciliation.
//!
//! A store declares its collections and their secondary indexes once, as
//! data. At upgrade time the [`SchemaReconciler`] diffs the declaration
//! against the structure actually on disk and applies the difference
//! inside the engine's schema-change transaction, so an interrupted
//! upgrade never leaves a partial layout behind.

use clientdb_engine::{EngineResult, SchemaScope};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn default_primary_key() -> String {
    "_id".to_string()
}

/// Value-type hint for an indexed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    /// Boolean values.
    Bool,
    /// Numeric values.
    Number,
    /// String values.
    Text,
}

/// Declaration of one secondary index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    /// Whether the index enforces uniqueness.
    #[serde(default)]
    pub unique: bool,
    /// Optional value-type hint. Not enforced by the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_type: Option<KeyType>,
}

impl IndexSpec {
    /// A non-unique index.
    #[must_use]
    pub const fn plain() -> Self {
        Self {
            unique: false,
            key_type: None,
        }
    }

    /// A unique index.
    #[must_use]
    pub const fn unique() -> Self {
        Self {
            unique: true,
            key_type: None,
        }
    }

    /// Attaches a value-type hint.
    #[must_use]
    pub const fn typed(mut self, key_type: KeyType) -> Self {
        self.key_type = Some(key_type);
        self
    }
}

/// Declared layout of one collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSchema {
    /// Collection name.
    pub name: String,
    /// Primary key field, `"_id"` by default.
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    /// Indexed fields.
    #[serde(default)]
    pub keys: BTreeMap<String, IndexSpec>,
}

impl StoreSchema {
    /// Declares a collection keyed by `_id` with no indexes.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: default_primary_key(),
            keys: BTreeMap::new(),
        }
    }

    /// Overrides the primary key field.
    #[must_use]
    pub fn primary_key(mut self, field: impl Into<String>) -> Self {
        self.primary_key = field.into();
        self
    }

    /// Declares an index over `field`.
    #[must_use]
    pub fn key(mut self, field: impl Into<String>, spec: IndexSpec) -> Self {
        self.keys.insert(field.into(), spec);
        self
    }
}

/// Structural mutations applied by one reconciliation pass.
///
/// Reconciling a layout that already matches the disk reports nothing:
/// the reconciler only ever applies differences.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Collections created, by name.
    pub created_collections: Vec<String>,
    /// Collections deleted, by name.
    pub deleted_collections: Vec<String>,
    /// Indexes created, as `collection.field`.
    pub created_indexes: Vec<String>,
    /// Indexes deleted, as `collection.field`.
    pub deleted_indexes: Vec<String>,
}

impl ReconcileReport {
    /// True when the pass applied no structural change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.created_collections.is_empty()
            && self.deleted_collections.is_empty()
            && self.created_indexes.is_empty()
            && self.deleted_indexes.is_empty()
    }

    /// Total number of structural mutations.
    #[must_use]
    pub fn mutation_count(&self) -> usize {
        self.created_collections.len()
            + self.deleted_collections.len()
            + self.created_indexes.len()
            + self.deleted_indexes.len()
    }
}

/// Diffs a declared layout against on-disk structure inside an upgrade
/// transaction.
pub struct SchemaReconciler<'a> {
    declared: &'a [StoreSchema],
}

impl<'a> SchemaReconciler<'a> {
    /// Creates a reconciler over the declared layout.
    #[must_use]
    pub fn new(declared: &'a [StoreSchema]) -> Self {
        Self { declared }
    }

    /// Reconciles collections and indexes.
    ///
    /// A fresh database (on-disk version 0 before this upgrade) gets
    /// every declared collection and index. An existing database gets
    /// missing collections and missing indexes created and undeclared
    /// collections deleted; indexes on surviving collections are never
    /// deleted on this path.
    pub fn reconcile(&self, scope: &mut dyn SchemaScope) -> EngineResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        if scope.old_version() == 0 {
            for store in self.declared {
                self.create_store(scope, store, &mut report)?;
            }
            return Ok(report);
        }

        let on_disk = scope.collection_names();
        for store in self.declared {
            if on_disk.contains(&store.name) {
                let existing = scope.index_names(&store.name)?;
                for (field, spec) in &store.keys {
                    if !existing.contains(field) {
                        scope.create_index(&store.name, field, spec.unique)?;
                        report.created_indexes.push(format!("{}.{}", store.name, field));
                    }
                }
            } else {
                self.create_store(scope, store, &mut report)?;
            }
        }

        for name in on_disk {
            if !self.declared.iter().any(|store| store.name == name) {
                scope.delete_collection(&name)?;
                report.deleted_collections.push(name);
            }
        }

        Ok(report)
    }

    /// Index-level reconciliation for one collection, used by the
    /// `update_keys` path: deletes on-disk indexes absent from `keys`,
    /// then creates missing ones.
    pub fn reconcile_indexes(
        scope: &mut dyn SchemaScope,
        store: &str,
        keys: &BTreeMap<String, IndexSpec>,
    ) -> EngineResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let existing = scope.index_names(store)?;

        for field in &existing {
            if !keys.contains_key(field) {
                scope.delete_index(store, field)?;
                report.deleted_indexes.push(format!("{store}.{field}"));
            }
        }
        for (field, spec) in keys {
            if !existing.contains(field) {
                scope.create_index(store, field, spec.unique)?;
                report.created_indexes.push(format!("{store}.{field}"));
            }
        }

        Ok(report)
    }

    fn create_store(
        &self,
        scope: &mut dyn SchemaScope,
        store: &StoreSchema,
        report: &mut ReconcileReport,
    ) -> EngineResult<()> {
        scope.create_collection(&store.name, &store.primary_key)?;
        report.created_collections.push(store.name.clone());
        for (field, spec) in &store.keys {
            scope.create_index(&store.name, field, spec.unique)?;
            report.created_indexes.push(format!("{}.{}", store.name, field));
        }
        Ok(())
    }
}
