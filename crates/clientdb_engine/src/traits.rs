//! The versioned key-value engine contract.
//!
//! clientdb consumes a host engine through these traits; it never
//! implements durability itself. An engine provides:
//!
//! - versioned database opens, with an upgrade hook fired inside a
//!   schema-change transaction whenever the requested version exceeds the
//!   on-disk version
//! - transactions scoped to named collections, with object-level
//!   operations and index-level bounded forward cursors
//! - a blocked signal when a version-changing open must wait for other
//!   holders of the database to close
//!
//! # Invariants
//!
//! - A database that has never been created reports on-disk version 0.
//! - The upgrade hook runs at most once per open, only when the version
//!   increases, and its structural changes commit atomically: if the hook
//!   errors, no partial schema is ever observable.
//! - Version-changing opens serialize against every other open of the
//!   same database; the engine signals blocked once and then waits, with
//!   no timeout.
//! - Within a transaction, each operation's result settles before
//!   `commit` returns.

use crate::error::EngineResult;
use crate::key::{Key, KeyRange};

/// A stored record: a JSON object keyed by one of its own fields.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Transaction access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnMode {
    /// Reads only; concurrent with other readers.
    ReadOnly,
    /// Reads and writes; commits atomically.
    ReadWrite,
}

/// Details of a blocked open, passed to the blocked hook.
#[derive(Debug, Clone)]
pub struct BlockedEvent {
    /// Database name.
    pub name: String,
    /// Version held open by other consumers.
    pub held_version: u32,
    /// Version the blocked open is requesting.
    pub requested_version: u32,
}

/// Hook invoked inside the engine's schema-change transaction.
pub type UpgradeHook<'a> = &'a mut dyn FnMut(&mut dyn SchemaScope) -> EngineResult<()>;

/// Hook invoked once when an open or delete must wait for other holders.
pub type BlockedHook<'a> = &'a mut dyn FnMut(&BlockedEvent);

/// A storage engine hosting named, versioned databases.
pub trait Engine: Send + Sync {
    /// Opens a database at `version`, returning a handle.
    ///
    /// If `version` exceeds the on-disk version, `on_upgrade` runs inside
    /// a schema-change transaction before the handle is produced; the
    /// version bump commits only if the hook succeeds. If other handles
    /// hold the database open, `on_blocked` fires once and the open waits
    /// until they close.
    ///
    /// # Errors
    ///
    /// Returns [`crate::EngineError::VersionMismatch`] when `version` is
    /// below the on-disk version, or the upgrade hook's error verbatim.
    fn open(
        &self,
        name: &str,
        version: u32,
        on_upgrade: UpgradeHook<'_>,
        on_blocked: BlockedHook<'_>,
    ) -> EngineResult<Box<dyn Handle>>;

    /// Deletes a database and all of its contents.
    ///
    /// Waits for outstanding handles to close, signalling `on_blocked`
    /// once if any are open. Deleting a database that does not exist is
    /// a no-op.
    fn delete_database(&self, name: &str, on_blocked: BlockedHook<'_>) -> EngineResult<()>;
}

/// One physical open of a database.
pub trait Handle: Send + Sync {
    /// The database name.
    fn name(&self) -> &str;

    /// The on-disk version this handle was opened at.
    fn version(&self) -> u32;

    /// Names of the collections currently on disk.
    fn collection_names(&self) -> Vec<String>;

    /// Begins a transaction over the named collections.
    ///
    /// # Errors
    ///
    /// Returns [`crate::EngineError::UnknownCollection`] if any named
    /// collection does not exist, or [`crate::EngineError::Closed`] if
    /// the handle has been closed.
    fn begin<'a>(
        &'a self,
        collections: &[&str],
        mode: TxnMode,
    ) -> EngineResult<Box<dyn Transaction + 'a>>;

    /// Closes the handle. Idempotent.
    fn close(&self);
}

/// A transaction scope over named collections.
///
/// Writes are buffered and installed atomically by [`Transaction::commit`];
/// dropping a transaction without committing discards them.
pub trait Transaction: Send + Sync {
    /// The mode this transaction was opened with.
    fn mode(&self) -> TxnMode;

    /// Inserts a document, failing if its primary key already exists.
    ///
    /// Returns the extracted primary key.
    fn add(&mut self, collection: &str, document: &Document) -> EngineResult<Key>;

    /// Inserts or replaces a document by its primary key.
    fn put(&mut self, collection: &str, document: &Document) -> EngineResult<Key>;

    /// Fetches a document by primary key.
    fn get(&self, collection: &str, key: &Key) -> EngineResult<Option<Document>>;

    /// Fetches every document in the collection, in primary-key order.
    fn get_all(&self, collection: &str) -> EngineResult<Vec<Document>>;

    /// Deletes a document by primary key. Succeeds whether or not the key
    /// existed.
    fn delete(&mut self, collection: &str, key: &Key) -> EngineResult<()>;

    /// Removes every document in the collection.
    fn clear(&mut self, collection: &str) -> EngineResult<()>;

    /// Counts the documents in the collection.
    fn count(&self, collection: &str) -> EngineResult<u64>;

    /// Opens a forward cursor over a secondary index, bounded by `range`.
    ///
    /// Entries are visited in (index key, primary key) order.
    fn open_cursor<'a>(
        &'a self,
        collection: &str,
        index: &str,
        range: &KeyRange,
    ) -> EngineResult<Box<dyn Cursor + 'a>>;

    /// Commits buffered writes atomically.
    fn commit(self: Box<Self>) -> EngineResult<()>;

    /// Discards buffered writes.
    fn abort(self: Box<Self>);
}

/// A forward-only cursor over an index scan.
pub trait Cursor {
    /// Advances the cursor, returning the next document or `None` when
    /// the scan is exhausted.
    fn step(&mut self) -> EngineResult<Option<Document>>;
}

/// Structural operations available inside an upgrade transaction.
///
/// This is the only context in which collections and indexes may be
/// created or deleted. All changes commit or abort with the upgrade.
pub trait SchemaScope {
    /// Version on disk before this upgrade (0 for a fresh database).
    fn old_version(&self) -> u32;

    /// Version being upgraded to.
    fn new_version(&self) -> u32;

    /// Names of the collections currently present.
    fn collection_names(&self) -> Vec<String>;

    /// Names of the indexes on a collection.
    fn index_names(&self, collection: &str) -> EngineResult<Vec<String>>;

    /// Creates a collection keyed by `primary_key`.
    fn create_collection(&mut self, name: &str, primary_key: &str) -> EngineResult<()>;

    /// Deletes a collection and its records.
    fn delete_collection(&mut self, name: &str) -> EngineResult<()>;

    /// Creates an index over `field`. A unique index fails creation if
    /// existing records already collide on the field.
    fn create_index(&mut self, collection: &str, field: &str, unique: bool) -> EngineResult<()>;

    /// Deletes an index.
    fn delete_index(&mut self, collection: &str, field: &str) -> EngineResult<()>;
}
