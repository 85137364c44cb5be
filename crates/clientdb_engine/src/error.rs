//! Error types for the engine contract.

use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors reported by a storage engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An open requested a version older than the one on disk.
    #[error("version mismatch: requested {requested}, database is at {current}")]
    VersionMismatch {
        /// Version the caller asked for.
        requested: u32,
        /// Version currently on disk.
        current: u32,
    },

    /// A transaction or cursor named a collection that does not exist.
    #[error("unknown collection: {name}")]
    UnknownCollection {
        /// Name of the missing collection.
        name: String,
    },

    /// A cursor open named an index that does not exist on the collection.
    #[error("unknown index {index} on collection {collection}")]
    UnknownIndex {
        /// Collection that was searched.
        collection: String,
        /// Index name that was not found.
        index: String,
    },

    /// A write violated the primary key or a unique index.
    #[error("constraint violation on {collection}.{property}: {message}")]
    Constraint {
        /// Collection the write targeted.
        collection: String,
        /// Field whose constraint was violated.
        property: String,
        /// Description of the violation.
        message: String,
    },

    /// A record's key field is missing or not a scalar key.
    #[error("invalid key: {message}")]
    InvalidKey {
        /// Description of the problem.
        message: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// The handle or database has been closed.
    #[error("engine handle is closed")]
    Closed,
}

impl EngineError {
    /// Creates a constraint violation error.
    pub fn constraint(
        collection: impl Into<String>,
        property: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Constraint {
            collection: collection.into(),
            property: property.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid key error.
    pub fn invalid_key(message: impl Into<String>) -> Self {
        Self::InvalidKey {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an unknown collection error.
    pub fn unknown_collection(name: impl Into<String>) -> Self {
        Self::UnknownCollection { name: name.into() }
    }

    /// Creates an unknown index error.
    pub fn unknown_index(collection: impl Into<String>, index: impl Into<String>) -> Self {
        Self::UnknownIndex {
            collection: collection.into(),
            index: index.into(),
        }
    }
}
