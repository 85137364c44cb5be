//! Error types for the document layer.

use clientdb_engine::EngineError;
use thiserror::Error;

/// Result type for document-layer operations.
pub type DbResult<T> = Result<T, DbError>;

/// Errors surfaced to callers of the document layer.
///
/// Per-record and per-predicate failures are not errors in this sense:
/// they are collected into operation outcomes. A blocked open is not an
/// error either; it is logged and the open stays pending.
#[derive(Debug, Error)]
pub enum DbError {
    /// A filter predicate or removal target had an unrecognizable shape.
    #[error("parse error: {message}")]
    Parse {
        /// Description of the malformed input.
        message: String,
    },

    /// An update named a primary key with no stored record.
    #[error("record {key} not found")]
    NotFound {
        /// The missing primary key, rendered for display.
        key: String,
    },

    /// A schema-evolution call conflicted with the declared layout.
    #[error("schema conflict on {store}: {message}")]
    SchemaConflict {
        /// Collection the call targeted.
        store: String,
        /// Description of the conflict.
        message: String,
    },

    /// An opaque engine failure.
    #[error("engine error: {message}")]
    Engine {
        /// The engine's diagnostic message.
        message: String,
    },

    /// The store has been destroyed or its connection closed.
    #[error("store is closed: {message}")]
    Closed {
        /// Description of the terminal state.
        message: String,
    },
}

impl DbError {
    /// Creates a parse error.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(key: impl ToString) -> Self {
        Self::NotFound {
            key: key.to_string(),
        }
    }

    /// Creates a schema conflict error.
    pub fn schema_conflict(store: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SchemaConflict {
            store: store.into(),
            message: message.into(),
        }
    }

    /// Creates a closed error.
    pub fn closed(message: impl Into<String>) -> Self {
        Self::Closed {
            message: message.into(),
        }
    }
}

impl From<EngineError> for DbError {
    fn from(error: EngineError) -> Self {
        Self::Engine {
            message: error.to_string(),
        }
    }
}
