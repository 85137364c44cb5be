//! # clientdb engine contract
//!
//! The transactional, versioned key-value engine surface consumed by
//! `clientdb_core`, plus an in-memory reference engine.
//!
//! This crate provides:
//! - [`Engine`], [`Handle`], [`Transaction`], [`Cursor`], [`SchemaScope`]:
//!   the host-engine contract (opens with upgrade hooks, bounded index
//!   cursors, schema-change transactions)
//! - [`Key`] and [`KeyRange`]: ordered scalar keys and scan bounds
//! - [`MemoryEngine`]: a non-durable engine for tests and ephemeral stores

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod key;
mod memory;
mod traits;

pub use error::{EngineError, EngineResult};
pub use key::{Bound, Key, KeyRange};
pub use memory::MemoryEngine;
pub use traits::{
    BlockedEvent, BlockedHook, Cursor, Document, Engine, Handle, SchemaScope, Transaction, TxnMode,
    UpgradeHook,
};
