//! # clientdb
//!
//! A client-side embedded document-storage layer built on a
//! host-provided transactional, versioned key-value engine.
//!
//! This crate provides:
//! - Named collections with primary keys and secondary indexes
//! - CRUD with per-mutation domain events
//! - Declarative multi-field filtering over concurrent index scans
//! - Schema reconciliation across versions, with no partial commits
//! - A reference-counted connection lifecycle with pending-open waiters
//!
//! The storage engine itself is an external collaborator consumed
//! through the [`clientdb_engine`] traits; tests and ephemeral stores
//! use its in-memory engine.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod connection;
mod database;
mod error;
mod events;
mod filter;
mod schema;
mod store;

pub use config::{Callbacks, ErrorHook, Options, SuccessHook};
pub use connection::{ConnectionManager, ConnectionRef, PhaseKind};
pub use database::ClientDb;
pub use error::{DbError, DbResult};
pub use events::{EventBus, Trigger, TriggerFn};
pub use filter::{parse_queries, Filter, Predicate, PredicateError, PredicateOp, QueryOutcome};
pub use schema::{IndexSpec, KeyType, ReconcileReport, SchemaReconciler, StoreSchema};
pub use store::{Changes, MutationOutcome, RecordError, RemoveSpec, RemoveTarget, Store};

pub use clientdb_engine::{Document, Key};
