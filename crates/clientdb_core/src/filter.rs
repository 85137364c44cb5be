//! Declarative filtering over secondary indexes.
//!
//! A filter map turns into one tagged predicate per field in a single
//! explicit parse step; unrecognized shapes fail with a parse error
//! before any scan starts. Each predicate then scans its own bounded
//! forward cursor, concurrently with its siblings, and the results are
//! merged.
//!
//! Two deliberate quirks of the contract, preserved as specified:
//! predicates combine with **OR** semantics (a two-field filter returns
//! records matching either field, not both), and the `sort`/`max`/
//! `paging` setters record intent that `run` never consults.

use crate::connection::ConnectionManager;
use crate::error::{DbError, DbResult};
use clientdb_engine::{Document, EngineError, EngineResult, Key, KeyRange, Transaction, TxnMode};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::thread;

/// One field-scoped condition within a filter map.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    /// Indexed field the condition applies to.
    pub property: String,
    /// The parsed condition.
    pub op: PredicateOp,
}

/// A parsed predicate condition.
#[derive(Debug, Clone, PartialEq)]
pub enum PredicateOp {
    /// Exact match.
    Equals(Key),
    /// Closed range, inclusive at both ends.
    Range(Key, Key),
    /// Greater-than comparison; `inclusive` makes it `gte`.
    GreaterThan {
        /// Lower bound.
        key: Key,
        /// Whether the bound itself matches.
        inclusive: bool,
    },
    /// Less-than comparison; `inclusive` makes it `lte`.
    LessThan {
        /// Upper bound.
        key: Key,
        /// Whether the bound itself matches.
        inclusive: bool,
    },
}

impl PredicateOp {
    fn to_range(&self) -> KeyRange {
        match self {
            PredicateOp::Equals(key) => KeyRange::only(key.clone()),
            PredicateOp::Range(from, to) => KeyRange::bound(from.clone(), to.clone()),
            PredicateOp::GreaterThan { key, inclusive } => {
                KeyRange::lower_bound(key.clone(), !inclusive)
            }
            PredicateOp::LessThan { key, inclusive } => {
                KeyRange::upper_bound(key.clone(), !inclusive)
            }
        }
    }
}

/// A per-predicate failure collected without aborting sibling scans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PredicateError {
    /// Field whose scan failed.
    pub property: String,
    /// Diagnostic message.
    pub message: String,
}

/// Aggregate result of a filter run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryOutcome {
    /// Matching records, deduplicated by primary key in encounter order.
    pub items: Vec<Document>,
    /// Failures of individual predicate scans.
    pub errors: Vec<PredicateError>,
}

/// A query over one collection's secondary indexes.
///
/// Built by `Store::filter`; configured with chainable setters; executed
/// with [`Filter::run`].
pub struct Filter {
    connection: ConnectionManager,
    collection: String,
    primary_key: String,
    queries: Map<String, Value>,
    orders: Vec<String>,
    limit: Option<usize>,
    page: Option<usize>,
}

impl Filter {
    pub(crate) fn new(
        connection: ConnectionManager,
        collection: String,
        primary_key: String,
        queries: Map<String, Value>,
    ) -> Self {
        Self {
            connection,
            collection,
            primary_key,
            queries,
            orders: Vec::new(),
            limit: None,
            page: None,
        }
    }

    /// Records an ordering intent. Not consulted by [`Filter::run`].
    #[must_use]
    pub fn sort(mut self, fields: &[&str]) -> Self {
        self.orders = fields.iter().map(|field| field.to_string()).collect();
        self
    }

    /// Records a result-count cap. Not consulted by [`Filter::run`].
    #[must_use]
    pub fn max(mut self, max: usize) -> Self {
        self.limit = Some(max);
        self
    }

    /// Records a page and page size. Not consulted by [`Filter::run`].
    #[must_use]
    pub fn paging(mut self, page: usize, size: usize) -> Self {
        self.page = Some(page);
        self.limit = Some(size);
        self
    }

    /// Recorded ordering fields.
    #[must_use]
    pub fn orders(&self) -> &[String] {
        &self.orders
    }

    /// Recorded result-count cap.
    #[must_use]
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Recorded page number.
    #[must_use]
    pub fn page(&self) -> Option<usize> {
        self.page
    }

    /// Executes the query.
    ///
    /// Parses the filter map first: a malformed predicate fails the
    /// whole run before any scan starts. Each predicate then scans its
    /// own cursor concurrently; per-predicate failures land in
    /// [`QueryOutcome::errors`] while sibling scans complete. Results
    /// merge with OR semantics, keeping the first-seen record per
    /// primary key. An empty filter map yields an empty result.
    pub fn run(&self) -> DbResult<QueryOutcome> {
        let predicates = parse_queries(&self.queries)?;
        if predicates.is_empty() {
            return Ok(QueryOutcome::default());
        }

        let connection = self.connection.acquire()?;
        let txn = connection
            .handle()
            .begin(&[&self.collection], TxnMode::ReadOnly)?;
        let txn_ref: &dyn Transaction = txn.as_ref();

        let scans: Vec<(String, EngineResult<Vec<Document>>)> = thread::scope(|scope| {
            let workers: Vec<_> = predicates
                .iter()
                .map(|predicate| {
                    scope.spawn(move || {
                        (
                            predicate.property.clone(),
                            scan_predicate(txn_ref, &self.collection, predicate),
                        )
                    })
                })
                .collect();
            workers
                .into_iter()
                .map(|worker| {
                    worker.join().unwrap_or_else(|_| {
                        (
                            String::from("<scan>"),
                            Err(EngineError::invalid_operation("predicate scan panicked")),
                        )
                    })
                })
                .collect()
        });
        drop(txn);
        drop(connection);

        let mut outcome = QueryOutcome::default();
        let mut seen: BTreeSet<Key> = BTreeSet::new();
        for (property, result) in scans {
            match result {
                Ok(documents) => {
                    for document in documents {
                        match document.get(&self.primary_key).and_then(Key::from_value) {
                            Some(key) => {
                                if seen.insert(key) {
                                    outcome.items.push(document);
                                }
                            }
                            None => outcome.items.push(document),
                        }
                    }
                }
                Err(error) => {
                    tracing::error!(
                        collection = %self.collection,
                        property = %property,
                        %error,
                        "predicate scan failed"
                    );
                    outcome.errors.push(PredicateError {
                        property,
                        message: error.to_string(),
                    });
                }
            }
        }
        Ok(outcome)
    }
}

fn scan_predicate(
    txn: &dyn Transaction,
    collection: &str,
    predicate: &Predicate,
) -> EngineResult<Vec<Document>> {
    let range = predicate.op.to_range();
    let mut cursor = txn.open_cursor(collection, &predicate.property, &range)?;
    let mut documents = Vec::new();
    while let Some(document) = cursor.step()? {
        documents.push(document);
    }
    Ok(documents)
}

/// Parses a filter map into tagged predicates.
///
/// A scalar value is an equality test, a two-element array a closed
/// range, and an object one of `eq`/`range`/`gt`/`gte`/`lt`/`lte` (first
/// recognized operator wins, in that order). Anything else is a parse
/// error.
pub fn parse_queries(queries: &Map<String, Value>) -> DbResult<Vec<Predicate>> {
    let mut predicates = Vec::with_capacity(queries.len());
    for (property, value) in queries {
        let op = match value {
            Value::String(_) | Value::Number(_) | Value::Bool(_) => {
                PredicateOp::Equals(scalar(property, value)?)
            }
            Value::Array(pair) if pair.len() == 2 => {
                PredicateOp::Range(scalar(property, &pair[0])?, scalar(property, &pair[1])?)
            }
            Value::Object(spec) => parse_operator(property, spec)?,
            other => {
                return Err(DbError::parse(format!(
                    "unable to parse predicate {property:?}: {other}"
                )))
            }
        };
        predicates.push(Predicate {
            property: property.clone(),
            op,
        });
    }
    Ok(predicates)
}

fn parse_operator(property: &str, spec: &Map<String, Value>) -> DbResult<PredicateOp> {
    if let Some(value) = spec.get("eq") {
        return Ok(PredicateOp::Equals(scalar(property, value)?));
    }
    if let Some(range) = spec.get("range") {
        let Value::Object(bounds) = range else {
            return Err(DbError::parse(format!(
                "predicate {property:?}: range needs {{from, to}}"
            )));
        };
        let (Some(from), Some(to)) = (bounds.get("from"), bounds.get("to")) else {
            return Err(DbError::parse(format!(
                "predicate {property:?}: range needs {{from, to}}"
            )));
        };
        return Ok(PredicateOp::Range(
            scalar(property, from)?,
            scalar(property, to)?,
        ));
    }
    if let Some(value) = spec.get("gt") {
        return Ok(PredicateOp::GreaterThan {
            key: scalar(property, value)?,
            inclusive: false,
        });
    }
    if let Some(value) = spec.get("gte") {
        return Ok(PredicateOp::GreaterThan {
            key: scalar(property, value)?,
            inclusive: true,
        });
    }
    if let Some(value) = spec.get("lt") {
        return Ok(PredicateOp::LessThan {
            key: scalar(property, value)?,
            inclusive: false,
        });
    }
    if let Some(value) = spec.get("lte") {
        return Ok(PredicateOp::LessThan {
            key: scalar(property, value)?,
            inclusive: true,
        });
    }
    Err(DbError::parse(format!(
        "predicate {property:?} has no recognized operator"
    )))
}

fn scalar(property: &str, value: &Value) -> DbResult<Key> {
    Key::from_value(value).ok_or_else(|| {
        DbError::parse(format!(
            "predicate {property:?} needs a scalar key, got {value}"
        ))
    })
}
