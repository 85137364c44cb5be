//! Ordered scalar keys and bounded key ranges.
//!
//! Indexes and primary keys order records by [`Key`]. The order is total:
//! booleans sort before numbers, numbers before strings, and numbers
//! compare via `f64::total_cmp` so every value participates in the order.

use crate::error::{EngineError, EngineResult};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

/// A scalar key usable as a primary key or index key.
///
/// Only boolean, numeric, and string JSON values are valid keys. Objects,
/// arrays, and null are rejected by [`Key::from_value`].
#[derive(Debug, Clone)]
pub enum Key {
    /// Boolean key. Sorts before all numbers.
    Bool(bool),
    /// Numeric key. Sorts before all strings.
    Number(f64),
    /// String key.
    Text(String),
}

impl Key {
    /// Extracts a key from a JSON value.
    ///
    /// Returns `None` for null, arrays, and objects.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(Key::Bool(*b)),
            Value::Number(n) => n.as_f64().map(Key::Number),
            Value::String(s) => Some(Key::Text(s.clone())),
            _ => None,
        }
    }

    /// Extracts a key from a JSON value, erroring on non-scalar shapes.
    pub fn try_from_value(value: &Value) -> EngineResult<Self> {
        Self::from_value(value)
            .ok_or_else(|| EngineError::invalid_key(format!("{value} is not a scalar key")))
    }

    fn rank(&self) -> u8 {
        match self {
            Key::Bool(_) => 0,
            Key::Number(_) => 1,
            Key::Text(_) => 2,
        }
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Key::Bool(a), Key::Bool(b)) => a.cmp(b),
            (Key::Number(a), Key::Number(b)) => a.total_cmp(b),
            (Key::Text(a), Key::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Bool(b) => write!(f, "{b}"),
            Key::Number(n) => write!(f, "{n}"),
            Key::Text(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::Text(value.to_string())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::Text(value)
    }
}

impl From<f64> for Key {
    fn from(value: f64) -> Self {
        Key::Number(value)
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Key::Number(value as f64)
    }
}

impl From<bool> for Key {
    fn from(value: bool) -> Self {
        Key::Bool(value)
    }
}

/// One end of a key range.
#[derive(Debug, Clone, PartialEq)]
pub struct Bound {
    /// The bounding key.
    pub key: Key,
    /// Whether the bound itself is excluded from the range.
    pub open: bool,
}

/// A bounded key interval for cursor scans.
///
/// Mirrors the engine-level range primitives: a point range, a closed
/// two-sided range, or a half-bounded range open or closed at its end.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KeyRange {
    /// Lower end, `None` when unbounded below.
    pub lower: Option<Bound>,
    /// Upper end, `None` when unbounded above.
    pub upper: Option<Bound>,
}

impl KeyRange {
    /// A range matching exactly one key.
    #[must_use]
    pub fn only(key: Key) -> Self {
        Self {
            lower: Some(Bound {
                key: key.clone(),
                open: false,
            }),
            upper: Some(Bound { key, open: false }),
        }
    }

    /// A closed range `[from, to]` inclusive at both ends.
    #[must_use]
    pub fn bound(from: Key, to: Key) -> Self {
        Self {
            lower: Some(Bound {
                key: from,
                open: false,
            }),
            upper: Some(Bound {
                key: to,
                open: false,
            }),
        }
    }

    /// A half-range with only a lower end; `open` excludes the bound.
    #[must_use]
    pub fn lower_bound(key: Key, open: bool) -> Self {
        Self {
            lower: Some(Bound { key, open }),
            upper: None,
        }
    }

    /// A half-range with only an upper end; `open` excludes the bound.
    #[must_use]
    pub fn upper_bound(key: Key, open: bool) -> Self {
        Self {
            lower: None,
            upper: Some(Bound { key, open }),
        }
    }

    /// Checks whether `key` falls inside the range.
    #[must_use]
    pub fn contains(&self, key: &Key) -> bool {
        if let Some(lower) = &self.lower {
            match key.cmp(&lower.key) {
                Ordering::Less => return false,
                Ordering::Equal if lower.open => return false,
                _ => {}
            }
        }
        if let Some(upper) = &self.upper {
            match key.cmp(&upper.key) {
                Ordering::Greater => return false,
                Ordering::Equal if upper.open => return false,
                _ => {}
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn scalar_values_convert() {
        assert_eq!(Key::from_value(&json!("a")), Some(Key::Text("a".into())));
        assert_eq!(Key::from_value(&json!(3)), Some(Key::Number(3.0)));
        assert_eq!(Key::from_value(&json!(true)), Some(Key::Bool(true)));
    }

    #[test]
    fn non_scalar_values_rejected() {
        assert_eq!(Key::from_value(&json!(null)), None);
        assert_eq!(Key::from_value(&json!([1, 2])), None);
        assert_eq!(Key::from_value(&json!({"a": 1})), None);
        assert!(Key::try_from_value(&json!(null)).is_err());
    }

    #[test]
    fn cross_type_ordering() {
        assert!(Key::Bool(true) < Key::Number(0.0));
        assert!(Key::Number(f64::MAX) < Key::Text(String::new()));
    }

    #[test]
    fn only_range_is_a_point() {
        let range = KeyRange::only(Key::from(5i64));
        assert!(range.contains(&Key::from(5i64)));
        assert!(!range.contains(&Key::from(4i64)));
        assert!(!range.contains(&Key::from(6i64)));
    }

    #[test]
    fn closed_bound_includes_both_ends() {
        let range = KeyRange::bound(Key::from(20i64), Key::from(50i64));
        assert!(range.contains(&Key::from(20i64)));
        assert!(range.contains(&Key::from(30i64)));
        assert!(range.contains(&Key::from(50i64)));
        assert!(!range.contains(&Key::from(51i64)));
    }

    #[test]
    fn open_lower_bound_excludes_its_key() {
        let range = KeyRange::lower_bound(Key::from(20i64), true);
        assert!(!range.contains(&Key::from(20i64)));
        assert!(range.contains(&Key::from(21i64)));
    }

    #[test]
    fn closed_upper_bound_includes_its_key() {
        let range = KeyRange::upper_bound(Key::from(20i64), false);
        assert!(range.contains(&Key::from(20i64)));
        assert!(!range.contains(&Key::from(21i64)));
    }

    proptest! {
        #[test]
        fn number_ordering_is_total(a in proptest::num::f64::ANY, b in proptest::num::f64::ANY) {
            let (ka, kb) = (Key::Number(a), Key::Number(b));
            let forward = ka.cmp(&kb);
            let backward = kb.cmp(&ka);
            prop_assert_eq!(forward, backward.reverse());
        }

        #[test]
        fn closed_range_agrees_with_cmp(v in -1000i64..1000, lo in -1000i64..1000, hi in -1000i64..1000) {
            let range = KeyRange::bound(Key::from(lo), Key::from(hi));
            let expected = v >= lo && v <= hi;
            prop_assert_eq!(range.contains(&Key::from(v)), expected);
        }
    }
}
