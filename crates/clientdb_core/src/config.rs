//! Store configuration.

use crate::error::DbError;
use crate::schema::StoreSchema;
use serde::{Deserialize, Serialize};

/// Configuration for opening a store.
///
/// Defaults are explicit: name `"default"`, version `1`, schema updates
/// disallowed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// Database name.
    pub name: String,

    /// Declared schema version. Opening with a version above the on-disk
    /// one triggers reconciliation.
    pub version: u32,

    /// Whether the explicit schema-evolution surface
    /// (`create_store`/`remove_store`/`update_keys`) is permitted.
    pub allow_schema_update: bool,

    /// Declared collection layouts.
    pub stores: Vec<StoreSchema>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            version: 1,
            allow_schema_update: false,
            stores: Vec::new(),
        }
    }
}

impl Options {
    /// Creates options with default values and no declared stores.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the database name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the declared version.
    #[must_use]
    pub const fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Permits the explicit schema-evolution surface.
    #[must_use]
    pub const fn allow_schema_update(mut self, value: bool) -> Self {
        self.allow_schema_update = value;
        self
    }

    /// Declares a collection.
    #[must_use]
    pub fn store(mut self, schema: StoreSchema) -> Self {
        self.stores.push(schema);
        self
    }
}

/// Hook invoked after each successful physical open, with the version.
pub type SuccessHook = Box<dyn Fn(u32) + Send + Sync>;

/// Hook invoked when a physical open fails.
pub type ErrorHook = Box<dyn Fn(&DbError) + Send + Sync>;

/// Optional open-outcome callbacks.
#[derive(Default)]
pub struct Callbacks {
    /// Called with the opened version after every successful open.
    pub on_success: Option<SuccessHook>,
    /// Called with the failure after every failed open.
    pub on_error: Option<ErrorHook>,
}

impl Callbacks {
    /// Creates empty callbacks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the success hook.
    #[must_use]
    pub fn on_success(mut self, hook: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Box::new(hook));
        self
    }

    /// Sets the error hook.
    #[must_use]
    pub fn on_error(mut self, hook: impl Fn(&DbError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(hook));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_explicit() {
        let options = Options::default();
        assert_eq!(options.name, "default");
        assert_eq!(options.version, 1);
        assert!(!options.allow_schema_update);
        assert!(options.stores.is_empty());
    }

    #[test]
    fn builder_pattern() {
        let options = Options::new()
            .name("app")
            .version(3)
            .allow_schema_update(true)
            .store(StoreSchema::new("users"));

        assert_eq!(options.name, "app");
        assert_eq!(options.version, 3);
        assert!(options.allow_schema_update);
        assert_eq!(options.stores.len(), 1);
    }
}
