//! Relationship schema used for delete cascades and full flushes.

use std::collections::{BTreeMap, BTreeSet};

/// Knows which tables reference which.
///
/// Deleting rows of a table can silently delete or null out rows of every
/// table returned by [`RelationSchema::related_tables`], so those are
/// invalidated too. Which foreign-key directions count is up to the
/// implementation.
pub trait RelationSchema: Send + Sync {
    /// Tables whose rows may change when rows of `table` are deleted.
    fn related_tables(&self, table: &str) -> BTreeSet<String>;

    /// Every table the schema knows about.
    fn all_tables(&self) -> BTreeSet<String>;
}

/// A schema declared up front.
#[derive(Debug, Clone, Default)]
pub struct StaticSchema {
    tables: BTreeSet<String>,
    /// referenced table -> tables holding a foreign key to it
    referenced_by: BTreeMap<String, BTreeSet<String>>,
}

impl StaticSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.tables.insert(table.into());
        self
    }

    /// Declare that `from` holds a foreign key to `to`.
    pub fn foreign_key(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        let (from, to) = (from.into(), to.into());
        self.tables.insert(from.clone());
        self.tables.insert(to.clone());
        self.referenced_by.entry(to).or_default().insert(from);
        self
    }
}

impl RelationSchema for StaticSchema {
    fn related_tables(&self, table: &str) -> BTreeSet<String> {
        self.referenced_by.get(table).cloned().unwrap_or_default()
    }

    fn all_tables(&self) -> BTreeSet<String> {
        self.tables.clone()
    }
}
