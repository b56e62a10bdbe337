//! # Catalog
//!
//! Schema and table statistics used by statistics derivation (scans) and by rules that
//! need column lists. The optimizer only sees the [`Catalog`] trait; backends are
//! external. [`InMemoryCatalog`] is populated programmatically and used by tests.

use crate::expr::{ColumnRef, TableRef};
use crate::stats::Statistics;
use std::collections::HashMap;

/// Read-only metadata source. Lookups of unknown tables return `None`.
pub trait Catalog: Send + Sync {
    fn get_table_stats(&self, table: &TableRef) -> Option<Statistics>;
    fn get_table_columns(&self, table: &TableRef) -> Option<Vec<ColumnRef>>;
}

/// Map-backed catalog keyed by table reference.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    tables: HashMap<TableRef, (Vec<ColumnRef>, Statistics)>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(&mut self, table: &TableRef, columns: Vec<ColumnRef>, stats: Statistics) {
        self.tables.insert(table.clone(), (columns, stats));
    }

    /// Builder form of [`InMemoryCatalog::add_table`].
    pub fn with_table(mut self, table: &TableRef, columns: Vec<ColumnRef>, stats: Statistics) -> Self {
        self.add_table(table, columns, stats);
        self
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

impl Catalog for InMemoryCatalog {
    fn get_table_stats(&self, table: &TableRef) -> Option<Statistics> {
        self.tables.get(table).map(|(_, stats)| stats.clone())
    }

    fn get_table_columns(&self, table: &TableRef) -> Option<Vec<ColumnRef>> {
        self.tables.get(table).map(|(cols, _)| cols.clone())
    }
}
