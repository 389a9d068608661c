//! Read-only snapshot of the live database schema.
//!
//! Loaded once per migration run and consumed by the compiler to resolve
//! column types (for cache-column defaults and array-type detection).
//! The compiler never mutates it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ast::TableId;

/// A column of a live table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    /// PostgreSQL type name as reported by the catalog, e.g. `bigint`,
    /// `numeric`, `text[]`.
    pub type_name: String,
}

impl ColumnDef {
    pub fn new(name: &str, type_name: &str) -> Self {
        ColumnDef {
            name: name.to_string(),
            type_name: type_name.to_string(),
        }
    }

    pub fn is_array(&self) -> bool {
        self.type_name.ends_with("[]")
    }
}

/// A live table with its columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    pub id: TableId,
    pub columns: Vec<ColumnDef>,
}

impl TableDef {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// All tables loaded from the live database.
#[derive(Debug, Clone, Default)]
pub struct SchemaSnapshot {
    tables: BTreeMap<TableId, TableDef>,
}

impl SchemaSnapshot {
    pub fn new() -> Self {
        SchemaSnapshot::default()
    }

    pub fn add_table(&mut self, table: TableDef) {
        self.tables.insert(table.id.clone(), table);
    }

    pub fn get_table(&self, id: &TableId) -> Option<&TableDef> {
        self.tables.get(id)
    }

    pub fn column_type(&self, id: &TableId, column: &str) -> Option<&str> {
        self.get_table(id)?
            .column(column)
            .map(|c| c.type_name.as_str())
    }

    /// Whether the column exists and is an array type.
    pub fn is_array_column(&self, id: &TableId, column: &str) -> bool {
        self.get_table(id)
            .and_then(|t| t.column(column))
            .is_some_and(ColumnDef::is_array)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> SchemaSnapshot {
        let mut snapshot = SchemaSnapshot::new();
        snapshot.add_table(TableDef {
            id: TableId::parse("orders"),
            columns: vec![
                ColumnDef::new("id", "bigint"),
                ColumnDef::new("profit", "numeric"),
                ColumnDef::new("client_ids", "bigint[]"),
            ],
        });
        snapshot
    }

    #[test]
    fn test_column_type_lookup() {
        let snapshot = snapshot();
        let orders = TableId::parse("orders");
        assert_eq!(snapshot.column_type(&orders, "profit"), Some("numeric"));
        assert_eq!(snapshot.column_type(&orders, "missing"), None);
    }

    #[test]
    fn test_array_detection() {
        let snapshot = snapshot();
        let orders = TableId::parse("orders");
        assert!(snapshot.is_array_column(&orders, "client_ids"));
        assert!(!snapshot.is_array_column(&orders, "profit"));
    }
}
