//! Dependency resolution for cache selects.
//!
//! [`find_dependencies`] walks every column reference reachable from the
//! select tree and records, per referenced table, the distinct column
//! names touched. The cache's own target table is always present, seeded
//! with its `id` column (triggers match target rows by primary key).
//!
//! Resolution is pure and total over a linted cache: an unresolved
//! reference here indicates a linter gap, not an expected runtime
//! condition, and surfaces as [`PgDenormError::UnresolvedReference`].

use std::collections::{BTreeMap, BTreeSet};

use crate::ast::{Cache, Expr, TableId, TableRef};
use crate::error::PgDenormError;

/// `table identity -> sorted unique column names` for one cache.
pub type DependencyMap = BTreeMap<TableId, BTreeSet<String>>;

/// Resolves column qualifiers against a cache's declared sources and its
/// target table.
pub struct Resolver<'a> {
    cache: &'a Cache,
    sources: Vec<&'a TableRef>,
}

impl<'a> Resolver<'a> {
    pub fn new(cache: &'a Cache) -> Self {
        Resolver {
            cache,
            sources: cache.select.sources(),
        }
    }

    /// Resolve a column reference to the table it reads from.
    ///
    /// Qualified references match FROM/JOIN sources first, then the
    /// target table. Unqualified references are allowed only when the
    /// select has a single source and no joins.
    pub fn resolve(
        &self,
        qualifier: Option<&str>,
        column: &str,
    ) -> Result<&'a TableRef, PgDenormError> {
        match qualifier {
            Some(qualifier) => {
                if let Some(source) = self.sources.iter().find(|s| s.matches(qualifier)) {
                    return Ok(source);
                }
                if self.cache.for_table.matches(qualifier) {
                    return Ok(&self.cache.for_table);
                }
                Err(PgDenormError::UnresolvedReference(format!(
                    "{qualifier}.{column} does not match any from item or the cache target table"
                )))
            }
            None => {
                if let Some(only) = self.cache.select.single_from_table() {
                    return Ok(only);
                }
                Err(PgDenormError::UnresolvedReference(format!(
                    "column reference '{column}' must be table-qualified when the select has \
                     several sources"
                )))
            }
        }
    }

    /// Whether the resolved table is the cache's target table.
    pub fn is_target(&self, table_ref: &TableRef) -> bool {
        table_ref.table == self.cache.for_table.table
    }

    /// The declared FROM/JOIN sources, in declaration order.
    pub fn sources(&self) -> &[&'a TableRef] {
        &self.sources
    }
}

/// Build the dependency map for a linted cache.
///
/// Every table referenced anywhere in the select (FROM, JOIN, WHERE,
/// aggregate arguments, ORDER BY) appears as a key, even with an empty
/// column set. The target table's `id` is always included.
pub fn find_dependencies(cache: &Cache) -> Result<DependencyMap, PgDenormError> {
    let resolver = Resolver::new(cache);
    let mut map: DependencyMap = BTreeMap::new();

    let mut target_columns = BTreeSet::new();
    target_columns.insert("id".to_string());
    map.insert(cache.for_table.table.clone(), target_columns);

    for source in cache.select.sources() {
        map.entry(source.table.clone()).or_default();
    }

    let mut first_error: Option<PgDenormError> = None;
    cache.select.for_each_expr(&mut |expr| {
        if first_error.is_some() {
            return;
        }
        if let Expr::ColumnRef { table, column } = expr {
            match resolver.resolve(table.as_deref(), column) {
                Ok(table_ref) => {
                    map.entry(table_ref.table.clone())
                        .or_default()
                        .insert(column.clone());
                }
                Err(err) => first_error = Some(err),
            }
        }
    });
    if let Some(err) = first_error {
        return Err(err);
    }
    Ok(map)
}
