//! Cache compilation: definition text to database objects.
//!
//! [`compile_cache`] runs one definition through the full pipeline
//! (parse, lint, dependency analysis, aggregate decomposition, trigger
//! synthesis). [`compile_all`] compiles a set of definitions together,
//! ordering dependent caches after the caches whose columns they read.
//! Compilation is pure: nothing here touches a database.

use std::collections::BTreeSet;

use crate::agg::{ColumnPlan, create_aggregations};
use crate::ast::{Cache, Expr};
use crate::deps::{DependencyMap, Resolver, find_dependencies};
use crate::error::PgDenormError;
use crate::graph::{CacheNode, order_caches};
use crate::lint::lint_cache;
use crate::objects::{CacheColumn, CacheIndexArtifact};
use crate::parser::{parse_cache, parse_caches};
use crate::schema::SchemaSnapshot;
use crate::trigger::{TriggerPair, build_triggers, truncate_ident, winner_column};

/// A fully compiled cache: everything the migrator needs to install it.
#[derive(Debug, Clone)]
pub struct CompiledCache {
    pub cache: Cache,
    /// Normalized definition text; its hash is the change signature.
    pub definition: String,
    pub deps: DependencyMap,
    pub plans: Vec<ColumnPlan>,
    pub columns: Vec<CacheColumn>,
    pub triggers: Vec<TriggerPair>,
    pub indexes: Vec<CacheIndexArtifact>,
    /// Topological level among the compiled set (0 when compiled alone).
    pub level: usize,
}

impl CompiledCache {
    pub fn name(&self) -> &str {
        &self.cache.name
    }

    /// Names of every generated column, helpers and winner included.
    pub fn generated_columns(&self) -> BTreeSet<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    fn is_last_row(&self) -> bool {
        self.cache.select.limit.is_some() && !self.cache.select.order_by.is_empty()
    }

    fn is_self_row(&self) -> bool {
        self.cache
            .select
            .single_from_table()
            .is_some_and(|s| s.table == self.cache.for_table.table)
    }

    /// One batched backfill statement: recompute every generated column
    /// for the next `limit` target rows (keyed past `offset`). The caller
    /// loops while the affected row count equals `limit`.
    pub fn backfill_sql(&self, limit: u64, offset: u64) -> String {
        let table = &self.cache.for_table.table;
        let set = self
            .backfill_set()
            .into_iter()
            .map(|(column, expr)| format!("{column} = {}", expr.to_sql()))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "update {table} set {set} where {table}.id in \
             (select id from {table} order by id limit {limit} offset {offset})"
        )
    }

    /// Full-recompute value per generated column, correlated to the row
    /// being updated. Composed columns inline their per-call subqueries
    /// because every SET expression reads the pre-update row.
    fn backfill_set(&self) -> Vec<(String, Expr)> {
        let cache = &self.cache;
        let target_ident = cache.for_table.ident().to_string();
        let table_name = cache.for_table.table.name.clone();
        let mut out: Vec<(String, Expr)> = Vec::new();

        for plan in &self.plans {
            let mut computed: std::collections::BTreeMap<String, Expr> =
                std::collections::BTreeMap::new();
            for agg in &plan.aggregations {
                let select = crate::ast::Select {
                    columns: vec![crate::ast::SelectColumn {
                        expr: Expr::FuncCall(agg.call.clone()),
                        alias: None,
                    }],
                    from: cache.select.from.clone(),
                    joins: cache.select.joins.clone(),
                    where_clause: cache.select.where_clause.clone(),
                    ..Default::default()
                }
                .replace_table(&target_ident, &table_name);
                let mut value = Expr::ScalarSubquery(Box::new(select));
                if agg.default_value() != "null" {
                    value = Expr::func("coalesce", vec![value, Expr::literal(agg.default_value())]);
                }
                computed.insert(agg.column.clone(), value.clone());
                out.push((agg.column.clone(), value));
            }
            if let Some(expr) = &plan.expr_over_aggs {
                let value = if self.is_self_row() {
                    expr.replace_table(&target_ident, &table_name)
                } else if self.is_last_row() {
                    self.scan_value(expr.clone())
                } else {
                    expr.replace_table(&target_ident, &table_name)
                        .rewrite(&mut |node| {
                            if let Expr::ColumnRef {
                                table: Some(_),
                                column,
                            } = node
                            {
                                computed.get(column).cloned()
                            } else {
                                None
                            }
                        })
                };
                out.push((plan.name.clone(), value));
            }
        }
        if self.is_last_row()
            && let Some(source) = cache.select.single_from_table()
        {
            let id = Expr::column(source.ident(), "id");
            out.push((winner_column(cache), self.scan_value(id)));
        }
        out
    }

    /// `(select <expr> from <source> where … order by … limit 1)` for
    /// last-row columns.
    fn scan_value(&self, expr: Expr) -> Expr {
        let cache = &self.cache;
        let select = crate::ast::Select {
            columns: vec![crate::ast::SelectColumn { expr, alias: None }],
            from: cache.select.from.clone(),
            where_clause: cache.select.where_clause.clone(),
            order_by: cache.select.order_by.clone(),
            limit: cache.select.limit.clone(),
            ..Default::default()
        }
        .replace_table(cache.for_table.ident(), &cache.for_table.table.name);
        Expr::ScalarSubquery(Box::new(select))
    }
}

/// Compile a single definition in isolation.
pub fn compile_cache(
    text: &str,
    snapshot: Option<&SchemaSnapshot>,
) -> Result<CompiledCache, PgDenormError> {
    compile_cache_at(text, snapshot, 0)
}

/// Compile a single definition at a known topological level. The
/// migrator uses this to reconstruct the object names of a previously
/// applied cache from its stored definition and level, so drops hit the
/// names actually installed.
pub fn compile_cache_at(
    text: &str,
    snapshot: Option<&SchemaSnapshot>,
    level: usize,
) -> Result<CompiledCache, PgDenormError> {
    let cache = parse_cache(text)?;
    finish(cache, snapshot, level)
}

/// Compile a set of `;`-separated definitions, ordered so that a cache
/// reading another cache's generated column compiles after it. Mutual
/// references fail with [`PgDenormError::CircularDependency`].
pub fn compile_all(
    text: &str,
    snapshot: Option<&SchemaSnapshot>,
) -> Result<Vec<CompiledCache>, PgDenormError> {
    let caches = parse_caches(text)?;
    let mut compiled: Vec<CompiledCache> = caches
        .into_iter()
        .map(|cache| finish(cache, snapshot, 0))
        .collect::<Result<_, _>>()?;

    let nodes: Vec<CacheNode> = compiled
        .iter()
        .map(|c| CacheNode {
            name: c.cache.name.clone(),
            target: c.cache.for_table.table.clone(),
            provides: c.generated_columns(),
            reads: c.deps.clone(),
        })
        .collect();
    let order = order_caches(&nodes)?;

    // Rebuild the leveled target-side triggers now that levels are known.
    for (idx, level) in order.levels.iter().enumerate() {
        if *level != compiled[idx].level {
            compiled[idx].level = *level;
            compiled[idx].triggers = build_triggers(
                &compiled[idx].cache,
                &compiled[idx].deps,
                &compiled[idx].plans,
                snapshot,
                *level,
            )?;
        }
    }

    Ok(order
        .sequence
        .iter()
        .map(|&idx| compiled[idx].clone())
        .collect())
}

fn finish(
    cache: Cache,
    snapshot: Option<&SchemaSnapshot>,
    level: usize,
) -> Result<CompiledCache, PgDenormError> {
    lint_cache(&cache)?;
    let deps = find_dependencies(&cache)?;
    let plans: Vec<ColumnPlan> = cache
        .select
        .columns
        .iter()
        .map(|column| create_aggregations(&cache, column, snapshot))
        .collect::<Result<_, _>>()?;

    let columns = cache_columns(&cache, &plans, snapshot);
    let triggers = build_triggers(&cache, &deps, &plans, snapshot, level)?;
    let indexes = cache_indexes(&cache);
    let definition = cache.to_sql();

    Ok(CompiledCache {
        cache,
        definition,
        deps,
        plans,
        columns,
        triggers,
        indexes,
        level,
    })
}

/// Generated columns for the target table: one per stored aggregation,
/// one per composed expression column, plus the hidden winner column for
/// last-row caches.
fn cache_columns(
    cache: &Cache,
    plans: &[ColumnPlan],
    snapshot: Option<&SchemaSnapshot>,
) -> Vec<CacheColumn> {
    let target = cache.for_table.table.clone();
    let mut out = Vec::new();
    for plan in plans {
        for agg in &plan.aggregations {
            out.push(CacheColumn {
                table: target.clone(),
                name: agg.column.clone(),
                type_name: agg.type_name.clone(),
                default: agg.default_value().to_string(),
                visible: agg.visible,
            });
        }
        if plan.expr_over_aggs.is_some() {
            let type_name = plan
                .expr_over_aggs
                .as_ref()
                .map(|expr| expr_type(expr, cache, snapshot))
                .unwrap_or_else(|| "text".to_string());
            out.push(CacheColumn {
                table: target.clone(),
                name: plan.name.clone(),
                type_name,
                default: "null".to_string(),
                visible: true,
            });
        }
    }
    if cache.select.limit.is_some() && !cache.select.order_by.is_empty() {
        out.push(CacheColumn {
            table: target,
            name: winner_column(cache),
            type_name: "bigint".to_string(),
            default: "null".to_string(),
            visible: false,
        });
    }
    out
}

fn cache_indexes(cache: &Cache) -> Vec<CacheIndexArtifact> {
    cache
        .indexes
        .iter()
        .enumerate()
        .map(|(i, index)| CacheIndexArtifact {
            name: truncate_ident(&format!(
                "cm_idx_{}_{}_{}",
                cache.name,
                cache.for_table.table.name,
                i + 1
            )),
            table: cache.for_table.table.clone(),
            method: index.method.clone(),
            columns: index.columns.clone(),
        })
        .collect()
}

/// Best-effort column type for a non-aggregate expression. The migrator
/// reuses the live column's type when one already exists, so this only
/// has to be right for the first install.
fn expr_type(expr: &Expr, cache: &Cache, snapshot: Option<&SchemaSnapshot>) -> String {
    match expr {
        Expr::ColumnRef { table, column } => {
            let resolver = Resolver::new(cache);
            resolver
                .resolve(table.as_deref(), column)
                .ok()
                .and_then(|t| snapshot?.column_type(&t.table, column).map(str::to_string))
                .unwrap_or_else(|| "text".to_string())
        }
        Expr::Cast { type_name, .. } => type_name.clone(),
        Expr::Literal(text) => {
            if text.starts_with('\'') {
                "text".to_string()
            } else if text == "true" || text == "false" {
                "boolean".to_string()
            } else {
                "numeric".to_string()
            }
        }
        Expr::BinaryOp { op, left, .. } => match op.as_str() {
            "+" | "-" | "*" | "/" | "%" => "numeric".to_string(),
            "||" => expr_type(left, cache, snapshot),
            _ => "boolean".to_string(),
        },
        Expr::Case {
            when_then,
            else_expr,
        } => when_then
            .first()
            .map(|(_, then)| expr_type(then, cache, snapshot))
            .or_else(|| else_expr.as_ref().map(|e| expr_type(e, cache, snapshot)))
            .unwrap_or_else(|| "text".to_string()),
        Expr::FuncCall(call) if call.name == "coalesce" => call
            .args
            .first()
            .map(|a| expr_type(a, cache, snapshot))
            .unwrap_or_else(|| "text".to_string()),
        _ => "numeric".to_string(),
    }
}
