//! Aggregate decomposition and incremental delta algebra.
//!
//! [`create_aggregations`] decomposes each aggregate call in a select
//! column into one or more stored [`Aggregation`]s, each knowing how to
//! emit a `plus` and `minus` SQL expression (the incremental delta) and a
//! default value.
//!
//! Two families exist:
//! - **Commutative** aggregates (`count`, `sum`, plain `array_agg`) apply
//!   a pure plus/minus over the previous total.
//! - **Universal** aggregates (`min`/`max`/`bool_and`/`bool_or`,
//!   `count(distinct …)`, `string_agg`, `array_agg(distinct …)`) cannot
//!   shrink incrementally; they are backed by a shadow `array_agg` helper
//!   column and recomputed from it via an `unnest` sub-select. Simple
//!   incremental widening (`least`/`greatest`/boolean and-or) is applied
//!   only in `plus`, where it is provably sound; `minus` always
//!   recomputes. Do not extend incremental deltas past this boundary —
//!   soundness there is unverified.
//!
//! Because every SET expression in a single UPDATE evaluates against the
//! old row, a recompute never references the helper column directly: it
//! inlines the helper's own updated expression (`helper_updated`).

use std::collections::BTreeSet;

use crate::ast::{Cache, Expr, FromItem, FuncCall, Select, SelectColumn};
use crate::deps::Resolver;
use crate::error::PgDenormError;
use crate::schema::SchemaSnapshot;

/// PostgreSQL identifier length limit applied to generated column names.
pub const MAX_IDENT_LEN: usize = 64;

const AGGREGATE_FNS: &[&str] = &[
    "count",
    "sum",
    "array_agg",
    "string_agg",
    "min",
    "max",
    "bool_and",
    "bool_or",
];

pub fn is_aggregate_fn(name: &str) -> bool {
    AGGREGATE_FNS.contains(&name)
}

/// The closed set of aggregate kinds. Dispatch is a single `match`; the
/// behavior set is fixed, not open for extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggKind {
    /// `count(*)` / `count(expr)`: integer increment/decrement.
    Count,
    /// `sum(expr)`: arithmetic delta with null-coalescing.
    Sum,
    /// Plain `array_agg(expr)`, optionally ordered by its own argument.
    /// `insert_fn` is the ordered-insert helper for the requested
    /// direction/nulls placement; `None` appends unordered.
    ArrayAgg { insert_fn: Option<&'static str> },
    /// `array_agg(distinct expr)`: CASE-based append-if-absent, removal
    /// recomputed from the shadow non-distinct helper.
    DistinctArrayAgg { helper: String },
    /// `string_agg(expr, sep)`: concatenation on append when the call is
    /// plain, recompute from the helper array otherwise and on removal.
    StringAgg {
        separator: Expr,
        helper: String,
        plain: bool,
    },
    /// `least`-widening on insert, recompute on removal.
    Min { helper: String },
    /// `greatest`-widening on insert, recompute on removal.
    Max { helper: String },
    BoolAnd { helper: String },
    BoolOr { helper: String },
    /// No sound incremental form at all (`count(distinct …)`):
    /// recompute from the helper in both directions.
    Universal { helper: String },
}

/// One stored column maintained incrementally: either a visible cache
/// column or a shadow helper backing one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregation {
    /// Generated column name on the target table.
    pub column: String,
    /// The originating aggregate call.
    pub call: FuncCall,
    pub kind: AggKind,
    /// Qualifier for the target table (alias or table name).
    pub target: String,
    /// Column type for DDL; refined by the driver at migration time.
    pub type_name: String,
    /// Helper columns are stored but not part of the user-visible result.
    pub visible: bool,
}

impl Aggregation {
    /// The "total" placeholder: a reference to this column on the target.
    pub fn total(&self) -> Expr {
        Expr::column(&self.target, &self.column)
    }

    /// The aggregated argument expression (`None` for `count(*)`).
    pub fn argument(&self) -> Option<&Expr> {
        if self.call.star {
            None
        } else {
            self.call.args.first()
        }
    }

    pub fn helper_column(&self) -> Option<&str> {
        match &self.kind {
            AggKind::DistinctArrayAgg { helper }
            | AggKind::StringAgg { helper, .. }
            | AggKind::Min { helper }
            | AggKind::Max { helper }
            | AggKind::BoolAnd { helper }
            | AggKind::BoolOr { helper }
            | AggKind::Universal { helper } => Some(helper),
            AggKind::Count | AggKind::Sum | AggKind::ArrayAgg { .. } => None,
        }
    }

    /// DDL default for the generated column.
    pub fn default_value(&self) -> &'static str {
        match self.kind {
            AggKind::Count | AggKind::Sum => "0",
            _ => "null",
        }
    }

    /// Delta for one added source row. `helper_updated` is the helper
    /// column's own updated expression and must be given for every
    /// helper-backed kind.
    pub fn plus(&self, total: Expr, new_value: Expr, helper_updated: Option<&Expr>) -> Expr {
        match &self.kind {
            AggKind::Count => Expr::binary("+", total, self.count_step(new_value)),
            AggKind::Sum => Expr::binary("+", total, coalesce_zero(new_value)),
            AggKind::ArrayAgg { insert_fn } => {
                let append = match insert_fn {
                    Some(insert_fn) => {
                        Expr::func(insert_fn, vec![total.clone(), new_value.clone()])
                    }
                    None => Expr::func("array_append", vec![total.clone(), new_value.clone()]),
                };
                null_guarded(new_value, append, total)
            }
            AggKind::DistinctArrayAgg { .. } => {
                let present = Expr::binary(
                    "is",
                    Expr::func("array_position", vec![total.clone(), new_value.clone()]),
                    Expr::literal("null"),
                );
                let append = Expr::Case {
                    when_then: vec![(
                        present,
                        Expr::func("array_append", vec![total.clone(), new_value.clone()]),
                    )],
                    else_expr: Some(Box::new(total.clone())),
                };
                null_guarded(new_value, append, total)
            }
            AggKind::StringAgg {
                separator, plain, ..
            } => {
                if *plain {
                    let appended = Expr::binary(
                        "||",
                        Expr::func(
                            "coalesce",
                            vec![
                                Expr::binary("||", total.clone(), separator.clone()),
                                Expr::literal("''"),
                            ],
                        ),
                        new_value.clone(),
                    );
                    null_guarded(new_value, appended, total)
                } else {
                    self.recompute(helper_updated.unwrap_or(&total))
                }
            }
            AggKind::Min { .. } => Expr::func("least", vec![total, new_value]),
            AggKind::Max { .. } => Expr::func("greatest", vec![total, new_value]),
            AggKind::BoolAnd { .. } => bool_widen("and", total, new_value),
            AggKind::BoolOr { .. } => bool_widen("or", total, new_value),
            AggKind::Universal { .. } => self.recompute(helper_updated.unwrap_or(&total)),
        }
    }

    /// Delta for one removed source row.
    pub fn minus(&self, total: Expr, old_value: Expr, helper_updated: Option<&Expr>) -> Expr {
        match &self.kind {
            AggKind::Count => Expr::binary("-", total, self.count_step(old_value)),
            AggKind::Sum => Expr::binary("-", total, coalesce_zero(old_value)),
            AggKind::ArrayAgg { .. } => {
                let removed = Expr::func(
                    "cm_array_remove_one_element",
                    vec![total.clone(), old_value.clone()],
                );
                null_guarded(old_value, removed, total)
            }
            // Removal cannot be expressed as a pure delta for the
            // remaining kinds; recompute from the updated helper.
            AggKind::DistinctArrayAgg { .. }
            | AggKind::StringAgg { .. }
            | AggKind::Min { .. }
            | AggKind::Max { .. }
            | AggKind::BoolAnd { .. }
            | AggKind::BoolOr { .. }
            | AggKind::Universal { .. } => self.recompute(helper_updated.unwrap_or(&total)),
        }
    }

    /// Combined delta for the UPDATE case: minus the old contribution,
    /// plus the new one, as a single expression.
    pub fn delta(
        &self,
        total: Expr,
        old_value: Expr,
        new_value: Expr,
        helper_updated: Option<&Expr>,
    ) -> Expr {
        match &self.kind {
            AggKind::Count | AggKind::Sum | AggKind::ArrayAgg { .. } => {
                let removed = self.minus(total, old_value, None);
                self.plus(removed, new_value, None)
            }
            _ => self.recompute(helper_updated.unwrap_or(&self.total())),
        }
    }

    /// Recompute the visible value from the helper array's updated
    /// expression: `(select <agg>(item) from unnest(<helper'>) as item)`.
    pub fn recompute(&self, helper_updated: &Expr) -> Expr {
        let item = Expr::ColumnRef {
            table: None,
            column: "item".to_string(),
        };
        let agg = match &self.kind {
            AggKind::DistinctArrayAgg { .. } => FuncCall {
                name: "array_agg".to_string(),
                star: false,
                distinct: true,
                args: vec![item],
                order_by: Vec::new(),
                filter: None,
            },
            AggKind::StringAgg { separator, .. } => FuncCall {
                name: "string_agg".to_string(),
                star: false,
                distinct: self.call.distinct,
                args: vec![item, separator.clone()],
                order_by: Vec::new(),
                filter: None,
            },
            AggKind::Min { .. } => FuncCall::simple("min", vec![item]),
            AggKind::Max { .. } => FuncCall::simple("max", vec![item]),
            AggKind::BoolAnd { .. } => FuncCall::simple("bool_and", vec![item]),
            AggKind::BoolOr { .. } => FuncCall::simple("bool_or", vec![item]),
            // count(distinct …) and friends: rebuild the original call
            // over the unnested helper items.
            _ => FuncCall {
                name: self.call.name.clone(),
                star: false,
                distinct: self.call.distinct,
                args: vec![item],
                order_by: Vec::new(),
                filter: None,
            },
        };
        Expr::ScalarSubquery(Box::new(Select {
            columns: vec![SelectColumn {
                expr: Expr::FuncCall(agg),
                alias: None,
            }],
            from: vec![FromItem::Function {
                expr: Expr::func("unnest", vec![helper_updated.clone()]),
                alias: "item".to_string(),
            }],
            ..Select::default()
        }))
    }

    /// `count(*)` steps by 1; `count(expr)` only counts non-null values.
    fn count_step(&self, value: Expr) -> Expr {
        if self.call.star {
            Expr::literal("1")
        } else {
            Expr::Case {
                when_then: vec![(
                    Expr::binary("is", value, Expr::literal("null")),
                    Expr::literal("0"),
                )],
                else_expr: Some(Box::new(Expr::literal("1"))),
            }
        }
    }
}

fn coalesce_zero(expr: Expr) -> Expr {
    Expr::func("coalesce", vec![expr, Expr::literal("0")])
}

/// `case when <value> is null then <unchanged> else <applied> end` —
/// aggregates skip null inputs, so must the deltas.
fn null_guarded(value: Expr, applied: Expr, unchanged: Expr) -> Expr {
    Expr::Case {
        when_then: vec![(
            Expr::binary("is", value, Expr::literal("null")),
            unchanged,
        )],
        else_expr: Some(Box::new(applied)),
    }
}

fn bool_widen(op: &str, total: Expr, new_value: Expr) -> Expr {
    Expr::Case {
        when_then: vec![
            (
                Expr::binary("is", new_value.clone(), Expr::literal("null")),
                total.clone(),
            ),
            (
                Expr::binary("is", total.clone(), Expr::literal("null")),
                new_value.clone(),
            ),
        ],
        else_expr: Some(Box::new(Expr::binary(op, total, new_value))),
    }
}

/// Ordered-insert helper for `array_agg(x order by x …)`. Nulls placement
/// defaults follow PostgreSQL: ascending puts nulls last, descending puts
/// them first.
fn ordered_insert_fn(desc: bool, nulls_first: Option<bool>) -> &'static str {
    let nulls_first = nulls_first.unwrap_or(desc);
    match (desc, nulls_first) {
        (false, false) => "cm_array_insert_asc_nulls_last",
        (false, true) => "cm_array_insert_asc_nulls_first",
        (true, true) => "cm_array_insert_desc_nulls_first",
        (true, false) => "cm_array_insert_desc_nulls_last",
    }
}

// ── Factory ────────────────────────────────────────────────────────────────

/// The stored-column plan for one select column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnPlan {
    /// Visible column name (the select column's alias).
    pub name: String,
    /// Stored aggregations, visible column first, helpers after it.
    pub aggregations: Vec<Aggregation>,
    /// When the column expression wraps its aggregate calls (e.g.
    /// `sum(a) - sum(b)`), the expression with each call replaced by its
    /// stored column reference. `None` when the column is a bare call.
    pub expr_over_aggs: Option<Expr>,
}

impl ColumnPlan {
    /// All stored column names, in declaration order.
    pub fn stored_columns(&self) -> Vec<&str> {
        self.aggregations.iter().map(|a| a.column.as_str()).collect()
    }
}

/// Truncate a generated identifier to the database limit, keeping the
/// trailing disambiguator when one was appended.
fn truncate_ident(name: &str) -> String {
    if name.len() <= MAX_IDENT_LEN {
        return name.to_string();
    }
    name[name.len() - MAX_IDENT_LEN..].to_string()
}

/// Slug for a filter expression, used as a last-resort name
/// disambiguator.
fn filter_slug(filter: &Expr) -> String {
    filter
        .to_sql()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// First column name mentioned in the call's arguments, for name
/// disambiguation.
fn source_column(call: &FuncCall) -> Option<String> {
    let mut found = None;
    for arg in &call.args {
        arg.for_each(&mut |expr| {
            if found.is_none()
                && let Expr::ColumnRef { column, .. } = expr
            {
                found = Some(column.clone());
            }
        });
        if found.is_some() {
            break;
        }
    }
    found
}

/// Decompose one select column into its stored aggregations.
///
/// Errors if an aggregate orders by anything other than its own first
/// argument — the ordered-insert helpers only maintain self-ordered
/// arrays.
pub fn create_aggregations(
    cache: &Cache,
    column: &SelectColumn,
    snapshot: Option<&SchemaSnapshot>,
) -> Result<ColumnPlan, PgDenormError> {
    let resolver = Resolver::new(cache);
    let Some(name) = column.name().map(str::to_string) else {
        return Err(PgDenormError::InvalidCacheQuery(format!(
            "select column '{}' has no alias",
            column.expr.to_sql()
        )));
    };
    let target = cache.for_table.ident().to_string();

    // Collect top-level aggregate calls in source order.
    let mut calls: Vec<FuncCall> = Vec::new();
    column.expr.for_each(&mut |expr| {
        if let Expr::FuncCall(call) = expr
            && is_aggregate_fn(&call.name)
        {
            calls.push(call.clone());
        }
    });

    let bare = matches!(&column.expr, Expr::FuncCall(call) if is_aggregate_fn(&call.name));
    let stored_names = stored_column_names(&name, &calls, bare);

    let mut aggregations = Vec::new();
    for (call, stored_name) in calls.iter().zip(&stored_names) {
        validate_agg_order_by(call)?;
        let (kind, helper_call) = classify(call, stored_name)?;
        let type_name = column_type_for(&kind, call, &resolver, snapshot);
        aggregations.push(Aggregation {
            column: stored_name.clone(),
            call: call.clone(),
            kind,
            target: target.clone(),
            type_name,
            visible: true,
        });
        if let Some((helper_name, helper_call)) = helper_call {
            let helper_type =
                element_type(call, &resolver, snapshot).unwrap_or("text".to_string());
            aggregations.push(Aggregation {
                column: helper_name,
                call: helper_call.clone(),
                kind: AggKind::ArrayAgg {
                    insert_fn: helper_call.order_by.first().map(|key| {
                        ordered_insert_fn(key.desc, key.nulls_first)
                    }),
                },
                target: target.clone(),
                type_name: format!("{helper_type}[]"),
                visible: false,
            });
        }
    }

    // Rewrite the wrapping expression over the stored columns.
    let expr_over_aggs = if bare {
        None
    } else {
        let mut next = 0usize;
        let rewritten = column.expr.rewrite(&mut |expr| match expr {
            Expr::FuncCall(call) if is_aggregate_fn(&call.name) => {
                let stored = &stored_names[next.min(stored_names.len() - 1)];
                next += 1;
                Some(Expr::column(&target, stored))
            }
            _ => None,
        });
        Some(rewritten)
    };

    Ok(ColumnPlan {
        name,
        aggregations,
        expr_over_aggs,
    })
}

/// Generated stored-column names with the §collision rule: alias, then
/// alias + function, then + source column, then + filter slug.
fn stored_column_names(alias: &str, calls: &[FuncCall], bare: bool) -> Vec<String> {
    if bare && calls.len() == 1 {
        return vec![truncate_ident(alias)];
    }
    let mut names: Vec<String> = calls
        .iter()
        .map(|call| format!("{alias}_{}", call.name))
        .collect();
    disambiguate(&mut names, calls, |call| source_column(call));
    disambiguate(&mut names, calls, |call| {
        call.filter.as_deref().map(filter_slug)
    });
    names.into_iter().map(|n| truncate_ident(&n)).collect()
}

/// Append a suffix produced by `key` to every name that still collides.
fn disambiguate(names: &mut [String], calls: &[FuncCall], key: impl Fn(&FuncCall) -> Option<String>) {
    let duplicated: BTreeSet<String> = names
        .iter()
        .filter(|name| names.iter().filter(|n| n == name).count() > 1)
        .cloned()
        .collect();
    for (name, call) in names.iter_mut().zip(calls) {
        if duplicated.contains(name.as_str())
            && let Some(suffix) = key(call)
        {
            name.push('_');
            name.push_str(&suffix);
        }
    }
}

/// Aggregate ORDER BY must order by the aggregated expression itself.
fn validate_agg_order_by(call: &FuncCall) -> Result<(), PgDenormError> {
    if call.order_by.is_empty() {
        return Ok(());
    }
    if call.order_by.len() > 1 || call.args.first() != Some(&call.order_by[0].expr) {
        return Err(PgDenormError::Unsupported(format!(
            "aggregate order by must order by its own argument: {}",
            call.to_sql()
        )));
    }
    Ok(())
}

/// Classify a call into its kind, synthesizing the shadow helper call
/// where the kind needs one.
fn classify(
    call: &FuncCall,
    stored_name: &str,
) -> Result<(AggKind, Option<(String, FuncCall)>), PgDenormError> {
    let helper_name = truncate_ident(&format!("{stored_name}_array_agg"));
    let helper = |ordered: bool| {
        let helper_call = FuncCall {
            name: "array_agg".to_string(),
            star: false,
            distinct: false,
            args: call.args.first().cloned().into_iter().collect(),
            order_by: if ordered { call.order_by.clone() } else { Vec::new() },
            filter: call.filter.clone(),
        };
        Some((helper_name.clone(), helper_call))
    };
    let kind = match call.name.as_str() {
        "count" if call.distinct => {
            return Ok((
                AggKind::Universal {
                    helper: helper_name.clone(),
                },
                helper(false),
            ));
        }
        "count" => AggKind::Count,
        "sum" => AggKind::Sum,
        "array_agg" if call.distinct => {
            return Ok((
                AggKind::DistinctArrayAgg {
                    helper: helper_name.clone(),
                },
                helper(false),
            ));
        }
        "array_agg" => AggKind::ArrayAgg {
            insert_fn: call
                .order_by
                .first()
                .map(|key| ordered_insert_fn(key.desc, key.nulls_first)),
        },
        "string_agg" => {
            let Some(separator) = call.args.get(1).cloned() else {
                return Err(PgDenormError::InvalidCacheQuery(format!(
                    "string_agg requires a delimiter argument: {}",
                    call.to_sql()
                )));
            };
            let plain = !call.distinct && call.order_by.is_empty();
            return Ok((
                AggKind::StringAgg {
                    separator,
                    helper: helper_name.clone(),
                    plain,
                },
                helper(!call.order_by.is_empty()),
            ));
        }
        "min" => {
            return Ok((
                AggKind::Min {
                    helper: helper_name.clone(),
                },
                helper(false),
            ));
        }
        "max" => {
            return Ok((
                AggKind::Max {
                    helper: helper_name.clone(),
                },
                helper(false),
            ));
        }
        "bool_and" => {
            return Ok((
                AggKind::BoolAnd {
                    helper: helper_name.clone(),
                },
                helper(false),
            ));
        }
        "bool_or" => {
            return Ok((
                AggKind::BoolOr {
                    helper: helper_name.clone(),
                },
                helper(false),
            ));
        }
        other => {
            return Err(PgDenormError::Unsupported(format!(
                "unsupported aggregate function '{other}'"
            )));
        }
    };
    Ok((kind, None))
}

/// Column type for the visible stored column.
fn column_type_for(
    kind: &AggKind,
    call: &FuncCall,
    resolver: &Resolver<'_>,
    snapshot: Option<&SchemaSnapshot>,
) -> String {
    match kind {
        AggKind::Count | AggKind::Universal { .. } => "bigint".to_string(),
        AggKind::Sum => "numeric".to_string(),
        AggKind::StringAgg { .. } => "text".to_string(),
        AggKind::BoolAnd { .. } | AggKind::BoolOr { .. } => "boolean".to_string(),
        AggKind::ArrayAgg { .. } | AggKind::DistinctArrayAgg { .. } => {
            let elem =
                element_type(call, resolver, snapshot).unwrap_or_else(|| "text".to_string());
            format!("{elem}[]")
        }
        AggKind::Min { .. } | AggKind::Max { .. } => {
            element_type(call, resolver, snapshot).unwrap_or_else(|| "numeric".to_string())
        }
    }
}

/// Snapshot type of the call's argument, when it is a plain column
/// reference.
fn element_type(
    call: &FuncCall,
    resolver: &Resolver<'_>,
    snapshot: Option<&SchemaSnapshot>,
) -> Option<String> {
    let snapshot = snapshot?;
    let Some(Expr::ColumnRef { table, column }) = call.args.first() else {
        return None;
    };
    let table_ref = resolver.resolve(table.as_deref(), column).ok()?;
    snapshot
        .column_type(&table_ref.table, column)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_cache;

    fn plan_for(src: &str) -> ColumnPlan {
        let cache = parse_cache(src).unwrap();
        create_aggregations(&cache, &cache.select.columns[0], None).unwrap()
    }

    #[test]
    fn test_sum_plus_minus_sql() {
        let plan = plan_for(
            "cache totals for companies (select sum(orders.profit) as orders_profit \
             from orders where orders.id_client = companies.id)",
        );
        assert_eq!(plan.aggregations.len(), 1);
        let agg = &plan.aggregations[0];
        assert_eq!(agg.column, "orders_profit");
        assert_eq!(agg.default_value(), "0");

        let total = agg.total();
        let plus = agg.plus(total.clone(), Expr::column("new", "profit"), None);
        assert_eq!(
            plus.to_sql(),
            "(companies.orders_profit + coalesce(new.profit, 0))"
        );
        let minus = agg.minus(total, Expr::column("old", "profit"), None);
        assert_eq!(
            minus.to_sql(),
            "(companies.orders_profit - coalesce(old.profit, 0))"
        );
    }

    #[test]
    fn test_sum_minus_then_plus_folds_to_total() {
        let plan = plan_for(
            "cache totals for companies (select sum(orders.profit) as p \
             from orders where orders.id_client = companies.id)",
        );
        let agg = &plan.aggregations[0];
        let value = Expr::column("new", "profit");
        let round_trip = agg.plus(
            agg.minus(agg.total(), value.clone(), None),
            value,
            None,
        );
        assert_eq!(round_trip.simplify(), agg.total());
    }

    #[test]
    fn test_count_star_steps_by_one() {
        let plan = plan_for(
            "cache totals for companies (select count(*) as orders_count \
             from orders where orders.id_client = companies.id)",
        );
        let agg = &plan.aggregations[0];
        assert_eq!(agg.kind, AggKind::Count);
        assert_eq!(
            agg.plus(agg.total(), Expr::literal("null"), None).to_sql(),
            "(companies.orders_count + 1)"
        );
    }

    #[test]
    fn test_count_arg_skips_nulls() {
        let plan = plan_for(
            "cache totals for companies (select count(orders.doc_number) as doc_count \
             from orders where orders.id_client = companies.id)",
        );
        let agg = &plan.aggregations[0];
        let plus = agg
            .plus(agg.total(), Expr::column("new", "doc_number"), None)
            .to_sql();
        assert!(plus.contains("when new.doc_number is null then 0"), "got: {plus}");
    }

    #[test]
    fn test_ordered_array_agg_uses_insert_variant() {
        let plan = plan_for(
            "cache agg for companies (select array_agg(orders.id order by orders.id desc) \
             as order_ids from orders where orders.id_client = companies.id)",
        );
        let agg = &plan.aggregations[0];
        let plus = agg
            .plus(agg.total(), Expr::column("new", "id"), None)
            .to_sql();
        assert!(plus.contains("cm_array_insert_desc_nulls_first"), "got: {plus}");
    }

    #[test]
    fn test_count_distinct_is_universal_with_helper() {
        let plan = plan_for(
            "cache agg for companies (select count(distinct orders.id_type) as type_count \
             from orders where orders.id_client = companies.id)",
        );
        assert_eq!(plan.aggregations.len(), 2);
        let visible = &plan.aggregations[0];
        let helper = &plan.aggregations[1];
        assert_eq!(helper.column, "type_count_array_agg");
        assert!(!helper.visible);
        assert!(matches!(visible.kind, AggKind::Universal { .. }));

        let helper_updated = helper.plus(helper.total(), Expr::column("new", "id_type"), None);
        let recompute = visible
            .plus(visible.total(), Expr::column("new", "id_type"), Some(&helper_updated))
            .to_sql();
        assert!(
            recompute.starts_with("(select count(distinct item) from unnest("),
            "got: {recompute}"
        );
    }

    #[test]
    fn test_string_agg_plain_append() {
        let plan = plan_for(
            "cache agg for companies (select string_agg(orders.doc_number, ', ') as docs \
             from orders where orders.id_client = companies.id)",
        );
        let visible = &plan.aggregations[0];
        let plus = visible
            .plus(visible.total(), Expr::column("new", "doc_number"), None)
            .to_sql();
        assert!(
            plus.contains("coalesce((companies.docs || ', '), '')"),
            "got: {plus}"
        );
        // Removal always recomputes from the helper.
        let helper = &plan.aggregations[1];
        let helper_updated =
            helper.minus(helper.total(), Expr::column("old", "doc_number"), None);
        let minus = visible
            .minus(visible.total(), Expr::column("old", "doc_number"), Some(&helper_updated))
            .to_sql();
        assert!(minus.contains("select string_agg(item, ', ')"), "got: {minus}");
        assert!(minus.contains("cm_array_remove_one_element"), "got: {minus}");
    }

    #[test]
    fn test_min_widens_on_plus_recomputes_on_minus() {
        let plan = plan_for(
            "cache agg for companies (select min(orders.profit) as min_profit \
             from orders where orders.id_client = companies.id)",
        );
        let visible = &plan.aggregations[0];
        assert_eq!(
            visible
                .plus(visible.total(), Expr::column("new", "profit"), None)
                .to_sql(),
            "least(companies.min_profit, new.profit)"
        );
        let minus = visible
            .minus(visible.total(), Expr::column("old", "profit"), Some(&visible.total()))
            .to_sql();
        assert!(minus.contains("select min(item) from unnest"), "got: {minus}");
    }

    #[test]
    fn test_expression_column_gets_per_call_names() {
        let plan = plan_for(
            "cache agg for companies (select sum(orders.profit) - sum(orders.cost) as net \
             from orders where orders.id_client = companies.id)",
        );
        assert_eq!(plan.stored_columns(), vec!["net_sum_profit", "net_sum_cost"]);
        let over = plan.expr_over_aggs.as_ref().unwrap().to_sql();
        assert_eq!(over, "(companies.net_sum_profit - companies.net_sum_cost)");
    }

    #[test]
    fn test_filter_disambiguates_colliding_names() {
        let plan = plan_for(
            "cache agg for companies (select count(*) filter (where orders.paid = true) \
             + count(*) filter (where orders.paid = false) as paid_split \
             from orders where orders.id_client = companies.id)",
        );
        let names = plan.stored_columns();
        assert_eq!(names.len(), 2);
        assert_ne!(names[0], names[1]);
        assert!(names[0].starts_with("paid_split_count"), "got: {names:?}");
    }

    #[test]
    fn test_generated_names_respect_ident_limit() {
        let long_alias = "a".repeat(80);
        let src = format!(
            "cache agg for companies (select count(distinct orders.id_type) as {long_alias} \
             from orders where orders.id_client = companies.id)"
        );
        let plan = plan_for(&src);
        for agg in &plan.aggregations {
            assert!(agg.column.len() <= MAX_IDENT_LEN, "too long: {}", agg.column);
        }
    }

    #[test]
    fn test_rejects_foreign_order_by_argument() {
        let cache = parse_cache(
            "cache agg for companies (select array_agg(orders.id order by orders.date) as ids \
             from orders where orders.id_client = companies.id)",
        )
        .unwrap();
        let err = create_aggregations(&cache, &cache.select.columns[0], None).unwrap_err();
        assert!(err.to_string().contains("order by must order by its own argument"));
    }
}
