//! Linter for parsed cache definitions.
//!
//! Validates a [`Cache`] against the supported SQL subset and throws a
//! descriptive error on the first unsupported construct. Each rule is
//! independent and checked in a fixed order, so the same invalid cache
//! always reports the same error.
//!
//! The trigger strategies downstream assume every invariant enforced
//! here; a cache that passes the linter must compile.

use std::collections::BTreeSet;

use crate::agg::is_aggregate_fn;
use crate::ast::{Cache, Expr, FromItem, Select};
use crate::deps::Resolver;
use crate::error::PgDenormError;

/// Validate a parsed cache. Returns on the first violated rule.
pub fn lint_cache(cache: &Cache) -> Result<(), PgDenormError> {
    let select = &cache.select;

    if !select.with.is_empty() {
        return Err(PgDenormError::Unsupported(
            "CTE (with …) is not supported in cache queries".to_string(),
        ));
    }
    if select.union.is_some() {
        return Err(PgDenormError::Unsupported(
            "union is not supported in cache queries".to_string(),
        ));
    }
    if !select.group_by.is_empty() {
        return Err(PgDenormError::Unsupported(
            "group by is not supported in cache queries".to_string(),
        ));
    }
    if select.from.is_empty() {
        return Err(PgDenormError::InvalidCacheQuery(
            "cache query must have a from item".to_string(),
        ));
    }
    if select.from.len() > 1 {
        return Err(PgDenormError::Unsupported(format!(
            "multiple from items are not supported: found {}",
            select.from.len()
        )));
    }
    for item in select
        .from
        .iter()
        .chain(select.joins.iter().map(|join| &join.from))
    {
        if let FromItem::Subquery { .. } = item {
            return Err(PgDenormError::Unsupported(
                "subqueries are not allowed as from items".to_string(),
            ));
        }
    }
    reject_nested_selects(select)?;
    for join in &select.joins {
        if join.on.is_none() {
            let table = join
                .from
                .as_table()
                .map(|t| t.table.to_string())
                .unwrap_or_default();
            return Err(PgDenormError::InvalidCacheQuery(format!(
                "join {table} requires an explicit on condition"
            )));
        }
    }
    check_column_aliases(select)?;
    check_references_resolve(cache)?;
    check_aggregate_calls(select)?;
    if let Some(where_clause) = &select.where_clause {
        check_slow_scan(where_clause)?;
    }
    check_order_by_shape(cache)?;
    Ok(())
}

fn reject_nested_selects(select: &Select) -> Result<(), PgDenormError> {
    let mut offending: Option<String> = None;
    select.for_each_expr(&mut |expr| {
        if offending.is_none()
            && let Expr::ScalarSubquery(_) = expr
        {
            offending = Some(expr.to_sql());
        }
    });
    match offending {
        Some(snippet) => Err(PgDenormError::Unsupported(format!(
            "nested sub-selects are not supported: {snippet}"
        ))),
        None => Ok(()),
    }
}

fn check_column_aliases(select: &Select) -> Result<(), PgDenormError> {
    let mut seen = BTreeSet::new();
    for column in &select.columns {
        let Some(name) = column.name() else {
            return Err(PgDenormError::InvalidCacheQuery(format!(
                "every selected column must have an alias: {}",
                column.expr.to_sql()
            )));
        };
        if !seen.insert(name.to_string()) {
            return Err(PgDenormError::InvalidCacheQuery(format!(
                "duplicate column alias '{name}'"
            )));
        }
    }
    Ok(())
}

fn check_references_resolve(cache: &Cache) -> Result<(), PgDenormError> {
    let resolver = Resolver::new(cache);
    let mut first_error: Option<PgDenormError> = None;
    cache.select.for_each_expr(&mut |expr| {
        if first_error.is_none()
            && let Expr::ColumnRef { table, column } = expr
            && let Err(err) = resolver.resolve(table.as_deref(), column)
        {
            first_error = Some(err);
        }
    });
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Per-call aggregate rules: `string_agg` needs a delimiter, aggregates
/// cannot nest.
fn check_aggregate_calls(select: &Select) -> Result<(), PgDenormError> {
    let mut first_error: Option<PgDenormError> = None;
    select.for_each_expr(&mut |expr| {
        if first_error.is_some() {
            return;
        }
        let Expr::FuncCall(call) = expr else {
            return;
        };
        if !is_aggregate_fn(&call.name) {
            return;
        }
        if call.name == "string_agg" && call.args.len() < 2 {
            first_error = Some(PgDenormError::InvalidCacheQuery(format!(
                "string_agg requires a delimiter argument: {}",
                call.to_sql()
            )));
            return;
        }
        for arg in &call.args {
            arg.for_each(&mut |inner| {
                if first_error.is_none()
                    && let Expr::FuncCall(inner_call) = inner
                    && !std::ptr::eq(inner, expr)
                    && is_aggregate_fn(&inner_call.name)
                {
                    first_error = Some(PgDenormError::Unsupported(format!(
                        "aggregate calls cannot be nested: {}",
                        call.to_sql()
                    )));
                }
            });
        }
    });
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Detect WHERE shapes that defeat index usage and suggest the
/// indexable rewrite:
/// - `any(array_col) = x` → `x = any(array_col)`
/// - `array[x] && array_col` → `array_col && array[x]`
fn check_slow_scan(where_clause: &Expr) -> Result<(), PgDenormError> {
    let mut first_error: Option<PgDenormError> = None;
    where_clause.for_each(&mut |expr| {
        if first_error.is_some() {
            return;
        }
        let Expr::BinaryOp { op, left, right } = expr else {
            return;
        };
        if op == "="
            && let Expr::FuncCall(call) = &**left
            && call.name == "any"
            && call.args.len() == 1
        {
            first_error = Some(PgDenormError::SlowScan {
                condition: expr.to_sql(),
                suggestion: format!("{} = any({})", right.to_sql(), call.args[0].to_sql()),
            });
            return;
        }
        if op == "&&"
            && matches!(&**left, Expr::ArrayLiteral(_))
            && matches!(&**right, Expr::ColumnRef { .. })
        {
            first_error = Some(PgDenormError::SlowScan {
                condition: expr.to_sql(),
                suggestion: format!("{} && {}", right.to_sql(), left.to_sql()),
            });
        }
    });
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// The "last row" pattern (`order by … limit 1`) is restricted to the
/// simplest shape: one key, limit exactly 1, a single table, no joins,
/// no aggregates. Its trigger strategy only handles single-table
/// ordering.
fn check_order_by_shape(cache: &Cache) -> Result<(), PgDenormError> {
    let select = &cache.select;
    if select.order_by.is_empty() {
        if let Some(limit) = &select.limit {
            return Err(PgDenormError::InvalidCacheQuery(format!(
                "limit {limit} requires an order by clause"
            )));
        }
        // Aggregate caches: every column must contain an aggregate call,
        // and foreign columns may only appear inside one (a bare foreign
        // column has no single value per target row).
        if select_has_aggregates(select) {
            let resolver = Resolver::new(cache);
            for column in &select.columns {
                if !expr_has_aggregate(&column.expr) {
                    return Err(PgDenormError::InvalidCacheQuery(format!(
                        "column '{}' must contain an aggregate function",
                        column.name().unwrap_or_default()
                    )));
                }
                if let Some(reference) = bare_foreign_column(&resolver, &column.expr) {
                    return Err(PgDenormError::InvalidCacheQuery(format!(
                        "column '{}': {reference} must appear inside an aggregate function",
                        column.name().unwrap_or_default()
                    )));
                }
            }
        } else {
            // Plain selects are valid only over the target table itself;
            // picking a row from another table needs order by … limit 1.
            let resolver = Resolver::new(cache);
            if let Some(foreign) = resolver.sources().iter().find(|s| !resolver.is_target(s)) {
                return Err(PgDenormError::InvalidCacheQuery(format!(
                    "selecting plain columns from {} requires order by … limit 1",
                    foreign.table
                )));
            }
        }
        return Ok(());
    }
    if select.order_by.len() != 1 {
        return Err(PgDenormError::InvalidCacheQuery(format!(
            "invalid order by: exactly one order by key is supported, found {}",
            select.order_by.len()
        )));
    }
    match &select.limit {
        None => {
            return Err(PgDenormError::InvalidCacheQuery(
                "order by requires limit 1".to_string(),
            ));
        }
        Some(limit) if limit != "1" => {
            return Err(PgDenormError::InvalidLimit {
                limit: limit.clone(),
            });
        }
        Some(_) => {}
    }
    if !select.joins.is_empty() {
        return Err(PgDenormError::InvalidCacheQuery(
            "order by caches cannot use joins".to_string(),
        ));
    }
    if select_has_aggregates(select) {
        return Err(PgDenormError::InvalidCacheQuery(
            "order by caches cannot use aggregate functions".to_string(),
        ));
    }
    Ok(())
}

/// First reference to a non-target column outside any aggregate call,
/// as `table.column` text. Descent stops at aggregate calls; their
/// arguments, ORDER BY keys and FILTER clauses may read sources freely.
fn bare_foreign_column(resolver: &Resolver<'_>, expr: &Expr) -> Option<String> {
    match expr {
        Expr::FuncCall(call) if is_aggregate_fn(&call.name) => None,
        Expr::ColumnRef { table, column } => {
            let source = resolver.resolve(table.as_deref(), column).ok()?;
            (!resolver.is_target(source)).then(|| expr.to_sql())
        }
        Expr::Literal(_) | Expr::ScalarSubquery(_) => None,
        Expr::BinaryOp { left, right, .. } => bare_foreign_column(resolver, left)
            .or_else(|| bare_foreign_column(resolver, right)),
        Expr::UnaryOp { expr, .. } | Expr::Cast { expr, .. } => {
            bare_foreign_column(resolver, expr)
        }
        Expr::FuncCall(call) => call
            .args
            .iter()
            .find_map(|arg| bare_foreign_column(resolver, arg)),
        Expr::Case {
            when_then,
            else_expr,
        } => when_then
            .iter()
            .find_map(|(when, then)| {
                bare_foreign_column(resolver, when)
                    .or_else(|| bare_foreign_column(resolver, then))
            })
            .or_else(|| {
                else_expr
                    .as_ref()
                    .and_then(|e| bare_foreign_column(resolver, e))
            }),
        Expr::ArrayLiteral(items) => items
            .iter()
            .find_map(|item| bare_foreign_column(resolver, item)),
    }
}

fn select_has_aggregates(select: &Select) -> bool {
    select.columns.iter().any(|c| expr_has_aggregate(&c.expr))
}

fn expr_has_aggregate(expr: &Expr) -> bool {
    let mut found = false;
    expr.for_each(&mut |node| {
        if let Expr::FuncCall(call) = node
            && is_aggregate_fn(&call.name)
        {
            found = true;
        }
    });
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_cache;

    fn lint(src: &str) -> Result<(), PgDenormError> {
        lint_cache(&parse_cache(src).unwrap())
    }

    #[test]
    fn test_accepts_supported_cache() {
        lint(
            "cache totals for companies (select sum(orders.profit) as orders_profit \
             from orders where orders.id_client = companies.id)",
        )
        .unwrap();
    }

    #[test]
    fn test_rejects_cte() {
        let err = lint("cache x for t (with c as (select u.a from u) select sum(c.a) as s from c)")
            .unwrap_err();
        assert!(err.to_string().contains("CTE"));
    }

    #[test]
    fn test_rejects_union() {
        let err =
            lint("cache x for t (select u.a as a from u union select v.a as a from v)").unwrap_err();
        assert!(err.to_string().contains("union"));
    }

    #[test]
    fn test_rejects_group_by() {
        let err = lint("cache x for t (select count(*) as c from u group by u.kind)").unwrap_err();
        assert!(err.to_string().contains("group by"));
    }

    #[test]
    fn test_rejects_two_from_items() {
        let err = lint("cache x for t (select count(*) as c from u, v)").unwrap_err();
        assert!(err.to_string().contains("multiple from items"));
    }

    #[test]
    fn test_rejects_subquery_source() {
        let err = lint("cache x for t (select count(*) as c from (select u.a from u) s)")
            .unwrap_err();
        assert!(err.to_string().contains("subqueries are not allowed"));
    }

    #[test]
    fn test_rejects_nested_select() {
        let err = lint(
            "cache x for t (select count(*) as c from u \
             where u.id = (select max(v.id) from v))",
        )
        .unwrap_err();
        assert!(err.to_string().contains("nested sub-selects"));
    }

    #[test]
    fn test_rejects_join_without_on() {
        let err = lint(
            "cache x for t (select count(*) as c from u left join v \
             where u.id_t = t.id)",
        )
        .unwrap_err();
        assert!(err.to_string().contains("requires an explicit on condition"));
    }

    #[test]
    fn test_rejects_missing_alias() {
        let err = lint("cache x for t (select count(*) from u where u.id_t = t.id)").unwrap_err();
        assert!(err.to_string().contains("must have an alias"));
    }

    #[test]
    fn test_rejects_duplicate_alias() {
        let err = lint(
            "cache x for t (select count(*) as c, sum(u.a) as c from u where u.id_t = t.id)",
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate column alias 'c'"));
    }

    #[test]
    fn test_rejects_unresolved_reference() {
        let err = lint(
            "cache x for t (select sum(other.a) as s from u where u.id_t = t.id)",
        )
        .unwrap_err();
        assert!(matches!(err, PgDenormError::UnresolvedReference(_)));
    }

    #[test]
    fn test_rejects_string_agg_without_delimiter() {
        let err = lint(
            "cache x for t (select string_agg(u.name) as names from u where u.id_t = t.id)",
        )
        .unwrap_err();
        assert!(err.to_string().contains("string_agg requires a delimiter"));
    }

    #[test]
    fn test_rejects_two_order_by_keys_with_limit_1() {
        let err = lint(
            "cache x for t (select u.a as a from u where u.id_t = t.id \
             order by u.a asc, u.b desc limit 1)",
        )
        .unwrap_err();
        assert!(err.to_string().contains("exactly one order by key"));
    }

    #[test]
    fn test_rejects_limit_other_than_one() {
        let err = lint(
            "cache x for t (select u.a as a from u where u.id_t = t.id \
             order by u.id limit 100)",
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "invalid limit: 100, limit can be only 1");
    }

    #[test]
    fn test_rejects_limit_without_order_by() {
        let err =
            lint("cache x for t (select u.a as a from u where u.id_t = t.id limit 1)").unwrap_err();
        assert!(err.to_string().contains("requires an order by clause"));
    }

    #[test]
    fn test_rejects_order_by_without_limit() {
        let err = lint(
            "cache x for t (select u.a as a from u where u.id_t = t.id order by u.id)",
        )
        .unwrap_err();
        assert!(err.to_string().contains("order by requires limit 1"));
    }

    #[test]
    fn test_rejects_mixed_aggregate_and_plain_columns() {
        let err = lint(
            "cache x for t (select count(*) as c, u.a as a from u where u.id_t = t.id)",
        )
        .unwrap_err();
        assert!(err.to_string().contains("must contain an aggregate function"));
    }

    #[test]
    fn test_rejects_plain_select_over_foreign_table() {
        let err = lint(
            "cache doc for companies (select orders.doc_number as doc from orders \
             where orders.id_client = companies.id)",
        )
        .unwrap_err();
        assert!(
            err.to_string()
                .contains("selecting plain columns from public.orders requires order by … limit 1"),
            "got: {err}"
        );
    }

    #[test]
    fn test_accepts_plain_select_over_target_table() {
        lint("cache order_total for orders (select orders.price * orders.qty as total from orders)")
            .unwrap();
    }

    #[test]
    fn test_rejects_bare_foreign_column_next_to_aggregate() {
        let err = lint(
            "cache x for companies (select sum(orders.profit) * orders.qty as weighted \
             from orders where orders.id_client = companies.id)",
        )
        .unwrap_err();
        assert!(
            err.to_string()
                .contains("orders.qty must appear inside an aggregate function"),
            "got: {err}"
        );
    }

    #[test]
    fn test_accepts_target_column_next_to_aggregate() {
        lint(
            "cache margin for companies (select sum(orders.profit) / companies.orders_count \
             as margin from orders where orders.id_client = companies.id)",
        )
        .unwrap();
    }

    #[test]
    fn test_slow_scan_any_backwards() {
        let err = lint(
            "cache x for companies (select count(*) as c from orders \
             where any(orders.client_ids) = companies.id)",
        )
        .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("slow scan condition"), "got: {text}");
        assert!(
            text.contains("rewrite as: companies.id = any(orders.client_ids)"),
            "got: {text}"
        );
    }

    #[test]
    fn test_slow_scan_overlap_backwards() {
        let err = lint(
            "cache x for companies (select count(*) as c from orders \
             where array[companies.id] && orders.client_ids)",
        )
        .unwrap_err();
        assert!(
            err.to_string()
                .contains("rewrite as: orders.client_ids && array[companies.id]"),
        );
    }

    #[test]
    fn test_accepts_indexable_shapes() {
        lint(
            "cache x for companies (select count(*) as c from orders \
             where companies.id = any(orders.client_ids))",
        )
        .unwrap();
        lint(
            "cache x for companies (select count(*) as c from orders \
             where orders.client_ids && array[companies.id])",
        )
        .unwrap();
    }

    #[test]
    fn test_accepts_last_row_cache() {
        lint(
            "cache last_order for companies (select orders.id as last_order_id \
             from orders where orders.id_client = companies.id \
             order by orders.id desc limit 1)",
        )
        .unwrap();
    }
}
