//! Last-row caches: `order by … limit 1` over a single source table.
//!
//! The target carries the selected columns plus a hidden winner-id column
//! recording which source row currently supplies them. Triggers on the
//! source re-run the (indexed, LIMIT 1) scan for the affected target rows
//! only:
//!
//! - INSERT re-evaluates the new row's target, so a newcomer that beats
//!   the current winner takes over.
//! - DELETE re-scans only when the deleted row *was* the winner.
//! - UPDATE re-scans the old target when the winner moved away, and the
//!   new target unconditionally (the row may now win or stop winning).

use crate::ast::{Expr, Select, SelectColumn, TableRef};
use crate::error::PgDenormError;
use crate::objects::{DatabaseFunction, DatabaseTrigger, TriggerEvent, TriggerTiming};
use crate::trigger::body::{FunctionBody, Statement};
use crate::trigger::{
    StrategyContext, TriggerPair, any_column_changed, dep_trigger_name, match_condition,
    winner_column,
};

pub(crate) fn build(ctx: &StrategyContext<'_>) -> Result<Vec<TriggerPair>, PgDenormError> {
    let cache = ctx.cache;
    let Some(source) = cache.select.single_from_table() else {
        return Err(PgDenormError::InvalidCacheQuery(format!(
            "cache '{}' orders by a column but does not select from exactly one table",
            cache.name
        )));
    };
    if cache.triggers_suppressed_on(&source.table) {
        return Ok(Vec::new());
    }

    let condition = match_condition(cache).ok_or_else(|| {
        PgDenormError::InvalidCacheQuery(format!(
            "cache '{}' has no condition linking {} rows to {}",
            cache.name, source.table, cache.for_table.table
        ))
    })?;
    let winner = winner_column(cache);
    let name = dep_trigger_name(cache, &source.table.name);

    let rescan_new = rescan_stmt(ctx, source, &condition, "new", None);
    let rescan_old_if_winner = rescan_stmt(ctx, source, &condition, "old", Some(&winner));

    let source_cols = ctx.source_columns(source);
    let moved_or_stayed = match any_column_changed(&source_cols) {
        Some(_) => {
            // Any referenced column change can affect the outcome; the
            // old target needs attention only when this row was winning.
            vec![rescan_old_if_winner.clone(), rescan_new.clone()]
        }
        None => vec![rescan_new.clone()],
    };

    let mut body = FunctionBody::new();
    let mut dispatch = Statement::If {
        cond: tg_op_is("DELETE"),
        then: vec![rescan_old_if_winner],
        otherwise: moved_or_stayed,
    };
    if !cache.insert_suppressed_on(&source.table) {
        dispatch = Statement::If {
            cond: tg_op_is("INSERT"),
            then: vec![rescan_new],
            otherwise: vec![dispatch],
        };
    }
    body.push(dispatch);
    body.push(Statement::Return("null"));

    let mut events = Vec::new();
    if !cache.insert_suppressed_on(&source.table) {
        events.push(TriggerEvent::Insert);
    }
    events.push(TriggerEvent::Delete);
    events.push(TriggerEvent::Update(source_cols));

    Ok(vec![TriggerPair {
        function: DatabaseFunction::trigger_fn(&name, body.to_plpgsql()),
        trigger: DatabaseTrigger {
            name: name.clone(),
            table: source.table.clone(),
            timing: TriggerTiming::After,
            events,
            when: None,
            procedure: name,
        },
    }])
}

fn tg_op_is(op: &str) -> Expr {
    Expr::binary(
        "=",
        Expr::ColumnRef {
            table: None,
            column: "tg_op".to_string(),
        },
        Expr::literal(&format!("'{op}'")),
    )
}

/// One UPDATE of the matching target rows, re-running the limited scan
/// per column as a correlated subquery. With `winner_guard` set, the
/// update applies only where the trigger row is the recorded winner.
fn rescan_stmt(
    ctx: &StrategyContext<'_>,
    source: &TableRef,
    condition: &Expr,
    row: &str,
    winner_guard: Option<&str>,
) -> Statement {
    let cache = ctx.cache;
    let target_table = &cache.for_table.table;
    let target_ident = cache.for_table.ident();

    let mut set: Vec<(String, Expr)> = Vec::new();
    for plan in ctx.plans {
        if let Some(expr) = &plan.expr_over_aggs {
            set.push((plan.name.clone(), winning_value(ctx, source, expr.clone())));
        }
    }
    set.push((
        winner_column(cache),
        winning_value(ctx, source, Expr::column(source.ident(), "id")),
    ));

    let mut where_clause = condition
        .replace_table(source.ident(), row)
        .replace_table(target_ident, &target_table.name);
    if let Some(winner) = winner_guard {
        where_clause = Expr::binary(
            "and",
            where_clause,
            Expr::binary(
                "=",
                Expr::column(&target_table.name, winner),
                Expr::column(row, "id"),
            ),
        );
    }

    Statement::Update {
        table: target_table.clone(),
        set,
        where_clause,
    }
}

/// `(select <expr> from <source> where <cond> order by … limit 1)`,
/// correlated to the target row being updated.
fn winning_value(ctx: &StrategyContext<'_>, source: &TableRef, expr: Expr) -> Expr {
    let cache = ctx.cache;
    let target_ident = cache.for_table.ident();
    let select = Select {
        columns: vec![SelectColumn { expr, alias: None }],
        from: vec![crate::ast::FromItem::Table(TableRef::new(
            source.table.clone(),
            source.alias.clone(),
        ))],
        where_clause: cache.select.where_clause.clone(),
        order_by: cache.select.order_by.clone(),
        limit: cache.select.limit.clone(),
        ..Select::default()
    }
    .replace_table(target_ident, &cache.for_table.table.name);
    Expr::ScalarSubquery(Box::new(select))
}

#[cfg(test)]
mod tests {
    use crate::trigger::tests::compile_pairs;

    fn last_order_pairs() -> Vec<crate::trigger::TriggerPair> {
        compile_pairs(
            "cache last_order for companies (select orders.id as last_order_id, \
             orders.profit as last_order_profit from orders \
             where orders.id_client = companies.id \
             order by orders.created_at desc limit 1)",
        )
    }

    #[test]
    fn test_single_pair_on_source() {
        let pairs = last_order_pairs();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].trigger.name, "cache_last_order_for_companies_on_orders");
        assert_eq!(pairs[0].trigger.table.name, "orders");
    }

    #[test]
    fn test_rescan_subquery_keeps_order_and_limit() {
        let pairs = last_order_pairs();
        let body = &pairs[0].function.body;
        assert!(
            body.contains(
                "last_order_id = (select orders.id from public.orders \
                 where (orders.id_client = companies.id) \
                 order by orders.created_at desc limit 1)"
            ),
            "got: {body}"
        );
    }

    #[test]
    fn test_delete_guards_on_winner_column() {
        let pairs = last_order_pairs();
        let body = &pairs[0].function.body;
        assert!(
            body.contains("(companies.__last_order_id = old.id)"),
            "got: {body}"
        );
    }

    #[test]
    fn test_winner_column_is_maintained() {
        let pairs = last_order_pairs();
        let body = &pairs[0].function.body;
        assert!(body.contains("__last_order_id = (select orders.id"), "got: {body}");
    }
}
