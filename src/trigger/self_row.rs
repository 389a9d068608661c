//! Self-row triggers: the cache reads only its own target table.
//!
//! Each cached column is a plain expression over the row being written,
//! so a BEFORE trigger assigns it directly on `new` with no extra table
//! access. Two leveled pairs are produced, one for INSERT and one for
//! UPDATE; the UPDATE body recomputes only when a referenced column
//! actually changed. Level-prefixed names sequence chained caches on the
//! same table (a cache reading another cache's column fires after it).

use crate::ast::Expr;
use crate::error::PgDenormError;
use crate::objects::{DatabaseFunction, DatabaseTrigger, TriggerEvent, TriggerTiming};
use crate::trigger::body::{FunctionBody, Statement};
use crate::trigger::{StrategyContext, TriggerPair, leveled_trigger_name};

pub(crate) fn build(ctx: &StrategyContext<'_>) -> Result<Vec<TriggerPair>, PgDenormError> {
    let cache = ctx.cache;
    if ctx.plans.iter().any(|p| !p.aggregations.is_empty()) {
        return Err(PgDenormError::Unsupported(format!(
            "cache '{}' aggregates over its own target table",
            cache.name
        )));
    }

    let source_ident = cache.for_table.ident().to_string();
    let assigns: Vec<Statement> = ctx
        .plans
        .iter()
        .filter_map(|plan| {
            plan.expr_over_aggs.as_ref().map(|expr| Statement::Assign {
                target: format!("new.{}", plan.name),
                expr: expr.replace_table(&source_ident, "new"),
            })
        })
        .collect();

    let insert_name = leveled_trigger_name(cache, ctx.level, "bef_ins");
    let mut insert_body = FunctionBody::new();
    for stmt in &assigns {
        insert_body.push(stmt.clone());
    }
    insert_body.push(Statement::Return("new"));

    let watched: Vec<String> = ctx
        .source_columns(&cache.for_table)
        .into_iter()
        .filter(|c| !ctx.plans.iter().any(|p| p.name == *c))
        .collect();
    let update_name = leveled_trigger_name(cache, ctx.level, "bef_upd");
    let mut update_body = FunctionBody::new();
    match changed_condition(ctx, &watched) {
        Some(cond) => update_body.push(Statement::If {
            cond,
            then: assigns,
            otherwise: Vec::new(),
        }),
        None => {
            for stmt in assigns {
                update_body.push(stmt);
            }
        }
    }
    update_body.push(Statement::Return("new"));

    Ok(vec![
        TriggerPair {
            function: DatabaseFunction::trigger_fn(&insert_name, insert_body.to_plpgsql()),
            trigger: DatabaseTrigger {
                name: insert_name.clone(),
                table: cache.for_table.table.clone(),
                timing: TriggerTiming::Before,
                events: vec![TriggerEvent::Insert],
                when: None,
                procedure: insert_name,
            },
        },
        TriggerPair {
            function: DatabaseFunction::trigger_fn(&update_name, update_body.to_plpgsql()),
            trigger: DatabaseTrigger {
                name: update_name.clone(),
                table: cache.for_table.table.clone(),
                timing: TriggerTiming::Before,
                // No `update of` narrowing: chained caches set columns
                // from inside lower-level triggers, which an OF list on
                // the statement would not see.
                events: vec![TriggerEvent::Update(Vec::new())],
                when: None,
                procedure: update_name,
            },
        },
    ])
}

/// `new.c is distinct from old.c or …` over the watched columns, using
/// the dedicated array comparison helper for array-typed columns.
pub(crate) fn changed_condition(
    ctx: &StrategyContext<'_>,
    columns: &[String],
) -> Option<Expr> {
    let mut cond: Option<Expr> = None;
    for column in columns {
        let is_array = ctx
            .snapshot
            .is_some_and(|s| s.is_array_column(&ctx.cache.for_table.table, column));
        let changed = if is_array {
            Expr::func(
                "cm_is_distinct_arrays",
                vec![Expr::column("new", column), Expr::column("old", column)],
            )
        } else {
            Expr::binary(
                "is distinct from",
                Expr::column("new", column),
                Expr::column("old", column),
            )
        };
        cond = Some(match cond {
            Some(cond) => Expr::binary("or", cond, changed),
            None => changed,
        });
    }
    cond
}
