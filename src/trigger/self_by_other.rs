//! Target-side maintenance for caches that read target columns.
//!
//! A foreign-table aggregate like
//! `sum(orders.profit * companies.fee)` goes stale when `companies.fee`
//! changes, even though no `orders` row moved. Leveled BEFORE triggers on
//! the target recompute the stored columns from scratch for the one row
//! being written; the subquery scans only that row's matching source rows,
//! so the cost stays proportional to the row's group.

use crate::ast::{Expr, Select, SelectColumn};
use crate::error::PgDenormError;
use crate::objects::{DatabaseFunction, DatabaseTrigger, TriggerEvent, TriggerTiming};
use crate::trigger::body::{FunctionBody, Statement};
use crate::trigger::self_row::changed_condition;
use crate::trigger::{StrategyContext, TriggerPair, leveled_trigger_name};

pub(crate) fn build(ctx: &StrategyContext<'_>) -> Result<Vec<TriggerPair>, PgDenormError> {
    let cache = ctx.cache;
    let assigns = recompute_assigns(ctx);

    let insert_name = leveled_trigger_name(cache, ctx.level, "bef_ins");
    let mut insert_body = FunctionBody::new();
    for stmt in &assigns {
        insert_body.push(stmt.clone());
    }
    insert_body.push(Statement::Return("new"));

    let update_name = leveled_trigger_name(cache, ctx.level, "bef_upd");
    let mut update_body = FunctionBody::new();
    let watched = ctx.target_columns_beyond_id();
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
                events: vec![TriggerEvent::Update(Vec::new())],
                when: None,
                procedure: update_name,
            },
        },
    ])
}

/// `new.<col> := (select <agg> from … where …)` for every stored column,
/// composed expression columns last (they read the freshly assigned
/// `new.<stored>` values).
fn recompute_assigns(ctx: &StrategyContext<'_>) -> Vec<Statement> {
    let cache = ctx.cache;
    let target_ident = cache.for_table.ident().to_string();
    let mut out = Vec::new();

    for plan in ctx.plans {
        for agg in &plan.aggregations {
            let select = Select {
                columns: vec![SelectColumn {
                    expr: Expr::FuncCall(agg.call.clone()),
                    alias: None,
                }],
                from: cache.select.from.clone(),
                joins: cache.select.joins.clone(),
                where_clause: cache.select.where_clause.clone(),
                ..Select::default()
            }
            .replace_table(&target_ident, "new");
            let mut value = Expr::ScalarSubquery(Box::new(select));
            if agg.default_value() != "null" {
                value = Expr::func(
                    "coalesce",
                    vec![value, Expr::literal(agg.default_value())],
                );
            }
            out.push(Statement::Assign {
                target: format!("new.{}", agg.column),
                expr: value,
            });
        }
        if let Some(expr) = &plan.expr_over_aggs {
            out.push(Statement::Assign {
                target: format!("new.{}", plan.name),
                expr: expr.replace_table(&target_ident, "new"),
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use crate::trigger::tests::compile_pairs;

    #[test]
    fn test_target_read_adds_leveled_before_triggers() {
        let pairs = compile_pairs(
            "cache weighted for companies (select sum(orders.profit * companies.fee) as w \
             from orders where orders.id_client = companies.id)",
        );
        // One commutative pair on orders plus two leveled pairs on
        // companies.
        assert_eq!(pairs.len(), 3);
        let names: Vec<_> = pairs.iter().map(|p| p.trigger.name.as_str()).collect();
        assert!(names.contains(&"cm000_weighted_for_companies_bef_ins"));
        assert!(names.contains(&"cm000_weighted_for_companies_bef_upd"));
    }

    #[test]
    fn test_recompute_scans_only_matching_rows() {
        let pairs = compile_pairs(
            "cache weighted for companies (select sum(orders.profit * companies.fee) as w \
             from orders where orders.id_client = companies.id)",
        );
        let upd = pairs
            .iter()
            .find(|p| p.trigger.name.ends_with("bef_upd"))
            .unwrap();
        let body = &upd.function.body;
        assert!(body.contains("if (new.fee is distinct from old.fee) then"), "got: {body}");
        assert!(
            body.contains(
                "new.w := coalesce((select sum((orders.profit * new.fee)) \
                 from public.orders where (orders.id_client = new.id)), 0);"
            ),
            "got: {body}"
        );
    }

    #[test]
    fn test_no_target_triggers_for_plain_key_join() {
        let pairs = compile_pairs(
            "cache totals for companies (select sum(orders.profit) as p \
             from orders where orders.id_client = companies.id)",
        );
        // Only the id links to the target; nothing to maintain from the
        // target side.
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].trigger.table.name, "orders");
    }
}
