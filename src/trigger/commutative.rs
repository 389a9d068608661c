//! Commutative delta triggers on foreign dependency tables.
//!
//! An AFTER INSERT/DELETE/UPDATE row trigger on the source table applies
//! each aggregation's plus/minus delta to the matching target rows. The
//! UPDATE case splits on whether a linking column changed: unchanged
//! linkage applies a combined minus-then-plus delta to one target row,
//! changed linkage subtracts from the old target and adds to the new one.
//!
//! Joined sources are materialized into `%rowtype` variables before each
//! update so the match condition and aggregate arguments can read them.

use std::collections::BTreeMap;

use crate::agg::Aggregation;
use crate::ast::{Cache, Expr, FromItem, Select, SelectColumn, TableRef};
use crate::error::PgDenormError;
use crate::objects::{DatabaseFunction, DatabaseTrigger, TriggerEvent, TriggerTiming};
use crate::trigger::body::{Declare, FunctionBody, Statement};
use crate::trigger::{
    StrategyContext, TriggerPair, any_column_changed, dep_trigger_name, match_condition,
};

/// Qualifier substitutions applied when specializing query fragments for
/// a trigger body: `(as written, as referenced in the body)`.
type Subs = Vec<(String, String)>;

fn specialize(expr: &Expr, subs: &Subs) -> Expr {
    let mut out = expr.clone();
    for (from, to) in subs {
        out = out.replace_table(from, to);
    }
    out
}

/// Build the one trigger pair for `source`, a foreign dependency table.
pub(crate) fn build(
    ctx: &StrategyContext<'_>,
    source: &TableRef,
) -> Result<Vec<TriggerPair>, PgDenormError> {
    let cache = ctx.cache;
    let name = dep_trigger_name(cache, &source.table.name);

    let others: Vec<&TableRef> = cache
        .select
        .sources()
        .into_iter()
        .filter(|s| s.ident() != source.ident() && s.table != cache.for_table.table)
        .collect();

    let subs_new = make_subs(cache, source, &others, "new");
    let subs_old = make_subs(cache, source, &others, "old");

    let condition = match_condition(cache).ok_or_else(|| {
        PgDenormError::InvalidCacheQuery(format!(
            "cache '{}' has no condition linking {} rows to {}",
            cache.name, source.table, cache.for_table.table
        ))
    })?;

    let mut body = FunctionBody::new();
    for other in &others {
        body.declare(Declare::new(
            format!("v_{}", other.ident()),
            format!("{}%rowtype", other.table),
        ));
    }

    let insert_branch = if cache.insert_suppressed_on(&source.table) {
        Vec::new()
    } else {
        let mut stmts = load_join_vars(cache, source, &others, "new");
        stmts.push(update_stmt(
            ctx,
            &condition,
            &subs_new,
            delta_set_list(ctx, &subs_new, &subs_old, DeltaEvent::Insert),
        ));
        stmts
    };

    let mut delete_branch = load_join_vars(cache, source, &others, "old");
    delete_branch.push(update_stmt(
        ctx,
        &condition,
        &subs_old,
        delta_set_list(ctx, &subs_new, &subs_old, DeltaEvent::Delete),
    ));

    let update_branch = build_update_branch(ctx, source, &others, &condition, &subs_new, &subs_old);

    let mut dispatch = Statement::If {
        cond: tg_op_is("DELETE"),
        then: delete_branch,
        otherwise: update_branch,
    };
    if !insert_branch.is_empty() {
        dispatch = Statement::If {
            cond: tg_op_is("INSERT"),
            then: insert_branch,
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
    events.push(TriggerEvent::Update(ctx.source_columns(source)));

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

/// Substitutions for one row variant: the source becomes `new`/`old`,
/// joined sources become their loaded variables, the target alias (if
/// any) becomes the bare table name visible inside the UPDATE.
fn make_subs(cache: &Cache, source: &TableRef, others: &[&TableRef], row: &str) -> Subs {
    let mut subs: Subs = vec![(source.ident().to_string(), row.to_string())];
    for other in others {
        subs.push((other.ident().to_string(), format!("v_{}", other.ident())));
    }
    let target_ident = cache.for_table.ident();
    if target_ident != cache.for_table.table.name {
        subs.push((
            target_ident.to_string(),
            cache.for_table.table.name.clone(),
        ));
    }
    subs
}

/// `select * into v_<x> from <x> where <join on>` for every joined
/// source, specialized for the given row variant.
fn load_join_vars(
    cache: &Cache,
    source: &TableRef,
    others: &[&TableRef],
    row: &str,
) -> Vec<Statement> {
    let mut out = Vec::new();
    for other in others {
        let Some(join) = cache
            .select
            .joins
            .iter()
            .find(|j| j.from.as_table().is_some_and(|t| t.ident() == other.ident()))
        else {
            continue;
        };
        let Some(on) = &join.on else { continue };
        let mut on = on.replace_table(source.ident(), row);
        if let Some(alias) = &other.alias {
            on = on.replace_table(alias, &other.table.name);
        }
        out.push(Statement::SelectInto {
            vars: vec![format!("v_{}", other.ident())],
            select: Select {
                columns: vec![SelectColumn {
                    expr: Expr::literal("*"),
                    alias: None,
                }],
                from: vec![FromItem::Table(TableRef::new(other.table.clone(), None))],
                where_clause: Some(on),
                ..Select::default()
            },
        });
    }
    out
}

fn update_stmt(
    ctx: &StrategyContext<'_>,
    condition: &Expr,
    subs: &Subs,
    set: Vec<(String, Expr)>,
) -> Statement {
    Statement::Update {
        table: ctx.cache.for_table.table.clone(),
        set,
        where_clause: specialize(condition, subs),
    }
}

/// UPDATE dispatch: moved rows subtract from the old target and add to
/// the new one; rows that stayed apply one combined delta.
fn build_update_branch(
    ctx: &StrategyContext<'_>,
    source: &TableRef,
    others: &[&TableRef],
    condition: &Expr,
    subs_new: &Subs,
    subs_old: &Subs,
) -> Vec<Statement> {
    let cache = ctx.cache;
    let link_columns = linking_columns(ctx, source, condition);

    let mut moved = load_join_vars(cache, source, others, "old");
    moved.push(update_stmt(
        ctx,
        condition,
        subs_old,
        delta_set_list(ctx, subs_new, subs_old, DeltaEvent::Delete),
    ));
    moved.extend(load_join_vars(cache, source, others, "new"));
    moved.push(update_stmt(
        ctx,
        condition,
        subs_new,
        delta_set_list(ctx, subs_new, subs_old, DeltaEvent::Insert),
    ));

    let mut stayed = load_join_vars(cache, source, others, "new");
    stayed.push(update_stmt(
        ctx,
        condition,
        subs_new,
        delta_set_list(ctx, subs_new, subs_old, DeltaEvent::Update),
    ));

    match any_column_changed(&link_columns) {
        Some(changed) => vec![Statement::If {
            cond: changed,
            then: moved,
            otherwise: stayed,
        }],
        None => stayed,
    }
}

/// Source columns appearing in the match condition; a change in any of
/// them can move the row to a different target.
fn linking_columns(ctx: &StrategyContext<'_>, source: &TableRef, condition: &Expr) -> Vec<String> {
    let single_source = ctx.cache.select.single_from_table().is_some();
    let mut columns = Vec::new();
    condition.for_each(&mut |expr| {
        if let Expr::ColumnRef { table, column } = expr {
            let ours = match table {
                Some(qualifier) => source.matches(qualifier),
                None => single_source,
            };
            if ours && !columns.contains(column) {
                columns.push(column.clone());
            }
        }
    });
    columns.sort();
    columns
}

// ── Delta set lists ────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq)]
enum DeltaEvent {
    Insert,
    Delete,
    Update,
}

/// The full SET list for one update: helper columns first (their updated
/// expressions feed visible recomputes), then visible aggregate columns,
/// then composed expression columns. All expressions read the pre-update
/// row, so helper updates are inlined rather than referenced.
fn delta_set_list(
    ctx: &StrategyContext<'_>,
    subs_new: &Subs,
    subs_old: &Subs,
    event: DeltaEvent,
) -> Vec<(String, Expr)> {
    let mut set = Vec::new();
    for plan in ctx.plans {
        let mut updated_by_column: BTreeMap<String, Expr> = BTreeMap::new();

        // Helpers first.
        for agg in plan.aggregations.iter().filter(|a| !a.visible) {
            let updated = agg_delta(agg, subs_new, subs_old, event, None);
            updated_by_column.insert(agg.column.clone(), updated.clone());
            set.push((agg.column.clone(), updated));
        }
        for agg in plan.aggregations.iter().filter(|a| a.visible) {
            let helper_updated = agg
                .helper_column()
                .and_then(|h| updated_by_column.get(h))
                .cloned();
            let updated = agg_delta(agg, subs_new, subs_old, event, helper_updated.as_ref());
            updated_by_column.insert(agg.column.clone(), updated.clone());
            set.push((agg.column.clone(), updated));
        }

        // Composed column: the wrapping expression over the already
        // computed per-call updates.
        if let Some(expr) = &plan.expr_over_aggs {
            let composed = expr.rewrite(&mut |node| {
                if let Expr::ColumnRef {
                    table: Some(_),
                    column,
                } = node
                {
                    updated_by_column.get(column).cloned()
                } else {
                    None
                }
            });
            set.push((plan.name.clone(), specialize(&composed, subs_new)));
        }
    }
    set
}

/// One aggregation's updated expression for the event, with the FILTER
/// clause applied as a no-op guard when present.
fn agg_delta(
    agg: &Aggregation,
    subs_new: &Subs,
    subs_old: &Subs,
    event: DeltaEvent,
    helper_updated: Option<&Expr>,
) -> Expr {
    // The total's qualifier is the target as written; both substitution
    // sets map it to the bare table name visible inside the UPDATE.
    let total = specialize(&agg.total(), subs_new);
    let arg = agg.argument().cloned().unwrap_or(Expr::literal("null"));
    let new_value = specialize(&arg, subs_new);
    let old_value = specialize(&arg, subs_old);

    match event {
        DeltaEvent::Insert => filter_guard(
            agg,
            subs_new,
            agg.plus(total.clone(), new_value, helper_updated),
            total,
        ),
        DeltaEvent::Delete => filter_guard(
            agg,
            subs_old,
            agg.minus(total.clone(), old_value, helper_updated),
            total,
        ),
        DeltaEvent::Update => {
            if helper_updated.is_some() {
                // Recompute kinds take the combined helper delta whole.
                return agg.delta(total, old_value, new_value, helper_updated);
            }
            let after_minus = filter_guard(
                agg,
                subs_old,
                agg.minus(total.clone(), old_value, None),
                total,
            );
            filter_guard(
                agg,
                subs_new,
                agg.plus(after_minus.clone(), new_value, None),
                after_minus,
            )
        }
    }
}

/// `case when <filter> then <applied> else <unchanged> end`, or just
/// `applied` when the call has no FILTER clause.
fn filter_guard(agg: &Aggregation, subs: &Subs, applied: Expr, unchanged: Expr) -> Expr {
    match &agg.call.filter {
        Some(filter) => Expr::Case {
            when_then: vec![(specialize(filter, subs), applied)],
            else_expr: Some(Box::new(unchanged)),
        },
        None => applied,
    }
}
