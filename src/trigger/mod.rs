//! Trigger synthesis.
//!
//! Every cache compiles to a set of `(trigger, trigger function)` pairs,
//! one pair per `(strategy, table)`. The strategy is selected per
//! dependency table from the shape of the cache query:
//!
//! - **last-row** — `order by … limit 1` caches; maintains a hidden
//!   winner-id column and re-evaluates the scan only for affected target
//!   rows ([`last_row`]).
//! - **self-row** — the select reads only the target table itself; a
//!   BEFORE trigger assigns the columns on the row being written
//!   ([`self_row`]).
//! - **commutative** — aggregate caches over a foreign table; AFTER
//!   triggers apply incremental plus/minus deltas ([`commutative`]).
//! - **self-by-other** — the select also reads target columns beyond
//!   `id`; leveled BEFORE triggers on the target recompute when those
//!   columns change ([`self_by_other`]).
//!
//! Strategy selection is a closed decision over these four; there is no
//! plugin seam. A query shape none of them covers is a lint error, not a
//! fallthrough.

pub mod body;
pub mod commutative;
pub mod last_row;
pub mod self_by_other;
pub mod self_row;

use crate::agg::{ColumnPlan, MAX_IDENT_LEN};
use crate::ast::{Cache, Expr, TableRef};
use crate::deps::{DependencyMap, Resolver};
use crate::error::PgDenormError;
use crate::objects::{DatabaseFunction, DatabaseTrigger};
use crate::schema::SchemaSnapshot;

/// One synthesized trigger and the function it executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerPair {
    pub function: DatabaseFunction,
    pub trigger: DatabaseTrigger,
}

/// Everything the strategy modules need about one compiled cache.
pub(crate) struct StrategyContext<'a> {
    pub cache: &'a Cache,
    pub deps: &'a DependencyMap,
    pub plans: &'a [ColumnPlan],
    pub snapshot: Option<&'a SchemaSnapshot>,
    /// Topological level of this cache among caches on the same target
    /// table; encoded into leveled trigger names so PostgreSQL's
    /// name-ordered firing runs dependencies first.
    pub level: usize,
}

impl StrategyContext<'_> {
    /// Columns of `source` referenced anywhere in the cache query.
    pub fn source_columns(&self, source: &TableRef) -> Vec<String> {
        self.deps
            .get(&source.table)
            .map(|cols| cols.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Target-table columns referenced by the query, excluding `id`.
    pub fn target_columns_beyond_id(&self) -> Vec<String> {
        self.deps
            .get(&self.cache.for_table.table)
            .map(|cols| cols.iter().filter(|c| *c != "id").cloned().collect())
            .unwrap_or_default()
    }
}

/// Build all trigger pairs for one compiled cache.
pub fn build_triggers(
    cache: &Cache,
    deps: &DependencyMap,
    plans: &[ColumnPlan],
    snapshot: Option<&SchemaSnapshot>,
    level: usize,
) -> Result<Vec<TriggerPair>, PgDenormError> {
    let ctx = StrategyContext {
        cache,
        deps,
        plans,
        snapshot,
        level,
    };
    let resolver = Resolver::new(cache);

    // Last-row caches own every table they touch.
    if cache.select.limit.is_some() && !cache.select.order_by.is_empty() {
        return last_row::build(&ctx);
    }

    let mut pairs = Vec::new();
    let mut target_is_only_source = false;
    for source in resolver.sources() {
        if resolver.is_target(source) {
            target_is_only_source = resolver.sources().len() == 1;
            continue;
        }
        if cache.triggers_suppressed_on(&source.table) {
            continue;
        }
        pairs.extend(commutative::build(&ctx, source)?);
    }

    if target_is_only_source {
        if !cache.triggers_suppressed_on(&cache.for_table.table) {
            pairs.extend(self_row::build(&ctx)?);
        }
        return Ok(pairs);
    }

    // Foreign-table caches additionally need target-side maintenance when
    // the query reads target columns other than the row key.
    if !ctx.target_columns_beyond_id().is_empty()
        && !cache.triggers_suppressed_on(&cache.for_table.table)
    {
        pairs.extend(self_by_other::build(&ctx)?);
    }
    Ok(pairs)
}

// ── Naming ─────────────────────────────────────────────────────────────────

/// Truncate a generated identifier to PostgreSQL's limit, keeping the
/// tail so disambiguating suffixes survive.
pub(crate) fn truncate_ident(name: &str) -> String {
    if name.len() <= MAX_IDENT_LEN {
        return name.to_string();
    }
    name[name.len() - MAX_IDENT_LEN..].to_string()
}

/// Trigger/function name for a commutative or last-row trigger on a
/// dependency table.
pub(crate) fn dep_trigger_name(cache: &Cache, dep_table_name: &str) -> String {
    truncate_ident(&format!(
        "cache_{}_for_{}_on_{}",
        cache.name, cache.for_table.table.name, dep_table_name
    ))
}

/// Leveled trigger/function name for target-side BEFORE triggers.
/// PostgreSQL fires same-event triggers in name order, so the zero-padded
/// level prefix sequences dependent caches after their dependencies.
pub(crate) fn leveled_trigger_name(cache: &Cache, level: usize, suffix: &str) -> String {
    truncate_ident(&format!(
        "cm{level:03}_{}_for_{}_{}",
        cache.name, cache.for_table.table.name, suffix
    ))
}

/// Hidden winner-id column of a last-row cache.
pub(crate) fn winner_column(cache: &Cache) -> String {
    truncate_ident(&format!("__{}_id", cache.name))
}

// ── Condition plumbing ─────────────────────────────────────────────────────

/// The condition matching one source row to its target rows: the query's
/// WHERE plus every join ON, conjoined.
pub(crate) fn match_condition(cache: &Cache) -> Option<Expr> {
    let mut cond = cache.select.where_clause.clone();
    for join in &cache.select.joins {
        if let Some(on) = &join.on {
            cond = Some(match cond {
                Some(cond) => Expr::binary("and", cond, on.clone()),
                None => on.clone(),
            });
        }
    }
    cond
}

/// `new.c is distinct from old.c or …` over the given source columns;
/// detects a row moving between target rows.
pub(crate) fn any_column_changed(columns: &[String]) -> Option<Expr> {
    let mut cond: Option<Expr> = None;
    for column in columns {
        let changed = Expr::binary(
            "is distinct from",
            Expr::column("new", column),
            Expr::column("old", column),
        );
        cond = Some(match cond {
            Some(cond) => Expr::binary("or", cond, changed),
            None => changed,
        });
    }
    cond
}

// ── Shared helper functions ────────────────────────────────────────────────

/// The `cm_*` SQL helper functions every installation carries. Installed
/// idempotently at the start of each migration run.
pub fn helper_functions() -> Vec<DatabaseFunction> {
    let sql_fn = |name: &str, args: &str, returns: &str, body: &str| DatabaseFunction {
        schema: "public".to_string(),
        name: name.to_string(),
        args: args.to_string(),
        returns: returns.to_string(),
        language: "sql".to_string(),
        body: body.to_string(),
    };

    let mut out = vec![
        // Removes exactly one occurrence, unlike array_remove which
        // removes all of them.
        sql_fn(
            "cm_array_remove_one_element",
            "arr anyarray, elem anyelement",
            "anyarray",
            "select arr[:pos - 1] || arr[pos + 1:]\n\
             from array_position(arr, elem) as pos\n\
             where pos is not null\n\
             union all select arr where array_position(arr, elem) is null\n\
             limit 1",
        ),
        sql_fn(
            "cm_is_distinct_arrays",
            "a anyarray, b anyarray",
            "boolean",
            "select a is distinct from b",
        ),
    ];

    for (suffix, order) in [
        ("asc_nulls_last", "item asc nulls last"),
        ("asc_nulls_first", "item asc nulls first"),
        ("desc_nulls_first", "item desc nulls first"),
        ("desc_nulls_last", "item desc nulls last"),
    ] {
        out.push(sql_fn(
            &format!("cm_array_insert_{suffix}"),
            "arr anyarray, elem anyelement",
            "anyarray",
            &format!(
                "select array_agg(item order by {order})\n\
                 from unnest(arr || elem) as item"
            ),
        ));
    }
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::agg::create_aggregations;
    use crate::deps::find_dependencies;
    use crate::parser::parse_cache;

    pub(crate) fn compile_pairs(src: &str) -> Vec<TriggerPair> {
        let cache = parse_cache(src).unwrap();
        let deps = find_dependencies(&cache).unwrap();
        let plans: Vec<_> = cache
            .select
            .columns
            .iter()
            .map(|c| create_aggregations(&cache, c, None).unwrap())
            .collect();
        build_triggers(&cache, &deps, &plans, None, 0).unwrap()
    }

    #[test]
    fn test_scenario_totals_builds_one_pair_on_orders() {
        let pairs = compile_pairs(
            "cache totals for companies (select sum(orders.profit) as orders_profit, \
             count(*) as orders_count from orders where orders.id_client = companies.id)",
        );
        assert_eq!(pairs.len(), 1);
        let pair = &pairs[0];
        assert_eq!(pair.trigger.name, "cache_totals_for_companies_on_orders");
        assert_eq!(pair.trigger.table.to_string(), "public.orders");
        assert_eq!(pair.function.name, pair.trigger.name);
    }

    #[test]
    fn test_without_triggers_suppresses_table() {
        let pairs = compile_pairs(
            "cache totals for companies (select count(*) as c from orders \
             left join order_type on order_type.id = orders.id_type \
             where orders.id_client = companies.id) \
             without triggers on order_type",
        );
        assert!(pairs.iter().all(|p| p.trigger.table.name != "order_type"));
        assert!(pairs.iter().any(|p| p.trigger.table.name == "orders"));
    }

    #[test]
    fn test_leveled_name_is_zero_padded() {
        let cache = parse_cache(
            "cache totals for companies (select count(*) as c from orders \
             where orders.id_client = companies.id)",
        )
        .unwrap();
        assert_eq!(
            leveled_trigger_name(&cache, 7, "bef_upd"),
            "cm007_totals_for_companies_bef_upd"
        );
    }

    #[test]
    fn test_name_truncation_keeps_tail() {
        let long = "x".repeat(100);
        let truncated = truncate_ident(&long);
        assert_eq!(truncated.len(), MAX_IDENT_LEN);
    }

    #[test]
    fn test_match_condition_conjoins_joins() {
        let cache = parse_cache(
            "cache totals for companies (select count(*) as c from orders \
             left join order_type on order_type.id = orders.id_type \
             where orders.id_client = companies.id)",
        )
        .unwrap();
        let cond = match_condition(&cache).unwrap();
        assert_eq!(
            cond.to_sql(),
            "((orders.id_client = companies.id) and (order_type.id = orders.id_type))"
        );
    }

    #[test]
    fn test_any_column_changed_disjunction() {
        let cond =
            any_column_changed(&["id_client".to_string(), "profit".to_string()]).unwrap();
        assert_eq!(
            cond.to_sql(),
            "((new.id_client is distinct from old.id_client) \
             or (new.profit is distinct from old.profit))"
        );
    }

    #[test]
    fn test_helper_inventory() {
        let helpers = helper_functions();
        let names: Vec<_> = helpers.iter().map(|f| f.name.as_str()).collect();
        assert!(names.contains(&"cm_array_remove_one_element"));
        assert!(names.contains(&"cm_array_insert_desc_nulls_first"));
        assert_eq!(names.len(), 6);
    }
}
