//! Migration tests against a recording in-memory driver.

use std::collections::VecDeque;

use pg_denorm::ast::TableId;
use pg_denorm::driver::{CacheDriver, DbError};
use pg_denorm::meta::CacheMeta;
use pg_denorm::objects::{CacheColumn, CacheIndexArtifact, DatabaseFunction, DatabaseTrigger};
use pg_denorm::schema::SchemaSnapshot;
use pg_denorm::{compile_all, compile_cache, migrate};

const TOTALS: &str = "cache totals for companies (select sum(orders.profit) as orders_profit, \
                      count(*) as orders_count from orders \
                      where orders.id_client = companies.id)";

/// Reads `companies.orders_count`, so it sequences after `totals` and its
/// target-side triggers carry the `cm001` level prefix.
const MARGIN: &str = "cache margin for companies (select sum(orders.profit) / \
                      companies.orders_count as margin from orders \
                      where orders.id_client = companies.id)";

/// Records every driver call in order; failure injection per method.
#[derive(Default)]
struct MockDriver {
    schema: SchemaSnapshot,
    metas: Vec<CacheMeta>,
    /// Affected-row counts returned by successive backfill batches;
    /// exhausted entries return 0 (a short batch).
    batches: VecDeque<u64>,
    log: Vec<String>,
    drop_function_error: Option<DbError>,
    backfill_error: Option<DbError>,
}

impl MockDriver {
    fn position(&self, needle: &str) -> usize {
        self.log
            .iter()
            .position(|entry| entry.contains(needle))
            .unwrap_or_else(|| panic!("no log entry contains {needle:?}; log: {:#?}", self.log))
    }

    fn count(&self, needle: &str) -> usize {
        self.log.iter().filter(|entry| entry.contains(needle)).count()
    }
}

impl CacheDriver for MockDriver {
    fn load_schema(&mut self) -> Result<SchemaSnapshot, DbError> {
        self.log.push("load schema".to_string());
        Ok(self.schema.clone())
    }

    fn load_cache_meta(&mut self) -> Result<Vec<CacheMeta>, DbError> {
        self.log.push("load meta".to_string());
        Ok(self.metas.clone())
    }

    fn save_cache_meta(&mut self, meta: &CacheMeta) -> Result<(), DbError> {
        self.log.push(format!("save meta {}", meta.name));
        Ok(())
    }

    fn delete_cache_meta(&mut self, cache_name: &str) -> Result<(), DbError> {
        self.log.push(format!("delete meta {cache_name}"));
        Ok(())
    }

    fn create_or_replace_function(&mut self, function: &DatabaseFunction) -> Result<(), DbError> {
        self.log.push(format!("create function {}", function.name));
        Ok(())
    }

    fn force_drop_function(&mut self, function: &DatabaseFunction) -> Result<(), DbError> {
        self.log.push(format!("drop function {}", function.name));
        match &self.drop_function_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn create_trigger(&mut self, trigger: &DatabaseTrigger) -> Result<(), DbError> {
        self.log.push(format!("create trigger {}", trigger.name));
        Ok(())
    }

    fn force_drop_trigger(&mut self, trigger: &DatabaseTrigger) -> Result<(), DbError> {
        self.log.push(format!("drop trigger {}", trigger.name));
        Ok(())
    }

    fn create_column(&mut self, column: &CacheColumn) -> Result<(), DbError> {
        self.log.push(format!("add column {}", column.name));
        Ok(())
    }

    fn drop_column(&mut self, table: &TableId, column: &str) -> Result<(), DbError> {
        self.log.push(format!("drop column {column} on {table}"));
        Ok(())
    }

    fn create_index(&mut self, index: &CacheIndexArtifact) -> Result<(), DbError> {
        self.log.push(format!("create index {}", index.name));
        Ok(())
    }

    fn update_cache_batch(&mut self, sql: &str) -> Result<u64, DbError> {
        let offset = sql
            .rsplit_once("offset ")
            .map(|(_, tail)| tail.trim_end_matches(')').to_string())
            .unwrap_or_default();
        self.log.push(format!("backfill offset {offset}"));
        match &self.backfill_error {
            Some(err) => Err(err.clone()),
            None => Ok(self.batches.pop_front().unwrap_or(0)),
        }
    }
}

fn applied_meta(definition: &str) -> CacheMeta {
    CacheMeta::from_compiled(&compile_cache(definition, None).unwrap())
}

/// Metadata as a previous `migrate` run would have stored it, levels
/// included.
fn applied_metas(definitions: &str) -> Vec<CacheMeta> {
    compile_all(definitions, None)
        .unwrap()
        .iter()
        .map(CacheMeta::from_compiled)
        .collect()
}

#[test]
fn test_fresh_install_order() {
    let mut driver = MockDriver::default();
    let outcome = migrate(&mut driver, TOTALS).unwrap();
    assert!(outcome.is_ok(), "errors: {:?}", outcome.errors);

    // Setup and shared helpers precede everything cache-specific.
    assert_eq!(driver.position("load schema"), 0);
    assert_eq!(driver.position("load meta"), 1);
    assert_eq!(driver.count("create function cm_"), 6);

    // Drops run under the new names too (idempotent on a fresh database),
    // then functions before triggers before columns before backfill.
    let name = "cache_totals_for_companies_on_orders";
    let drop_trigger = driver.position(&format!("drop trigger {name}"));
    let drop_function = driver.position(&format!("drop function {name}"));
    let create_function = driver.position(&format!("create function {name}"));
    let create_trigger = driver.position(&format!("create trigger {name}"));
    let add_column = driver.position("add column orders_profit");
    let backfill = driver.position("backfill offset 0");
    let save = driver.position("save meta totals");
    assert!(drop_trigger < drop_function);
    assert!(drop_function < create_function);
    assert!(create_function < create_trigger);
    assert!(create_trigger < add_column);
    assert!(add_column < backfill);
    assert!(backfill < save);
}

#[test]
fn test_backfill_loops_until_short_batch() {
    let mut driver = MockDriver {
        batches: VecDeque::from([500, 500, 123]),
        ..MockDriver::default()
    };
    let outcome = migrate(&mut driver, TOTALS).unwrap();
    assert!(outcome.is_ok(), "errors: {:?}", outcome.errors);
    assert_eq!(driver.count("backfill"), 3);
    driver.position("backfill offset 0");
    driver.position("backfill offset 500");
    driver.position("backfill offset 1000");
}

#[test]
fn test_dependent_objects_on_function_drop_is_benign() {
    let mut driver = MockDriver {
        drop_function_error: Some(DbError {
            code: Some("2BP01".to_string()),
            message: "cannot drop function: other objects depend on it".to_string(),
        }),
        ..MockDriver::default()
    };
    let outcome = migrate(&mut driver, TOTALS).unwrap();
    assert!(outcome.is_ok(), "errors: {:?}", outcome.errors);
    driver.position("create function cache_totals_for_companies_on_orders");
    driver.position("save meta totals");
}

#[test]
fn test_other_drop_failures_are_recorded() {
    let mut driver = MockDriver {
        drop_function_error: Some(DbError {
            code: Some("42501".to_string()),
            message: "permission denied".to_string(),
        }),
        ..MockDriver::default()
    };
    let outcome = migrate(&mut driver, TOTALS).unwrap();
    assert!(!outcome.is_ok());
    // A failed step keeps the stored signature stale so the next run
    // retries this cache.
    assert_eq!(driver.count("save meta"), 0);
}

#[test]
fn test_unchanged_cache_is_skipped_whole() {
    let mut driver = MockDriver {
        metas: vec![applied_meta(TOTALS)],
        ..MockDriver::default()
    };
    let outcome = migrate(&mut driver, TOTALS).unwrap();
    assert!(outcome.is_ok(), "errors: {:?}", outcome.errors);
    assert_eq!(driver.count("drop trigger"), 0);
    assert_eq!(driver.count("create trigger"), 0);
    assert_eq!(driver.count("add column"), 0);
    assert_eq!(driver.count("backfill"), 0);
    assert_eq!(driver.count("save meta"), 0);
}

#[test]
fn test_redefinition_drops_stale_columns_under_old_names() {
    let old = "cache totals for companies (select sum(orders.profit) as p \
               from orders where orders.id_client = companies.id)";
    let mut driver = MockDriver {
        metas: vec![applied_meta(old)],
        ..MockDriver::default()
    };
    let outcome = migrate(&mut driver, TOTALS).unwrap();
    assert!(outcome.is_ok(), "errors: {:?}", outcome.errors);
    let drop_stale = driver.position("drop column p on public.companies");
    let add_new = driver.position("add column orders_profit");
    assert!(drop_stale < add_new);
    // The surviving trigger name is rebuilt, not duplicated.
    assert_eq!(driver.count("create trigger cache_totals_for_companies_on_orders"), 1);
}

#[test]
fn test_removed_cache_is_torn_down() {
    let mut driver = MockDriver {
        metas: vec![applied_meta(TOTALS)],
        ..MockDriver::default()
    };
    let outcome = migrate(
        &mut driver,
        "cache tally for companies (select count(*) as order_tally from orders \
         where orders.id_client = companies.id)",
    )
    .unwrap();
    assert!(outcome.is_ok(), "errors: {:?}", outcome.errors);
    let drop_trigger = driver.position("drop trigger cache_totals_for_companies_on_orders");
    let drop_profit = driver.position("drop column orders_profit on public.companies");
    driver.position("drop column orders_count on public.companies");
    let delete_meta = driver.position("delete meta totals");
    assert!(drop_trigger < drop_profit);
    assert!(drop_profit < delete_meta);
    driver.position("save meta tally");
}

#[test]
fn test_redefined_chained_cache_drops_installed_leveled_triggers() {
    let mut driver = MockDriver {
        metas: applied_metas(&format!("{TOTALS};\n{MARGIN}")),
        ..MockDriver::default()
    };
    let changed = MARGIN.replace("as margin", "as gross_margin");
    let outcome = migrate(&mut driver, &format!("{TOTALS};\n{changed}")).unwrap();
    assert!(outcome.is_ok(), "errors: {:?}", outcome.errors);

    // totals is unchanged at level 0 and skipped whole.
    assert_eq!(driver.count("create trigger cache_totals"), 0);

    // margin was installed at level 1; its drops must hit those names.
    let dropped = driver.position("drop trigger cm001_margin_for_companies_bef_ins");
    let created = driver.position("create trigger cm001_margin_for_companies_bef_ins");
    driver.position("drop trigger cm001_margin_for_companies_bef_upd");
    assert!(dropped < created);
    assert_eq!(driver.count("cm000_margin"), 0);
    driver.position("drop column margin on public.companies");
    driver.position("add column gross_margin");
}

#[test]
fn test_removed_chained_cache_drops_installed_leveled_triggers() {
    let mut driver = MockDriver {
        metas: applied_metas(&format!("{TOTALS};\n{MARGIN}")),
        ..MockDriver::default()
    };
    let outcome = migrate(&mut driver, TOTALS).unwrap();
    assert!(outcome.is_ok(), "errors: {:?}", outcome.errors);
    driver.position("drop trigger cm001_margin_for_companies_bef_ins");
    driver.position("drop trigger cm001_margin_for_companies_bef_upd");
    assert_eq!(driver.count("cm000_margin"), 0);
    let drop_column = driver.position("drop column margin on public.companies");
    let delete_meta = driver.position("delete meta margin");
    assert!(drop_column < delete_meta);
}

#[test]
fn test_level_change_alone_reinstalls_triggers() {
    // margin applied standalone runs at level 0; adding totals promotes
    // it to level 1, which renames its leveled triggers even though the
    // definition text is unchanged.
    let mut driver = MockDriver {
        metas: vec![applied_meta(MARGIN)],
        ..MockDriver::default()
    };
    let outcome = migrate(&mut driver, &format!("{TOTALS};\n{MARGIN}")).unwrap();
    assert!(outcome.is_ok(), "errors: {:?}", outcome.errors);
    let dropped = driver.position("drop trigger cm000_margin_for_companies_bef_ins");
    let created = driver.position("create trigger cm001_margin_for_companies_bef_ins");
    assert!(dropped < created);
    assert_eq!(driver.count("create trigger cm000_margin"), 0);
}

#[test]
fn test_failed_backfill_leaves_signature_stale() {
    let mut driver = MockDriver {
        backfill_error: Some(DbError::message("deadlock detected")),
        ..MockDriver::default()
    };
    let outcome = migrate(&mut driver, TOTALS).unwrap();
    assert!(!outcome.is_ok());
    assert!(
        outcome.errors[0]
            .to_string()
            .starts_with("backfill of cache totals:"),
        "got: {}",
        outcome.errors[0]
    );
    assert_eq!(driver.count("save meta"), 0);
}

#[test]
fn test_uncompilable_definitions_abort_before_ddl() {
    let mut driver = MockDriver::default();
    let err = migrate(&mut driver, "cache broken for companies (select count(*))").unwrap_err();
    assert!(err.is_compile_error());
    assert_eq!(driver.count("create function"), 0);
}
