//! Migration: reconcile the live database with a set of definitions.
//!
//! For every changed cache the migrator drops the previous objects and
//! installs the freshly compiled ones, then backfills the generated
//! columns in batches of [`BACKFILL_BATCH`] rows. A cache whose stored
//! signature matches the compiled definition is skipped whole, columns
//! and data included.
//!
//! Per-object DDL failures do not abort the run: they are collected into
//! the returned [`MigrationOutcome`] and the remaining objects still
//! migrate. Only setup failures (unreachable database, definitions that
//! do not compile) abort with `Err`.

use crate::compile::{CompiledCache, compile_all, compile_cache_at};
use crate::driver::{CacheDriver, DbError};
use crate::error::{MigrationOutcome, PgDenormError};
use crate::meta::CacheMeta;
use crate::schema::SchemaSnapshot;
use crate::trigger::helper_functions;

/// Rows per backfill statement.
pub const BACKFILL_BATCH: u64 = 500;

/// Apply a `;`-separated set of cache definitions to the database.
pub fn migrate(
    driver: &mut impl CacheDriver,
    definitions: &str,
) -> Result<MigrationOutcome, PgDenormError> {
    let snapshot = driver.load_schema().map_err(driver_err)?;
    let compiled = compile_all(definitions, Some(&snapshot))?;
    let existing = driver.load_cache_meta().map_err(driver_err)?;
    let mut outcome = MigrationOutcome::default();

    // Shared helpers first; trigger bodies call them.
    for helper in helper_functions() {
        if let Err(e) = driver.create_or_replace_function(&helper) {
            outcome.record(&helper.signature(), e);
        }
    }

    for cache in &compiled {
        let old = existing.iter().find(|m| m.name == cache.name());
        if old.is_some_and(|old| old.matches(cache)) {
            continue;
        }
        apply_cache(driver, cache, old, &snapshot, &mut outcome);
    }

    // Caches deleted from the definitions lose their objects and
    // metadata.
    for old in &existing {
        if !compiled.iter().any(|c| c.name() == old.name) {
            remove_cache(driver, old, &mut outcome);
        }
    }

    Ok(outcome)
}

fn driver_err(err: DbError) -> PgDenormError {
    PgDenormError::Driver(err.to_string())
}

/// Drop the previous version's objects, install the new ones, backfill.
fn apply_cache(
    driver: &mut impl CacheDriver,
    cache: &CompiledCache,
    old: Option<&CacheMeta>,
    snapshot: &SchemaSnapshot,
    outcome: &mut MigrationOutcome,
) {
    let errors_before = outcome.errors.len();
    drop_previous(driver, cache, old, outcome);

    for pair in &cache.triggers {
        if let Err(e) = driver.create_or_replace_function(&pair.function) {
            outcome.record(&pair.function.signature(), e);
        }
    }
    for pair in &cache.triggers {
        if let Err(e) = driver.create_trigger(&pair.trigger) {
            outcome.record(&pair.trigger.signature(), e);
        }
    }
    for column in &cache.columns {
        // An existing column with the right type is reused with its data;
        // a type change forces a rebuild of that column.
        let existing_type = snapshot.column_type(&column.table, &column.name);
        if existing_type.is_some_and(|t| t != column.type_name)
            && let Err(e) = driver.drop_column(&column.table, &column.name)
        {
            outcome.record(&column.signature(), e);
        }
        if let Err(e) = driver.create_column(column) {
            outcome.record(&column.signature(), e);
        }
    }
    for index in &cache.indexes {
        if let Err(e) = driver.create_index(index) {
            outcome.record(&index.signature(), e);
        }
    }

    backfill(driver, cache, outcome);

    // A failed step leaves the stored signature stale on purpose, so the
    // next run retries this cache.
    if outcome.errors.len() == errors_before {
        let meta = CacheMeta::from_compiled(cache);
        if let Err(e) = driver.save_cache_meta(&meta) {
            outcome.record(&format!("cache meta for {}", cache.name()), e);
        }
    }
}

/// Drop order: triggers, then their functions, then columns the new
/// version no longer generates. The previous object names come from
/// recompiling the stored definition at its stored level, so renamed or
/// re-leveled objects are dropped under the names actually installed.
fn drop_previous(
    driver: &mut impl CacheDriver,
    cache: &CompiledCache,
    old: Option<&CacheMeta>,
    outcome: &mut MigrationOutcome,
) {
    let previous = old.and_then(|old| compile_cache_at(&old.definition, None, old.level).ok());
    let doomed = previous.as_ref().unwrap_or(cache);

    for pair in &doomed.triggers {
        if let Err(e) = driver.force_drop_trigger(&pair.trigger) {
            outcome.record(&pair.trigger.signature(), e);
        }
    }
    for pair in &doomed.triggers {
        if let Err(e) = driver.force_drop_function(&pair.function) {
            // Another trigger may still reference the function; it will
            // be replaced in the create phase anyway.
            if !e.is_dependent_objects() {
                outcome.record(&pair.function.signature(), e);
            }
        }
    }

    if let Some(old) = old {
        let keep = cache.generated_columns();
        for column in &old.columns {
            if !keep.contains(column)
                && let Err(e) = driver.drop_column(&cache.cache.for_table.table, column)
            {
                outcome.record(
                    &format!("column {} on {}", column, cache.cache.for_table.table),
                    e,
                );
            }
        }
    }
}

/// Batched full recompute of the generated columns, `BACKFILL_BATCH`
/// target rows at a time, until a batch comes back short.
fn backfill(driver: &mut impl CacheDriver, cache: &CompiledCache, outcome: &mut MigrationOutcome) {
    let mut offset = 0u64;
    loop {
        let sql = cache.backfill_sql(BACKFILL_BATCH, offset);
        match driver.update_cache_batch(&sql) {
            Ok(affected) if affected < BACKFILL_BATCH => break,
            Ok(_) => offset += BACKFILL_BATCH,
            Err(e) => {
                outcome.record(&format!("backfill of cache {}", cache.name()), e);
                break;
            }
        }
    }
}

/// Tear down a cache that no longer appears in the definitions.
fn remove_cache(driver: &mut impl CacheDriver, old: &CacheMeta, outcome: &mut MigrationOutcome) {
    if let Ok(previous) = compile_cache_at(&old.definition, None, old.level) {
        for pair in &previous.triggers {
            if let Err(e) = driver.force_drop_trigger(&pair.trigger) {
                outcome.record(&pair.trigger.signature(), e);
            }
        }
        for pair in &previous.triggers {
            if let Err(e) = driver.force_drop_function(&pair.function) {
                if !e.is_dependent_objects() {
                    outcome.record(&pair.function.signature(), e);
                }
            }
        }
    }
    let table = crate::ast::TableId::parse(&old.for_table);
    for column in &old.columns {
        if let Err(e) = driver.drop_column(&table, column) {
            outcome.record(&format!("column {column} on {table}"), e);
        }
    }
    if let Err(e) = driver.delete_cache_meta(&old.name) {
        outcome.record(&format!("cache meta for {}", old.name), e);
    }
}
