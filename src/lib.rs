//! Declarative incrementally-maintained cache columns for PostgreSQL.
//!
//! `pg_denorm` compiles `cache <name> for <table> ( select … )`
//! definitions into generated columns, trigger functions and triggers
//! that keep denormalized aggregates current on every write, plus a
//! batched backfill for existing rows.
//!
//! The pipeline:
//!
//! 1. [`parser`] turns definition text into the [`ast`] value types.
//! 2. [`lint`] rejects queries outside the maintainable subset, with the
//!    indexable rewrite suggested where one exists.
//! 3. [`deps`] maps which tables and columns each cache reads.
//! 4. [`agg`] decomposes each aggregate call into incremental plus/minus
//!    deltas, adding shadow `array_agg` helper columns where an aggregate
//!    cannot shrink incrementally.
//! 5. [`trigger`] synthesizes PL/pgSQL trigger bodies, one strategy per
//!    dependency table.
//! 6. [`graph`] orders dependent caches after the caches whose columns
//!    they read, failing cycles explicitly.
//! 7. [`migrate`] reconciles a live database through the [`driver`]
//!    trait: drop, create, batched backfill, metadata bookkeeping.
//!
//! Compilation ([`compile::compile_cache`], [`compile::compile_all`]) is
//! pure and deterministic; only [`migrate::migrate`] touches a database.

pub mod agg;
pub mod ast;
pub mod compile;
pub mod deps;
pub mod driver;
pub mod error;
pub mod graph;
pub mod lint;
pub mod meta;
pub mod migrate;
pub mod objects;
pub mod parser;
pub mod schema;
pub mod trigger;

pub use compile::{CompiledCache, compile_all, compile_cache, compile_cache_at};
pub use driver::{CacheDriver, DbError, PgDriver};
pub use error::{MigrationOutcome, PgDenormError};
pub use migrate::{BACKFILL_BATCH, migrate};
