//! Persisted per-cache metadata.
//!
//! One [`CacheMeta`] row is stored per applied cache. The migrator
//! compares the stored definition signature against the freshly compiled
//! one: a matching signature means the cache is untouched and its
//! objects, columns and backfilled data are reused as-is.
//!
//! The signature hashes the *normalized* definition (`Cache::to_sql()`),
//! so whitespace and comment edits in the source file do not force a
//! rebuild.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

use crate::compile::CompiledCache;

/// Fixed hash seed; changing it invalidates every stored signature.
const SIGNATURE_SEED: u64 = 0x7064_6e6d;

/// Hex signature of a normalized cache definition.
pub fn definition_signature(definition: &str) -> String {
    format!("{:016x}", xxh64(definition.as_bytes(), SIGNATURE_SEED))
}

/// The stored record of one applied cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMeta {
    pub name: String,
    /// Target table as `schema.table`.
    pub for_table: String,
    /// Normalized definition text as applied.
    pub definition: String,
    pub signature: String,
    /// Topological level the cache was applied at. Leveled trigger names
    /// embed it, so drops must be issued at the same level.
    #[serde(default)]
    pub level: usize,
    /// Every generated column, helper and winner columns included; used
    /// to drop columns the next version no longer generates.
    pub columns: Vec<String>,
    pub applied_at: DateTime<Utc>,
}

impl CacheMeta {
    pub fn from_compiled(compiled: &CompiledCache) -> Self {
        CacheMeta {
            name: compiled.cache.name.clone(),
            for_table: compiled.cache.for_table.table.to_string(),
            definition: compiled.definition.clone(),
            signature: definition_signature(&compiled.definition),
            level: compiled.level,
            columns: compiled.columns.iter().map(|c| c.name.clone()).collect(),
            applied_at: Utc::now(),
        }
    }

    /// Whether the stored cache is identical to the compiled one,
    /// installed object names included. A level shift keeps the
    /// definition but renames the leveled triggers, so it reapplies.
    pub fn matches(&self, compiled: &CompiledCache) -> bool {
        self.signature == definition_signature(&compiled.definition)
            && self.level == compiled.level
    }
}
