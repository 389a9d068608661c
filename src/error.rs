//! Error types for pg_denorm.
//!
//! All errors that can occur while compiling or applying cache definitions
//! are represented by [`PgDenormError`]. Errors are propagated via
//! `Result<T, PgDenormError>` throughout the codebase.
//!
//! # Error Classification
//!
//! Errors fall into two phases that determine propagation behavior:
//! - **Compile** — syntax, lint, dependency-resolution, and cycle errors.
//!   Always abort compilation of the offending cache; no partial trigger
//!   set is ever produced for it.
//! - **Apply** — per-object DDL failures during a migration run. Collected
//!   into a batch and returned together, so one broken object does not
//!   prevent unrelated objects from migrating.

use std::fmt;

/// Primary error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum PgDenormError {
    // ── Compile errors — abort the offending cache ───────────────────────
    /// The cache definition text could not be parsed.
    #[error("syntax error at line {line}, column {column}: {message}")]
    Syntax {
        line: usize,
        column: usize,
        message: String,
    },

    /// The cache uses a SQL construct outside the supported subset.
    #[error("unsupported construct: {0}")]
    Unsupported(String),

    /// The cache query violates a structural rule (missing alias, join
    /// without ON, …).
    #[error("invalid cache query: {0}")]
    InvalidCacheQuery(String),

    /// `order by … limit N` with N other than 1.
    #[error("invalid limit: {limit}, limit can be only 1")]
    InvalidLimit { limit: String },

    /// A WHERE shape that defeats index usage; carries the indexable
    /// rewrite.
    #[error("slow scan condition: {condition}; rewrite as: {suggestion}")]
    SlowScan {
        condition: String,
        suggestion: String,
    },

    /// A column or table reference did not resolve against the declared
    /// FROM sources or the cache's own target table.
    #[error("unresolved reference: {0}")]
    UnresolvedReference(String),

    /// Two caches mutually reference each other's generated columns.
    #[error("circular dependency between caches: {}", .0.join(" -> "))]
    CircularDependency(Vec<String>),

    // ── Apply errors — collected, run continues ──────────────────────────
    /// A single DDL statement failed against the live database. The
    /// offending object's human-readable signature is prepended.
    #[error("{signature}: {message}")]
    Migration { signature: String, message: String },

    /// An error surfaced by the database driver outside any one object.
    #[error("driver error: {0}")]
    Driver(String),
}

impl PgDenormError {
    /// Whether this error belongs to the compilation phase.
    ///
    /// Compile errors abort the cache; apply errors are accumulated.
    pub fn is_compile_error(&self) -> bool {
        matches!(
            self,
            PgDenormError::Syntax { .. }
                | PgDenormError::Unsupported(_)
                | PgDenormError::InvalidCacheQuery(_)
                | PgDenormError::InvalidLimit { .. }
                | PgDenormError::SlowScan { .. }
                | PgDenormError::UnresolvedReference(_)
                | PgDenormError::CircularDependency(_)
        )
    }

    /// Build a syntax error from a byte offset into the source text.
    pub fn syntax_at(source: &str, offset: usize, message: impl Into<String>) -> Self {
        let (line, column) = line_col(source, offset);
        PgDenormError::Syntax {
            line,
            column,
            message: message.into(),
        }
    }
}

/// Translate a byte offset into 1-based (line, column).
///
/// Offsets past the end of the text report the position just after the
/// last character.
pub fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let clamped = offset.min(source.len());
    let mut line = 1;
    let mut col = 1;
    for (i, ch) in source.char_indices() {
        if i >= clamped {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

/// Outcome of a migration run: every apply-phase failure from the run,
/// batched so the operator sees all of them at once.
#[derive(Debug, Default)]
pub struct MigrationOutcome {
    pub errors: Vec<PgDenormError>,
}

impl MigrationOutcome {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Record a per-object failure with the object signature prepended.
    pub fn record(&mut self, signature: &str, message: impl fmt::Display) {
        self.errors.push(PgDenormError::Migration {
            signature: signature.to_string(),
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_col_first_line() {
        assert_eq!(line_col("cache x for y", 0), (1, 1));
        assert_eq!(line_col("cache x for y", 6), (1, 7));
    }

    #[test]
    fn test_line_col_multiline() {
        let src = "cache x for y (\n    select 1\n)";
        let off = src.find("select").unwrap();
        assert_eq!(line_col(src, off), (2, 5));
    }

    #[test]
    fn test_line_col_past_end() {
        let src = "ab";
        assert_eq!(line_col(src, 99), (1, 3));
    }

    #[test]
    fn test_compile_classification() {
        let e = PgDenormError::Unsupported("GROUP BY".into());
        assert!(e.is_compile_error());
        let e = PgDenormError::Migration {
            signature: "trigger x on y".into(),
            message: "boom".into(),
        };
        assert!(!e.is_compile_error());
    }

    #[test]
    fn test_outcome_records_signature() {
        let mut out = MigrationOutcome::default();
        out.record("function public.f()", "cannot drop");
        assert!(!out.is_ok());
        assert_eq!(out.errors[0].to_string(), "function public.f(): cannot drop");
    }
}
