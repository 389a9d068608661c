//! Database object artifacts produced by compilation.
//!
//! Each artifact is a plain value with a deterministic `to_sql()` so two
//! compiles of the same definitions emit byte-identical DDL. Identity
//! (what the migrator diffs and drops by) is narrower than equality:
//! a function is identified by `(schema, name, args)`, a trigger by
//! `(name, table)`, a column by `(table, name)`.

use std::fmt::Write;

use crate::ast::TableId;

// ── Functions ──────────────────────────────────────────────────────────────

/// A PL/pgSQL (or SQL) function to install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseFunction {
    pub schema: String,
    pub name: String,
    /// Argument list as written between the parentheses, e.g.
    /// `arr anyarray, elem anyelement`.
    pub args: String,
    pub returns: String,
    pub language: String,
    pub body: String,
}

impl DatabaseFunction {
    pub fn trigger_fn(name: &str, body: String) -> Self {
        DatabaseFunction {
            schema: "public".to_string(),
            name: name.to_string(),
            args: String::new(),
            returns: "trigger".to_string(),
            language: "plpgsql".to_string(),
            body,
        }
    }

    /// Human-readable identity used in drop statements and error
    /// signatures.
    pub fn signature(&self) -> String {
        format!("{}.{}({})", self.schema, self.name, self.args)
    }

    /// Two functions are the same database object when schema, name and
    /// argument list match, regardless of body.
    pub fn same_object(&self, other: &DatabaseFunction) -> bool {
        self.schema == other.schema && self.name == other.name && self.args == other.args
    }

    pub fn to_sql(&self) -> String {
        format!(
            "create or replace function {}.{}({})\nreturns {}\nlanguage {} as $$\n{}\n$$",
            self.schema, self.name, self.args, self.returns, self.language, self.body
        )
    }

    pub fn drop_sql(&self) -> String {
        format!("drop function if exists {}", self.signature())
    }
}

// ── Triggers ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerTiming {
    Before,
    After,
}

impl TriggerTiming {
    pub fn as_sql(&self) -> &'static str {
        match self {
            TriggerTiming::Before => "before",
            TriggerTiming::After => "after",
        }
    }
}

/// One trigger event, with optional `update of <columns>` narrowing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerEvent {
    Insert,
    Delete,
    Update(Vec<String>),
}

impl TriggerEvent {
    pub fn to_sql(&self) -> String {
        match self {
            TriggerEvent::Insert => "insert".to_string(),
            TriggerEvent::Delete => "delete".to_string(),
            TriggerEvent::Update(columns) if columns.is_empty() => "update".to_string(),
            TriggerEvent::Update(columns) => format!("update of {}", columns.join(", ")),
        }
    }
}

/// A row-level trigger bound to a table, calling a trigger function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseTrigger {
    pub name: String,
    pub table: TableId,
    pub timing: TriggerTiming,
    pub events: Vec<TriggerEvent>,
    pub when: Option<String>,
    /// Name of the trigger function (same schema as the table).
    pub procedure: String,
}

impl DatabaseTrigger {
    pub fn signature(&self) -> String {
        format!("trigger {} on {}", self.name, self.table)
    }

    pub fn same_object(&self, other: &DatabaseTrigger) -> bool {
        self.name == other.name && self.table == other.table
    }

    pub fn to_sql(&self) -> String {
        let mut out = format!("create trigger {}\n{} ", self.name, self.timing.as_sql());
        out.push_str(
            &self
                .events
                .iter()
                .map(TriggerEvent::to_sql)
                .collect::<Vec<_>>()
                .join(" or "),
        );
        let _ = write!(out, "\non {}\nfor each row", self.table);
        if let Some(when) = &self.when {
            let _ = write!(out, "\nwhen ({when})");
        }
        let _ = write!(out, "\nexecute function {}()", self.procedure);
        out
    }

    pub fn drop_sql(&self) -> String {
        format!("drop trigger if exists {} on {}", self.name, self.table)
    }
}

// ── Columns ────────────────────────────────────────────────────────────────

/// A generated cache column on the target table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheColumn {
    pub table: TableId,
    pub name: String,
    pub type_name: String,
    pub default: String,
    /// Helper columns back a visible one and are excluded from user-facing
    /// listings.
    pub visible: bool,
}

impl CacheColumn {
    pub fn signature(&self) -> String {
        format!("column {} on {}", self.name, self.table)
    }

    pub fn same_object(&self, other: &CacheColumn) -> bool {
        self.table == other.table && self.name == other.name
    }

    pub fn add_sql(&self) -> String {
        format!(
            "alter table {} add column if not exists {} {} default {}",
            self.table, self.name, self.type_name, self.default
        )
    }

    pub fn drop_sql(&self) -> String {
        format!(
            "alter table {} drop column if exists {}",
            self.table, self.name
        )
    }
}

// ── Indexes ────────────────────────────────────────────────────────────────

/// A requested index over cache columns, named deterministically from the
/// cache it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheIndexArtifact {
    pub name: String,
    pub table: TableId,
    pub method: String,
    pub columns: Vec<String>,
}

impl CacheIndexArtifact {
    pub fn signature(&self) -> String {
        format!("index {} on {}", self.name, self.table)
    }

    pub fn to_sql(&self) -> String {
        format!(
            "create index if not exists {} on {} using {} ({})",
            self.name,
            self.table,
            self.method,
            self.columns.join(", ")
        )
    }

    pub fn drop_sql(&self) -> String {
        format!("drop index if exists {}", self.name)
    }
}
