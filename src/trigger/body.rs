//! PL/pgSQL function body construction.
//!
//! Trigger strategies assemble a [`FunctionBody`] out of structured
//! statements instead of formatting strings inline, so every strategy
//! renders with the same indentation, the same `declare` block layout,
//! and deterministic output for a given compiled cache.

use std::fmt::Write;

use crate::ast::{Expr, Select, TableId};

/// A variable in the function's `declare` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declare {
    pub name: String,
    pub type_name: String,
    pub default: Option<Expr>,
}

impl Declare {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Declare {
            name: name.into(),
            type_name: type_name.into(),
            default: None,
        }
    }
}

/// One PL/pgSQL statement. Rendering is single-purpose: only the shapes
/// the trigger strategies emit are representable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// `target := expr;`
    Assign { target: String, expr: Expr },
    /// `update <table> set c1 = e1, c2 = e2 where <cond>;`
    Update {
        table: TableId,
        set: Vec<(String, Expr)>,
        where_clause: Expr,
    },
    /// `select <exprs> into <vars> from …;` over a full select.
    SelectInto { vars: Vec<String>, select: Select },
    /// `if <cond> then … [else …] end if;`
    If {
        cond: Expr,
        then: Vec<Statement>,
        otherwise: Vec<Statement>,
    },
    /// `return new;` / `return old;` / `return null;`
    Return(&'static str),
}

impl Statement {
    fn render(&self, out: &mut String, indent: usize) {
        let pad = "    ".repeat(indent);
        match self {
            Statement::Assign { target, expr } => {
                let _ = writeln!(out, "{pad}{target} := {};", expr.to_sql());
            }
            Statement::Update {
                table,
                set,
                where_clause,
            } => {
                let _ = writeln!(out, "{pad}update {table} set");
                for (i, (column, expr)) in set.iter().enumerate() {
                    let sep = if i + 1 == set.len() { "" } else { "," };
                    let _ = writeln!(out, "{pad}    {column} = {}{sep}", expr.to_sql());
                }
                let _ = writeln!(out, "{pad}where {};", where_clause.to_sql());
            }
            Statement::SelectInto { vars, select } => {
                let sql = select.to_sql();
                // `into` goes right after the column list.
                let (cols, rest) = match sql.split_once(" from ") {
                    Some((cols, rest)) => (cols, Some(rest)),
                    None => (sql.as_str(), None),
                };
                let _ = write!(out, "{pad}{cols} into {}", vars.join(", "));
                match rest {
                    Some(rest) => {
                        let _ = writeln!(out, " from {rest};");
                    }
                    None => {
                        let _ = writeln!(out, ";");
                    }
                }
            }
            Statement::If {
                cond,
                then,
                otherwise,
            } => {
                let _ = writeln!(out, "{pad}if {} then", cond.to_sql());
                for stmt in then {
                    stmt.render(out, indent + 1);
                }
                if !otherwise.is_empty() {
                    let _ = writeln!(out, "{pad}else");
                    for stmt in otherwise {
                        stmt.render(out, indent + 1);
                    }
                }
                let _ = writeln!(out, "{pad}end if;");
            }
            Statement::Return(value) => {
                let _ = writeln!(out, "{pad}return {value};");
            }
        }
    }
}

/// A complete trigger function body: declarations plus statements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionBody {
    pub declares: Vec<Declare>,
    pub statements: Vec<Statement>,
}

impl FunctionBody {
    pub fn new() -> Self {
        FunctionBody::default()
    }

    /// Add a declaration unless a variable of the same name exists.
    /// Returns the variable name, so callers can declare-or-reuse.
    pub fn declare(&mut self, declare: Declare) -> String {
        if !self.declares.iter().any(|d| d.name == declare.name) {
            self.declares.push(declare.clone());
        }
        declare.name
    }

    pub fn push(&mut self, statement: Statement) {
        self.statements.push(statement);
    }

    /// Render the `declare … begin … end` block of a trigger function.
    pub fn to_plpgsql(&self) -> String {
        let mut out = String::new();
        if !self.declares.is_empty() {
            out.push_str("declare\n");
            for d in &self.declares {
                match &d.default {
                    Some(default) => {
                        let _ = writeln!(
                            out,
                            "    {} {} := {};",
                            d.name,
                            d.type_name,
                            default.to_sql()
                        );
                    }
                    None => {
                        let _ = writeln!(out, "    {} {};", d.name, d.type_name);
                    }
                }
            }
        }
        out.push_str("begin\n");
        for stmt in &self.statements {
            stmt.render(&mut out, 1);
        }
        out.push_str("end;");
        out
    }
}
