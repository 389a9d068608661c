//! AST value types for cache definitions.
//!
//! Every node is an immutable data record: rewrites (`rewrite`,
//! `replace_table`) return a new tree and never mutate in place. This
//! matters because the same sub-select is cloned and specialized for
//! "old row" vs "new row" vs helper-column variants during trigger
//! synthesis.
//!
//! `to_sql()` is the inverse of parsing: `parse(x.to_sql())` yields a
//! structurally equal tree, and the printed text is byte-deterministic so
//! generated DDL can be diffed against a previously-applied state.

use std::fmt;

// ── Table identity ─────────────────────────────────────────────────────────

/// Fully-qualified table identity. The schema defaults to `public` when a
/// definition omits it.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct TableId {
    pub schema: String,
    pub name: String,
}

impl TableId {
    pub fn new(schema: &str, name: &str) -> Self {
        TableId {
            schema: schema.to_string(),
            name: name.to_string(),
        }
    }

    /// Parse `schema.table` or bare `table` (schema defaults to `public`).
    pub fn parse(text: &str) -> Self {
        match text.split_once('.') {
            Some((schema, name)) => TableId::new(schema, name),
            None => TableId::new("public", text),
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// A table reference as written in a definition: identity plus optional
/// alias. Column references qualify against [`TableRef::ident`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub table: TableId,
    pub alias: Option<String>,
}

impl TableRef {
    pub fn new(table: TableId, alias: Option<String>) -> Self {
        TableRef { table, alias }
    }

    /// The name column references use to qualify against this source:
    /// the alias when present, else the bare table name.
    pub fn ident(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.table.name)
    }

    /// Whether a qualifier as written (`orders`, `o`, `public.orders`)
    /// refers to this source.
    pub fn matches(&self, qualifier: &str) -> bool {
        if self.ident() == qualifier {
            return true;
        }
        // Alias hides the table name, per SQL scoping.
        if self.alias.is_none() {
            let id = TableId::parse(qualifier);
            return id == self.table;
        }
        false
    }

    pub fn to_sql(&self) -> String {
        match &self.alias {
            Some(alias) => format!("{} as {alias}", self.table),
            None => self.table.to_string(),
        }
    }
}

// ── Expressions ────────────────────────────────────────────────────────────

/// Aggregate/scalar function call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncCall {
    pub name: String,
    /// `count(*)`-style star argument.
    pub star: bool,
    pub distinct: bool,
    pub args: Vec<Expr>,
    /// ORDER BY inside the call's parentheses (aggregate ordering).
    pub order_by: Vec<OrderByItem>,
    /// `filter (where …)` clause.
    pub filter: Option<Box<Expr>>,
}

impl FuncCall {
    pub fn simple(name: &str, args: Vec<Expr>) -> Self {
        FuncCall {
            name: name.to_string(),
            star: false,
            distinct: false,
            args,
            order_by: Vec::new(),
            filter: None,
        }
    }

    pub fn to_sql(&self) -> String {
        let mut inner = String::new();
        if self.distinct {
            inner.push_str("distinct ");
        }
        if self.star {
            inner.push('*');
        } else {
            inner.push_str(
                &self
                    .args
                    .iter()
                    .map(Expr::to_sql)
                    .collect::<Vec<_>>()
                    .join(", "),
            );
        }
        if !self.order_by.is_empty() {
            inner.push_str(" order by ");
            inner.push_str(&order_by_sql(&self.order_by));
        }
        let mut out = format!("{}({inner})", self.name);
        if let Some(filter) = &self.filter {
            out.push_str(&format!(" filter (where {})", filter.to_sql()));
        }
        out
    }
}

/// One ORDER BY key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderByItem {
    pub expr: Expr,
    pub desc: bool,
    /// None means the PostgreSQL default for the direction.
    pub nulls_first: Option<bool>,
}

impl OrderByItem {
    pub fn asc(expr: Expr) -> Self {
        OrderByItem {
            expr,
            desc: false,
            nulls_first: None,
        }
    }

    pub fn to_sql(&self) -> String {
        let mut out = self.expr.to_sql();
        out.push_str(if self.desc { " desc" } else { " asc" });
        match self.nulls_first {
            Some(true) => out.push_str(" nulls first"),
            Some(false) => out.push_str(" nulls last"),
            None => {}
        }
        out
    }
}

fn order_by_sql(items: &[OrderByItem]) -> String {
    items
        .iter()
        .map(OrderByItem::to_sql)
        .collect::<Vec<_>>()
        .join(", ")
}

/// An expression tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// A column reference: `table.column` or bare `column`.
    ColumnRef {
        table: Option<String>,
        column: String,
    },
    /// A literal, kept as written (`1`, `'x'`, `null`, `true`).
    Literal(String),
    /// `left op right`.
    BinaryOp {
        op: String,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Prefix operator: `not x`, `-x`.
    UnaryOp { op: String, expr: Box<Expr> },
    /// A function call (aggregate or scalar).
    FuncCall(FuncCall),
    /// Searched CASE.
    Case {
        when_then: Vec<(Expr, Expr)>,
        else_expr: Option<Box<Expr>>,
    },
    /// `array[a, b, c]`.
    ArrayLiteral(Vec<Expr>),
    /// `expr::type`.
    Cast { expr: Box<Expr>, type_name: String },
    /// A parenthesized scalar sub-select. Rejected by the linter in user
    /// input; produced freely by the compiler for universal recomputes.
    ScalarSubquery(Box<Select>),
}

impl Expr {
    pub fn column(table: &str, column: &str) -> Expr {
        Expr::ColumnRef {
            table: Some(table.to_string()),
            column: column.to_string(),
        }
    }

    pub fn literal(text: &str) -> Expr {
        Expr::Literal(text.to_string())
    }

    pub fn binary(op: &str, left: Expr, right: Expr) -> Expr {
        Expr::BinaryOp {
            op: op.to_string(),
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn func(name: &str, args: Vec<Expr>) -> Expr {
        Expr::FuncCall(FuncCall::simple(name, args))
    }

    /// Convert the expression back to SQL text.
    pub fn to_sql(&self) -> String {
        match self {
            Expr::ColumnRef { table, column } => match table {
                Some(table) => format!("{table}.{column}"),
                None => column.clone(),
            },
            Expr::Literal(text) => text.clone(),
            Expr::BinaryOp { op, left, right } => {
                format!("({} {op} {})", left.to_sql(), right.to_sql())
            }
            Expr::UnaryOp { op, expr } => format!("({op} {})", expr.to_sql()),
            Expr::FuncCall(call) => call.to_sql(),
            Expr::Case {
                when_then,
                else_expr,
            } => {
                let mut out = String::from("case");
                for (when, then) in when_then {
                    out.push_str(&format!(" when {} then {}", when.to_sql(), then.to_sql()));
                }
                if let Some(else_expr) = else_expr {
                    out.push_str(&format!(" else {}", else_expr.to_sql()));
                }
                out.push_str(" end");
                out
            }
            Expr::ArrayLiteral(items) => format!(
                "array[{}]",
                items.iter().map(Expr::to_sql).collect::<Vec<_>>().join(", ")
            ),
            Expr::Cast { expr, type_name } => format!("{}::{type_name}", expr.to_sql()),
            Expr::ScalarSubquery(select) => format!("({})", select.to_sql()),
        }
    }

    /// Pre-order visit of every node in the tree, descending into
    /// sub-selects' expressions.
    pub fn for_each(&self, f: &mut impl FnMut(&Expr)) {
        f(self);
        match self {
            Expr::ColumnRef { .. } | Expr::Literal(_) => {}
            Expr::BinaryOp { left, right, .. } => {
                left.for_each(f);
                right.for_each(f);
            }
            Expr::UnaryOp { expr, .. } => expr.for_each(f),
            Expr::FuncCall(call) => {
                for arg in &call.args {
                    arg.for_each(f);
                }
                for key in &call.order_by {
                    key.expr.for_each(f);
                }
                if let Some(filter) = &call.filter {
                    filter.for_each(f);
                }
            }
            Expr::Case {
                when_then,
                else_expr,
            } => {
                for (when, then) in when_then {
                    when.for_each(f);
                    then.for_each(f);
                }
                if let Some(else_expr) = else_expr {
                    else_expr.for_each(f);
                }
            }
            Expr::ArrayLiteral(items) => {
                for item in items {
                    item.for_each(f);
                }
            }
            Expr::Cast { expr, .. } => expr.for_each(f),
            Expr::ScalarSubquery(select) => select.for_each_expr(f),
        }
    }

    /// Top-down rewrite returning a new tree. When `f` returns `Some`, the
    /// replacement is used as-is (no further descent into it); otherwise
    /// the node is rebuilt with rewritten children.
    pub fn rewrite(&self, f: &mut impl FnMut(&Expr) -> Option<Expr>) -> Expr {
        if let Some(replaced) = f(self) {
            return replaced;
        }
        match self {
            Expr::ColumnRef { .. } | Expr::Literal(_) => self.clone(),
            Expr::BinaryOp { op, left, right } => Expr::BinaryOp {
                op: op.clone(),
                left: Box::new(left.rewrite(f)),
                right: Box::new(right.rewrite(f)),
            },
            Expr::UnaryOp { op, expr } => Expr::UnaryOp {
                op: op.clone(),
                expr: Box::new(expr.rewrite(f)),
            },
            Expr::FuncCall(call) => Expr::FuncCall(FuncCall {
                name: call.name.clone(),
                star: call.star,
                distinct: call.distinct,
                args: call.args.iter().map(|a| a.rewrite(f)).collect(),
                order_by: call
                    .order_by
                    .iter()
                    .map(|key| OrderByItem {
                        expr: key.expr.rewrite(f),
                        desc: key.desc,
                        nulls_first: key.nulls_first,
                    })
                    .collect(),
                filter: call
                    .filter
                    .as_ref()
                    .map(|filter| Box::new(filter.rewrite(f))),
            }),
            Expr::Case {
                when_then,
                else_expr,
            } => Expr::Case {
                when_then: when_then
                    .iter()
                    .map(|(when, then)| (when.rewrite(f), then.rewrite(f)))
                    .collect(),
                else_expr: else_expr.as_ref().map(|e| Box::new(e.rewrite(f))),
            },
            Expr::ArrayLiteral(items) => {
                Expr::ArrayLiteral(items.iter().map(|i| i.rewrite(f)).collect())
            }
            Expr::Cast { expr, type_name } => Expr::Cast {
                expr: Box::new(expr.rewrite(f)),
                type_name: type_name.clone(),
            },
            Expr::ScalarSubquery(select) => {
                Expr::ScalarSubquery(Box::new(select.rewrite_exprs(f)))
            }
        }
    }

    /// Replace every column qualifier `from` with `to`. Used to specialize
    /// a select for `new`/`old` row records in trigger bodies.
    pub fn replace_table(&self, from: &str, to: &str) -> Expr {
        self.rewrite(&mut |node| match node {
            Expr::ColumnRef {
                table: Some(table),
                column,
            } if table == from => Some(Expr::column(to, column)),
            _ => None,
        })
    }

    /// Fold trivial arithmetic so delta round-trips normalize:
    /// `(t - e) + e` → `t`, `(t + e) - e` → `t`, `t + 0` / `t - 0` → `t`.
    pub fn simplify(&self) -> Expr {
        let folded = match self {
            Expr::BinaryOp { op, left, right } => Expr::BinaryOp {
                op: op.clone(),
                left: Box::new(left.simplify()),
                right: Box::new(right.simplify()),
            },
            Expr::UnaryOp { op, expr } => Expr::UnaryOp {
                op: op.clone(),
                expr: Box::new(expr.simplify()),
            },
            other => other.clone(),
        };
        if let Expr::BinaryOp { op, left, right } = &folded {
            // t + 0 / t - 0
            if (op == "+" || op == "-") && **right == Expr::Literal("0".to_string()) {
                return (**left).clone();
            }
            // (t - e) + e  /  (t + e) - e
            if let Expr::BinaryOp {
                op: inner_op,
                left: inner_left,
                right: inner_right,
            } = &**left
            {
                let cancels = (op == "+" && inner_op == "-") || (op == "-" && inner_op == "+");
                if cancels && inner_right == right {
                    return (**inner_left).clone();
                }
            }
        }
        folded
    }
}

// ── Select ─────────────────────────────────────────────────────────────────

/// One item of the select list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectColumn {
    pub expr: Expr,
    pub alias: Option<String>,
}

impl SelectColumn {
    pub fn name(&self) -> Option<&str> {
        match &self.alias {
            Some(alias) => Some(alias),
            None => match &self.expr {
                Expr::ColumnRef { column, .. } => Some(column),
                _ => None,
            },
        }
    }

    pub fn to_sql(&self) -> String {
        match &self.alias {
            Some(alias) => format!("{} as {alias}", self.expr.to_sql()),
            None => self.expr.to_sql(),
        }
    }
}

/// A FROM source. Subquery sources parse but are rejected by the linter;
/// function sources (`unnest(…) as item`) are produced only by the
/// compiler for universal-aggregate recomputes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FromItem {
    Table(TableRef),
    Subquery {
        select: Box<Select>,
        alias: Option<String>,
    },
    Function { expr: Expr, alias: String },
}

impl FromItem {
    pub fn as_table(&self) -> Option<&TableRef> {
        match self {
            FromItem::Table(table_ref) => Some(table_ref),
            FromItem::Subquery { .. } | FromItem::Function { .. } => None,
        }
    }

    pub fn to_sql(&self) -> String {
        match self {
            FromItem::Table(table_ref) => table_ref.to_sql(),
            FromItem::Subquery { select, alias } => match alias {
                Some(alias) => format!("({}) as {alias}", select.to_sql()),
                None => format!("({})", select.to_sql()),
            },
            FromItem::Function { expr, alias } => {
                format!("{} as {alias}", expr.to_sql())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
}

impl JoinKind {
    pub fn as_sql(&self) -> &'static str {
        match self {
            JoinKind::Inner => "inner join",
            JoinKind::Left => "left join",
            JoinKind::Right => "right join",
            JoinKind::Full => "full join",
        }
    }
}

/// One JOIN clause. `on` is optional at parse time; the linter requires it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    pub kind: JoinKind,
    pub from: FromItem,
    pub on: Option<Expr>,
}

impl Join {
    pub fn to_sql(&self) -> String {
        let mut out = format!("{} {}", self.kind.as_sql(), self.from.to_sql());
        if let Some(on) = &self.on {
            out.push_str(&format!(" on {}", on.to_sql()));
        }
        out
    }
}

/// The aggregate query of a cache. Parsed once, transformed by value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Select {
    /// `with name as (select …)` items. Parse-level only; the linter
    /// rejects any.
    pub with: Vec<(String, Select)>,
    pub columns: Vec<SelectColumn>,
    pub from: Vec<FromItem>,
    pub joins: Vec<Join>,
    pub where_clause: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub order_by: Vec<OrderByItem>,
    /// Kept as written so "invalid limit: 100" reports the original text.
    pub limit: Option<String>,
    /// `union [all] select …` tail. Parse-level only; rejected by lint.
    pub union: Option<Box<Select>>,
}

impl Select {
    pub fn to_sql(&self) -> String {
        let mut out = String::new();
        if !self.with.is_empty() {
            out.push_str("with ");
            out.push_str(
                &self
                    .with
                    .iter()
                    .map(|(name, select)| format!("{name} as ({})", select.to_sql()))
                    .collect::<Vec<_>>()
                    .join(", "),
            );
            out.push(' ');
        }
        out.push_str("select ");
        out.push_str(
            &self
                .columns
                .iter()
                .map(SelectColumn::to_sql)
                .collect::<Vec<_>>()
                .join(", "),
        );
        if !self.from.is_empty() {
            out.push_str(" from ");
            out.push_str(
                &self
                    .from
                    .iter()
                    .map(FromItem::to_sql)
                    .collect::<Vec<_>>()
                    .join(", "),
            );
        }
        for join in &self.joins {
            out.push(' ');
            out.push_str(&join.to_sql());
        }
        if let Some(where_clause) = &self.where_clause {
            out.push_str(&format!(" where {}", where_clause.to_sql()));
        }
        if !self.group_by.is_empty() {
            out.push_str(" group by ");
            out.push_str(
                &self
                    .group_by
                    .iter()
                    .map(Expr::to_sql)
                    .collect::<Vec<_>>()
                    .join(", "),
            );
        }
        if !self.order_by.is_empty() {
            out.push_str(" order by ");
            out.push_str(&order_by_sql(&self.order_by));
        }
        if let Some(limit) = &self.limit {
            out.push_str(&format!(" limit {limit}"));
        }
        if let Some(union) = &self.union {
            out.push_str(&format!(" union {}", union.to_sql()));
        }
        out
    }

    /// Visit every expression in the select, including nested selects.
    pub fn for_each_expr(&self, f: &mut impl FnMut(&Expr)) {
        for (_, with_select) in &self.with {
            with_select.for_each_expr(f);
        }
        for column in &self.columns {
            column.expr.for_each(f);
        }
        for item in &self.from {
            match item {
                FromItem::Subquery { select, .. } => select.for_each_expr(f),
                FromItem::Function { expr, .. } => expr.for_each(f),
                FromItem::Table(_) => {}
            }
        }
        for join in &self.joins {
            if let FromItem::Subquery { select, .. } = &join.from {
                select.for_each_expr(f);
            }
            if let Some(on) = &join.on {
                on.for_each(f);
            }
        }
        if let Some(where_clause) = &self.where_clause {
            where_clause.for_each(f);
        }
        for expr in &self.group_by {
            expr.for_each(f);
        }
        for key in &self.order_by {
            key.expr.for_each(f);
        }
        if let Some(union) = &self.union {
            union.for_each_expr(f);
        }
    }

    /// Rebuild the select with every expression rewritten through `f`.
    pub fn rewrite_exprs(&self, f: &mut impl FnMut(&Expr) -> Option<Expr>) -> Select {
        Select {
            with: self
                .with
                .iter()
                .map(|(name, select)| (name.clone(), select.rewrite_exprs(f)))
                .collect(),
            columns: self
                .columns
                .iter()
                .map(|column| SelectColumn {
                    expr: column.expr.rewrite(f),
                    alias: column.alias.clone(),
                })
                .collect(),
            from: self
                .from
                .iter()
                .map(|item| match item {
                    FromItem::Function { expr, alias } => FromItem::Function {
                        expr: expr.rewrite(f),
                        alias: alias.clone(),
                    },
                    other => other.clone(),
                })
                .collect(),
            joins: self
                .joins
                .iter()
                .map(|join| Join {
                    kind: join.kind,
                    from: join.from.clone(),
                    on: join.on.as_ref().map(|on| on.rewrite(f)),
                })
                .collect(),
            where_clause: self.where_clause.as_ref().map(|w| w.rewrite(f)),
            group_by: self.group_by.iter().map(|g| g.rewrite(f)).collect(),
            order_by: self
                .order_by
                .iter()
                .map(|key| OrderByItem {
                    expr: key.expr.rewrite(f),
                    desc: key.desc,
                    nulls_first: key.nulls_first,
                })
                .collect(),
            limit: self.limit.clone(),
            union: self.union.as_ref().map(|u| Box::new(u.rewrite_exprs(f))),
        }
    }

    /// Replace every column qualifier `from` with `to` across the select.
    pub fn replace_table(&self, from: &str, to: &str) -> Select {
        self.rewrite_exprs(&mut |node| match node {
            Expr::ColumnRef {
                table: Some(table),
                column,
            } if table == from => Some(Expr::column(to, column)),
            _ => None,
        })
    }

    /// The single FROM table, when the select has exactly one table source
    /// and no joins.
    pub fn single_from_table(&self) -> Option<&TableRef> {
        if self.from.len() == 1 && self.joins.is_empty() {
            self.from[0].as_table()
        } else {
            None
        }
    }

    /// All table sources declared in FROM and JOIN clauses, in order.
    pub fn sources(&self) -> Vec<&TableRef> {
        let mut out: Vec<&TableRef> = Vec::new();
        for item in &self.from {
            if let Some(table_ref) = item.as_table() {
                out.push(table_ref);
            }
        }
        for join in &self.joins {
            if let Some(table_ref) = join.from.as_table() {
                out.push(table_ref);
            }
        }
        out
    }
}

// ── Cache definition ───────────────────────────────────────────────────────

/// A requested index on the target table's cache columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheIndex {
    /// Index method: `btree` or `gin`.
    pub method: String,
    pub columns: Vec<String>,
}

impl CacheIndex {
    pub fn to_sql(&self) -> String {
        format!("index {} on ({})", self.method, self.columns.join(", "))
    }
}

/// A parsed `cache … for … ( select … )` definition. Immutable once
/// parsed; every downstream component consumes it by reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cache {
    pub name: String,
    pub for_table: TableRef,
    pub select: Select,
    /// Table names for which trigger generation is suppressed entirely.
    pub without_triggers_on: Vec<String>,
    /// Table names for which the INSERT case is suppressed.
    pub without_insert_on: Vec<String>,
    pub indexes: Vec<CacheIndex>,
}

impl Cache {
    /// Print the definition back to cache DSL text. Inverse of parsing:
    /// `parse(cache.to_sql())` is structurally equal to `cache`.
    pub fn to_sql(&self) -> String {
        let mut out = format!(
            "cache {} for {} (\n    {}\n)",
            self.name,
            self.for_table.to_sql(),
            self.select.to_sql()
        );
        for table in &self.without_insert_on {
            out.push_str(&format!("\nwithout insert case on {table}"));
        }
        for table in &self.without_triggers_on {
            out.push_str(&format!("\nwithout triggers on {table}"));
        }
        for index in &self.indexes {
            out.push('\n');
            out.push_str(&index.to_sql());
        }
        out
    }

    /// Whether triggers are suppressed for the given table.
    pub fn triggers_suppressed_on(&self, table: &TableId) -> bool {
        self.without_triggers_on
            .iter()
            .any(|name| TableId::parse(name) == *table)
    }

    /// Whether the INSERT case is suppressed for the given table.
    pub fn insert_suppressed_on(&self, table: &TableId) -> bool {
        self.without_insert_on
            .iter()
            .any(|name| TableId::parse(name) == *table)
    }
}
