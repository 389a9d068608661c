//! Parser for the cache definition language.
//!
//! Parses `cache <name> for <table> ( <select> ) [options]` text into a
//! [`Cache`] AST. The grammar is a hand-written recursive descent over a
//! token stream; every token carries its byte offset so syntax errors
//! report a line and column.
//!
//! The parser accepts a slightly wider language than the compiler
//! supports (CTEs, unions, subquery sources, GROUP BY all parse) — the
//! linter rejects those shapes with a descriptive message, which gives
//! much better errors than a parse failure would.

use crate::ast::{
    Cache, CacheIndex, Expr, FromItem, FuncCall, Join, JoinKind, OrderByItem, Select,
    SelectColumn, TableId, TableRef,
};
use crate::error::PgDenormError;

// ── Lexer ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum TokenKind {
    /// Unquoted identifier or keyword, folded to lowercase.
    Ident(String),
    /// Numeric literal, kept as written.
    Number(String),
    /// String literal, kept with its quotes.
    String(String),
    /// Operator or punctuation: `(`, `)`, `,`, `=`, `::`, `&&`, …
    Op(String),
    Eof,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    pos: usize,
}

fn lex(source: &str) -> Result<Vec<Token>, PgDenormError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        // Line comments
        if c == '-' && bytes.get(i + 1) == Some(&b'-') {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }
        let start = i;
        if c.is_ascii_alphabetic() || c == '_' {
            while i < bytes.len()
                && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_')
            {
                i += 1;
            }
            let word = source[start..i].to_ascii_lowercase();
            tokens.push(Token {
                kind: TokenKind::Ident(word),
                pos: start,
            });
            continue;
        }
        if c.is_ascii_digit() {
            while i < bytes.len()
                && ((bytes[i] as char).is_ascii_digit() || bytes[i] == b'.')
            {
                i += 1;
            }
            tokens.push(Token {
                kind: TokenKind::Number(source[start..i].to_string()),
                pos: start,
            });
            continue;
        }
        if c == '\'' {
            i += 1;
            loop {
                if i >= bytes.len() {
                    return Err(PgDenormError::syntax_at(
                        source,
                        start,
                        "unterminated string literal",
                    ));
                }
                if bytes[i] == b'\'' {
                    // Doubled quote is an escaped quote.
                    if bytes.get(i + 1) == Some(&b'\'') {
                        i += 2;
                        continue;
                    }
                    i += 1;
                    break;
                }
                i += 1;
            }
            tokens.push(Token {
                kind: TokenKind::String(source[start..i].to_string()),
                pos: start,
            });
            continue;
        }
        // Multi-character operators first, longest match wins.
        const OPS: &[&str] = &[
            "::", "<=", ">=", "<>", "!=", "&&", "||", "@>", "<@", "->>", "->",
        ];
        let rest = &source[i..];
        if let Some(op) = OPS.iter().find(|op| rest.starts_with(**op)) {
            tokens.push(Token {
                kind: TokenKind::Op((*op).to_string()),
                pos: start,
            });
            i += op.len();
            continue;
        }
        if "(),.*=<>+-/%;[]".contains(c) {
            tokens.push(Token {
                kind: TokenKind::Op(c.to_string()),
                pos: start,
            });
            i += 1;
            continue;
        }
        return Err(PgDenormError::syntax_at(
            source,
            start,
            format!("unexpected character '{c}'"),
        ));
    }
    tokens.push(Token {
        kind: TokenKind::Eof,
        pos: source.len(),
    });
    Ok(tokens)
}

// ── Parser ─────────────────────────────────────────────────────────────────

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    idx: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Result<Self, PgDenormError> {
        Ok(Parser {
            source,
            tokens: lex(source)?,
            idx: 0,
        })
    }

    fn peek(&self) -> &TokenKind {
        &self.tokens[self.idx].kind
    }

    fn pos(&self) -> usize {
        self.tokens[self.idx].pos
    }

    fn advance(&mut self) -> TokenKind {
        let kind = self.tokens[self.idx].kind.clone();
        if self.idx + 1 < self.tokens.len() {
            self.idx += 1;
        }
        kind
    }

    fn error(&self, message: impl Into<String>) -> PgDenormError {
        PgDenormError::syntax_at(self.source, self.pos(), message)
    }

    /// Peek: is the current token the given keyword?
    fn at_keyword(&self, word: &str) -> bool {
        matches!(self.peek(), TokenKind::Ident(w) if w == word)
    }

    /// Consume the keyword if present.
    fn eat_keyword(&mut self, word: &str) -> bool {
        if self.at_keyword(word) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, word: &str) -> Result<(), PgDenormError> {
        if self.eat_keyword(word) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{word}'")))
        }
    }

    fn at_op(&self, op: &str) -> bool {
        matches!(self.peek(), TokenKind::Op(o) if o == op)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.at_op(op) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> Result<(), PgDenormError> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{op}'")))
        }
    }

    fn expect_ident(&mut self) -> Result<String, PgDenormError> {
        match self.peek() {
            TokenKind::Ident(word) => {
                let word = word.clone();
                self.advance();
                Ok(word)
            }
            _ => Err(self.error("expected identifier")),
        }
    }

    /// `schema.table` or bare `table`.
    fn parse_table_id(&mut self) -> Result<TableId, PgDenormError> {
        let first = self.expect_ident()?;
        if self.eat_op(".") {
            let name = self.expect_ident()?;
            Ok(TableId::new(&first, &name))
        } else {
            Ok(TableId::parse(&first))
        }
    }

    /// `table [as alias]` — the `as` is optional before a bare alias.
    fn parse_table_ref(&mut self) -> Result<TableRef, PgDenormError> {
        let table = self.parse_table_id()?;
        let alias = self.parse_optional_alias();
        Ok(TableRef::new(table, alias))
    }

    fn parse_optional_alias(&mut self) -> Option<String> {
        if self.eat_keyword("as") {
            // After `as` any identifier is the alias.
            return match self.peek() {
                TokenKind::Ident(word) => {
                    let word = word.clone();
                    self.advance();
                    Some(word)
                }
                _ => None,
            };
        }
        // A bare identifier that is not a clause keyword is an alias.
        if let TokenKind::Ident(word) = self.peek() {
            const CLAUSE_WORDS: &[&str] = &[
                "from", "where", "group", "order", "limit", "left", "right", "inner", "full",
                "join", "on", "union", "without", "index", "for", "and", "or", "asc", "desc",
                "nulls", "filter", "when", "then", "else", "end", "is", "not", "like", "ilike",
            ];
            if !CLAUSE_WORDS.contains(&word.as_str()) {
                let word = word.clone();
                self.advance();
                return Some(word);
            }
        }
        None
    }

    // ── Cache grammar ──────────────────────────────────────────────────

    fn parse_cache(&mut self) -> Result<Cache, PgDenormError> {
        self.expect_keyword("cache")?;
        let name = self.expect_ident()?;
        self.expect_keyword("for")?;
        let for_table = self.parse_table_ref()?;
        self.expect_op("(")?;
        let select = self.parse_select()?;
        self.expect_op(")")?;

        let mut without_triggers_on = Vec::new();
        let mut without_insert_on = Vec::new();
        let mut indexes = Vec::new();
        loop {
            if self.eat_keyword("without") {
                if self.eat_keyword("insert") {
                    self.expect_keyword("case")?;
                    self.expect_keyword("on")?;
                    without_insert_on.push(self.parse_table_id()?.to_string());
                } else if self.eat_keyword("trigger") || self.eat_keyword("triggers") {
                    self.expect_keyword("on")?;
                    without_triggers_on.push(self.parse_table_id()?.to_string());
                } else {
                    return Err(self.error("expected 'insert case on' or 'triggers on'"));
                }
                continue;
            }
            if self.eat_keyword("index") {
                let method = self.expect_ident()?;
                if method != "btree" && method != "gin" {
                    return Err(self.error(format!("unknown index method '{method}'")));
                }
                self.expect_keyword("on")?;
                self.expect_op("(")?;
                let mut columns = vec![self.expect_ident()?];
                while self.eat_op(",") {
                    columns.push(self.expect_ident()?);
                }
                self.expect_op(")")?;
                indexes.push(CacheIndex { method, columns });
                continue;
            }
            break;
        }

        Ok(Cache {
            name,
            for_table,
            select,
            without_triggers_on,
            without_insert_on,
            indexes,
        })
    }

    // ── Select grammar ─────────────────────────────────────────────────

    fn parse_select(&mut self) -> Result<Select, PgDenormError> {
        let mut with = Vec::new();
        if self.eat_keyword("with") {
            loop {
                let name = self.expect_ident()?;
                self.expect_keyword("as")?;
                self.expect_op("(")?;
                let body = self.parse_select()?;
                self.expect_op(")")?;
                with.push((name, body));
                if !self.eat_op(",") {
                    break;
                }
            }
        }

        self.expect_keyword("select")?;
        let mut columns = vec![self.parse_select_column()?];
        while self.eat_op(",") {
            columns.push(self.parse_select_column()?);
        }

        let mut from = Vec::new();
        if self.eat_keyword("from") {
            from.push(self.parse_from_item()?);
            while self.eat_op(",") {
                from.push(self.parse_from_item()?);
            }
        }

        let mut joins = Vec::new();
        loop {
            let kind = if self.eat_keyword("left") {
                JoinKind::Left
            } else if self.eat_keyword("right") {
                JoinKind::Right
            } else if self.eat_keyword("full") {
                JoinKind::Full
            } else if self.eat_keyword("inner") {
                JoinKind::Inner
            } else if self.at_keyword("join") {
                JoinKind::Inner
            } else {
                break;
            };
            self.expect_keyword("join")?;
            let join_from = self.parse_from_item()?;
            let on = if self.eat_keyword("on") {
                Some(self.parse_expr()?)
            } else {
                None
            };
            joins.push(Join {
                kind,
                from: join_from,
                on,
            });
        }

        let where_clause = if self.eat_keyword("where") {
            Some(self.parse_expr()?)
        } else {
            None
        };

        let mut group_by = Vec::new();
        if self.eat_keyword("group") {
            self.expect_keyword("by")?;
            group_by.push(self.parse_expr()?);
            while self.eat_op(",") {
                group_by.push(self.parse_expr()?);
            }
        }

        let mut order_by = Vec::new();
        if self.eat_keyword("order") {
            self.expect_keyword("by")?;
            order_by.push(self.parse_order_by_item()?);
            while self.eat_op(",") {
                order_by.push(self.parse_order_by_item()?);
            }
        }

        let limit = if self.eat_keyword("limit") {
            match self.peek() {
                TokenKind::Number(text) => {
                    let text = text.clone();
                    self.advance();
                    Some(text)
                }
                _ => return Err(self.error("expected a number after 'limit'")),
            }
        } else {
            None
        };

        let union = if self.eat_keyword("union") {
            self.eat_keyword("all");
            Some(Box::new(self.parse_select()?))
        } else {
            None
        };

        Ok(Select {
            with,
            columns,
            from,
            joins,
            where_clause,
            group_by,
            order_by,
            limit,
            union,
        })
    }

    fn parse_select_column(&mut self) -> Result<SelectColumn, PgDenormError> {
        let expr = self.parse_expr()?;
        let alias = self.parse_optional_alias();
        Ok(SelectColumn { expr, alias })
    }

    fn parse_from_item(&mut self) -> Result<FromItem, PgDenormError> {
        if self.at_op("(") {
            self.advance();
            let select = self.parse_select()?;
            self.expect_op(")")?;
            let alias = self.parse_optional_alias();
            return Ok(FromItem::Subquery {
                select: Box::new(select),
                alias,
            });
        }
        Ok(FromItem::Table(self.parse_table_ref()?))
    }

    fn parse_order_by_item(&mut self) -> Result<OrderByItem, PgDenormError> {
        let expr = self.parse_expr()?;
        let desc = if self.eat_keyword("desc") {
            true
        } else {
            self.eat_keyword("asc");
            false
        };
        let nulls_first = if self.eat_keyword("nulls") {
            if self.eat_keyword("first") {
                Some(true)
            } else {
                self.expect_keyword("last")?;
                Some(false)
            }
        } else {
            None
        };
        Ok(OrderByItem {
            expr,
            desc,
            nulls_first,
        })
    }

    // ── Expression grammar, precedence climbing ────────────────────────

    fn parse_expr(&mut self) -> Result<Expr, PgDenormError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, PgDenormError> {
        let mut left = self.parse_and()?;
        while self.eat_keyword("or") {
            let right = self.parse_and()?;
            left = Expr::binary("or", left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, PgDenormError> {
        let mut left = self.parse_not()?;
        while self.eat_keyword("and") {
            let right = self.parse_not()?;
            left = Expr::binary("and", left, right);
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, PgDenormError> {
        if self.eat_keyword("not") {
            let expr = self.parse_not()?;
            return Ok(Expr::UnaryOp {
                op: "not".to_string(),
                expr: Box::new(expr),
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, PgDenormError> {
        let left = self.parse_additive()?;
        const CMP: &[&str] = &["=", "!=", "<>", "<", "<=", ">", ">=", "&&", "@>", "<@"];
        for op in CMP {
            if self.at_op(op) {
                self.advance();
                let right = self.parse_additive()?;
                return Ok(Expr::binary(op, left, right));
            }
        }
        if self.at_keyword("like") || self.at_keyword("ilike") {
            let op = self.expect_ident()?;
            let right = self.parse_additive()?;
            return Ok(Expr::binary(&op, left, right));
        }
        if self.eat_keyword("is") {
            let op = if self.eat_keyword("not") { "is not" } else { "is" };
            self.expect_keyword("null")?;
            return Ok(Expr::binary(op, left, Expr::literal("null")));
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, PgDenormError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = if self.at_op("+") {
                "+"
            } else if self.at_op("-") {
                "-"
            } else if self.at_op("||") {
                "||"
            } else {
                break;
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expr::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, PgDenormError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = if self.at_op("*") {
                "*"
            } else if self.at_op("/") {
                "/"
            } else if self.at_op("%") {
                "%"
            } else {
                break;
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, PgDenormError> {
        if self.eat_op("-") {
            let expr = self.parse_unary()?;
            return Ok(Expr::UnaryOp {
                op: "-".to_string(),
                expr: Box::new(expr),
            });
        }
        self.parse_postfix()
    }

    /// Postfix `::type` casts bind tighter than any operator.
    fn parse_postfix(&mut self) -> Result<Expr, PgDenormError> {
        let mut expr = self.parse_primary()?;
        while self.eat_op("::") {
            let mut type_name = self.expect_ident()?;
            if self.eat_op("[") {
                self.expect_op("]")?;
                type_name.push_str("[]");
            }
            expr = Expr::Cast {
                expr: Box::new(expr),
                type_name,
            };
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, PgDenormError> {
        match self.peek().clone() {
            TokenKind::Number(text) => {
                self.advance();
                Ok(Expr::Literal(text))
            }
            TokenKind::String(text) => {
                self.advance();
                Ok(Expr::Literal(text))
            }
            TokenKind::Op(op) if op == "(" => {
                self.advance();
                // Parenthesized sub-select or plain grouping.
                if self.at_keyword("select") || self.at_keyword("with") {
                    let select = self.parse_select()?;
                    self.expect_op(")")?;
                    return Ok(Expr::ScalarSubquery(Box::new(select)));
                }
                let expr = self.parse_expr()?;
                self.expect_op(")")?;
                Ok(expr)
            }
            TokenKind::Ident(word) => match word.as_str() {
                "null" | "true" | "false" => {
                    self.advance();
                    Ok(Expr::Literal(word))
                }
                "case" => self.parse_case(),
                "array" => {
                    self.advance();
                    self.expect_op("[")?;
                    let mut items = Vec::new();
                    if !self.at_op("]") {
                        items.push(self.parse_expr()?);
                        while self.eat_op(",") {
                            items.push(self.parse_expr()?);
                        }
                    }
                    self.expect_op("]")?;
                    Ok(Expr::ArrayLiteral(items))
                }
                _ => self.parse_ident_expr(),
            },
            _ => Err(self.error("expected expression")),
        }
    }

    fn parse_case(&mut self) -> Result<Expr, PgDenormError> {
        self.expect_keyword("case")?;
        let mut when_then = Vec::new();
        while self.eat_keyword("when") {
            let when = self.parse_expr()?;
            self.expect_keyword("then")?;
            let then = self.parse_expr()?;
            when_then.push((when, then));
        }
        if when_then.is_empty() {
            return Err(self.error("expected 'when' after 'case'"));
        }
        let else_expr = if self.eat_keyword("else") {
            Some(Box::new(self.parse_expr()?))
        } else {
            None
        };
        self.expect_keyword("end")?;
        Ok(Expr::Case {
            when_then,
            else_expr,
        })
    }

    /// Identifier-led expression: function call or column reference.
    fn parse_ident_expr(&mut self) -> Result<Expr, PgDenormError> {
        let first = self.expect_ident()?;
        if self.at_op("(") {
            return self.parse_func_call(first);
        }
        if self.eat_op(".") {
            let column = self.expect_ident()?;
            return Ok(Expr::column(&first, &column));
        }
        Ok(Expr::ColumnRef {
            table: None,
            column: first,
        })
    }

    fn parse_func_call(&mut self, name: String) -> Result<Expr, PgDenormError> {
        self.expect_op("(")?;
        let mut call = FuncCall {
            name,
            star: false,
            distinct: false,
            args: Vec::new(),
            order_by: Vec::new(),
            filter: None,
        };
        if self.eat_op("*") {
            call.star = true;
        } else if !self.at_op(")") {
            call.distinct = self.eat_keyword("distinct");
            call.args.push(self.parse_expr()?);
            while self.eat_op(",") {
                call.args.push(self.parse_expr()?);
            }
            if self.eat_keyword("order") {
                self.expect_keyword("by")?;
                call.order_by.push(self.parse_order_by_item()?);
                while self.eat_op(",") {
                    call.order_by.push(self.parse_order_by_item()?);
                }
            }
        }
        self.expect_op(")")?;
        if self.eat_keyword("filter") {
            self.expect_op("(")?;
            self.expect_keyword("where")?;
            call.filter = Some(Box::new(self.parse_expr()?));
            self.expect_op(")")?;
        }
        Ok(Expr::FuncCall(call))
    }
}

// ── Public entry points ────────────────────────────────────────────────────

/// Parse a single cache definition.
pub fn parse_cache(source: &str) -> Result<Cache, PgDenormError> {
    let mut parser = Parser::new(source)?;
    let cache = parser.parse_cache()?;
    while parser.eat_op(";") {}
    if parser.peek() != &TokenKind::Eof {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(cache)
}

/// Parse a file that may hold several cache definitions, optionally
/// separated by semicolons.
pub fn parse_caches(source: &str) -> Result<Vec<Cache>, PgDenormError> {
    let mut parser = Parser::new(source)?;
    let mut caches = Vec::new();
    loop {
        while parser.eat_op(";") {}
        if parser.peek() == &TokenKind::Eof {
            break;
        }
        caches.push(parser.parse_cache()?);
    }
    Ok(caches)
}

/// Parse a bare select in the supported subset. Exposed for tests and
/// for drivers that embed generated selects.
pub fn parse_select(source: &str) -> Result<Select, PgDenormError> {
    let mut parser = Parser::new(source)?;
    let select = parser.parse_select()?;
    if parser.peek() != &TokenKind::Eof {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(select)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Expr;

    const TOTALS: &str = "cache totals for companies (\n    \
         select sum(orders.profit) as orders_profit \
         from orders \
         where orders.id_client = companies.id\n)";

    #[test]
    fn test_parse_simple_cache() {
        let cache = parse_cache(TOTALS).unwrap();
        assert_eq!(cache.name, "totals");
        assert_eq!(cache.for_table.table, TableId::parse("companies"));
        assert_eq!(cache.select.columns.len(), 1);
        assert_eq!(cache.select.columns[0].alias.as_deref(), Some("orders_profit"));
        assert!(cache.select.where_clause.is_some());
    }

    #[test]
    fn test_round_trip_structural_equality() {
        let cache = parse_cache(TOTALS).unwrap();
        let reparsed = parse_cache(&cache.to_sql()).unwrap();
        assert_eq!(cache, reparsed);
    }

    #[test]
    fn test_parse_options() {
        let src = "cache totals for companies (\n\
                   select count(*) as orders_count from orders \
                   where orders.id_client = companies.id\n)\n\
                   without insert case on orders\n\
                   without triggers on order_type\n\
                   index btree on (orders_count)";
        let cache = parse_cache(src).unwrap();
        assert_eq!(cache.without_insert_on, vec!["public.orders"]);
        assert_eq!(cache.without_triggers_on, vec!["public.order_type"]);
        assert_eq!(cache.indexes.len(), 1);
        assert_eq!(cache.indexes[0].method, "btree");
        let reparsed = parse_cache(&cache.to_sql()).unwrap();
        assert_eq!(cache, reparsed);
    }

    #[test]
    fn test_parse_last_row_cache() {
        let src = "cache last_order for companies (\n\
                   select orders.id as last_order_id from orders \
                   where orders.id_client = companies.id \
                   order by orders.id desc nulls last limit 1\n)";
        let cache = parse_cache(src).unwrap();
        assert_eq!(cache.select.order_by.len(), 1);
        assert!(cache.select.order_by[0].desc);
        assert_eq!(cache.select.order_by[0].nulls_first, Some(false));
        assert_eq!(cache.select.limit.as_deref(), Some("1"));
        let reparsed = parse_cache(&cache.to_sql()).unwrap();
        assert_eq!(cache, reparsed);
    }

    #[test]
    fn test_parse_string_agg_and_filter() {
        let src = "cache names for companies (\n\
                   select string_agg(orders.doc_number, ', ') as doc_numbers, \
                   count(*) filter (where orders.paid = true) as paid_count \
                   from orders where orders.id_client = companies.id\n)";
        let cache = parse_cache(src).unwrap();
        let Expr::FuncCall(call) = &cache.select.columns[0].expr else {
            panic!("expected function call");
        };
        assert_eq!(call.name, "string_agg");
        assert_eq!(call.args.len(), 2);
        let Expr::FuncCall(count) = &cache.select.columns[1].expr else {
            panic!("expected function call");
        };
        assert!(count.star);
        assert!(count.filter.is_some());
    }

    #[test]
    fn test_parse_agg_order_by_and_distinct() {
        let src = "cache agg for companies (\n\
                   select array_agg(orders.id order by orders.id desc) as order_ids, \
                   count(distinct orders.id_type) as type_count \
                   from orders where orders.id_client = companies.id\n)";
        let cache = parse_cache(src).unwrap();
        let Expr::FuncCall(agg) = &cache.select.columns[0].expr else {
            panic!("expected function call");
        };
        assert_eq!(agg.order_by.len(), 1);
        let Expr::FuncCall(count) = &cache.select.columns[1].expr else {
            panic!("expected function call");
        };
        assert!(count.distinct);
    }

    #[test]
    fn test_parse_join_and_schema_qualified() {
        let src = "cache totals for crm.companies as company (\n\
                   select sum(orders.profit) as profit from crm.orders \
                   left join crm.order_type as ot on ot.id = orders.id_type \
                   where orders.id_client = company.id\n)";
        let cache = parse_cache(src).unwrap();
        assert_eq!(cache.for_table.table, TableId::new("crm", "companies"));
        assert_eq!(cache.for_table.alias.as_deref(), Some("company"));
        assert_eq!(cache.select.joins.len(), 1);
        assert!(cache.select.joins[0].on.is_some());
        let reparsed = parse_cache(&cache.to_sql()).unwrap();
        assert_eq!(cache, reparsed);
    }

    #[test]
    fn test_parse_unsupported_shapes_still_parse() {
        // The linter, not the parser, rejects these.
        let with_cte = "cache x for t (with c as (select a from b) \
                        select sum(c.a) as s from c)";
        assert!(parse_cache(with_cte).is_ok());
        let with_group = "cache x for t (select count(*) as c from u group by u.kind)";
        assert!(parse_cache(with_group).is_ok());
        let with_union =
            "cache x for t (select u.a as a from u union select v.a as a from v)";
        assert!(parse_cache(with_union).is_ok());
    }

    #[test]
    fn test_syntax_error_reports_position() {
        let err = parse_cache("cache totals companies (select 1)").unwrap_err();
        let text = err.to_string();
        assert!(text.contains("syntax error at line 1"), "got: {text}");
        assert!(text.contains("expected 'for'"), "got: {text}");
    }

    #[test]
    fn test_unterminated_string() {
        let err = parse_cache("cache x for t (select 'oops)").unwrap_err();
        assert!(err.to_string().contains("unterminated string"));
    }

    #[test]
    fn test_parse_multiple_caches() {
        let src = "cache a for t (select count(*) as c from u where u.id_t = t.id);\n\
                   cache b for t (select sum(u.x) as s from u where u.id_t = t.id)";
        let caches = parse_caches(src).unwrap();
        assert_eq!(caches.len(), 2);
        assert_eq!(caches[0].name, "a");
        assert_eq!(caches[1].name, "b");
    }

    #[test]
    fn test_parse_slow_scan_shapes() {
        let src = "cache x for companies (select count(*) as c from orders \
                   where companies.id = any(orders.client_ids))";
        let cache = parse_cache(src).unwrap();
        let where_sql = cache.select.where_clause.unwrap().to_sql();
        assert_eq!(where_sql, "(companies.id = any(orders.client_ids))");
    }

    #[test]
    fn test_parse_cast_and_array() {
        let select = parse_select("select '{}'::bigint[] as a, array[1, 2] as b").unwrap();
        assert_eq!(select.columns[0].expr.to_sql(), "'{}'::bigint[]");
        assert_eq!(select.columns[1].expr.to_sql(), "array[1, 2]");
    }
}
