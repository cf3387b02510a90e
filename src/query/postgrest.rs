//! Translation of simple SQL SELECTs into PostgREST requests.
//!
//! Supabase exposes tables through PostgREST, which has no SQL endpoint. A
//! useful subset of SELECT maps onto its query-string grammar:
//!
//! ```text
//! SELECT id, name AS n FROM users WHERE age >= 21 AND name LIKE 'A%'
//!     ORDER BY id DESC LIMIT 10 OFFSET 20
//!
//! GET /rest/v1/users?select=id,n:name&age=gte.21&name=like.A*
//!     &order=id.desc&limit=10&offset=20
//! ```
//!
//! Anything outside the subset is rejected as a validation error naming the
//! construct. Only text that cannot be tokenized is reported as malformed.
//! The text is tokenized with `sqlparser` so quoting and comments are handled
//! the way Postgres would.

use crate::error::{DbError, DbResult};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::tokenizer::{Token, Tokenizer};

/// Keywords that always put a query outside the supported subset.
const UNSUPPORTED: &[&str] = &[
    "JOIN", "GROUP", "HAVING", "UNION", "INTERSECT", "EXCEPT", "OR", "DISTINCT", "WITH",
    "WINDOW", "OVER", "FETCH", "FOR", "INTO", "LATERAL", "BETWEEN",
];

/// A SELECT rendered as a PostgREST table read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestSelect {
    pub table: String,
    /// Value of the `select` parameter.
    pub select: String,
    /// `(column, "op.value")` pairs, AND-joined by PostgREST.
    pub filters: Vec<(String, String)>,
    /// Value of the `order` parameter.
    pub order: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl RestSelect {
    /// Query-string pairs, with `limit` capped at `cap`.
    pub fn query_pairs(&self, cap: u64) -> Vec<(String, String)> {
        let mut pairs = vec![("select".to_string(), self.select.clone())];
        pairs.extend(self.filters.iter().cloned());
        if let Some(order) = &self.order {
            pairs.push(("order".to_string(), order.clone()));
        }
        let limit = self.limit.map_or(cap, |l| l.min(cap));
        pairs.push(("limit".to_string(), limit.to_string()));
        if let Some(offset) = self.offset {
            pairs.push(("offset".to_string(), offset.to_string()));
        }
        pairs
    }
}

/// True when the text is a SELECT (ignoring leading whitespace and comments).
pub fn is_select(sql: &str) -> bool {
    tokens(sql)
        .ok()
        .and_then(|tokens| tokens.first().and_then(keyword))
        .is_some_and(|kw| kw == "SELECT")
}

/// Translate a SELECT. `default_table` is used when the statement has no FROM.
pub fn translate(sql: &str, default_table: Option<&str>) -> DbResult<RestSelect> {
    let tokens = tokens(sql)?;

    let selects = tokens
        .iter()
        .filter(|t| keyword(t).as_deref() == Some("SELECT"))
        .count();
    if selects > 1 {
        return Err(unsupported("subqueries"));
    }
    if let Some(kw) = tokens
        .iter()
        .filter_map(keyword)
        .find(|kw| UNSUPPORTED.contains(&kw.as_str()))
    {
        return Err(unsupported(&kw));
    }

    let mut parser = Parser { tokens, pos: 0 };
    parser.select(default_table)
}

fn tokens(sql: &str) -> DbResult<Vec<Token>> {
    let dialect = PostgreSqlDialect {};
    let tokens = Tokenizer::new(&dialect, sql)
        .tokenize()
        .map_err(|e| DbError::malformed(format!("Could not tokenize SQL: {}", e), preview(sql)))?;
    Ok(tokens
        .into_iter()
        .filter(|t| !matches!(t, Token::Whitespace(_)))
        .collect())
}

/// Uppercased value of an unquoted word.
fn keyword(token: &Token) -> Option<String> {
    match token {
        Token::Word(word) if word.quote_style.is_none() => Some(word.value.to_ascii_uppercase()),
        _ => None,
    }
}

fn unsupported(construct: &str) -> DbError {
    DbError::validation(format!(
        "Supabase queries support single-table SELECTs with AND-joined filters, ORDER BY, LIMIT and OFFSET; {} is not supported",
        construct
    ))
}

/// How a token is named in a rejection.
fn describe(token: &Token) -> String {
    match token {
        Token::Word(word) if word.quote_style.is_none() => format!("keyword or name `{}`", word.value),
        Token::Word(word) => format!("identifier `{}`", word.value),
        Token::Number(n, _) => format!("number `{}`", n),
        Token::SingleQuotedString(s) => format!("string '{}'", s),
        Token::LParen => "expression `(`".to_string(),
        other => format!("operator `{}`", other),
    }
}

fn preview(text: &str) -> String {
    crate::models::query_preview(text)
}

/// Characters that force double quotes inside an `in.(...)` list.
fn needs_quotes(value: &str) -> bool {
    value.is_empty()
        || value
            .chars()
            .any(|c| matches!(c, ',' | '(' | ')' | '"' | '\\' | ':' | '.') || c.is_whitespace())
}

fn quote_list_value(value: &str) -> String {
    if needs_quotes(value) {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        value.to_string()
    }
}

/// LIKE wildcards in PostgREST syntax.
fn like_pattern(pattern: &str) -> String {
    pattern.replace('%', "*")
}

/// A literal on the right side of a comparison.
enum Literal {
    Text(String),
    Null,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_keyword(&self) -> Option<String> {
        self.peek().and_then(keyword)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.peek_keyword().as_deref() == Some(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, kw: &str) -> DbResult<()> {
        if self.eat_keyword(kw) {
            Ok(())
        } else {
            Err(self.error(&format!("expected {}", kw)))
        }
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn at_clause(&self) -> bool {
        matches!(
            self.peek_keyword().as_deref(),
            Some("FROM" | "WHERE" | "ORDER" | "LIMIT" | "OFFSET")
        )
    }

    fn at_end(&self) -> bool {
        self.tokens[self.pos..]
            .iter()
            .all(|t| matches!(t, Token::SemiColon))
    }

    /// Reject the token at the cursor, naming it.
    fn error(&self, expected: &str) -> DbError {
        let found = self.peek().map_or_else(|| "end of query".to_string(), describe);
        let near = self.tokens[self.pos.min(self.tokens.len())..]
            .iter()
            .take(6)
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        DbError::validation(format!(
            "Unsupported SELECT: {} is not supported here ({}), near `{}`",
            found, expected, near
        ))
    }

    /// A possibly qualified name; returns its parts.
    fn name(&mut self) -> DbResult<Vec<String>> {
        let mut parts = Vec::new();
        loop {
            match self.next() {
                Some(Token::Word(word)) => parts.push(word.value),
                Some(Token::Mul) if !parts.is_empty() => {
                    return Err(unsupported(&format!(
                        "qualified wildcard `{}.*`",
                        parts.join(".")
                    )));
                }
                _ => {
                    self.pos = self.pos.saturating_sub(1);
                    return Err(self.error("expected a column or table name"));
                }
            }
            if !self.eat(&Token::Period) {
                return Ok(parts);
            }
        }
    }

    fn column(&mut self) -> DbResult<String> {
        let parts = self.name()?;
        if self.peek() == Some(&Token::LParen) {
            return Err(unsupported("function calls"));
        }
        // Qualifiers can only name the single FROM table
        parts
            .last()
            .cloned()
            .ok_or_else(|| self.error("expected a column name"))
    }

    fn select(&mut self, default_table: Option<&str>) -> DbResult<RestSelect> {
        self.expect_keyword("SELECT")?;
        let select = self.projection()?;

        let table = if self.eat_keyword("FROM") {
            self.table()?
        } else {
            if !self.at_end() && !self.at_clause() {
                return Err(self.error("expected a column list"));
            }
            default_table.map(str::to_string).ok_or_else(|| {
                DbError::validation("SELECT has no FROM clause and no tableName is configured")
            })?
        };
        if self.eat(&Token::Comma) {
            return Err(unsupported("multiple FROM tables"));
        }

        let filters = if self.eat_keyword("WHERE") {
            self.conditions()?
        } else {
            Vec::new()
        };

        let order = if self.eat_keyword("ORDER") {
            self.expect_keyword("BY")?;
            Some(self.order_by()?)
        } else {
            None
        };

        let mut limit = None;
        let mut offset = None;
        loop {
            if limit.is_none() && self.eat_keyword("LIMIT") {
                limit = Some(self.unsigned()?);
            } else if offset.is_none() && self.eat_keyword("OFFSET") {
                offset = Some(self.unsigned()?);
            } else {
                break;
            }
        }

        if !self.at_end() {
            return Err(self.error("expected end of query"));
        }

        Ok(RestSelect {
            table,
            select,
            filters,
            order,
            limit,
            offset,
        })
    }

    fn projection(&mut self) -> DbResult<String> {
        let mut items = Vec::new();
        loop {
            if self.eat(&Token::Mul) {
                items.push("*".to_string());
            } else {
                let column = self.column()?;
                let alias = if self.eat_keyword("AS") {
                    Some(self.name()?.join("."))
                } else {
                    match self.peek() {
                        Some(Token::Word(_)) if self.peek_keyword().as_deref() != Some("FROM") => {
                            Some(self.name()?.join("."))
                        }
                        _ => None,
                    }
                };
                items.push(match alias {
                    Some(alias) => format!("{}:{}", alias, column),
                    None => column,
                });
            }
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        Ok(items.join(","))
    }

    fn table(&mut self) -> DbResult<String> {
        if self.peek() == Some(&Token::LParen) {
            return Err(unsupported("subqueries"));
        }
        let parts = self.name()?;
        let table = match parts.as_slice() {
            [table] => table.clone(),
            [schema, table] if schema.eq_ignore_ascii_case("public") => table.clone(),
            _ => return Err(unsupported("tables outside the public schema")),
        };
        // Optional alias
        if self.eat_keyword("AS") {
            self.name()?;
        } else if matches!(self.peek(), Some(Token::Word(_)))
            && !matches!(
                self.peek_keyword().as_deref(),
                Some("WHERE" | "ORDER" | "LIMIT" | "OFFSET")
            )
        {
            self.name()?;
        }
        Ok(table)
    }

    fn conditions(&mut self) -> DbResult<Vec<(String, String)>> {
        let mut filters = Vec::new();
        loop {
            if self.peek() == Some(&Token::LParen) {
                return Err(unsupported("parenthesized conditions"));
            }
            filters.push(self.condition()?);
            if !self.eat_keyword("AND") {
                return Ok(filters);
            }
        }
    }

    fn condition(&mut self) -> DbResult<(String, String)> {
        let column = self.column()?;

        if self.eat_keyword("IS") {
            let negated = self.eat_keyword("NOT");
            let value = match self.peek_keyword().as_deref() {
                Some("NULL") => "null",
                Some("TRUE") => "true",
                Some("FALSE") => "false",
                _ => return Err(self.error("expected NULL, TRUE or FALSE after IS")),
            };
            self.pos += 1;
            let op = if negated { "not.is" } else { "is" };
            return Ok((column, format!("{}.{}", op, value)));
        }

        let negated = self.eat_keyword("NOT");
        match self.peek_keyword().as_deref() {
            Some(kw @ ("LIKE" | "ILIKE")) => {
                let op = kw.to_ascii_lowercase();
                self.pos += 1;
                let pattern = match self.next() {
                    Some(Token::SingleQuotedString(s)) => s,
                    _ => {
                        self.pos = self.pos.saturating_sub(1);
                        return Err(self.error("expected a quoted pattern"));
                    }
                };
                let op = if negated { format!("not.{}", op) } else { op };
                return Ok((column, format!("{}.{}", op, like_pattern(&pattern))));
            }
            Some("IN") => {
                self.pos += 1;
                let values = self.in_list()?;
                let op = if negated { "not.in" } else { "in" };
                return Ok((column, format!("{}.({})", op, values.join(","))));
            }
            _ if negated => return Err(self.error("expected LIKE, ILIKE or IN after NOT")),
            _ => {}
        }

        let op = match self.next() {
            Some(Token::Eq) => "eq",
            Some(Token::Neq) => "neq",
            Some(Token::Lt) => "lt",
            Some(Token::LtEq) => "lte",
            Some(Token::Gt) => "gt",
            Some(Token::GtEq) => "gte",
            _ => {
                self.pos = self.pos.saturating_sub(1);
                return Err(self.error("expected a comparison operator"));
            }
        };
        match self.literal()? {
            Literal::Text(value) => Ok((column, format!("{}.{}", op, value))),
            // `col = NULL` is never true in SQL; keep that meaning explicit
            Literal::Null => Err(self.error("compare with NULL using IS NULL")),
        }
    }

    fn in_list(&mut self) -> DbResult<Vec<String>> {
        if !self.eat(&Token::LParen) {
            return Err(self.error("expected ( after IN"));
        }
        if self.peek_keyword().as_deref() == Some("SELECT") {
            return Err(unsupported("subqueries"));
        }
        let mut values = Vec::new();
        loop {
            match self.literal()? {
                Literal::Text(value) => values.push(quote_list_value(&value)),
                Literal::Null => values.push("null".to_string()),
            }
            if self.eat(&Token::RParen) {
                return Ok(values);
            }
            if !self.eat(&Token::Comma) {
                return Err(self.error("expected , or ) in IN list"));
            }
        }
    }

    fn literal(&mut self) -> DbResult<Literal> {
        let negative = self.eat(&Token::Minus);
        match self.next() {
            Some(Token::Number(n, _)) => Ok(Literal::Text(if negative {
                format!("-{}", n)
            } else {
                n
            })),
            Some(Token::SingleQuotedString(s)) if !negative => Ok(Literal::Text(s)),
            Some(token @ Token::Word(_)) if !negative => match keyword(&token).as_deref() {
                Some("TRUE") => Ok(Literal::Text("true".to_string())),
                Some("FALSE") => Ok(Literal::Text("false".to_string())),
                Some("NULL") => Ok(Literal::Null),
                _ => Err(unsupported("column-to-column comparisons")),
            },
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.error("expected a literal value"))
            }
        }
    }

    fn order_by(&mut self) -> DbResult<String> {
        let mut items = Vec::new();
        loop {
            let column = self.column()?;
            let mut item = column;
            if self.eat_keyword("DESC") {
                item.push_str(".desc");
            } else if self.eat_keyword("ASC") {
                item.push_str(".asc");
            }
            if self.eat_keyword("NULLS") {
                if self.eat_keyword("FIRST") {
                    item.push_str(".nullsfirst");
                } else if self.eat_keyword("LAST") {
                    item.push_str(".nullslast");
                } else {
                    return Err(self.error("expected FIRST or LAST after NULLS"));
                }
            }
            items.push(item);
            if !self.eat(&Token::Comma) {
                return Ok(items.join(","));
            }
        }
    }

    fn unsigned(&mut self) -> DbResult<u64> {
        match self.next() {
            Some(Token::Number(n, _)) => n.parse().map_err(|_| self.error("expected a whole number")),
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.error("expected a whole number"))
            }
        }
    }
}
