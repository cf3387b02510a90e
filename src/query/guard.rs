//! Read-only, multiple-statement and length guards.
//!
//! The read-only guard is textual: a whole-word scan for write keywords (SQL)
//! or a substring scan for write methods and stages (MongoDB). It can
//! over-reject a keyword inside a string literal and under-reject obfuscated
//! text. It is a best-effort filter, not a security boundary; use database
//! credentials without write grants for that.

use crate::error::{DbError, DbResult};
use crate::models::BackendType;
use sqlparser::dialect::{Dialect, MySqlDialect, PostgreSqlDialect};
use sqlparser::tokenizer::{Token, Tokenizer};

/// SQL statement keywords rejected under read-only policy.
pub const SQL_WRITE_KEYWORDS: &[&str] = &[
    "insert", "update", "delete", "drop", "alter", "create", "truncate", "grant", "revoke",
    "replace", "rename", "restore",
];

/// MongoDB write methods and stages rejected under read-only policy.
pub const MONGO_WRITE_MARKERS: &[&str] = &[
    "insertOne",
    "insertMany",
    "updateOne",
    "updateMany",
    "deleteOne",
    "deleteMany",
    "replaceOne",
    "findOneAndUpdate",
    "findOneAndReplace",
    "findOneAndDelete",
    "bulkWrite",
    "drop",
    "$out",
    "$merge",
];

const READ_ONLY_REASON: &str = "Write operations are not allowed while readOnly is true";

/// Reject query text longer than `max_chars` characters.
pub fn check_length(text: &str, max_chars: usize) -> DbResult<()> {
    let len = text.chars().count();
    if len > max_chars {
        return Err(DbError::validation(format!(
            "Query is {} characters long; the limit is {}",
            len, max_chars
        )));
    }
    Ok(())
}

/// Reject write statements under read-only policy.
///
/// # Examples
///
/// ```
/// use query_dispatch::models::BackendType;
/// use query_dispatch::query::guard::check_read_only;
///
/// assert!(check_read_only("SELECT * FROM users", BackendType::Postgres).is_ok());
/// assert!(check_read_only("  delete from users", BackendType::MySql).is_err());
/// assert!(check_read_only("SELECT created_at FROM users", BackendType::Postgres).is_ok());
/// assert!(check_read_only(r#"[{"$out": "copy"}]"#, BackendType::MongoDb).is_err());
/// ```
pub fn check_read_only(text: &str, backend: BackendType) -> DbResult<()> {
    let found = match backend {
        BackendType::MongoDb => MONGO_WRITE_MARKERS
            .iter()
            .find(|marker| text.contains(*marker))
            .map(|marker| marker.to_string()),
        _ => find_write_keyword(text).map(|kw| kw.to_ascii_uppercase()),
    };

    match found {
        Some(operation) => Err(DbError::disallowed(operation, READ_ONLY_REASON)),
        None => Ok(()),
    }
}

/// First denylisted keyword appearing as a whole word, case-insensitively.
fn find_write_keyword(text: &str) -> Option<&'static str> {
    words(text).find_map(|word| {
        SQL_WRITE_KEYWORDS
            .iter()
            .copied()
            .find(|kw| word.eq_ignore_ascii_case(kw))
    })
}

/// Maximal runs of identifier characters.
fn words(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
}

/// Reject stacked statements and trim trailing semicolons.
///
/// Semicolons inside string literals, quoted identifiers and comments do not
/// count. Text the tokenizer cannot read falls back to a plain character scan.
///
/// ```
/// use query_dispatch::models::BackendType;
/// use query_dispatch::query::guard::check_single_statement;
///
/// assert_eq!(check_single_statement("SELECT 1;;", BackendType::Postgres).unwrap(), "SELECT 1");
/// assert!(check_single_statement("SELECT 1; DROP TABLE t", BackendType::Postgres).is_err());
/// assert!(check_single_statement("SELECT ';'", BackendType::MySql).is_ok());
/// ```
pub fn check_single_statement(text: &str, backend: BackendType) -> DbResult<String> {
    let trimmed = text.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace());

    let stacked = match tokenize(trimmed, backend) {
        Some(tokens) => tokens.iter().any(|t| matches!(t, Token::SemiColon)),
        None => trimmed.contains(';'),
    };
    if stacked {
        return Err(DbError::disallowed(
            "multiple statements",
            "Only a single statement may be sent per request",
        ));
    }
    Ok(trimmed.to_string())
}

fn tokenize(text: &str, backend: BackendType) -> Option<Vec<Token>> {
    let dialect: Box<dyn Dialect> = match backend {
        BackendType::MySql => Box::new(MySqlDialect {}),
        _ => Box::new(PostgreSqlDialect {}),
    };
    Tokenizer::new(dialect.as_ref(), text).tokenize().ok()
}

/// Run every guard that applies to `backend`; returns the text to execute.
pub fn guard(text: &str, backend: BackendType, read_only: bool) -> DbResult<String> {
    if read_only {
        check_read_only(text, backend)?;
    }
    if backend.speaks_sql() {
        check_single_statement(text, backend)
    } else {
        Ok(text.trim().to_string())
    }
}
