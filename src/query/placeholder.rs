//! `{table_name}` placeholder substitution.
//!
//! The configured table name is quoted for the context the token sits in,
//! so a name can never terminate the surrounding identifier or literal.

use crate::models::BackendType;

/// Token replaced with the configured table (or collection) name.
pub const TABLE_PLACEHOLDER: &str = "{table_name}";

/// Catalog schemas whose queries compare table names as string values.
const CATALOG_MARKERS: &[&str] = &["information_schema", "pg_catalog"];

pub fn has_placeholder(text: &str) -> bool {
    text.contains(TABLE_PLACEHOLDER)
}

/// Quote `name` as an identifier for `backend`.
pub fn quote_identifier(name: &str, backend: BackendType) -> String {
    match backend {
        BackendType::MySql => format!("`{}`", name.replace('`', "``")),
        _ => format!("\"{}\"", name.replace('"', "\"\"")),
    }
}

/// Quote `name` as a SQL string literal.
pub fn quote_literal(name: &str) -> String {
    format!("'{}'", name.replace('\'', "''"))
}

/// Escape `name` for use inside a JSON string.
fn json_escape(name: &str) -> String {
    let quoted = serde_json::Value::String(name.to_string()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

/// Replace every placeholder in `text` with `table`, quoted for its context.
///
/// - `'{table_name}'` becomes a string literal.
/// - `"{table_name}"` (and `` `{table_name}` `` on MySQL) keeps the meaning
///   the query gave it: the quotes are replaced with properly escaped ones.
/// - A bare token in a query over `information_schema`/`pg_catalog` becomes a
///   string literal too.
/// - Otherwise it becomes a quoted identifier.
/// - MongoDB text gets the JSON-escaped name in place.
///
/// Text without the token is returned unchanged.
///
/// ```
/// use query_dispatch::models::BackendType;
/// use query_dispatch::query::placeholder::substitute;
///
/// assert_eq!(
///     substitute("SELECT * FROM {table_name} LIMIT 10", "events", BackendType::Postgres),
///     r#"SELECT * FROM "events" LIMIT 10"#
/// );
/// assert_eq!(
///     substitute("SELECT * FROM {table_name}", "events", BackendType::MySql),
///     "SELECT * FROM `events`"
/// );
/// ```
pub fn substitute(text: &str, table: &str, backend: BackendType) -> String {
    if !has_placeholder(text) {
        return text.to_string();
    }

    if backend == BackendType::MongoDb {
        return text.replace(TABLE_PLACEHOLDER, &json_escape(table));
    }

    let lower = text.to_ascii_lowercase();
    let bare_is_literal = CATALOG_MARKERS.iter().any(|m| lower.contains(m));

    let mut out = String::with_capacity(text.len() + table.len());
    let mut rest = text;
    while let Some(idx) = rest.find(TABLE_PLACEHOLDER) {
        let (before, after_start) = rest.split_at(idx);
        let after = &after_start[TABLE_PLACEHOLDER.len()..];

        // Already wrapped in quotes: replace the quotes too
        let wrapped = before
            .chars()
            .next_back()
            .filter(|&open| after.starts_with(open))
            .and_then(|open| requoted(open, table, backend).map(|q| (open, q)));
        if let Some((open, quoted)) = wrapped {
            out.push_str(&before[..before.len() - open.len_utf8()]);
            out.push_str(&quoted);
            rest = &after[open.len_utf8()..];
            continue;
        }

        out.push_str(before);
        if bare_is_literal {
            out.push_str(&quote_literal(table));
        } else {
            out.push_str(&quote_identifier(table, backend));
        }
        rest = after;
    }
    out.push_str(rest);
    out
}

/// Replacement for a token the query already wrapped in `open`.
fn requoted(open: char, table: &str, backend: BackendType) -> Option<String> {
    match (open, backend) {
        ('\'', _) => Some(quote_literal(table)),
        // MySQL reads double quotes as a string literal
        ('"', BackendType::MySql) => Some(quote_literal(table)),
        ('"', _) => Some(quote_identifier(table, backend)),
        ('`', BackendType::MySql) => Some(quote_identifier(table, backend)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_quote_doubling() {
        assert_eq!(
            substitute("SELECT * FROM {table_name}", "a\"b", BackendType::Postgres),
            r#"SELECT * FROM "a""b""#
        );
        assert_eq!(
            substitute("SELECT * FROM {table_name}", "a`b", BackendType::MySql),
            "SELECT * FROM `a``b`"
        );
    }

    #[test]
    fn test_quoted_literal_context() {
        assert_eq!(
            substitute(
                "SELECT count(*) FROM t WHERE name = '{table_name}'",
                "a\"b",
                BackendType::Postgres
            ),
            r#"SELECT count(*) FROM t WHERE name = 'a"b'"#
        );
        assert_eq!(
            substitute("SELECT '{table_name}'", "o'neil", BackendType::MySql),
            "SELECT 'o''neil'"
        );
    }

    #[test]
    fn test_already_quoted_identifier_not_doubled() {
        assert_eq!(
            substitute(r#"SELECT * FROM "{table_name}" LIMIT 5"#, "events", BackendType::Postgres),
            r#"SELECT * FROM "events" LIMIT 5"#
        );
        assert_eq!(
            substitute(r#"SELECT * FROM "{table_name}""#, "a\"b", BackendType::Supabase),
            r#"SELECT * FROM "a""b""#
        );
        assert_eq!(
            substitute("SELECT * FROM `{table_name}`", "a`b", BackendType::MySql),
            "SELECT * FROM `a``b`"
        );
        assert_eq!(
            substitute(r#"SELECT "{table_name}""#, "o'neil", BackendType::MySql),
            "SELECT 'o''neil'"
        );
    }

    #[test]
    fn test_catalog_query_uses_literal() {
        assert_eq!(
            substitute(
                "SELECT column_name FROM information_schema.columns WHERE table_name = {table_name}",
                "events",
                BackendType::Postgres
            ),
            "SELECT column_name FROM information_schema.columns WHERE table_name = 'events'"
        );
        assert_eq!(
            substitute(
                "SELECT * FROM pg_catalog.pg_tables WHERE tablename = {table_name}",
                "ev'x",
                BackendType::Supabase
            ),
            "SELECT * FROM pg_catalog.pg_tables WHERE tablename = 'ev''x'"
        );
    }

    #[test]
    fn test_multiple_occurrences() {
        assert_eq!(
            substitute(
                "SELECT * FROM {table_name} a JOIN {table_name} b ON a.id = b.parent",
                "n",
                BackendType::Postgres
            ),
            r#"SELECT * FROM "n" a JOIN "n" b ON a.id = b.parent"#
        );
    }

    #[test]
    fn test_mongo_json_escape() {
        assert_eq!(
            substitute(r#"[{"$lookup": {"from": "{table_name}"}}]"#, "we\"ird", BackendType::MongoDb),
            r#"[{"$lookup": {"from": "we\"ird"}}]"#
        );
    }

    #[test]
    fn test_idempotent_without_token() {
        let text = "SELECT '{table}' FROM t";
        assert_eq!(substitute(text, "x", BackendType::Postgres), text);
    }

    #[test]
    fn test_substituted_name_cannot_reintroduce_token() {
        let out = substitute("SELECT * FROM {table_name}", "{table_name}", BackendType::Postgres);
        assert_eq!(out, r#"SELECT * FROM "{table_name}""#);
    }
}
