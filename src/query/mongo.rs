//! Decoding of MongoDB query input into a [`QueryPayload`].
//!
//! Accepted forms, in order of attempt:
//!
//! 1. Shell syntax: `db.<collection>.aggregate([...])`,
//!    `db.<collection>.find({...}[, {...}])` with optional `.sort({...})` and
//!    `.limit(n)`, or the same through `db.getCollection("name")`. The
//!    arguments are relaxed JavaScript and are normalized to JSON first.
//! 2. JSON text, falling back to the same relaxed normalization.
//! 3. Already-structured JSON from the request body.
//!
//! The decoded value is then classified: an array is a pipeline; an object
//! with an `aggregate` key is a pipeline; an object with a `find` key is a
//! find (siblings `projection`, `sort`, `limit`); any other object is a filter.

use crate::error::{DbError, DbResult};
use crate::models::{FindQuery, QueryPayload, Row};
use serde_json::Value as JsonValue;

/// Collection name that shell examples use as a stand-in.
const GENERIC_COLLECTION: &str = "collection";

/// Characters of context kept around a parse error.
const FRAGMENT_CHARS: usize = 40;

/// A decoded Mongo query.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub payload: QueryPayload,
    /// Collection named by shell syntax, unless it was the generic `collection`.
    pub collection: Option<String>,
}

/// Decode query text.
///
/// ```
/// use query_dispatch::models::QueryPayload;
/// use query_dispatch::query::mongo::decode_str;
///
/// let decoded = decode_str(r#"db.collection.aggregate([{ "$match": { "field": 1 } }])"#).unwrap();
/// match decoded.payload {
///     QueryPayload::Pipeline(stages) => assert_eq!(stages.len(), 1),
///     other => panic!("expected a pipeline, got {:?}", other),
/// }
/// assert_eq!(decoded.collection, None);
/// ```
pub fn decode_str(text: &str) -> DbResult<Decoded> {
    let trimmed = text.trim().trim_end_matches(';').trim_end();
    if trimmed.is_empty() {
        return Err(DbError::validation("Query is empty"));
    }

    if let Some(rest) = trimmed.strip_prefix("db.") {
        return decode_shell(rest);
    }

    let value = parse_relaxed(trimmed)?;
    Ok(Decoded {
        payload: classify(value)?,
        collection: None,
    })
}

/// Classify a JSON value as pipeline or find.
pub fn classify(value: JsonValue) -> DbResult<QueryPayload> {
    match value {
        JsonValue::Array(stages) => Ok(QueryPayload::Pipeline(pipeline(stages)?)),
        JsonValue::Object(mut map) => {
            if let Some(stages) = map.remove("aggregate") {
                return match stages {
                    JsonValue::Array(stages) => Ok(QueryPayload::Pipeline(pipeline(stages)?)),
                    other => Err(DbError::malformed(
                        "`aggregate` must be an array of stages",
                        fragment_of(&other),
                    )),
                };
            }
            if let Some(filter) = map.remove("find") {
                let mut find = FindQuery::filter(object("find", filter)?);
                if let Some(projection) = map.remove("projection") {
                    find.projection = Some(object("projection", projection)?);
                }
                if let Some(sort) = map.remove("sort") {
                    find.sort = Some(object("sort", sort)?);
                }
                if let Some(limit) = map.remove("limit") {
                    find.limit = Some(limit.as_i64().ok_or_else(|| {
                        DbError::malformed("`limit` must be an integer", fragment_of(&limit))
                    })?);
                }
                return Ok(QueryPayload::Filter(find));
            }
            Ok(QueryPayload::Filter(FindQuery::filter(map)))
        }
        other => Err(DbError::malformed(
            "Expected a filter object or a pipeline array",
            fragment_of(&other),
        )),
    }
}

fn pipeline(stages: Vec<JsonValue>) -> DbResult<Vec<Row>> {
    stages
        .into_iter()
        .map(|stage| object("pipeline stage", stage))
        .collect()
}

fn object(what: &str, value: JsonValue) -> DbResult<Row> {
    match value {
        JsonValue::Object(map) => Ok(map),
        other => Err(DbError::malformed(
            format!("{} must be an object", what),
            fragment_of(&other),
        )),
    }
}

fn fragment_of(value: &JsonValue) -> String {
    truncate(&value.to_string())
}

fn truncate(text: &str) -> String {
    match text.char_indices().nth(FRAGMENT_CHARS) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

// =============================================================================
// Shell syntax
// =============================================================================

fn decode_shell(rest: &str) -> DbResult<Decoded> {
    let (collection, rest) = shell_collection(rest)?;
    let rest = rest
        .strip_prefix('.')
        .ok_or_else(|| DbError::malformed("Expected .aggregate(...) or .find(...)", truncate(rest)))?;

    let method_end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(rest.len());
    let (method, rest) = rest.split_at(method_end);
    let (args, mut rest) = call_arguments(rest.trim_start())?;

    let payload = match method {
        "aggregate" => {
            let value = if args.trim().is_empty() {
                JsonValue::Array(Vec::new())
            } else {
                parse_relaxed(args)?
            };
            match value {
                JsonValue::Array(stages) => QueryPayload::Pipeline(pipeline(stages)?),
                other => {
                    return Err(DbError::malformed(
                        "aggregate() takes an array of stages",
                        fragment_of(&other),
                    ));
                }
            }
        }
        "find" => {
            let mut find = FindQuery::default();
            if !args.trim().is_empty() {
                match parse_relaxed(&format!("[{}]", args))? {
                    JsonValue::Array(mut parts) if parts.len() <= 2 => {
                        if parts.len() == 2 {
                            find.projection = Some(object("projection", parts.remove(1))?);
                        }
                        find.filter = object("filter", parts.remove(0))?;
                    }
                    _ => {
                        return Err(DbError::malformed(
                            "find() takes a filter and an optional projection",
                            truncate(args),
                        ));
                    }
                }
            }

            // Chained cursor modifiers
            while let Some(chained) = rest.trim_start().strip_prefix('.') {
                let end = chained
                    .find(|c: char| !c.is_ascii_alphanumeric())
                    .unwrap_or(chained.len());
                let (modifier, after) = chained.split_at(end);
                let (arg, after) = call_arguments(after.trim_start())?;
                match modifier {
                    "sort" => find.sort = Some(object("sort", parse_relaxed(arg)?)?),
                    "projection" => {
                        find.projection = Some(object("projection", parse_relaxed(arg)?)?)
                    }
                    "limit" => {
                        find.limit = Some(arg.trim().parse().map_err(|_| {
                            DbError::malformed("limit() takes an integer", truncate(arg))
                        })?)
                    }
                    other => {
                        return Err(DbError::malformed(
                            format!("Unsupported cursor method .{}()", other),
                            truncate(chained),
                        ));
                    }
                }
                rest = after;
            }
            QueryPayload::Filter(find)
        }
        other => {
            return Err(DbError::malformed(
                format!("Unsupported shell method .{}(); use aggregate or find", other),
                truncate(rest),
            ));
        }
    };

    if !rest.trim().is_empty() {
        return Err(DbError::malformed(
            "Unexpected text after the shell call",
            truncate(rest.trim()),
        ));
    }

    Ok(Decoded {
        payload,
        collection: Some(collection).filter(|c| c != GENERIC_COLLECTION),
    })
}

/// `name.rest` or `getCollection("name").rest`
fn shell_collection(text: &str) -> DbResult<(String, &str)> {
    if let Some(after) = text.strip_prefix("getCollection") {
        let (arg, rest) = call_arguments(after.trim_start())?;
        return match parse_relaxed(arg)? {
            JsonValue::String(name) if !name.is_empty() => Ok((name, rest)),
            _ => Err(DbError::malformed(
                "getCollection() takes a collection name",
                truncate(arg),
            )),
        };
    }

    let end = text
        .find(|c: char| !(c.is_alphanumeric() || matches!(c, '_' | '-' | '{' | '}')))
        .unwrap_or(text.len());
    let (name, rest) = text.split_at(end);
    if name.is_empty() {
        return Err(DbError::malformed("Expected a collection name after db.", truncate(text)));
    }
    Ok((name.to_string(), rest))
}

/// Split `( args ) rest` at the matching close paren, skipping quoted text.
fn call_arguments(text: &str) -> DbResult<(&str, &str)> {
    if !text.starts_with('(') {
        return Err(DbError::malformed("Expected (", truncate(text)));
    }

    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (idx, c) in text.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    if c != ')' {
                        break;
                    }
                    return Ok((&text[1..idx], &text[idx + 1..]));
                }
            }
            _ => {}
        }
    }
    Err(DbError::malformed("Unbalanced brackets", truncate(text)))
}

// =============================================================================
// Relaxed JSON
// =============================================================================

/// Parse JSON, falling back to relaxed JavaScript object notation.
pub fn parse_relaxed(text: &str) -> DbResult<JsonValue> {
    if let Ok(value) = serde_json::from_str(text) {
        return Ok(value);
    }
    let normalized = normalize(text)?;
    serde_json::from_str(&normalized).map_err(|e| {
        let fragment = error_fragment(&normalized, e.line(), e.column());
        DbError::malformed(format!("Invalid JSON: {}", e), fragment)
    })
}

fn error_fragment(text: &str, line: usize, column: usize) -> String {
    let line_text = text.lines().nth(line.saturating_sub(1)).unwrap_or(text);
    let start = column.saturating_sub(FRAGMENT_CHARS / 2);
    let fragment: String = line_text
        .chars()
        .skip(start)
        .take(FRAGMENT_CHARS)
        .collect();
    if fragment.is_empty() {
        truncate(line_text)
    } else {
        fragment
    }
}

/// Rewrite relaxed JavaScript notation as JSON.
///
/// Quotes bare keys and bare identifiers (`$field`), converts single-quoted
/// strings, drops trailing commas and comments, and rewrites `ObjectId("..")`
/// and `ISODate("..")` as Extended JSON.
pub fn normalize(text: &str) -> DbResult<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 16);
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '"' | '\'' => {
                let (literal, next) = read_string(&chars, i)?;
                push_json_string(&mut out, &literal);
                i = next;
            }
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i += 2;
            }
            ',' => {
                let next = skip_whitespace(&chars, i + 1);
                if !matches!(chars.get(next), Some(']' | '}')) {
                    out.push(',');
                }
                i += 1;
            }
            // Exponent of a number literal
            c if c.is_alphabetic() && out.ends_with(|p: char| p.is_ascii_digit() || p == '.') => {
                out.push(c);
                i += 1;
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '$' | '.'))
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                i = emit_word(&chars, i, &word, &mut out)?;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Ok(out)
}

/// Emit a bare word; returns the next index.
fn emit_word(chars: &[char], mut i: usize, word: &str, out: &mut String) -> DbResult<usize> {
    let next = skip_whitespace(chars, i);

    if word == "new" {
        return Ok(next);
    }
    if chars.get(next) == Some(&':') {
        push_json_string(out, word);
        return Ok(i);
    }
    if chars.get(next) == Some(&'(') {
        let wrapper = match word {
            "ObjectId" => "$oid",
            "ISODate" | "Date" => "$date",
            other => {
                return Err(DbError::malformed(
                    format!("Unsupported function {}()", other),
                    chars[i.saturating_sub(word.chars().count())..chars.len().min(i + FRAGMENT_CHARS)]
                        .iter()
                        .collect::<String>(),
                ));
            }
        };
        i = skip_whitespace(chars, next + 1);
        let (arg, after) = read_string(chars, i)?;
        let close = skip_whitespace(chars, after);
        if chars.get(close) != Some(&')') {
            return Err(DbError::malformed(
                format!("{}() takes a single string", word),
                word.to_string(),
            ));
        }
        out.push_str("{\"");
        out.push_str(wrapper);
        out.push_str("\":");
        push_json_string(out, &arg);
        out.push('}');
        return Ok(close + 1);
    }

    match word {
        "true" | "false" | "null" => out.push_str(word),
        "undefined" => out.push_str("null"),
        "NaN" | "Infinity" => {
            return Err(DbError::malformed("Non-finite numbers are not supported", word.to_string()));
        }
        _ => push_json_string(out, word),
    }
    Ok(i)
}

fn skip_whitespace(chars: &[char], mut i: usize) -> usize {
    while i < chars.len() && chars[i].is_whitespace() {
        i += 1;
    }
    i
}

/// Read a quoted string starting at `start`; returns its value and the next index.
fn read_string(chars: &[char], start: usize) -> DbResult<(String, usize)> {
    let Some(&quote) = chars.get(start).filter(|c| matches!(c, '"' | '\'')) else {
        return Err(DbError::malformed(
            "Expected a quoted string",
            chars[start.min(chars.len())..].iter().take(FRAGMENT_CHARS).collect::<String>(),
        ));
    };

    let mut value = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' => {
                let Some(&escaped) = chars.get(i + 1) else {
                    break;
                };
                match escaped {
                    'n' => value.push('\n'),
                    't' => value.push('\t'),
                    'r' => value.push('\r'),
                    'b' => value.push('\u{8}'),
                    'f' => value.push('\u{c}'),
                    'u' => {
                        let hex: String = chars.iter().skip(i + 2).take(4).collect();
                        let decoded = u32::from_str_radix(&hex, 16)
                            .ok()
                            .and_then(char::from_u32)
                            .ok_or_else(|| {
                                DbError::malformed("Invalid \\u escape", format!("\\u{}", hex))
                            })?;
                        value.push(decoded);
                        i += 4;
                    }
                    other => value.push(other),
                }
                i += 2;
            }
            c if c == quote => return Ok((value, i + 1)),
            c => {
                value.push(c);
                i += 1;
            }
        }
    }
    Err(DbError::malformed(
        "Unterminated string",
        chars[start..].iter().take(FRAGMENT_CHARS).collect::<String>(),
    ))
}

fn push_json_string(out: &mut String, value: &str) {
    out.push_str(&JsonValue::String(value.to_string()).to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn row(value: JsonValue) -> Row {
        match value {
            JsonValue::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn test_shell_aggregate_one_stage() {
        let decoded =
            decode_str(r#"db.collection.aggregate([{ "$match": { "field": 1 } }])"#).unwrap();
        assert_eq!(
            decoded.payload,
            QueryPayload::Pipeline(vec![row(json!({"$match": {"field": 1}}))])
        );
        assert_eq!(decoded.collection, None);
    }

    #[test]
    fn test_shell_relaxed_syntax() {
        let decoded = decode_str(
            "db.orders.aggregate([\n  { $match: { status: 'paid', } },\n  { $group: { _id: $customer, total: { $sum: '$amount' } } },\n]);",
        )
        .unwrap();
        assert_eq!(decoded.collection.as_deref(), Some("orders"));
        assert_eq!(
            decoded.payload,
            QueryPayload::Pipeline(vec![
                row(json!({"$match": {"status": "paid"}})),
                row(json!({"$group": {"_id": "$customer", "total": {"$sum": "$amount"}}})),
            ])
        );
    }

    #[test]
    fn test_shell_find_with_projection_and_modifiers() {
        let decoded =
            decode_str("db.users.find({ age: { $gte: 21 } }, { name: 1 }).sort({ age: -1 }).limit(5)")
                .unwrap();
        assert_eq!(
            decoded.payload,
            QueryPayload::Filter(FindQuery {
                filter: row(json!({"age": {"$gte": 21}})),
                projection: Some(row(json!({"name": 1}))),
                sort: Some(row(json!({"age": -1}))),
                limit: Some(5),
            })
        );
    }

    #[test]
    fn test_shell_empty_find() {
        let decoded = decode_str("db.users.find()").unwrap();
        assert_eq!(decoded.payload, QueryPayload::Filter(FindQuery::default()));
    }

    #[test]
    fn test_get_collection() {
        let decoded = decode_str(r#"db.getCollection("audit-log").find({})"#).unwrap();
        assert_eq!(decoded.collection.as_deref(), Some("audit-log"));
    }

    #[test]
    fn test_object_id_and_dates() {
        let decoded = decode_str(
            r#"db.c.find({ _id: ObjectId("64b7f1f4e1d3c2a1b0a9f8e7"), at: { $gt: new Date("2024-01-01T00:00:00Z") } })"#,
        )
        .unwrap();
        match decoded.payload {
            QueryPayload::Filter(find) => {
                assert_eq!(find.filter["_id"], json!({"$oid": "64b7f1f4e1d3c2a1b0a9f8e7"}));
                assert_eq!(
                    find.filter["at"],
                    json!({"$gt": {"$date": "2024-01-01T00:00:00Z"}})
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_json_find_key() {
        let decoded = decode_str(r#"{"find": {"x": 1}}"#).unwrap();
        assert_eq!(
            decoded.payload,
            QueryPayload::Filter(FindQuery::filter(row(json!({"x": 1}))))
        );
    }

    #[test]
    fn test_json_find_with_options() {
        let decoded =
            decode_str(r#"{"find": {"x": 1}, "sort": {"x": -1}, "limit": 3, "projection": {"x": 1}}"#)
                .unwrap();
        match decoded.payload {
            QueryPayload::Filter(find) => {
                assert_eq!(find.limit, Some(3));
                assert!(find.sort.is_some());
                assert!(find.projection.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_json_aggregate_key_and_array() {
        let decoded = decode_str(r#"{"aggregate": [{"$count": "n"}]}"#).unwrap();
        assert!(matches!(decoded.payload, QueryPayload::Pipeline(ref s) if s.len() == 1));
        let decoded = decode_str(r#"[{"$match": {}}, {"$limit": 2}]"#).unwrap();
        assert!(matches!(decoded.payload, QueryPayload::Pipeline(ref s) if s.len() == 2));
    }

    #[test]
    fn test_plain_object_is_filter() {
        let decoded = decode_str(r#"{"status": "active"}"#).unwrap();
        assert_eq!(
            decoded.payload,
            QueryPayload::Filter(FindQuery::filter(row(json!({"status": "active"}))))
        );
    }

    #[test]
    fn test_structured_input() {
        let payload = classify(json!([{"$match": {"a": 1}}])).unwrap();
        assert!(matches!(payload, QueryPayload::Pipeline(_)));
        let payload = classify(json!({"find": {}})).unwrap();
        assert!(matches!(payload, QueryPayload::Filter(_)));
    }

    #[test]
    fn test_malformed_reports_fragment() {
        let err = decode_str(r#"[{"$match": {"a": }}]"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Execution);
        match err {
            DbError::MalformedQuery { fragment, .. } => assert!(!fragment.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_rejects_non_object_stage() {
        assert!(matches!(
            decode_str("[1, 2]"),
            Err(DbError::MalformedQuery { .. })
        ));
        assert!(matches!(
            decode_str("42"),
            Err(DbError::MalformedQuery { .. })
        ));
    }

    #[test]
    fn test_rejects_unknown_shell_method() {
        assert!(matches!(
            decode_str("db.users.count({})"),
            Err(DbError::MalformedQuery { .. })
        ));
        assert!(matches!(
            decode_str("db.users.find({}).explain()"),
            Err(DbError::MalformedQuery { .. })
        ));
    }

    #[test]
    fn test_unbalanced_shell_call() {
        assert!(matches!(
            decode_str("db.users.aggregate([{ $match: {} }]"),
            Err(DbError::MalformedQuery { .. })
        ));
    }

    #[test]
    fn test_normalize_preserves_strings_with_punctuation() {
        let value = parse_relaxed(r#"{ note: 'a: b, c', }"#).unwrap();
        assert_eq!(value, json!({"note": "a: b, c"}));
    }

    #[test]
    fn test_normalize_escaped_quotes() {
        let value = parse_relaxed(r#"{ name: 'O\'Brien', q: "say \"hi\"" }"#).unwrap();
        assert_eq!(value, json!({"name": "O'Brien", "q": "say \"hi\""}));
    }

    #[test]
    fn test_normalize_keeps_exponents() {
        let value = parse_relaxed("{ n: 1e3, m: 2.5E-1 }").unwrap();
        assert_eq!(value, json!({"n": 1e3, "m": 0.25}));
    }

    #[test]
    fn test_empty_text_is_validation() {
        assert_eq!(decode_str("  ;").unwrap_err().kind(), ErrorKind::Validation);
    }
}
