//! Query translation tests: Mongo decoding and Supabase SELECT translation.

use query_dispatch::error::{DbError, ErrorKind};
use query_dispatch::models::{FindQuery, QueryPayload};
use query_dispatch::query::{mongo, postgrest};
use serde_json::json;

fn pairs(sql: &str) -> Vec<(String, String)> {
    postgrest::translate(sql, Some("fallback"))
        .unwrap()
        .query_pairs(101)
}

#[test]
fn test_mongo_arrays_always_aggregate() {
    for text in ["[]", r#"[{"$match": {}}]"#, "[{ $sort: { at: -1 } }, { $limit: 5 }]"] {
        let decoded = mongo::decode_str(text).unwrap();
        assert!(matches!(decoded.payload, QueryPayload::Pipeline(_)), "{text}");
    }
}

#[test]
fn test_mongo_find_key() {
    let decoded = mongo::decode_str(r#"{"find": {"x": 1}}"#).unwrap();
    let expected = match json!({"x": 1}) {
        serde_json::Value::Object(map) => map,
        _ => unreachable!(),
    };
    assert_eq!(decoded.payload, QueryPayload::Filter(FindQuery::filter(expected)));
}

#[test]
fn test_mongo_shell_with_trailing_semicolon() {
    let decoded =
        mongo::decode_str("db.events.find({ kind: 'click' }).limit(20);").unwrap();
    assert_eq!(decoded.collection.as_deref(), Some("events"));
    match decoded.payload {
        QueryPayload::Filter(find) => {
            assert_eq!(find.filter["kind"], "click");
            assert_eq!(find.limit, Some(20));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_mongo_malformed_is_execution_kind_with_fragment() {
    let err = mongo::decode_str(r#"{"a": [1, 2"#).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Execution);
    assert!(matches!(err, DbError::MalformedQuery { .. }));
}

#[test]
fn test_supabase_translation_pairs() {
    assert_eq!(
        pairs(r#"SELECT id, email FROM "users" WHERE active = true ORDER BY id LIMIT 5"#),
        vec![
            ("select".to_string(), "id,email".to_string()),
            ("active".to_string(), "eq.true".to_string()),
            ("order".to_string(), "id".to_string()),
            ("limit".to_string(), "5".to_string()),
        ]
    );
}

#[test]
fn test_supabase_limit_never_exceeds_cap() {
    let got = pairs("SELECT * FROM users LIMIT 5000");
    assert_eq!(got.last(), Some(&("limit".to_string(), "101".to_string())));
}

#[test]
fn test_supabase_rejects_unsupported_constructs() {
    for sql in [
        "SELECT * FROM a JOIN b ON a.id = b.a_id",
        "SELECT kind, count(*) FROM events GROUP BY kind",
        "SELECT * FROM users WHERE a = 1 OR b = 2",
        "SELECT DISTINCT kind FROM events",
        "SELECT * FROM a UNION SELECT * FROM b",
        "SELECT u.* FROM users u",
        "SELECT price * 2 FROM items",
        "SELECT * FROM users WHERE email ~ '@example'",
    ] {
        let err = postgrest::translate(sql, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation, "{sql}");
    }
}
