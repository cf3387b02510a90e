//! Query-related data models.
//!
//! This module defines the request body accepted by the HTTP surface, the
//! disambiguated query payload handed to adapters, and the result shape.

use crate::models::backend::{BackendConfig, BackendType};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A single result row: column (or field) name to value.
pub type Row = serde_json::Map<String, JsonValue>;

/// Maximum number of positional parameters accepted per request.
pub const MAX_PARAMS: usize = 100;

/// Characters of query text kept in error context and logs.
pub const QUERY_PREVIEW_CHARS: usize = 100;

/// A parameter value for parameterized queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value (dates travel as ISO-8601 strings)
    String(String),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
        }
    }
}

/// Body of `POST /api/queries/execute`.
///
/// Every field is optional at the serde level; the dispatcher reports what
/// is missing as a validation error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    /// SQL text, Mongo shell text, or a structured Mongo filter/pipeline.
    #[serde(default)]
    pub query: Option<JsonValue>,
    #[serde(default)]
    pub db_config: Option<BackendConfig>,
    /// Default: true
    #[serde(default = "default_read_only")]
    pub read_only: bool,
    #[serde(default, alias = "params")]
    pub parameters: Vec<QueryParam>,
}

fn default_read_only() -> bool {
    true
}

impl ExecuteRequest {
    /// Create a read-only request for a text query.
    pub fn new(config: BackendConfig, query: impl Into<String>) -> Self {
        Self {
            query: Some(JsonValue::String(query.into())),
            db_config: Some(config),
            read_only: true,
            parameters: Vec::new(),
        }
    }

    /// Create a read-only request for a structured (JSON) query.
    pub fn structured(config: BackendConfig, query: JsonValue) -> Self {
        Self {
            query: Some(query),
            db_config: Some(config),
            read_only: true,
            parameters: Vec::new(),
        }
    }

    /// Set the read-only flag.
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Add a parameter to this query.
    pub fn with_param(mut self, param: QueryParam) -> Self {
        self.parameters.push(param);
        self
    }

    /// The query as text: strings as-is, structured values re-serialized.
    pub fn query_text(&self) -> Option<String> {
        match self.query.as_ref()? {
            JsonValue::Null => None,
            JsonValue::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// Options of a MongoDB `find` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindQuery {
    pub filter: Row,
    pub projection: Option<Row>,
    pub sort: Option<Row>,
    pub limit: Option<i64>,
}

impl FindQuery {
    /// A find with only a filter.
    pub fn filter(filter: Row) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }
}

/// A query whose shape has been decided once, at the API boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryPayload {
    /// SQL text (Postgres, MySQL, Supabase).
    RawText(String),
    /// MongoDB aggregation pipeline, one object per stage.
    Pipeline(Vec<Row>),
    /// MongoDB find.
    Filter(FindQuery),
}

impl QueryPayload {
    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RawText(_) => "text",
            Self::Pipeline(_) => "pipeline",
            Self::Filter(_) => "filter",
        }
    }

    /// The SQL text, if this is a text payload.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::RawText(text) => Some(text),
            _ => None,
        }
    }
}

/// Everything an adapter needs to run one query.
#[derive(Debug, Clone)]
pub struct PreparedQuery {
    pub backend: BackendType,
    pub payload: QueryPayload,
    pub params: Vec<QueryParam>,
    /// Table or collection name, when configured.
    pub table: Option<String>,
    /// Rows beyond this count are dropped and the result marked truncated.
    pub row_limit: usize,
}

/// Rows returned by an adapter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub rows: Vec<Row>,
    pub truncated: bool,
}

impl RowSet {
    /// Cap `rows` at `limit`, marking the set truncated if anything was cut.
    pub fn capped(mut rows: Vec<Row>, limit: usize) -> Self {
        let truncated = rows.len() > limit;
        rows.truncate(limit);
        Self { rows, truncated }
    }
}

/// Result of a dispatched query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub rows: Vec<Row>,
    pub truncated: bool,
    pub execution_time_ms: u64,
}

impl QueryResult {
    /// Get the number of rows in the result.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Check if the result is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Truncate query text for logs and error context.
pub fn query_preview(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(QUERY_PREVIEW_CHARS) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_param_types() {
        assert!(QueryParam::Null.is_null());
        assert!(!QueryParam::Bool(true).is_null());
        assert_eq!(QueryParam::Int(42).type_name(), "int");
        assert_eq!(
            QueryParam::String("hello".to_string()).type_name(),
            "string"
        );
    }

    #[test]
    fn test_query_params_deserialize_untagged() {
        let params: Vec<QueryParam> =
            serde_json::from_value(json!([null, true, 7, 1.5, "2024-01-01"])).unwrap();
        assert_eq!(
            params,
            vec![
                QueryParam::Null,
                QueryParam::Bool(true),
                QueryParam::Int(7),
                QueryParam::Float(1.5),
                QueryParam::String("2024-01-01".to_string()),
            ]
        );
    }

    #[test]
    fn test_execute_request_defaults_to_read_only() {
        let req: ExecuteRequest = serde_json::from_value(json!({
            "query": "SELECT 1",
            "dbConfig": {"type": "postgres", "url": "postgres://h/db"}
        }))
        .unwrap();
        assert!(req.read_only);
        assert!(req.parameters.is_empty());
        assert_eq!(req.query_text().as_deref(), Some("SELECT 1"));
    }

    #[test]
    fn test_execute_request_structured_query_text() {
        let req = ExecuteRequest::structured(
            BackendConfig::new(BackendType::MongoDb, "mongodb://h/db"),
            json!([{"$match": {"a": 1}}]),
        );
        assert_eq!(req.query_text().unwrap(), r#"[{"$match":{"a":1}}]"#);
    }

    #[test]
    fn test_row_set_capped() {
        let rows: Vec<Row> = (0..5)
            .map(|i| {
                let mut row = Row::new();
                row.insert("i".to_string(), json!(i));
                row
            })
            .collect();
        let set = RowSet::capped(rows.clone(), 3);
        assert!(set.truncated);
        assert_eq!(set.rows.len(), 3);

        let set = RowSet::capped(rows, 5);
        assert!(!set.truncated);
    }

    #[test]
    fn test_query_preview_truncates() {
        let long = "x".repeat(500);
        let preview = query_preview(&long);
        assert_eq!(preview.len(), QUERY_PREVIEW_CHARS + 3);
        assert!(preview.ends_with("..."));
        assert_eq!(query_preview("  SELECT 1  "), "SELECT 1");
    }
}
