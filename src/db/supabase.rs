//! Supabase adapter over the PostgREST HTTP interface.
//!
//! SELECTs in the supported subset become table reads; any other text is
//! handed to an `execute_query(query_text)` database function through RPC.

use crate::error::{DbError, DbResult};
use crate::models::{PreparedQuery, Row, RowSet};
use crate::query::postgrest;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use tracing::debug;
use url::Url;

/// Database function called for non-SELECT text.
pub const RPC_FUNCTION: &str = "execute_query";

/// Stateless REST client for one Supabase project.
#[derive(Clone)]
pub struct SupabaseClient {
    http: reqwest::Client,
    base_url: Url,
    /// Contains sensitive data - never log
    api_key: String,
}

impl SupabaseClient {
    pub fn new(http: reqwest::Client, url: &str, api_key: &str) -> DbResult<Self> {
        let base_url = Url::parse(url).map_err(|e| {
            DbError::connection(
                format!("Invalid Supabase URL: {}", e),
                "Use the project URL, e.g. https://<project>.supabase.co",
            )
        })?;
        if !matches!(base_url.scheme(), "http" | "https") || base_url.cannot_be_a_base() {
            return Err(DbError::connection(
                format!("Unsupported Supabase URL scheme: {}", base_url.scheme()),
                "Use the project URL, e.g. https://<project>.supabase.co",
            ));
        }

        Ok(Self {
            http,
            base_url,
            api_key: api_key.to_string(),
        })
    }

    /// `{base}/rest/v1/{segments...}`
    fn endpoint(&self, segments: &[&str]) -> DbResult<Url> {
        let mut url = self.base_url.clone();
        url.set_query(None);
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| DbError::internal("Supabase URL cannot be a base"))?;
            path.pop_if_empty().extend(["rest", "v1"]).extend(segments);
        }
        Ok(url)
    }

    pub async fn run(&self, query: &PreparedQuery) -> DbResult<RowSet> {
        let text = query.payload.as_text().ok_or_else(|| {
            DbError::internal(format!(
                "Supabase adapter received a {} payload",
                query.payload.kind()
            ))
        })?;
        let fetch_limit = query.row_limit.saturating_add(1);

        let request = if postgrest::is_select(text) {
            let select = postgrest::translate(text, query.table.as_deref())?;
            debug!(table = %select.table, filters = select.filters.len(), "Supabase table read");
            let cap = u64::try_from(fetch_limit).unwrap_or(u64::MAX);
            self.http
                .get(self.endpoint(&[select.table.as_str()])?)
                .query(&select.query_pairs(cap))
        } else {
            debug!("Supabase RPC {}", RPC_FUNCTION);
            self.http
                .post(self.endpoint(&["rpc", RPC_FUNCTION])?)
                .json(&json!({ "query_text": text }))
        };

        let response = request
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(rest_error(status, &body));
        }

        let value: JsonValue = if body.iter().all(u8::is_ascii_whitespace) {
            JsonValue::Null
        } else {
            serde_json::from_slice(&body).map_err(|e| {
                DbError::execution(
                    format!("Supabase returned invalid JSON: {}", e),
                    None,
                    "Check that the endpoint returns JSON rows",
                )
            })?
        };

        Ok(RowSet::capped(normalize_rows(value), query.row_limit))
    }
}

impl std::fmt::Debug for SupabaseClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupabaseClient")
            .field("base_url", &self.base_url.as_str())
            .field("api_key", &"****")
            .finish()
    }
}

/// PostgREST error body.
#[derive(Debug, Default, Deserialize)]
struct RestErrorBody {
    code: Option<String>,
    message: Option<String>,
    details: Option<String>,
    hint: Option<String>,
}

fn rest_error(status: reqwest::StatusCode, body: &[u8]) -> DbError {
    let parsed: RestErrorBody = serde_json::from_slice(body).unwrap_or_default();
    let message = parsed
        .message
        .clone()
        .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string());
    let message = match &parsed.details {
        Some(details) if !details.is_empty() => format!("{} ({})", message, details),
        _ => message,
    };

    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return DbError::connection(
            format!("Supabase rejected the API key ({}): {}", status.as_u16(), message),
            "Check dbConfig.apiKey and the table's row level security policies",
        );
    }

    let suggestion = parsed.hint.clone().unwrap_or_else(|| {
        if status == reqwest::StatusCode::NOT_FOUND {
            format!(
                "Check the table name, or create the {}(query_text text) function for non-SELECT queries",
                RPC_FUNCTION
            )
        } else {
            "Check the query against the Supabase schema".to_string()
        }
    });

    DbError::execution(
        format!("Supabase request failed ({}): {}", status.as_u16(), message),
        parsed.code.or_else(|| Some(status.as_u16().to_string())),
        suggestion,
    )
}

/// Shape any JSON response into rows.
///
/// Arrays of objects are rows; an object is one row; scalars become
/// `{"value": v}`; null is no rows.
pub fn normalize_rows(value: JsonValue) -> Vec<Row> {
    fn scalar_row(value: JsonValue) -> Row {
        let mut row = Row::new();
        row.insert("value".to_string(), value);
        row
    }

    match value {
        JsonValue::Null => Vec::new(),
        JsonValue::Array(items) => items
            .into_iter()
            .map(|item| match item {
                JsonValue::Object(map) => map,
                other => scalar_row(other),
            })
            .collect(),
        JsonValue::Object(map) => vec![map],
        scalar => vec![scalar_row(scalar)],
    }
}
