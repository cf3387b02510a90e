//! Request dispatch: validate, prepare, acquire, run.
//!
//! The dispatcher owns the connection cache and is the single entry point
//! used by the HTTP surface. Everything that can be rejected without a
//! network round trip is rejected before the cache is touched.

use crate::config::Config;
use crate::db::{Backend, EntrySummary, Pool};
use crate::error::{DbError, DbResult};
use crate::models::{
    BackendConfig, BackendType, ExecuteRequest, MAX_PARAMS, PreparedQuery, QueryPayload,
    QueryResult, query_preview,
};
use crate::query::{self, guard, placeholder};
use std::time::{Duration, Instant};
use tracing::{Instrument, debug, info, info_span, warn};

/// Per-query limits.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub query_timeout: Duration,
    /// Characters
    pub max_query_length: usize,
    pub max_rows: usize,
    /// Whether a server-wide Supabase key is configured.
    pub has_default_supabase_key: bool,
}

impl DispatchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            query_timeout: config.query_timeout_duration(),
            max_query_length: config.max_query_length,
            max_rows: config.max_rows,
            has_default_supabase_key: config
                .supabase_api_key
                .as_deref()
                .is_some_and(|k| !k.trim().is_empty()),
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from_config(&Config::default_config())
    }
}

/// A request that passed validation.
#[derive(Debug)]
struct Validated<'a> {
    backend: BackendType,
    config: &'a BackendConfig,
    text: String,
    table: Option<&'a str>,
}

/// Routes query requests to backends through a shared [`Pool`].
pub struct Dispatcher<P: Pool> {
    pool: P,
    settings: DispatchSettings,
}

impl<P: Pool> Dispatcher<P> {
    pub fn new(pool: P, settings: DispatchSettings) -> Self {
        Self { pool, settings }
    }

    pub fn pool(&self) -> &P {
        &self.pool
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Execute one request.
    ///
    /// Validation and guard failures never reach the pool. Errors raised
    /// after validation carry the backend, table and a query preview.
    pub async fn execute(&self, request: ExecuteRequest) -> DbResult<QueryResult> {
        let request_id = uuid::Uuid::new_v4();
        let validated = self.validate(&request)?;
        let backend = validated.backend;
        let table = validated.table;
        let preview = query_preview(&validated.text);

        let span = info_span!(
            "query",
            %request_id,
            backend = %backend,
            url = %validated.config.masked_url(),
        );

        async {
            let start = Instant::now();
            let result = self.run(&validated, &request).await;
            let elapsed_ms = start.elapsed().as_millis() as u64;

            match result {
                Ok(rows) => {
                    info!(
                        elapsed_ms,
                        rows = rows.rows.len(),
                        truncated = rows.truncated,
                        "Query completed"
                    );
                    Ok(QueryResult {
                        rows: rows.rows,
                        truncated: rows.truncated,
                        execution_time_ms: elapsed_ms,
                    })
                }
                Err(e) => {
                    warn!(elapsed_ms, kind = %e.kind(), error = %e, "Query failed");
                    Err(e.with_backend(backend, table, preview))
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        validated: &Validated<'_>,
        request: &ExecuteRequest,
    ) -> DbResult<crate::models::RowSet> {
        let prepared = self.prepare(validated, request)?;
        debug!(payload = prepared.payload.kind(), "Prepared query");

        let handle = self.pool.get(validated.config).await?;

        match tokio::time::timeout(self.settings.query_timeout, handle.run(&prepared)).await {
            Ok(result) => result,
            Err(_) => Err(DbError::timeout("query", self.settings.query_timeout)),
        }
    }

    /// Check the request without touching the network.
    fn validate<'a>(&self, request: &'a ExecuteRequest) -> DbResult<Validated<'a>> {
        let config = request
            .db_config
            .as_ref()
            .ok_or_else(|| DbError::validation("dbConfig is required"))?;

        let backend = config.backend_type.ok_or_else(|| {
            DbError::validation("dbConfig.type is required: postgres, mysql, mongodb or supabase")
        })?;

        if config.connection_url().is_none() {
            return Err(DbError::validation("dbConfig.url is required"));
        }

        let text = request
            .query_text()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| DbError::validation("query is required"))?;
        guard::check_length(&text, self.settings.max_query_length)?;

        let table = config.table();
        if table.is_none() && placeholder::has_placeholder(&text) {
            return Err(DbError::validation(format!(
                "query references {} but dbConfig.tableName is not set",
                placeholder::TABLE_PLACEHOLDER
            )));
        }

        match backend {
            BackendType::MongoDb if table.is_none() => {
                return Err(DbError::validation(
                    "dbConfig.tableName (the collection) is required for MongoDB",
                ));
            }
            BackendType::Supabase
                if !self.settings.has_default_supabase_key
                    && config.api_key.as_deref().is_none_or(|k| k.trim().is_empty()) =>
            {
                return Err(DbError::validation("dbConfig.apiKey is required for Supabase"));
            }
            _ => {}
        }

        if request.parameters.len() > MAX_PARAMS {
            return Err(DbError::validation(format!(
                "At most {} parameters are allowed, got {}",
                MAX_PARAMS,
                request.parameters.len()
            )));
        }
        if !request.parameters.is_empty() && !backend.is_sql() {
            return Err(DbError::validation(format!(
                "{} does not accept bind parameters",
                backend.display_name()
            )));
        }

        Ok(Validated {
            backend,
            config,
            text,
            table,
        })
    }

    /// Guard, substitute and decode the query.
    fn prepare(&self, validated: &Validated<'_>, request: &ExecuteRequest) -> DbResult<PreparedQuery> {
        let backend = validated.backend;
        let guarded = query::guard(&validated.text, backend, request.read_only)?;
        let text = match validated.table {
            Some(table) => placeholder::substitute(&guarded, table, backend),
            None => guarded,
        };

        let payload = match backend {
            BackendType::MongoDb => {
                let decoded = query::mongo::decode_str(&text)?;
                if let (Some(named), Some(table)) = (&decoded.collection, validated.table) {
                    if named != table {
                        debug!(named = %named, table = %table, "Shell collection differs from tableName; using tableName");
                    }
                }
                decoded.payload
            }
            _ => QueryPayload::RawText(text),
        };

        Ok(PreparedQuery {
            backend,
            payload,
            params: request.parameters.clone(),
            table: validated.table.map(String::from),
            row_limit: self.settings.max_rows,
        })
    }

    /// Cached connections, for the health endpoint.
    pub async fn connections(&self) -> Vec<EntrySummary> {
        self.pool.summary().await
    }

    /// Close every cached connection.
    pub async fn shutdown(&self) {
        info!("Closing cached connections");
        self.pool.close_all().await;
    }
}

impl<P: Pool> std::fmt::Debug for Dispatcher<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("settings", &self.settings)
            .finish()
    }
}
