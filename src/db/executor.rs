//! SQL query execution for the PostgreSQL and MySQL adapters.
//!
//! Row caps are enforced while streaming: at most `row_limit + 1` rows are
//! fetched, the extra row only signalling truncation. Timeouts are applied
//! by the dispatcher, uniformly across backends.
//!
//! # Architecture
//!
//! - `mysql`: MySQL-specific fetch and parameter binding
//! - `postgres`: PostgreSQL-specific fetch and parameter binding
//!
//! Both submodules expose the same `run` function adapted to their type system.

use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{PreparedQuery, QueryParam, RowSet};
use futures_util::StreamExt;
use tracing::{debug, warn};

/// Convert fetched rows into a capped [`RowSet`].
fn process_rows<R: RowToJson>(rows: Vec<R>, row_limit: usize) -> RowSet {
    let truncated = rows.len() > row_limit;
    if truncated {
        warn!(limit = row_limit, "Query result truncated");
    }

    RowSet {
        rows: rows.iter().take(row_limit).map(RowToJson::to_json_map).collect(),
        truncated,
    }
}

fn collect_rows<R>(results: Vec<Result<R, sqlx::Error>>) -> DbResult<Vec<R>> {
    let mut rows = Vec::with_capacity(results.len());
    for result in results {
        rows.push(result.map_err(DbError::from)?);
    }
    Ok(rows)
}

fn sql_text(query: &PreparedQuery) -> DbResult<&str> {
    query.payload.as_text().ok_or_else(|| {
        DbError::internal(format!(
            "{} adapter received a {} payload",
            query.backend.display_name(),
            query.payload.kind()
        ))
    })
}

pub mod mysql {
    use super::*;
    use sqlx::MySqlPool;
    use sqlx::mysql::MySqlArguments;

    pub async fn run(pool: &MySqlPool, query: &PreparedQuery) -> DbResult<RowSet> {
        let sql = sql_text(query)?;
        let params = &query.params;
        debug!(params = params.len(), limit = query.row_limit, "Running MySQL query");

        // When params is empty, use raw SQL to avoid prepared statement issues
        let fetch_limit = query.row_limit.saturating_add(1);
        let results = if params.is_empty() {
            use sqlx::Executor;
            let stream = pool.fetch(sql);
            stream.take(fetch_limit).collect::<Vec<_>>().await
        } else {
            let mut q = sqlx::query(sql);
            for param in params {
                q = bind_param(q, param);
            }
            let stream = q.fetch(pool);
            stream.take(fetch_limit).collect::<Vec<_>>().await
        };

        let rows = collect_rows(results)?;
        Ok(process_rows(rows, query.row_limit))
    }

    fn bind_param<'q>(
        query: sqlx::query::Query<'q, sqlx::MySql, MySqlArguments>,
        param: &'q QueryParam,
    ) -> sqlx::query::Query<'q, sqlx::MySql, MySqlArguments> {
        match param {
            QueryParam::Null => query.bind(None::<String>),
            QueryParam::Bool(v) => query.bind(*v),
            QueryParam::Int(v) => query.bind(*v),
            QueryParam::Float(v) => query.bind(*v),
            QueryParam::String(v) => query.bind(v.as_str()),
        }
    }
}

pub mod postgres {
    use super::*;
    use sqlx::PgPool;
    use sqlx::postgres::PgArguments;

    pub async fn run(pool: &PgPool, query: &PreparedQuery) -> DbResult<RowSet> {
        let sql = sql_text(query)?;
        let params = &query.params;
        debug!(params = params.len(), limit = query.row_limit, "Running PostgreSQL query");

        let fetch_limit = query.row_limit.saturating_add(1);
        let results = if params.is_empty() {
            use sqlx::Executor;
            let stream = pool.fetch(sql);
            stream.take(fetch_limit).collect::<Vec<_>>().await
        } else {
            let mut q = sqlx::query(sql);
            for param in params {
                q = bind_param(q, param);
            }
            let stream = q.fetch(pool);
            stream.take(fetch_limit).collect::<Vec<_>>().await
        };

        let rows = collect_rows(results)?;
        Ok(process_rows(rows, query.row_limit))
    }

    fn bind_param<'q>(
        query: sqlx::query::Query<'q, sqlx::Postgres, PgArguments>,
        param: &'q QueryParam,
    ) -> sqlx::query::Query<'q, sqlx::Postgres, PgArguments> {
        match param {
            QueryParam::Null => query.bind(None::<String>),
            QueryParam::Bool(v) => query.bind(*v),
            QueryParam::Int(v) => query.bind(*v),
            QueryParam::Float(v) => query.bind(*v),
            QueryParam::String(v) => query.bind(v.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BackendType, QueryPayload, Row};

    struct FakeRow(i64);

    impl RowToJson for FakeRow {
        fn to_json_map(&self) -> Row {
            let mut row = Row::new();
            row.insert("n".to_string(), self.0.into());
            row
        }
    }

    #[test]
    fn test_process_rows_marks_truncation() {
        let rows: Vec<FakeRow> = (0..4).map(FakeRow).collect();
        let set = process_rows(rows, 3);
        assert!(set.truncated);
        assert_eq!(set.rows.len(), 3);
        assert_eq!(set.rows[2]["n"], 2);
    }

    #[test]
    fn test_process_rows_exact_limit_not_truncated() {
        let rows: Vec<FakeRow> = (0..3).map(FakeRow).collect();
        let set = process_rows(rows, 3);
        assert!(!set.truncated);
        assert_eq!(set.rows.len(), 3);
    }

    #[test]
    fn test_sql_text_rejects_structured_payload() {
        let query = PreparedQuery {
            backend: BackendType::Postgres,
            payload: QueryPayload::Pipeline(Vec::new()),
            params: Vec::new(),
            table: None,
            row_limit: 10,
        };
        assert!(sql_text(&query).is_err());
    }
}
