//! Data models for the query dispatch service.
//!
//! This module re-exports all model types used throughout the application.

pub mod backend;
pub mod query;

// Re-export commonly used types
pub use backend::{BackendConfig, BackendType, mask_cache_key, mask_url};
pub use query::{
    ExecuteRequest, FindQuery, MAX_PARAMS, PreparedQuery, QueryParam, QueryPayload, QueryResult,
    Row, RowSet, query_preview,
};
