//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Backend handles and the connector that opens them
//! - The keyed connection cache shared by all requests
//! - Query execution for the SQL backends
//! - MongoDB and Supabase adapters
//! - Type mappings from driver values to JSON

pub mod backend;
pub mod connection_pool;
pub mod executor;
pub mod mongo;
pub mod supabase;
pub mod types;

pub use backend::{Backend, BackendConnector, BackendHandle, Connector, connection_suggestion};
pub use connection_pool::{
    ConnectionPool, EntrySummary, Pool, PoolEntry, PoolSettings, PooledHandle,
};
pub use mongo::MongoHandle;
pub use supabase::SupabaseClient;
pub use types::RowToJson;
