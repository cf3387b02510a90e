//! Query Dispatch Library
//!
//! Routes ad-hoc queries to PostgreSQL, MySQL, MongoDB and Supabase through
//! one HTTP endpoint, caching one connection per backend configuration.

pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod models;
pub mod query;
pub mod transport;

pub use config::Config;
pub use dispatcher::{DispatchSettings, Dispatcher};
pub use error::{DbError, DbResult};
