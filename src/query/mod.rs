//! Query text handling that happens before any backend is contacted.
//!
//! - `guard`: read-only, multiple-statement and length checks
//! - `placeholder`: `{table_name}` substitution with context-aware quoting
//! - `mongo`: decoding of shell syntax and JSON into pipelines or finds
//! - `postgrest`: translation of simple SELECTs into PostgREST reads

pub mod guard;
pub mod mongo;
pub mod placeholder;
pub mod postgrest;

pub use guard::guard;
pub use placeholder::{TABLE_PLACEHOLDER, has_placeholder, substitute};
