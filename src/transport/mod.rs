//! Transport layer for the query dispatch service.
//!
//! Only HTTP is provided: an axum router over the dispatcher.

pub mod http;

pub use http::{HttpTransport, router};

use crate::error::DbResult;
use std::future::Future;

/// Trait for transport implementations.
///
/// Transports accept requests from clients and hand them to the dispatcher.
pub trait Transport: Send + Sync {
    /// Start the transport and begin handling requests.
    ///
    /// This method should block until the transport is shut down.
    fn run(&self) -> impl Future<Output = DbResult<()>> + Send;

    /// Get the name of this transport for logging.
    fn name(&self) -> &'static str;
}
