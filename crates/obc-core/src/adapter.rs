//! Local adapter selection and session leases.

use async_trait::async_trait;
use thiserror::Error;

/// Errors from the adapter manager.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("no such adapter: {0}")]
    NotFound(String),
    #[error("session request refused: {0}")]
    Refused(String),
    #[error("adapter manager unavailable: {0}")]
    Unavailable(String),
}

/// The system's adapter manager.
///
/// Adapters are identified by an opaque path. A session lease must be
/// requested before connecting and released on teardown, however far the
/// connect got.
#[async_trait]
pub trait AdapterManager: Send + Sync {
    /// Path of the default adapter.
    async fn default_adapter(&self) -> Result<String, AdapterError>;

    /// Path of the adapter named `name` (an address or an interface name).
    async fn find_adapter(&self, name: &str) -> Result<String, AdapterError>;

    /// Request an exclusive session lease on `adapter`.
    async fn request_session(&self, adapter: &str) -> Result<(), AdapterError>;

    /// Release a lease taken with [`AdapterManager::request_session`].
    async fn release_session(&self, adapter: &str);
}
