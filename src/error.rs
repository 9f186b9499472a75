//! Crate-wide error type.
//!
//! Missing optional capabilities (geo, behavior) are not errors — the
//! corresponding filter dimensions degrade silently. Everything else either
//! comes from configuration lookup or propagates from a store/provider and
//! is owned by the caller (the external scheduler retries on the next tick).

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum Error {
    /// The referenced app is not present in the loaded configuration.
    #[error("unknown app: {0}")]
    AppNotFound(String),

    /// No stored message document for this id.
    #[error("unknown message: {0}")]
    MessageNotFound(Uuid),

    /// The audience filter contains a shape the compiler cannot resolve.
    #[error("invalid filter: {0}")]
    Filter(String),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// The geo provider rejected a lookup or region query.
    #[error("geo provider error: {0}")]
    Geo(#[source] anyhow::Error),

    /// The behavioral query engine rejected a query.
    #[error("behavior engine error: {0}")]
    Behavior(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
