//! Optional capability providers: geolocation and behavioral queries.
//!
//! Both are injected into the engine as possibly-absent handles, resolved
//! once at construction. An absent provider silently disables the filter
//! dimensions that depend on it; a present-but-failing provider propagates
//! its error to the caller.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A stored geo region. The shape body is provider-defined; the engine only
/// passes it back to [`GeoProvider::conds`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoRegion {
    pub id: String,
    pub shape: Value,
}

/// Geolocation capability.
#[async_trait]
pub trait GeoProvider: Send + Sync {
    /// Fetch region documents by id.
    async fn regions(&self, app: &str, ids: &[String]) -> Result<Vec<GeoRegion>>;

    /// Translate a region into a user-store match condition.
    fn conds(&self, region: &GeoRegion) -> Value;

    /// Resolve a geo sub-query to its candidate regions.
    async fn query(&self, app: &str, filter: &Value) -> Result<Vec<GeoRegion>>;
}

/// App-local time context handed to the behavioral engine alongside the
/// query body.
#[derive(Debug, Clone)]
pub struct BehaviorQuery {
    pub app: String,
    pub now: DateTime<Utc>,
    /// App timezone offset in minutes.
    pub tz_offset: i32,
    pub query: Value,
}

/// Behavioral/drill query capability, backed by an external analytics
/// engine.
#[async_trait]
pub trait BehaviorProvider: Send + Sync {
    /// Normalize a query body in place before execution.
    fn preprocess(&self, query: &mut Value);

    /// Evaluate a behavioral query, returning the matching user ids.
    async fn fetch_uids(&self, params: BehaviorQuery) -> Result<Vec<String>>;
}
