//! Store abstraction consumed by the engine, plus the SQLite backend.
//!
//! This module is split into submodules:
//! - `query`: in-process condition matching over JSON documents.
//! - `sqlite`: the sqlx-backed implementation of [`Store`].
//!
//! Higher layers depend on the [`Store`] trait, not on a concrete backend.

pub mod query;
pub mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::model::{DeliveryRecord, Message};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// One stage of a compiled audience filter.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryStep {
    /// Restrict the candidate set to documents matching the condition.
    Match(Value),
    /// Project the listed fields out of each match; always the final step.
    Project(Value),
}

/// Atomic message-document update: increments and sets with dotted field
/// paths, applied in one store round-trip. Counters are never
/// read-modify-written at the application level.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageUpdate {
    pub inc: BTreeMap<String, i64>,
    pub set: BTreeMap<String, Value>,
}

impl MessageUpdate {
    pub fn inc(mut self, path: &str, by: i64) -> MessageUpdate {
        *self.inc.entry(path.to_string()).or_default() += by;
        self
    }

    pub fn set(mut self, path: &str, value: Value) -> MessageUpdate {
        self.set.insert(path.to_string(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.inc.is_empty() && self.set.is_empty()
    }
}

/// Storage capabilities the engine consumes: per-app user streaming,
/// interaction-history lookups, queue writes/deletes and atomic message
/// updates.
#[async_trait]
pub trait Store: Send + Sync {
    /// Stream user documents matching the compiled steps. The sequence is
    /// lazy, finite and forward-only; projection is already applied.
    async fn stream_users(
        &self,
        app: &str,
        steps: &[QueryStep],
    ) -> Result<BoxStream<'static, Result<Value>>>;

    /// User ids whose interaction-history documents match the condition.
    async fn history_uids(&self, app: &str, cond: &Value) -> Result<Vec<String>>;

    /// Durably insert a batch of delivery records.
    async fn insert_deliveries(&self, app: &str, batch: &[DeliveryRecord]) -> Result<()>;

    /// Delete all queued records for a message on one platform; returns the
    /// deleted count.
    async fn delete_deliveries(&self, app: &str, message: Uuid, platform: &str) -> Result<u64>;

    /// Apply an atomic update to a stored message document.
    async fn update_message(&self, app: &str, id: Uuid, update: &MessageUpdate) -> Result<()>;

    /// Persist a message document, replacing any previous version.
    async fn put_message(&self, app: &str, message: &Message) -> Result<()>;

    /// Load a message document.
    async fn get_message(&self, app: &str, id: Uuid) -> Result<Option<Message>>;
}
