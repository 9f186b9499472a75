//! Audience resolution and delivery scheduling for push messages.
//!
//! Given a message definition (target platforms, audience filter, trigger
//! rule), the engine compiles the filter into restriction steps over the
//! user store, computes one delivery instant per matched user and targeted
//! platform/field slot, and writes the resulting records to the queue store
//! in batches. Symmetric operations cancel queued records.

pub mod audience;
pub mod config;
pub mod error;
pub mod filter;
pub mod mapper;
pub mod model;
pub mod providers;
pub mod queue;
pub mod store;

pub use audience::AudienceEngine;
pub use error::{Error, Result};
pub use filter::FilterCompiler;
pub use mapper::DateMapper;
pub use model::{
    AudienceFilter, DeliveryRecord, Message, MessageResult, State, Trigger, UserRecord,
};
pub use queue::QueueWriter;
pub use store::{MessageUpdate, QueryStep, SqliteStore, Store};
