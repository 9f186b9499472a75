//! Audience orchestration: the schedule and cancellation paths.
//!
//! Scheduling compiles the message's filter, streams matched users from the
//! store, applies one date mapper per targeted `(platform, field)` slot per
//! user and batches the resulting records into the queue. Cancellation
//! deletes queued records and accounts them on the message document.
//!
//! No retry happens at this layer: a failed invocation propagates to the
//! external scheduler, which re-invokes on the next trigger tick. There is
//! also no mutual exclusion between an in-flight schedule and a concurrent
//! clear for the same message; callers own that ordering.

use crate::config::{App, Config};
use crate::error::{Error, Result};
use crate::filter::FilterCompiler;
use crate::mapper::DateMapper;
use crate::model::{Message, State, UserRecord};
use crate::providers::{BehaviorProvider, GeoProvider};
use crate::queue::QueueWriter;
use crate::store::{MessageUpdate, Store};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub struct AudienceEngine<S> {
    store: Arc<S>,
    config: Config,
    geo: Option<Arc<dyn GeoProvider>>,
    behavior: Option<Arc<dyn BehaviorProvider>>,
}

impl<S: Store> AudienceEngine<S> {
    pub fn new(store: Arc<S>, config: Config) -> AudienceEngine<S> {
        AudienceEngine {
            store,
            config,
            geo: None,
            behavior: None,
        }
    }

    /// Install the geolocation capability.
    pub fn with_geo(mut self, geo: Arc<dyn GeoProvider>) -> AudienceEngine<S> {
        self.geo = Some(geo);
        self
    }

    /// Install the behavioral-query capability.
    pub fn with_behavior(mut self, behavior: Arc<dyn BehaviorProvider>) -> AudienceEngine<S> {
        self.behavior = Some(behavior);
        self
    }

    fn app(&self, id: &str) -> Result<&App> {
        self.config
            .app(id)
            .ok_or_else(|| Error::AppNotFound(id.to_string()))
    }

    /// Fields projected out of matched user documents: identity, timezone,
    /// tokens and the message's personalization props.
    fn projection(message: &Message) -> Value {
        let mut proj = Map::new();
        for key in ["uid", "tz", "tk"] {
            proj.insert(key.to_string(), json!(1));
        }
        for prop in &message.user_props {
            proj.insert(prop.clone(), json!(1));
        }
        Value::Object(proj)
    }

    /// Resolve the audience and queue one delivery record per eligible
    /// `(user, platform, field)` slot, anchored at `reference`. Returns the
    /// number of queued records.
    ///
    /// For `Api`/`Plain` triggers `reference` is the trigger's start date;
    /// for `Cohort`/`Event` triggers it is the per-user cohort-entry or
    /// triggering-event timestamp handed in by the external scheduler.
    #[instrument(skip_all, fields(message = %message.id, app = %message.app))]
    pub async fn schedule(
        &self,
        message: &mut Message,
        reference: DateTime<Utc>,
    ) -> Result<u64> {
        let app = self.app(&message.app)?;
        let compiler = FilterCompiler::new(
            app,
            self.store.as_ref(),
            self.geo.as_deref(),
            self.behavior.as_deref(),
        );
        let steps = compiler.compile(message, Self::projection(message)).await?;
        let mapper = DateMapper::for_trigger(message, app);

        let now = Utc::now();
        let mut matches = self.store.stream_users(&message.app, &steps).await?;
        let mut writer = QueueWriter::new(
            self.store.as_ref(),
            &message.app,
            self.config.queue.batch_size,
        );

        while let Some(doc) = matches.next().await {
            let doc = doc?;
            let Some(user) = UserRecord::from_doc(&doc, &message.user_props) else {
                warn!("skipping matched document without a uid");
                continue;
            };
            for (platform, field) in message.token_fields() {
                let content = message.overrides.get(platform);
                if let Some(record) = mapper.map(now, &user, platform, field, reference, content) {
                    if writer.push(record) {
                        writer.flush().await?;
                    }
                }
            }
        }
        writer.flush().await?;

        let queued = writer.total();
        if queued > 0 {
            let update = MessageUpdate::default().inc("result.total", queued as i64);
            self.store
                .update_message(&message.app, message.id, &update)
                .await?;
            message.result.total += queued;
        }
        info!(queued, "scheduled message audience");
        Ok(queued)
    }

    /// Delete every queued record for the message across its targeted
    /// platforms and account the cancellations. Returns the total deleted.
    ///
    /// Idempotent in effect: with nothing queued it returns 0 and performs
    /// no counter mutation.
    #[instrument(skip_all, fields(message = %message.id, app = %message.app))]
    pub async fn clear(&self, message: &mut Message) -> Result<u64> {
        self.app(&message.app)?;

        let mut total = 0u64;
        let mut per_platform = Vec::new();
        let mut update = MessageUpdate::default();
        for platform in &message.platforms {
            let deleted = self
                .store
                .delete_deliveries(&message.app, message.id, platform)
                .await?;
            if deleted > 0 {
                update = update.inc(
                    &format!("result.errors.{platform}.cancelled"),
                    deleted as i64,
                );
                per_platform.push((platform.clone(), deleted));
                total += deleted;
            }
        }

        if total > 0 {
            update = update.inc("result.processed", total as i64);
            self.store
                .update_message(&message.app, message.id, &update)
                .await?;
            message.result.processed += total;
            for (platform, deleted) in per_platform {
                *message
                    .result
                    .errors
                    .entry(platform)
                    .or_default()
                    .entry("cancelled".to_string())
                    .or_default() += deleted;
            }
        }
        info!(deleted = total, "cleared queued deliveries");
        Ok(total)
    }

    /// Clear the queue, then mark the message terminally failed with the
    /// given reason. Irreversible. Returns the deleted count.
    #[instrument(skip_all, fields(message = %message.id, app = %message.app))]
    pub async fn terminate(&self, message: &mut Message, reason: &str) -> Result<u64> {
        let deleted = self.clear(message).await?;

        let state = message.state | State::DONE | State::ERROR;
        let update = MessageUpdate::default()
            .set("state", json!(state.0))
            .set("result.error", json!(reason));
        self.store
            .update_message(&message.app, message.id, &update)
            .await?;
        message.state = state;
        message.result.error = Some(reason.to_string());

        warn!(deleted, reason, "terminated message");
        Ok(deleted)
    }
}
