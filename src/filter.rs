//! Audience filter compilation.
//!
//! Translates a message's audience filter into an ordered sequence of
//! restriction steps plus a trailing projection, suitable for the store's
//! streaming executor. Optional capability providers widen what can be
//! compiled; an absent provider silently drops its dimension.

use crate::config::App;
use crate::error::{Error, Result};
use crate::model::Message;
use crate::providers::{BehaviorProvider, BehaviorQuery, GeoProvider};
use crate::store::{QueryStep, Store};
use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::debug;

pub struct FilterCompiler<'a, S: ?Sized> {
    app: &'a App,
    store: &'a S,
    geo: Option<&'a dyn GeoProvider>,
    behavior: Option<&'a dyn BehaviorProvider>,
}

impl<'a, S: Store + ?Sized> FilterCompiler<'a, S> {
    pub fn new(
        app: &'a App,
        store: &'a S,
        geo: Option<&'a dyn GeoProvider>,
        behavior: Option<&'a dyn BehaviorProvider>,
    ) -> FilterCompiler<'a, S> {
        FilterCompiler {
            app,
            store,
            geo,
            behavior,
        }
    }

    /// Compile the message's audience filter into ordered restriction steps
    /// plus the given projection. The caller's filter is never mutated;
    /// resolved sub-queries are stripped from a residual copy.
    pub async fn compile(&self, message: &Message, projection: Value) -> Result<Vec<QueryStep>> {
        let filter = &message.filter;
        let mut steps = Vec::new();

        // Only users holding a token for at least one targeted slot.
        let tokens: Vec<Value> = message
            .token_fields()
            .map(|(platform, field)| {
                let mut alt = Map::new();
                alt.insert(format!("tk.{platform}{field}"), json!({ "$exists": true }));
                Value::Object(alt)
            })
            .collect();
        steps.push(QueryStep::Match(json!({ "$or": tokens })));

        // Geo regions; skipped without a provider.
        if let (Some(ids), Some(geo)) = (filter.geos.as_ref(), self.geo) {
            if !ids.is_empty() {
                let regions = geo.regions(&self.app.id, ids).await.map_err(Error::Geo)?;
                let conds: Vec<Value> = regions.iter().map(|r| geo.conds(r)).collect();
                if !conds.is_empty() {
                    steps.push(QueryStep::Match(json!({ "$or": conds })));
                }
            }
        }

        // Cohort membership markers, all required.
        if let Some(cohorts) = filter.cohorts.as_ref() {
            if !cohorts.is_empty() {
                let mut cond = Map::new();
                for id in cohorts {
                    cond.insert(format!("chr.{id}.in"), json!("true"));
                }
                steps.push(QueryStep::Match(Value::Object(cond)));
            }
        }

        // Free-form user query with embedded sub-queries.
        if let Some(user) = filter.user.as_ref() {
            let mut residual = user.as_object().cloned().unwrap_or_default();

            if let Some(interaction) = residual.remove("message") {
                let cond = interaction_condition(&interaction)?;
                let uids = self.store.history_uids(&self.app.id, &cond).await?;
                debug!(matched = uids.len(), "resolved interaction sub-query");
                steps.push(QueryStep::Match(json!({ "uid": { "$in": uids } })));
            }

            // The geo sub-query key is stripped whether or not it resolves.
            if let Some(geo_query) = residual.remove("geo") {
                if let (Some(geo), Some(behavior)) = (self.geo, self.behavior) {
                    let mut geo_query = geo_query;
                    behavior.preprocess(&mut geo_query);
                    let regions = geo
                        .query(&self.app.id, &geo_query)
                        .await
                        .map_err(Error::Geo)?;
                    if regions.is_empty() {
                        // No candidate region: make the residual match
                        // nothing instead of failing the whole compile.
                        residual.insert("invalidgeo".into(), json!(true));
                    } else {
                        let conds: Vec<Value> = regions.iter().map(|r| geo.conds(r)).collect();
                        steps.push(QueryStep::Match(json!({ "$or": conds })));
                    }
                }
            }

            if !residual.is_empty() {
                steps.push(QueryStep::Match(Value::Object(residual)));
            }
        }

        // Behavioral query; skipped without a provider.
        if let (Some(drill), Some(behavior)) = (filter.drill.as_ref(), self.behavior) {
            if let Some(cond) = cohort_shortcut(drill) {
                steps.push(QueryStep::Match(cond));
            } else {
                let mut query = drill.clone();
                if let Some(body) = query.get_mut("queryObject").and_then(Value::as_object_mut) {
                    body.remove("chr");
                }
                let uids = behavior
                    .fetch_uids(BehaviorQuery {
                        app: self.app.id.clone(),
                        now: Utc::now(),
                        tz_offset: self.app.timezone_offset.unwrap_or(0),
                        query,
                    })
                    .await
                    .map_err(Error::Behavior)?;
                debug!(matched = uids.len(), "resolved behavioral query");
                steps.push(QueryStep::Match(json!({ "uid": { "$in": uids } })));
            }
        }

        steps.push(QueryStep::Project(projection));
        Ok(steps)
    }
}

/// Translate a prior-message-interaction filter into a history-store
/// condition. Included ids require at least one interaction with one of
/// them; excluded ids also admit users with no interaction history at all.
fn interaction_condition(filter: &Value) -> Result<Value> {
    if filter.is_array() {
        return Ok(json!({ "msgs": { "$in": filter } }));
    }
    if let Some(spec) = filter.as_object() {
        if let Some(included) = spec.get("$in") {
            return Ok(json!({ "msgs": { "$in": included } }));
        }
        if let Some(excluded) = spec.get("$nin") {
            return Ok(json!({
                "$or": [
                    { "msgs": { "$nin": excluded } },
                    { "msgs": { "$exists": false } },
                ]
            }));
        }
    }
    Err(Error::Filter(format!(
        "unsupported message interaction filter: {filter}"
    )))
}

/// A drill query that is exactly a cohort inclusion/exclusion expression
/// translates straight to membership markers, skipping the behavioral
/// engine.
fn cohort_shortcut(drill: &Value) -> Option<Value> {
    let body = drill.get("queryObject")?.as_object()?;
    if body.len() != 1 {
        return None;
    }
    let chr = body.get("chr")?.as_object()?;
    let mut cond = Map::new();
    for (op, ids) in chr {
        let ids = ids.as_array()?;
        match op.as_str() {
            "$in" => {
                for id in ids {
                    cond.insert(format!("chr.{}.in", id.as_str()?), json!("true"));
                }
            }
            "$nin" => {
                for id in ids {
                    cond.insert(format!("chr.{}.in", id.as_str()?), json!({ "$exists": false }));
                }
            }
            _ => return None,
        }
    }
    if cond.is_empty() {
        None
    } else {
        Some(Value::Object(cond))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::model::{AudienceFilter, DeliveryRecord, MessageResult, State, Trigger};
    use crate::providers::GeoRegion;
    use crate::store::MessageUpdate;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use std::sync::Mutex;
    use uuid::Uuid;

    fn app() -> App {
        let cfg: config::Config = serde_yaml::from_str(config::example()).unwrap();
        cfg.app("app1").unwrap().clone()
    }

    fn message(filter: AudienceFilter) -> Message {
        Message {
            id: Uuid::new_v4(),
            app: "app1".into(),
            platforms: vec!["a".into(), "i".into()],
            fields: [
                ("a".to_string(), vec!["p".to_string()]),
                ("i".to_string(), vec!["p".to_string()]),
            ]
            .into_iter()
            .collect(),
            filter,
            trigger: Trigger::Api {
                start: Utc::now(),
                sctz: None,
            },
            user_props: vec![],
            overrides: Default::default(),
            state: State::CREATED,
            result: MessageResult::default(),
        }
    }

    /// Store stub answering history lookups from a canned uid list and
    /// recording the condition it was asked.
    #[derive(Default)]
    struct HistoryStub {
        uids: Vec<String>,
        asked: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl Store for HistoryStub {
        async fn stream_users(
            &self,
            _app: &str,
            _steps: &[QueryStep],
        ) -> Result<BoxStream<'static, Result<Value>>> {
            unimplemented!("not used by compiler tests")
        }

        async fn history_uids(&self, _app: &str, cond: &Value) -> Result<Vec<String>> {
            self.asked.lock().unwrap().push(cond.clone());
            Ok(self.uids.clone())
        }

        async fn insert_deliveries(&self, _app: &str, _batch: &[DeliveryRecord]) -> Result<()> {
            unimplemented!("not used by compiler tests")
        }

        async fn delete_deliveries(
            &self,
            _app: &str,
            _message: Uuid,
            _platform: &str,
        ) -> Result<u64> {
            unimplemented!("not used by compiler tests")
        }

        async fn update_message(
            &self,
            _app: &str,
            _id: Uuid,
            _update: &MessageUpdate,
        ) -> Result<()> {
            unimplemented!("not used by compiler tests")
        }

        async fn put_message(&self, _app: &str, _message: &Message) -> Result<()> {
            unimplemented!("not used by compiler tests")
        }

        async fn get_message(&self, _app: &str, _id: Uuid) -> Result<Option<Message>> {
            unimplemented!("not used by compiler tests")
        }
    }

    /// Behavior fake returning canned uids and recording invocations.
    #[derive(Default)]
    struct RecordingBehavior {
        uids: Vec<String>,
        calls: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl BehaviorProvider for RecordingBehavior {
        fn preprocess(&self, _query: &mut Value) {}

        async fn fetch_uids(&self, params: BehaviorQuery) -> anyhow::Result<Vec<String>> {
            self.calls.lock().unwrap().push(params.query);
            Ok(self.uids.clone())
        }
    }

    /// Geo fake resolving every id to a country condition; `query` matches
    /// only when the filter mentions a known region.
    struct StaticGeo;

    #[async_trait]
    impl GeoProvider for StaticGeo {
        async fn regions(&self, _app: &str, ids: &[String]) -> anyhow::Result<Vec<GeoRegion>> {
            Ok(ids
                .iter()
                .map(|id| GeoRegion {
                    id: id.clone(),
                    shape: json!({ "country": id }),
                })
                .collect())
        }

        fn conds(&self, region: &GeoRegion) -> Value {
            json!({ "country": region.shape["country"] })
        }

        async fn query(&self, _app: &str, filter: &Value) -> anyhow::Result<Vec<GeoRegion>> {
            if filter.get("known").is_some() {
                Ok(vec![GeoRegion {
                    id: "g1".into(),
                    shape: json!({ "country": "NZ" }),
                }])
            } else {
                Ok(vec![])
            }
        }
    }

    /// Geo provider that always fails, to exercise error propagation.
    struct BrokenGeo;

    #[async_trait]
    impl GeoProvider for BrokenGeo {
        async fn regions(&self, _app: &str, _ids: &[String]) -> anyhow::Result<Vec<GeoRegion>> {
            Err(anyhow!("geo store offline"))
        }

        fn conds(&self, _region: &GeoRegion) -> Value {
            Value::Null
        }

        async fn query(&self, _app: &str, _filter: &Value) -> anyhow::Result<Vec<GeoRegion>> {
            Err(anyhow!("geo store offline"))
        }
    }

    fn token_step() -> QueryStep {
        QueryStep::Match(json!({
            "$or": [
                { "tk.ap": { "$exists": true } },
                { "tk.ip": { "$exists": true } },
            ]
        }))
    }

    #[tokio::test]
    async fn empty_filter_restricts_on_tokens_only() {
        let app = app();
        let store = HistoryStub::default();
        let compiler = FilterCompiler::new(&app, &store, None, None);
        let msg = message(AudienceFilter::default());

        let steps = compiler.compile(&msg, json!({ "uid": 1 })).await.unwrap();
        assert_eq!(
            steps,
            vec![token_step(), QueryStep::Project(json!({ "uid": 1 }))]
        );
    }

    #[tokio::test]
    async fn geo_dimension_skipped_without_provider() {
        let app = app();
        let store = HistoryStub::default();
        let compiler = FilterCompiler::new(&app, &store, None, None);
        let msg = message(AudienceFilter {
            geos: Some(vec!["g1".into()]),
            ..Default::default()
        });

        let steps = compiler.compile(&msg, json!({})).await.unwrap();
        assert_eq!(steps.len(), 2);
    }

    #[tokio::test]
    async fn geo_regions_compile_to_or_restriction() {
        let app = app();
        let store = HistoryStub::default();
        let geo = StaticGeo;
        let compiler = FilterCompiler::new(&app, &store, Some(&geo), None);
        let msg = message(AudienceFilter {
            geos: Some(vec!["NZ".into(), "AU".into()]),
            ..Default::default()
        });

        let steps = compiler.compile(&msg, json!({})).await.unwrap();
        assert_eq!(
            steps[1],
            QueryStep::Match(json!({
                "$or": [{ "country": "NZ" }, { "country": "AU" }]
            }))
        );
    }

    #[tokio::test]
    async fn geo_provider_failure_propagates() {
        let app = app();
        let store = HistoryStub::default();
        let geo = BrokenGeo;
        let compiler = FilterCompiler::new(&app, &store, Some(&geo), None);
        let msg = message(AudienceFilter {
            geos: Some(vec!["g1".into()]),
            ..Default::default()
        });

        let err = compiler.compile(&msg, json!({})).await.unwrap_err();
        assert!(matches!(err, Error::Geo(_)));
    }

    #[tokio::test]
    async fn cohorts_require_all_markers() {
        let app = app();
        let store = HistoryStub::default();
        let compiler = FilterCompiler::new(&app, &store, None, None);
        let msg = message(AudienceFilter {
            cohorts: Some(vec!["c1".into(), "c2".into()]),
            ..Default::default()
        });

        let steps = compiler.compile(&msg, json!({})).await.unwrap();
        assert_eq!(
            steps[1],
            QueryStep::Match(json!({ "chr.c1.in": "true", "chr.c2.in": "true" }))
        );
    }

    #[tokio::test]
    async fn interaction_subquery_resolves_and_strips() {
        let app = app();
        let store = HistoryStub {
            uids: vec!["u1".into(), "u2".into()],
            ..Default::default()
        };
        let compiler = FilterCompiler::new(&app, &store, None, None);
        let msg = message(AudienceFilter {
            user: Some(json!({
                "message": { "$nin": ["m1"] },
                "la": "en",
            })),
            ..Default::default()
        });

        let steps = compiler.compile(&msg, json!({})).await.unwrap();
        assert_eq!(
            steps[1],
            QueryStep::Match(json!({ "uid": { "$in": ["u1", "u2"] } }))
        );
        // residual user query survives minus the resolved key
        assert_eq!(steps[2], QueryStep::Match(json!({ "la": "en" })));
        // the excluded-ids form also admits users with no history field
        let asked = store.asked.lock().unwrap().clone();
        assert_eq!(
            asked,
            vec![json!({
                "$or": [
                    { "msgs": { "$nin": ["m1"] } },
                    { "msgs": { "$exists": false } },
                ]
            })]
        );
        // compile never mutates the caller's filter
        assert!(msg.filter.user.as_ref().unwrap().get("message").is_some());
    }

    #[tokio::test]
    async fn interaction_id_list_means_inclusion() {
        let app = app();
        let store = HistoryStub {
            uids: vec!["u1".into()],
            ..Default::default()
        };
        let compiler = FilterCompiler::new(&app, &store, None, None);
        let msg = message(AudienceFilter {
            user: Some(json!({ "message": ["m1", "m2"] })),
            ..Default::default()
        });

        compiler.compile(&msg, json!({})).await.unwrap();
        let asked = store.asked.lock().unwrap().clone();
        assert_eq!(asked, vec![json!({ "msgs": { "$in": ["m1", "m2"] } })]);
    }

    #[tokio::test]
    async fn unsupported_interaction_shape_is_an_error() {
        let app = app();
        let store = HistoryStub::default();
        let compiler = FilterCompiler::new(&app, &store, None, None);
        let msg = message(AudienceFilter {
            user: Some(json!({ "message": { "$regex": "m" } })),
            ..Default::default()
        });

        let err = compiler.compile(&msg, json!({})).await.unwrap_err();
        assert!(matches!(err, Error::Filter(_)));
    }

    #[tokio::test]
    async fn geo_subquery_with_no_candidates_matches_nothing() {
        let app = app();
        let store = HistoryStub::default();
        let geo = StaticGeo;
        let behavior = RecordingBehavior::default();
        let compiler = FilterCompiler::new(&app, &store, Some(&geo), Some(&behavior));
        let msg = message(AudienceFilter {
            user: Some(json!({ "geo": { "unknown": 1 } })),
            ..Default::default()
        });

        let steps = compiler.compile(&msg, json!({})).await.unwrap();
        assert_eq!(
            steps[1],
            QueryStep::Match(json!({ "invalidgeo": true }))
        );
    }

    #[tokio::test]
    async fn geo_subquery_with_candidates_compiles_to_or() {
        let app = app();
        let store = HistoryStub::default();
        let geo = StaticGeo;
        let behavior = RecordingBehavior::default();
        let compiler = FilterCompiler::new(&app, &store, Some(&geo), Some(&behavior));
        let msg = message(AudienceFilter {
            user: Some(json!({ "geo": { "known": 1 } })),
            ..Default::default()
        });

        let steps = compiler.compile(&msg, json!({})).await.unwrap();
        assert_eq!(
            steps[1],
            QueryStep::Match(json!({ "$or": [{ "country": "NZ" }] }))
        );
        // nothing left of the user query once geo is stripped
        assert_eq!(steps.len(), 3);
    }

    #[tokio::test]
    async fn cohort_only_drill_skips_behavior_engine() {
        let app = app();
        let store = HistoryStub::default();
        let behavior = RecordingBehavior::default();
        let compiler = FilterCompiler::new(&app, &store, None, Some(&behavior));
        let msg = message(AudienceFilter {
            drill: Some(json!({ "queryObject": { "chr": { "$in": ["c1", "c2"] } } })),
            ..Default::default()
        });

        let steps = compiler.compile(&msg, json!({})).await.unwrap();
        assert_eq!(
            steps[1],
            QueryStep::Match(json!({ "chr.c1.in": "true", "chr.c2.in": "true" }))
        );
        assert!(behavior.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cohort_exclusion_drill_requires_absent_markers() {
        let app = app();
        let store = HistoryStub::default();
        let behavior = RecordingBehavior::default();
        let compiler = FilterCompiler::new(&app, &store, None, Some(&behavior));
        let msg = message(AudienceFilter {
            drill: Some(json!({ "queryObject": { "chr": { "$nin": ["c3"] } } })),
            ..Default::default()
        });

        let steps = compiler.compile(&msg, json!({})).await.unwrap();
        assert_eq!(
            steps[1],
            QueryStep::Match(json!({ "chr.c3.in": { "$exists": false } }))
        );
        assert!(behavior.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn general_drill_queries_behavior_engine_without_chr() {
        let app = app();
        let store = HistoryStub::default();
        let behavior = RecordingBehavior {
            uids: vec!["u7".into()],
            ..Default::default()
        };
        let compiler = FilterCompiler::new(&app, &store, None, Some(&behavior));
        let msg = message(AudienceFilter {
            drill: Some(json!({
                "queryObject": { "chr": { "$in": ["c1"] }, "sg.purchase": { "$gt": 0 } },
                "period": "30days",
            })),
            ..Default::default()
        });

        let steps = compiler.compile(&msg, json!({})).await.unwrap();
        assert_eq!(
            steps[1],
            QueryStep::Match(json!({ "uid": { "$in": ["u7"] } }))
        );
        let calls = behavior.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![json!({
                "queryObject": { "sg.purchase": { "$gt": 0 } },
                "period": "30days",
            })]
        );
    }

    #[tokio::test]
    async fn drill_skipped_without_behavior_provider() {
        let app = app();
        let store = HistoryStub::default();
        let compiler = FilterCompiler::new(&app, &store, None, None);
        let msg = message(AudienceFilter {
            drill: Some(json!({ "queryObject": { "sg.purchase": { "$gt": 0 } } })),
            ..Default::default()
        });

        let steps = compiler.compile(&msg, json!({})).await.unwrap();
        assert_eq!(steps.len(), 2);
    }
}
