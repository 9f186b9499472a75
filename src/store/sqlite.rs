//! sqlx/SQLite implementation of the [`Store`] trait.
//!
//! Documents live in JSON `doc` columns. User streaming pages through rows
//! with keyset pagination and evaluates restriction steps in-process, so at
//! most one page plus one delivery batch is resident at a time.

use super::query;
use super::{MessageUpdate, QueryStep, Store};
use crate::error::{Error, Result};
use crate::model::{DeliveryRecord, Message};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Value};
use sqlx::{Row, SqlitePool};
use std::collections::VecDeque;
use tracing::{debug, instrument};
use uuid::Uuid;

const STREAM_PAGE: i64 = 256;

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<SqliteStore> {
        let normalized = prepare_sqlite_url(database_url);
        let pool = SqlitePool::connect(&normalized).await?;
        // Enable WAL and stricter durability.
        sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
        sqlx::query("PRAGMA synchronous=FULL;").execute(&pool).await?;
        Ok(SqliteStore { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(sqlx::Error::from)?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Upsert a user document into the app's user collection.
    #[instrument(skip_all)]
    pub async fn insert_user(&self, app: &str, uid: &str, doc: &Value) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (app_id, uid, doc) VALUES (?, ?, ?) \
             ON CONFLICT (app_id, uid) DO UPDATE SET doc = excluded.doc",
        )
        .bind(app)
        .bind(uid)
        .bind(doc.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Upsert a user's interaction-history document. `msgs` is the list of
    /// message ids ever delivered to the user; `None` means no interactions.
    #[instrument(skip_all)]
    pub async fn insert_history(&self, app: &str, uid: &str, msgs: Option<&Value>) -> Result<()> {
        sqlx::query(
            "INSERT INTO push_history (app_id, uid, msgs) VALUES (?, ?, ?) \
             ON CONFLICT (app_id, uid) DO UPDATE SET msgs = excluded.msgs",
        )
        .bind(app)
        .bind(uid)
        .bind(msgs.map(|m| m.to_string()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Queued records for a message, in delivery-instant order.
    pub async fn queued(&self, app: &str, message: Uuid) -> Result<Vec<DeliveryRecord>> {
        let rows = sqlx::query(
            "SELECT id, message_id, platform, field, uid, token, props, content \
             FROM queue WHERE app_id = ? AND message_id = ? ORDER BY id",
        )
        .bind(app)
        .bind(message.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let message_id: String = row.get("message_id");
            let props: Option<String> = row.get("props");
            let content: Option<String> = row.get("content");
            records.push(DeliveryRecord {
                id: row.get("id"),
                message: message_id.parse().unwrap_or(message),
                platform: row.get("platform"),
                field: row.get("field"),
                uid: row.get("uid"),
                token: row.get("token"),
                props: props.as_deref().map(serde_json::from_str).transpose()?,
                content: content.as_deref().map(serde_json::from_str).transpose()?,
            });
        }
        Ok(records)
    }

    pub async fn queued_count(&self, app: &str, message: Uuid) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM queue WHERE app_id = ? AND message_id = ?")
                .bind(app)
                .bind(message.to_string())
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }
}

/// For file-backed SQLite URLs, ensure the parent directory exists. Leaves
/// in-memory URLs and non-sqlite schemes untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }
    let rest = url["sqlite:".len()..].trim_start_matches("//");
    let path = rest.split('?').next().unwrap_or("");
    if !path.is_empty() {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
    }
    url.to_string()
}

/// Navigate to a dotted path inside a document, creating intermediate
/// objects as needed.
fn ensure_path<'a>(doc: &'a mut Value, path: &str) -> &'a mut Value {
    let mut current = doc;
    for part in path.split('.') {
        if !current.is_object() {
            *current = Value::Object(Default::default());
        }
        current = current
            .as_object_mut()
            .expect("just replaced with an object")
            .entry(part)
            .or_insert(Value::Null);
    }
    current
}

struct PageState {
    pool: SqlitePool,
    app: String,
    conds: Vec<Value>,
    projection: Value,
    after: i64,
    buf: VecDeque<Value>,
    done: bool,
}

#[async_trait]
impl Store for SqliteStore {
    async fn stream_users(
        &self,
        app: &str,
        steps: &[QueryStep],
    ) -> Result<BoxStream<'static, Result<Value>>> {
        let mut conds = Vec::new();
        let mut projection = Value::Object(Default::default());
        for step in steps {
            match step {
                QueryStep::Match(cond) => conds.push(cond.clone()),
                QueryStep::Project(proj) => projection = proj.clone(),
            }
        }
        debug!(restrictions = conds.len(), "streaming user matches");

        let state = PageState {
            pool: self.pool.clone(),
            app: app.to_string(),
            conds,
            projection,
            after: 0,
            buf: VecDeque::new(),
            done: false,
        };

        let stream = stream::unfold(state, |mut st| async move {
            loop {
                if let Some(doc) = st.buf.pop_front() {
                    return Some((Ok(doc), st));
                }
                if st.done {
                    return None;
                }
                let rows = sqlx::query(
                    "SELECT id, doc FROM users WHERE app_id = ? AND id > ? ORDER BY id LIMIT ?",
                )
                .bind(&st.app)
                .bind(st.after)
                .bind(STREAM_PAGE)
                .fetch_all(&st.pool)
                .await;
                let rows = match rows {
                    Ok(rows) => rows,
                    Err(err) => {
                        st.done = true;
                        return Some((Err(err.into()), st));
                    }
                };
                if (rows.len() as i64) < STREAM_PAGE {
                    st.done = true;
                }
                for row in &rows {
                    st.after = st.after.max(row.get::<i64, _>("id"));
                    let doc: Value = match serde_json::from_str(&row.get::<String, _>("doc")) {
                        Ok(doc) => doc,
                        Err(err) => {
                            st.done = true;
                            return Some((Err(err.into()), st));
                        }
                    };
                    if st.conds.iter().all(|cond| query::matches(&doc, cond)) {
                        st.buf.push_back(query::project(&doc, &st.projection));
                    }
                }
            }
        })
        .boxed();

        Ok(stream)
    }

    async fn history_uids(&self, app: &str, cond: &Value) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT uid, msgs FROM push_history WHERE app_id = ?")
            .bind(app)
            .fetch_all(&self.pool)
            .await?;

        let mut uids = Vec::new();
        for row in rows {
            let uid: String = row.get("uid");
            let msgs: Option<String> = row.get("msgs");
            let mut doc = serde_json::Map::new();
            doc.insert("uid".into(), json!(uid));
            if let Some(raw) = msgs {
                doc.insert("msgs".into(), serde_json::from_str(&raw)?);
            }
            if query::matches(&Value::Object(doc), cond) {
                uids.push(uid);
            }
        }
        Ok(uids)
    }

    #[instrument(skip_all, fields(count = batch.len()))]
    async fn insert_deliveries(&self, app: &str, batch: &[DeliveryRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for record in batch {
            sqlx::query(
                "INSERT INTO queue (id, app_id, message_id, platform, field, uid, token, props, content) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(record.id)
            .bind(app)
            .bind(record.message.to_string())
            .bind(&record.platform)
            .bind(&record.field)
            .bind(&record.uid)
            .bind(&record.token)
            .bind(record.props.as_ref().map(|v| v.to_string()))
            .bind(record.content.as_ref().map(|v| v.to_string()))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn delete_deliveries(&self, app: &str, message: Uuid, platform: &str) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM queue WHERE app_id = ? AND message_id = ? AND platform = ?")
                .bind(app)
                .bind(message.to_string())
                .bind(platform)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip_all)]
    async fn update_message(&self, app: &str, id: Uuid, update: &MessageUpdate) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        let raw: Option<String> =
            sqlx::query_scalar("SELECT doc FROM messages WHERE app_id = ? AND id = ?")
                .bind(app)
                .bind(id.to_string())
                .fetch_optional(&mut *tx)
                .await?;
        let Some(raw) = raw else {
            return Err(Error::MessageNotFound(id));
        };

        let mut doc: Value = serde_json::from_str(&raw)?;
        for (path, by) in &update.inc {
            let slot = ensure_path(&mut doc, path);
            let current = slot.as_i64().unwrap_or(0);
            *slot = json!(current + by);
        }
        for (path, value) in &update.set {
            *ensure_path(&mut doc, path) = value.clone();
        }

        sqlx::query("UPDATE messages SET doc = ? WHERE app_id = ? AND id = ?")
            .bind(doc.to_string())
            .bind(app)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn put_message(&self, app: &str, message: &Message) -> Result<()> {
        sqlx::query(
            "INSERT INTO messages (app_id, id, doc) VALUES (?, ?, ?) \
             ON CONFLICT (app_id, id) DO UPDATE SET doc = excluded.doc",
        )
        .bind(app)
        .bind(message.id.to_string())
        .bind(serde_json::to_string(message)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_message(&self, app: &str, id: Uuid) -> Result<Option<Message>> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT doc FROM messages WHERE app_id = ? AND id = ?")
                .bind(app)
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}
