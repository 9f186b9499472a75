//! Domain entities: messages, triggers, audience filters, delivery records.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::ops::{BitOr, BitOrAssign};
use std::sync::atomic::{AtomicU32, Ordering};
use uuid::Uuid;

/// Message lifecycle state, a small set of combinable bit-flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State(pub u32);

impl State {
    pub const CREATED: State = State(0);
    pub const ACTIVE: State = State(1 << 1);
    pub const DONE: State = State(1 << 2);
    pub const ERROR: State = State(1 << 3);

    pub fn contains(self, other: State) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for State {
    type Output = State;
    fn bitor(self, rhs: State) -> State {
        State(self.0 | rhs.0)
    }
}

impl BitOrAssign for State {
    fn bitor_assign(&mut self, rhs: State) {
        self.0 |= rhs.0;
    }
}

/// The rule determining when a message fires.
///
/// `Api` and `Plain` carry a fixed start date and map users immediately;
/// `Cohort` and `Event` are anchored to a per-user reference date (cohort
/// entry or triggering event) supplied by the external scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Trigger {
    Api {
        start: DateTime<Utc>,
        /// Fixed send-timezone offset in minutes. When set, the start date
        /// encodes the operator's intended wall-clock time and gets
        /// converted to an absolute instant per user.
        #[serde(default)]
        sctz: Option<i32>,
    },
    Plain {
        start: DateTime<Utc>,
        #[serde(default)]
        sctz: Option<i32>,
    },
    Cohort {
        cohorts: Vec<String>,
        /// Send time as milliseconds since local midnight.
        #[serde(default)]
        time: Option<i64>,
        /// Push a missed window to the next day instead of skipping the user.
        #[serde(default)]
        reschedule: bool,
        /// Spreading delay in milliseconds added to every computed instant.
        #[serde(default)]
        delay: i64,
        /// Hard expiry: no record is scheduled past this date.
        #[serde(default)]
        end: Option<DateTime<Utc>>,
    },
    Event {
        events: Vec<String>,
        #[serde(default)]
        time: Option<i64>,
        #[serde(default)]
        reschedule: bool,
        #[serde(default)]
        delay: i64,
        #[serde(default)]
        end: Option<DateTime<Utc>>,
    },
}

impl Trigger {
    pub fn kind(&self) -> &'static str {
        match self {
            Trigger::Api { .. } => "api",
            Trigger::Plain { .. } => "plain",
            Trigger::Cohort { .. } => "cohort",
            Trigger::Event { .. } => "event",
        }
    }
}

/// Audience filter: all dimensions are independently optional. An empty
/// filter matches every user holding a token for a targeted platform.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudienceFilter {
    /// Geo region ids; resolved through the geo provider when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geos: Option<Vec<String>>,
    /// Cohort ids the user must be a member of (AND).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cohorts: Option<Vec<String>>,
    /// Free-form user-property query; may embed `message` and `geo`
    /// sub-queries which the compiler resolves and strips.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Value>,
    /// Behavioral query evaluated by the external analytics engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drill: Option<Value>,
}

/// Aggregate result counters, mutated only through atomic store updates
/// mirrored locally by the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageResult {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub processed: u64,
    /// Per-platform, per-error-kind counters (e.g. `errors.a.cancelled`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<String, BTreeMap<String, u64>>,
    /// Terminal error payload set by `terminate`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A push message definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub app: String,
    /// Targeted platform keys, in send order.
    pub platforms: Vec<String>,
    /// Token fields per platform (e.g. production/development channels).
    pub fields: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub filter: AudienceFilter,
    pub trigger: Trigger,
    /// User document fields projected and copied into record props for
    /// personalization.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_props: Vec<String>,
    /// Per-platform content overrides.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub overrides: BTreeMap<String, Value>,
    #[serde(default)]
    pub state: State,
    #[serde(default)]
    pub result: MessageResult,
}

impl Message {
    /// Targeted `(platform, field)` pairs in platform order.
    pub fn token_fields(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.platforms.iter().flat_map(|p| {
            self.fields
                .get(p)
                .into_iter()
                .flatten()
                .map(move |f| (p.as_str(), f.as_str()))
        })
    }
}

/// A matched user, parsed from a projected store document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserRecord {
    pub uid: String,
    /// Stored timezone offset in minutes, if known.
    pub tz: Option<i32>,
    /// Token field key (`{platform}{field}`) to device token.
    pub tokens: BTreeMap<String, String>,
    /// Personalization props picked from the projected document.
    pub props: Option<Value>,
}

impl UserRecord {
    /// Parse a store document, keeping only non-null tokens and the listed
    /// personalization props. Returns `None` for documents without a uid.
    pub fn from_doc(doc: &Value, props: &[String]) -> Option<UserRecord> {
        let uid = doc.get("uid")?.as_str()?.to_string();
        let tz = doc.get("tz").and_then(Value::as_i64).map(|v| v as i32);

        let mut tokens = BTreeMap::new();
        if let Some(tk) = doc.get("tk").and_then(Value::as_object) {
            for (key, value) in tk {
                if let Some(token) = value.as_str() {
                    tokens.insert(key.clone(), token.to_string());
                }
            }
        }

        let mut picked = serde_json::Map::new();
        for name in props {
            if let Some(value) = doc.get(name) {
                picked.insert(name.clone(), value.clone());
            }
        }
        let props = if picked.is_empty() {
            None
        } else {
            Some(Value::Object(picked))
        };

        Some(UserRecord {
            uid,
            tz,
            tokens,
            props,
        })
    }

    pub fn token(&self, platform: &str, field: &str) -> Option<&str> {
        self.tokens
            .get(&format!("{platform}{field}"))
            .map(String::as_str)
    }
}

static DELIVERY_SEQ: AtomicU32 = AtomicU32::new(0);

/// Time-ordered delivery id: `timestamp_millis << 20 | seq`. Sorting by id
/// is sorting by delivery instant; `seq` disambiguates same-millisecond
/// records within a process.
pub fn delivery_id(at: DateTime<Utc>) -> i64 {
    let seq = DELIVERY_SEQ.fetch_add(1, Ordering::Relaxed) & 0xF_FFFF;
    (at.timestamp_millis() << 20) | i64::from(seq)
}

/// One queued unit of work: send this message via this platform/field to
/// this user, at the instant encoded in `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: i64,
    pub message: Uuid,
    pub platform: String,
    pub field: String,
    pub uid: String,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub props: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

impl DeliveryRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        at: DateTime<Utc>,
        message: Uuid,
        platform: &str,
        field: &str,
        uid: &str,
        token: &str,
        props: Option<Value>,
        content: Option<Value>,
    ) -> DeliveryRecord {
        DeliveryRecord {
            id: delivery_id(at),
            message,
            platform: platform.to_string(),
            field: field.to_string(),
            uid: uid.to_string(),
            token: token.to_string(),
            props,
            content,
        }
    }

    /// The delivery instant encoded in the id, millisecond precision.
    pub fn scheduled_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.id >> 20)
            .single()
            .expect("delivery id encodes a valid timestamp")
    }
}
