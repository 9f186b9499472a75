//! Delivery-instant computation.
//!
//! A mapper converts a matched user plus a reference date into a concrete
//! delivery record, or nothing when the user is ineligible for the slot.
//! The strategy is chosen once per scheduling run from the trigger kind:
//! `Api`/`Plain` triggers map immediately, `Cohort`/`Event` triggers anchor
//! to a per-user reference date with local-time windows, rescheduling and
//! expiry rules.

use crate::config::App;
use crate::model::{DeliveryRecord, Message, Trigger, UserRecord};
use chrono::{DateTime, Duration, Local, TimeZone, Utc};
use serde_json::Value;
use uuid::Uuid;

const DAY_MS: i64 = 86_400_000;

#[derive(Debug, Clone)]
pub enum DateMapper {
    Immediate(Immediate),
    Anchored(Anchored),
}

#[derive(Debug, Clone)]
pub struct Immediate {
    message: Uuid,
    sctz: Option<i32>,
    app_tz: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct Anchored {
    message: Uuid,
    time: Option<i64>,
    reschedule: bool,
    delay: i64,
    end: Option<DateTime<Utc>>,
    app_tz: Option<i32>,
}

impl DateMapper {
    /// Select the mapping strategy for a message's trigger kind.
    pub fn for_trigger(message: &Message, app: &App) -> DateMapper {
        match &message.trigger {
            Trigger::Api { sctz, .. } | Trigger::Plain { sctz, .. } => {
                DateMapper::Immediate(Immediate {
                    message: message.id,
                    sctz: *sctz,
                    app_tz: app.timezone_offset,
                })
            }
            Trigger::Cohort {
                time,
                reschedule,
                delay,
                end,
                ..
            }
            | Trigger::Event {
                time,
                reschedule,
                delay,
                end,
                ..
            } => DateMapper::Anchored(Anchored {
                message: message.id,
                time: *time,
                reschedule: *reschedule,
                delay: *delay,
                end: *end,
                app_tz: app.timezone_offset,
            }),
        }
    }

    /// Compute the delivery record for one `(platform, field)` slot.
    ///
    /// Returns `None` when the user holds no token for the slot, or when the
    /// anchored rules suppress the send (missed window without reschedule,
    /// expired trigger).
    pub fn map(
        &self,
        now: DateTime<Utc>,
        user: &UserRecord,
        platform: &str,
        field: &str,
        reference: DateTime<Utc>,
        content: Option<&Value>,
    ) -> Option<DeliveryRecord> {
        let token = user.token(platform, field)?;
        let at = match self {
            DateMapper::Immediate(m) => m.instant(user, reference),
            DateMapper::Anchored(m) => m.instant(now, user, reference)?,
        };
        Some(DeliveryRecord::new(
            at,
            self.message(),
            platform,
            field,
            &user.uid,
            token,
            user.props.clone(),
            content.cloned(),
        ))
    }

    fn message(&self) -> Uuid {
        match self {
            DateMapper::Immediate(m) => m.message,
            DateMapper::Anchored(m) => m.message,
        }
    }
}

/// Effective timezone offset in minutes: the user's stored offset, falling
/// back to the app's configured offset, then zero.
fn effective_tz(user: &UserRecord, app_tz: Option<i32>) -> i64 {
    i64::from(user.tz.or(app_tz).unwrap_or(0))
}

impl Immediate {
    /// With a send timezone, the reference date encodes the operator's
    /// intended wall-clock time; subtracting the fixed offset and the user's
    /// offset converts it to the absolute instant of that wall-clock time in
    /// the user's zone. Without one, the reference passes through.
    fn instant(&self, user: &UserRecord, reference: DateTime<Utc>) -> DateTime<Utc> {
        match self.sctz {
            Some(sctz) => {
                reference
                    - Duration::minutes(i64::from(sctz))
                    - Duration::minutes(effective_tz(user, self.app_tz))
            }
            None => reference,
        }
    }
}

impl Anchored {
    fn instant(
        &self,
        now: DateTime<Utc>,
        user: &UserRecord,
        reference: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let mut at = match self.time {
            Some(time) => {
                // `time` past midnight of the reference day on the user's
                // local clock: take the calendar date of the reference in
                // the process-local zone, anchor at its UTC midnight, then
                // shift by the user's offset.
                let day = reference.with_timezone(&Local).date_naive();
                let midnight = Utc.from_utc_datetime(
                    &day.and_hms_opt(0, 0, 0).expect("midnight is a valid time"),
                );
                let candidate = midnight + Duration::milliseconds(time)
                    - Duration::minutes(effective_tz(user, self.app_tz));
                if candidate < now {
                    if self.reschedule {
                        // Missed today's window; push to the same time
                        // tomorrow.
                        candidate + Duration::milliseconds(DAY_MS)
                    } else {
                        return None;
                    }
                } else {
                    candidate
                }
            }
            None => reference,
        };

        at = at + Duration::milliseconds(self.delay);

        if let Some(end) = self.end {
            if end < at {
                return None;
            }
        }
        Some(at)
    }
}
