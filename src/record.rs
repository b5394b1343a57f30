//! User record model and schema upcast
//!
//! The whole record is the unit of persistence. Older on-disk shapes are
//! reconciled here, once, at load time:
//!
//! - plan as a bare string with a top-level `plan_expiry`
//!   (epoch seconds, RFC 3339, or a naive `YYYY-MM-DD[T ]HH:MM:SS[.f]` in UTC)
//! - plan as `{name, expires_at}` with epoch seconds
//! - referrals as a bare list of pending invitee ids, with top-level
//!   `inviter_id` and `successful_referrals`
//! - referrals as `{invited_by, pending, completed, total, successful}`
//! - `usage.videos_watched_today` / `usage.last_watch_reset`
//! - `username`, `user_id`, `last_active`, `last_activity`, `last_refill`
//!
//! Every other module sees only the current schema.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

use crate::error::StorageError;
use crate::plans::PlanName;

/// Stable numeric user identifier
pub type UserId = u64;

/// Current on-disk schema version
pub const SCHEMA_VERSION: u32 = 2;

/// Active plan and when it lapses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanState {
    pub name: PlanName,
    /// `None` iff `name == Free`
    pub expires_at: Option<DateTime<Utc>>,
}

impl PlanState {
    pub fn free() -> Self {
        Self {
            name: PlanName::Free,
            expires_at: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if now >= at)
    }
}

impl Default for PlanState {
    fn default() -> Self {
        Self::free()
    }
}

/// Per-day consumption counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub units_today: u32,
    pub downloads_today: u32,
    pub last_reset: Option<NaiveDate>,
}

impl Usage {
    pub fn fresh(today: NaiveDate) -> Self {
        Self {
            units_today: 0,
            downloads_today: 0,
            last_reset: Some(today),
        }
    }

    /// Zero the counters if they belong to another day. Returns true if reset.
    pub fn roll_over(&mut self, today: NaiveDate) -> bool {
        if self.last_reset == Some(today) {
            return false;
        }
        *self = Usage::fresh(today);
        true
    }
}

/// Referral graph edges touching this user
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Referrals {
    /// Set at most once, never equal to the owner's id
    pub invited_by: Option<UserId>,
    pub pending: BTreeSet<UserId>,
    pub completed: BTreeSet<UserId>,
    pub total_count: u64,
    /// Always `completed.len() + legacy_success`
    pub success_count: u64,
    /// Completions carried over from records that kept only a count
    #[serde(default)]
    pub legacy_success: u64,
}

impl Referrals {
    pub fn recount(&mut self) {
        self.success_count = self.completed.len() as u64 + self.legacy_success;
    }
}

/// One end user's ledger state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub schema_version: u32,
    pub id: UserId,
    pub display_name: String,
    pub credits: u64,
    pub plan: PlanState,
    pub usage: Usage,
    pub referrals: Referrals,
    pub badges: BTreeSet<String>,
    pub tasks_opened: BTreeMap<String, DateTime<Utc>>,
    pub tasks_completed: BTreeSet<String>,
    pub redeemed_codes: BTreeSet<String>,
    #[serde(default)]
    pub giveaways_joined: BTreeSet<String>,
    pub sponsor_verified: bool,
    pub last_active_at: DateTime<Utc>,
    pub last_refill_at: Option<DateTime<Utc>>,
    /// Transport message ids currently showing this user's menus
    pub active_messages: BTreeSet<i64>,
    pub created_at: DateTime<Utc>,
}

impl UserRecord {
    /// Default Free-plan record for a first contact
    pub fn new(id: UserId, display_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            id,
            display_name: display_name.into(),
            credits: 0,
            plan: PlanState::free(),
            usage: Usage::fresh(now.date_naive()),
            referrals: Referrals::default(),
            badges: BTreeSet::new(),
            tasks_opened: BTreeMap::new(),
            tasks_completed: BTreeSet::new(),
            redeemed_codes: BTreeSet::new(),
            giveaways_joined: BTreeSet::new(),
            sponsor_verified: false,
            last_active_at: now,
            last_refill_at: None,
            active_messages: BTreeSet::new(),
            created_at: now,
        }
    }

    /// Whether the current plan waives credit checks
    pub fn has_unlimited_credits(&self) -> bool {
        self.plan.name.spec().credits.is_unlimited()
    }

    /// Enforce structural invariants. Returns true if anything changed.
    pub fn normalize(&mut self) -> bool {
        let before = self.clone();

        self.schema_version = SCHEMA_VERSION;

        if self.plan.name == PlanName::Free {
            self.plan.expires_at = None;
        } else if self.plan.expires_at.is_none() {
            warn!(user_id = self.id, plan = %self.plan.name, "Paid plan without expiry, reverting to Free");
            self.plan = PlanState::free();
        }

        let id = self.id;
        if self.referrals.invited_by == Some(id) {
            self.referrals.invited_by = None;
        }
        self.referrals.pending.remove(&id);
        self.referrals.completed.remove(&id);
        let completed = self.referrals.completed.clone();
        self.referrals.pending.retain(|u| !completed.contains(u));
        self.referrals.recount();
        let edges = self.referrals.pending.len() as u64 + self.referrals.success_count;
        self.referrals.total_count = self.referrals.total_count.max(edges);

        *self != before
    }
}

/// sled key for a user record (big-endian so iteration follows id order)
pub fn user_key(id: UserId) -> [u8; 8] {
    id.to_be_bytes()
}

pub fn user_id_from_key(key: &[u8]) -> Option<UserId> {
    let bytes: [u8; 8] = key.try_into().ok()?;
    Some(UserId::from_be_bytes(bytes))
}

/// Bring any stored shape up to the current schema.
///
/// Returns the record and whether it differs from what was stored (and so
/// should be written back).
pub fn upcast(
    id: UserId,
    value: Value,
    now: DateTime<Utc>,
) -> Result<(UserRecord, bool), StorageError> {
    if !value.is_object() {
        return Err(StorageError::Corrupt {
            key: format!("users/{}", id),
            reason: "record is not a JSON object".to_string(),
        });
    }

    let current = value.get("schema_version").and_then(Value::as_u64) == Some(SCHEMA_VERSION as u64);
    if current {
        let mut record: UserRecord = serde_json::from_value(value)?;
        let mut changed = record.id != id;
        record.id = id;
        changed |= record.normalize();
        return Ok((record, changed));
    }

    let mut record = upcast_legacy(id, &value, now);
    record.normalize();
    Ok((record, true))
}

fn upcast_legacy(id: UserId, v: &Value, now: DateTime<Utc>) -> UserRecord {
    let mut record = UserRecord::new(id, String::new(), now);

    record.display_name = first_str(v, &["display_name", "username", "name"]).unwrap_or_default();
    record.credits = v
        .get("credits")
        .and_then(Value::as_i64)
        .map(|c| c.max(0) as u64)
        .unwrap_or(0);
    record.plan = legacy_plan(v);

    if let Some(usage) = v.get("usage").filter(|u| u.is_object()) {
        record.usage.units_today = first_u64(usage, &["units_today", "videos_watched_today"]).unwrap_or(0) as u32;
        record.usage.downloads_today = first_u64(usage, &["downloads_today"]).unwrap_or(0) as u32;
        record.usage.last_reset = ["last_reset", "last_watch_reset"]
            .iter()
            .find_map(|k| usage.get(*k).and_then(parse_date));
    } else {
        record.usage = Usage::default();
    }

    record.referrals = legacy_referrals(v);
    record.badges = string_set(v.get("badges"));
    record.tasks_completed = string_set(v.get("tasks_completed"));
    record.redeemed_codes = string_set(v.get("redeemed_codes"))
        .into_iter()
        .map(|c| c.trim().to_ascii_uppercase())
        .collect();
    record.giveaways_joined = string_set(v.get("giveaways_joined"));

    if let Some(opened) = v.get("tasks_opened").and_then(Value::as_object) {
        record.tasks_opened = opened
            .iter()
            .filter_map(|(task, at)| parse_timestamp(at).map(|at| (task.clone(), at)))
            .collect();
    }

    record.sponsor_verified = v.get("sponsor_verified").and_then(Value::as_bool).unwrap_or(false);
    record.last_active_at = ["last_active_at", "last_active", "last_activity"]
        .iter()
        .find_map(|k| v.get(*k).and_then(parse_timestamp))
        .unwrap_or(now);
    record.last_refill_at = ["last_refill_at", "last_refill"]
        .iter()
        .find_map(|k| v.get(*k).and_then(parse_timestamp));
    record.created_at = v.get("created_at").and_then(parse_timestamp).unwrap_or(now);

    if let Some(messages) = v.get("active_messages").and_then(Value::as_array) {
        record.active_messages = messages.iter().filter_map(Value::as_i64).collect();
    }

    record
}

fn legacy_plan(v: &Value) -> PlanState {
    let top_expiry = v.get("plan_expiry").and_then(parse_timestamp);
    let (name, expires_at) = match v.get("plan") {
        Some(Value::String(name)) => (name.clone(), top_expiry),
        Some(Value::Object(plan)) => (
            plan.get("name").and_then(Value::as_str).unwrap_or("Free").to_string(),
            plan.get("expires_at").and_then(parse_timestamp).or(top_expiry),
        ),
        _ => ("Free".to_string(), None),
    };

    match name.parse::<PlanName>() {
        Ok(PlanName::Free) => PlanState::free(),
        Ok(name) => PlanState { name, expires_at },
        Err(_) => {
            warn!(plan = %name, "Unknown legacy plan name, treating as Free");
            PlanState::free()
        }
    }
}

fn legacy_referrals(v: &Value) -> Referrals {
    let mut referrals = match v.get("referrals") {
        Some(Value::Array(pending)) => Referrals {
            pending: pending.iter().filter_map(parse_user_id).collect(),
            ..Referrals::default()
        },
        Some(Value::Object(r)) => {
            let id_set = |key: &str| -> BTreeSet<UserId> {
                r.get(key)
                    .and_then(Value::as_array)
                    .map(|ids| ids.iter().filter_map(parse_user_id).collect())
                    .unwrap_or_default()
            };
            Referrals {
                invited_by: r.get("invited_by").and_then(parse_user_id),
                pending: id_set("pending"),
                completed: id_set("completed"),
                total_count: ["total_count", "total"]
                    .iter()
                    .find_map(|k| r.get(*k).and_then(Value::as_u64))
                    .unwrap_or(0),
                success_count: r.get("successful").and_then(Value::as_u64).unwrap_or(0),
                legacy_success: 0,
            }
        }
        _ => Referrals::default(),
    };

    if referrals.invited_by.is_none() {
        referrals.invited_by = v.get("inviter_id").and_then(parse_user_id);
    }
    if let Some(successful) = v.get("successful_referrals").and_then(Value::as_u64) {
        referrals.success_count = referrals.success_count.max(successful);
    }
    // Counted successes without a recorded invitee id
    referrals.legacy_success = referrals
        .success_count
        .saturating_sub(referrals.completed.len() as u64);
    referrals
}

fn first_str(v: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| v.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

fn first_u64(v: &Value, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|k| v.get(*k).and_then(Value::as_u64))
}

fn string_set(v: Option<&Value>) -> BTreeSet<String> {
    v.and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_user_id(v: &Value) -> Option<UserId> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Naive layouts written by the bot, read as UTC
const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Epoch seconds, RFC 3339, or a naive datetime (UTC)
fn parse_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::Number(n) => {
            let secs = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            if secs <= 0 {
                return None;
            }
            Utc.timestamp_opt(secs, 0).single()
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NAIVE_FORMATS
                    .iter()
                    .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                    .map(|naive| naive.and_utc())
            }),
        _ => None,
    }
}

fn parse_date(v: &Value) -> Option<NaiveDate> {
    match v {
        Value::String(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .ok()
            .or_else(|| parse_timestamp(v).map(|dt| dt.date_naive())),
        _ => parse_timestamp(v).map(|dt| dt.date_naive()),
    }
}
