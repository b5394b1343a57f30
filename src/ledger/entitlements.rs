//! Credits, plans and access checks
//!
//! The record-level rules are plain functions over `&mut UserRecord` so the
//! sweep, redemption and the single-user operations share one implementation.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use super::Ledger;
use crate::config::LedgerRules;
use crate::error::{Rejection, Result};
use crate::plans::{Action, Allowance, PlanName};
use crate::record::{PlanState, UserId, UserRecord, Usage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CreditChange {
    pub new_balance: u64,
}

/// How a plan change treats the current expiry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanMode {
    /// `expires_at = now + days`
    Replace,
    /// `expires_at = max(expires_at, now) + days`
    Extend,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanRequest {
    pub plan: PlanName,
    /// 0 means the catalog validity
    pub days: u32,
    pub mode: PlanMode,
    /// Also grant the plan's one-time credit allowance
    pub grant_plan_credits: bool,
}

impl PlanRequest {
    /// Admin-style change: replace, no credits
    pub fn replace(plan: PlanName, days: u32) -> Self {
        Self {
            plan,
            days,
            mode: PlanMode::Replace,
            grant_plan_credits: false,
        }
    }

    pub fn extend(plan: PlanName, days: u32) -> Self {
        Self {
            plan,
            days,
            mode: PlanMode::Extend,
            grant_plan_credits: false,
        }
    }

    pub fn with_plan_credits(mut self) -> Self {
        self.grant_plan_credits = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanChange {
    pub plan: PlanState,
    pub credits_granted: u64,
    pub new_balance: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExpiryOutcome {
    pub expired: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RefillOutcome {
    pub refilled: bool,
    pub new_balance: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Allow,
    Deny(Rejection),
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AccessDecision::Allow)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConsumeOutcome {
    pub new_balance: u64,
    pub units_today: u32,
    pub downloads_today: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub users_scanned: u64,
    pub users_expired: u64,
    pub users_refilled: u64,
    pub failures: u64,
}

/// Apply a signed credit delta.
///
/// On unlimited-credit plans debits are ignored and credits still accrue.
pub fn apply_credit_delta(record: &mut UserRecord, delta: i64) -> std::result::Result<u64, Rejection> {
    let amount = delta.unsigned_abs();
    if delta >= 0 {
        record.credits = record.credits.saturating_add(amount);
    } else if !record.has_unlimited_credits() {
        record.credits = record
            .credits
            .checked_sub(amount)
            .ok_or(Rejection::InsufficientCredits {
                required: amount,
                available: record.credits,
            })?;
    }
    Ok(record.credits)
}

/// Switch or extend the plan. Returns the credits granted with it.
///
/// `InvalidDuration` if the new expiry is past the representable range; the
/// record is left as it was.
pub fn apply_plan(
    record: &mut UserRecord,
    request: &PlanRequest,
    now: DateTime<Utc>,
) -> std::result::Result<u64, Rejection> {
    let spec = request.plan.spec();

    let Some(validity) = spec.validity_days else {
        record.plan = PlanState::free();
        return Ok(0);
    };

    let days = if request.days == 0 { validity } else { request.days };
    let base = match request.mode {
        PlanMode::Replace => now,
        PlanMode::Extend => record.plan.expires_at.map_or(now, |at| at.max(now)),
    };
    let expires_at = base
        .checked_add_signed(Duration::days(i64::from(days)))
        .ok_or(Rejection::InvalidDuration { days })?;
    record.plan = PlanState {
        name: request.plan,
        expires_at: Some(expires_at),
    };

    Ok(match (request.grant_plan_credits, spec.credits) {
        (true, Allowance::Limited(credits)) => {
            record.credits = record.credits.saturating_add(credits);
            credits
        }
        _ => 0,
    })
}

/// Revert a lapsed plan to Free. Returns true if it lapsed.
pub fn expire_if_due(record: &mut UserRecord, now: DateTime<Utc>) -> bool {
    if !record.plan.is_expired(now) {
        return false;
    }
    info!(user_id = record.id, plan = %record.plan.name, "Plan expired, reverting to Free");
    record.plan = PlanState::free();
    record.usage = Usage::fresh(now.date_naive());
    true
}

/// Hourly Free-plan top-up. Returns true if credits were granted.
pub fn refill_if_due(record: &mut UserRecord, now: DateTime<Utc>, rules: &LedgerRules) -> bool {
    if record.plan.name != PlanName::Free {
        return false;
    }

    let interval = Duration::seconds(rules.free_refill_interval_secs as i64);
    if let Some(last) = record.last_refill_at {
        if last > now + interval {
            warn!(user_id = record.id, last_refill = %last, "Refill timestamp in the future, re-anchoring");
            record.last_refill_at = Some(now);
            return false;
        }
        if now - last < interval {
            return false;
        }
    }

    let before = record.credits;
    let topped = before
        .saturating_add(rules.free_refill_amount)
        .min(rules.free_refill_cap);
    record.credits = before.max(topped);
    record.last_refill_at = Some(now);
    record.credits > before
}

/// Check an action against plan, daily counters and balance
pub fn evaluate(record: &UserRecord, action: Action) -> AccessDecision {
    let spec = record.plan.name.spec();

    let limit = match action {
        Action::Watch => spec.daily_units,
        Action::Download => spec.daily_downloads,
    };
    let used = match action {
        Action::Watch => record.usage.units_today,
        Action::Download => record.usage.downloads_today,
    };
    if let Allowance::Limited(limit) = limit {
        if !limit_allows(limit, used) {
            let limit = limit.min(u32::MAX as u64) as u32;
            return AccessDecision::Deny(match action {
                Action::Watch => Rejection::DailyLimitReached { limit },
                Action::Download if limit == 0 => Rejection::DownloadNotAllowed,
                Action::Download => Rejection::DownloadLimitReached { limit },
            });
        }
    }

    let cost = action.credit_cost();
    if !record.has_unlimited_credits() && record.credits < cost {
        return AccessDecision::Deny(Rejection::InsufficientCredits {
            required: cost,
            available: record.credits,
        });
    }

    AccessDecision::Allow
}

fn limit_allows(limit: u64, used: u32) -> bool {
    Allowance::Limited(limit).permits(u64::from(used))
}

/// Lazy expiry and day rollover run before every access check and read
pub(crate) fn settle(record: &mut UserRecord, now: DateTime<Utc>) {
    expire_if_due(record, now);
    record.usage.roll_over(now.date_naive());
}

impl Ledger {
    /// Add (or, if negative, debit) credits
    pub async fn adjust_credits(&self, user_id: UserId, delta: i64, reason: &str) -> Result<CreditChange> {
        let new_balance = self
            .mutate(user_id, |record, _| apply_credit_delta(record, delta))
            .await?;
        info!(user_id, delta, reason, new_balance, "Adjusted credits");
        Ok(CreditChange { new_balance })
    }

    /// Admin plan change: replaces the expiry, grants no credits
    pub async fn set_plan(&self, user_id: UserId, plan: &str, days: u32) -> Result<PlanChange> {
        let plan: PlanName = plan.parse()?;
        self.apply_plan(user_id, PlanRequest::replace(plan, days)).await
    }

    pub async fn apply_plan(&self, user_id: UserId, request: PlanRequest) -> Result<PlanChange> {
        let change = self
            .mutate(user_id, |record, now| {
                let credits_granted = apply_plan(record, &request, now)?;
                Ok(PlanChange {
                    plan: record.plan.clone(),
                    credits_granted,
                    new_balance: record.credits,
                })
            })
            .await?;
        info!(
            user_id,
            plan = %change.plan.name,
            expires_at = ?change.plan.expires_at,
            credits_granted = change.credits_granted,
            "Plan changed"
        );
        Ok(change)
    }

    pub async fn check_and_expire_plan(&self, user_id: UserId) -> Result<ExpiryOutcome> {
        let expired = self
            .mutate(user_id, |record, now| Ok(expire_if_due(record, now)))
            .await?;
        Ok(ExpiryOutcome { expired })
    }

    pub async fn refill_free_credits(&self, user_id: UserId) -> Result<RefillOutcome> {
        let rules = &self.rules;
        let outcome = self
            .mutate(user_id, |record, now| {
                let refilled = refill_if_due(record, now, rules);
                Ok(RefillOutcome {
                    refilled,
                    new_balance: record.credits,
                })
            })
            .await?;
        if outcome.refilled {
            info!(user_id, new_balance = outcome.new_balance, "Refilled free credits");
        }
        Ok(outcome)
    }

    /// Whether `action` would be allowed now.
    ///
    /// Lazy plan expiry and the daily counter rollover are persisted; nothing
    /// else is touched.
    pub async fn evaluate_access(&self, user_id: UserId, action: Action) -> Result<AccessDecision> {
        self.mutate(user_id, |record, now| {
            settle(record, now);
            Ok(evaluate(record, action))
        })
        .await
    }

    /// Check and, if allowed, charge for `action` in one step
    pub async fn consume(&self, user_id: UserId, action: Action) -> Result<ConsumeOutcome> {
        // Outer Ok persists the settle step even when the action is denied
        let outcome = self
            .mutate(user_id, |record, now| {
                settle(record, now);
                if let AccessDecision::Deny(reason) = evaluate(record, action) {
                    return Ok(Err(reason));
                }

                if !record.has_unlimited_credits() {
                    record.credits -= action.credit_cost();
                }
                match action {
                    Action::Watch => record.usage.units_today = record.usage.units_today.saturating_add(1),
                    Action::Download => {
                        record.usage.downloads_today = record.usage.downloads_today.saturating_add(1)
                    }
                }
                record.last_active_at = now;
                Ok(Ok(ConsumeOutcome {
                    new_balance: record.credits,
                    units_today: record.usage.units_today,
                    downloads_today: record.usage.downloads_today,
                }))
            })
            .await?;
        Ok(outcome?)
    }

    /// Expire lapsed plans and refill Free users across the whole store.
    ///
    /// A failure for one user is logged and counted; the sweep continues.
    pub async fn run_expiry_sweep_once(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let rules = &self.rules;

        for user_id in self.store.list_user_ids()? {
            report.users_scanned += 1;
            let result = self
                .mutate(user_id, |record, now| {
                    let expired = expire_if_due(record, now);
                    let refilled = refill_if_due(record, now, rules);
                    Ok((expired, refilled))
                })
                .await;

            match result {
                Ok((expired, refilled)) => {
                    report.users_expired += u64::from(expired);
                    report.users_refilled += u64::from(refilled);
                }
                Err(e) => {
                    report.failures += 1;
                    warn!(user_id, error = %e, "Sweep failed for user");
                }
            }
        }

        self.prune_locks();
        info!(
            scanned = report.users_scanned,
            expired = report.users_expired,
            refilled = report.users_refilled,
            failures = report.failures,
            "Expiry sweep finished"
        );
        Ok(report)
    }
}
