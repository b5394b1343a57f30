//! One-time code redemption
//!
//! Lock order is code, then user. Two users racing one code serialize on the
//! code lock; one user redeeming two codes serializes on the user lock.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use super::entitlements::{apply_plan, expire_if_due, PlanRequest};
use super::Ledger;
use crate::error::{Rejection, Result};
use crate::record::{PlanState, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedemptionOutcome {
    pub code: String,
    pub credits_granted: u64,
    pub new_balance: u64,
    /// Plan after the grant, if the code carried one
    pub plan: Option<PlanState>,
    pub redeemed_at: DateTime<Utc>,
}

impl Ledger {
    pub async fn redeem_code(&self, user_id: UserId, raw_code: &str) -> Result<RedemptionOutcome> {
        let code = self.codes.parse(raw_code)?;

        let _code_guard = self.code_locks.lock(&code).await;

        let entry = self.codes.get(&code)?.ok_or(Rejection::InvalidCode)?;
        match entry.used_by {
            Some(owner) if owner == user_id => return Err(Rejection::AlreadyUsedByThisUser.into()),
            Some(_) => return Err(Rejection::AlreadyUsedGlobally.into()),
            None => {}
        }

        let _user_guard = self.user_locks.lock(&user_id).await;
        let now = self.clock.now();
        let mut record = self.store.load(user_id, now).await?;
        if record.redeemed_codes.contains(&code) {
            return Err(Rejection::AlreadyUsedByThisUser.into());
        }

        // Build the new record first so a rejected grant leaves the code unused
        let reward = &entry.reward;
        expire_if_due(&mut record, now);
        record.credits = record.credits.saturating_add(reward.credits);
        let plan = match &reward.plan {
            Some(grant) => {
                apply_plan(&mut record, &PlanRequest::extend(grant.plan, grant.days), now)?;
                Some(record.plan.clone())
            }
            None => None,
        };
        record.redeemed_codes.insert(code.clone());

        self.codes.claim(&code, user_id, now).await?;

        if let Err(e) = self.store.save(&record).await {
            // Give the code back so a failed save does not burn it
            if let Err(release_err) = self.codes.release(&code, user_id).await {
                error!(code = %code, user_id, error = %release_err, "Failed to release code claim");
            }
            return Err(e.into());
        }

        info!(
            user_id,
            code = %code,
            credits = reward.credits,
            plan = ?plan.as_ref().map(|p| p.name),
            new_balance = record.credits,
            "Code redeemed"
        );
        Ok(RedemptionOutcome {
            code,
            credits_granted: reward.credits,
            new_balance: record.credits,
            plan,
            redeemed_at: now,
        })
    }
}
