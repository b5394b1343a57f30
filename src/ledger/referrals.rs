//! Referral graph
//!
//! Each (inviter, invitee) edge moves `none -> pending -> completed`. The
//! invitee's `invited_by` is the source of truth for who invited them; the
//! inviter's `pending`/`completed` sets are the inviter-side view.
//!
//! Each step takes one user lock at a time, never two.

use serde::Serialize;
use tracing::{debug, info};

use super::Ledger;
use crate::error::{LedgerError, Rejection, Result};
use crate::record::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReferralIntent {
    /// False if the invitee already had an inviter
    pub recorded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferralCompletion {
    pub inviter: UserId,
    pub invitee: UserId,
    pub reward: u64,
    pub inviter_balance: u64,
    pub success_count: u64,
    /// Badges first granted by this completion
    pub new_badges: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SponsorVerification {
    /// True only on the false -> true transition
    pub newly_verified: bool,
    pub referral: Option<ReferralCompletion>,
}

impl Ledger {
    /// Record that `invitee` arrived through `inviter`'s link.
    ///
    /// First claim wins: an invitee who already has an inviter is left alone.
    pub async fn record_referral_intent(&self, inviter: UserId, invitee: UserId) -> Result<ReferralIntent> {
        if inviter == invitee {
            return Err(Rejection::SelfReferral.into());
        }

        let recorded = self
            .mutate(invitee, |record, _| {
                if record.referrals.invited_by.is_some() {
                    return Ok(false);
                }
                record.referrals.invited_by = Some(inviter);
                Ok(true)
            })
            .await?;

        if !recorded {
            debug!(inviter, invitee, "Invitee already has an inviter, ignoring");
            return Ok(ReferralIntent { recorded });
        }

        self.mutate(inviter, |record, _| {
            if !record.referrals.completed.contains(&invitee) && record.referrals.pending.insert(invitee) {
                record.referrals.total_count += 1;
            }
            Ok(())
        })
        .await?;

        info!(inviter, invitee, "Referral pending");
        Ok(ReferralIntent { recorded })
    }

    /// Complete the invitee's pending referral and pay the inviter
    pub async fn complete_referral(&self, invitee: UserId) -> Result<ReferralCompletion> {
        let inviter = self
            .mutate(invitee, |record, _| Ok(record.referrals.invited_by))
            .await?
            .ok_or(Rejection::NoPendingReferral)?;

        let reward = self.rules.referral_reward;
        let milestones = &self.rules.badge_milestones;

        let completion = self
            .mutate(inviter, |record, _| {
                let referrals = &mut record.referrals;
                if referrals.completed.contains(&invitee) {
                    return Err(Rejection::ReferralAlreadyCompleted);
                }

                // Repairs an edge whose pending write never landed
                if !referrals.pending.remove(&invitee) {
                    referrals.total_count += 1;
                }
                referrals.completed.insert(invitee);
                referrals.recount();
                let success_count = referrals.success_count;

                record.credits = record.credits.saturating_add(reward);

                let mut new_badges = Vec::new();
                for milestone in milestones.iter().filter(|m| success_count >= m.completed) {
                    if record.badges.insert(milestone.badge.clone()) {
                        new_badges.push(milestone.badge.clone());
                    }
                }

                Ok(ReferralCompletion {
                    inviter,
                    invitee,
                    reward,
                    inviter_balance: record.credits,
                    success_count,
                    new_badges,
                })
            })
            .await?;

        info!(
            inviter,
            invitee,
            reward,
            success_count = completion.success_count,
            new_badges = ?completion.new_badges,
            "Referral completed"
        );
        Ok(completion)
    }

    /// Mark the user's sponsor membership as verified and settle their
    /// referral.
    ///
    /// Verification is one-way. The referral step runs on every call so a
    /// completion interrupted by a storage failure is finished on retry.
    pub async fn verify_sponsor(&self, user_id: UserId) -> Result<SponsorVerification> {
        let newly_verified = self
            .mutate(user_id, |record, _| {
                let newly = !record.sponsor_verified;
                record.sponsor_verified = true;
                Ok(newly)
            })
            .await?;

        if newly_verified {
            info!(user_id, "Sponsor verified");
        }

        let referral = match self.complete_referral(user_id).await {
            Ok(completion) => Some(completion),
            Err(LedgerError::Rejected(Rejection::NoPendingReferral))
            | Err(LedgerError::Rejected(Rejection::ReferralAlreadyCompleted)) => None,
            Err(e) => return Err(e),
        };

        Ok(SponsorVerification {
            newly_verified,
            referral,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::ledger;
    use super::*;
    use std::collections::BTreeSet;

    #[tokio::test]
    async fn test_self_referral_rejected_at_creation() {
        let (ledger, _clock) = ledger();
        let err = ledger.record_referral_intent(3, 3).await.unwrap_err();
        assert_eq!(err.code(), "self_referral");
        assert_eq!(ledger.user_count(), 0);
    }

    #[tokio::test]
    async fn test_first_inviter_wins() {
        let (ledger, _clock) = ledger();
        assert!(ledger.record_referral_intent(1, 2).await.unwrap().recorded);
        assert!(!ledger.record_referral_intent(9, 2).await.unwrap().recorded);

        assert_eq!(ledger.get_profile(2).await.unwrap().referrals.invited_by, Some(1));
        assert!(ledger.get_profile(9).await.unwrap().referrals.pending.is_empty());
    }

    #[tokio::test]
    async fn test_complete_referral_once() {
        let (ledger, _clock) = ledger();
        ledger.record_referral_intent(1, 2).await.unwrap();

        let completion = ledger.complete_referral(2).await.unwrap();
        assert_eq!(completion.inviter, 1);
        assert_eq!(completion.inviter_balance, 2);
        assert_eq!(completion.new_badges, vec!["Referrer Lv1".to_string()]);

        let err = ledger.complete_referral(2).await.unwrap_err();
        assert_eq!(err.code(), "referral_already_completed");

        let inviter = ledger.get_profile(1).await.unwrap();
        assert!(inviter.referrals.pending.is_empty());
        assert_eq!(inviter.referrals.completed, BTreeSet::from([2]));
        assert_eq!(inviter.referrals.success_count, 1);
        assert_eq!(inviter.credits, 2);
    }

    #[tokio::test]
    async fn test_complete_without_inviter() {
        let (ledger, _clock) = ledger();
        let err = ledger.complete_referral(5).await.unwrap_err();
        assert_eq!(err.code(), "no_pending_referral");
    }

    #[tokio::test]
    async fn test_badges_granted_once_per_milestone() {
        let (ledger, _clock) = ledger();
        for invitee in 10..15 {
            ledger.record_referral_intent(1, invitee).await.unwrap();
            ledger.complete_referral(invitee).await.unwrap();
        }

        let inviter = ledger.get_profile(1).await.unwrap();
        assert_eq!(inviter.referrals.success_count, 5);
        assert_eq!(
            inviter.badges,
            BTreeSet::from(["Referrer Lv1".to_string(), "Referrer Lv2".to_string()])
        );
        assert_eq!(inviter.credits, 10);
    }

    #[tokio::test]
    async fn test_migrated_success_count_carries_into_milestones() {
        let (ledger, _clock) = ledger();
        let legacy = serde_json::json!({
            "plan": "Free",
            "referrals": [],
            "successful_referrals": 4,
            "badges": ["Referrer Lv1"]
        });
        ledger
            .db
            .users_tree()
            .unwrap()
            .insert(crate::record::user_key(1), serde_json::to_vec(&legacy).unwrap())
            .unwrap();

        ledger.record_referral_intent(1, 2).await.unwrap();
        let completion = ledger.complete_referral(2).await.unwrap();
        assert_eq!(completion.success_count, 5);
        assert_eq!(completion.new_badges, vec!["Referrer Lv2".to_string()]);
    }

    #[tokio::test]
    async fn test_verify_sponsor_completes_referral_once() {
        let (ledger, _clock) = ledger();
        ledger.record_referral_intent(1, 2).await.unwrap();

        let first = ledger.verify_sponsor(2).await.unwrap();
        assert!(first.newly_verified);
        assert_eq!(first.referral.map(|r| r.inviter), Some(1));

        let second = ledger.verify_sponsor(2).await.unwrap();
        assert!(!second.newly_verified);
        assert!(second.referral.is_none());
        assert_eq!(ledger.get_profile(1).await.unwrap().credits, 2);
    }
}
