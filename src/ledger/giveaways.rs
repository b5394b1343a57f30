//! Joining giveaways

use serde::Serialize;
use tracing::info;

use super::Ledger;
use crate::error::{Rejection, Result};
use crate::record::UserId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GiveawayJoined {
    pub giveaway_id: String,
    pub reward: u64,
    pub new_balance: u64,
}

impl Ledger {
    /// Join a running giveaway and credit its reward in the same save
    pub async fn join_giveaway(&self, user_id: UserId, giveaway_id: &str) -> Result<GiveawayJoined> {
        let giveaway = self
            .giveaways
            .get(giveaway_id)?
            .ok_or_else(|| Rejection::UnknownGiveaway(giveaway_id.to_string()))?;

        let new_balance = self
            .mutate(user_id, |record, now| {
                if record.giveaways_joined.contains(&giveaway.id) {
                    return Err(Rejection::AlreadyJoined);
                }
                if giveaway.has_ended(now) {
                    return Err(Rejection::GiveawayEnded);
                }

                record.giveaways_joined.insert(giveaway.id.clone());
                record.credits = record.credits.saturating_add(giveaway.reward_credits);
                Ok(record.credits)
            })
            .await?;

        info!(user_id, giveaway_id = %giveaway.id, reward = giveaway.reward_credits, new_balance, "Joined giveaway");
        Ok(GiveawayJoined {
            giveaway_id: giveaway.id,
            reward: giveaway.reward_credits,
            new_balance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{ledger, start};
    use super::*;
    use crate::error::LedgerError;
    use crate::giveaways::Giveaway;
    use chrono::Duration;

    fn summer() -> Giveaway {
        Giveaway {
            id: "summer".to_string(),
            title: "Win 10 credits".to_string(),
            reward_credits: 10,
            ends_at: start() + Duration::days(1),
        }
    }

    #[tokio::test]
    async fn test_join_once() {
        let (ledger, _clock) = ledger();
        ledger.add_giveaway(summer()).await.unwrap();
        ledger.adjust_credits(1, 3, "grant").await.unwrap();

        let joined = ledger.join_giveaway(1, "summer").await.unwrap();
        assert_eq!(joined.reward, 10);
        assert_eq!(joined.new_balance, 13);

        let err = ledger.join_giveaway(1, "summer").await.unwrap_err();
        assert!(matches!(err, LedgerError::Rejected(Rejection::AlreadyJoined)));

        let profile = ledger.get_profile(1).await.unwrap();
        assert_eq!(profile.credits, 13);
        assert!(profile.giveaways_joined.contains("summer"));
    }

    #[tokio::test]
    async fn test_join_after_end_is_refused() {
        let (ledger, clock) = ledger();
        ledger.add_giveaway(summer()).await.unwrap();

        clock.advance(Duration::days(1));
        assert_eq!(ledger.join_giveaway(1, "summer").await.unwrap().new_balance, 10);

        clock.advance(Duration::seconds(1));
        let err = ledger.join_giveaway(2, "summer").await.unwrap_err();
        assert!(matches!(err, LedgerError::Rejected(Rejection::GiveawayEnded)));
        assert_eq!(ledger.get_profile(2).await.unwrap().credits, 0);
    }

    #[tokio::test]
    async fn test_unknown_giveaway() {
        let (ledger, _clock) = ledger();
        let err = ledger.join_giveaway(1, "nope").await.unwrap_err();
        assert_eq!(err.code(), "unknown_giveaway");
        assert_eq!(ledger.user_count(), 0);
    }

    #[tokio::test]
    async fn test_migrated_join_is_not_repeated() {
        let (ledger, _clock) = ledger();
        ledger.add_giveaway(summer()).await.unwrap();

        let legacy = serde_json::json!({
            "user_id": 4,
            "credits": 10,
            "plan": {"name": "Free", "expires_at": null},
            "giveaways_joined": ["summer"]
        });
        ledger
            .db
            .users_tree()
            .unwrap()
            .insert(crate::record::user_key(4), serde_json::to_vec(&legacy).unwrap())
            .unwrap();

        let err = ledger.join_giveaway(4, "summer").await.unwrap_err();
        assert!(matches!(err, LedgerError::Rejected(Rejection::AlreadyJoined)));
        assert_eq!(ledger.get_profile(4).await.unwrap().credits, 10);
    }
}
