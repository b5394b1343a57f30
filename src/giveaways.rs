//! Giveaway catalog
//!
//! Admin-managed, time-limited one-time credit grants. Each user may join a
//! giveaway once, before it ends; the join is recorded on the user's record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{LedgerError, Rejection, StorageError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Giveaway {
    pub id: String,
    pub title: String,
    pub reward_credits: u64,
    /// Joining is refused after this instant
    pub ends_at: DateTime<Utc>,
}

impl Giveaway {
    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        now > self.ends_at
    }
}

pub struct GiveawayCatalog {
    giveaways: sled::Tree,
}

impl GiveawayCatalog {
    pub fn new(giveaways: sled::Tree) -> Self {
        Self { giveaways }
    }

    /// Add a giveaway; `GiveawayExists` if the id is taken
    pub async fn add(&self, giveaway: Giveaway) -> Result<Giveaway, LedgerError> {
        let id = giveaway.id.trim().to_string();
        if id.is_empty() {
            return Err(Rejection::UnknownGiveaway(giveaway.id).into());
        }
        if giveaway.reward_credits == 0 {
            return Err(Rejection::InvalidReward("reward grants nothing".to_string()).into());
        }
        let giveaway = Giveaway { id, ..giveaway };

        let bytes = serde_json::to_vec(&giveaway)?;
        let inserted = self
            .giveaways
            .compare_and_swap(giveaway.id.as_bytes(), None as Option<&[u8]>, Some(bytes))?
            .is_ok();
        if !inserted {
            return Err(Rejection::GiveawayExists(giveaway.id).into());
        }
        self.giveaways.flush_async().await?;

        info!(
            giveaway_id = %giveaway.id,
            reward = giveaway.reward_credits,
            ends_at = %giveaway.ends_at,
            "Added giveaway"
        );
        Ok(giveaway)
    }

    /// Remove a giveaway. Users who joined keep their credits and join mark.
    pub async fn remove(&self, id: &str) -> Result<Option<Giveaway>, StorageError> {
        let Some(raw) = self.giveaways.remove(id.as_bytes())? else {
            return Ok(None);
        };
        self.giveaways.flush_async().await?;
        info!(giveaway_id = %id, "Removed giveaway");
        decode(id, &raw).map(Some)
    }

    pub fn get(&self, id: &str) -> Result<Option<Giveaway>, StorageError> {
        match self.giveaways.get(id.as_bytes())? {
            Some(raw) => decode(id, &raw).map(Some),
            None => Ok(None),
        }
    }

    /// Every giveaway, in id order, ended ones included
    pub fn list(&self) -> Result<Vec<Giveaway>, StorageError> {
        let mut giveaways = Vec::new();
        for item in self.giveaways.iter() {
            let (key, raw) = item?;
            let id = String::from_utf8_lossy(&key).to_string();
            match decode(&id, &raw) {
                Ok(giveaway) => giveaways.push(giveaway),
                Err(e) => warn!(giveaway_id = %id, error = %e, "Skipping unreadable giveaway"),
            }
        }
        Ok(giveaways)
    }
}

fn decode(id: &str, raw: &[u8]) -> Result<Giveaway, StorageError> {
    serde_json::from_slice(raw).map_err(|e| StorageError::Corrupt {
        key: format!("giveaways/{}", id),
        reason: e.to_string(),
    })
}
