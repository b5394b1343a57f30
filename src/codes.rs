//! Global redeem code registry
//!
//! One entry per code in the `codes` tree, keyed by the normalized code.
//! `used_by` moves from unset to set exactly once; the claim is a
//! compare-and-swap against the bytes read, so of two racing claimants only
//! the first write lands.

use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{LedgerError, Rejection, StorageError};
use crate::plans::PlanName;
use crate::record::UserId;
use crate::replication::{MirrorKey, Replicator};

/// Collisions tolerated before `generate` gives up
const GENERATE_ATTEMPTS: usize = 8;

/// Plan portion of a reward
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanGrant {
    pub plan: PlanName,
    /// Added on top of the current expiry (or now, if later)
    pub days: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reward {
    #[serde(default)]
    pub credits: u64,
    #[serde(default)]
    pub plan: Option<PlanGrant>,
}

impl Reward {
    pub fn credits(credits: u64) -> Self {
        Self { credits, plan: None }
    }

    pub fn with_plan(mut self, plan: PlanName, days: u32) -> Self {
        self.plan = Some(PlanGrant { plan, days });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.credits == 0 && self.plan.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeemCode {
    pub code: String,
    pub reward: Reward,
    #[serde(default)]
    pub used_by: Option<UserId>,
    #[serde(default)]
    pub used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
}

impl RedeemCode {
    pub fn is_used(&self) -> bool {
        self.used_by.is_some()
    }
}

/// Trim and uppercase
pub fn normalize_code(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// Exactly `length` characters from `[A-Z0-9]`
pub fn is_valid_format(code: &str, length: usize) -> bool {
    code.len() == length
        && code
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}

fn random_code(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(|b| char::from(b).to_ascii_uppercase())
        .collect()
}

pub struct CodeRegistry {
    codes: sled::Tree,
    replicator: Replicator,
    flush_on_write: bool,
    code_length: usize,
}

impl CodeRegistry {
    pub fn new(codes: sled::Tree, replicator: Replicator, flush_on_write: bool, code_length: usize) -> Self {
        Self {
            codes,
            replicator,
            flush_on_write,
            code_length,
        }
    }

    /// Normalize and check format; `InvalidCode` if malformed
    pub fn parse(&self, raw: &str) -> Result<String, Rejection> {
        let code = normalize_code(raw);
        if is_valid_format(&code, self.code_length) {
            Ok(code)
        } else {
            Err(Rejection::InvalidCode)
        }
    }

    /// Register a new unused code.
    ///
    /// The reward must grant something, and never the Free plan: an `Extend`
    /// to Free would end the redeemer's paid plan.
    pub async fn add(&self, raw: &str, reward: Reward, now: DateTime<Utc>) -> Result<RedeemCode, LedgerError> {
        let code = self.parse(raw)?;
        if reward.is_empty() {
            return Err(Rejection::InvalidReward("reward grants nothing".to_string()).into());
        }
        if matches!(&reward.plan, Some(grant) if grant.plan == PlanName::Free) {
            return Err(Rejection::InvalidReward("codes cannot grant the Free plan".to_string()).into());
        }
        let entry = RedeemCode {
            code: code.clone(),
            reward,
            used_by: None,
            used_at: None,
            created_at: now,
        };

        if !self.insert_if_absent(&entry).await? {
            return Err(Rejection::CodeExists.into());
        }
        info!(code = %code, credits = entry.reward.credits, "Added redeem code");
        Ok(entry)
    }

    /// Register a code with a random name
    pub async fn generate(&self, reward: Reward, now: DateTime<Utc>) -> Result<RedeemCode, LedgerError> {
        for _ in 0..GENERATE_ATTEMPTS {
            let code = random_code(self.code_length);
            match self.add(&code, reward.clone(), now).await {
                Err(LedgerError::Rejected(Rejection::CodeExists)) => {
                    debug!(code = %code, "Generated code collided, retrying");
                }
                other => return other,
            }
        }
        Err(StorageError::Internal(format!(
            "could not generate a unique code in {} attempts",
            GENERATE_ATTEMPTS
        ))
        .into())
    }

    pub fn get(&self, code: &str) -> Result<Option<RedeemCode>, StorageError> {
        match self.codes.get(code.as_bytes())? {
            Some(raw) => Ok(Some(decode(code, &raw)?)),
            None => Ok(None),
        }
    }

    /// Every registered code, in code order
    pub fn list(&self) -> Result<Vec<RedeemCode>, StorageError> {
        let mut entries = Vec::new();
        for item in self.codes.iter() {
            let (key, raw) = item?;
            let code = String::from_utf8_lossy(&key).to_string();
            match decode(&code, &raw) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(code = %code, error = %e, "Skipping unreadable code entry"),
            }
        }
        Ok(entries)
    }

    /// Set `used_by` if still unset.
    ///
    /// Callers hold the code lock, so a failed swap only happens when the
    /// entry was rewritten outside the ledger; the loop re-reads and decides
    /// again.
    pub async fn claim(&self, code: &str, user_id: UserId, now: DateTime<Utc>) -> Result<RedeemCode, LedgerError> {
        loop {
            let Some(raw) = self.codes.get(code.as_bytes())? else {
                return Err(Rejection::InvalidCode.into());
            };
            let mut entry = decode(code, &raw)?;
            match entry.used_by {
                Some(owner) if owner == user_id => return Err(Rejection::AlreadyUsedByThisUser.into()),
                Some(_) => return Err(Rejection::AlreadyUsedGlobally.into()),
                None => {}
            }

            entry.used_by = Some(user_id);
            entry.used_at = Some(now);
            let bytes = serde_json::to_vec(&entry)?;
            if self
                .codes
                .compare_and_swap(code.as_bytes(), Some(raw), Some(bytes.clone()))?
                .is_ok()
            {
                self.committed(code, bytes).await?;
                return Ok(entry);
            }
            debug!(code = %code, "Code entry changed during claim, re-reading");
        }
    }

    /// Undo a claim made by `user_id`. Returns true if released.
    pub async fn release(&self, code: &str, user_id: UserId) -> Result<bool, StorageError> {
        let Some(raw) = self.codes.get(code.as_bytes())? else {
            return Ok(false);
        };
        let mut entry = decode(code, &raw)?;
        if entry.used_by != Some(user_id) {
            return Ok(false);
        }

        entry.used_by = None;
        entry.used_at = None;
        let bytes = serde_json::to_vec(&entry)?;
        let released = self
            .codes
            .compare_and_swap(code.as_bytes(), Some(raw), Some(bytes.clone()))?
            .is_ok();
        if released {
            self.committed(code, bytes).await?;
            warn!(code = %code, user_id, "Released code claim");
        }
        Ok(released)
    }

    /// Store `entry` unless its code already exists. Returns true if stored.
    pub async fn insert_if_absent(&self, entry: &RedeemCode) -> Result<bool, StorageError> {
        let bytes = serde_json::to_vec(entry)?;
        let stored = self
            .codes
            .compare_and_swap(entry.code.as_bytes(), None as Option<&[u8]>, Some(bytes.clone()))?
            .is_ok();
        if stored {
            self.committed(&entry.code, bytes).await?;
        }
        Ok(stored)
    }

    async fn committed(&self, code: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        if self.flush_on_write {
            self.codes.flush_async().await?;
        }
        self.replicator.enqueue(MirrorKey::Code(code.to_string()), bytes);
        Ok(())
    }
}

fn decode(code: &str, raw: &[u8]) -> Result<RedeemCode, StorageError> {
    serde_json::from_slice(raw).map_err(|e| StorageError::Corrupt {
        key: format!("codes/{}", code),
        reason: e.to_string(),
    })
}
