//! Ledger API
//!
//! The only component that mutates a user's financial and entitlement state.
//! Every mutation follows one protocol:
//!
//! ```text
//! lock(user) -> load -> validate -> mutate copy -> save (if changed) -> unlock
//! ```
//!
//! A rejection leaves the stored record untouched. Unrelated users never
//! contend. Redemption additionally takes a per-code lock, always before the
//! user lock.

pub mod entitlements;
pub mod giveaways;
pub mod redeem;
pub mod referrals;
pub mod tasks;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::codes::{CodeRegistry, RedeemCode, Reward};
use crate::config::{Config, LedgerRules};
use crate::error::{Rejection, Result, StorageError};
use crate::giveaways::{Giveaway, GiveawayCatalog};
use crate::locks::KeyedLocks;
use crate::record::{self, UserId, UserRecord};
use crate::replication::{MirrorKey, MirrorSink, Replicator};
use crate::store::{LedgerDb, UserStore};
use crate::tasks::{Task, TaskCatalog};

pub use entitlements::{
    AccessDecision, ConsumeOutcome, CreditChange, ExpiryOutcome, PlanChange, PlanMode, PlanRequest,
    RefillOutcome, SweepReport,
};
pub use giveaways::GiveawayJoined;
pub use redeem::RedemptionOutcome;
pub use referrals::{ReferralCompletion, ReferralIntent, SponsorVerification};
pub use tasks::{TaskCompleted, TaskOpened};

/// Result of [`Ledger::register_if_absent`]
#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    /// False if the user already existed
    pub created: bool,
    pub record: UserRecord,
}

/// Result of [`Ledger::restore_from_mirror`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub restored: u64,
    /// Already present in the primary store
    pub skipped: u64,
    pub failed: u64,
}

pub struct Ledger {
    db: LedgerDb,
    store: UserStore,
    codes: CodeRegistry,
    tasks: TaskCatalog,
    giveaways: GiveawayCatalog,
    user_locks: KeyedLocks<UserId>,
    code_locks: KeyedLocks<String>,
    clock: Arc<dyn Clock>,
    rules: LedgerRules,
}

impl Ledger {
    /// Build a ledger over an open database
    pub fn new(
        db: LedgerDb,
        config: &Config,
        replicator: Replicator,
        clock: Arc<dyn Clock>,
    ) -> std::result::Result<Self, StorageError> {
        config.validate().map_err(StorageError::Config)?;

        let store = UserStore::new(db.users_tree()?, replicator.clone(), config.flush_on_write);
        let codes = CodeRegistry::new(
            db.codes_tree()?,
            replicator,
            config.flush_on_write,
            config.rules.code_length,
        );
        let tasks = TaskCatalog::new(db.tasks_tree()?);
        let giveaways = GiveawayCatalog::new(db.giveaways_tree()?);

        Ok(Self {
            db,
            store,
            codes,
            tasks,
            giveaways,
            user_locks: KeyedLocks::new(),
            code_locks: KeyedLocks::new(),
            clock,
            rules: config.rules.clone(),
        })
    }

    /// Open the database under `config.data_dir`
    pub async fn open(
        config: &Config,
        replicator: Replicator,
        clock: Arc<dyn Clock>,
    ) -> std::result::Result<Self, StorageError> {
        let db = LedgerDb::open(config.db_path()).await?;
        Self::new(db, config, replicator, clock)
    }

    pub fn rules(&self) -> &LedgerRules {
        &self.rules
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Run `f` on a copy of the user's record under the user's lock.
    ///
    /// The copy is saved only if `f` succeeds and changed it.
    pub(crate) async fn mutate<T, F>(&self, user_id: UserId, f: F) -> Result<T>
    where
        F: FnOnce(&mut UserRecord, DateTime<Utc>) -> std::result::Result<T, Rejection>,
    {
        let _guard = self.user_locks.lock(&user_id).await;
        let now = self.clock.now();
        let current = self.store.load(user_id, now).await?;

        let mut next = current.clone();
        let outcome = f(&mut next, now)?;

        if next != current {
            self.store.save(&next).await?;
        } else {
            debug!(user_id, "No change, skipping save");
        }
        Ok(outcome)
    }

    /// Snapshot of the user's record (created on first contact).
    ///
    /// Lazy plan expiry and the day rollover are applied and persisted first,
    /// the same as for an access check.
    pub async fn get_profile(&self, user_id: UserId) -> Result<UserRecord> {
        self.mutate(user_id, |record, now| {
            entitlements::settle(record, now);
            Ok(record.clone())
        })
        .await
    }

    /// Create the user's record if needed; refresh the display name when a
    /// non-empty one is given
    pub async fn register_if_absent(&self, user_id: UserId, display_name: &str) -> Result<Registration> {
        let display_name = display_name.trim().to_string();
        let _guard = self.user_locks.lock(&user_id).await;
        let now = self.clock.now();

        let created = !self.store.contains(user_id)?;
        let current = self.store.load(user_id, now).await?;

        let mut next = current.clone();
        if !display_name.is_empty() {
            next.display_name = display_name;
        }
        next.last_active_at = now;
        if next != current {
            self.store.save(&next).await?;
        }

        if created {
            info!(user_id, "Registered user");
        }
        Ok(Registration { created, record: next })
    }

    /// Bump `last_active_at`
    pub async fn touch(&self, user_id: UserId) -> Result<()> {
        self.mutate(user_id, |record, now| {
            record.last_active_at = now;
            Ok(())
        })
        .await
    }

    /// Remember a transport message showing this user's menu
    pub async fn add_active_message(&self, user_id: UserId, message_id: i64) -> Result<()> {
        self.mutate(user_id, |record, _| {
            record.active_messages.insert(message_id);
            Ok(())
        })
        .await
    }

    /// Forget and return every tracked message id
    pub async fn clear_active_messages(&self, user_id: UserId) -> Result<Vec<i64>> {
        self.mutate(user_id, |record, _| {
            Ok(std::mem::take(&mut record.active_messages).into_iter().collect())
        })
        .await
    }

    pub async fn add_code(&self, code: &str, reward: Reward) -> Result<RedeemCode> {
        self.codes.add(code, reward, self.clock.now()).await
    }

    pub async fn generate_code(&self, reward: Reward) -> Result<RedeemCode> {
        self.codes.generate(reward, self.clock.now()).await
    }

    pub fn get_code(&self, code: &str) -> Result<Option<RedeemCode>> {
        Ok(self.codes.get(&crate::codes::normalize_code(code))?)
    }

    pub fn list_codes(&self) -> Result<Vec<RedeemCode>> {
        Ok(self.codes.list()?)
    }

    pub async fn add_task(&self, task: Task) -> Result<Task> {
        self.tasks.add(task).await
    }

    pub async fn remove_task(&self, task_id: &str) -> Result<Option<Task>> {
        Ok(self.tasks.remove(task_id).await?)
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        Ok(self.tasks.get(task_id)?)
    }

    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.tasks.list()?)
    }

    pub async fn add_giveaway(&self, giveaway: Giveaway) -> Result<Giveaway> {
        self.giveaways.add(giveaway).await
    }

    pub async fn remove_giveaway(&self, giveaway_id: &str) -> Result<Option<Giveaway>> {
        Ok(self.giveaways.remove(giveaway_id).await?)
    }

    pub fn get_giveaway(&self, giveaway_id: &str) -> Result<Option<Giveaway>> {
        Ok(self.giveaways.get(giveaway_id)?)
    }

    pub fn list_giveaways(&self) -> Result<Vec<Giveaway>> {
        Ok(self.giveaways.list()?)
    }

    pub fn user_count(&self) -> usize {
        self.store.count()
    }

    /// Copy mirrored users and codes into the primary store.
    ///
    /// Only keys absent from the primary store are filled; existing records
    /// always win.
    pub async fn restore_from_mirror(&self, mirror: &dyn MirrorSink) -> Result<RestoreReport> {
        let mut report = RestoreReport::default();
        let now = self.clock.now();

        for key in mirror.list().await? {
            match self.restore_one(mirror, &key, now).await {
                Ok(true) => report.restored += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(key = %key, error = %e, "Failed to restore mirrored entry");
                }
            }
        }

        info!(
            restored = report.restored,
            skipped = report.skipped,
            failed = report.failed,
            "Mirror restore finished"
        );
        Ok(report)
    }

    async fn restore_one(
        &self,
        mirror: &dyn MirrorSink,
        key: &MirrorKey,
        now: DateTime<Utc>,
    ) -> std::result::Result<bool, StorageError> {
        let Some(bytes) = mirror.get(key).await? else {
            return Err(StorageError::Internal(format!("{} listed but missing", key)));
        };

        match key {
            MirrorKey::User(id) => {
                if self.store.contains(*id)? {
                    return Ok(false);
                }
                let value: serde_json::Value = serde_json::from_slice(&bytes)?;
                let (record, _) = record::upcast(*id, value, now)?;
                self.store.insert_if_absent(&record).await
            }
            MirrorKey::Code(code) => {
                let mut entry: RedeemCode = serde_json::from_slice(&bytes)?;
                entry.code = self.codes.parse(code).map_err(|_| StorageError::Corrupt {
                    key: key.to_string(),
                    reason: "malformed code".to_string(),
                })?;
                self.codes.insert_if_absent(&entry).await
            }
        }
    }

    /// Drop lock entries nobody holds
    pub fn prune_locks(&self) -> usize {
        self.user_locks.prune_idle() + self.code_locks.prune_idle()
    }

    pub async fn flush(&self) -> Result<()> {
        Ok(self.db.flush().await?)
    }
}

/// Retry `op` while it fails with a transient storage error, at most
/// `attempts` times in total, doubling `backoff` between tries.
pub async fn retry_transient<T, F, Fut>(attempts: u32, backoff: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut delay = backoff;
    let mut tried = 0;

    loop {
        tried += 1;
        match op().await {
            Err(e) if e.is_retryable() && tried < attempts => {
                warn!(attempt = tried, error = %e, "Transient storage failure, retrying");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
            other => return other,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    pub fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    pub fn ledger() -> (Ledger, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let config = Config {
            flush_on_write: false,
            ..Config::default()
        };
        let ledger = Ledger::new(LedgerDb::temporary().unwrap(), &config, Replicator::disabled(), clock.clone())
            .unwrap();
        (ledger, clock)
    }
}
