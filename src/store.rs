//! User record store
//!
//! Records live in the `users` tree of a sled database, keyed by big-endian
//! user id, valued as JSON so older shapes can be upcast on read.
//!
//! A save replaces the whole record in one `insert`, so readers observe either
//! the old or the new record and never a mix. Committed saves are handed to
//! the [`Replicator`] afterwards.

use chrono::{DateTime, Utc};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::record::{self, user_id_from_key, user_key, UserId, UserRecord};
use crate::replication::{MirrorKey, Replicator};

const USERS_TREE: &str = "users";
const CODES_TREE: &str = "codes";
const TASKS_TREE: &str = "tasks";
const GIVEAWAYS_TREE: &str = "giveaways";

/// The embedded database holding every durable tree
#[derive(Clone)]
pub struct LedgerDb {
    db: sled::Db,
}

impl LedgerDb {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let db = sled::Config::new().path(path).open()?;
        info!(path = %path.display(), "Ledger database opened");
        Ok(Self { db })
    }

    /// In-memory database removed on drop
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    pub fn users_tree(&self) -> Result<sled::Tree, StorageError> {
        Ok(self.db.open_tree(USERS_TREE)?)
    }

    pub fn codes_tree(&self) -> Result<sled::Tree, StorageError> {
        Ok(self.db.open_tree(CODES_TREE)?)
    }

    pub fn tasks_tree(&self) -> Result<sled::Tree, StorageError> {
        Ok(self.db.open_tree(TASKS_TREE)?)
    }

    pub fn giveaways_tree(&self) -> Result<sled::Tree, StorageError> {
        Ok(self.db.open_tree(GIVEAWAYS_TREE)?)
    }

    pub async fn flush(&self) -> Result<(), StorageError> {
        self.db.flush_async().await?;
        Ok(())
    }
}

pub struct UserStore {
    users: sled::Tree,
    replicator: Replicator,
    flush_on_write: bool,
}

impl UserStore {
    pub fn new(users: sled::Tree, replicator: Replicator, flush_on_write: bool) -> Self {
        Self {
            users,
            replicator,
            flush_on_write,
        }
    }

    /// Load a record, creating the default Free record on first contact.
    ///
    /// Legacy shapes are upcast and written back, unless a concurrent writer
    /// replaced the stored bytes in the meantime.
    pub async fn load(&self, id: UserId, now: DateTime<Utc>) -> Result<UserRecord, StorageError> {
        let key = user_key(id);

        let raw = match self.users.get(key)? {
            Some(raw) => raw,
            None => {
                let record = UserRecord::new(id, String::new(), now);
                let bytes = serde_json::to_vec(&record)?;
                match self.users.compare_and_swap(key, None as Option<&[u8]>, Some(bytes.clone()))? {
                    Ok(()) => {
                        debug!(user_id = id, "Created default record");
                        self.committed(id, bytes).await?;
                        return Ok(record);
                    }
                    // Someone else created it first; use theirs
                    Err(cas) => match cas.current {
                        Some(current) => current,
                        None => {
                            return Err(StorageError::Internal(format!(
                                "users/{} vanished during creation",
                                id
                            )))
                        }
                    },
                }
            }
        };

        let value: serde_json::Value = serde_json::from_slice(&raw).map_err(|e| StorageError::Corrupt {
            key: format!("users/{}", id),
            reason: e.to_string(),
        })?;
        let (record, changed) = record::upcast(id, value, now)?;

        if changed {
            let bytes = serde_json::to_vec(&record)?;
            match self.users.compare_and_swap(key, Some(raw), Some(bytes.clone()))? {
                Ok(()) => {
                    info!(user_id = id, "Upcast stored record to current schema");
                    self.committed(id, bytes).await?;
                }
                Err(_) => debug!(user_id = id, "Record changed during upcast, skipping write-back"),
            }
        }

        Ok(record)
    }

    /// Atomically replace the whole record
    pub async fn save(&self, record: &UserRecord) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(record)?;
        self.users.insert(user_key(record.id), bytes.clone())?;
        self.committed(record.id, bytes).await
    }

    /// Store `record` only if no record exists for its id. Returns true if stored.
    pub async fn insert_if_absent(&self, record: &UserRecord) -> Result<bool, StorageError> {
        let bytes = serde_json::to_vec(record)?;
        let stored = self
            .users
            .compare_and_swap(user_key(record.id), None as Option<&[u8]>, Some(bytes.clone()))?
            .is_ok();
        if stored {
            self.committed(record.id, bytes).await?;
        }
        Ok(stored)
    }

    pub fn contains(&self, id: UserId) -> Result<bool, StorageError> {
        Ok(self.users.contains_key(user_key(id))?)
    }

    /// Every stored user id, ascending
    pub fn list_user_ids(&self) -> Result<Vec<UserId>, StorageError> {
        let mut ids = Vec::new();
        for key in self.users.iter().keys() {
            let key = key?;
            match user_id_from_key(&key) {
                Some(id) => ids.push(id),
                None => warn!(key = ?key, "Skipping malformed user key"),
            }
        }
        Ok(ids)
    }

    /// Number of stored users
    pub fn count(&self) -> usize {
        self.users.len()
    }

    async fn committed(&self, id: UserId, bytes: Vec<u8>) -> Result<(), StorageError> {
        if self.flush_on_write {
            self.users.flush_async().await?;
        }
        self.replicator.enqueue(MirrorKey::User(id), bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plans::PlanName;
    use crate::record::PlanState;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn store() -> (LedgerDb, UserStore) {
        let db = LedgerDb::temporary().unwrap();
        let store = UserStore::new(db.users_tree().unwrap(), Replicator::disabled(), false);
        (db, store)
    }

    #[tokio::test]
    async fn test_load_creates_default_record() {
        let (_db, store) = store();
        assert!(!store.contains(42).unwrap());

        let record = store.load(42, now()).await.unwrap();
        assert_eq!(record.id, 42);
        assert_eq!(record.credits, 0);
        assert_eq!(record.plan, PlanState::free());
        assert!(store.contains(42).unwrap());

        // Second load returns the stored record, not a fresh one
        let later = store.load(42, now() + Duration::hours(1)).await.unwrap();
        assert_eq!(later.created_at, now());
    }

    #[tokio::test]
    async fn test_save_replaces_whole_record() {
        let (_db, store) = store();
        let mut record = store.load(7, now()).await.unwrap();
        record.credits = 53;
        record.plan = PlanState {
            name: PlanName::Premium,
            expires_at: Some(now() + Duration::days(30)),
        };
        store.save(&record).await.unwrap();

        assert_eq!(store.load(7, now()).await.unwrap(), record);
        assert_eq!(store.list_user_ids().unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn test_legacy_record_is_upcast_and_written_back() {
        let (db, store) = store();
        let tree = db.users_tree().unwrap();
        let legacy = json!({"credits": 9, "plan": "Free", "referrals": [3]});
        tree.insert(user_key(5), serde_json::to_vec(&legacy).unwrap()).unwrap();

        let record = store.load(5, now()).await.unwrap();
        assert_eq!(record.credits, 9);
        assert_eq!(record.referrals.pending.len(), 1);

        let raw = tree.get(user_key(5)).unwrap().unwrap();
        let stored: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(stored["schema_version"], json!(record::SCHEMA_VERSION));
    }

    #[tokio::test]
    async fn test_unparseable_bytes_are_corrupt() {
        let (db, store) = store();
        db.users_tree().unwrap().insert(user_key(9), b"not json".to_vec()).unwrap();
        assert!(matches!(
            store.load(9, now()).await,
            Err(StorageError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn test_insert_if_absent_keeps_existing() {
        let (_db, store) = store();
        let mut existing = store.load(3, now()).await.unwrap();
        existing.credits = 10;
        store.save(&existing).await.unwrap();

        let mut incoming = UserRecord::new(3, "other", now());
        incoming.credits = 99;
        assert!(!store.insert_if_absent(&incoming).await.unwrap());
        assert_eq!(store.load(3, now()).await.unwrap().credits, 10);

        let fresh = UserRecord::new(4, "new", now());
        assert!(store.insert_if_absent(&fresh).await.unwrap());
        assert_eq!(store.load(4, now()).await.unwrap().display_name, "new");
        assert!(!store.contains(5).unwrap());
    }
}
