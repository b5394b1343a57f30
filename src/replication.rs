//! Write-behind mirror
//!
//! Every committed save enqueues the full serialized record for a secondary
//! durable store. The queue is consumed by a single worker task; the save path
//! never waits for it. Failures are logged and counted, never surfaced.
//!
//! ## Mirror Layout ([`FsMirror`])
//!
//! ```text
//! mirror/
//! ├── users/
//! │   ├── 42.json
//! │   └── 1001.json
//! └── codes/
//!     └── AB12CD34EF56GH78.json
//! ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::record::UserId;

/// Largest batch the worker coalesces before writing
const MAX_BATCH: usize = 64;

/// Address of a mirrored object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MirrorKey {
    User(UserId),
    Code(String),
}

impl MirrorKey {
    fn relative_path(&self) -> PathBuf {
        match self {
            MirrorKey::User(id) => Path::new("users").join(format!("{}.json", id)),
            MirrorKey::Code(code) => Path::new("codes").join(format!("{}.json", code)),
        }
    }
}

impl std::fmt::Display for MirrorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MirrorKey::User(id) => write!(f, "users/{}", id),
            MirrorKey::Code(code) => write!(f, "codes/{}", code),
        }
    }
}

/// Result of a mirror write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Written,
    /// Mirror already held identical bytes
    Unchanged,
}

/// Secondary durable store
#[async_trait]
pub trait MirrorSink: Send + Sync {
    async fn put(&self, key: &MirrorKey, bytes: &[u8]) -> Result<PutOutcome, StorageError>;

    async fn get(&self, key: &MirrorKey) -> Result<Option<Vec<u8>>, StorageError>;

    async fn list(&self) -> Result<Vec<MirrorKey>, StorageError>;
}

/// Directory-backed mirror with atomic file replacement
pub struct FsMirror {
    root: PathBuf,
}

impl FsMirror {
    pub async fn new<P: AsRef<Path>>(root: P) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("users")).await?;
        fs::create_dir_all(root.join("codes")).await?;
        info!(path = %root.display(), "Initialized mirror");
        Ok(Self { root })
    }

    fn path_for(&self, key: &MirrorKey) -> PathBuf {
        self.root.join(key.relative_path())
    }
}

#[async_trait]
impl MirrorSink for FsMirror {
    async fn put(&self, key: &MirrorKey, bytes: &[u8]) -> Result<PutOutcome, StorageError> {
        let path = self.path_for(key);

        if let Ok(existing) = fs::read(&path).await {
            if existing == bytes {
                return Ok(PutOutcome::Unchanged);
            }
        }

        // Write-then-rename so readers never see a torn file
        let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4()));
        fs::write(&tmp, bytes).await?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            fs::remove_file(&tmp).await.ok();
            return Err(e.into());
        }
        Ok(PutOutcome::Written)
    }

    async fn get(&self, key: &MirrorKey) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<MirrorKey>, StorageError> {
        let mut keys = Vec::new();

        for (dir, is_user) in [("users", true), ("codes", false)] {
            let mut entries = match fs::read_dir(self.root.join(dir)).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                let Some(stem) = name.strip_suffix(".json") else {
                    continue;
                };
                if is_user {
                    if let Ok(id) = stem.parse::<UserId>() {
                        keys.push(MirrorKey::User(id));
                    }
                } else {
                    keys.push(MirrorKey::Code(stem.to_string()));
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

enum ReplicationJob {
    Put { key: MirrorKey, bytes: Vec<u8> },
    Barrier(oneshot::Sender<()>),
}

/// Counters exposed for health checks
#[derive(Debug, Default)]
struct ReplicationStats {
    enqueued: AtomicU64,
    written: AtomicU64,
    unchanged: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time copy of the replication counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicationSnapshot {
    pub enqueued: u64,
    pub written: u64,
    pub unchanged: u64,
    pub failed: u64,
    pub dropped: u64,
}

/// Handle used by stores to schedule mirror writes
#[derive(Clone)]
pub struct Replicator {
    tx: Option<mpsc::Sender<ReplicationJob>>,
    stats: Arc<ReplicationStats>,
}

impl Replicator {
    /// A replicator that discards everything (no mirror configured)
    pub fn disabled() -> Self {
        Self {
            tx: None,
            stats: Arc::new(ReplicationStats::default()),
        }
    }

    /// Start the worker. It exits once every handle clone is dropped and the
    /// queue is drained.
    pub fn spawn(sink: Arc<dyn MirrorSink>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let stats = Arc::new(ReplicationStats::default());
        let worker_stats = stats.clone();

        let handle = tokio::spawn(async move {
            run_worker(rx, sink, worker_stats).await;
        });

        (Self { tx: Some(tx), stats }, handle)
    }

    /// Fire-and-forget; never blocks the caller
    pub fn enqueue(&self, key: MirrorKey, bytes: Vec<u8>) {
        let Some(tx) = &self.tx else {
            return;
        };

        match tx.try_send(ReplicationJob::Put { key, bytes }) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(ReplicationJob::Put { key, .. })) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, "Replication queue full, dropping mirror write");
            }
            Err(mpsc::error::TrySendError::Closed(ReplicationJob::Put { key, .. })) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, "Replication worker stopped, dropping mirror write");
            }
            Err(_) => {}
        }
    }

    /// Wait until every job enqueued before this call has been handled
    pub async fn barrier(&self) {
        let Some(tx) = &self.tx else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(ReplicationJob::Barrier(done_tx)).await.is_ok() {
            done_rx.await.ok();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    pub fn snapshot(&self) -> ReplicationSnapshot {
        ReplicationSnapshot {
            enqueued: self.stats.enqueued.load(Ordering::Relaxed),
            written: self.stats.written.load(Ordering::Relaxed),
            unchanged: self.stats.unchanged.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<ReplicationJob>,
    sink: Arc<dyn MirrorSink>,
    stats: Arc<ReplicationStats>,
) {
    info!("Replication worker started");

    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while batch.len() < MAX_BATCH {
            match rx.try_recv() {
                Ok(job) => batch.push(job),
                Err(_) => break,
            }
        }

        // Later writes of a key supersede earlier ones in the same batch
        let mut latest: HashMap<MirrorKey, usize> = HashMap::new();
        for (i, job) in batch.iter().enumerate() {
            if let ReplicationJob::Put { key, .. } = job {
                latest.insert(key.clone(), i);
            }
        }

        for (i, job) in batch.into_iter().enumerate() {
            match job {
                ReplicationJob::Put { key, bytes } => {
                    if latest.get(&key) != Some(&i) {
                        stats.unchanged.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    match sink.put(&key, &bytes).await {
                        Ok(PutOutcome::Written) => {
                            stats.written.fetch_add(1, Ordering::Relaxed);
                            debug!(key = %key, "Mirrored");
                        }
                        Ok(PutOutcome::Unchanged) => {
                            stats.unchanged.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            stats.failed.fetch_add(1, Ordering::Relaxed);
                            warn!(key = %key, error = %e, "Mirror write failed");
                        }
                    }
                }
                ReplicationJob::Barrier(done) => {
                    done.send(()).ok();
                }
            }
        }
    }

    info!("Replication worker stopped");
}
