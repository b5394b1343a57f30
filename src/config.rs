//! Configuration for rewards-ledger

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default data directory
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rewards-ledger")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the primary database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory for the write-behind mirror (defaults to `<data_dir>/mirror`)
    #[serde(default)]
    pub mirror_dir: Option<PathBuf>,

    /// Bounded replication queue size
    #[serde(default = "default_queue_capacity")]
    pub replication_queue_capacity: usize,

    /// Flush sled after every commit
    #[serde(default = "default_true")]
    pub flush_on_write: bool,

    /// Expiry/refill sweep interval in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Attempts for transient storage failures (daemon-side retries)
    #[serde(default = "default_retry_attempts")]
    pub storage_retry_attempts: u32,

    /// Business rules
    #[serde(default)]
    pub rules: LedgerRules,
}

/// A referral-count milestone that grants a badge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadgeMilestone {
    pub completed: u64,
    pub badge: String,
}

/// Business rule constants
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerRules {
    /// Credits granted to the inviter per completed referral
    #[serde(default = "default_referral_reward")]
    pub referral_reward: u64,

    /// Badges granted at completed-referral counts
    #[serde(default = "default_badge_milestones")]
    pub badge_milestones: Vec<BadgeMilestone>,

    /// Minimum seconds between opening a task and completing it
    #[serde(default = "default_min_dwell")]
    pub min_task_dwell_secs: u64,

    /// Credits added per free-tier refill
    #[serde(default = "default_refill_amount")]
    pub free_refill_amount: u64,

    /// Refill never raises the balance above this
    #[serde(default = "default_refill_cap")]
    pub free_refill_cap: u64,

    /// Seconds between refills
    #[serde(default = "default_refill_interval")]
    pub free_refill_interval_secs: u64,

    /// Exact redeem code length
    #[serde(default = "default_code_length")]
    pub code_length: usize,
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_referral_reward() -> u64 {
    2
}

fn default_badge_milestones() -> Vec<BadgeMilestone> {
    vec![
        BadgeMilestone { completed: 1, badge: "Referrer Lv1".to_string() },
        BadgeMilestone { completed: 5, badge: "Referrer Lv2".to_string() },
        BadgeMilestone { completed: 10, badge: "Referrer Lv3".to_string() },
    ]
}

fn default_min_dwell() -> u64 {
    5
}

fn default_refill_amount() -> u64 {
    3
}

fn default_refill_cap() -> u64 {
    3
}

fn default_refill_interval() -> u64 {
    3600
}

fn default_code_length() -> usize {
    16
}

impl Default for LedgerRules {
    fn default() -> Self {
        Self {
            referral_reward: default_referral_reward(),
            badge_milestones: default_badge_milestones(),
            min_task_dwell_secs: default_min_dwell(),
            free_refill_amount: default_refill_amount(),
            free_refill_cap: default_refill_cap(),
            free_refill_interval_secs: default_refill_interval(),
            code_length: default_code_length(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            mirror_dir: None,
            replication_queue_capacity: default_queue_capacity(),
            flush_on_write: true,
            sweep_interval_secs: default_sweep_interval(),
            storage_retry_attempts: default_retry_attempts(),
            rules: LedgerRules::default(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Reject settings the ledger cannot run with
    pub fn validate(&self) -> Result<(), String> {
        if self.replication_queue_capacity == 0 {
            return Err("replication_queue_capacity must be at least 1".to_string());
        }
        if self.rules.code_length == 0 {
            return Err("rules.code_length must be at least 1".to_string());
        }
        if self.rules.free_refill_interval_secs == 0 {
            return Err("rules.free_refill_interval_secs must be at least 1".to_string());
        }
        Ok(())
    }

    /// Get primary database path
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("ledger.sled")
    }

    /// Get mirror directory
    pub fn mirror_path(&self) -> PathBuf {
        self.mirror_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("mirror"))
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
