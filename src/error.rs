//! Error types for rewards-ledger
//!
//! Two layers:
//! - [`StorageError`] - failures of the durable stores (the only retryable class)
//! - [`Rejection`] - expected business outcomes (insufficient credits, used code, ...)
//!
//! [`LedgerError`] wraps both so ledger operations can use `?` throughout.

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Database(_) | StorageError::Io(_))
    }
}

/// Coarse classification used by callers to decide how to react
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Malformed input; nothing was touched
    Validation,
    /// Not enough credits or allowance; nothing was touched
    InsufficientResource,
    /// The requested transition already happened or cannot happen now
    StateConflict,
    /// Storage failed; the mutation must be assumed not applied
    TransientStorage,
}

/// An expected, user-facing reason for refusing an operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("Not enough credits: need {required}, have {available}")]
    InsufficientCredits { required: u64, available: u64 },

    #[error("Daily limit of {limit} reached")]
    DailyLimitReached { limit: u32 },

    #[error("Your plan does not include downloads")]
    DownloadNotAllowed,

    #[error("Daily download limit of {limit} reached")]
    DownloadLimitReached { limit: u32 },

    #[error("Unknown plan: {0}")]
    UnknownPlan(String),

    #[error("Plan duration of {days} days is out of range")]
    InvalidDuration { days: u32 },

    #[error("Invalid reward: {0}")]
    InvalidReward(String),

    #[error("You cannot refer yourself")]
    SelfReferral,

    #[error("Code is malformed or does not exist")]
    InvalidCode,

    #[error("Code was already used by someone else")]
    AlreadyUsedGlobally,

    #[error("You have already used this code")]
    AlreadyUsedByThisUser,

    #[error("Code already exists")]
    CodeExists,

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Task already exists: {0}")]
    TaskExists(String),

    #[error("Open the task link first")]
    NotOpened,

    #[error("Too soon, wait {remaining_secs}s before confirming")]
    TooSoon { remaining_secs: u64 },

    #[error("Task already completed")]
    AlreadyCompleted,

    #[error("Unknown giveaway: {0}")]
    UnknownGiveaway(String),

    #[error("Giveaway already exists: {0}")]
    GiveawayExists(String),

    #[error("You already joined this giveaway")]
    AlreadyJoined,

    #[error("Giveaway has ended")]
    GiveawayEnded,

    #[error("No referral is pending for this user")]
    NoPendingReferral,

    #[error("Referral already completed")]
    ReferralAlreadyCompleted,
}

impl Rejection {
    pub fn class(&self) -> ErrorClass {
        match self {
            Rejection::UnknownPlan(_)
            | Rejection::SelfReferral
            | Rejection::InvalidDuration { .. }
            | Rejection::InvalidReward(_)
            | Rejection::InvalidCode
            | Rejection::UnknownTask(_)
            | Rejection::UnknownGiveaway(_) => ErrorClass::Validation,

            Rejection::InsufficientCredits { .. }
            | Rejection::DailyLimitReached { .. }
            | Rejection::DownloadNotAllowed
            | Rejection::DownloadLimitReached { .. } => ErrorClass::InsufficientResource,

            Rejection::AlreadyUsedGlobally
            | Rejection::AlreadyUsedByThisUser
            | Rejection::CodeExists
            | Rejection::TaskExists(_)
            | Rejection::NotOpened
            | Rejection::TooSoon { .. }
            | Rejection::AlreadyCompleted
            | Rejection::GiveawayExists(_)
            | Rejection::AlreadyJoined
            | Rejection::GiveawayEnded
            | Rejection::NoPendingReferral
            | Rejection::ReferralAlreadyCompleted => ErrorClass::StateConflict,
        }
    }

    /// Stable machine-readable reason code
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::InsufficientCredits { .. } => "insufficient_credits",
            Rejection::DailyLimitReached { .. } => "daily_limit_reached",
            Rejection::DownloadNotAllowed => "download_not_allowed",
            Rejection::DownloadLimitReached { .. } => "download_limit_reached",
            Rejection::UnknownPlan(_) => "unknown_plan",
            Rejection::InvalidDuration { .. } => "invalid_duration",
            Rejection::InvalidReward(_) => "invalid_reward",
            Rejection::SelfReferral => "self_referral",
            Rejection::InvalidCode => "invalid_code",
            Rejection::AlreadyUsedGlobally => "already_used_globally",
            Rejection::AlreadyUsedByThisUser => "already_used_by_this_user",
            Rejection::CodeExists => "code_exists",
            Rejection::UnknownTask(_) => "unknown_task",
            Rejection::TaskExists(_) => "task_exists",
            Rejection::NotOpened => "not_opened",
            Rejection::TooSoon { .. } => "too_soon",
            Rejection::AlreadyCompleted => "already_completed",
            Rejection::UnknownGiveaway(_) => "unknown_giveaway",
            Rejection::GiveawayExists(_) => "giveaway_exists",
            Rejection::AlreadyJoined => "already_joined",
            Rejection::GiveawayEnded => "giveaway_ended",
            Rejection::NoPendingReferral => "no_pending_referral",
            Rejection::ReferralAlreadyCompleted => "referral_already_completed",
        }
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error(transparent)]
    Rejected(#[from] Rejection),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl LedgerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LedgerError::Rejected(r) => r.class(),
            LedgerError::Storage(_) => ErrorClass::TransientStorage,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::Rejected(r) => r.code(),
            LedgerError::Storage(_) => "storage_unavailable",
        }
    }

    /// The rejection, if this was a business outcome
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            LedgerError::Rejected(r) => Some(r),
            LedgerError::Storage(_) => None,
        }
    }

    /// Only transient storage failures are worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            LedgerError::Rejected(_) => false,
            LedgerError::Storage(e) => e.is_transient(),
        }
    }
}

impl From<sled::Error> for LedgerError {
    fn from(e: sled::Error) -> Self {
        LedgerError::Storage(StorageError::Database(e))
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        LedgerError::Storage(StorageError::Json(e))
    }
}

pub type Result<T, E = LedgerError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_classes() {
        assert_eq!(Rejection::SelfReferral.class(), ErrorClass::Validation);
        assert_eq!(
            Rejection::InsufficientCredits { required: 1, available: 0 }.class(),
            ErrorClass::InsufficientResource
        );
        assert_eq!(Rejection::AlreadyCompleted.class(), ErrorClass::StateConflict);
    }

    #[test]
    fn test_storage_errors_are_retryable_rejections_are_not() {
        let io = LedgerError::from(StorageError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "disk gone",
        )));
        assert!(io.is_retryable());
        assert_eq!(io.class(), ErrorClass::TransientStorage);

        let corrupt = LedgerError::from(StorageError::Corrupt {
            key: "users/1".into(),
            reason: "bad".into(),
        });
        assert!(!corrupt.is_retryable());

        let rejected = LedgerError::from(Rejection::InvalidCode);
        assert!(!rejected.is_retryable());
        assert_eq!(rejected.code(), "invalid_code");
        assert_eq!(rejected.to_string(), "Code is malformed or does not exist");
    }
}
