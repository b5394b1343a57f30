//! Two-phase tasks: open, wait out the dwell time, then complete.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::info;

use super::Ledger;
use crate::error::{Rejection, Result};
use crate::record::UserId;
use crate::tasks::Task;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskOpened {
    pub task: Task,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskCompleted {
    pub task_id: String,
    pub reward: u64,
    pub new_balance: u64,
}

impl Ledger {
    /// Record that the user opened the task link.
    ///
    /// Opening again restarts the dwell timer.
    pub async fn open_task(&self, user_id: UserId, task_id: &str) -> Result<TaskOpened> {
        let task = self
            .tasks
            .get(task_id)?
            .ok_or_else(|| Rejection::UnknownTask(task_id.to_string()))?;

        let opened_at = self
            .mutate(user_id, |record, now| {
                record.tasks_opened.insert(task.id.clone(), now);
                Ok(now)
            })
            .await?;

        Ok(TaskOpened { task, opened_at })
    }

    /// Complete an opened task and credit its reward in the same save
    pub async fn complete_task(&self, user_id: UserId, task_id: &str) -> Result<TaskCompleted> {
        let task = self
            .tasks
            .get(task_id)?
            .ok_or_else(|| Rejection::UnknownTask(task_id.to_string()))?;
        let dwell = Duration::seconds(self.rules.min_task_dwell_secs as i64);

        let new_balance = self
            .mutate(user_id, |record, now| {
                if record.tasks_completed.contains(&task.id) {
                    return Err(Rejection::AlreadyCompleted);
                }
                let opened_at = *record.tasks_opened.get(&task.id).ok_or(Rejection::NotOpened)?;

                let elapsed = now - opened_at;
                if elapsed < dwell {
                    let remaining_ms = (dwell - elapsed).num_milliseconds().max(0) as u64;
                    return Err(Rejection::TooSoon {
                        remaining_secs: remaining_ms.div_ceil(1000),
                    });
                }

                record.tasks_completed.insert(task.id.clone());
                record.credits = record.credits.saturating_add(task.reward_credits);
                Ok(record.credits)
            })
            .await?;

        info!(user_id, task_id = %task.id, reward = task.reward_credits, new_balance, "Task completed");
        Ok(TaskCompleted {
            task_id: task.id,
            reward: task.reward_credits,
            new_balance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::ledger;
    use super::*;
    use crate::error::LedgerError;

    fn join_group() -> Task {
        Task {
            id: "join_group".to_string(),
            title: "Join the group".to_string(),
            reward_credits: 2,
            link: Some("https://t.me/example".to_string()),
        }
    }

    #[tokio::test]
    async fn test_task_flow() {
        let (ledger, clock) = ledger();
        ledger.add_task(join_group()).await.unwrap();

        let err = ledger.complete_task(1, "join_group").await.unwrap_err();
        assert!(matches!(err, LedgerError::Rejected(Rejection::NotOpened)));

        ledger.open_task(1, "join_group").await.unwrap();
        clock.advance(Duration::seconds(2));
        let err = ledger.complete_task(1, "join_group").await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Rejected(Rejection::TooSoon { remaining_secs: 3 })
        ));

        clock.advance(Duration::seconds(3));
        let done = ledger.complete_task(1, "join_group").await.unwrap();
        assert_eq!(done.new_balance, 2);

        let err = ledger.complete_task(1, "join_group").await.unwrap_err();
        assert!(matches!(err, LedgerError::Rejected(Rejection::AlreadyCompleted)));
        assert_eq!(ledger.get_profile(1).await.unwrap().credits, 2);
    }

    #[tokio::test]
    async fn test_reopen_restarts_dwell() {
        let (ledger, clock) = ledger();
        ledger.add_task(join_group()).await.unwrap();

        ledger.open_task(1, "join_group").await.unwrap();
        clock.advance(Duration::seconds(10));
        ledger.open_task(1, "join_group").await.unwrap();
        clock.advance(Duration::seconds(1));

        let err = ledger.complete_task(1, "join_group").await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Rejected(Rejection::TooSoon { remaining_secs: 4 })
        ));
    }

    #[tokio::test]
    async fn test_reopen_cannot_borrow_earlier_dwell() {
        let (ledger, clock) = ledger();
        ledger.add_task(join_group()).await.unwrap();

        ledger.open_task(1, "join_group").await.unwrap();
        clock.advance(Duration::seconds(2));
        ledger.open_task(1, "join_group").await.unwrap();
        clock.advance(Duration::seconds(4));

        // 6s since the first open, 4s since the latest
        let err = ledger.complete_task(1, "join_group").await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Rejected(Rejection::TooSoon { remaining_secs: 1 })
        ));

        clock.advance(Duration::seconds(1));
        assert_eq!(ledger.complete_task(1, "join_group").await.unwrap().new_balance, 2);
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let (ledger, _clock) = ledger();
        let err = ledger.open_task(1, "nope").await.unwrap_err();
        assert_eq!(err.code(), "unknown_task");
        let err = ledger.complete_task(1, "nope").await.unwrap_err();
        assert_eq!(err.code(), "unknown_task");
    }
}
