//! Task catalog
//!
//! Admin-managed list of tasks users can open and complete for credits.
//! Reads are lock-free sled lookups; writes are rare single-key operations.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{LedgerError, Rejection, StorageError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub reward_credits: u64,
    /// Where the user is sent when opening the task
    #[serde(default)]
    pub link: Option<String>,
}

pub struct TaskCatalog {
    tasks: sled::Tree,
}

impl TaskCatalog {
    pub fn new(tasks: sled::Tree) -> Self {
        Self { tasks }
    }

    /// Add a task; `TaskExists` if the id is taken
    pub async fn add(&self, task: Task) -> Result<Task, LedgerError> {
        let id = task.id.trim().to_string();
        if id.is_empty() {
            return Err(Rejection::UnknownTask(task.id).into());
        }
        let task = Task { id, ..task };

        let bytes = serde_json::to_vec(&task)?;
        let inserted = self
            .tasks
            .compare_and_swap(task.id.as_bytes(), None as Option<&[u8]>, Some(bytes))?
            .is_ok();
        if !inserted {
            return Err(Rejection::TaskExists(task.id).into());
        }
        self.tasks.flush_async().await?;

        info!(task_id = %task.id, reward = task.reward_credits, "Added task");
        Ok(task)
    }

    /// Remove a task. Returns the removed entry, if any.
    ///
    /// Users who already completed it keep their credits and completion mark.
    pub async fn remove(&self, id: &str) -> Result<Option<Task>, StorageError> {
        let Some(raw) = self.tasks.remove(id.as_bytes())? else {
            return Ok(None);
        };
        self.tasks.flush_async().await?;
        info!(task_id = %id, "Removed task");
        decode(id, &raw).map(Some)
    }

    pub fn get(&self, id: &str) -> Result<Option<Task>, StorageError> {
        match self.tasks.get(id.as_bytes())? {
            Some(raw) => decode(id, &raw).map(Some),
            None => Ok(None),
        }
    }

    /// Every task, in id order
    pub fn list(&self) -> Result<Vec<Task>, StorageError> {
        let mut tasks = Vec::new();
        for item in self.tasks.iter() {
            let (key, raw) = item?;
            let id = String::from_utf8_lossy(&key).to_string();
            match decode(&id, &raw) {
                Ok(task) => tasks.push(task),
                Err(e) => warn!(task_id = %id, error = %e, "Skipping unreadable task"),
            }
        }
        Ok(tasks)
    }
}

fn decode(id: &str, raw: &[u8]) -> Result<Task, StorageError> {
    serde_json::from_slice(raw).map_err(|e| StorageError::Corrupt {
        key: format!("tasks/{}", id),
        reason: e.to_string(),
    })
}
