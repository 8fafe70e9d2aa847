/*!
# Task Module

This module defines the schedulable unit of work for LeadFlow.

A `SearchTask` is a recurring, parameterized fetch job. Each task has:
- A unique identifier (generated when not supplied)
- An opaque parameter payload (by convention a location/category/limit triple)
- A priority used when several tasks are ready at once (1 = highest)
- Scheduling state maintained by the engine (`last_run` / `next_run`)
- Its own retry policy and an optional per-attempt timeout

This module also defines `TaskResult`, the outcome record of one full
execution of a task (including all retries), and the `TaskStatus` lifecycle
enum.
*/

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::retry::RetryPolicy;

/// Status of a task execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Execution record created but no attempt started yet
    Pending,
    /// An attempt is currently running
    Running,
    /// The execution completed successfully
    Success,
    /// All eligible attempts failed
    Failed,
    /// An attempt failed and the executor is waiting to retry
    Retrying,
    /// The execution was interrupted by an engine stop signal
    Cancelled,
    /// The final attempt exceeded the task's per-attempt timeout
    Timeout,
}

impl TaskStatus {
    /// Whether this status is a final outcome
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Timeout
        )
    }
}

/// A recurring fetch task managed by the automation engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchTask {
    /// Unique identifier for the task
    pub id: String,

    /// Opaque fetch parameters handed to the fetch collaborator
    pub params: serde_json::Value,

    /// Scheduling priority; 1 is highest
    pub priority: u8,

    /// Disabled tasks stay registered but are never selected
    pub enabled: bool,

    /// When the engine last started this task
    pub last_run: Option<DateTime<Utc>>,

    /// Earliest time the engine may run this task again
    pub next_run: Option<DateTime<Utc>>,

    /// Retry policy applied to each execution
    pub retry_policy: RetryPolicy,

    /// Optional deadline applied to each individual attempt
    pub timeout: Option<Duration>,
}

impl SearchTask {
    /// Create a new enabled task with a generated id and default retry policy
    pub fn new(params: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            params,
            priority: 1,
            enabled: true,
            last_run: None,
            next_run: None,
            retry_policy: RetryPolicy::default(),
            timeout: None,
        }
    }

    /// Use a caller-supplied id instead of a generated one
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the scheduling priority (1 = highest)
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Set the retry policy
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the per-attempt timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Register the task in a disabled state
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Whether the task is eligible to run at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled
            && match self.next_run {
                Some(at) => at <= now,
                None => true,
            }
    }
}

/// Summary returned by one successful fetch cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchSummary {
    /// Leads that passed the filters and were stored
    pub new_leads: u64,
    /// Total leads returned by the fetch collaborator
    pub total_found: u64,
}

/// Outcome record of one full execution (including all retries) of a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    /// Id of the task this execution belongs to
    pub task_id: String,

    /// Final (or, while running, current) status
    pub status: TaskStatus,

    /// Fetch summary, present on success
    pub summary: Option<FetchSummary>,

    /// Rendered error, present on failure
    pub error: Option<String>,

    /// Attempts made, including the successful one
    pub attempts: u32,

    /// Wall time from first attempt to finalization
    pub total_duration: Duration,

    /// When the execution started
    pub started_at: DateTime<Utc>,

    /// When the execution was finalized
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskResult {
    /// Create the initial record at the start of an execution
    pub fn pending(task_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Pending,
            summary: None,
            error: None,
            attempts: 0,
            total_duration: Duration::ZERO,
            started_at,
            completed_at: None,
        }
    }

    /// Finalize the record exactly once with its terminal status
    pub(crate) fn finalize(&mut self, status: TaskStatus, completed_at: DateTime<Utc>) {
        self.status = status;
        self.completed_at = Some(completed_at);
        self.total_duration = (completed_at - self.started_at).to_std().unwrap_or_default();
    }

    /// Whether the execution succeeded
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_tasks_get_unique_ids() {
        let a = SearchTask::new(json!({"location": "London"}));
        let b = SearchTask::new(json!({"location": "London"}));
        assert_ne!(a.id, b.id);
        assert!(a.enabled);
        assert_eq!(a.priority, 1);
    }

    #[test]
    fn task_due_when_next_run_unset_or_reached() {
        let now = Utc::now();
        let mut task = SearchTask::new(json!({}));
        assert!(task.is_due(now));

        task.next_run = Some(now + chrono::Duration::minutes(5));
        assert!(!task.is_due(now));

        task.next_run = Some(now - chrono::Duration::minutes(5));
        assert!(task.is_due(now));
    }

    #[test]
    fn disabled_tasks_are_never_due() {
        let task = SearchTask::new(json!({})).disabled();
        assert!(!task.is_due(Utc::now()));
    }

    #[test]
    fn finalize_sets_duration_and_timestamp() {
        let started = Utc::now();
        let mut result = TaskResult::pending("t1", started);
        assert_eq!(result.status, TaskStatus::Pending);

        result.finalize(TaskStatus::Success, started + chrono::Duration::seconds(2));
        assert!(result.is_success());
        assert_eq!(result.total_duration, Duration::from_secs(2));
        assert!(result.completed_at.is_some());
        assert!(result.status.is_terminal());
    }
}
