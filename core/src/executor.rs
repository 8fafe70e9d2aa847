/*!
# Executor Module

This module drives a single task execution through its retry policy.

The executor is responsible for:
- Running the caller-supplied fetch operation up to `max_attempts` times
- Applying the task's per-attempt timeout when one is configured
- Sleeping out the policy delay between attempts, racing a stop signal so a
  long backoff can be interrupted
- Encoding every outcome in the returned `TaskResult` — no error ever
  escapes `execute_with_retry`
- Maintaining per-task and aggregate retry statistics

Retry eligibility is decided by a pluggable predicate; the default retries
everything except configuration errors.
*/

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, warn};

use crate::error::LeadFlowError;
use crate::task::{FetchSummary, SearchTask, TaskResult, TaskStatus};

/// Callback invoked at the start of each attempt and before each retry wait
pub type AttemptHook<'a> = &'a (dyn Fn(u32, &str) + Send + Sync);

/// Retry statistics for one task
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskRetryStats {
    /// Completed executions (each covering all of its attempts)
    pub executions: u64,
    /// Attempts made across all executions
    pub total_attempts: u64,
    /// Executions that ended in success
    pub successes: u64,
    /// Executions that ended in failure, timeout or cancellation
    pub failures: u64,
    /// Running average of attempts per execution
    pub avg_attempts: f64,
    /// When the task last finished an execution
    pub last_execution: Option<chrono::DateTime<Utc>>,
}

/// Retry statistics aggregated over every task
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregateRetryStats {
    pub total_executions: u64,
    pub total_attempts: u64,
    pub successes: u64,
    pub failures: u64,
    /// Successful executions as a percentage of all executions
    pub success_rate: f64,
    pub avg_attempts: f64,
}

/// Snapshot returned by [`RetryExecutor::statistics`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetryStatistics {
    pub per_task: HashMap<String, TaskRetryStats>,
    pub aggregate: AggregateRetryStats,
}

/// Executes task operations under their retry policies
pub struct RetryExecutor {
    stats: Mutex<HashMap<String, TaskRetryStats>>,
    retryable: Box<dyn Fn(&LeadFlowError) -> bool + Send + Sync>,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryExecutor {
    /// Create an executor with the default eligibility predicate
    pub fn new() -> Self {
        Self {
            stats: Mutex::new(HashMap::new()),
            retryable: Box::new(LeadFlowError::is_retryable),
        }
    }

    /// Create an executor with a custom retry-eligibility predicate
    pub fn with_retryable(
        predicate: impl Fn(&LeadFlowError) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            stats: Mutex::new(HashMap::new()),
            retryable: Box::new(predicate),
        }
    }

    /// Execute `operation` for `task`, retrying per its policy.
    ///
    /// The optional `cancel` receiver interrupts backoff waits; a stop signal
    /// observed mid-wait finalizes the result as `Cancelled`. All outcomes,
    /// including operation errors, are encoded in the returned `TaskResult`.
    pub async fn execute_with_retry<F, Fut>(
        &self,
        task: &SearchTask,
        mut operation: F,
        on_attempt: Option<AttemptHook<'_>>,
        mut cancel: Option<watch::Receiver<bool>>,
    ) -> TaskResult
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = crate::error::Result<FetchSummary>>,
    {
        let started = Instant::now();
        let mut result = TaskResult::pending(&task.id, Utc::now());
        let max_attempts = task.retry_policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            result.status = TaskStatus::Running;
            result.attempts = attempt;
            if let Some(hook) = on_attempt {
                hook(attempt, "starting attempt");
            }
            debug!(task_id = %task.id, attempt, max_attempts, "starting attempt");

            match run_attempt(task.timeout, &mut operation).await {
                Ok(summary) => {
                    result.summary = Some(summary);
                    result.finalize(TaskStatus::Success, Utc::now());
                    if attempt > 1 {
                        debug!(
                            task_id = %task.id,
                            attempt,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "succeeded after retry"
                        );
                    }
                    self.record(&task.id, attempt, true).await;
                    metrics::counter!("leadflow_task_executions_total", 1);
                    return result;
                }
                Err(failure) => {
                    let eligible = attempt < max_attempts && (self.retryable)(&failure.error);
                    if !eligible {
                        result.error = Some(failure.error.to_string());
                        let status = if failure.timed_out {
                            TaskStatus::Timeout
                        } else {
                            TaskStatus::Failed
                        };
                        result.finalize(status, Utc::now());
                        error!(
                            task_id = %task.id,
                            attempts = attempt,
                            error = %failure.error,
                            "task execution failed"
                        );
                        self.record(&task.id, attempt, false).await;
                        metrics::counter!("leadflow_task_failures_total", 1);
                        return result;
                    }

                    result.status = TaskStatus::Retrying;
                    let delay = task.retry_policy.delay(attempt);
                    if let Some(hook) = on_attempt {
                        hook(
                            attempt,
                            &format!(
                                "attempt {attempt} failed: {}; retrying in {delay:?}",
                                failure.error
                            ),
                        );
                    }
                    warn!(
                        task_id = %task.id,
                        attempt,
                        error = %failure.error,
                        delay_ms = delay.as_millis() as u64,
                        "attempt failed, will retry"
                    );
                    metrics::counter!("leadflow_task_retries_total", 1);

                    if !wait_or_cancelled(delay, cancel.as_mut()).await {
                        result.error = Some(failure.error.to_string());
                        result.finalize(TaskStatus::Cancelled, Utc::now());
                        warn!(task_id = %task.id, attempt, "retry wait interrupted by stop signal");
                        self.record(&task.id, attempt, false).await;
                        return result;
                    }
                }
            }
        }

        // The loop always returns from its last iteration; keep the compiler
        // and any future refactor honest.
        result.finalize(TaskStatus::Failed, Utc::now());
        result
    }

    /// Statistics for every task this executor has run
    pub async fn statistics(&self) -> RetryStatistics {
        let per_task = self.stats.lock().await.clone();
        let mut aggregate = AggregateRetryStats::default();
        for stats in per_task.values() {
            aggregate.total_executions += stats.executions;
            aggregate.total_attempts += stats.total_attempts;
            aggregate.successes += stats.successes;
            aggregate.failures += stats.failures;
        }
        if aggregate.total_executions > 0 {
            aggregate.success_rate =
                aggregate.successes as f64 * 100.0 / aggregate.total_executions as f64;
            aggregate.avg_attempts =
                aggregate.total_attempts as f64 / aggregate.total_executions as f64;
        }
        RetryStatistics {
            per_task,
            aggregate,
        }
    }

    async fn record(&self, task_id: &str, attempts: u32, success: bool) {
        let mut stats = self.stats.lock().await;
        let entry = stats.entry(task_id.to_string()).or_default();
        entry.executions += 1;
        entry.total_attempts += u64::from(attempts);
        if success {
            entry.successes += 1;
        } else {
            entry.failures += 1;
        }
        entry.avg_attempts = entry.total_attempts as f64 / entry.executions as f64;
        entry.last_execution = Some(Utc::now());
    }
}

struct AttemptFailure {
    error: LeadFlowError,
    timed_out: bool,
}

async fn run_attempt<F, Fut>(
    timeout: Option<Duration>,
    operation: &mut F,
) -> std::result::Result<FetchSummary, AttemptFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = crate::error::Result<FetchSummary>>,
{
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, operation()).await {
            Ok(Ok(summary)) => Ok(summary),
            Ok(Err(error)) => Err(AttemptFailure {
                error,
                timed_out: false,
            }),
            Err(_) => Err(AttemptFailure {
                error: LeadFlowError::Timeout(limit),
                timed_out: true,
            }),
        },
        None => operation().await.map_err(|error| AttemptFailure {
            error,
            timed_out: false,
        }),
    }
}

/// Sleep for `delay`, returning false if the stop signal fires first
async fn wait_or_cancelled(delay: Duration, cancel: Option<&mut watch::Receiver<bool>>) -> bool {
    let Some(rx) = cancel else {
        tokio::time::sleep(delay).await;
        return true;
    };
    if *rx.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        changed = rx.changed() => match changed {
            Ok(()) => !*rx.borrow(),
            // Sender gone: no stop signal can arrive anymore.
            Err(_) => {
                tokio::time::sleep(delay).await;
                true
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn task_with(policy: RetryPolicy) -> SearchTask {
        SearchTask::new(json!({"location": "London"}))
            .with_id("test-task")
            .with_retry_policy(policy)
    }

    fn summary(new_leads: u64) -> FetchSummary {
        FetchSummary {
            new_leads,
            total_found: new_leads,
        }
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let executor = RetryExecutor::new();
        let task = task_with(RetryPolicy::fixed(3, Duration::ZERO));

        let result = executor
            .execute_with_retry(&task, || async { Ok(summary(2)) }, None, None)
            .await;

        assert_eq!(result.status, TaskStatus::Success);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.summary, Some(summary(2)));
        assert!(result.completed_at.is_some());
    }

    #[tokio::test]
    async fn always_failing_operation_exhausts_attempts() {
        let executor = RetryExecutor::new();
        let task = task_with(RetryPolicy::fixed(3, Duration::ZERO));

        let result = executor
            .execute_with_retry(
                &task,
                || async { Err(LeadFlowError::Fetch("boom".into())) },
                None,
                None,
            )
            .await;

        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.attempts, 3);
        assert!(result.error.as_deref().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn failing_twice_then_succeeding_uses_three_attempts() {
        let executor = RetryExecutor::new();
        let task = task_with(RetryPolicy::fixed(3, Duration::ZERO));
        let calls = Arc::new(AtomicU32::new(0));

        let calls_clone = calls.clone();
        let result = executor
            .execute_with_retry(
                &task,
                move || {
                    let calls = calls_clone.clone();
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(LeadFlowError::Fetch("transient".into()))
                        } else {
                            Ok(summary(1))
                        }
                    }
                },
                None,
                None,
            )
            .await;

        assert_eq!(result.status, TaskStatus::Success);
        assert_eq!(result.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_fails_immediately() {
        let executor = RetryExecutor::new();
        let task = task_with(RetryPolicy::fixed(5, Duration::ZERO));

        let result = executor
            .execute_with_retry(
                &task,
                || async { Err(LeadFlowError::Config("bad params".into())) },
                None,
                None,
            )
            .await;

        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn per_attempt_timeout_yields_timeout_status() {
        let executor = RetryExecutor::new();
        let task = task_with(RetryPolicy::fixed(1, Duration::ZERO))
            .with_timeout(Duration::from_millis(20));

        let result = executor
            .execute_with_retry(
                &task,
                || async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(summary(1))
                },
                None,
                None,
            )
            .await;

        assert_eq!(result.status, TaskStatus::Timeout);
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn stop_signal_interrupts_backoff_wait() {
        let executor = RetryExecutor::new();
        let task = task_with(RetryPolicy::fixed(3, Duration::from_secs(30)));
        let (stop_tx, stop_rx) = watch::channel(false);

        let started = Instant::now();
        let handle = tokio::spawn(async move {
            executor
                .execute_with_retry(
                    &task,
                    || async { Err(LeadFlowError::Fetch("down".into())) },
                    None,
                    Some(stop_rx),
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        stop_tx.send(true).unwrap();
        let result = handle.await.unwrap();

        assert_eq!(result.status, TaskStatus::Cancelled);
        assert_eq!(result.attempts, 1);
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test]
    async fn attempt_hook_sees_retry_messages() {
        let executor = RetryExecutor::new();
        let task = task_with(RetryPolicy::fixed(2, Duration::ZERO));
        let messages = Arc::new(std::sync::Mutex::new(Vec::new()));

        let sink = messages.clone();
        let hook = move |attempt: u32, message: &str| {
            sink.lock().unwrap().push((attempt, message.to_string()));
        };

        let _ = executor
            .execute_with_retry(
                &task,
                || async { Err(LeadFlowError::Fetch("flaky".into())) },
                Some(&hook),
                None,
            )
            .await;

        let messages = messages.lock().unwrap();
        assert!(messages.iter().any(|(a, m)| *a == 1 && m.contains("retrying")));
        assert_eq!(messages.iter().filter(|(_, m)| m == "starting attempt").count(), 2);
    }

    #[tokio::test]
    async fn statistics_track_successes_and_failures() {
        let executor = RetryExecutor::new();
        let ok_task = task_with(RetryPolicy::fixed(2, Duration::ZERO)).with_id("ok");
        let bad_task = task_with(RetryPolicy::fixed(2, Duration::ZERO)).with_id("bad");

        let _ = executor
            .execute_with_retry(&ok_task, || async { Ok(summary(1)) }, None, None)
            .await;
        let _ = executor
            .execute_with_retry(
                &bad_task,
                || async { Err(LeadFlowError::Fetch("down".into())) },
                None,
                None,
            )
            .await;

        let stats = executor.statistics().await;
        assert_eq!(stats.aggregate.total_executions, 2);
        assert_eq!(stats.aggregate.successes, 1);
        assert_eq!(stats.aggregate.failures, 1);
        assert!((stats.aggregate.success_rate - 50.0).abs() < f64::EPSILON);

        let ok_stats = &stats.per_task["ok"];
        assert_eq!(ok_stats.executions, 1);
        assert_eq!(ok_stats.total_attempts, 1);
        assert!((ok_stats.avg_attempts - 1.0).abs() < f64::EPSILON);

        let bad_stats = &stats.per_task["bad"];
        assert_eq!(bad_stats.total_attempts, 2);
        assert!(bad_stats.last_execution.is_some());
    }
}
