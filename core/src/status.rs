/*!
# Status Module

Read-only aggregation over engine state for external consumers such as UIs,
logs and dashboards.

A `StatusReporter` holds shared references to the engine's state and retry
executor; it never mutates either. Snapshots are taken under the engine's
mutex, so a reader can never observe a torn update.
*/

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::engine::{EngineShared, EngineStatus};
use crate::executor::{RetryExecutor, RetryStatistics};
use crate::task::TaskResult;

/// Point-in-time view of the engine and its derived metrics
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    /// Engine status at snapshot time
    pub status: EngineStatus,

    /// Id of the task currently executing, if any
    pub current_task: Option<String>,

    /// Counters and derived metrics
    pub statistics: EngineStatistics,

    /// Earliest `next_run` over the enabled tasks
    pub next_task_time: Option<DateTime<Utc>>,

    /// Most recent result per task
    pub recent_results: HashMap<String, TaskResult>,
}

/// Aggregated counters reported with every snapshot
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatistics {
    pub total_leads_found: u64,
    pub daily_search_count: u32,
    pub error_count: u32,
    /// Seconds since the engine started, 0 when it never ran
    pub runtime_seconds: u64,
    pub tasks_total: usize,
    pub tasks_enabled: usize,
    /// Successful executions as a percentage of all executions
    pub success_rate: f64,
}

/// Read-only reporter over a running (or stopped) engine
pub struct StatusReporter {
    shared: Arc<Mutex<EngineShared>>,
    executor: Arc<RetryExecutor>,
    clock: Arc<dyn Clock>,
}

impl StatusReporter {
    pub(crate) fn new(
        shared: Arc<Mutex<EngineShared>>,
        executor: Arc<RetryExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            shared,
            executor,
            clock,
        }
    }

    /// Take a consistent snapshot of the engine state
    pub async fn snapshot(&self) -> EngineSnapshot {
        let retry = self.executor.statistics().await;
        let shared = self.shared.lock().await;

        let runtime_seconds = shared
            .started_at
            .map(|started| {
                (self.clock.now() - started)
                    .to_std()
                    .unwrap_or_default()
                    .as_secs()
            })
            .unwrap_or(0);

        let next_task_time = shared
            .tasks
            .iter()
            .filter(|task| task.enabled)
            .filter_map(|task| task.next_run)
            .min();

        EngineSnapshot {
            status: shared.status,
            current_task: shared.current_task.clone(),
            statistics: EngineStatistics {
                total_leads_found: shared.total_leads_found,
                daily_search_count: shared.daily_search_count,
                error_count: shared.error_count,
                runtime_seconds,
                tasks_total: shared.tasks.len(),
                tasks_enabled: shared.tasks.iter().filter(|task| task.enabled).count(),
                success_rate: retry.aggregate.success_rate,
            },
            next_task_time,
            recent_results: shared.result_history.clone(),
        }
    }

    /// Retry statistics across all executed tasks
    pub async fn retry_statistics(&self) -> RetryStatistics {
        self.executor.statistics().await
    }
}
