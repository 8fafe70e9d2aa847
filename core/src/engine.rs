/*!
# Engine Module

This module defines the automation engine for LeadFlow.

The engine owns a collection of recurring fetch tasks and runs a single
background control loop that:
- Gates execution on operating hours and global stop conditions
- Selects the highest-priority eligible task
- Hands it to the retry executor together with the real fetch operation
- Reschedules it based on the outcome
- Exposes pause/resume/stop controls and aggregated status

Key design points:
- Exactly one worker drives the loop; task execution is strictly serial
- All mutable state lives behind one mutex, so status reads never observe a
  torn update
- Every wait races the stop signal, so `stop()` interrupts idle sleeps and
  retry backoff alike
- Host callbacks are delivered as events over a bounded channel; a slow
  consumer drops events instead of stalling the loop
*/

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::collaborators::{LeadFetcher, LeadStore, WebsiteAnalyzer};
use crate::error::Result;
use crate::executor::{RetryExecutor, RetryStatistics};
use crate::status::{EngineSnapshot, StatusReporter};
use crate::task::{FetchSummary, SearchTask, TaskResult, TaskStatus};

/// Status of the automation engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    Stopped,
    Running,
    Paused,
    Error,
}

/// Configuration for the automation engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    /// Minutes between successful runs of the same task
    pub search_interval_minutes: u64,

    /// Upper bound on concurrent searches. The loop is strictly sequential;
    /// this is a forward-compatibility knob and is only validated.
    pub max_concurrent_searches: u32,

    /// Searches allowed per calendar day before the engine stops
    pub daily_search_limit: u32,

    /// Operating window start hour, 24h local time
    pub start_hour: u32,

    /// Operating window end hour (exclusive), 24h local time. May be 24 to
    /// run through midnight; `start_hour > end_hour` wraps overnight.
    pub end_hour: u32,

    /// Whether the engine may run on Saturday and Sunday
    pub weekend_enabled: bool,

    /// Minimum contact completeness a lead needs to be stored, 0-100
    pub min_contact_completeness: u8,

    /// Skip leads the store already knows about
    pub skip_already_processed: bool,

    /// Run the website analyzer on stored leads that have a website
    pub auto_analyze: bool,

    /// Stop once this many leads have been found in total
    pub max_total_leads: Option<u64>,

    /// Stop once the engine has been running this long
    pub max_runtime_hours: Option<u64>,

    /// Stop once this many task executions have failed
    pub stop_on_error_count: u32,

    /// Loop idle/poll intervals
    pub timings: LoopTimings,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            search_interval_minutes: 60,
            max_concurrent_searches: 2,
            daily_search_limit: 100,
            start_hour: 9,
            end_hour: 17,
            weekend_enabled: false,
            min_contact_completeness: 30,
            skip_already_processed: true,
            auto_analyze: true,
            max_total_leads: Some(1000),
            max_runtime_hours: Some(24),
            stop_on_error_count: 10,
            timings: LoopTimings::default(),
        }
    }
}

impl AutomationConfig {
    /// Check the configuration invariants, failing fast on mistakes
    pub fn validate(&self) -> Result<()> {
        use crate::error::LeadFlowError::Config;
        if self.search_interval_minutes == 0 {
            return Err(Config("search_interval_minutes must be >= 1".into()));
        }
        if self.max_concurrent_searches == 0 {
            return Err(Config("max_concurrent_searches must be >= 1".into()));
        }
        if self.daily_search_limit == 0 {
            return Err(Config("daily_search_limit must be >= 1".into()));
        }
        if self.stop_on_error_count == 0 {
            return Err(Config("stop_on_error_count must be >= 1".into()));
        }
        if self.start_hour > 23 {
            return Err(Config(format!("start_hour out of range: {}", self.start_hour)));
        }
        if self.end_hour > 24 {
            return Err(Config(format!("end_hour out of range: {}", self.end_hour)));
        }
        if self.min_contact_completeness > 100 {
            return Err(Config(format!(
                "min_contact_completeness out of range: {}",
                self.min_contact_completeness
            )));
        }
        Ok(())
    }

    /// Interval between successful runs of the same task
    pub fn search_interval(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.search_interval_minutes as i64)
    }

    /// Maximum total runtime, when configured
    pub fn max_runtime(&self) -> Option<Duration> {
        self.max_runtime_hours.map(|h| Duration::from_secs(h * 3600))
    }
}

/// Idle and poll intervals used by the control loop.
///
/// Defaults match production pacing; `testing()` shrinks everything so test
/// runs finish in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopTimings {
    /// Pause between loop iterations after a task ran
    pub task_check_interval_ms: u64,
    /// Wait when no task is ready
    pub no_task_wait_ms: u64,
    /// Wait while outside the operating window
    pub off_hours_wait_ms: u64,
    /// Poll interval while paused
    pub pause_poll_ms: u64,
    /// How long `stop()` waits for the worker to finish
    pub shutdown_timeout_ms: u64,
}

impl Default for LoopTimings {
    fn default() -> Self {
        Self {
            task_check_interval_ms: 30_000,
            no_task_wait_ms: 60_000,
            off_hours_wait_ms: 300_000,
            pause_poll_ms: 1_000,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl LoopTimings {
    /// Millisecond-scale timings for tests and dry runs
    pub fn testing() -> Self {
        Self {
            task_check_interval_ms: 10,
            no_task_wait_ms: 10,
            off_hours_wait_ms: 20,
            pause_poll_ms: 5,
            shutdown_timeout_ms: 1_000,
        }
    }

    pub fn task_check_interval(&self) -> Duration {
        Duration::from_millis(self.task_check_interval_ms)
    }

    pub fn no_task_wait(&self) -> Duration {
        Duration::from_millis(self.no_task_wait_ms)
    }

    pub fn off_hours_wait(&self) -> Duration {
        Duration::from_millis(self.off_hours_wait_ms)
    }

    pub fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Events emitted by the engine over its outbound channel
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A task execution succeeded
    Progress {
        task_id: String,
        new_leads: u64,
        total_leads: u64,
        attempts: u32,
    },
    /// A task execution failed after exhausting its retries
    TaskFailed {
        task_id: String,
        error: String,
        attempts: u32,
    },
    /// The control loop hit a fatal, non-task error
    EngineError { error: String },
    /// The loop exited; carries the final status snapshot
    Completed { snapshot: EngineSnapshot },
}

/// Mutable engine state, owned by the worker and guarded by one mutex
pub(crate) struct EngineShared {
    pub(crate) status: EngineStatus,
    pub(crate) tasks: Vec<SearchTask>,
    pub(crate) current_task: Option<String>,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) error_count: u32,
    pub(crate) total_leads_found: u64,
    pub(crate) daily_search_count: u32,
    pub(crate) last_reset_date: NaiveDate,
    pub(crate) result_history: HashMap<String, TaskResult>,
}

/// Continuous automation engine for lead generation
pub struct AutomationEngine {
    config: AutomationConfig,
    fetcher: Arc<dyn LeadFetcher>,
    store: Arc<dyn LeadStore>,
    analyzer: Option<Arc<dyn WebsiteAnalyzer>>,
    clock: Arc<dyn Clock>,
    executor: Arc<RetryExecutor>,
    shared: Arc<Mutex<EngineShared>>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    paused: Arc<AtomicBool>,
    events_tx: mpsc::Sender<EngineEvent>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AutomationEngine {
    /// Create an engine and the receiving end of its event channel.
    ///
    /// Fails fast on configuration errors.
    pub fn new(
        config: AutomationConfig,
        fetcher: Arc<dyn LeadFetcher>,
        store: Arc<dyn LeadStore>,
    ) -> Result<(Self, mpsc::Receiver<EngineEvent>)> {
        config.validate()?;
        let (stop_tx, stop_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::channel(64);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let shared = EngineShared {
            status: EngineStatus::Stopped,
            tasks: Vec::new(),
            current_task: None,
            started_at: None,
            error_count: 0,
            total_leads_found: 0,
            daily_search_count: 0,
            last_reset_date: clock.today(),
            result_history: HashMap::new(),
        };
        let engine = Self {
            config,
            fetcher,
            store,
            analyzer: None,
            clock,
            executor: Arc::new(RetryExecutor::new()),
            shared: Arc::new(Mutex::new(shared)),
            stop_tx,
            stop_rx,
            paused: Arc::new(AtomicBool::new(false)),
            events_tx,
            worker: Mutex::new(None),
        };
        Ok((engine, events_rx))
    }

    /// Attach the optional website analyzer
    pub fn with_analyzer(mut self, analyzer: Arc<dyn WebsiteAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    /// Replace the system clock, mainly for tests
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Add a task to the schedule
    pub async fn add_task(&self, task: SearchTask) {
        info!(task_id = %task.id, params = %task.params, "added automation task");
        self.shared.lock().await.tasks.push(task);
    }

    /// Remove every task matching the predicate; true if any was removed
    pub async fn remove_task<F>(&self, predicate: F) -> bool
    where
        F: Fn(&SearchTask) -> bool,
    {
        let mut shared = self.shared.lock().await;
        let before = shared.tasks.len();
        shared.tasks.retain(|task| !predicate(task));
        let removed = before - shared.tasks.len();
        if removed > 0 {
            info!(removed, "removed automation tasks");
        }
        removed > 0
    }

    /// Snapshot of the registered tasks
    pub async fn tasks(&self) -> Vec<SearchTask> {
        self.shared.lock().await.tasks.clone()
    }

    /// Start the engine.
    ///
    /// Returns false, without changing state, when the engine is already
    /// running or no tasks are registered.
    pub async fn start(self: &Arc<Self>) -> bool {
        {
            let mut shared = self.shared.lock().await;
            if matches!(shared.status, EngineStatus::Running | EngineStatus::Paused) {
                warn!("automation engine is already running");
                return false;
            }
            if shared.tasks.is_empty() {
                error!("no tasks configured for automation");
                return false;
            }
            shared.status = EngineStatus::Running;
            shared.started_at = Some(self.clock.now());
            shared.error_count = 0;
            shared.last_reset_date = self.clock.today();
        }

        let _ = self.stop_tx.send(false);
        self.paused.store(false, Ordering::SeqCst);

        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            engine.run_loop().await;
        });
        *self.worker.lock().await = Some(handle);

        info!("automation engine started");
        true
    }

    /// Stop the engine. Idempotent; waits (bounded) for the worker to exit.
    pub async fn stop(&self) {
        {
            let shared = self.shared.lock().await;
            if shared.status == EngineStatus::Stopped {
                return;
            }
        }

        let _ = self.stop_tx.send(true);
        self.paused.store(false, Ordering::SeqCst);

        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            let limit = self.config.timings.shutdown_timeout();
            if tokio::time::timeout(limit, handle).await.is_err() {
                warn!(timeout_ms = limit.as_millis() as u64, "worker did not stop in time");
            }
        }

        self.shared.lock().await.status = EngineStatus::Stopped;
        info!("automation engine stopped");
    }

    /// Pause the engine; valid only while running
    pub async fn pause(&self) -> bool {
        let mut shared = self.shared.lock().await;
        if shared.status != EngineStatus::Running {
            return false;
        }
        shared.status = EngineStatus::Paused;
        self.paused.store(true, Ordering::SeqCst);
        info!("automation engine paused");
        true
    }

    /// Resume a paused engine
    pub async fn resume(&self) -> bool {
        let mut shared = self.shared.lock().await;
        if shared.status != EngineStatus::Paused {
            return false;
        }
        shared.status = EngineStatus::Running;
        self.paused.store(false, Ordering::SeqCst);
        info!("automation engine resumed");
        true
    }

    /// Current status and derived metrics
    pub async fn status(&self) -> EngineSnapshot {
        self.reporter().snapshot().await
    }

    /// Read-only reporter over this engine's state
    pub fn reporter(&self) -> StatusReporter {
        StatusReporter::new(
            Arc::clone(&self.shared),
            Arc::clone(&self.executor),
            Arc::clone(&self.clock),
        )
    }

    /// Retry statistics across all executed tasks
    pub async fn retry_statistics(&self) -> RetryStatistics {
        self.executor.statistics().await
    }

    async fn run_loop(self: Arc<Self>) {
        info!("automation loop started");

        if let Err(e) = self.drive_loop().await {
            error!(error = %e, "automation loop error");
            self.shared.lock().await.status = EngineStatus::Error;
            self.emit(EngineEvent::EngineError {
                error: e.to_string(),
            });
        }

        {
            let mut shared = self.shared.lock().await;
            shared.status = EngineStatus::Stopped;
            shared.current_task = None;
        }
        let snapshot = self.reporter().snapshot().await;
        self.emit(EngineEvent::Completed { snapshot });
        info!("automation loop finished");
    }

    async fn drive_loop(&self) -> Result<()> {
        let mut stop_rx = self.stop_rx.clone();

        loop {
            if *stop_rx.borrow() {
                break;
            }

            if self.paused.load(Ordering::SeqCst) {
                self.idle(self.config.timings.pause_poll(), &mut stop_rx).await;
                continue;
            }

            self.reset_daily_counter_if_needed().await;

            if self.should_stop().await {
                break;
            }

            if !self.within_operating_hours() {
                debug!("outside operating hours, waiting");
                self.idle(self.config.timings.off_hours_wait(), &mut stop_rx).await;
                continue;
            }

            let Some(task) = self.next_ready_task().await else {
                debug!("no tasks ready to run, waiting");
                self.idle(self.config.timings.no_task_wait(), &mut stop_rx).await;
                continue;
            };

            self.execute_task(task).await;
            self.idle(self.config.timings.task_check_interval(), &mut stop_rx).await;
        }

        Ok(())
    }

    /// Sleep for `delay` unless the stop signal fires first
    async fn idle(&self, delay: Duration, stop_rx: &mut watch::Receiver<bool>) {
        if *stop_rx.borrow() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop_rx.changed() => {}
        }
    }

    async fn reset_daily_counter_if_needed(&self) {
        let today = self.clock.today();
        let mut shared = self.shared.lock().await;
        if today != shared.last_reset_date {
            shared.daily_search_count = 0;
            shared.last_reset_date = today;
            info!(%today, "daily search counter reset");
        }
    }

    async fn should_stop(&self) -> bool {
        let shared = self.shared.lock().await;

        if let Some(max) = self.config.max_total_leads {
            if shared.total_leads_found >= max {
                info!(total = shared.total_leads_found, "max total leads reached");
                return true;
            }
        }

        if let (Some(max), Some(started)) = (self.config.max_runtime(), shared.started_at) {
            let elapsed = (self.clock.now() - started).to_std().unwrap_or_default();
            if elapsed >= max {
                info!("max runtime reached");
                return true;
            }
        }

        if shared.error_count >= self.config.stop_on_error_count {
            error!(errors = shared.error_count, "too many task failures");
            return true;
        }

        if shared.daily_search_count >= self.config.daily_search_limit {
            info!(searches = shared.daily_search_count, "daily search limit reached");
            return true;
        }

        false
    }

    fn within_operating_hours(&self) -> bool {
        let (hour, weekday) = self.clock.local_hour_and_weekday();
        operating_window_allows(&self.config, hour, weekday)
    }

    async fn next_ready_task(&self) -> Option<SearchTask> {
        let now = self.clock.now();
        let shared = self.shared.lock().await;
        select_next_task(&shared.tasks, now).cloned()
    }

    async fn execute_task(&self, task: SearchTask) {
        let now = self.clock.now();
        {
            let mut shared = self.shared.lock().await;
            shared.current_task = Some(task.id.clone());
            if let Some(t) = shared.tasks.iter_mut().find(|t| t.id == task.id) {
                t.last_run = Some(now);
            }
        }
        info!(task_id = %task.id, params = %task.params, "executing task");

        let fetcher = Arc::clone(&self.fetcher);
        let store = Arc::clone(&self.store);
        let analyzer = self.analyzer.clone();
        let min_completeness = self.config.min_contact_completeness;
        let skip_processed = self.config.skip_already_processed;
        let auto_analyze = self.config.auto_analyze;
        let params = task.params.clone();

        let operation = move || {
            let fetcher = Arc::clone(&fetcher);
            let store = Arc::clone(&store);
            let analyzer = analyzer.clone();
            let params = params.clone();
            async move {
                run_fetch_cycle(
                    fetcher,
                    store,
                    analyzer,
                    min_completeness,
                    skip_processed,
                    auto_analyze,
                    params,
                )
                .await
            }
        };

        let hook_task_id = task.id.clone();
        let progress_hook = move |attempt: u32, message: &str| {
            debug!(task_id = %hook_task_id, attempt, message, "task progress");
        };

        let result = self
            .executor
            .execute_with_retry(
                &task,
                operation,
                Some(&progress_hook),
                Some(self.stop_rx.clone()),
            )
            .await;

        self.settle_task(&task, result).await;
    }

    /// Record the result, reschedule the task and emit the outcome event
    async fn settle_task(&self, task: &SearchTask, result: TaskResult) {
        let now = self.clock.now();
        let mut shared = self.shared.lock().await;
        shared.result_history.insert(task.id.clone(), result.clone());

        match result.status {
            TaskStatus::Success => {
                let summary = result.summary.unwrap_or_default();
                shared.total_leads_found += summary.new_leads;
                shared.daily_search_count += 1;
                if let Some(t) = shared.tasks.iter_mut().find(|t| t.id == task.id) {
                    t.next_run = Some(now + self.config.search_interval());
                }
                let total = shared.total_leads_found;
                shared.current_task = None;
                drop(shared);

                info!(
                    task_id = %task.id,
                    new_leads = summary.new_leads,
                    total_found = summary.total_found,
                    "task completed"
                );
                metrics::counter!("leadflow_leads_found_total", summary.new_leads);
                self.emit(EngineEvent::Progress {
                    task_id: task.id.clone(),
                    new_leads: summary.new_leads,
                    total_leads: total,
                    attempts: result.attempts,
                });
            }
            TaskStatus::Cancelled => {
                // Engine is shutting down; record the result and leave the
                // schedule untouched.
                shared.current_task = None;
            }
            _ => {
                shared.error_count += 1;
                let cooldown = error_cooldown(shared.error_count);
                if let Some(t) = shared.tasks.iter_mut().find(|t| t.id == task.id) {
                    t.next_run = Some(now + chrono::Duration::seconds(cooldown.as_secs() as i64));
                }
                shared.current_task = None;
                let error = result
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string());
                drop(shared);

                warn!(
                    task_id = %task.id,
                    status = ?result.status,
                    error = %error,
                    cooldown_secs = cooldown.as_secs(),
                    "task failed, cooling down"
                );
                self.emit(EngineEvent::TaskFailed {
                    task_id: task.id.clone(),
                    error,
                    attempts: result.attempts,
                });
            }
        }
    }

    fn emit(&self, event: EngineEvent) {
        match self.events_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(?event, "dropping engine event, receiver not keeping up");
            }
            Err(TrySendError::Closed(_)) => {
                debug!("engine event receiver closed");
            }
        }
    }
}

/// One fetch-filter-store-analyze cycle; the operation the executor retries.
///
/// Every failure here must surface as an error so the retry machinery sees
/// it — except analyzer failures, which are logged and attached as missing
/// metadata rather than failing the whole cycle.
async fn run_fetch_cycle(
    fetcher: Arc<dyn LeadFetcher>,
    store: Arc<dyn LeadStore>,
    analyzer: Option<Arc<dyn WebsiteAnalyzer>>,
    min_completeness: u8,
    skip_processed: bool,
    auto_analyze: bool,
    params: Value,
) -> Result<FetchSummary> {
    let leads = fetcher.fetch(&params).await?;
    let total_found = leads.len() as u64;
    let mut new_leads = 0u64;

    for lead in &leads {
        if skip_processed && store.exists(&lead.key()).await? {
            continue;
        }
        if !lead.passes_quality(min_completeness) {
            continue;
        }

        let lead_id = store.store(lead).await?;
        new_leads += 1;
        metrics::counter!("leadflow_leads_stored_total", 1);

        if auto_analyze {
            if let (Some(analyzer), Some(website)) = (&analyzer, &lead.website) {
                match analyzer.analyze(website).await {
                    Ok(analysis) => {
                        if let Err(e) = store.attach_analysis(&lead_id, analysis).await {
                            warn!(website = %website, error = %e, "failed to record analysis");
                        }
                    }
                    Err(e) => {
                        warn!(website = %website, error = %e, "website analysis failed");
                    }
                }
            }
        }
    }

    Ok(FetchSummary {
        new_leads,
        total_found,
    })
}

/// Whether the operating window permits running at the given local time
fn operating_window_allows(config: &AutomationConfig, hour: u32, weekday: Weekday) -> bool {
    if !config.weekend_enabled && matches!(weekday, Weekday::Sat | Weekday::Sun) {
        return false;
    }
    if config.start_hour <= config.end_hour {
        config.start_hour <= hour && hour < config.end_hour
    } else {
        // Overnight window wrapping midnight, e.g. 22:00 - 06:00
        hour >= config.start_hour || hour < config.end_hour
    }
}

/// Pick the next eligible task: lowest priority number first, then the task
/// that has waited longest (never-run tasks win ties)
fn select_next_task(tasks: &[SearchTask], now: DateTime<Utc>) -> Option<&SearchTask> {
    tasks
        .iter()
        .filter(|task| task.is_due(now))
        .min_by_key(|task| (task.priority, task.last_run.unwrap_or(DateTime::<Utc>::MIN_UTC)))
}

/// Cooldown applied to a task after a failed execution: doubles with the
/// engine-wide error count, capped at one hour
fn error_cooldown(error_count: u32) -> Duration {
    let exp = error_count.min(5);
    let secs = 60u64.saturating_mul(1u64 << exp);
    Duration::from_secs(secs.min(3600))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{InMemoryLeadStore, Lead};
    use crate::retry::RetryPolicy;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    /// Clock pinned to a fixed instant, mid-window on a Wednesday
    struct FixedClock {
        now: DateTime<Utc>,
        today: NaiveDate,
        hour: u32,
        weekday: Weekday,
    }

    impl FixedClock {
        fn weekday_morning() -> Self {
            Self {
                now: Utc::now(),
                today: NaiveDate::from_ymd_opt(2025, 6, 11).unwrap(),
                hour: 10,
                weekday: Weekday::Wed,
            }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.now
        }
        fn today(&self) -> NaiveDate {
            self.today
        }
        fn local_hour_and_weekday(&self) -> (u32, Weekday) {
            (self.hour, self.weekday)
        }
    }

    /// Fetcher that fails a configurable number of times, then returns leads
    struct FlakyFetcher {
        failures: u32,
        calls: AtomicU32,
        leads: Vec<Lead>,
    }

    impl FlakyFetcher {
        fn new(failures: u32, leads: Vec<Lead>) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                leads,
            }
        }
    }

    #[async_trait]
    impl LeadFetcher for FlakyFetcher {
        async fn fetch(&self, _params: &Value) -> Result<Vec<Lead>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(crate::error::LeadFlowError::Fetch("upstream unavailable".into()))
            } else {
                Ok(self.leads.clone())
            }
        }
    }

    fn sample_leads(count: usize) -> Vec<Lead> {
        (0..count)
            .map(|i| Lead::new(format!("Business {i}"), format!("{i} High Street")).with_completeness(90))
            .collect()
    }

    fn test_config() -> AutomationConfig {
        AutomationConfig {
            start_hour: 0,
            end_hour: 24,
            weekend_enabled: true,
            auto_analyze: false,
            timings: LoopTimings::testing(),
            ..Default::default()
        }
    }

    fn engine_with(
        config: AutomationConfig,
        fetcher: Arc<dyn LeadFetcher>,
    ) -> (Arc<AutomationEngine>, mpsc::Receiver<EngineEvent>) {
        let store = Arc::new(InMemoryLeadStore::new());
        let (engine, events) = AutomationEngine::new(config, fetcher, store).unwrap();
        let engine = engine.with_clock(Arc::new(FixedClock::weekday_morning()));
        (Arc::new(engine), events)
    }

    #[test]
    fn operating_window_same_day() {
        let config = AutomationConfig {
            start_hour: 9,
            end_hour: 17,
            ..Default::default()
        };
        assert!(operating_window_allows(&config, 9, Weekday::Wed));
        assert!(operating_window_allows(&config, 16, Weekday::Wed));
        assert!(!operating_window_allows(&config, 17, Weekday::Wed));
        assert!(!operating_window_allows(&config, 8, Weekday::Wed));
    }

    #[test]
    fn operating_window_overnight() {
        let config = AutomationConfig {
            start_hour: 22,
            end_hour: 6,
            weekend_enabled: true,
            ..Default::default()
        };
        assert!(operating_window_allows(&config, 23, Weekday::Wed));
        assert!(operating_window_allows(&config, 5, Weekday::Wed));
        assert!(!operating_window_allows(&config, 12, Weekday::Wed));
    }

    #[test]
    fn operating_window_blocks_weekends_unless_enabled() {
        let config = AutomationConfig {
            start_hour: 9,
            end_hour: 17,
            weekend_enabled: false,
            ..Default::default()
        };
        assert!(!operating_window_allows(&config, 10, Weekday::Sat));
        assert!(!operating_window_allows(&config, 10, Weekday::Sun));

        let weekend = AutomationConfig {
            weekend_enabled: true,
            ..config
        };
        assert!(operating_window_allows(&weekend, 10, Weekday::Sat));
    }

    #[test]
    fn task_selection_prefers_priority_then_oldest() {
        let now = Utc::now();
        let t0 = now - chrono::Duration::hours(2);
        let t1 = now - chrono::Duration::hours(1);

        let mut a = SearchTask::new(json!({})).with_id("A").with_priority(2);
        a.last_run = Some(t0);
        let mut b = SearchTask::new(json!({})).with_id("B").with_priority(1);
        b.last_run = Some(t1);
        let c = SearchTask::new(json!({})).with_id("C").with_priority(1);

        let mut tasks = vec![a, b, c];

        let first = select_next_task(&tasks, now).unwrap().id.clone();
        assert_eq!(first, "C");

        tasks.retain(|t| t.id != "C");
        let second = select_next_task(&tasks, now).unwrap().id.clone();
        assert_eq!(second, "B");

        tasks.retain(|t| t.id != "B");
        let third = select_next_task(&tasks, now).unwrap().id.clone();
        assert_eq!(third, "A");
    }

    #[test]
    fn task_selection_skips_disabled_and_not_due() {
        let now = Utc::now();
        let disabled = SearchTask::new(json!({})).with_id("off").disabled();
        let mut later = SearchTask::new(json!({})).with_id("later");
        later.next_run = Some(now + chrono::Duration::hours(1));

        assert!(select_next_task(&[disabled, later], now).is_none());
    }

    #[test]
    fn error_cooldown_doubles_and_caps() {
        assert_eq!(error_cooldown(1), Duration::from_secs(120));
        assert_eq!(error_cooldown(2), Duration::from_secs(240));
        assert_eq!(error_cooldown(5), Duration::from_secs(1920));
        // Exponent is capped at 5, then the whole cooldown at one hour.
        assert_eq!(error_cooldown(6), Duration::from_secs(1920));
        assert_eq!(error_cooldown(100), Duration::from_secs(1920));
    }

    #[test]
    fn config_validation_rejects_bad_hours() {
        let config = AutomationConfig {
            start_hour: 24,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AutomationConfig {
            end_hour: 25,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        assert!(AutomationConfig::default().validate().is_ok());
    }

    #[tokio::test]
    async fn start_requires_tasks() {
        let (engine, _events) = engine_with(
            test_config(),
            Arc::new(FlakyFetcher::new(0, sample_leads(1))),
        );
        assert!(!engine.start().await);
        assert_eq!(engine.status().await.status, EngineStatus::Stopped);
    }

    #[tokio::test]
    async fn start_twice_fails_second_time() {
        let (engine, _events) = engine_with(
            test_config(),
            Arc::new(FlakyFetcher::new(0, sample_leads(1))),
        );
        engine.add_task(SearchTask::new(json!({"location": "London"}))).await;

        assert!(engine.start().await);
        assert!(!engine.start().await);
        engine.stop().await;
    }

    #[tokio::test]
    async fn pause_and_resume_only_from_valid_states() {
        let (engine, _events) = engine_with(
            test_config(),
            Arc::new(FlakyFetcher::new(0, sample_leads(1))),
        );
        engine.add_task(SearchTask::new(json!({"location": "London"}))).await;

        assert!(!engine.pause().await, "pause from stopped must fail");
        assert!(!engine.resume().await, "resume from stopped must fail");

        assert!(engine.start().await);
        assert!(engine.pause().await);
        assert_eq!(engine.status().await.status, EngineStatus::Paused);
        assert!(!engine.pause().await, "pause while paused must fail");
        assert!(engine.resume().await);
        assert_eq!(engine.status().await.status, EngineStatus::Running);

        engine.stop().await;
        assert_eq!(engine.status().await.status, EngineStatus::Stopped);
    }

    #[tokio::test]
    async fn daily_counter_resets_on_date_change() {
        let (engine, _events) = engine_with(
            test_config(),
            Arc::new(FlakyFetcher::new(0, sample_leads(1))),
        );

        {
            let mut shared = engine.shared.lock().await;
            shared.daily_search_count = 50;
            shared.last_reset_date = NaiveDate::from_ymd_opt(2025, 6, 10).unwrap();
        }

        engine.reset_daily_counter_if_needed().await;

        let shared = engine.shared.lock().await;
        assert_eq!(shared.daily_search_count, 0);
        assert_eq!(
            shared.last_reset_date,
            NaiveDate::from_ymd_opt(2025, 6, 11).unwrap()
        );
    }

    #[tokio::test]
    async fn stop_condition_triggers_at_exact_boundary() {
        let config = AutomationConfig {
            max_total_leads: Some(10),
            ..test_config()
        };
        let (engine, _events) = engine_with(
            config,
            Arc::new(FlakyFetcher::new(0, sample_leads(1))),
        );

        engine.shared.lock().await.total_leads_found = 9;
        assert!(!engine.should_stop().await);

        engine.shared.lock().await.total_leads_found = 10;
        assert!(engine.should_stop().await);
    }

    #[tokio::test]
    async fn stop_condition_counts_errors_and_daily_limit() {
        let config = AutomationConfig {
            stop_on_error_count: 3,
            daily_search_limit: 5,
            ..test_config()
        };
        let (engine, _events) = engine_with(
            config,
            Arc::new(FlakyFetcher::new(0, sample_leads(1))),
        );

        engine.shared.lock().await.error_count = 3;
        assert!(engine.should_stop().await);

        engine.shared.lock().await.error_count = 0;
        engine.shared.lock().await.daily_search_count = 5;
        assert!(engine.should_stop().await);
    }

    #[tokio::test]
    async fn full_cycle_retries_then_succeeds_and_stops_on_lead_limit() {
        let config = AutomationConfig {
            max_total_leads: Some(3),
            skip_already_processed: true,
            min_contact_completeness: 0,
            ..test_config()
        };
        let fetcher = Arc::new(FlakyFetcher::new(1, sample_leads(3)));
        let (engine, mut events) = engine_with(config, fetcher);

        let task = SearchTask::new(json!({"location": "London", "category": "Technology"}))
            .with_id("london-tech")
            .with_retry_policy(RetryPolicy::fixed(2, Duration::ZERO));
        engine.add_task(task).await;

        assert!(engine.start().await);

        let progress = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("engine should emit progress")
            .expect("event channel open");
        match progress {
            EngineEvent::Progress {
                task_id,
                new_leads,
                total_leads,
                attempts,
            } => {
                assert_eq!(task_id, "london-tech");
                assert_eq!(new_leads, 3);
                assert_eq!(total_leads, 3);
                assert_eq!(attempts, 2);
            }
            other => panic!("expected progress event, got {other:?}"),
        }

        // Lead limit of 3 is now met, so the loop must wind itself down.
        let completed = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("engine should emit completion")
            .expect("event channel open");
        match completed {
            EngineEvent::Completed { snapshot } => {
                assert_eq!(snapshot.status, EngineStatus::Stopped);
                assert_eq!(snapshot.statistics.total_leads_found, 3);
                assert_eq!(snapshot.statistics.daily_search_count, 1);
                let result = &snapshot.recent_results["london-tech"];
                assert_eq!(result.status, TaskStatus::Success);
                assert_eq!(result.attempts, 2);
            }
            other => panic!("expected completion event, got {other:?}"),
        }

        let tasks = engine.tasks().await;
        assert!(tasks[0].next_run.is_some(), "task must be rescheduled");
        assert!(tasks[0].last_run.is_some());

        engine.stop().await;
    }

    #[tokio::test]
    async fn failed_execution_sets_cooldown_and_emits_error_event() {
        let config = test_config();
        // Fetcher that always fails; one attempt per execution.
        let fetcher = Arc::new(FlakyFetcher::new(u32::MAX, Vec::new()));
        let (engine, mut events) = engine_with(config, fetcher);

        let task = SearchTask::new(json!({"location": "Leeds"}))
            .with_id("leeds")
            .with_retry_policy(RetryPolicy::fixed(1, Duration::ZERO));
        engine.add_task(task).await;

        assert!(engine.start().await);

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("engine should emit failure")
            .expect("event channel open");
        match event {
            EngineEvent::TaskFailed {
                task_id, attempts, ..
            } => {
                assert_eq!(task_id, "leeds");
                assert_eq!(attempts, 1);
            }
            other => panic!("expected task-failed event, got {other:?}"),
        }

        engine.stop().await;

        let snapshot = engine.status().await;
        assert_eq!(snapshot.statistics.error_count, 1);
        let tasks = engine.tasks().await;
        let next_run = tasks[0].next_run.expect("cooldown must be scheduled");
        let clock_now = FixedClock::weekday_morning().now;
        // error_count 1 -> 120s cooldown relative to the engine clock.
        assert!(next_run > clock_now + chrono::Duration::seconds(60));

        let stats = engine.retry_statistics().await;
        assert_eq!(stats.aggregate.failures, 1);
    }

    #[tokio::test]
    async fn remove_task_matches_predicate() {
        let (engine, _events) = engine_with(
            test_config(),
            Arc::new(FlakyFetcher::new(0, sample_leads(1))),
        );
        engine
            .add_task(SearchTask::new(json!({"location": "London"})).with_id("a"))
            .await;
        engine
            .add_task(SearchTask::new(json!({"location": "Leeds"})).with_id("b"))
            .await;

        assert!(engine.remove_task(|t| t.id == "a").await);
        assert!(!engine.remove_task(|t| t.id == "a").await);
        assert_eq!(engine.tasks().await.len(), 1);
    }
}
