/*!
# LeadFlow CLI

Command-line interface for the LeadFlow automation engine.

The CLI provides tools for:
- Validating an automation configuration file
- Printing the preset campaign set
- Dry-running an automation plan against simulated collaborators

The simulator wires the real engine to a deterministic in-memory fetcher and
store, so a schedule, its retry behavior and its stop conditions can be
exercised headlessly before pointing the engine at live collaborators.
*/

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use leadflow_core::campaigns::{campaign_task, preset_campaigns};
use leadflow_core::error::LeadFlowError;
use leadflow_core::{
    AutomationConfig, AutomationEngine, EngineEvent, InMemoryLeadStore, Lead, LeadFetcher,
    LoopTimings, RetryPolicy, SearchTask, WebsiteAnalyzer,
};

/// LeadFlow - automation scheduling for lead generation
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate an automation configuration file
    Validate {
        /// Path to the configuration file (TOML or JSON)
        #[arg(long, short)]
        config: PathBuf,
    },

    /// Print the preset campaign set as JSON
    Campaigns,

    /// Dry-run an automation plan against simulated collaborators
    Simulate {
        /// Path to the configuration file; defaults apply when omitted
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Stop after this many task executions
        #[arg(long, default_value = "5")]
        cycles: u64,

        /// Stop after this many seconds regardless of progress
        #[arg(long, default_value = "60")]
        max_seconds: u64,

        /// Keep the configured loop timings instead of the fast test profile
        #[arg(long)]
        real_timings: bool,

        /// Ignore the operating window so the simulation runs at any hour
        #[arg(long)]
        ignore_window: bool,

        /// Make every Nth fetch fail to exercise retry behavior; 0 disables
        #[arg(long, default_value = "4")]
        fail_every: u32,
    },
}

/// On-disk configuration: engine settings plus an optional task list
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CliConfig {
    automation: AutomationConfig,
    tasks: Vec<TaskSpec>,
}

/// One task entry in the configuration file
#[derive(Debug, Clone, Deserialize)]
struct TaskSpec {
    location: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default = "default_limit")]
    limit: u32,
    #[serde(default = "default_priority")]
    priority: u8,
    #[serde(default = "default_max_attempts")]
    max_attempts: u32,
}

fn default_limit() -> u32 {
    50
}

fn default_priority() -> u8 {
    1
}

fn default_max_attempts() -> u32 {
    3
}

impl TaskSpec {
    fn into_task(self) -> SearchTask {
        let policy = RetryPolicy::exponential(self.max_attempts, Duration::from_secs(5), 2.0)
            .with_jitter(0.1);
        campaign_task(&self.location, self.category.as_deref(), self.limit, self.priority)
            .with_retry_policy(policy)
    }
}

/// Deterministic fetcher used by the simulator. Generates a stable set of
/// leads per location and fails every Nth call when configured to.
struct SimulatedFetcher {
    fail_every: u32,
    calls: AtomicU32,
}

impl SimulatedFetcher {
    fn new(fail_every: u32) -> Self {
        Self {
            fail_every,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl LeadFetcher for SimulatedFetcher {
    async fn fetch(&self, params: &Value) -> leadflow_core::Result<Vec<Lead>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_every > 0 && call % self.fail_every == 0 {
            return Err(LeadFlowError::Fetch(format!(
                "simulated outage on call {call}"
            )));
        }

        let location = params
            .get("location")
            .and_then(Value::as_str)
            .unwrap_or("Unknown");
        let category = params.get("category").and_then(Value::as_str);
        let limit = params
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(10)
            .min(25) as usize;

        let leads = (0..limit)
            .map(|i| {
                let name = match category {
                    Some(category) => format!("{location} {category} Ltd {i}"),
                    None => format!("{location} Business {i}"),
                };
                let mut lead = Lead::new(name, format!("{i} Market Street, {location}"))
                    .with_completeness(((i * 13) % 100) as u8);
                if i % 3 == 0 {
                    lead = lead.with_website(
                        format!("https://example-{location}-{i}.co.uk").to_lowercase(),
                    );
                }
                lead
            })
            .collect();
        Ok(leads)
    }
}

/// Analyzer stand-in returning a stable payload per website
struct SimulatedAnalyzer;

#[async_trait]
impl WebsiteAnalyzer for SimulatedAnalyzer {
    async fn analyze(&self, website: &str) -> leadflow_core::Result<Value> {
        Ok(json!({
            "website": website,
            "score": (website.len() % 100) as u64,
            "issues": [],
        }))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => validate(&config),
        Commands::Campaigns => campaigns(),
        Commands::Simulate {
            config,
            cycles,
            max_seconds,
            real_timings,
            ignore_window,
            fail_every,
        } => {
            simulate(
                config.as_deref(),
                cycles,
                max_seconds,
                real_timings,
                ignore_window,
                fail_every,
            )
            .await
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<CliConfig> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path));
    }
    let settings = builder
        .add_source(config::Environment::with_prefix("LEADFLOW").separator("__"))
        .build()?;
    Ok(settings.try_deserialize()?)
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let cfg = load_config(Some(path))?;
    cfg.automation.validate()?;
    for task in &cfg.tasks {
        if task.location.trim().is_empty() {
            anyhow::bail!("task location must not be empty");
        }
        if task.max_attempts == 0 {
            anyhow::bail!("task max_attempts must be >= 1 ({})", task.location);
        }
    }
    println!(
        "configuration OK: {} task(s), window {:02}:00-{:02}:00, daily limit {}",
        cfg.tasks.len(),
        cfg.automation.start_hour,
        cfg.automation.end_hour,
        cfg.automation.daily_search_limit,
    );
    Ok(())
}

fn campaigns() -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&preset_campaigns())?);
    Ok(())
}

async fn simulate(
    config: Option<&Path>,
    cycles: u64,
    max_seconds: u64,
    real_timings: bool,
    ignore_window: bool,
    fail_every: u32,
) -> anyhow::Result<()> {
    let mut cfg = load_config(config)?;
    if !real_timings {
        cfg.automation.timings = LoopTimings::testing();
    }
    if ignore_window {
        cfg.automation.start_hour = 0;
        cfg.automation.end_hour = 24;
        cfg.automation.weekend_enabled = true;
    }

    let tasks: Vec<SearchTask> = if cfg.tasks.is_empty() {
        info!("no tasks configured, using preset campaigns");
        preset_campaigns()
    } else {
        cfg.tasks.iter().cloned().map(TaskSpec::into_task).collect()
    };

    let store = Arc::new(InMemoryLeadStore::new());
    let fetcher = Arc::new(SimulatedFetcher::new(fail_every));
    let (engine, mut events) = AutomationEngine::new(cfg.automation, fetcher, store.clone())?;
    let engine = Arc::new(engine.with_analyzer(Arc::new(SimulatedAnalyzer)));

    for task in tasks {
        engine.add_task(task).await;
    }
    if !engine.start().await {
        anyhow::bail!("engine failed to start");
    }
    info!(cycles, max_seconds, "simulation running");

    let deadline = tokio::time::sleep(Duration::from_secs(max_seconds));
    tokio::pin!(deadline);
    let mut executions = 0u64;

    loop {
        tokio::select! {
            _ = &mut deadline => {
                info!("simulation time limit reached");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break;
            }
            event = events.recv() => {
                match event {
                    Some(EngineEvent::Progress { task_id, new_leads, total_leads, attempts }) => {
                        info!(%task_id, new_leads, total_leads, attempts, "task succeeded");
                        executions += 1;
                    }
                    Some(EngineEvent::TaskFailed { task_id, error, attempts }) => {
                        warn!(%task_id, error = %error, attempts, "task failed");
                        executions += 1;
                    }
                    Some(EngineEvent::EngineError { error }) => {
                        warn!(error = %error, "engine error");
                    }
                    Some(EngineEvent::Completed { .. }) => {
                        info!("engine finished on its own");
                        break;
                    }
                    None => break,
                }
                if executions >= cycles {
                    info!(executions, "requested cycles finished");
                    break;
                }
            }
        }
    }

    engine.stop().await;

    let snapshot = engine.status().await;
    let stats = engine.retry_statistics().await;
    info!(stored = store.len().await, "simulation finished");
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
