/*!
# LeadFlow Core

Core library for LeadFlow, an automation engine that runs recurring
lead-generation fetch tasks on a schedule.

This library provides the building blocks for unattended lead collection:

- Retry policies with configurable backoff strategies and jitter
- A retry executor that drives fetch operations and tracks statistics
- The automation engine: a controllable background loop with operating-hour
  gating, stop conditions and pause/resume
- Status reporting over engine state for UIs and dashboards
- Narrow collaborator traits for fetching, storage and website analysis
*/

pub mod campaigns;
pub mod clock;
pub mod collaborators;
pub mod engine;
pub mod error;
pub mod executor;
pub mod retry;
pub mod status;
pub mod task;

pub use error::Result;

pub use clock::{Clock, SystemClock};
pub use collaborators::{InMemoryLeadStore, Lead, LeadFetcher, LeadStore, WebsiteAnalyzer};
pub use engine::{AutomationConfig, AutomationEngine, EngineEvent, EngineStatus, LoopTimings};
pub use executor::{RetryExecutor, RetryStatistics};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use status::{EngineSnapshot, StatusReporter};
/// Re-export core types for convenience
pub use task::{FetchSummary, SearchTask, TaskResult, TaskStatus};
