//! Keeper runtime: the rebalancing pipeline and its scheduler.

mod pipeline;
mod scheduler;

pub use pipeline::{PipelineRunner, PipelineStage, RebalancePipeline, RunOutcome};
pub use scheduler::{Scheduler, SchedulerStats, StatsSnapshot};
