//! Job orchestration: the shared context, the orchestrator that moves jobs
//! through their phases, per-task handlers and the worker pool that runs them.

pub mod context;
pub mod handlers;
pub mod orchestrator;
pub mod worker;

pub use context::PipelineContext;
pub use orchestrator::{
    end_pct, parse_pct, start_pct, Orchestrator, RecoveryReport, Submission, CODE_CANCELLED,
};
pub use worker::{process, WorkerPool};
