pub mod handlers;
pub mod routes;
pub mod sse;

pub use routes::*;

use crate::pipeline::{Orchestrator, PipelineContext};
use std::sync::Arc;
use std::time::Instant;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            started_at: Instant::now(),
        }
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        self.orchestrator.context()
    }
}
