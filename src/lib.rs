//! Provis pipeline: uploads a zipped repository, analyses it through a
//! queue of idempotent tasks, stores versioned artifacts and streams
//! progress events to clients.

pub mod analysis;
pub mod api;
pub mod artifacts;
pub mod config;
pub mod error;
pub mod events;
pub mod ingest;
pub mod limits;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod queue;
pub mod state;

pub use config::Config;
pub use error::{AppError, Result};
