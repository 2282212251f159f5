//! Status/event bus: ordered per-job events, live subscriptions and the
//! derived status overlay.

pub mod bus;
pub mod status;

pub use bus::EventBus;
pub use status::{fold, StatusOverlay};
