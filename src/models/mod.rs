pub mod artifact;
pub mod event;
pub mod job;
pub mod snapshot;
pub mod task;

pub use artifact::*;
pub use event::*;
pub use job::*;
pub use snapshot::*;
pub use task::*;
