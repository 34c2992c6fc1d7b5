//! Data models for Herald

mod event;
mod schedule;
mod snapshot;
mod task;

pub use event::*;
pub use schedule::*;
pub use snapshot::*;
pub use task::*;
