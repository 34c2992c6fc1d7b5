//! Herald Core Library
//!
//! Zone registry, task model, priority policy, the PA lock engine with its
//! liveness monitor, the schedule queue, and the serialized arbiter service
//! that publishes lock state to observers.

pub mod arbiter;
pub mod config;
pub mod error;
pub mod hub;
pub mod invariants;
pub mod lock;
pub mod models;
pub mod output;
pub mod policy;
pub mod registry;
pub mod scheduler;
pub mod view;

pub use arbiter::Arbiter;
pub use config::{HeraldConfig, SchedulerConfig, ServerConfig, TimingConfig, ZonesConfig};
pub use error::{Error, Result};
pub use hub::StateHub;
pub use lock::{Admission, LivenessMonitor, LockEngine, Release, Verdict};
pub use models::*;
pub use output::{ActivityLog, AudioOutput, TracingActivityLog, TracingOutput};
pub use policy::{decide, is_higher_priority, priority_of, Decision};
pub use registry::{ZoneRegistry, ZoneSelection, ALL_ZONES};
pub use scheduler::ScheduleQueue;
pub use view::{reconcile, Controls, Reconcile};
