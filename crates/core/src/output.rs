//! Collaborators outside the arbitration core
//!
//! Audio rendering and activity persistence live elsewhere. The arbiter calls
//! these hooks while it holds its lock, in transition order, so
//! implementations must return quickly and hand real work to their own tasks.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::Result;
use crate::models::{LockEvent, ReleasedTask, Task};

/// Sink for whatever the lock holder plays
pub trait AudioOutput: Send + Sync {
    /// A task took the output. Preparing tasks start with the intro chime.
    fn task_started(&self, task: &Task);

    /// One chunk of live audio for the active voice task
    fn play_chunk(&self, task: &Task, data: &[u8]) -> Result<()>;

    /// The task lost the output; stop immediately
    fn task_stopped(&self, released: &ReleasedTask);

    /// Zones or pause state of the running task changed
    fn task_updated(&self, _task: &Task) {}
}

/// Audit trail of lock transitions
pub trait ActivityLog: Send + Sync {
    fn record(&self, at: DateTime<Utc>, event: &LockEvent);
}

/// Output that only logs, used when no audio backend is attached
#[derive(Debug, Default)]
pub struct TracingOutput;

impl AudioOutput for TracingOutput {
    fn task_started(&self, task: &Task) {
        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            zones = ?task.zones,
            chime = task.task_type.has_preparation(),
            "Output started"
        );
    }

    fn play_chunk(&self, task: &Task, data: &[u8]) -> Result<()> {
        debug!(task_id = %task.id, bytes = data.len(), "Output chunk");
        Ok(())
    }

    fn task_stopped(&self, released: &ReleasedTask) {
        info!(task_id = %released.task.id, reason = %released.reason, "Output stopped");
    }

    fn task_updated(&self, task: &Task) {
        debug!(task_id = %task.id, zones = ?task.zones, paused = task.paused, "Output updated");
    }
}

/// Activity log written to the tracing pipeline
#[derive(Debug, Default)]
pub struct TracingActivityLog;

impl ActivityLog for TracingActivityLog {
    fn record(&self, at: DateTime<Utc>, event: &LockEvent) {
        let action = match event {
            LockEvent::Admitted(_) => "started",
            LockEvent::Activated(_) => "live",
            LockEvent::Completing(_) => "completing",
            LockEvent::Preempted { .. } => "interrupted",
            LockEvent::Released(_) => "stopped",
            LockEvent::Resumed(_) => "resumed",
            LockEvent::ZonesChanged(_) => "zones-changed",
            LockEvent::PauseChanged(_) => "pause-changed",
        };
        info!(
            target: "herald::activity",
            at = %at,
            owner = %event.owner(),
            task_id = %event.task_id(),
            action,
            "Activity"
        );
    }
}
