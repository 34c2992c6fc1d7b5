//! Liveness monitor - releases holders whose owner has gone silent

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::{LockEngine, Release};
use crate::config::TimingConfig;
use crate::models::{ReleaseReason, Task, TaskState, TaskType, SYSTEM_OWNER};

/// Outcome of checking the holder against the clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Alive,
    /// Finite content has run past its completion deadline
    Finished,
    /// No proof of life within the timeout, or paused for longer than it
    Abandoned,
}

#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    timing: TimingConfig,
}

impl LivenessMonitor {
    pub fn new(timing: TimingConfig) -> Self {
        Self { timing }
    }

    pub fn verdict(&self, task: &Task, now: DateTime<Utc>) -> Verdict {
        // Never expired; cleared only by a manual stop
        if task.task_type == TaskType::Emergency {
            return Verdict::Alive;
        }
        if task.completion_deadline.is_some_and(|d| now >= d) {
            return Verdict::Finished;
        }
        let timeout = self.timing.liveness_timeout(task.task_type);
        // Heartbeats keep a paused task registered, not held forever
        if task.paused && task.paused_since.is_some_and(|since| now - since > timeout) {
            return Verdict::Abandoned;
        }
        if !task.task_type.requires_heartbeat() || task.in_grace(now) {
            return Verdict::Alive;
        }

        // Silence counts from the end of the chime at the earliest
        let anchor = task.last_heartbeat_at.max(task.grace_deadline);
        if now - anchor > timeout {
            Verdict::Abandoned
        } else {
            Verdict::Alive
        }
    }

    /// Check the current holder and release it if it is finished or
    /// abandoned. Finished content is first marked completing and released
    /// on the following pass. Also drops expired released-task records.
    pub fn sweep(&self, engine: &mut LockEngine, now: DateTime<Utc>) -> Option<Release> {
        engine.prune_released(now);
        let holder = engine.holder()?;
        let task_id = holder.id;
        let reason = match self.verdict(holder, now) {
            Verdict::Alive => return None,
            Verdict::Finished if holder.state != TaskState::Completing => {
                engine.begin_completion(task_id, now);
                return None;
            }
            Verdict::Finished => {
                debug!(task_id = %task_id, "Content finished, releasing");
                ReleaseReason::NaturalCompletion
            }
            Verdict::Abandoned => {
                info!(
                    task_id = %task_id,
                    owner = %holder.owner,
                    last_heartbeat = %holder.last_heartbeat_at,
                    paused_since = ?holder.paused_since,
                    "Holder abandoned, releasing"
                );
                ReleaseReason::Timeout
            }
        };

        match engine.release(task_id, SYSTEM_OWNER, reason, now) {
            Ok(release) => release,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Liveness release failed");
                None
            }
        }
    }
}
