//! Published lock state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ReleasedTask, Task, TaskType};

/// System-wide broadcast mode. `Emergency` overrides everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    Idle,
    Broadcast,
    Schedule,
    Background,
    Emergency,
}

impl Mode {
    pub fn for_task(task: Option<&Task>) -> Self {
        match task.map(|t| t.task_type) {
            None => Mode::Idle,
            Some(TaskType::Emergency) => Mode::Emergency,
            Some(TaskType::Voice) | Some(TaskType::Text) => Mode::Broadcast,
            Some(TaskType::Scheduled) => Mode::Schedule,
            Some(TaskType::Background) => Mode::Background,
        }
    }
}

/// Immutable view of the lock, published on every transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Monotonic; observers discard anything older than what they hold
    pub version: u64,
    pub mode: Mode,
    pub active_task: Option<Task>,
    /// Most recently finished task, while still retained
    pub last_released: Option<ReleasedTask>,
    pub emitted_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn idle(version: u64, now: DateTime<Utc>) -> Self {
        Self {
            version,
            mode: Mode::Idle,
            active_task: None,
            last_released: None,
            emitted_at: now,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.active_task.is_none()
    }

    pub fn holder(&self) -> Option<&str> {
        self.active_task.as_ref().map(|t| t.owner.as_str())
    }

    pub fn is_newer_than(&self, other: &Snapshot) -> bool {
        self.version > other.version
    }
}
