//! Lock transition events

use serde::{Deserialize, Serialize};

use super::{OwnerId, ReleasedTask, Task, TaskId, TaskType};

/// A single transition of the lock engine.
///
/// Snapshots carry the resulting state; events carry the edge so that a
/// specific owner can be told it lost the lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LockEvent {
    Admitted(Task),
    /// Preparation finished (or first proof of life arrived)
    Activated(Task),
    /// Finite content reached its completion deadline; release follows
    Completing(Task),
    Preempted {
        released: ReleasedTask,
        by: TaskId,
        by_type: TaskType,
    },
    Released(ReleasedTask),
    /// A suspended background task took the lock back
    Resumed(Task),
    ZonesChanged(Task),
    PauseChanged(Task),
}

impl LockEvent {
    /// Owner whose task this event concerns
    pub fn owner(&self) -> &OwnerId {
        match self {
            LockEvent::Admitted(task)
            | LockEvent::Activated(task)
            | LockEvent::Completing(task)
            | LockEvent::Resumed(task)
            | LockEvent::ZonesChanged(task)
            | LockEvent::PauseChanged(task) => &task.owner,
            LockEvent::Preempted { released, .. } | LockEvent::Released(released) => {
                &released.task.owner
            }
        }
    }

    pub fn task_id(&self) -> TaskId {
        match self {
            LockEvent::Admitted(task)
            | LockEvent::Activated(task)
            | LockEvent::Completing(task)
            | LockEvent::Resumed(task)
            | LockEvent::ZonesChanged(task)
            | LockEvent::PauseChanged(task) => task.id,
            LockEvent::Preempted { released, .. } | LockEvent::Released(released) => {
                released.task.id
            }
        }
    }
}
