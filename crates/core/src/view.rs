//! Client-side projections of a snapshot
//!
//! Pure functions: which controls a given owner may use, and what a client
//! holding local state should do after a reconnect or refresh.

use crate::models::{Mode, Snapshot, Task, TaskId, TaskType};
use crate::policy::{decide, Decision};

/// Control availability for one owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Controls {
    pub mode: Mode,
    /// The owner holds the lock
    pub holding: bool,
    /// Stop and zone editing are available
    pub can_stop: bool,
    /// Why new broadcasts are refused, when the lock is held by someone else
    pub busy_reason: Option<String>,
    holder: Option<Task>,
    owner: String,
}

impl Controls {
    pub fn for_owner(snapshot: &Snapshot, owner: &str) -> Self {
        let holder = snapshot.active_task.clone();
        let holding = holder.as_ref().is_some_and(|t| t.is_owned_by(owner));
        let busy_reason = holder
            .as_ref()
            .filter(|_| !holding)
            .map(|t| format!("System busy: {} broadcast by {}", t.task_type, t.owner));

        Self {
            mode: snapshot.mode,
            holding,
            can_stop: holding,
            busy_reason,
            holder,
            owner: owner.to_string(),
        }
    }

    /// Whether starting a task of this type would be admitted right now
    pub fn can_start(&self, task_type: TaskType) -> bool {
        !matches!(
            decide(self.holder.as_ref(), &self.owner, task_type),
            Decision::Busy
        )
    }

    pub fn emergency_active(&self) -> bool {
        self.mode == Mode::Emergency
    }
}

/// What a client should do with its local task after seeing a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconcile {
    /// Local and published state agree
    Keep,
    /// The local task no longer holds the lock; stop streaming
    StopLocal,
    /// The server still holds a task for this owner the client forgot about
    Resume(Task),
}

pub fn reconcile(snapshot: &Snapshot, owner: &str, local_task: Option<TaskId>) -> Reconcile {
    let active = snapshot.active_task.as_ref();
    match local_task {
        Some(id) => {
            if active.is_some_and(|t| t.id == id) {
                Reconcile::Keep
            } else {
                Reconcile::StopLocal
            }
        }
        None => match active {
            Some(task)
                if task.is_owned_by(owner)
                    && matches!(task.task_type, TaskType::Voice | TaskType::Background) =>
            {
                Reconcile::Resume(task.clone())
            }
            _ => Reconcile::Keep,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AdmitRequest, PayloadRef};
    use chrono::{Duration, Utc};

    fn holding(owner: &str, task_type: TaskType) -> Snapshot {
        let now = Utc::now();
        let request = AdmitRequest::new(
            owner,
            task_type,
            ["Library".to_string()].into_iter().collect(),
            PayloadRef::LiveStream,
        );
        let task = Task::from_request(request, now, Duration::zero());
        Snapshot {
            version: 1,
            mode: Mode::for_task(Some(&task)),
            active_task: Some(task),
            last_released: None,
            emitted_at: now,
        }
    }

    #[test]
    fn test_idle_everything_startable() {
        let controls = Controls::for_owner(&Snapshot::idle(0, Utc::now()), "alice");
        assert!(!controls.holding);
        assert!(controls.busy_reason.is_none());
        assert!(controls.can_start(TaskType::Voice));
        assert!(controls.can_start(TaskType::Background));
    }

    #[test]
    fn test_other_holder_blocks_same_tier() {
        let snapshot = holding("alice", TaskType::Voice);
        let controls = Controls::for_owner(&snapshot, "bob");

        assert!(!controls.can_stop);
        assert_eq!(
            controls.busy_reason.as_deref(),
            Some("System busy: voice broadcast by alice")
        );
        assert!(!controls.can_start(TaskType::Text));
        assert!(controls.can_start(TaskType::Emergency));
    }

    #[test]
    fn test_holder_can_stop() {
        let snapshot = holding("alice", TaskType::Background);
        let controls = Controls::for_owner(&snapshot, "alice");
        assert!(controls.holding);
        assert!(controls.can_stop);
        // Higher tier preempts own background
        assert!(controls.can_start(TaskType::Voice));
    }

    #[test]
    fn test_emergency_mode() {
        let controls = Controls::for_owner(&holding("carol", TaskType::Emergency), "alice");
        assert!(controls.emergency_active());
        assert!(!controls.can_start(TaskType::Emergency));
    }

    #[test]
    fn test_reconcile() {
        let snapshot = holding("alice", TaskType::Voice);
        let task_id = snapshot.active_task.as_ref().unwrap().id;

        assert_eq!(reconcile(&snapshot, "alice", Some(task_id)), Reconcile::Keep);
        assert_eq!(
            reconcile(&snapshot, "alice", Some(TaskId::new_v4())),
            Reconcile::StopLocal
        );
        assert!(matches!(
            reconcile(&snapshot, "alice", None),
            Reconcile::Resume(_)
        ));
        assert_eq!(reconcile(&snapshot, "bob", None), Reconcile::Keep);
        assert_eq!(
            reconcile(&Snapshot::idle(2, Utc::now()), "alice", Some(task_id)),
            Reconcile::StopLocal
        );
    }
}
