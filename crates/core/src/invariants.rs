//! Developer guardrails and invariants
//!
//! Debug assertions for detecting impossible states during development.
//! These checks are compiled out in release builds.

use uuid::Uuid;

use crate::lock::LockEngine;
use crate::models::{Snapshot, Task, TaskType};

/// Validate that the lock engine's state is internally consistent
pub fn assert_engine_invariants(engine: &LockEngine) {
    if let Some(holder) = engine.holder() {
        assert_holder_invariants(holder);

        // A suspended task waits behind a different holder
        if let Some(suspended) = engine.suspended() {
            debug_assert!(
                suspended.id != holder.id,
                "Task {} is both holder and suspended",
                holder.id
            );
        }
    }

    if let Some(suspended) = engine.suspended() {
        debug_assert!(
            suspended.task_type == TaskType::Background,
            "Suspended task {} is {:?}, only background can be suspended",
            suspended.id,
            suspended.task_type
        );
    }

    // Version only moves when something happened
    debug_assert!(
        engine.version() > 0 || engine.holder().is_none(),
        "Engine holds a task at version 0"
    );
}

/// Validate a task that currently holds the lock
pub fn assert_holder_invariants(task: &Task) {
    debug_assert!(
        task.state.is_holding(),
        "Holder {} is in non-holding state {:?}",
        task.id,
        task.state
    );

    debug_assert!(
        !task.zones.is_empty(),
        "Holder {} targets no zones",
        task.id
    );

    debug_assert!(task.id != Uuid::nil(), "Holder has nil task id");

    debug_assert!(
        task.grace_deadline >= task.created_at,
        "Task {} grace deadline precedes creation",
        task.id
    );
}

/// Validate that observers only ever move forward
pub fn assert_snapshot_progress(previous: &Snapshot, next: &Snapshot) {
    debug_assert!(
        next.version >= previous.version,
        "Snapshot version regressed from {} to {}",
        previous.version,
        next.version
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AdmitRequest, PayloadRef, TaskState};
    use chrono::{Duration, Utc};

    fn make_task() -> Task {
        let request = AdmitRequest::new(
            "alice",
            TaskType::Voice,
            ["Library".to_string()].into_iter().collect(),
            PayloadRef::LiveStream,
        );
        Task::from_request(request, Utc::now(), Duration::seconds(5))
    }

    #[test]
    fn test_valid_holder() {
        assert_holder_invariants(&make_task());
    }

    #[test]
    #[should_panic(expected = "targets no zones")]
    fn test_holder_without_zones() {
        let mut task = make_task();
        task.zones.clear();
        assert_holder_invariants(&task);
    }

    #[test]
    #[should_panic(expected = "non-holding state")]
    fn test_released_holder() {
        let mut task = make_task();
        task.state = TaskState::Released;
        assert_holder_invariants(&task);
    }

    #[test]
    fn test_snapshot_progress() {
        let now = Utc::now();
        assert_snapshot_progress(&Snapshot::idle(1, now), &Snapshot::idle(2, now));
    }

    #[test]
    #[should_panic(expected = "regressed")]
    fn test_snapshot_regression() {
        let now = Utc::now();
        assert_snapshot_progress(&Snapshot::idle(3, now), &Snapshot::idle(2, now));
    }
}
