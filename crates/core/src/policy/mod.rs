//! Priority policy for lock admission

use crate::models::{Priority, Task, TaskType};

/// Outcome of comparing a request against the current holder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Lock is free
    Admit,
    /// Same owner, same type: treat as proof of life
    Refresh,
    /// Request outranks the holder
    Preempt,
    /// Holder keeps the lock
    Busy,
}

/// Precedence tier of a task type.
///
/// Voice, text and scheduled share one tier and exclude each other.
pub fn priority_of(task_type: TaskType) -> Priority {
    match task_type {
        TaskType::Emergency => Priority::Emergency,
        TaskType::Voice | TaskType::Text | TaskType::Scheduled => Priority::Realtime,
        TaskType::Background => Priority::Background,
    }
}

/// Whether `a` strictly outranks `b`
pub fn is_higher_priority(a: Priority, b: Priority) -> bool {
    match (a, b) {
        (Priority::Emergency, Priority::Emergency) => false,
        (Priority::Emergency, _) => true,
        _ => a.value() < b.value(),
    }
}

/// Admission decision for `owner` requesting `task_type` against `current`
pub fn decide(current: Option<&Task>, owner: &str, task_type: TaskType) -> Decision {
    let Some(current) = current else {
        return Decision::Admit;
    };

    if current.is_owned_by(owner) && current.task_type == task_type {
        return Decision::Refresh;
    }

    if is_higher_priority(priority_of(task_type), current.priority) {
        Decision::Preempt
    } else {
        Decision::Busy
    }
}
