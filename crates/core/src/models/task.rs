//! Task model - one admitted claim on the shared PA output

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an admitted task
pub type TaskId = Uuid;

/// Opaque identity of an authenticated user
pub type OwnerId = String;

/// Concrete zone names targeted by a task
pub type ZoneSet = BTreeSet<String>;

/// Principal used by the scheduler, the liveness monitor and completion callbacks
pub const SYSTEM_OWNER: &str = "system";

/// Kind of broadcast a task represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Emergency,
    Voice,
    Text,
    Scheduled,
    Background,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Emergency => "emergency",
            TaskType::Voice => "voice",
            TaskType::Text => "text",
            TaskType::Scheduled => "scheduled",
            TaskType::Background => "background",
        }
    }

    /// Whether an intro chime precedes the content
    pub fn has_preparation(self) -> bool {
        matches!(self, TaskType::Voice | TaskType::Text | TaskType::Scheduled)
    }

    /// Whether the owning client streams audio and drives activation itself
    pub fn is_interactive(self) -> bool {
        self == TaskType::Voice
    }

    /// Whether liveness must be proven by client heartbeats.
    /// Scheduled tasks are server-owned and emergency is never expired.
    pub fn requires_heartbeat(self) -> bool {
        matches!(self, TaskType::Voice | TaskType::Text | TaskType::Background)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Precedence tier. Lower numeric value wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Priority {
    Emergency = 0,
    Realtime = 1,
    Background = 2,
}

impl Priority {
    pub fn value(self) -> u8 {
        self as u8
    }
}

/// Lifecycle of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Requested,
    /// Reserved, intro chime playing; protected until `grace_deadline`
    Preparing,
    Active,
    /// Being torn down; output told to stop
    Completing,
    Released,
    Preempted,
}

impl TaskState {
    /// Whether the task currently holds the lock
    pub fn is_holding(self) -> bool {
        matches!(
            self,
            TaskState::Preparing | TaskState::Active | TaskState::Completing
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Released | TaskState::Preempted)
    }
}

/// Content the output driver renders. Opaque to arbitration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PayloadRef {
    /// Text to be spoken by TTS
    Text {
        content: String,
        #[serde(default)]
        voice: Option<String>,
    },
    /// Stored audio, by reference
    Audio { reference: String },
    /// Live microphone audio delivered as chunks
    LiveStream,
    /// Emergency alert script (siren plus spoken text)
    Alert { script: String },
}

impl PayloadRef {
    pub fn alert_default() -> Self {
        PayloadRef::Alert {
            script: "Attention. This is an emergency alert. Please remain calm and follow \
                     the instructions carefully."
                .to_string(),
        }
    }
}

/// Why a task stopped holding the lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReleaseReason {
    ManualStop,
    NaturalCompletion,
    Timeout,
    Preempted,
}

impl fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReleaseReason::ManualStop => "manual-stop",
            ReleaseReason::NaturalCompletion => "natural-completion",
            ReleaseReason::Timeout => "timeout",
            ReleaseReason::Preempted => "preempted",
        };
        f.write_str(s)
    }
}

/// A request to use the PA output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmitRequest {
    pub owner: OwnerId,
    pub task_type: TaskType,
    /// Expanded, validated concrete zones
    pub zones: ZoneSet,
    pub payload: PayloadRef,
    /// Known or estimated playback length for finite content
    #[serde(default)]
    pub duration_ms: Option<u64>,
    /// Set when admitted by the schedule queue
    #[serde(default)]
    pub schedule_id: Option<Uuid>,
}

impl AdmitRequest {
    pub fn new(
        owner: impl Into<OwnerId>,
        task_type: TaskType,
        zones: ZoneSet,
        payload: PayloadRef,
    ) -> Self {
        Self {
            owner: owner.into(),
            task_type,
            zones,
            payload,
            duration_ms: None,
            schedule_id: None,
        }
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_schedule(mut self, schedule_id: Uuid) -> Self {
        self.schedule_id = Some(schedule_id);
        self
    }
}

/// An admitted broadcast unit. Owned exclusively by the lock engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: TaskType,
    pub priority: Priority,
    pub owner: OwnerId,
    pub zones: ZoneSet,
    pub payload: PayloadRef,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    /// Liveness expiry is suppressed until this instant
    pub grace_deadline: DateTime<Utc>,
    /// Natural end of finite content, when known
    pub completion_deadline: Option<DateTime<Utc>>,
    pub paused: bool,
    /// Start of the current pause; heartbeats do not extend it
    #[serde(default)]
    pub paused_since: Option<DateTime<Utc>>,
    pub schedule_id: Option<Uuid>,
}

impl Task {
    /// Build a task from an accepted request.
    /// `preparation` is zero for types without an intro chime.
    pub fn from_request(request: AdmitRequest, now: DateTime<Utc>, preparation: Duration) -> Self {
        let grace_deadline = now + preparation;
        let state = if preparation > Duration::zero() {
            TaskState::Preparing
        } else {
            TaskState::Active
        };
        let completion_deadline = request
            .duration_ms
            .and_then(|ms| i64::try_from(ms).ok())
            .map(|ms| grace_deadline + Duration::milliseconds(ms));

        Self {
            id: Uuid::new_v4(),
            task_type: request.task_type,
            priority: crate::policy::priority_of(request.task_type),
            owner: request.owner,
            zones: request.zones,
            payload: request.payload,
            state,
            created_at: now,
            last_heartbeat_at: now,
            grace_deadline,
            completion_deadline,
            paused: false,
            paused_since: None,
            schedule_id: request.schedule_id,
        }
    }

    pub fn is_owned_by(&self, owner: &str) -> bool {
        self.owner == owner
    }

    pub fn in_grace(&self, now: DateTime<Utc>) -> bool {
        self.state == TaskState::Preparing && now <= self.grace_deadline
    }

    /// The request that would recreate this task, used to resume suspended tasks
    pub fn to_request(&self) -> AdmitRequest {
        AdmitRequest {
            owner: self.owner.clone(),
            task_type: self.task_type,
            zones: self.zones.clone(),
            payload: self.payload.clone(),
            duration_ms: None,
            schedule_id: self.schedule_id,
        }
    }
}

/// A task that no longer holds the lock, retained briefly for observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasedTask {
    pub task: Task,
    pub reason: ReleaseReason,
    pub released_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zones(names: &[&str]) -> ZoneSet {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_voice_task_starts_preparing() {
        let now = Utc::now();
        let request = AdmitRequest::new("alice", TaskType::Voice, zones(&["Library"]), PayloadRef::LiveStream);
        let task = Task::from_request(request, now, Duration::seconds(5));

        assert_eq!(task.state, TaskState::Preparing);
        assert_eq!(task.grace_deadline, now + Duration::seconds(5));
        assert!(task.in_grace(now + Duration::seconds(5)));
        assert!(!task.in_grace(now + Duration::seconds(6)));
    }

    #[test]
    fn test_no_preparation_means_active() {
        let now = Utc::now();
        let request = AdmitRequest::new("carol", TaskType::Emergency, zones(&["Library"]), PayloadRef::alert_default());
        let task = Task::from_request(request, now, Duration::zero());

        assert_eq!(task.state, TaskState::Active);
        assert_eq!(task.priority, Priority::Emergency);
        assert!(!task.in_grace(now));
    }

    #[test]
    fn test_completion_deadline_counts_after_chime() {
        let now = Utc::now();
        let request = AdmitRequest::new(
            "bob",
            TaskType::Text,
            zones(&["Main Hall"]),
            PayloadRef::Text {
                content: "Assembly at noon".into(),
                voice: None,
            },
        )
        .with_duration_ms(3_000);
        let task = Task::from_request(request, now, Duration::seconds(5));

        assert_eq!(task.completion_deadline, Some(now + Duration::seconds(8)));
    }

    #[test]
    fn test_release_reason_wire_names() {
        let json = serde_json::to_string(&ReleaseReason::NaturalCompletion).unwrap();
        assert_eq!(json, "\"natural-completion\"");
        assert_eq!(ReleaseReason::ManualStop.to_string(), "manual-stop");
    }

    #[test]
    fn test_type_traits() {
        assert!(TaskType::Voice.is_interactive());
        assert!(!TaskType::Emergency.has_preparation());
        assert!(!TaskType::Background.has_preparation());
        assert!(!TaskType::Scheduled.requires_heartbeat());
        assert!(!TaskType::Emergency.requires_heartbeat());
    }
}
