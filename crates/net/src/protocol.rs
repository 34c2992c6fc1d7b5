//! Network protocol message types
//!
//! All messages are JSON-serialized and length-prefixed on the wire.
//! Requests that expect an answer carry a client-chosen `seq`, echoed in the
//! response. Heartbeats, chunks and snapshots are fire-and-forget.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use herald_core::{
    OwnerId, PayloadRef, ReleaseReason, ReleasedTask, Repeat, ScheduledAnnouncement, Snapshot,
    Task, TaskId, TaskType,
};

/// Why the server refused a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rejection {
    /// Someone else holds the lock; retry later
    Busy { holder: OwnerId, task_type: TaskType },
    InvalidZones { reason: String },
    StaleTask { task_id: TaskId },
    NotOwner { task_id: TaskId },
    InvalidOperation { reason: String },
    /// First message was not `Hello`, or the identity is reserved
    NotIdentified { reason: String },
    ServerFull,
}

impl Rejection {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Rejection::Busy { .. })
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Busy { holder, task_type } => {
                write!(f, "System busy: {} broadcast by {}", task_type, holder)
            }
            Rejection::InvalidZones { reason } => write!(f, "Invalid zones: {}", reason),
            Rejection::StaleTask { task_id } => write!(f, "Task {} no longer holds the lock", task_id),
            Rejection::NotOwner { task_id } => write!(f, "Task {} belongs to someone else", task_id),
            Rejection::InvalidOperation { reason } => f.write_str(reason),
            Rejection::NotIdentified { reason } => write!(f, "Not identified: {}", reason),
            Rejection::ServerFull => f.write_str("Server full"),
        }
    }
}

impl From<&herald_core::Error> for Rejection {
    fn from(error: &herald_core::Error) -> Self {
        use herald_core::Error as CoreError;
        match error {
            CoreError::Busy { holder, task_type } => Rejection::Busy {
                holder: holder.clone(),
                task_type: *task_type,
            },
            CoreError::InvalidZones(reason) => Rejection::InvalidZones {
                reason: reason.clone(),
            },
            CoreError::StaleTask(task_id) => Rejection::StaleTask { task_id: *task_id },
            CoreError::NotOwner { task_id, .. } => Rejection::NotOwner { task_id: *task_id },
            other => Rejection::InvalidOperation {
                reason: other.to_string(),
            },
        }
    }
}

/// Network protocol messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    // Client -> server
    /// Identify the connection; must be the first message
    Hello { owner: OwnerId },

    Admit {
        seq: u64,
        task_type: TaskType,
        zones: Vec<String>,
        payload: PayloadRef,
        #[serde(default)]
        duration_ms: Option<u64>,
    },

    Heartbeat { task_id: TaskId },

    /// Live audio, base64 encoded
    StreamChunk { task_id: TaskId, data: String },

    Release {
        seq: u64,
        task_id: TaskId,
        reason: ReleaseReason,
    },

    SetZones {
        seq: u64,
        task_id: TaskId,
        zones: Vec<String>,
    },

    SetPaused {
        seq: u64,
        task_id: TaskId,
        paused: bool,
    },

    /// Logout: stop this owner's interactive task
    EndSession,

    ListZones { seq: u64 },

    Schedule {
        seq: u64,
        zones: Vec<String>,
        payload: PayloadRef,
        due_at: DateTime<Utc>,
        #[serde(default)]
        repeat: Repeat,
        #[serde(default)]
        duration_ms: Option<u64>,
    },

    CancelSchedule { seq: u64, id: Uuid },

    ListSchedules { seq: u64 },

    Ping,

    // Server -> client
    Welcome {
        owner: OwnerId,
        zones: Vec<String>,
        snapshot: Snapshot,
    },

    Admitted {
        seq: u64,
        task: Task,
        /// Task that lost the lock to this admission
        #[serde(default)]
        preempted: Option<ReleasedTask>,
    },

    Refreshed { seq: u64, task: Task },

    Rejected { seq: u64, rejection: Rejection },

    Released {
        seq: u64,
        /// None when the id no longer held the lock
        released: Option<ReleasedTask>,
    },

    Zones { seq: u64, zones: Vec<String> },

    Scheduled {
        seq: u64,
        entry: ScheduledAnnouncement,
    },

    Schedules {
        seq: u64,
        entries: Vec<ScheduledAnnouncement>,
    },

    Ack { seq: u64 },

    /// Lock state, pushed on connect and on every change
    Snapshot(Snapshot),

    /// Sent to the owner of a task that lost the lock
    Preempted {
        task_id: TaskId,
        by: TaskId,
        by_type: TaskType,
    },

    Pong,

    ServerShutdown,
}

impl Message {
    /// Serialize message to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Correlation number of a server response
    pub fn response_seq(&self) -> Option<u64> {
        match self {
            Message::Admitted { seq, .. }
            | Message::Refreshed { seq, .. }
            | Message::Rejected { seq, .. }
            | Message::Released { seq, .. }
            | Message::Zones { seq, .. }
            | Message::Scheduled { seq, .. }
            | Message::Schedules { seq, .. }
            | Message::Ack { seq } => Some(*seq),
            _ => None,
        }
    }
}

pub fn encode_chunk(data: &[u8]) -> String {
    STANDARD.encode(data)
}

pub fn decode_chunk(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(data)
}
