//! Error types for Herald Core

use thiserror::Error;

use crate::models::{OwnerId, TaskId, TaskType};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid zones: {0}")]
    InvalidZones(String),

    #[error("System busy: {task_type} broadcast by {holder}")]
    Busy { holder: OwnerId, task_type: TaskType },

    #[error("Stale task: {0}")]
    StaleTask(TaskId),

    #[error("Task {task_id} is not owned by {owner}")]
    NotOwner { task_id: TaskId, owner: OwnerId },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Busy { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
