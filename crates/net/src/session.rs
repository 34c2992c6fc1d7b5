//! Live voice session on top of a connected client
//!
//! Wraps the admit / preparation / heartbeat / release cycle of a microphone
//! broadcast. Audio is refused until the intro chime has finished, and the
//! session ends on its own when the lock is lost.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use herald_core::{
    Admission, PayloadRef, ReleaseReason, ReleasedTask, Task, TaskId, TaskState, TaskType,
    TimingConfig,
};

use crate::client::Client;
use crate::error::{Error, Result};

/// Client-side view of the server's timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTiming {
    pub preparation: Duration,
    pub heartbeat_interval: Duration,
}

impl From<&TimingConfig> for SessionTiming {
    fn from(timing: &TimingConfig) -> Self {
        Self {
            preparation: Duration::from_millis(timing.preparation_delay_ms),
            heartbeat_interval: Duration::from_millis(timing.heartbeat_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Chime playing; audio is not accepted yet
    Preparing,
    Live,
    Ended,
}

pub struct VoiceSession {
    client: Arc<Client>,
    task: Task,
    state_tx: Arc<watch::Sender<SessionState>>,
    state_rx: watch::Receiver<SessionState>,
    keepalive: JoinHandle<()>,
}

impl VoiceSession {
    /// Take the lock for live voice on `zones`
    pub async fn start(
        client: Arc<Client>,
        zones: &[String],
        timing: SessionTiming,
    ) -> Result<Self> {
        let admission = client
            .admit(TaskType::Voice, zones, PayloadRef::LiveStream, None)
            .await?;

        // Re-admitting our own live task keeps it on air without a new chime
        let already_live = matches!(
            &admission,
            Admission::Refreshed(task) if task.state == TaskState::Active
        );
        let task = admission.task().clone();
        let initial = if already_live {
            SessionState::Live
        } else {
            SessionState::Preparing
        };

        let (state_tx, state_rx) = watch::channel(initial);
        let state_tx = Arc::new(state_tx);
        let keepalive = tokio::spawn(keepalive(
            client.clone(),
            task.id,
            timing,
            state_tx.clone(),
        ));

        info!(task_id = %task.id, zones = ?task.zones, "Voice session started");

        Ok(Self {
            client,
            task,
            state_tx,
            state_rx,
            keepalive,
        })
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Forward microphone audio. Fails with `NotLive` during the chime or
    /// after the session ended.
    pub fn send_chunk(&self, data: &[u8]) -> Result<()> {
        if self.state() != SessionState::Live {
            return Err(Error::NotLive);
        }
        self.client.send_chunk(self.task.id, data)
    }

    /// Retarget the broadcast while it is running
    pub async fn set_zones(&self, zones: &[String]) -> Result<()> {
        self.client.set_zones(self.task.id, zones).await
    }

    /// Stop talking and give the lock back
    pub async fn stop(&self) -> Result<Option<ReleasedTask>> {
        self.keepalive.abort();
        self.state_tx.send_replace(SessionState::Ended);
        let released = self
            .client
            .release(self.task.id, ReleaseReason::ManualStop)
            .await?;
        info!(task_id = %self.task.id, "Voice session stopped");
        Ok(released)
    }

    /// Resolves once the session has ended, for whatever reason
    pub async fn wait_ended(&self) {
        let mut rx = self.state_rx.clone();
        let _ = rx.wait_for(|state| *state == SessionState::Ended).await;
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        self.keepalive.abort();
    }
}

/// Heartbeats plus the go-live timer, until the lock is lost
async fn keepalive(
    client: Arc<Client>,
    task_id: TaskId,
    timing: SessionTiming,
    state_tx: Arc<watch::Sender<SessionState>>,
) {
    let mut live = *state_tx.borrow() == SessionState::Live;
    let go_live = tokio::time::sleep(if live {
        Duration::ZERO
    } else {
        timing.preparation
    });
    tokio::pin!(go_live);

    let mut ticker = tokio::time::interval(timing.heartbeat_interval * 4 / 5);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Our snapshot may predate the admission, so absence only means loss
    // once the task has been seen holding the lock
    let mut snapshots = client.subscribe();
    let mut seen = snapshots
        .borrow_and_update()
        .active_task
        .as_ref()
        .is_some_and(|t| t.id == task_id);

    loop {
        tokio::select! {
            _ = &mut go_live, if !live => {
                if let Err(e) = client.heartbeat(task_id).await {
                    warn!(task_id = %task_id, error = %e, "Heartbeat failed");
                    break;
                }
                live = true;
                state_tx.send_replace(SessionState::Live);
                info!(task_id = %task_id, "Voice session live");
            }
            _ = ticker.tick() => {
                if let Err(e) = client.heartbeat(task_id).await {
                    warn!(task_id = %task_id, error = %e, "Heartbeat failed");
                    break;
                }
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                if snapshot.active_task.as_ref().is_some_and(|t| t.id == task_id) {
                    seen = true;
                    continue;
                }
                let released = snapshot
                    .last_released
                    .as_ref()
                    .is_some_and(|r| r.task.id == task_id);
                if seen || released {
                    info!(task_id = %task_id, "Voice session lost the lock");
                    break;
                }
                debug!(version = snapshot.version, "Snapshot predates admission");
            }
        }
    }

    state_tx.send_replace(SessionState::Ended);
}
