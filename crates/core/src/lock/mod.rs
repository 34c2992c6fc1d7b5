//! Lock engine - single-owner arbitration of the PA output
//!
//! The engine is a plain state machine: `Idle` or `Holding(task)`. It never
//! reads the clock; callers pass `now`, which keeps every rule testable
//! without sleeping. Serialization is the caller's job (see `Arbiter`).
//!
//! Every transition bumps `version` and queues a [`LockEvent`]; the caller
//! drains the events after each operation and publishes a fresh snapshot.

mod liveness;

pub use liveness::{LivenessMonitor, Verdict};

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::TimingConfig;
use crate::error::{Error, Result};
use crate::invariants::assert_engine_invariants;
use crate::models::{
    AdmitRequest, LockEvent, Mode, OwnerId, ReleaseReason, ReleasedTask, Snapshot, Task, TaskId,
    TaskState, TaskType, ZoneSet, SYSTEM_OWNER,
};
use crate::policy::{decide, Decision};

/// Result of a successful admission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Lock was free
    Accepted(Task),
    /// Lock was taken from a lower-priority holder
    Preempted { previous: ReleasedTask, task: Task },
    /// Same owner and type already hold the lock; counted as a heartbeat
    Refreshed(Task),
}

impl Admission {
    pub fn task(&self) -> &Task {
        match self {
            Admission::Accepted(task)
            | Admission::Preempted { task, .. }
            | Admission::Refreshed(task) => task,
        }
    }
}

/// Result of a release that actually freed the lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub released: ReleasedTask,
    /// Suspended background task that took the lock back, if any
    pub resumed: Option<Task>,
}

/// The single lock over the PA output
#[derive(Debug)]
pub struct LockEngine {
    timing: TimingConfig,
    resume_background: bool,
    holder: Option<Task>,
    /// Background task waiting for the lock to come back
    suspended: Option<Task>,
    /// Recently finished tasks, oldest first
    released: VecDeque<ReleasedTask>,
    version: u64,
    events: Vec<LockEvent>,
}

impl LockEngine {
    pub fn new(timing: TimingConfig, resume_background: bool) -> Self {
        Self {
            timing,
            resume_background,
            holder: None,
            suspended: None,
            released: VecDeque::new(),
            version: 0,
            events: Vec::new(),
        }
    }

    pub fn timing(&self) -> &TimingConfig {
        &self.timing
    }

    /// Current holder, if any
    pub fn holder(&self) -> Option<&Task> {
        self.holder.as_ref()
    }

    pub fn suspended(&self) -> Option<&Task> {
        self.suspended.as_ref()
    }

    pub fn is_idle(&self) -> bool {
        self.holder.is_none()
    }

    pub fn emergency_active(&self) -> bool {
        self.holder
            .as_ref()
            .is_some_and(|t| t.task_type == TaskType::Emergency)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Take the transitions recorded since the last drain
    pub fn drain_events(&mut self) -> Vec<LockEvent> {
        std::mem::take(&mut self.events)
    }

    /// Request the lock.
    ///
    /// Zones must already be expanded and validated against the registry.
    pub fn admit(&mut self, mut request: AdmitRequest, now: DateTime<Utc>) -> Result<Admission> {
        if request.zones.is_empty() {
            return Err(Error::InvalidZones("select at least one zone".into()));
        }
        match request.task_type {
            // Emergency only ends by manual stop
            TaskType::Emergency => request.duration_ms = None,
            // Nobody heartbeats scheduled content, so it must carry a deadline
            TaskType::Scheduled if request.duration_ms.is_none() => {
                request.duration_ms = Some(self.timing.estimated_duration_ms(&request.payload));
            }
            _ => {}
        }

        let admission = match decide(self.holder.as_ref(), &request.owner, request.task_type) {
            Decision::Admit => {
                let task = self.build(request, now);
                self.install(task.clone());
                Admission::Accepted(task)
            }
            Decision::Refresh => {
                let task = self.mark_alive(now).ok_or_else(|| {
                    Error::InvalidOperation("refresh without a holder".into())
                })?;
                debug!(task_id = %task.id, owner = %task.owner, "Re-admission treated as refresh");
                Admission::Refreshed(task)
            }
            Decision::Preempt => {
                let Some(current) = self.holder.take() else {
                    return Err(Error::InvalidOperation("preempt without a holder".into()));
                };
                let suspend = self.resume_background && current.task_type == TaskType::Background;
                if suspend {
                    self.suspended = Some(current.clone());
                }
                let previous = self.retire(current, ReleaseReason::Preempted, now);
                let task = self.build(request, now);
                info!(
                    preempted = %previous.task.id,
                    by = %task.id,
                    by_type = %task.task_type,
                    suspended = suspend,
                    "Task preempted"
                );

                // Loss before gain, so observers never see two holders
                self.emit(LockEvent::Preempted {
                    released: previous.clone(),
                    by: task.id,
                    by_type: task.task_type,
                });
                self.install(task.clone());
                Admission::Preempted { previous, task }
            }
            Decision::Busy => {
                let (holder, task_type) = match &self.holder {
                    Some(current) => (current.owner.clone(), current.task_type),
                    None => return Err(Error::InvalidOperation("busy without a holder".into())),
                };
                debug!(owner = %request.owner, holder = %holder, "Admission rejected: busy");
                return Err(Error::Busy { holder, task_type });
            }
        };

        assert_engine_invariants(self);
        Ok(admission)
    }

    /// Proof of life from the owner. Stale or foreign ids are ignored.
    pub fn heartbeat(&mut self, task_id: TaskId, owner: &str, now: DateTime<Utc>) -> bool {
        if !self.holds(task_id, owner) {
            debug!(task_id = %task_id, owner = %owner, "Ignoring stale heartbeat");
            return false;
        }
        self.mark_alive(now).is_some()
    }

    /// Account for one live audio chunk.
    ///
    /// Returns the holder when the chunk should reach the output. Chunks
    /// that arrive while the intro chime is still playing are dropped.
    pub fn record_chunk(&mut self, task_id: TaskId, owner: &str, now: DateTime<Utc>) -> Option<Task> {
        if !self.holds(task_id, owner) {
            debug!(task_id = %task_id, "Ignoring chunk for stale task");
            return None;
        }
        let holder = self.holder.as_ref()?;
        if holder.task_type != TaskType::Voice {
            warn!(task_id = %task_id, task_type = %holder.task_type, "Chunk for non-voice task dropped");
            return None;
        }
        if holder.state == TaskState::Preparing && now < holder.grace_deadline {
            debug!(task_id = %task_id, "Chunk during preparation dropped");
            return None;
        }
        self.mark_alive(now)
    }

    /// End of the preparation window for content the server plays itself
    pub fn promote(&mut self, task_id: TaskId, now: DateTime<Utc>) -> bool {
        let promoted = match self.holder.as_mut() {
            Some(task)
                if task.id == task_id
                    && task.state == TaskState::Preparing
                    && !task.task_type.is_interactive() =>
            {
                task.state = TaskState::Active;
                task.last_heartbeat_at = now;
                Some(task.clone())
            }
            _ => None,
        };

        match promoted {
            Some(task) => {
                info!(task_id = %task.id, task_type = %task.task_type, "Task active");
                self.emit(LockEvent::Activated(task));
                assert_engine_invariants(self);
                true
            }
            None => false,
        }
    }

    /// Finite content reached its deadline. The task keeps the lock while
    /// its tail plays out and is released by the next liveness pass.
    pub fn begin_completion(&mut self, task_id: TaskId, now: DateTime<Utc>) -> bool {
        let completing = match self.holder.as_mut() {
            Some(task)
                if task.id == task_id
                    && task.state != TaskState::Completing
                    && task.completion_deadline.is_some_and(|d| d <= now) =>
            {
                task.state = TaskState::Completing;
                Some(task.clone())
            }
            _ => None,
        };

        match completing {
            Some(task) => {
                debug!(task_id = %task.id, "Task completing");
                self.emit(LockEvent::Completing(task));
                true
            }
            None => false,
        }
    }

    /// Give up the lock.
    ///
    /// Only the owner or the system principal may release. Ids that no
    /// longer hold the lock are a normal teardown race and yield `Ok(None)`.
    pub fn release(
        &mut self,
        task_id: TaskId,
        owner: &str,
        reason: ReleaseReason,
        now: DateTime<Utc>,
    ) -> Result<Option<Release>> {
        if reason == ReleaseReason::Preempted {
            return Err(Error::InvalidOperation(
                "preemption is decided by admission, not requested".into(),
            ));
        }

        if self.suspended.as_ref().is_some_and(|t| t.id == task_id) {
            if let Some(task) = &self.suspended {
                if !may_release(task, owner) {
                    return Err(Error::NotOwner {
                        task_id,
                        owner: owner.to_string(),
                    });
                }
            }
            self.suspended = None;
            info!(task_id = %task_id, "Suspended background task discarded");
            return Ok(None);
        }

        let Some(current) = self.holder.as_ref() else {
            debug!(task_id = %task_id, "Release while idle ignored");
            return Ok(None);
        };
        if current.id != task_id {
            debug!(task_id = %task_id, holder = %current.id, "Stale release ignored");
            return Ok(None);
        }
        if !may_release(current, owner) {
            warn!(task_id = %task_id, owner = %owner, holder = %current.owner, "Release by non-owner refused");
            return Err(Error::NotOwner {
                task_id,
                owner: owner.to_string(),
            });
        }
        if current.task_type == TaskType::Emergency && reason != ReleaseReason::ManualStop {
            return Err(Error::InvalidOperation(
                "emergency broadcasts end only by manual stop".into(),
            ));
        }

        let Some(task) = self.holder.take() else {
            return Ok(None);
        };
        let released = self.retire(task, reason, now);
        info!(task_id = %task_id, reason = %reason, "Task released");
        self.emit(LockEvent::Released(released.clone()));

        let resumed = self.resume_suspended(now);
        assert_engine_invariants(self);
        Ok(Some(Release { released, resumed }))
    }

    /// Stop whatever interactive task the owner holds (logout, tab close).
    /// Scheduled and emergency tasks are left alone.
    pub fn release_session(&mut self, owner: &str, now: DateTime<Utc>) -> Option<Release> {
        if self.suspended.as_ref().is_some_and(|t| t.is_owned_by(owner)) {
            self.suspended = None;
            debug!(owner = %owner, "Dropped suspended task on session end");
        }

        let task_id = match &self.holder {
            Some(task)
                if task.is_owned_by(owner)
                    && matches!(
                        task.task_type,
                        TaskType::Voice | TaskType::Text | TaskType::Background
                    ) =>
            {
                task.id
            }
            _ => return None,
        };

        match self.release(task_id, owner, ReleaseReason::ManualStop, now) {
            Ok(release) => release,
            Err(e) => {
                warn!(error = %e, "Session release failed");
                None
            }
        }
    }

    /// Retarget the active task. The set may change but never empties.
    pub fn set_zones(
        &mut self,
        task_id: TaskId,
        owner: &str,
        zones: ZoneSet,
        _now: DateTime<Utc>,
    ) -> Result<Task> {
        self.check_holder(task_id, owner)?;
        if zones.is_empty() {
            return Err(Error::InvalidZones(
                "at least one zone must remain active during broadcast".into(),
            ));
        }

        let task = match self.holder.as_mut() {
            Some(task) => {
                task.zones = zones;
                task.clone()
            }
            None => return Err(Error::StaleTask(task_id)),
        };
        self.emit(LockEvent::ZonesChanged(task.clone()));
        assert_engine_invariants(self);
        Ok(task)
    }

    /// Pause or resume background music without giving up the lock.
    ///
    /// Pausing counts as one heartbeat; a player that stays paused past the
    /// liveness timeout is treated as gone.
    pub fn set_paused(
        &mut self,
        task_id: TaskId,
        owner: &str,
        paused: bool,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        self.check_holder(task_id, owner)?;
        if self.holder.as_ref().map(|t| t.task_type) != Some(TaskType::Background) {
            return Err(Error::InvalidOperation(
                "only background tasks can be paused".into(),
            ));
        }

        self.mark_alive(now);
        let task = match self.holder.as_mut() {
            Some(task) => {
                task.paused_since = match (paused, task.paused_since) {
                    (true, Some(since)) => Some(since),
                    (true, None) => Some(now),
                    (false, _) => None,
                };
                task.paused = paused;
                task.clone()
            }
            None => return Err(Error::StaleTask(task_id)),
        };
        self.emit(LockEvent::PauseChanged(task.clone()));
        Ok(task)
    }

    /// Forget released tasks older than the retention window.
    /// Returns true when the visible state changed.
    pub fn prune_released(&mut self, now: DateTime<Utc>) -> bool {
        let retention = self.timing.released_retention();
        let before = self.released.len();
        while self
            .released
            .front()
            .is_some_and(|r| r.released_at + retention < now)
        {
            self.released.pop_front();
        }

        let changed = self.released.len() != before;
        if changed {
            self.version += 1;
        }
        changed
    }

    /// Published view of the lock
    pub fn snapshot(&self, now: DateTime<Utc>) -> Snapshot {
        Snapshot {
            version: self.version,
            mode: Mode::for_task(self.holder.as_ref()),
            active_task: self.holder.clone(),
            last_released: self.released.back().cloned(),
            emitted_at: now,
        }
    }

    /// Recently released tasks, oldest first
    pub fn recently_released(&self) -> impl Iterator<Item = &ReleasedTask> {
        self.released.iter()
    }

    fn build(&self, request: AdmitRequest, now: DateTime<Utc>) -> Task {
        let preparation = self.timing.preparation_for(request.task_type);
        Task::from_request(request, now, preparation)
    }

    fn install(&mut self, task: Task) {
        info!(
            task_id = %task.id,
            owner = %task.owner,
            task_type = %task.task_type,
            state = ?task.state,
            "Task admitted"
        );
        self.holder = Some(task.clone());
        self.emit(LockEvent::Admitted(task));
    }

    fn resume_suspended(&mut self, now: DateTime<Utc>) -> Option<Task> {
        if self.holder.is_some() || !self.resume_background {
            return None;
        }
        let suspended = self.suspended.take()?;
        let task = self.build(suspended.to_request(), now);
        info!(task_id = %task.id, previous = %suspended.id, owner = %task.owner, "Background task resumed");
        self.holder = Some(task.clone());
        self.emit(LockEvent::Resumed(task.clone()));
        Some(task)
    }

    fn retire(&mut self, mut task: Task, reason: ReleaseReason, now: DateTime<Utc>) -> ReleasedTask {
        task.state = if reason == ReleaseReason::Preempted {
            TaskState::Preempted
        } else {
            TaskState::Released
        };
        let released = ReleasedTask {
            task,
            reason,
            released_at: now,
        };
        self.released.push_back(released.clone());
        released
    }

    /// Refresh the holder's liveness, activating it once the chime is over
    fn mark_alive(&mut self, now: DateTime<Utc>) -> Option<Task> {
        let (task, activated) = {
            let task = self.holder.as_mut()?;
            task.last_heartbeat_at = now;
            let activated = task.state == TaskState::Preparing && now >= task.grace_deadline;
            if activated {
                task.state = TaskState::Active;
            }
            (task.clone(), activated)
        };

        if activated {
            info!(task_id = %task.id, "Task active");
            self.emit(LockEvent::Activated(task.clone()));
        }
        Some(task)
    }

    fn holds(&self, task_id: TaskId, owner: &str) -> bool {
        self.holder
            .as_ref()
            .is_some_and(|t| t.id == task_id && t.is_owned_by(owner))
    }

    fn check_holder(&self, task_id: TaskId, owner: &str) -> Result<()> {
        match &self.holder {
            Some(task) if task.id == task_id => {
                if may_release(task, owner) {
                    Ok(())
                } else {
                    Err(Error::NotOwner {
                        task_id,
                        owner: OwnerId::from(owner),
                    })
                }
            }
            _ => Err(Error::StaleTask(task_id)),
        }
    }

    fn emit(&mut self, event: LockEvent) {
        self.version += 1;
        self.events.push(event);
    }
}

fn may_release(task: &Task, owner: &str) -> bool {
    task.is_owned_by(owner) || owner == SYSTEM_OWNER
}
