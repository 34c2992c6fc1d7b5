//! Arbiter - the serialized lock service
//!
//! Every admission, heartbeat, release and timer callback goes through one
//! mutex around the lock engine and the schedule queue. After each
//! operation the arbiter drains the engine's events, drives the output and
//! activity hooks, and publishes the resulting snapshot.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::HeraldConfig;
use crate::error::{Error, Result};
use crate::hub::StateHub;
use crate::lock::{Admission, LivenessMonitor, LockEngine};
use crate::models::{
    AdmitRequest, LockEvent, PayloadRef, ReleaseReason, ReleasedTask, ScheduleRequest,
    ScheduledAnnouncement, Snapshot, Task, TaskId, TaskState, TaskType, ZoneSet, SYSTEM_OWNER,
};
use crate::output::{ActivityLog, AudioOutput, TracingActivityLog, TracingOutput};
use crate::registry::ZoneRegistry;
use crate::scheduler::ScheduleQueue;

struct Inner {
    engine: LockEngine,
    queue: ScheduleQueue,
    /// Pending promotion of the current holder at its grace deadline
    grace_timer: Option<(TaskId, AbortHandle)>,
}

pub struct Arbiter {
    inner: Mutex<Inner>,
    registry: ZoneRegistry,
    monitor: LivenessMonitor,
    hub: StateHub,
    output: Arc<dyn AudioOutput>,
    activity: Arc<dyn ActivityLog>,
    sweep_interval: std::time::Duration,
    tick_interval: std::time::Duration,
    me: Weak<Arbiter>,
}

impl Arbiter {
    /// Arbiter with logging-only output and activity log
    pub fn new(config: &HeraldConfig) -> Result<Arc<Self>> {
        Self::with_collaborators(config, Arc::new(TracingOutput), Arc::new(TracingActivityLog))
    }

    pub fn with_collaborators(
        config: &HeraldConfig,
        output: Arc<dyn AudioOutput>,
        activity: Arc<dyn ActivityLog>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let registry = config.zone_registry()?;
        let engine = LockEngine::new(config.timing.clone(), config.scheduler.resume_background);
        let hub = StateHub::new(engine.snapshot(Utc::now()));

        info!(zones = registry.len(), "Arbiter ready");

        Ok(Arc::new_cyclic(|me| Self {
            inner: Mutex::new(Inner {
                engine,
                queue: ScheduleQueue::new(config.scheduler.shift_on_interruption),
                grace_timer: None,
            }),
            registry,
            monitor: LivenessMonitor::new(config.timing.clone()),
            hub,
            output,
            activity,
            sweep_interval: config.timing.sweep_interval(),
            tick_interval: config.scheduler.tick(),
            me: me.clone(),
        }))
    }

    pub fn registry(&self) -> &ZoneRegistry {
        &self.registry
    }

    /// Concrete zones in display order
    pub fn zones(&self) -> Vec<String> {
        self.registry.list().to_vec()
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> Snapshot {
        self.hub.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.hub.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<LockEvent> {
        self.hub.events()
    }

    /// Request the lock for an interactive or emergency task
    pub async fn admit(
        &self,
        owner: &str,
        task_type: TaskType,
        zones: &[String],
        payload: PayloadRef,
        duration_ms: Option<u64>,
    ) -> Result<Admission> {
        if task_type == TaskType::Scheduled {
            return Err(Error::InvalidOperation(
                "scheduled announcements are admitted by the schedule queue".into(),
            ));
        }
        let zones = self.registry.validate(zones)?;
        let mut request = AdmitRequest::new(owner, task_type, zones, payload);
        request.duration_ms = duration_ms;

        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let result = inner.engine.admit(request, now);
        self.settle(&mut inner, now);
        result
    }

    /// Returns false for stale or foreign task ids
    pub async fn heartbeat(&self, owner: &str, task_id: TaskId) -> bool {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let alive = inner.engine.heartbeat(task_id, owner, now);
        self.settle(&mut inner, now);
        alive
    }

    /// Forward one chunk of live audio. Returns false when the task does
    /// not hold the lock or is still in its preparation window.
    pub async fn stream_chunk(&self, owner: &str, task_id: TaskId, data: &[u8]) -> bool {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let accepted = match inner.engine.record_chunk(task_id, owner, now) {
            Some(task) => {
                if let Err(e) = self.output.play_chunk(&task, data) {
                    warn!(task_id = %task_id, error = %e, "Chunk delivery failed, dropped");
                }
                true
            }
            None => false,
        };
        self.settle(&mut inner, now);
        accepted
    }

    /// Give up the lock. `Ok(None)` when the id no longer holds it.
    pub async fn release(
        &self,
        owner: &str,
        task_id: TaskId,
        reason: ReleaseReason,
    ) -> Result<Option<ReleasedTask>> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let result = inner.engine.release(task_id, owner, reason, now);
        self.settle(&mut inner, now);
        Ok(result?.map(|release| release.released))
    }

    /// Completion callback from the output for server-played content
    pub async fn complete(&self, task_id: TaskId) -> bool {
        match self
            .release(SYSTEM_OWNER, task_id, ReleaseReason::NaturalCompletion)
            .await
        {
            Ok(released) => released.is_some(),
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Completion refused");
                false
            }
        }
    }

    pub async fn set_zones(&self, owner: &str, task_id: TaskId, zones: &[String]) -> Result<Task> {
        // Empty selections reach the engine so the shrink guard reports them
        let zones = if zones.is_empty() {
            ZoneSet::new()
        } else {
            self.registry.validate(zones)?
        };

        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let result = inner.engine.set_zones(task_id, owner, zones, now);
        self.settle(&mut inner, now);
        result
    }

    pub async fn set_paused(&self, owner: &str, task_id: TaskId, paused: bool) -> Result<Task> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let result = inner.engine.set_paused(task_id, owner, paused, now);
        self.settle(&mut inner, now);
        result
    }

    /// Owner logged out or closed the dashboard
    pub async fn end_session(&self, owner: &str) -> Option<ReleasedTask> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let release = inner.engine.release_session(owner, now);
        self.settle(&mut inner, now);
        release.map(|r| r.released)
    }

    pub async fn schedule(&self, request: ScheduleRequest) -> Result<ScheduledAnnouncement> {
        let zones = self.registry.validate(&request.zones)?;
        let mut entry = ScheduledAnnouncement::new(
            request.owner,
            zones,
            request.payload,
            request.due_at,
            request.repeat,
        );

        let mut inner = self.inner.lock().await;
        entry.duration_ms = Some(
            request
                .duration_ms
                .unwrap_or_else(|| inner.engine.timing().estimated_duration_ms(&entry.payload)),
        );
        inner.queue.add(entry.clone());
        Ok(entry)
    }

    /// Remove a scheduled announcement, stopping it if it is on air
    pub async fn cancel_schedule(
        &self,
        owner: &str,
        id: Uuid,
    ) -> Result<Option<ScheduledAnnouncement>> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;

        let Some(entry) = inner.queue.get(id) else {
            return Ok(None);
        };
        if entry.owner != owner && owner != SYSTEM_OWNER {
            return Err(Error::NotOwner {
                task_id: id,
                owner: owner.to_string(),
            });
        }

        let cancelled = inner.queue.cancel(id);
        let on_air = inner
            .engine
            .holder()
            .filter(|t| t.schedule_id == Some(id))
            .map(|t| t.id);
        if let Some(task_id) = on_air {
            if let Err(e) = inner
                .engine
                .release(task_id, SYSTEM_OWNER, ReleaseReason::ManualStop, now)
            {
                warn!(task_id = %task_id, error = %e, "Failed to stop cancelled announcement");
            }
        }
        self.settle(&mut inner, now);
        Ok(cancelled)
    }

    /// Running entry first, then pending in due order
    pub async fn schedules(&self) -> Vec<ScheduledAnnouncement> {
        let inner = self.inner.lock().await;
        inner
            .queue
            .running()
            .into_iter()
            .chain(inner.queue.list())
            .cloned()
            .collect()
    }

    /// One liveness pass over the current holder
    pub async fn sweep(&self) -> Option<ReleasedTask> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let release = self.monitor.sweep(&mut inner.engine, now);
        self.settle(&mut inner, now);
        release.map(|r| r.released)
    }

    /// Try to put the earliest due announcement on air
    pub async fn run_due(&self) -> Option<Task> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        if inner.engine.emergency_active() {
            return None;
        }
        let entry = inner.queue.next_due(now)?.clone();

        let admitted = match inner.engine.admit(entry.to_request(), now) {
            Ok(admission) => {
                inner.queue.launch(entry.id);
                Some(admission.task().clone())
            }
            Err(Error::Busy { holder, task_type }) => {
                debug!(schedule_id = %entry.id, holder = %holder, task_type = %task_type, "Due announcement waiting");
                None
            }
            Err(e) => {
                warn!(schedule_id = %entry.id, error = %e, "Due announcement dropped");
                inner.queue.cancel(entry.id);
                None
            }
        };
        self.settle(&mut inner, now);
        admitted
    }

    /// Run the liveness sweep and the schedule tick until shutdown
    pub fn spawn_loops(&self, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let me = self.me.clone();
        let sweep_interval = self.sweep_interval;
        let tick_interval = self.tick_interval;

        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(sweep_interval);
            let mut tick = tokio::time::interval(tick_interval);
            sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = sweep.tick() => {
                        let Some(arbiter) = me.upgrade() else { break };
                        arbiter.sweep().await;
                    }
                    _ = tick.tick() => {
                        let Some(arbiter) = me.upgrade() else { break };
                        arbiter.run_due().await;
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Arbiter loops shutting down");
                        break;
                    }
                }
            }
        })
    }

    async fn promote(&self, task_id: TaskId) {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        if matches!(inner.grace_timer, Some((id, _)) if id == task_id) {
            inner.grace_timer = None;
        }
        inner.engine.promote(task_id, now);
        self.settle(&mut inner, now);
    }

    /// Apply side effects of the engine's transitions and publish
    fn settle(&self, inner: &mut Inner, now: DateTime<Utc>) {
        for event in inner.engine.drain_events() {
            match &event {
                LockEvent::Admitted(task) => {
                    if matches!(
                        task.task_type,
                        TaskType::Voice | TaskType::Text | TaskType::Emergency
                    ) {
                        inner.queue.note_interruption(now);
                    }
                    self.output.task_started(task);
                    if task.state == TaskState::Preparing && !task.task_type.is_interactive() {
                        self.arm_grace_timer(inner, task, now);
                    }
                }
                LockEvent::Resumed(task) => self.output.task_started(task),
                LockEvent::Activated(_) | LockEvent::Completing(_) => {}
                LockEvent::Preempted { released, .. } => {
                    disarm_grace_timer(inner, released.task.id);
                    self.output.task_stopped(released);
                    if let Some(id) = released.task.schedule_id {
                        inner.queue.requeue_front(id);
                    }
                }
                LockEvent::Released(released) => {
                    disarm_grace_timer(inner, released.task.id);
                    self.output.task_stopped(released);
                    if let Some(id) = released.task.schedule_id {
                        inner.queue.finished(id);
                    }
                }
                LockEvent::ZonesChanged(task) | LockEvent::PauseChanged(task) => {
                    self.output.task_updated(task)
                }
            }
            self.activity.record(now, &event);
            self.hub.emit(event);
        }

        // Live interruptions are over once only background music (or nothing) plays
        if inner
            .engine
            .holder()
            .map_or(true, |t| t.task_type == TaskType::Background)
        {
            inner.queue.apply_shift(now);
        }

        self.hub.publish(inner.engine.snapshot(now));
    }

    fn arm_grace_timer(&self, inner: &mut Inner, task: &Task, now: DateTime<Utc>) {
        let delay = (task.grace_deadline - now).to_std().unwrap_or_default();
        let task_id = task.id;
        let me = self.me.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(arbiter) = me.upgrade() {
                arbiter.promote(task_id).await;
            }
        });

        if let Some((previous, timer)) = inner.grace_timer.replace((task_id, handle.abort_handle())) {
            debug!(task_id = %previous, "Replacing grace timer");
            timer.abort();
        }
    }
}

fn disarm_grace_timer(inner: &mut Inner, task_id: TaskId) {
    if matches!(inner.grace_timer, Some((id, _)) if id == task_id) {
        if let Some((_, timer)) = inner.grace_timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::recv_event;
    use crate::models::{Mode, Repeat};
    use crate::registry::ALL_ZONES;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration as StdDuration;

    #[derive(Default)]
    struct RecordingOutput {
        calls: StdMutex<Vec<String>>,
        fail_chunks: bool,
    }

    impl RecordingOutput {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn push(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl AudioOutput for RecordingOutput {
        fn task_started(&self, task: &Task) {
            self.push(format!("start {}", task.task_type));
        }

        fn play_chunk(&self, _task: &Task, data: &[u8]) -> Result<()> {
            if self.fail_chunks {
                return Err(Error::InvalidOperation("device unplugged".into()));
            }
            self.push(format!("chunk {}", data.len()));
            Ok(())
        }

        fn task_stopped(&self, released: &ReleasedTask) {
            self.push(format!("stop {}", released.reason));
        }
    }

    fn fast_config() -> HeraldConfig {
        let mut config = HeraldConfig::default();
        config.timing.heartbeat_interval_ms = 40;
        config.timing.background_heartbeat_interval_ms = 40;
        config.timing.preparation_delay_ms = 30;
        config.timing.sweep_interval_ms = 5;
        config.scheduler.tick_ms = 5;
        config
    }

    fn setup(config: &HeraldConfig) -> (Arc<Arbiter>, Arc<RecordingOutput>) {
        let output = Arc::new(RecordingOutput::default());
        let arbiter =
            Arbiter::with_collaborators(config, output.clone(), Arc::new(TracingActivityLog))
                .unwrap();
        (arbiter, output)
    }

    fn library() -> Vec<String> {
        vec!["Library".to_string()]
    }

    fn text(content: &str) -> PayloadRef {
        PayloadRef::Text {
            content: content.into(),
            voice: None,
        }
    }

    async fn wait_for(arbiter: &Arbiter, condition: impl Fn(&Snapshot) -> bool) -> Snapshot {
        for _ in 0..300 {
            let snapshot = arbiter.snapshot();
            if condition(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_busy_then_release_publishes() {
        let (arbiter, _) = setup(&HeraldConfig::default());
        let mut rx = arbiter.subscribe();

        let voice = arbiter
            .admit("alice", TaskType::Voice, &library(), PayloadRef::LiveStream, None)
            .await
            .unwrap()
            .task()
            .clone();

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().mode, Mode::Broadcast);

        let err = arbiter
            .admit("bob", TaskType::Text, &library(), text("Hi"), None)
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let released = arbiter
            .release("alice", voice.id, ReleaseReason::ManualStop)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(released.task.id, voice.id);

        let snapshot = arbiter.snapshot();
        assert!(snapshot.is_idle());
        assert_eq!(
            snapshot.last_released.unwrap().reason,
            ReleaseReason::ManualStop
        );

        assert!(arbiter
            .admit("bob", TaskType::Text, &library(), text("Hi"), None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_admissions_single_winner() {
        let (arbiter, _) = setup(&HeraldConfig::default());
        let mut handles = Vec::new();
        for i in 0..16 {
            let arbiter = arbiter.clone();
            handles.push(tokio::spawn(async move {
                arbiter
                    .admit(
                        &format!("user{}", i),
                        TaskType::Voice,
                        &["Main Hall".to_string()],
                        PayloadRef::LiveStream,
                        None,
                    )
                    .await
                    .is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_preemption_notifies_owner_and_output() {
        let (arbiter, output) = setup(&HeraldConfig::default());
        let mut events = arbiter.events();

        let music = arbiter
            .admit(
                "alice",
                TaskType::Background,
                &[ALL_ZONES.to_string()],
                PayloadRef::Audio {
                    reference: "media/lobby.mp3".into(),
                },
                None,
            )
            .await
            .unwrap()
            .task()
            .clone();
        assert_eq!(music.zones.len(), 4);

        arbiter
            .admit(
                "carol",
                TaskType::Emergency,
                &[ALL_ZONES.to_string()],
                PayloadRef::alert_default(),
                None,
            )
            .await
            .unwrap();

        let mut preempted = None;
        while let Some(event) = recv_event(&mut events).await {
            if let LockEvent::Preempted { released, by_type, .. } = event {
                preempted = Some((released, by_type));
                break;
            }
        }
        let (released, by_type) = preempted.unwrap();
        assert_eq!(released.task.owner, "alice");
        assert_eq!(by_type, TaskType::Emergency);

        assert_eq!(
            output.calls(),
            vec!["start background", "stop preempted", "start emergency"]
        );
        assert_eq!(arbiter.snapshot().mode, Mode::Emergency);
    }

    #[tokio::test]
    async fn test_grace_timer_activates_text() {
        let (arbiter, _) = setup(&fast_config());
        let task = arbiter
            .admit("bob", TaskType::Text, &library(), text("Assembly"), None)
            .await
            .unwrap()
            .task()
            .clone();
        assert_eq!(task.state, TaskState::Preparing);

        let snapshot = wait_for(&arbiter, |s| {
            s.active_task
                .as_ref()
                .is_some_and(|t| t.state == TaskState::Active)
        })
        .await;
        assert_eq!(snapshot.active_task.unwrap().id, task.id);
    }

    #[tokio::test]
    async fn test_release_cancels_grace_timer() {
        let (arbiter, _) = setup(&fast_config());
        let mut events = arbiter.events();
        let task = arbiter
            .admit("bob", TaskType::Text, &library(), text("Assembly"), None)
            .await
            .unwrap()
            .task()
            .clone();
        arbiter
            .release("bob", task.id, ReleaseReason::ManualStop)
            .await
            .unwrap();

        tokio::time::sleep(StdDuration::from_millis(80)).await;
        assert!(arbiter.snapshot().is_idle());

        // Admitted then Released, never Activated
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(seen.len(), 2);
        assert!(!seen.iter().any(|e| matches!(e, LockEvent::Activated(_))));
    }

    #[tokio::test]
    async fn test_silent_voice_times_out() {
        let (arbiter, output) = setup(&fast_config());
        let (shutdown_tx, _) = broadcast::channel(1);
        let loops = arbiter.spawn_loops(shutdown_tx.subscribe());

        arbiter
            .admit("alice", TaskType::Voice, &library(), PayloadRef::LiveStream, None)
            .await
            .unwrap();

        let snapshot = wait_for(&arbiter, |s| s.is_idle()).await;
        assert_eq!(snapshot.last_released.unwrap().reason, ReleaseReason::Timeout);
        assert!(output.calls().contains(&"stop timeout".to_string()));

        shutdown_tx.send(()).unwrap();
        loops.await.unwrap();
    }

    #[tokio::test]
    async fn test_heartbeats_keep_voice_alive() {
        let mut config = fast_config();
        config.timing.heartbeat_interval_ms = 200;
        let (arbiter, _) = setup(&config);
        let (shutdown_tx, _) = broadcast::channel(1);
        arbiter.spawn_loops(shutdown_tx.subscribe());

        let voice = arbiter
            .admit("alice", TaskType::Voice, &library(), PayloadRef::LiveStream, None)
            .await
            .unwrap()
            .task()
            .clone();

        for _ in 0..12 {
            tokio::time::sleep(StdDuration::from_millis(50)).await;
            assert!(arbiter.heartbeat("alice", voice.id).await);
        }
        let snapshot = arbiter.snapshot();
        let active = snapshot.active_task.unwrap();
        assert_eq!(active.id, voice.id);
        assert_eq!(active.state, TaskState::Active);

        let _ = shutdown_tx.send(());
    }

    #[tokio::test]
    async fn test_chunks_reach_output_and_failures_are_dropped() {
        let (arbiter, output) = setup(&fast_config());
        let voice = arbiter
            .admit("alice", TaskType::Voice, &library(), PayloadRef::LiveStream, None)
            .await
            .unwrap()
            .task()
            .clone();

        // Still in the chime
        assert!(!arbiter.stream_chunk("alice", voice.id, &[1, 2, 3]).await);
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(arbiter.stream_chunk("alice", voice.id, &[1, 2, 3]).await);
        assert!(output.calls().contains(&"chunk 3".to_string()));

        let failing = Arc::new(RecordingOutput {
            fail_chunks: true,
            ..Default::default()
        });
        let arbiter = Arbiter::with_collaborators(
            &fast_config(),
            failing.clone(),
            Arc::new(TracingActivityLog),
        )
        .unwrap();
        let voice = arbiter
            .admit("alice", TaskType::Voice, &library(), PayloadRef::LiveStream, None)
            .await
            .unwrap()
            .task()
            .clone();
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(arbiter.stream_chunk("alice", voice.id, &[9; 16]).await);
        assert_eq!(
            arbiter.snapshot().active_task.unwrap().state,
            TaskState::Active
        );
    }

    #[tokio::test]
    async fn test_zone_validation_and_shrink_guard() {
        let (arbiter, _) = setup(&HeraldConfig::default());
        assert!(matches!(
            arbiter
                .admit("alice", TaskType::Voice, &["Gym".to_string()], PayloadRef::LiveStream, None)
                .await,
            Err(Error::InvalidZones(_))
        ));
        assert!(matches!(
            arbiter
                .admit("alice", TaskType::Voice, &[], PayloadRef::LiveStream, None)
                .await,
            Err(Error::InvalidZones(_))
        ));

        let voice = arbiter
            .admit("alice", TaskType::Voice, &library(), PayloadRef::LiveStream, None)
            .await
            .unwrap()
            .task()
            .clone();
        let err = arbiter.set_zones("alice", voice.id, &[]).await.unwrap_err();
        assert!(err.to_string().contains("at least one zone"));

        let task = arbiter
            .set_zones("alice", voice.id, &[ALL_ZONES.to_string()])
            .await
            .unwrap();
        assert!(arbiter.registry().is_full(&task.zones));
    }

    #[tokio::test]
    async fn test_end_session_releases_voice() {
        let (arbiter, _) = setup(&HeraldConfig::default());
        arbiter
            .admit("alice", TaskType::Voice, &library(), PayloadRef::LiveStream, None)
            .await
            .unwrap();

        assert!(arbiter.end_session("bob").await.is_none());
        let released = arbiter.end_session("alice").await.unwrap();
        assert_eq!(released.reason, ReleaseReason::ManualStop);
        assert!(arbiter.snapshot().is_idle());
    }

    #[tokio::test]
    async fn test_completion_callback_releases_text() {
        let (arbiter, output) = setup(&HeraldConfig::default());
        let task = arbiter
            .admit("bob", TaskType::Text, &library(), text("Assembly"), Some(4_000))
            .await
            .unwrap()
            .task()
            .clone();

        assert!(arbiter.complete(task.id).await);
        assert!(!arbiter.complete(task.id).await);
        assert_eq!(
            arbiter.snapshot().last_released.unwrap().reason,
            ReleaseReason::NaturalCompletion
        );
        assert_eq!(output.calls(), vec!["start text", "stop natural-completion"]);
    }

    #[tokio::test]
    async fn test_clients_cannot_admit_scheduled() {
        let (arbiter, _) = setup(&HeraldConfig::default());
        assert!(matches!(
            arbiter
                .admit("dave", TaskType::Scheduled, &library(), text("x"), None)
                .await,
            Err(Error::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn test_scheduled_announcement_runs_and_recurs() {
        let (arbiter, output) = setup(&fast_config());
        let (shutdown_tx, _) = broadcast::channel(1);
        arbiter.spawn_loops(shutdown_tx.subscribe());

        let due_at = Utc::now() - chrono::Duration::seconds(1);
        let entry = arbiter
            .schedule(ScheduleRequest {
                owner: "dave".into(),
                zones: vec!["Main Hall".into()],
                payload: text("Lunch is served"),
                due_at,
                repeat: Repeat::Daily,
                duration_ms: Some(200),
            })
            .await
            .unwrap();

        wait_for(&arbiter, |s| s.mode == Mode::Schedule).await;
        let snapshot = wait_for(&arbiter, |s| s.is_idle() && s.last_released.is_some()).await;
        assert_eq!(
            snapshot.last_released.unwrap().reason,
            ReleaseReason::NaturalCompletion
        );

        let schedules = arbiter.schedules().await;
        assert_eq!(schedules.len(), 1);
        assert_eq!(schedules[0].anchor_at, entry.anchor_at + chrono::Duration::days(1));
        assert!(output.calls().contains(&"start scheduled".to_string()));

        let _ = shutdown_tx.send(());
    }

    #[tokio::test]
    async fn test_due_announcement_waits_for_busy_lock() {
        let (arbiter, _) = setup(&HeraldConfig::default());
        let voice = arbiter
            .admit("alice", TaskType::Voice, &library(), PayloadRef::LiveStream, None)
            .await
            .unwrap()
            .task()
            .clone();
        let entry = arbiter
            .schedule(ScheduleRequest {
                owner: "dave".into(),
                zones: library(),
                payload: text("Library closing"),
                due_at: Utc::now() - chrono::Duration::seconds(1),
                repeat: Repeat::Once,
                duration_ms: None,
            })
            .await
            .unwrap();
        // Two words read out
        assert_eq!(entry.duration_ms, Some(800));

        assert!(arbiter.run_due().await.is_none());
        assert_eq!(arbiter.schedules().await.len(), 1);

        arbiter
            .release("alice", voice.id, ReleaseReason::ManualStop)
            .await
            .unwrap();
        let task = arbiter.run_due().await.unwrap();
        assert_eq!(task.task_type, TaskType::Scheduled);
        assert_eq!(task.owner, "dave");
        assert!(task.completion_deadline.is_some());
    }

    #[tokio::test]
    async fn test_cancel_running_schedule_stops_it() {
        let (arbiter, _) = setup(&HeraldConfig::default());
        let entry = arbiter
            .schedule(ScheduleRequest {
                owner: "dave".into(),
                zones: library(),
                payload: text("Fire drill at two"),
                due_at: Utc::now() - chrono::Duration::seconds(1),
                repeat: Repeat::Weekly,
                duration_ms: None,
            })
            .await
            .unwrap();
        arbiter.run_due().await.unwrap();

        assert!(matches!(
            arbiter.cancel_schedule("mallory", entry.id).await,
            Err(Error::NotOwner { .. })
        ));
        let cancelled = arbiter.cancel_schedule("dave", entry.id).await.unwrap();
        assert_eq!(cancelled.unwrap().id, entry.id);
        assert!(arbiter.snapshot().is_idle());
        // Cancelling the series drops the next occurrence too
        assert!(arbiter.schedules().await.is_empty());
    }

    #[tokio::test]
    async fn test_interrupted_schedule_replays_first() {
        let (arbiter, _) = setup(&HeraldConfig::default());
        let entry = arbiter
            .schedule(ScheduleRequest {
                owner: "dave".into(),
                zones: library(),
                payload: text("Bus arrivals"),
                due_at: Utc::now() - chrono::Duration::seconds(1),
                repeat: Repeat::Once,
                duration_ms: None,
            })
            .await
            .unwrap();
        arbiter.run_due().await.unwrap();

        let alert = arbiter
            .admit("carol", TaskType::Emergency, &library(), PayloadRef::alert_default(), None)
            .await
            .unwrap()
            .task()
            .clone();
        let schedules = arbiter.schedules().await;
        assert_eq!(schedules[0].id, entry.id);
        assert!(schedules[0].interrupted);

        // Nothing launches during an emergency
        assert!(arbiter.run_due().await.is_none());

        arbiter
            .release("carol", alert.id, ReleaseReason::ManualStop)
            .await
            .unwrap();
        let replay = arbiter.run_due().await.unwrap();
        assert_eq!(replay.schedule_id, Some(entry.id));
    }
}
