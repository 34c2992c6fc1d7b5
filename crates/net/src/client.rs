//! TCP client for dashboards and consoles

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use herald_core::{
    Admission, Controls, OwnerId, PayloadRef, ReleaseReason, ReleasedTask, Repeat,
    ScheduledAnnouncement, Snapshot, TaskId, TaskType,
};

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};
use crate::protocol::{encode_chunk, Message, Rejection};

/// How long a request waits for its reply
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Unsolicited notice from the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// One of this owner's tasks lost the lock to a higher priority task
    Preempted {
        task_id: TaskId,
        by: TaskId,
        by_type: TaskType,
    },
    /// Server is shutting down
    ServerShutdown,
    /// Connection lost
    Disconnected,
}

/// Client handle for network operations
pub struct Client {
    owner: OwnerId,
    zones: Vec<String>,
    state: Arc<RwLock<ConnectionState>>,
    snapshot_rx: watch::Receiver<Snapshot>,
    event_rx: Mutex<mpsc::Receiver<ServerEvent>>,
    cmd_tx: mpsc::Sender<ClientCommand>,
    next_seq: AtomicU64,
}

enum ClientCommand {
    Send(Message),
    Request {
        msg: Message,
        seq: u64,
        reply: oneshot::Sender<Message>,
    },
    Disconnect,
}

impl Client {
    /// Connect and identify as `owner`. Fails if the server refuses the
    /// identity or is at capacity.
    pub async fn connect(addr: SocketAddr, owner: impl Into<OwnerId>) -> Result<Self> {
        let owner = owner.into();
        info!(addr = %addr, owner = %owner, "Connecting to server");

        let stream = TcpStream::connect(addr).await?;
        let (mut reader, mut writer) = tokio::io::split(stream);

        write_frame(
            &mut writer,
            &Message::Hello {
                owner: owner.clone(),
            },
        )
        .await?;

        let (owner, zones, snapshot) = match read_frame(&mut reader).await? {
            Message::Welcome {
                owner,
                zones,
                snapshot,
            } => (owner, zones, snapshot),
            Message::Rejected {
                rejection: Rejection::ServerFull,
                ..
            } => return Err(Error::ServerFull),
            Message::Rejected { rejection, .. } => return Err(Error::Rejected(rejection)),
            _ => return Err(Error::Protocol("Expected Welcome".into())),
        };

        info!(owner = %owner, version = snapshot.version, "Connected");

        let state = Arc::new(RwLock::new(ConnectionState::Connected));
        let (snapshot_tx, snapshot_rx) = watch::channel(snapshot);
        let (event_tx, event_rx) = mpsc::channel(64);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);

        tokio::spawn(connection_task(
            reader,
            writer,
            state.clone(),
            snapshot_tx,
            event_tx,
            cmd_rx,
        ));

        Ok(Client {
            owner,
            zones,
            state,
            snapshot_rx,
            event_rx: Mutex::new(event_rx),
            cmd_tx,
            next_seq: AtomicU64::new(1),
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Zones announced by the server at connect time
    pub fn zones(&self) -> &[String] {
        &self.zones
    }

    /// Latest snapshot received
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Watch snapshots as they arrive; older versions are never delivered
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshot_rx.clone()
    }

    /// Which controls this owner may use right now
    pub fn controls(&self) -> Controls {
        Controls::for_owner(&self.snapshot_rx.borrow(), &self.owner)
    }

    /// Get the next server event
    pub async fn next_event(&self) -> Option<ServerEvent> {
        self.event_rx.lock().await.recv().await
    }

    pub async fn admit(
        &self,
        task_type: TaskType,
        zones: &[String],
        payload: PayloadRef,
        duration_ms: Option<u64>,
    ) -> Result<Admission> {
        let reply = self
            .request(|seq| Message::Admit {
                seq,
                task_type,
                zones: zones.to_vec(),
                payload,
                duration_ms,
            })
            .await?;

        match reply {
            Message::Admitted {
                task,
                preempted: Some(previous),
                ..
            } => Ok(Admission::Preempted { previous, task }),
            Message::Admitted { task, .. } => Ok(Admission::Accepted(task)),
            Message::Refreshed { task, .. } => Ok(Admission::Refreshed(task)),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn heartbeat(&self, task_id: TaskId) -> Result<()> {
        self.send(Message::Heartbeat { task_id }).await
    }

    /// Queue one chunk of live audio. A full queue drops the chunk rather
    /// than delaying the ones behind it.
    pub fn send_chunk(&self, task_id: TaskId, data: &[u8]) -> Result<()> {
        let msg = Message::StreamChunk {
            task_id,
            data: encode_chunk(data),
        };
        match self.cmd_tx.try_send(ClientCommand::Send(msg)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(task_id = %task_id, "Outbound queue full, chunk dropped");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::NotConnected),
        }
    }

    /// `Ok(None)` when the task no longer held the lock
    pub async fn release(
        &self,
        task_id: TaskId,
        reason: ReleaseReason,
    ) -> Result<Option<ReleasedTask>> {
        match self
            .request(|seq| Message::Release {
                seq,
                task_id,
                reason,
            })
            .await?
        {
            Message::Released { released, .. } => Ok(released),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn set_zones(&self, task_id: TaskId, zones: &[String]) -> Result<()> {
        let reply = self
            .request(|seq| Message::SetZones {
                seq,
                task_id,
                zones: zones.to_vec(),
            })
            .await?;
        expect_ack(reply)
    }

    pub async fn set_paused(&self, task_id: TaskId, paused: bool) -> Result<()> {
        let reply = self
            .request(|seq| Message::SetPaused {
                seq,
                task_id,
                paused,
            })
            .await?;
        expect_ack(reply)
    }

    /// Stop this owner's interactive task; used on logout
    pub async fn end_session(&self) -> Result<()> {
        self.send(Message::EndSession).await
    }

    pub async fn list_zones(&self) -> Result<Vec<String>> {
        match self.request(|seq| Message::ListZones { seq }).await? {
            Message::Zones { zones, .. } => Ok(zones),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn schedule(
        &self,
        zones: &[String],
        payload: PayloadRef,
        due_at: DateTime<Utc>,
        repeat: Repeat,
        duration_ms: Option<u64>,
    ) -> Result<ScheduledAnnouncement> {
        let reply = self
            .request(|seq| Message::Schedule {
                seq,
                zones: zones.to_vec(),
                payload,
                due_at,
                repeat,
                duration_ms,
            })
            .await?;
        match reply {
            Message::Scheduled { entry, .. } => Ok(entry),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn cancel_schedule(&self, id: Uuid) -> Result<()> {
        let reply = self
            .request(|seq| Message::CancelSchedule { seq, id })
            .await?;
        expect_ack(reply)
    }

    pub async fn schedules(&self) -> Result<Vec<ScheduledAnnouncement>> {
        match self.request(|seq| Message::ListSchedules { seq }).await? {
            Message::Schedules { entries, .. } => Ok(entries),
            other => Err(unexpected(&other)),
        }
    }

    /// Send a ping
    pub async fn ping(&self) -> Result<()> {
        self.send(Message::Ping).await
    }

    /// Disconnect from the server. Held tasks are not released.
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(ClientCommand::Disconnect).await;
    }

    /// Get current connection state
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    async fn send(&self, msg: Message) -> Result<()> {
        self.cmd_tx
            .send(ClientCommand::Send(msg))
            .await
            .map_err(|_| Error::NotConnected)
    }

    /// Send a request and wait for the reply carrying the same `seq`.
    /// `Rejected` replies become `Error::Rejected`.
    async fn request(&self, build: impl FnOnce(u64) -> Message) -> Result<Message> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();

        self.cmd_tx
            .send(ClientCommand::Request {
                msg: build(seq),
                seq,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::NotConnected)?;

        let reply = tokio::time::timeout(REQUEST_TIMEOUT, reply_rx)
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|_| Error::NotConnected)?;

        match reply {
            Message::Rejected { rejection, .. } => Err(Error::Rejected(rejection)),
            other => Ok(other),
        }
    }
}

fn expect_ack(reply: Message) -> Result<()> {
    match reply {
        Message::Ack { .. } => Ok(()),
        other => Err(unexpected(&other)),
    }
}

fn unexpected(msg: &Message) -> Error {
    Error::Protocol(format!("Unexpected reply: {:?}", msg))
}

/// Main connection task
async fn connection_task(
    mut reader: ReadHalf<TcpStream>,
    mut writer: WriteHalf<TcpStream>,
    state: Arc<RwLock<ConnectionState>>,
    snapshot_tx: watch::Sender<Snapshot>,
    event_tx: mpsc::Sender<ServerEvent>,
    mut cmd_rx: mpsc::Receiver<ClientCommand>,
) {
    let mut pending: HashMap<u64, oneshot::Sender<Message>> = HashMap::new();

    loop {
        tokio::select! {
            result = read_frame(&mut reader) => {
                match result {
                    Ok(msg) => {
                        if let Some(seq) = msg.response_seq() {
                            match pending.remove(&seq) {
                                Some(reply) => {
                                    let _ = reply.send(msg);
                                }
                                None => debug!(seq, "Reply for unknown request"),
                            }
                            continue;
                        }
                        handle_server_message(msg, &snapshot_tx, &event_tx);
                    }
                    Err(Error::ConnectionClosed) => {
                        debug!("Server closed connection");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Read error");
                        break;
                    }
                }
            }

            cmd = cmd_rx.recv() => {
                let msg = match cmd {
                    Some(ClientCommand::Send(msg)) => msg,
                    Some(ClientCommand::Request { msg, seq, reply }) => {
                        pending.insert(seq, reply);
                        msg
                    }
                    Some(ClientCommand::Disconnect) | None => {
                        debug!("Disconnect requested");
                        break;
                    }
                };
                if let Err(e) = write_frame(&mut writer, &msg).await {
                    warn!(error = %e, "Write error");
                    break;
                }
            }
        }
    }

    // Outstanding requests fail with NotConnected once their senders drop
    pending.clear();
    *state.write().await = ConnectionState::Disconnected;
    notify(&event_tx, ServerEvent::Disconnected);
    info!("Disconnected from server");
}

/// Queue a notice for the application. The read loop never waits on it,
/// so a consumer that stops draining events loses them instead.
fn notify(event_tx: &mpsc::Sender<ServerEvent>, event: ServerEvent) {
    match event_tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(event)) => {
            warn!(event = ?event, "Event queue full, notice dropped");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

/// Handle an unsolicited message from the server
fn handle_server_message(
    msg: Message,
    snapshot_tx: &watch::Sender<Snapshot>,
    event_tx: &mpsc::Sender<ServerEvent>,
) {
    match msg {
        Message::Snapshot(snapshot) => {
            let version = snapshot.version;
            let applied = snapshot_tx.send_if_modified(|current| {
                if snapshot.is_newer_than(current) {
                    *current = snapshot;
                    true
                } else {
                    false
                }
            });
            if !applied {
                debug!(version, "Ignoring stale snapshot");
            }
        }
        Message::Preempted {
            task_id,
            by,
            by_type,
        } => {
            info!(task_id = %task_id, by_type = %by_type, "Task preempted");
            notify(
                event_tx,
                ServerEvent::Preempted {
                    task_id,
                    by,
                    by_type,
                },
            );
        }
        Message::ServerShutdown => {
            notify(event_tx, ServerEvent::ServerShutdown);
        }
        Message::Pong => {
            debug!("Received pong");
        }
        _ => {
            debug!("Ignoring unexpected message type");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Server;
    use herald_core::{Arbiter, HeraldConfig, TaskState};

    async fn start() -> (Server, Arc<Arbiter>) {
        let mut config = HeraldConfig::default();
        config.server.bind = "127.0.0.1".into();
        config.server.port = 0;
        let arbiter = Arbiter::new(&config).unwrap();
        let server = Server::start(&config.server, arbiter.clone()).await.unwrap();
        (server, arbiter)
    }

    fn library() -> Vec<String> {
        vec!["Library".to_string()]
    }

    #[test]
    fn test_undrained_events_do_not_stall_snapshots() {
        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::idle(1, Utc::now()));
        let (event_tx, mut event_rx) = mpsc::channel(1);

        handle_server_message(Message::ServerShutdown, &snapshot_tx, &event_tx);
        handle_server_message(
            Message::Preempted {
                task_id: Uuid::new_v4(),
                by: Uuid::new_v4(),
                by_type: TaskType::Emergency,
            },
            &snapshot_tx,
            &event_tx,
        );
        handle_server_message(
            Message::Snapshot(Snapshot::idle(2, Utc::now())),
            &snapshot_tx,
            &event_tx,
        );

        assert_eq!(snapshot_rx.borrow().version, 2);
        assert_eq!(event_rx.try_recv().unwrap(), ServerEvent::ServerShutdown);
        assert!(event_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_and_list_zones() {
        let (server, _) = start().await;
        let client = Client::connect(server.addr(), "alice").await.unwrap();

        assert_eq!(client.owner(), "alice");
        assert_eq!(client.zones().len(), 4);
        assert_eq!(client.list_zones().await.unwrap(), client.zones());
        assert_eq!(client.connection_state().await, ConnectionState::Connected);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_admit_busy_release() {
        let (server, _) = start().await;
        let alice = Client::connect(server.addr(), "alice").await.unwrap();
        let bob = Client::connect(server.addr(), "bob").await.unwrap();

        let admission = alice
            .admit(TaskType::Voice, &library(), PayloadRef::LiveStream, None)
            .await
            .unwrap();
        let task = admission.task().clone();
        assert!(matches!(admission, Admission::Accepted(_)));
        assert_eq!(task.state, TaskState::Preparing);

        let err = bob
            .admit(
                TaskType::Text,
                &library(),
                PayloadRef::Text {
                    content: "Hello".into(),
                    voice: None,
                },
                None,
            )
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        match err {
            Error::Rejected(Rejection::Busy { holder, task_type }) => {
                assert_eq!(holder, "alice");
                assert_eq!(task_type, TaskType::Voice);
            }
            other => panic!("Expected Busy, got {:?}", other),
        }

        let released = alice
            .release(task.id, ReleaseReason::ManualStop)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(released.task.id, task.id);

        // Releasing twice is a no-op
        assert!(alice
            .release(task.id, ReleaseReason::ManualStop)
            .await
            .unwrap()
            .is_none());
        server.shutdown();
    }

    #[tokio::test]
    async fn test_invalid_zones_rejected() {
        let (server, _) = start().await;
        let client = Client::connect(server.addr(), "alice").await.unwrap();

        let err = client
            .admit(TaskType::Voice, &[], PayloadRef::LiveStream, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Rejected(Rejection::InvalidZones { .. })
        ));
        assert!(!err.is_retryable());
        server.shutdown();
    }

    #[tokio::test]
    async fn test_snapshot_pushed() {
        let (server, _) = start().await;
        let alice = Client::connect(server.addr(), "alice").await.unwrap();
        let bob = Client::connect(server.addr(), "bob").await.unwrap();
        let mut snapshots = bob.subscribe();

        alice
            .admit(TaskType::Voice, &library(), PayloadRef::LiveStream, None)
            .await
            .unwrap();

        let holder = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                snapshots.changed().await.unwrap();
                let holder = snapshots.borrow().holder().map(str::to_string);
                if holder.is_some() {
                    return holder;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(holder.as_deref(), Some("alice"));

        let controls = bob.controls();
        assert!(!controls.holding);
        assert_eq!(
            controls.busy_reason.as_deref(),
            Some("System busy: voice broadcast by alice")
        );
        assert!(controls.can_start(TaskType::Emergency));
        server.shutdown();
    }

    #[tokio::test]
    async fn test_preempted_event() {
        let (server, _) = start().await;
        let alice = Client::connect(server.addr(), "alice").await.unwrap();
        let carol = Client::connect(server.addr(), "carol").await.unwrap();

        let voice = alice
            .admit(TaskType::Voice, &library(), PayloadRef::LiveStream, None)
            .await
            .unwrap()
            .task()
            .clone();
        let admission = carol
            .admit(TaskType::Emergency, &library(), PayloadRef::alert_default(), None)
            .await
            .unwrap();
        let Admission::Preempted { previous, task } = admission else {
            panic!("Expected preemption");
        };
        assert_eq!(previous.task.id, voice.id);

        let event = tokio::time::timeout(Duration::from_secs(2), alice.next_event())
            .await
            .unwrap();
        assert_eq!(
            event,
            Some(ServerEvent::Preempted {
                task_id: voice.id,
                by: task.id,
                by_type: TaskType::Emergency,
            })
        );
        server.shutdown();
    }

    #[tokio::test]
    async fn test_server_shutdown_event() {
        let (server, _) = start().await;
        let client = Client::connect(server.addr(), "alice").await.unwrap();
        server.shutdown();

        let event = tokio::time::timeout(Duration::from_secs(2), client.next_event())
            .await
            .unwrap();
        assert_eq!(event, Some(ServerEvent::ServerShutdown));
    }

    #[tokio::test]
    async fn test_schedule_round_trip() {
        let (server, _) = start().await;
        let client = Client::connect(server.addr(), "alice").await.unwrap();

        let entry = client
            .schedule(
                &library(),
                PayloadRef::Text {
                    content: "Assembly in ten minutes".into(),
                    voice: None,
                },
                Utc::now() + chrono::Duration::hours(1),
                Repeat::Daily,
                None,
            )
            .await
            .unwrap();
        let listed = client.schedules().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, entry.id);

        client.cancel_schedule(entry.id).await.unwrap();
        assert!(client.schedules().await.unwrap().is_empty());
        server.shutdown();
    }
}
