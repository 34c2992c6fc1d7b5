//! TCP server exposing the arbiter to dashboards and consoles
//!
//! Each connection identifies itself with `Hello`, receives a `Welcome` with
//! the zone list and current snapshot, then issues requests. Snapshots are
//! pushed to every connection on each change; preemption notices go only to
//! the owner that lost the lock.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use herald_core::hub::recv_event;
use herald_core::{
    Admission, Arbiter, LockEvent, ScheduleRequest, ServerConfig, Snapshot, SYSTEM_OWNER,
};

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};
use crate::protocol::{decode_chunk, Message, Rejection};

/// Outbound queue per connection
const PEER_QUEUE: usize = 64;

/// How long a closing connection may take to flush its queue
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Connected client
struct Peer {
    owner: String,
    tx: mpsc::Sender<Message>,
}

/// Server state shared across tasks
struct ServerState {
    peers: HashMap<Uuid, Peer>,
    max_connections: usize,
}

/// Herald server handle
pub struct Server {
    addr: SocketAddr,
    state: Arc<RwLock<ServerState>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Bind and start serving the arbiter
    pub async fn start(config: &ServerConfig, arbiter: Arc<Arbiter>) -> Result<Self> {
        let listener = TcpListener::bind((config.bind.as_str(), config.port)).await?;
        let bound_addr = listener.local_addr()?;

        info!(addr = %bound_addr, max_connections = config.max_connections, "Server started");

        let (shutdown_tx, _) = broadcast::channel(1);
        let state = Arc::new(RwLock::new(ServerState {
            peers: HashMap::new(),
            max_connections: config.max_connections,
        }));

        tokio::spawn(accept_loop(
            listener,
            state.clone(),
            arbiter.clone(),
            shutdown_tx.clone(),
        ));
        // Subscribe before serving so no early transition is missed
        tokio::spawn(publish_task(
            state.clone(),
            arbiter.subscribe(),
            arbiter.events(),
            shutdown_tx.subscribe(),
        ));

        Ok(Server {
            addr: bound_addr,
            state,
            shutdown_tx,
        })
    }

    /// Get the server's bound address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of identified connections
    pub async fn connections(&self) -> usize {
        self.state.read().await.peers.len()
    }

    /// Shutdown the server; connected clients receive `ServerShutdown`
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        info!("Server shutdown initiated");
    }
}

/// Accept incoming connections
async fn accept_loop(
    listener: TcpListener,
    state: Arc<RwLock<ServerState>>,
    arbiter: Arc<Arbiter>,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!(addr = %addr, "New connection");
                        tokio::spawn(handle_connection(
                            stream,
                            addr,
                            state.clone(),
                            arbiter.clone(),
                            shutdown_tx.subscribe(),
                        ));
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Accept loop shutting down");
                break;
            }
        }
    }
}

/// Handle a single client connection
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<RwLock<ServerState>>,
    arbiter: Arc<Arbiter>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let (mut reader, mut writer) = tokio::io::split(stream);

    let (msg_tx, msg_rx) = mpsc::channel(PEER_QUEUE);
    let (peer_id, owner) = match handle_hello(&mut reader, &state, &arbiter, &msg_tx).await {
        Ok(identity) => identity,
        Err(e) => {
            warn!(addr = %addr, error = %e, "Hello failed");
            let rejection = match e {
                Error::ServerFull => Rejection::ServerFull,
                other => Rejection::NotIdentified {
                    reason: other.to_string(),
                },
            };
            let _ = write_frame(&mut writer, &Message::Rejected { seq: 0, rejection }).await;
            return;
        }
    };

    info!(addr = %addr, owner = %owner, "Client identified");
    let writer_handle = tokio::spawn(writer_task(writer, msg_rx));

    loop {
        tokio::select! {
            result = read_frame(&mut reader) => {
                match result {
                    Ok(msg) => {
                        if let Some(reply) = handle_message(msg, &owner, &arbiter).await {
                            if msg_tx.send(reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(Error::ConnectionClosed) => {
                        debug!(owner = %owner, "Connection closed");
                        break;
                    }
                    Err(e) => {
                        warn!(owner = %owner, error = %e, "Read error");
                        break;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                let _ = msg_tx.send(Message::ServerShutdown).await;
                break;
            }
        }
    }

    // Disconnects are not releases: liveness reclaims abandoned tasks, and a
    // reconnecting client may resume its own.
    state.write().await.peers.remove(&peer_id);
    drop(msg_tx);
    if tokio::time::timeout(FLUSH_TIMEOUT, writer_handle).await.is_err() {
        debug!(owner = %owner, "Writer did not drain in time");
    }

    info!(owner = %owner, "Client disconnected");
}

/// Handle the identifying first message
async fn handle_hello(
    reader: &mut ReadHalf<TcpStream>,
    state: &Arc<RwLock<ServerState>>,
    arbiter: &Arbiter,
    tx: &mpsc::Sender<Message>,
) -> Result<(Uuid, String)> {
    let msg = read_frame(reader).await?;

    match msg {
        Message::Hello { owner } => {
            let owner = owner.trim().to_string();
            if owner.is_empty() {
                return Err(Error::Protocol("Empty owner".into()));
            }
            if owner == SYSTEM_OWNER {
                return Err(Error::Protocol("Owner name is reserved".into()));
            }

            let mut s = state.write().await;
            if s.peers.len() >= s.max_connections {
                return Err(Error::ServerFull);
            }

            // Queued before the peer is visible to the publisher, so Welcome
            // is always the first frame
            tx.send(Message::Welcome {
                owner: owner.clone(),
                zones: arbiter.zones(),
                snapshot: arbiter.snapshot(),
            })
            .await
            .map_err(|_| Error::ConnectionClosed)?;

            // One owner may be connected from several consoles
            let peer_id = Uuid::new_v4();
            s.peers.insert(
                peer_id,
                Peer {
                    owner: owner.clone(),
                    tx: tx.clone(),
                },
            );
            Ok((peer_id, owner))
        }
        _ => Err(Error::Protocol("Expected Hello".into())),
    }
}

/// Writer task - sends messages to the client until every sender is gone
async fn writer_task(mut writer: WriteHalf<TcpStream>, mut rx: mpsc::Receiver<Message>) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &msg).await {
            debug!(error = %e, "Write failed");
            break;
        }
    }
}

/// Handle one request; returns the reply, if the message expects one
async fn handle_message(msg: Message, owner: &str, arbiter: &Arbiter) -> Option<Message> {
    match msg {
        Message::Admit {
            seq,
            task_type,
            zones,
            payload,
            duration_ms,
        } => {
            let reply = match arbiter
                .admit(owner, task_type, &zones, payload, duration_ms)
                .await
            {
                Ok(Admission::Accepted(task)) => Message::Admitted {
                    seq,
                    task,
                    preempted: None,
                },
                Ok(Admission::Preempted { previous, task }) => Message::Admitted {
                    seq,
                    task,
                    preempted: Some(previous),
                },
                Ok(Admission::Refreshed(task)) => Message::Refreshed { seq, task },
                Err(e) => rejected(seq, &e),
            };
            Some(reply)
        }
        Message::Heartbeat { task_id } => {
            if !arbiter.heartbeat(owner, task_id).await {
                debug!(owner = %owner, task_id = %task_id, "Stale heartbeat");
            }
            None
        }
        Message::StreamChunk { task_id, data } => {
            match decode_chunk(&data) {
                Ok(bytes) => {
                    arbiter.stream_chunk(owner, task_id, &bytes).await;
                }
                Err(e) => warn!(owner = %owner, error = %e, "Undecodable chunk dropped"),
            }
            None
        }
        Message::Release {
            seq,
            task_id,
            reason,
        } => Some(match arbiter.release(owner, task_id, reason).await {
            Ok(released) => Message::Released { seq, released },
            Err(e) => rejected(seq, &e),
        }),
        Message::SetZones {
            seq,
            task_id,
            zones,
        } => Some(match arbiter.set_zones(owner, task_id, &zones).await {
            Ok(_) => Message::Ack { seq },
            Err(e) => rejected(seq, &e),
        }),
        Message::SetPaused {
            seq,
            task_id,
            paused,
        } => Some(match arbiter.set_paused(owner, task_id, paused).await {
            Ok(_) => Message::Ack { seq },
            Err(e) => rejected(seq, &e),
        }),
        Message::EndSession => {
            arbiter.end_session(owner).await;
            None
        }
        Message::ListZones { seq } => Some(Message::Zones {
            seq,
            zones: arbiter.zones(),
        }),
        Message::Schedule {
            seq,
            zones,
            payload,
            due_at,
            repeat,
            duration_ms,
        } => {
            let request = ScheduleRequest {
                owner: owner.to_string(),
                zones,
                payload,
                due_at,
                repeat,
                duration_ms,
            };
            Some(match arbiter.schedule(request).await {
                Ok(entry) => Message::Scheduled { seq, entry },
                Err(e) => rejected(seq, &e),
            })
        }
        Message::CancelSchedule { seq, id } => {
            Some(match arbiter.cancel_schedule(owner, id).await {
                Ok(_) => Message::Ack { seq },
                Err(e) => rejected(seq, &e),
            })
        }
        Message::ListSchedules { seq } => Some(Message::Schedules {
            seq,
            entries: arbiter.schedules().await,
        }),
        Message::Ping => Some(Message::Pong),
        _ => {
            debug!(owner = %owner, "Ignoring unexpected message type");
            None
        }
    }
}

fn rejected(seq: u64, error: &herald_core::Error) -> Message {
    debug!(seq, error = %error, "Request rejected");
    Message::Rejected {
        seq,
        rejection: Rejection::from(error),
    }
}

/// Fan snapshots out to every peer and preemption notices to their owners
async fn publish_task(
    state: Arc<RwLock<ServerState>>,
    mut snapshots: watch::Receiver<Snapshot>,
    mut events: broadcast::Receiver<LockEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                broadcast_to_peers(&state, Message::Snapshot(snapshot), None).await;
            }
            event = recv_event(&mut events) => {
                match event {
                    Some(LockEvent::Preempted { released, by, by_type }) => {
                        let notice = Message::Preempted {
                            task_id: released.task.id,
                            by,
                            by_type,
                        };
                        broadcast_to_peers(&state, notice, Some(&released.task.owner)).await;
                    }
                    Some(_) => {}
                    None => break,
                }
            }
            _ = shutdown_rx.recv() => {
                debug!("Publish task shutting down");
                break;
            }
        }
    }
}

/// Send to all peers, or only to the connections of one owner.
/// Never waits on a slow reader; a full queue loses the message.
async fn broadcast_to_peers(state: &Arc<RwLock<ServerState>>, msg: Message, only: Option<&str>) {
    let targets: Vec<(String, mpsc::Sender<Message>)> = {
        let s = state.read().await;
        s.peers
            .values()
            .filter(|peer| only.map_or(true, |owner| owner == peer.owner))
            .map(|peer| (peer.owner.clone(), peer.tx.clone()))
            .collect()
    };

    for (owner, tx) in targets {
        match tx.try_send(msg.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(owner = %owner, "Peer queue full, message dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(owner = %owner, "Peer gone, message dropped");
            }
        }
    }
}
