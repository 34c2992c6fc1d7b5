//! State hub - fan-out of lock state to observers
//!
//! Snapshots go through a `watch` channel: slow observers skip intermediate
//! states and always read the latest one. Events go through a `broadcast`
//! channel so a specific owner can learn it was preempted.

use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::invariants::assert_snapshot_progress;
use crate::models::{LockEvent, Snapshot};

/// Buffered events per subscriber before it starts lagging
const EVENT_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct StateHub {
    snapshots: watch::Sender<Snapshot>,
    events: broadcast::Sender<LockEvent>,
}

impl StateHub {
    pub fn new(initial: Snapshot) -> Self {
        let (snapshots, _) = watch::channel(initial);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { snapshots, events }
    }

    /// Publish a snapshot. Anything not newer than the current one is
    /// refused, so observers never see the version go backwards.
    pub fn publish(&self, snapshot: Snapshot) -> bool {
        let version = snapshot.version;
        let published = self.snapshots.send_if_modified(|current| {
            if !snapshot.is_newer_than(current) {
                return false;
            }
            assert_snapshot_progress(current, &snapshot);
            *current = snapshot;
            true
        });

        if published {
            debug!(version, "Snapshot published");
        } else {
            debug!(version, "Stale snapshot refused");
        }
        published
    }

    pub fn emit(&self, event: LockEvent) {
        // No subscribers is fine
        if self.events.send(event).is_err() {
            debug!("Lock event dropped, no subscribers");
        }
    }

    /// Latest published snapshot
    pub fn current(&self) -> Snapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<LockEvent> {
        self.events.subscribe()
    }
}

/// Receive the next event, skipping over a lag instead of failing.
/// Returns `None` once the hub is gone.
pub async fn recv_event(rx: &mut broadcast::Receiver<LockEvent>) -> Option<LockEvent> {
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event subscriber lagging");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
