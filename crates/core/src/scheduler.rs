//! Schedule queue - announcements waiting for their time slot
//!
//! The queue never touches the lock itself. The arbiter peeks at the next
//! due entry, runs it through normal admission, and reports back with
//! [`ScheduleQueue::launch`], [`ScheduleQueue::finished`] or
//! [`ScheduleQueue::requeue_front`].

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::ScheduledAnnouncement;

#[derive(Debug, Default)]
pub struct ScheduleQueue {
    /// Sorted by `due_at`, ties in insertion order
    pending: Vec<ScheduledAnnouncement>,
    /// Entry whose task currently holds (or last held) the lock
    running: Option<ScheduledAnnouncement>,
    /// Start of the current realtime or emergency interruption
    interrupted_since: Option<DateTime<Utc>>,
    shift_on_interruption: bool,
}

impl ScheduleQueue {
    pub fn new(shift_on_interruption: bool) -> Self {
        Self {
            shift_on_interruption,
            ..Self::default()
        }
    }

    pub fn add(&mut self, entry: ScheduledAnnouncement) {
        info!(schedule_id = %entry.id, due_at = %entry.due_at, repeat = ?entry.repeat, "Announcement scheduled");
        let index = self.pending.partition_point(|e| e.due_at <= entry.due_at);
        self.pending.insert(index, entry);
    }

    /// Remove an entry, pending or running
    pub fn cancel(&mut self, id: Uuid) -> Option<ScheduledAnnouncement> {
        if self.running.as_ref().is_some_and(|e| e.id == id) {
            info!(schedule_id = %id, "Running announcement cancelled");
            return self.running.take();
        }
        let index = self.pending.iter().position(|e| e.id == id)?;
        info!(schedule_id = %id, "Announcement cancelled");
        Some(self.pending.remove(index))
    }

    /// Pending entries in due order
    pub fn list(&self) -> &[ScheduledAnnouncement] {
        &self.pending
    }

    /// Look up an entry, pending or running
    pub fn get(&self, id: Uuid) -> Option<&ScheduledAnnouncement> {
        self.running
            .iter()
            .chain(self.pending.iter())
            .find(|e| e.id == id)
    }

    pub fn running(&self) -> Option<&ScheduledAnnouncement> {
        self.running.as_ref()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Earliest entry that is due, unless one is already running
    pub fn next_due(&self, now: DateTime<Utc>) -> Option<&ScheduledAnnouncement> {
        if self.running.is_some() {
            return None;
        }
        self.pending.first().filter(|e| e.is_due(now))
    }

    /// Mark an entry as admitted
    pub fn launch(&mut self, id: Uuid) -> bool {
        let Some(index) = self.pending.iter().position(|e| e.id == id) else {
            return false;
        };
        let entry = self.pending.remove(index);
        debug!(schedule_id = %id, "Announcement launched");
        self.running = Some(entry);
        true
    }

    /// The running entry's task ended normally. Queues the next occurrence
    /// of recurring entries and returns the finished one.
    pub fn finished(&mut self, id: Uuid) -> Option<ScheduledAnnouncement> {
        if !self.running.as_ref().is_some_and(|e| e.id == id) {
            return None;
        }
        let entry = self.running.take()?;
        if let Some(next) = entry.next_occurrence() {
            self.add(next);
        }
        Some(entry)
    }

    /// A higher-priority task cut the running entry short. It goes back to
    /// the head of the queue to replay once the lock is free.
    pub fn requeue_front(&mut self, id: Uuid) -> bool {
        if !self.running.as_ref().is_some_and(|e| e.id == id) {
            return false;
        }
        let Some(mut entry) = self.running.take() else {
            return false;
        };
        entry.interrupted = true;
        if let Some(head) = self.pending.first() {
            entry.due_at = entry.due_at.min(head.due_at);
        }
        info!(schedule_id = %id, "Interrupted announcement requeued");
        self.pending.insert(0, entry);
        true
    }

    /// A realtime or emergency task took the lock
    pub fn note_interruption(&mut self, now: DateTime<Utc>) {
        if self.interrupted_since.is_none() {
            debug!(since = %now, "Interruption started");
            self.interrupted_since = Some(now);
        }
    }

    /// The lock went idle. Moves every pending entry later by the length of
    /// the interruption and returns the applied shift.
    pub fn apply_shift(&mut self, now: DateTime<Utc>) -> Option<Duration> {
        let since = self.interrupted_since.take()?;
        if !self.shift_on_interruption {
            return None;
        }
        let shift = now - since;
        if shift <= Duration::zero() || self.pending.is_empty() {
            return None;
        }

        for entry in &mut self.pending {
            entry.due_at += shift;
        }
        info!(shift_ms = shift.num_milliseconds(), entries = self.pending.len(), "Pending announcements shifted");
        Some(shift)
    }
}
