//! Scheduled announcement model

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{AdmitRequest, OwnerId, PayloadRef, TaskType, ZoneSet};

/// Recurrence of a scheduled announcement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Repeat {
    #[default]
    Once,
    Daily,
    Weekly,
}

impl Repeat {
    fn period(self) -> Option<Duration> {
        match self {
            Repeat::Once => None,
            Repeat::Daily => Some(Duration::days(1)),
            Repeat::Weekly => Some(Duration::weeks(1)),
        }
    }
}

/// A request to schedule an announcement, zones not yet validated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRequest {
    pub owner: OwnerId,
    pub zones: Vec<String>,
    pub payload: PayloadRef,
    pub due_at: DateTime<Utc>,
    #[serde(default)]
    pub repeat: Repeat,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

/// An announcement waiting in the schedule queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledAnnouncement {
    pub id: Uuid,
    pub owner: OwnerId,
    pub zones: ZoneSet,
    pub payload: PayloadRef,
    /// When the announcement becomes eligible; moves with interruption shifts
    pub due_at: DateTime<Utc>,
    /// Originally requested time, used for drift-free recurrence
    pub anchor_at: DateTime<Utc>,
    #[serde(default)]
    pub repeat: Repeat,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    /// Set when a higher-priority task cut this announcement short
    #[serde(default)]
    pub interrupted: bool,
}

impl ScheduledAnnouncement {
    pub fn new(
        owner: impl Into<OwnerId>,
        zones: ZoneSet,
        payload: PayloadRef,
        due_at: DateTime<Utc>,
        repeat: Repeat,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner: owner.into(),
            zones,
            payload,
            due_at,
            anchor_at: due_at,
            repeat,
            duration_ms: None,
            interrupted: false,
        }
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_at <= now
    }

    /// Admission request for this announcement
    pub fn to_request(&self) -> AdmitRequest {
        AdmitRequest {
            owner: self.owner.clone(),
            task_type: TaskType::Scheduled,
            zones: self.zones.clone(),
            payload: self.payload.clone(),
            duration_ms: self.duration_ms,
            schedule_id: Some(self.id),
        }
    }

    /// Next instance of a recurring announcement, anchored on the original
    /// time of day rather than on when this one actually played.
    pub fn next_occurrence(&self) -> Option<Self> {
        let period = self.repeat.period()?;
        let anchor_at = self.anchor_at + period;
        Some(Self {
            id: Uuid::new_v4(),
            owner: self.owner.clone(),
            zones: self.zones.clone(),
            payload: self.payload.clone(),
            due_at: anchor_at,
            anchor_at,
            repeat: self.repeat,
            duration_ms: self.duration_ms,
            interrupted: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn announcement(repeat: Repeat) -> ScheduledAnnouncement {
        let due = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();
        ScheduledAnnouncement::new(
            "alice",
            ["Library".to_string()].into_iter().collect(),
            PayloadRef::Text {
                content: "Library closes in ten minutes".into(),
                voice: Some("female".into()),
            },
            due,
            repeat,
        )
    }

    #[test]
    fn test_once_has_no_next() {
        assert!(announcement(Repeat::Once).next_occurrence().is_none());
    }

    #[test]
    fn test_daily_keeps_original_time_after_shift() {
        let mut entry = announcement(Repeat::Daily);
        // Played late because of an interruption
        entry.due_at += Duration::minutes(7);

        let next = entry.next_occurrence().unwrap();
        assert_eq!(
            next.due_at,
            Utc.with_ymd_and_hms(2026, 3, 3, 12, 0, 0).unwrap()
        );
        assert_ne!(next.id, entry.id);
        assert!(!next.interrupted);
    }

    #[test]
    fn test_weekly_period() {
        let next = announcement(Repeat::Weekly).next_occurrence().unwrap();
        assert_eq!(
            next.anchor_at,
            Utc.with_ymd_and_hms(2026, 3, 9, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_request_is_scheduled_type() {
        let entry = announcement(Repeat::Once);
        let request = entry.to_request();
        assert_eq!(request.task_type, TaskType::Scheduled);
        assert_eq!(request.schedule_id, Some(entry.id));
    }
}
