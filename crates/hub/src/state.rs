use serde::Serialize;
use std::collections::VecDeque;
use time::OffsetDateTime;

use crate::model::{Settings, WeatherSnapshot};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Activity log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ActivityEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Zone,
    Schedule,
    Weather,
    Settings,
    Error,
    System,
}

/// Bounded, newest-last record of what the engine has done.
#[derive(Debug, Default)]
pub struct ActivityLog {
    events: VecDeque<ActivityEvent>,
}

impl ActivityLog {
    pub fn new() -> Self {
        Self {
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn record(&mut self, ts: OffsetDateTime, kind: EventKind, detail: impl Into<String>) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(ActivityEvent {
            ts,
            kind,
            detail: detail.into(),
        });
    }

    /// Newest first.
    pub fn recent(&self) -> Vec<ActivityEvent> {
        self.events.iter().rev().cloned().collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.events.len()
    }
}

// ---------------------------------------------------------------------------
// JSON response (what /api/status returns)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub uptime_secs: i64,
    pub persistence: bool,
    pub settings: Settings,
    pub weather: Option<WeatherSnapshot>,
    pub zones: ZoneCounts,
    pub schedules: ScheduleCounts,
    pub events: Vec<ActivityEvent>,
}

#[derive(Debug, Default, Serialize)]
pub struct ZoneCounts {
    pub total: usize,
    pub active: usize,
    /// Zones currently below the moisture threshold.
    pub dry: usize,
}

#[derive(Debug, Default, Serialize)]
pub struct ScheduleCounts {
    pub pending: usize,
    pub active: usize,
    pub completed: usize,
    pub cancelled: usize,
}

// ===========================================================================
// Tests
// ===========================================================================
