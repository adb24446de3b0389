//! Schedule book and execution state machine.
//!
//! ```text
//! Pending ──[scheduled_time <= now]──▶ Active ──[run finished]──▶ Completed
//!    │
//!    └──[user cancel / zone removed / valve failure]──▶ Cancelled
//! ```
//!
//! Every transition goes through `ScheduleEntry::transition`, so an entry
//! that has reached a terminal state is never modified again. The engine
//! holds the book behind a write lock for each check-then-act sequence,
//! which is what makes cancellation effective immediately.

use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

use crate::error::{EngineError, EngineResult};
use crate::model::{ScheduleEntry, ScheduleStatus, Zone};
use crate::registry::ZoneRegistry;

/// Terminal entries kept for history before the oldest are pruned.
const MAX_HISTORY: usize = 500;

pub const ZONE_REMOVED_REASON: &str = "zone removed";
pub const VALVE_FAILED_REASON: &str = "valve open failed";

/// What one due-check pass did.
#[derive(Debug, Default)]
pub struct DueOutcome {
    pub started: Vec<ScheduleEntry>,
    pub cancelled: Vec<ScheduleEntry>,
}

#[derive(Debug, Default, Clone)]
pub struct ScheduleBook {
    entries: Vec<ScheduleEntry>,
}

impl ScheduleBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<ScheduleEntry>) -> Self {
        Self { entries }
    }

    pub fn list(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    #[cfg(test)]
    pub fn get(&self, id: &str) -> EngineResult<&ScheduleEntry> {
        self.entries
            .iter()
            .find(|e| e.id == id)
            .ok_or_else(|| EngineError::schedule_not_found(id))
    }

    pub fn insert(&mut self, entry: ScheduleEntry) {
        self.entries.push(entry);
        self.prune();
    }

    pub fn count(&self, status: ScheduleStatus) -> usize {
        self.entries.iter().filter(|e| e.status == status).count()
    }

    /// True if a pending entry for `zone_id` is scheduled within `window` of
    /// `at` (inclusive on both sides).
    pub fn has_pending_near(&self, zone_id: &str, at: OffsetDateTime, window: Duration) -> bool {
        self.entries.iter().any(|e| {
            e.zone_id == zone_id
                && e.status == ScheduleStatus::Pending
                && (e.scheduled_time - at).abs() <= window
        })
    }

    /// Move one entry along the state machine.
    pub fn transition(
        &mut self,
        id: &str,
        next: ScheduleStatus,
        now: OffsetDateTime,
    ) -> EngineResult<ScheduleEntry> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| EngineError::schedule_not_found(id))?;
        entry.transition(next, now)?;
        Ok(entry.clone())
    }

    /// User cancellation; only valid while pending.
    pub fn cancel(&mut self, id: &str, now: OffsetDateTime) -> EngineResult<ScheduleEntry> {
        self.transition(id, ScheduleStatus::Cancelled, now)
    }

    /// Cancel every pending entry for `zone_id`, stamping `reason`.
    pub fn cancel_pending_for_zone(
        &mut self,
        zone_id: &str,
        reason: &str,
        now: OffsetDateTime,
    ) -> Vec<ScheduleEntry> {
        self.entries
            .iter_mut()
            .filter(|e| e.zone_id == zone_id && e.status == ScheduleStatus::Pending)
            .filter_map(|e| abort(e, reason, now))
            .collect()
    }

    /// Start every pending entry whose time has come. `open` drives the
    /// zone's valve before the entry goes active; if it fails the entry is
    /// cancelled with the failure as its reason. Entries for zones that no
    /// longer exist are cancelled instead of started.
    pub fn start_due<F>(
        &mut self,
        zones: &ZoneRegistry,
        now: OffsetDateTime,
        mut open: F,
    ) -> DueOutcome
    where
        F: FnMut(&Zone) -> anyhow::Result<()>,
    {
        let mut outcome = DueOutcome::default();
        for entry in self
            .entries
            .iter_mut()
            .filter(|e| e.status == ScheduleStatus::Pending && e.scheduled_time <= now)
        {
            let Some(zone) = zones.find(&entry.zone_id) else {
                warn!(
                    schedule = %entry.id,
                    zone = %entry.zone_id,
                    "executor: zone no longer exists, cancelling"
                );
                outcome.cancelled.extend(abort(entry, ZONE_REMOVED_REASON, now));
                continue;
            };

            if let Err(e) = open(zone) {
                let reason = format!("{VALVE_FAILED_REASON}: {e}");
                warn!(schedule = %entry.id, zone = %entry.zone_id, "executor: {reason}");
                outcome.cancelled.extend(abort(entry, &reason, now));
                continue;
            }

            if let Err(e) = entry.transition(ScheduleStatus::Active, now) {
                warn!(schedule = %entry.id, "executor: {e}");
                continue;
            }
            info!(
                schedule = %entry.id,
                zone = %entry.zone_id,
                duration_min = entry.duration_min,
                "executor: irrigation started"
            );
            outcome.started.push(entry.clone());
        }
        outcome
    }

    /// Drop the oldest terminal entries beyond the history cap.
    fn prune(&mut self) {
        let terminal = self.entries.iter().filter(|e| e.status.is_terminal()).count();
        let mut excess = terminal.saturating_sub(MAX_HISTORY);
        if excess == 0 {
            return;
        }
        self.entries.retain(|e| {
            if excess > 0 && e.status.is_terminal() {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }
}

/// Pending → Cancelled with `reason`. `None` if the entry already moved on.
pub fn abort(
    entry: &mut ScheduleEntry,
    reason: &str,
    now: OffsetDateTime,
) -> Option<ScheduleEntry> {
    match entry.transition(ScheduleStatus::Cancelled, now) {
        Ok(()) => {
            entry.reason = reason.to_string();
            Some(entry.clone())
        }
        Err(e) => {
            warn!(schedule = %entry.id, "executor: {e}");
            None
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
