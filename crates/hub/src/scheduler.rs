//! Auto-scheduler: turns need assessments into pending schedule entries.
//!
//! One pass walks every active zone, asks the evaluator whether it needs
//! water, picks a start time and enqueues an entry unless the zone already
//! has a pending run close to that time. The caller holds the schedule book
//! write lock for the whole pass, so the conflict check and the insert are
//! a single atomic step.
//!
//! ```text
//! urgency high  ──▶ now + 30 min
//! otherwise     ──▶ tomorrow at morning_start + jitter (0-120 min, < evening_end),
//!                   read in the farm's utc_offset_minutes
//!                   + rain_delay_hours while it is raining
//! ```

use time::{Duration, OffsetDateTime, PrimitiveDateTime};
use tracing::{debug, info, warn};

use crate::evaluator::{self, Assessment};
use crate::executor::ScheduleBook;
use crate::model::{
    water_amount_liters, CurrentConditions, ForecastDay, Origin, ScheduleEntry, ScheduleStatus,
    Settings, Urgency, Zone,
};
use crate::registry::ZoneRegistry;

/// High-urgency entries start this long after the pass.
const URGENT_LEAD: Duration = Duration::minutes(30);

/// Upper bound of the random offset added to `morning_start`.
const MAX_JITTER_MIN: i64 = 120;

/// No two pending entries for one zone within this distance of each other.
pub const CONFLICT_WINDOW: Duration = Duration::hours(1);

pub struct AutoScheduler {
    rng: fastrand::Rng,
}

impl AutoScheduler {
    pub fn new() -> Self {
        Self {
            rng: fastrand::Rng::new(),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: fastrand::Rng::with_seed(seed),
        }
    }

    /// Run one scheduling pass and insert the new entries into `book`.
    /// Returns the entries created.
    pub fn plan(
        &mut self,
        zones: &ZoneRegistry,
        book: &mut ScheduleBook,
        settings: &Settings,
        current: Option<&CurrentConditions>,
        forecast: &[ForecastDay],
        now: OffsetDateTime,
    ) -> Vec<ScheduleEntry> {
        let raining = settings.weather_integration && current.is_some_and(|c| c.is_raining());
        let mut created = Vec::new();

        for zone in zones.list().iter().filter(|z| z.active) {
            // A corrupt stored zone must not take the rest of the pass down.
            if let Err(e) = zone.check() {
                warn!(zone = %zone.id, "scheduler: skipping invalid zone: {e}");
                continue;
            }

            let assessment = evaluator::evaluate(zone, settings, current, forecast);
            if !assessment.needed {
                debug!(zone = %zone.id, reason = %assessment.reason, "scheduler: not needed");
                continue;
            }

            let mut at = self.candidate_time(assessment.urgency, settings, now);
            if raining && assessment.urgency != Urgency::High {
                at += Duration::hours(i64::from(settings.rain_delay_hours));
            }

            if book.has_pending_near(&zone.id, at, CONFLICT_WINDOW) {
                debug!(zone = %zone.id, "scheduler: pending entry already near candidate time");
                continue;
            }

            let entry = new_entry(zone, &assessment, at, now);
            info!(
                zone = %zone.id,
                schedule = %entry.id,
                urgency = %assessment.urgency,
                duration_min = entry.duration_min,
                at = %entry.scheduled_time,
                "scheduler: irrigation scheduled"
            );
            book.insert(entry.clone());
            created.push(entry);
        }

        created
    }

    fn candidate_time(
        &mut self,
        urgency: Urgency,
        settings: &Settings,
        now: OffsetDateTime,
    ) -> OffsetDateTime {
        if urgency == Urgency::High {
            return now + URGENT_LEAD;
        }

        // "Tomorrow" and the window are the farm's wall clock, not UTC.
        let offset = settings.local_offset();
        let local = now.to_offset(offset);
        let day = local.date().next_day().unwrap_or(local.date());
        let at = |t: time::Time| PrimitiveDateTime::new(day, t).assume_offset(offset);
        let start = at(settings.morning_start.to_time());
        let end = at(settings.evening_end.to_time());

        let jittered = start + Duration::minutes(self.rng.i64(0..=MAX_JITTER_MIN));
        if jittered >= end {
            start
        } else {
            jittered
        }
    }
}

impl Default for AutoScheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn new_entry(
    zone: &Zone,
    assessment: &Assessment,
    at: OffsetDateTime,
    now: OffsetDateTime,
) -> ScheduleEntry {
    ScheduleEntry {
        id: uuid::Uuid::new_v4().to_string(),
        zone_id: zone.id.clone(),
        zone_name: zone.name.clone(),
        scheduled_time: at,
        duration_min: assessment.duration_min,
        status: ScheduleStatus::Pending,
        reason: assessment.reason.clone(),
        water_amount_liters: water_amount_liters(
            zone.flow_rate_lpm,
            assessment.duration_min,
            zone.area_acres,
        ),
        origin: Origin::Auto,
        urgency: Some(assessment.urgency),
        created_at: now,
        started_at: None,
        completed_at: None,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
