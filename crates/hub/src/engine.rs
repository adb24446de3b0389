//! The irrigation engine: shared state plus every operation the HTTP layer
//! and the periodic tasks call.
//!
//! Locking rules:
//! - Schedule book before zone registry whenever both are held.
//! - Simulator / scheduler RNG and valve mutexes are taken after the state
//!   locks.
//! - Opening a valve happens under the schedule book lock, so an entry only
//!   goes active once its valve is open. No state lock is held across
//!   persistence, notification or closing a valve.
//! - Settings and weather are swapped as whole `Arc`s; readers take a
//!   snapshot at the start of an operation.

use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::db::{Db, WateringEvent, SCHEDULES_KEY, SETTINGS_KEY, ZONES_KEY};
use crate::error::{EngineError, EngineResult};
use crate::executor::{abort, ScheduleBook, VALVE_FAILED_REASON, ZONE_REMOVED_REASON};
use crate::model::{
    water_amount_liters, ForecastDay, Origin, ScheduleEntry, ScheduleStatus, Settings,
    SettingsPatch, WeatherSnapshot, Zone, ZonePatch, ZoneSpec,
};
use crate::notify::{Notification, Notifier, Severity};
use crate::registry::ZoneRegistry;
use crate::scheduler::AutoScheduler;
use crate::simulator::MoistureSimulator;
use crate::state::{ActivityLog, EventKind, ScheduleCounts, StatusResponse, ZoneCounts};
use crate::valve::ValveBoard;

pub const MANUAL_REASON: &str = "Manual irrigation";

/// Durable documents.
#[derive(Debug, Clone, Copy)]
enum Doc {
    Zones,
    Schedules,
    Settings,
}

pub struct Engine {
    zones: RwLock<ZoneRegistry>,
    schedules: RwLock<ScheduleBook>,
    settings: RwLock<Arc<Settings>>,
    weather: RwLock<Option<Arc<WeatherSnapshot>>>,
    activity: RwLock<ActivityLog>,

    simulator: Mutex<MoistureSimulator>,
    scheduler: Mutex<AutoScheduler>,
    valves: Mutex<Option<ValveBoard>>,
    /// Serialises durable writes so the last write carries the latest state.
    persist_lock: Mutex<()>,

    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    store: Option<Db>,
    started_at: OffsetDateTime,
}

impl Engine {
    pub fn new(settings: Settings, clock: Arc<dyn Clock>, notifier: Arc<dyn Notifier>) -> Self {
        let started_at = clock.now();
        Self {
            zones: RwLock::new(ZoneRegistry::new()),
            schedules: RwLock::new(ScheduleBook::new()),
            settings: RwLock::new(Arc::new(settings)),
            weather: RwLock::new(None),
            activity: RwLock::new(ActivityLog::new()),
            simulator: Mutex::new(MoistureSimulator::new()),
            scheduler: Mutex::new(AutoScheduler::new()),
            valves: Mutex::new(None),
            persist_lock: Mutex::new(()),
            clock,
            notifier,
            store: None,
            started_at,
        }
    }

    pub fn with_store(mut self, db: Db) -> Self {
        self.store = Some(db);
        self
    }

    /// Deterministic simulator and scheduler jitter.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.simulator = Mutex::new(MoistureSimulator::with_seed(seed));
        self.scheduler = Mutex::new(AutoScheduler::with_seed(seed.wrapping_add(1)));
        self
    }

    pub fn with_valves(mut self, board: ValveBoard) -> Self {
        self.valves = Mutex::new(Some(board));
        self
    }

    /// Load zones, schedules and settings from the store. Stored settings
    /// replace the ones the engine was built with. Unreadable documents are
    /// logged and skipped.
    pub async fn restore(&self) {
        let Some(db) = &self.store else { return };

        if let Some(zones) = load_doc::<Vec<Zone>>(db, ZONES_KEY).await {
            *self.zones.write().await = ZoneRegistry::from_zones(zones);
        }
        if let Some(entries) = load_doc::<Vec<ScheduleEntry>>(db, SCHEDULES_KEY).await {
            *self.schedules.write().await = ScheduleBook::from_entries(entries);
        }
        if let Some(settings) = load_doc::<Settings>(db, SETTINGS_KEY).await {
            match settings.validate() {
                Ok(()) => *self.settings.write().await = Arc::new(settings),
                Err(e) => warn!("restore: stored settings rejected, keeping configured: {e}"),
            }
        }

        let zones = self.zones.read().await.len();
        let schedules = self.schedules.read().await.list().len();
        info!(zones, schedules, "engine state restored");
        self.record(
            EventKind::System,
            format!("state restored ({zones} zones, {schedules} schedules)"),
        )
        .await;
    }

    // -----------------------------------------------------------------------
    // Zones
    // -----------------------------------------------------------------------

    pub async fn list_zones(&self) -> Vec<Zone> {
        self.zones.read().await.list().to_vec()
    }

    pub async fn get_zone(&self, id: &str) -> EngineResult<Zone> {
        self.zones.read().await.get(id).cloned()
    }

    /// Add a zone, or refresh the static attributes of an existing one.
    pub async fn upsert_zone(&self, spec: ZoneSpec) -> EngineResult<Zone> {
        spec.validate()?;
        let seed = self.simulator.lock().await.seed_moisture();
        let now = self.clock.now();
        let (zone, created) = self.zones.write().await.upsert(spec, seed, now)?;

        if created {
            info!(zone = %zone.id, name = %zone.name, "zone added");
            self.record(EventKind::Zone, format!("zone '{}' added", zone.name))
                .await;
            self.notify(
                "Zone added",
                format!(
                    "{} ({}, {} acres) is now monitored",
                    zone.name, zone.crop_type, zone.area_acres
                ),
                Severity::Success,
            )
            .await;
        } else {
            info!(zone = %zone.id, "zone updated");
            self.record(EventKind::Zone, format!("zone '{}' updated", zone.name))
                .await;
        }
        self.persist(Doc::Zones).await;
        Ok(zone)
    }

    pub async fn update_zone(&self, id: &str, patch: ZonePatch) -> EngineResult<Zone> {
        let zone = self.zones.write().await.update(id, &patch)?;
        info!(zone = %zone.id, "zone updated");
        self.record(EventKind::Zone, format!("zone '{}' updated", zone.name))
            .await;
        self.persist(Doc::Zones).await;
        Ok(zone)
    }

    /// Remove a zone and cancel its pending entries, so a zone re-added
    /// under the same id starts with a clean book. An active run finishes
    /// without replenishment.
    pub async fn delete_zone(&self, id: &str) -> EngineResult<Zone> {
        let now = self.clock.now();
        let (zone, cancelled) = {
            let mut book = self.schedules.write().await;
            let zone = self.zones.write().await.remove(id)?;
            let cancelled = book.cancel_pending_for_zone(&zone.id, ZONE_REMOVED_REASON, now);
            (zone, cancelled)
        };

        info!(zone = %zone.id, cancelled = cancelled.len(), "zone removed");
        self.record(EventKind::Zone, format!("zone '{}' removed", zone.name))
            .await;
        for entry in &cancelled {
            self.record(
                EventKind::Schedule,
                format!("irrigation of '{}' cancelled: {}", entry.zone_name, entry.reason),
            )
            .await;
            self.log_outcome(entry).await;
        }
        self.notify(
            "Zone removed",
            format!("{} is no longer monitored", zone.name),
            Severity::Warning,
        )
        .await;
        if !cancelled.is_empty() {
            self.persist(Doc::Schedules).await;
        }
        self.persist(Doc::Zones).await;
        Ok(zone)
    }

    pub async fn set_zone_active(&self, id: &str, active: bool) -> EngineResult<Zone> {
        let patch = ZonePatch {
            active: Some(active),
            ..ZonePatch::default()
        };
        self.update_zone(id, patch).await
    }

    // -----------------------------------------------------------------------
    // Schedules
    // -----------------------------------------------------------------------

    pub async fn list_schedules(&self) -> Vec<ScheduleEntry> {
        self.schedules.read().await.list().to_vec()
    }

    pub async fn active_schedule_ids(&self) -> Vec<String> {
        self.schedules
            .read()
            .await
            .list()
            .iter()
            .filter(|e| e.status == ScheduleStatus::Active)
            .map(|e| e.id.clone())
            .collect()
    }

    /// Create a manual entry for `zone_id` and start it immediately.
    /// The caller is responsible for finishing the run. If the valve does not
    /// open, the entry is kept as cancelled and the call fails.
    pub async fn trigger_manual_water(&self, zone_id: &str) -> EngineResult<ScheduleEntry> {
        let settings = self.settings().await;
        let now = self.clock.now();

        let entry = {
            let mut book = self.schedules.write().await;
            let zone = self.zones.read().await.get(zone_id)?.clone();

            let duration = settings.clamp_duration(f64::from(zone.default_duration_min));
            let mut entry = ScheduleEntry {
                id: uuid::Uuid::new_v4().to_string(),
                zone_id: zone.id.clone(),
                zone_name: zone.name.clone(),
                scheduled_time: now,
                duration_min: duration,
                status: ScheduleStatus::Pending,
                reason: MANUAL_REASON.to_string(),
                water_amount_liters: water_amount_liters(
                    zone.flow_rate_lpm,
                    duration,
                    zone.area_acres,
                ),
                origin: Origin::Manual,
                urgency: None,
                created_at: now,
                started_at: None,
                completed_at: None,
            };
            let opened = open_valve(self.valves.lock().await.as_mut(), &zone);
            match opened {
                Ok(()) => entry.transition(ScheduleStatus::Active, now)?,
                Err(e) => {
                    let reason = format!("{VALVE_FAILED_REASON}: {e}");
                    abort(&mut entry, &reason, now);
                }
            }
            book.insert(entry.clone());
            entry
        };

        if entry.status == ScheduleStatus::Cancelled {
            error!(
                zone = %entry.zone_id,
                schedule = %entry.id,
                "manual irrigation: {}",
                entry.reason
            );
            self.record(
                EventKind::Error,
                format!("manual irrigation of '{}' failed: {}", entry.zone_name, entry.reason),
            )
            .await;
            self.log_outcome(&entry).await;
            self.persist(Doc::Schedules).await;
            return Err(EngineError::ExternalUnavailable(entry.reason));
        }

        info!(
            zone = %entry.zone_id,
            schedule = %entry.id,
            duration_min = entry.duration_min,
            "manual irrigation started"
        );
        self.record(
            EventKind::Schedule,
            format!(
                "manual irrigation of '{}' started ({} min)",
                entry.zone_name, entry.duration_min
            ),
        )
        .await;
        self.notify(
            "Irrigation started",
            format!(
                "Manual run for {}: {} min, ~{:.0} L",
                entry.zone_name, entry.duration_min, entry.water_amount_liters
            ),
            Severity::Info,
        )
        .await;
        self.persist(Doc::Schedules).await;
        Ok(entry)
    }

    pub async fn cancel_schedule(&self, id: &str) -> EngineResult<ScheduleEntry> {
        let now = self.clock.now();
        let entry = self.schedules.write().await.cancel(id, now)?;

        info!(schedule = %entry.id, zone = %entry.zone_id, "schedule cancelled");
        self.record(
            EventKind::Schedule,
            format!("irrigation of '{}' cancelled", entry.zone_name),
        )
        .await;
        self.log_outcome(&entry).await;
        self.persist(Doc::Schedules).await;
        Ok(entry)
    }

    /// Start every due pending entry. Returns the entries that went active so
    /// the caller can finish them. An entry whose valve fails to open is
    /// cancelled and never returned.
    pub async fn start_due(&self) -> Vec<ScheduleEntry> {
        let now = self.clock.now();
        let outcome = {
            let mut book = self.schedules.write().await;
            let zones = self.zones.read().await;
            let mut valves = self.valves.lock().await;
            book.start_due(&zones, now, |zone| open_valve(valves.as_mut(), zone))
        };

        if outcome.started.is_empty() && outcome.cancelled.is_empty() {
            return Vec::new();
        }

        for entry in &outcome.started {
            self.record(
                EventKind::Schedule,
                format!(
                    "irrigation of '{}' started ({} min)",
                    entry.zone_name, entry.duration_min
                ),
            )
            .await;
        }
        for entry in &outcome.cancelled {
            let kind = if entry.reason.starts_with(VALVE_FAILED_REASON) {
                error!(zone = %entry.zone_id, schedule = %entry.id, "{}", entry.reason);
                EventKind::Error
            } else {
                EventKind::Schedule
            };
            self.record(
                kind,
                format!("irrigation of '{}' cancelled: {}", entry.zone_name, entry.reason),
            )
            .await;
            self.log_outcome(entry).await;
        }
        self.persist(Doc::Schedules).await;
        outcome.started
    }

    /// Finish an active run: mark it completed, replenish the zone and close
    /// its valve.
    pub async fn complete_schedule(&self, id: &str) -> EngineResult<ScheduleEntry> {
        let now = self.clock.now();
        let (entry, zone) = {
            let mut book = self.schedules.write().await;
            let entry = book.transition(id, ScheduleStatus::Completed, now)?;
            let zone = match self.zones.write().await.replenish(&entry.zone_id, now) {
                Ok(z) => Some(z),
                Err(_) => {
                    warn!(
                        schedule = %entry.id,
                        zone = %entry.zone_id,
                        "zone removed during run, nothing to replenish"
                    );
                    None
                }
            };
            (entry, zone)
        };

        self.close_valve(&entry.zone_id).await;
        info!(
            schedule = %entry.id,
            zone = %entry.zone_id,
            moisture = zone.as_ref().map(|z| z.current_moisture),
            "irrigation completed"
        );
        self.record(
            EventKind::Schedule,
            format!("irrigation of '{}' completed", entry.zone_name),
        )
        .await;
        self.notify(
            "Irrigation completed",
            format!(
                "{} watered for {} min (~{:.0} L)",
                entry.zone_name, entry.duration_min, entry.water_amount_liters
            ),
            Severity::Success,
        )
        .await;
        self.log_outcome(&entry).await;
        self.persist(Doc::Schedules).await;
        if zone.is_some() {
            self.persist(Doc::Zones).await;
        }
        Ok(entry)
    }

    /// One scheduler pass, only when auto-scheduling is enabled.
    pub async fn run_auto_schedule_tick(&self) -> Vec<ScheduleEntry> {
        if !self.settings().await.auto_scheduling {
            debug!("auto-scheduling disabled, skipping pass");
            return Vec::new();
        }
        self.schedule_pass().await
    }

    /// One scheduler pass regardless of the auto-scheduling flag.
    pub async fn generate_schedule_now(&self) -> Vec<ScheduleEntry> {
        self.schedule_pass().await
    }

    async fn schedule_pass(&self) -> Vec<ScheduleEntry> {
        let settings = self.settings().await;
        let weather = self.weather_snapshot().await;
        let current = weather.as_ref().and_then(|w| w.current.as_ref());
        let forecast: &[ForecastDay] = weather.as_ref().map(|w| w.forecast.as_slice()).unwrap_or(&[]);
        let now = self.clock.now();

        // Conflict check and insert happen under one write lock.
        let created = {
            let mut book = self.schedules.write().await;
            let zones = self.zones.read().await;
            let mut scheduler = self.scheduler.lock().await;
            scheduler.plan(&zones, &mut book, &settings, current, forecast, now)
        };

        if created.is_empty() {
            return created;
        }

        let zones: Vec<&str> = created.iter().map(|e| e.zone_name.as_str()).collect();
        self.record(
            EventKind::Schedule,
            format!("{} irrigation run(s) scheduled: {}", created.len(), zones.join(", ")),
        )
        .await;
        self.notify(
            "Schedule generated",
            format!("{} irrigation run(s) planned for {}", created.len(), zones.join(", ")),
            Severity::Info,
        )
        .await;
        self.persist(Doc::Schedules).await;
        created
    }

    // -----------------------------------------------------------------------
    // Simulation & weather
    // -----------------------------------------------------------------------

    /// Advance every zone's moisture by one simulator step. Weather only
    /// shapes the step while weather integration is on.
    pub async fn simulate_tick(&self) -> usize {
        let weather = if self.settings().await.weather_integration {
            self.weather_snapshot().await
        } else {
            None
        };
        let current = weather.as_ref().and_then(|w| w.current.as_ref());
        let now = self.clock.now();

        let updated = {
            let mut zones = self.zones.write().await;
            self.simulator.lock().await.tick(&mut zones, current, now)
        };
        if updated > 0 {
            self.persist(Doc::Zones).await;
        }
        updated
    }

    /// Replace the weather snapshot. `None` means no weather data this cycle.
    pub async fn set_weather(&self, snapshot: Option<WeatherSnapshot>) {
        let detail = match snapshot.as_ref().and_then(|s| s.current.as_ref()) {
            Some(c) => format!(
                "weather updated: {:.1}°C, {:.0}% humidity, {}",
                c.temperature_c, c.humidity_pct, c.description
            ),
            None if snapshot.is_some() => "weather updated: forecast only".to_string(),
            None => "weather unavailable".to_string(),
        };
        *self.weather.write().await = snapshot.map(Arc::new);
        self.record(EventKind::Weather, detail).await;
    }

    /// Drop the held snapshot, e.g. once weather integration is switched off.
    /// Quiet when there was nothing to drop.
    pub async fn clear_weather(&self) {
        if self.weather.write().await.take().is_some() {
            info!("weather snapshot cleared");
            self.record(EventKind::Weather, "weather cleared").await;
        }
    }

    pub async fn weather_snapshot(&self) -> Option<Arc<WeatherSnapshot>> {
        self.weather.read().await.clone()
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    pub async fn settings(&self) -> Arc<Settings> {
        self.settings.read().await.clone()
    }

    /// Validate and swap in a patched copy of the settings.
    pub async fn update_settings(&self, patch: SettingsPatch) -> EngineResult<Settings> {
        let next = {
            let mut current = self.settings.write().await;
            let next = patch.applied_to(&current);
            next.validate()?;
            *current = Arc::new(next.clone());
            next
        };
        info!(?next, "settings updated");
        self.record(EventKind::Settings, "settings updated").await;
        self.persist(Doc::Settings).await;
        Ok(next)
    }

    // -----------------------------------------------------------------------
    // Reporting
    // -----------------------------------------------------------------------

    pub async fn status(&self) -> StatusResponse {
        let settings = self.settings().await;
        let weather = self.weather_snapshot().await.map(|w| (*w).clone());

        let schedules = {
            let book = self.schedules.read().await;
            ScheduleCounts {
                pending: book.count(ScheduleStatus::Pending),
                active: book.count(ScheduleStatus::Active),
                completed: book.count(ScheduleStatus::Completed),
                cancelled: book.count(ScheduleStatus::Cancelled),
            }
        };
        let zones = {
            let reg = self.zones.read().await;
            ZoneCounts {
                total: reg.len(),
                active: reg.list().iter().filter(|z| z.active).count(),
                dry: reg
                    .list()
                    .iter()
                    .filter(|z| z.current_moisture < settings.moisture_threshold)
                    .count(),
            }
        };

        StatusResponse {
            uptime_secs: (self.clock.now() - self.started_at).whole_seconds(),
            persistence: self.store.is_some(),
            settings: (*settings).clone(),
            weather,
            zones,
            schedules,
            events: self.activity.read().await.recent(),
        }
    }

    /// Most recent finished runs, newest first. Empty without a store.
    pub async fn history(&self, limit: i64) -> EngineResult<Vec<WateringEvent>> {
        let Some(db) = &self.store else {
            return Ok(Vec::new());
        };
        db.recent_watering_events(limit).await.map_err(|e| {
            warn!("history: {e:#}");
            EngineError::ExternalUnavailable(format!("history unavailable: {e}"))
        })
    }

    /// Fail-safe: close every valve.
    pub async fn shutdown(&self) {
        if let Some(board) = self.valves.lock().await.as_mut() {
            board.all_off();
        }
        self.record(EventKind::System, "engine stopped").await;
    }

    // -----------------------------------------------------------------------
    // Side effects
    // -----------------------------------------------------------------------

    pub async fn record(&self, kind: EventKind, detail: impl Into<String>) {
        let now = self.clock.now();
        self.activity.write().await.record(now, kind, detail);
    }

    async fn notify(&self, title: &str, message: String, severity: Severity) {
        if self.settings.read().await.notifications {
            self.notifier
                .notify(Notification::new(title, message, severity));
        }
    }

    async fn close_valve(&self, zone_id: &str) {
        if let Some(board) = self.valves.lock().await.as_mut() {
            board.close(zone_id);
        }
    }

    async fn log_outcome(&self, entry: &ScheduleEntry) {
        let Some(db) = &self.store else { return };
        if let Err(e) = db.insert_watering_event(entry).await {
            warn!(schedule = %entry.id, "history: {e:#}");
        }
    }

    async fn persist(&self, doc: Doc) {
        let Some(db) = &self.store else { return };
        let _guard = self.persist_lock.lock().await;
        let now = self.clock.now();

        let result = match doc {
            Doc::Zones => {
                let zones = self.zones.read().await.list().to_vec();
                db.put_state(ZONES_KEY, &zones, now).await
            }
            Doc::Schedules => {
                let entries = self.schedules.read().await.list().to_vec();
                db.put_state(SCHEDULES_KEY, &entries, now).await
            }
            Doc::Settings => {
                let settings = self.settings().await;
                db.put_state(SETTINGS_KEY, settings.as_ref(), now).await
            }
        };
        if let Err(e) = result {
            warn!(?doc, "persist failed: {e:#}");
        }
    }

    #[cfg(all(test, not(feature = "gpio")))]
    async fn valve_is_open(&self, zone_id: &str) -> bool {
        self.valves
            .lock()
            .await
            .as_ref()
            .is_some_and(|b| b.is_open(zone_id))
    }
}

/// Drive `zone`'s valve open. No board means nothing to drive.
fn open_valve(board: Option<&mut ValveBoard>, zone: &Zone) -> anyhow::Result<()> {
    match board {
        Some(board) => board.open(&zone.id, zone.valve_pin),
        None => Ok(()),
    }
}

async fn load_doc<T: serde::de::DeserializeOwned>(db: &Db, key: &str) -> Option<T> {
    match db.get_state::<T>(key).await {
        Ok(doc) => doc,
        Err(e) => {
            warn!(key, "restore: {e:#}");
            None
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
