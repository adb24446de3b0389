//! Core data types shared by the registry, simulator, evaluator, scheduler
//! and executor.

use serde::{Deserialize, Serialize};
use std::fmt;
use time::{OffsetDateTime, UtcOffset};

use crate::error::{EngineError, EngineResult};

/// Moisture bounds enforced after every simulated update.
pub const MOISTURE_FLOOR: f64 = 10.0;
pub const MOISTURE_CEILING: f64 = 95.0;

/// Allowed range for a zone's target moisture.
pub const TARGET_MOISTURE_MIN: f64 = 30.0;
pub const TARGET_MOISTURE_MAX: f64 = 90.0;

/// Shortest irrigation run ever scheduled, in minutes.
pub const MIN_DURATION_MIN: u32 = 5;

/// Real-world UTC offsets run from -12:00 to +14:00.
const UTC_OFFSET_RANGE_MIN: std::ops::RangeInclusive<i32> = -720..=840;

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
pub const VALID_GPIO_PINS: &[u8] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

// ---------------------------------------------------------------------------
// Zone enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SoilType {
    Sandy,
    Clay,
    Loamy,
    Silt,
    Red,
    Black,
    Alluvial,
}

impl SoilType {
    /// How quickly the soil dries out relative to loam.
    pub fn drainage_multiplier(self) -> f64 {
        match self {
            Self::Sandy => 1.5,
            Self::Clay => 0.7,
            Self::Black => 0.8,
            Self::Loamy | Self::Silt | Self::Red | Self::Alluvial => 1.0,
        }
    }

    /// Duration multiplier applied by the need evaluator.
    pub fn retention_factor(self) -> f64 {
        match self {
            Self::Sandy => 0.8,
            Self::Clay => 1.2,
            _ => 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IrrigationMethod {
    Drip,
    Sprinkler,
    Flood,
    Manual,
}

impl IrrigationMethod {
    /// Less efficient methods need longer runs to deliver the same water.
    pub fn efficiency_factor(self) -> f64 {
        match self {
            Self::Drip => 1.0,
            Self::Sprinkler => 1.2,
            Self::Flood => 1.5,
            Self::Manual => 1.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Medium,
    High,
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

// ---------------------------------------------------------------------------
// Zone
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: String,
    pub name: String,
    pub crop_type: String,
    pub area_acres: f64,
    pub soil_type: SoilType,
    pub irrigation_method: IrrigationMethod,
    pub flow_rate_lpm: f64,
    pub default_duration_min: u32,
    pub priority: Priority,
    /// Relay GPIO pin driving this zone's valve, if wired.
    #[serde(default)]
    pub valve_pin: Option<u8>,

    pub current_moisture: f64,
    pub target_moisture: f64,
    pub active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub last_watered: OffsetDateTime,
}

impl Zone {
    /// Re-check invariants on a zone that came from storage or a patch.
    pub fn check(&self) -> EngineResult<()> {
        let mut errors = Vec::new();
        check_static(
            &mut errors,
            &self.name,
            self.area_acres,
            self.flow_rate_lpm,
            self.default_duration_min,
            self.target_moisture,
        );
        check_moisture(&mut errors, self.current_moisture);
        check_pin(&mut errors, self.valve_pin);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::from_violations(errors))
        }
    }
}

/// Payload for adding or upserting a zone.
#[derive(Debug, Clone, Deserialize)]
pub struct ZoneSpec {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub crop_type: String,
    pub area_acres: f64,
    pub soil_type: SoilType,
    pub irrigation_method: IrrigationMethod,
    pub flow_rate_lpm: f64,
    pub default_duration_min: u32,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_target_moisture")]
    pub target_moisture: f64,
    /// Initial moisture estimate; a random seed in [50,70] when absent.
    #[serde(default)]
    pub current_moisture: Option<f64>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub valve_pin: Option<u8>,
}

fn default_target_moisture() -> f64 {
    60.0
}

impl ZoneSpec {
    /// Collect every violation in the payload rather than stopping at the first.
    pub fn validate(&self) -> EngineResult<()> {
        let mut errors = Vec::new();
        if let Some(id) = &self.id {
            if id.trim().is_empty() {
                errors.push("id is empty".to_string());
            }
        }
        check_static(
            &mut errors,
            &self.name,
            self.area_acres,
            self.flow_rate_lpm,
            self.default_duration_min,
            self.target_moisture,
        );
        if let Some(m) = self.current_moisture {
            check_moisture(&mut errors, m);
        }
        check_pin(&mut errors, self.valve_pin);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::from_violations(errors))
        }
    }
}

/// Partial update of a zone. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ZonePatch {
    pub name: Option<String>,
    pub crop_type: Option<String>,
    pub area_acres: Option<f64>,
    pub soil_type: Option<SoilType>,
    pub irrigation_method: Option<IrrigationMethod>,
    pub flow_rate_lpm: Option<f64>,
    pub default_duration_min: Option<u32>,
    pub priority: Option<Priority>,
    pub target_moisture: Option<f64>,
    pub current_moisture: Option<f64>,
    pub active: Option<bool>,
    pub valve_pin: Option<u8>,
}

impl ZonePatch {
    pub fn apply_to(&self, zone: &mut Zone) {
        if let Some(v) = &self.name {
            zone.name = v.clone();
        }
        if let Some(v) = &self.crop_type {
            zone.crop_type = v.clone();
        }
        if let Some(v) = self.area_acres {
            zone.area_acres = v;
        }
        if let Some(v) = self.soil_type {
            zone.soil_type = v;
        }
        if let Some(v) = self.irrigation_method {
            zone.irrigation_method = v;
        }
        if let Some(v) = self.flow_rate_lpm {
            zone.flow_rate_lpm = v;
        }
        if let Some(v) = self.default_duration_min {
            zone.default_duration_min = v;
        }
        if let Some(v) = self.priority {
            zone.priority = v;
        }
        if let Some(v) = self.target_moisture {
            zone.target_moisture = v;
        }
        if let Some(v) = self.current_moisture {
            zone.current_moisture = v;
        }
        if let Some(v) = self.active {
            zone.active = v;
        }
        if let Some(v) = self.valve_pin {
            zone.valve_pin = Some(v);
        }
    }
}

fn check_static(
    errors: &mut Vec<String>,
    name: &str,
    area_acres: f64,
    flow_rate_lpm: f64,
    default_duration_min: u32,
    target_moisture: f64,
) {
    if name.trim().is_empty() {
        errors.push("name is empty".to_string());
    }
    if !(area_acres.is_finite() && area_acres > 0.0) {
        errors.push(format!("area_acres must be positive, got {area_acres}"));
    }
    if !(flow_rate_lpm.is_finite() && flow_rate_lpm > 0.0) {
        errors.push(format!("flow_rate_lpm must be positive, got {flow_rate_lpm}"));
    }
    if default_duration_min == 0 {
        errors.push("default_duration_min must be positive, got 0".to_string());
    }
    if !(TARGET_MOISTURE_MIN..=TARGET_MOISTURE_MAX).contains(&target_moisture) {
        errors.push(format!(
            "target_moisture {target_moisture} out of range [{TARGET_MOISTURE_MIN}, {TARGET_MOISTURE_MAX}]"
        ));
    }
}

fn check_moisture(errors: &mut Vec<String>, moisture: f64) {
    if !(0.0..=100.0).contains(&moisture) {
        errors.push(format!("current_moisture {moisture} out of range [0, 100]"));
    }
}

fn check_pin(errors: &mut Vec<String>, pin: Option<u8>) {
    if let Some(pin) = pin {
        if !VALID_GPIO_PINS.contains(&pin) {
            errors.push(format!(
                "valve_pin {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Wall-clock time of day, serialised as `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    pub hour: u8,
    pub minute: u8,
}

impl TimeOfDay {
    pub const fn new(hour: u8, minute: u8) -> Self {
        Self { hour, minute }
    }

    pub fn to_time(self) -> time::Time {
        // Fields are range-checked on construction from text.
        time::Time::from_hms(self.hour, self.minute, 0).unwrap_or(time::Time::MIDNIGHT)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        let (h, m) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| format!("time of day '{s}' must be HH:MM"))?;
        let hour: u8 = h.parse().map_err(|_| format!("bad hour in '{s}'"))?;
        let minute: u8 = m.parse().map_err(|_| format!("bad minute in '{s}'"))?;
        if hour > 23 || minute > 59 {
            return Err(format!("time of day '{s}' out of range"));
        }
        Ok(Self { hour, minute })
    }
}

impl From<TimeOfDay> for String {
    fn from(t: TimeOfDay) -> Self {
        t.to_string()
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub auto_scheduling: bool,
    pub weather_integration: bool,
    /// Moisture percentage below which a zone needs water (20-80).
    pub moisture_threshold: f64,
    pub rain_delay_hours: u32,
    pub max_daily_watering_min: u32,
    pub morning_start: TimeOfDay,
    pub evening_end: TimeOfDay,
    /// Offset of the farm's wall clock from UTC. The watering window and
    /// "tomorrow" are read in this offset.
    pub utc_offset_minutes: i32,
    pub notifications: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_scheduling: true,
            weather_integration: true,
            moisture_threshold: 40.0,
            rain_delay_hours: 24,
            max_daily_watering_min: 120,
            morning_start: TimeOfDay::new(6, 0),
            evening_end: TimeOfDay::new(18, 0),
            utc_offset_minutes: 0,
            notifications: true,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> EngineResult<()> {
        let mut errors = Vec::new();
        if !(20.0..=80.0).contains(&self.moisture_threshold) {
            errors.push(format!(
                "moisture_threshold {} out of range [20, 80]",
                self.moisture_threshold
            ));
        }
        if self.max_daily_watering_min < MIN_DURATION_MIN {
            errors.push(format!(
                "max_daily_watering_min must be at least {MIN_DURATION_MIN}, got {}",
                self.max_daily_watering_min
            ));
        }
        if self.morning_start >= self.evening_end {
            errors.push(format!(
                "morning_start ({}) must be before evening_end ({})",
                self.morning_start, self.evening_end
            ));
        }
        if !UTC_OFFSET_RANGE_MIN.contains(&self.utc_offset_minutes) {
            errors.push(format!(
                "utc_offset_minutes {} out of range [-720, 840]",
                self.utc_offset_minutes
            ));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::from_violations(errors))
        }
    }

    /// The farm's local offset. Falls back to UTC for values that never
    /// passed validation.
    pub fn local_offset(&self) -> UtcOffset {
        UtcOffset::from_whole_seconds(self.utc_offset_minutes.saturating_mul(60))
            .unwrap_or(UtcOffset::UTC)
    }

    /// Clamp a duration (minutes) into `[5, max_daily_watering_min]`.
    pub fn clamp_duration(&self, minutes: f64) -> u32 {
        let max = self.max_daily_watering_min.max(MIN_DURATION_MIN) as f64;
        let m = if minutes.is_finite() { minutes } else { max };
        m.round().clamp(MIN_DURATION_MIN as f64, max) as u32
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsPatch {
    pub auto_scheduling: Option<bool>,
    pub weather_integration: Option<bool>,
    pub moisture_threshold: Option<f64>,
    pub rain_delay_hours: Option<u32>,
    pub max_daily_watering_min: Option<u32>,
    pub morning_start: Option<TimeOfDay>,
    pub evening_end: Option<TimeOfDay>,
    pub utc_offset_minutes: Option<i32>,
    pub notifications: Option<bool>,
}

impl SettingsPatch {
    /// Produce the patched settings; the original is left untouched.
    pub fn applied_to(&self, base: &Settings) -> Settings {
        Settings {
            auto_scheduling: self.auto_scheduling.unwrap_or(base.auto_scheduling),
            weather_integration: self.weather_integration.unwrap_or(base.weather_integration),
            moisture_threshold: self.moisture_threshold.unwrap_or(base.moisture_threshold),
            rain_delay_hours: self.rain_delay_hours.unwrap_or(base.rain_delay_hours),
            max_daily_watering_min: self
                .max_daily_watering_min
                .unwrap_or(base.max_daily_watering_min),
            morning_start: self.morning_start.unwrap_or(base.morning_start),
            evening_end: self.evening_end.unwrap_or(base.evening_end),
            utc_offset_minutes: self.utc_offset_minutes.unwrap_or(base.utc_offset_minutes),
            notifications: self.notifications.unwrap_or(base.notifications),
        }
    }
}

// ---------------------------------------------------------------------------
// Weather
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentConditions {
    pub temperature_c: f64,
    pub humidity_pct: f64,
    pub wind_speed_kmh: f64,
    pub description: String,
}

impl CurrentConditions {
    pub fn is_raining(&self) -> bool {
        let d = self.description.to_ascii_lowercase();
        ["rain", "drizzle", "shower", "thunderstorm"]
            .iter()
            .any(|w| d.contains(w))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastDay {
    /// `YYYY-MM-DD` as reported by the provider.
    pub date: String,
    pub temp_min_c: f64,
    pub temp_max_c: f64,
    /// Precipitation probability (%) or an equivalent 0-100 signal.
    pub precipitation_signal: f64,
}

/// One immutable read of the weather provider. Either half may be missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherSnapshot {
    pub current: Option<CurrentConditions>,
    pub forecast: Vec<ForecastDay>,
    #[serde(with = "time::serde::rfc3339")]
    pub fetched_at: OffsetDateTime,
}

// ---------------------------------------------------------------------------
// Schedule entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    Pending,
    Active,
    Completed,
    Cancelled,
}

impl ScheduleStatus {
    /// The only edges in the schedule state machine.
    pub fn can_transition_to(self, next: ScheduleStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Active)
                | (Self::Active, Self::Completed)
                | (Self::Pending, Self::Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Auto,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: String,
    pub zone_id: String,
    /// Zone name at creation time, kept for display after rename/removal.
    pub zone_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub scheduled_time: OffsetDateTime,
    pub duration_min: u32,
    pub status: ScheduleStatus,
    pub reason: String,
    pub water_amount_liters: f64,
    pub origin: Origin,
    #[serde(default)]
    pub urgency: Option<Urgency>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

impl ScheduleEntry {
    /// Move along the state machine, stamping the transition time.
    /// Invalid edges leave the entry untouched.
    pub fn transition(&mut self, next: ScheduleStatus, now: OffsetDateTime) -> EngineResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        match next {
            ScheduleStatus::Active => self.started_at = Some(now),
            ScheduleStatus::Completed | ScheduleStatus::Cancelled => self.completed_at = Some(now),
            ScheduleStatus::Pending => {}
        }
        self.status = next;
        Ok(())
    }
}

/// Simplified volumetric estimate; 10 is a calibration divisor.
pub fn water_amount_liters(flow_rate_lpm: f64, duration_min: u32, area_acres: f64) -> f64 {
    flow_rate_lpm * duration_min as f64 * area_acres / 10.0
}

// ===========================================================================
// Tests
// ===========================================================================
