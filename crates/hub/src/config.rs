//! TOML config file loading, validation, and seeding of zones into the
//! engine.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::model::{Settings, ZoneSpec};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Initial settings. Ignored once settings have been stored.
    #[serde(default)]
    pub settings: Option<Settings>,
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub mqtt: Option<MqttConfig>,
    #[serde(default)]
    pub zones: Vec<ZoneSpec>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub simulator_interval_secs: u64,
    pub scheduler_interval_secs: u64,
    pub executor_interval_secs: u64,
    pub weather_interval_secs: u64,
    pub weather_timeout_secs: u64,
    /// Simulated length of the active phase of a run.
    pub active_delay_secs: u64,
    /// Fixed RNG seed for reproducible simulation runs.
    pub rng_seed: Option<u64>,
    /// Many common relay boards are active-low. If yours is active-high, set false.
    pub relay_active_low: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            simulator_interval_secs: 30,
            scheduler_interval_secs: 60,
            executor_interval_secs: 10,
            weather_interval_secs: 30 * 60,
            weather_timeout_secs: 10,
            active_delay_secs: 2,
            rng_seed: None,
            relay_active_low: true,
        }
    }
}

impl EngineConfig {
    pub fn active_delay(&self) -> Duration {
        Duration::from_secs(self.active_delay_secs)
    }

    pub fn weather_timeout(&self) -> Duration {
        Duration::from_secs(self.weather_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_topic")]
    pub topic: String,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "irrigation-hub".to_string()
}

fn default_topic() -> String {
    "irrigation/notifications".to_string()
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if let Some(s) = &self.settings {
            if let Err(e) = s.validate() {
                errors.push(format!("settings: {e}"));
            }
        }
        self.validate_location(&mut errors);
        self.validate_engine(&mut errors);
        self.validate_mqtt(&mut errors);
        self.validate_zones(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_location(&self, errors: &mut Vec<String>) {
        let Some(loc) = &self.location else { return };
        if !(-90.0..=90.0).contains(&loc.latitude) {
            errors.push(format!("location: latitude {} out of range [-90, 90]", loc.latitude));
        }
        if !(-180.0..=180.0).contains(&loc.longitude) {
            errors.push(format!(
                "location: longitude {} out of range [-180, 180]",
                loc.longitude
            ));
        }
    }

    fn validate_engine(&self, errors: &mut Vec<String>) {
        let e = &self.engine;
        for (name, value) in [
            ("simulator_interval_secs", e.simulator_interval_secs),
            ("scheduler_interval_secs", e.scheduler_interval_secs),
            ("executor_interval_secs", e.executor_interval_secs),
            ("weather_interval_secs", e.weather_interval_secs),
            ("weather_timeout_secs", e.weather_timeout_secs),
        ] {
            if value == 0 {
                errors.push(format!("engine: {name} must be positive, got 0"));
            }
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let Some(m) = &self.mqtt else { return };
        if m.host.trim().is_empty() {
            errors.push("mqtt: host is empty".to_string());
        }
        if m.topic.trim().is_empty() {
            errors.push("mqtt: topic is empty".to_string());
        }
    }

    fn validate_zones(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();
        let mut seen_pins: HashSet<u8> = HashSet::new();

        for (i, z) in self.zones.iter().enumerate() {
            let ctx = || match &z.id {
                Some(id) if !id.is_empty() => format!("zone '{id}'"),
                _ => format!("zones[{i}]"),
            };

            // ── Identity ────────────────────────────────────────
            // Seed zones are upserted on every start, so they need a stable id.
            match z.id.as_deref() {
                None => errors.push(format!("{}: id is required for seed zones", ctx())),
                Some(id) if !seen_ids.insert(id) => {
                    errors.push(format!("{}: duplicate zone id", ctx()))
                }
                Some(_) => {}
            }

            // ── Zone attributes ─────────────────────────────────
            if let Err(e) = z.validate() {
                errors.push(format!("{}: {e}", ctx()));
            }

            // ── GPIO pin sharing ────────────────────────────────
            // The whitelist itself is part of the zone attribute checks.
            if let Some(pin) = z.valve_pin {
                if !seen_pins.insert(pin) {
                    errors.push(format!(
                        "{}: valve_pin {pin} is already used by another zone",
                        ctx()
                    ));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Like [`load`], but a missing file yields the defaults.
pub fn load_or_default(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        warn!(path, "config file not found, using defaults");
        return Ok(Config::default());
    }
    load(path)
}

/// Upsert all seed zones from the config into the engine.
pub async fn apply(config: &Config, engine: &Engine) -> Result<()> {
    for z in &config.zones {
        engine
            .upsert_zone(z.clone())
            .await
            .with_context(|| format!("failed to upsert zone '{}'", z.id.as_deref().unwrap_or("?")))?;
    }

    info!(zones = config.zones.len(), "config applied");
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
