//! Soil moisture simulator.
//!
//! Approximates how each zone's moisture estimate drifts between waterings:
//! - Randomised base decay (2-5 points per tick) scaled by soil drainage
//! - Extra drying from heat, dry air and wind
//! - Replenishment when it is raining
//! - Post-irrigation saturation for two hours after a watering
//!
//! The model is intentionally noisy. The clamp to [10, 95] and the
//! precedence of the post-irrigation floor over decay are the only hard
//! guarantees.

use time::{Duration, OffsetDateTime};
use tracing::warn;

use crate::model::{CurrentConditions, Zone, MOISTURE_CEILING, MOISTURE_FLOOR};
use crate::registry::ZoneRegistry;

/// A zone watered within this window stays saturated regardless of decay.
const SATURATION_WINDOW: Duration = Duration::hours(2);

/// Saturation floor above the zone's target moisture.
const SATURATION_MARGIN: f64 = 10.0;

const BASE_DECAY_MIN: f64 = 2.0;
const BASE_DECAY_SPAN: f64 = 3.0;

const HOT_ABOVE_C: f64 = 30.0;
const HOT_EXTRA: f64 = 2.0;
const DRY_AIR_BELOW_PCT: f64 = 40.0;
const DRY_AIR_EXTRA: f64 = 1.5;
const WINDY_ABOVE_KMH: f64 = 15.0;
const WINDY_EXTRA: f64 = 0.5;
const RAIN_GAIN: f64 = 10.0;

/// Initial moisture estimate range for zones added without one.
const SEED_MIN: f64 = 50.0;
const SEED_SPAN: f64 = 20.0;

pub struct MoistureSimulator {
    rng: fastrand::Rng,
}

impl MoistureSimulator {
    pub fn new() -> Self {
        Self {
            rng: fastrand::Rng::new(),
        }
    }

    /// Deterministic simulator for tests and reproducible runs.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: fastrand::Rng::with_seed(seed),
        }
    }

    /// A believable starting moisture in [50, 70].
    pub fn seed_moisture(&mut self) -> f64 {
        SEED_MIN + self.rng.f64() * SEED_SPAN
    }

    /// Compute the next moisture value for one zone.
    pub fn next_moisture(
        &mut self,
        zone: &Zone,
        weather: Option<&CurrentConditions>,
        now: OffsetDateTime,
    ) -> f64 {
        let base = BASE_DECAY_MIN + self.rng.f64() * BASE_DECAY_SPAN;
        let mut moisture = zone.current_moisture - base * zone.soil_type.drainage_multiplier();

        if let Some(w) = weather {
            if w.temperature_c > HOT_ABOVE_C {
                moisture -= HOT_EXTRA;
            }
            if w.humidity_pct < DRY_AIR_BELOW_PCT {
                moisture -= DRY_AIR_EXTRA;
            }
            if w.wind_speed_kmh > WINDY_ABOVE_KMH {
                moisture -= WINDY_EXTRA;
            }
            if w.is_raining() {
                moisture += RAIN_GAIN;
            }
        }

        // Recent watering wins over everything computed above.
        if now - zone.last_watered < SATURATION_WINDOW {
            moisture = moisture.max(zone.target_moisture + SATURATION_MARGIN);
        }

        moisture.clamp(MOISTURE_FLOOR, MOISTURE_CEILING)
    }

    /// Advance every zone, active or not, by one tick. Zones with corrupt
    /// moisture values are skipped so one bad record cannot stall the rest.
    /// Returns the number of zones updated.
    pub fn tick(
        &mut self,
        zones: &mut ZoneRegistry,
        weather: Option<&CurrentConditions>,
        now: OffsetDateTime,
    ) -> usize {
        let mut updated = 0;
        for zone in zones.iter_mut() {
            if !zone.current_moisture.is_finite() || !zone.target_moisture.is_finite() {
                warn!(zone = %zone.id, "simulator: non-finite moisture state, skipping");
                continue;
            }
            zone.current_moisture = self.next_moisture(zone, weather, now);
            updated += 1;
        }
        updated
    }
}

impl Default for MoistureSimulator {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{IrrigationMethod, Priority, SoilType, ZoneSpec};
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2024-06-01 12:00 UTC);

    fn zone(soil: SoilType, moisture: f64) -> Zone {
        Zone {
            id: "z1".into(),
            name: "Test".into(),
            crop_type: "wheat".into(),
            area_acres: 1.0,
            soil_type: soil,
            irrigation_method: IrrigationMethod::Drip,
            flow_rate_lpm: 10.0,
            default_duration_min: 30,
            priority: Priority::Medium,
            valve_pin: None,
            current_moisture: moisture,
            target_moisture: 60.0,
            active: true,
            last_watered: NOW - Duration::days(1),
        }
    }

    fn weather(temp: f64, humidity: f64, wind: f64, desc: &str) -> CurrentConditions {
        CurrentConditions {
            temperature_c: temp,
            humidity_pct: humidity,
            wind_speed_kmh: wind,
            description: desc.into(),
        }
    }

    #[test]
    fn decay_stays_within_base_band_for_loam() {
        let mut sim = MoistureSimulator::with_seed(7);
        let z = zone(SoilType::Loamy, 60.0);
        for _ in 0..200 {
            let m = sim.next_moisture(&z, None, NOW);
            assert!((55.0..=58.0).contains(&m), "loam decay out of band: {m}");
        }
    }

    #[test]
    fn sandy_dries_faster_than_clay() {
        let mut sim = MoistureSimulator::with_seed(11);
        let sandy = zone(SoilType::Sandy, 60.0);
        let clay = zone(SoilType::Clay, 60.0);
        let n = 100;
        let sandy_avg: f64 = (0..n).map(|_| sim.next_moisture(&sandy, None, NOW)).sum::<f64>() / n as f64;
        let clay_avg: f64 = (0..n).map(|_| sim.next_moisture(&clay, None, NOW)).sum::<f64>() / n as f64;
        assert!(
            sandy_avg < clay_avg,
            "sandy ({sandy_avg:.2}) should dry faster than clay ({clay_avg:.2})"
        );
    }

    #[test]
    fn hot_dry_windy_weather_adds_drying() {
        let z = zone(SoilType::Loamy, 60.0);
        let harsh = weather(36.0, 20.0, 25.0, "clear sky");
        let mut a = MoistureSimulator::with_seed(3);
        let mut b = MoistureSimulator::with_seed(3);
        let calm = a.next_moisture(&z, None, NOW);
        let dried = b.next_moisture(&z, Some(&harsh), NOW);
        assert!((calm - dried - 4.0).abs() < 1e-9, "calm={calm} dried={dried}");
    }

    #[test]
    fn rain_replenishes() {
        let z = zone(SoilType::Loamy, 40.0);
        let wet = weather(20.0, 90.0, 5.0, "moderate rain");
        let mut sim = MoistureSimulator::with_seed(5);
        let m = sim.next_moisture(&z, Some(&wet), NOW);
        assert!(m > 40.0, "rain should raise moisture: {m}");
    }

    #[test]
    fn recent_watering_floors_at_target_plus_ten() {
        let mut sim = MoistureSimulator::with_seed(9);
        let mut z = zone(SoilType::Sandy, 30.0);
        z.last_watered = NOW - Duration::minutes(90);
        let harsh = weather(40.0, 10.0, 30.0, "clear");
        for _ in 0..50 {
            let m = sim.next_moisture(&z, Some(&harsh), NOW);
            assert!(m >= z.target_moisture + 10.0, "saturation floor violated: {m}");
        }
    }

    #[test]
    fn saturation_expires_after_two_hours() {
        let mut sim = MoistureSimulator::with_seed(9);
        let mut z = zone(SoilType::Loamy, 30.0);
        z.last_watered = NOW - Duration::hours(2);
        let m = sim.next_moisture(&z, None, NOW);
        assert!(m < 30.0, "window is exclusive at two hours: {m}");
    }

    #[test]
    fn results_always_clamped() {
        let mut sim = MoistureSimulator::with_seed(1);
        let dry = zone(SoilType::Sandy, 11.0);
        let wet = zone(SoilType::Clay, 95.0);
        let storm = weather(20.0, 95.0, 0.0, "heavy rain");
        for _ in 0..100 {
            let m = sim.next_moisture(&dry, None, NOW);
            assert!((MOISTURE_FLOOR..=MOISTURE_CEILING).contains(&m), "{m}");
            let m = sim.next_moisture(&wet, Some(&storm), NOW);
            assert!((MOISTURE_FLOOR..=MOISTURE_CEILING).contains(&m), "{m}");
        }
    }

    #[test]
    fn tick_updates_inactive_zones_too() {
        let mut reg = ZoneRegistry::new();
        let spec = ZoneSpec {
            id: Some("idle".into()),
            name: "Idle".into(),
            crop_type: "wheat".into(),
            area_acres: 1.0,
            soil_type: SoilType::Loamy,
            irrigation_method: IrrigationMethod::Drip,
            flow_rate_lpm: 10.0,
            default_duration_min: 30,
            priority: Priority::Low,
            target_moisture: 60.0,
            current_moisture: Some(60.0),
            active: Some(false),
            valve_pin: None,
        };
        reg.add(spec, 60.0, NOW).unwrap();
        let mut sim = MoistureSimulator::with_seed(2);
        assert_eq!(sim.tick(&mut reg, None, NOW), 1);
        assert!(reg.get("idle").unwrap().current_moisture < 60.0);
    }

    #[test]
    fn tick_skips_corrupt_zone_and_continues() {
        let mut bad = zone(SoilType::Loamy, f64::NAN);
        bad.id = "bad".into();
        let good = zone(SoilType::Loamy, 60.0);
        let mut reg = ZoneRegistry::from_zones(vec![bad, good]);
        let mut sim = MoistureSimulator::with_seed(4);
        assert_eq!(sim.tick(&mut reg, None, NOW), 1);
        assert!(reg.get("z1").unwrap().current_moisture < 60.0);
    }

    #[test]
    fn seed_moisture_in_range() {
        let mut sim = MoistureSimulator::with_seed(42);
        for _ in 0..500 {
            let m = sim.seed_moisture();
            assert!((50.0..=70.0).contains(&m), "{m}");
        }
    }
}
