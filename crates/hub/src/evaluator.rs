//! Irrigation need assessment.
//!
//! `evaluate` is a pure function of its inputs: no clock, no randomness, no
//! shared state. The decision runs in a fixed order:
//!
//! ```text
//! moisture deficit ──▶ weather escalation ──▶ forecast rain check
//!        ──▶ crop × soil × method multipliers ──▶ clamp [5, max daily]
//! ```
//!
//! Only the forecast step may turn a "needed" decision back to "not needed",
//! and never when urgency is already high.

use serde::Serialize;

use crate::model::{CurrentConditions, ForecastDay, Settings, Urgency, Zone};

/// Deficits above this are high urgency.
const HIGH_DEFICIT: f64 = 30.0;
/// Deficits at or above this (up to `HIGH_DEFICIT`) are medium urgency.
const MEDIUM_DEFICIT: f64 = 15.0;

const HIGH_DEFICIT_FACTOR: f64 = 1.5;
const LOW_DEFICIT_FACTOR: f64 = 0.7;
const LOW_DEFICIT_MIN_RUN: f64 = 15.0;

const HEAT_ABOVE_C: f64 = 35.0;
const HEAT_FACTOR: f64 = 1.2;
const DRY_AIR_BELOW_PCT: f64 = 30.0;
const DRY_AIR_FACTOR: f64 = 1.1;
const WIND_ABOVE_KMH: f64 = 20.0;
const WIND_FACTOR: f64 = 1.1;

/// Only the next few forecast days are considered.
const FORECAST_HORIZON_DAYS: usize = 3;
const RAIN_SIGNAL_ABOVE: f64 = 30.0;
const RAIN_SHRINK_FACTOR: f64 = 0.7;
const RAIN_SHRINK_MIN_RUN: f64 = 10.0;

pub const RAIN_SKIP_REASON: &str = "Rain expected - irrigation not needed";
pub const DEFAULT_REASON: &str = "Routine maintenance";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assessment {
    pub needed: bool,
    pub urgency: Urgency,
    pub reason: String,
    pub duration_min: u32,
}

/// Relative water demand of a crop; unlisted crops are 1.0.
pub fn crop_factor(crop: &str) -> f64 {
    match crop.trim().to_ascii_lowercase().as_str() {
        "sugarcane" => 1.5,
        "rice" | "paddy" => 1.3,
        "banana" => 1.3,
        "cotton" => 1.2,
        "maize" | "corn" => 1.1,
        "vegetables" | "tomato" => 1.1,
        "wheat" => 1.0,
        "groundnut" | "soybean" => 0.9,
        "pulses" | "millet" => 0.8,
        _ => 1.0,
    }
}

pub fn evaluate(
    zone: &Zone,
    settings: &Settings,
    weather: Option<&CurrentConditions>,
    forecast: &[ForecastDay],
) -> Assessment {
    let base = zone.default_duration_min as f64;
    let max_daily = settings.max_daily_watering_min as f64;

    let mut needed = false;
    let mut urgency = Urgency::Low;
    let mut duration = base;
    let mut reasons: Vec<String> = Vec::new();

    // ── 1. Moisture deficit ─────────────────────────────────────────
    if zone.current_moisture < settings.moisture_threshold {
        let deficit = settings.moisture_threshold - zone.current_moisture;
        needed = true;
        if deficit > HIGH_DEFICIT {
            urgency = Urgency::High;
            duration = (base * HIGH_DEFICIT_FACTOR).min(max_daily);
        } else if deficit >= MEDIUM_DEFICIT {
            urgency = Urgency::Medium;
            duration = base;
        } else {
            urgency = Urgency::Low;
            duration = (base * LOW_DEFICIT_FACTOR).max(LOW_DEFICIT_MIN_RUN);
        }
        reasons.push(format!(
            "Soil moisture {:.0}% below threshold {:.0}%",
            zone.current_moisture, settings.moisture_threshold
        ));
    }

    // ── 2. Weather escalation ───────────────────────────────────────
    let weather = weather.filter(|_| settings.weather_integration);
    if let Some(w) = weather {
        if w.temperature_c > HEAT_ABOVE_C {
            needed = true;
            urgency = urgency.max(Urgency::Medium);
            duration = (duration * HEAT_FACTOR).min(max_daily);
            reasons.push(format!("High temperature ({:.0}°C)", w.temperature_c));
        }
        if w.humidity_pct < DRY_AIR_BELOW_PCT {
            needed = true;
            duration = (duration * DRY_AIR_FACTOR).min(max_daily);
            reasons.push(format!("Low humidity ({:.0}%)", w.humidity_pct));
        }
        if w.wind_speed_kmh > WIND_ABOVE_KMH && needed {
            duration = (duration * WIND_FACTOR).min(max_daily);
            reasons.push(format!("Windy ({:.0} km/h)", w.wind_speed_kmh));
        }
    }

    let mut reason = reasons.join(", ");

    // ── 3. Forecast rain short-circuit ──────────────────────────────
    if settings.weather_integration && urgency != Urgency::High && rain_expected(forecast) {
        if needed {
            duration = (duration * RAIN_SHRINK_FACTOR).max(RAIN_SHRINK_MIN_RUN);
            reason.push_str(" (rain expected)");
        } else {
            needed = false;
            reason = RAIN_SKIP_REASON.to_string();
        }
    }

    // ── 4-6. Crop, soil and method multipliers ──────────────────────
    duration *= crop_factor(&zone.crop_type);
    duration *= zone.soil_type.retention_factor();
    duration *= zone.irrigation_method.efficiency_factor();

    // ── 7. Final clamp ──────────────────────────────────────────────
    if reason.is_empty() {
        reason = DEFAULT_REASON.to_string();
    }

    Assessment {
        needed,
        urgency,
        reason,
        duration_min: settings.clamp_duration(duration),
    }
}

fn rain_expected(forecast: &[ForecastDay]) -> bool {
    forecast
        .iter()
        .take(FORECAST_HORIZON_DAYS)
        .any(|d| d.precipitation_signal > RAIN_SIGNAL_ABOVE)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{IrrigationMethod, Priority, SoilType};
    use time::macros::datetime;

    /// Neutral zone: wheat on loam with drip, so every multiplier is 1.0.
    fn zone(moisture: f64) -> Zone {
        Zone {
            id: "z1".into(),
            name: "Neutral".into(),
            crop_type: "wheat".into(),
            area_acres: 1.0,
            soil_type: SoilType::Loamy,
            irrigation_method: IrrigationMethod::Drip,
            flow_rate_lpm: 10.0,
            default_duration_min: 30,
            priority: Priority::Medium,
            valve_pin: None,
            current_moisture: moisture,
            target_moisture: 60.0,
            active: true,
            last_watered: datetime!(2024-06-01 00:00 UTC),
        }
    }

    fn settings() -> Settings {
        Settings {
            moisture_threshold: 40.0,
            max_daily_watering_min: 120,
            ..Settings::default()
        }
    }

    fn mild() -> CurrentConditions {
        CurrentConditions {
            temperature_c: 25.0,
            humidity_pct: 60.0,
            wind_speed_kmh: 5.0,
            description: "clear sky".into(),
        }
    }

    fn day(signal: f64) -> ForecastDay {
        ForecastDay {
            date: "2024-06-02".into(),
            temp_min_c: 18.0,
            temp_max_c: 30.0,
            precipitation_signal: signal,
        }
    }

    // -- Deficit bands ------------------------------------------------------

    #[test]
    fn medium_deficit_uses_base_duration() {
        let a = evaluate(&zone(20.0), &settings(), None, &[]);
        assert!(a.needed);
        assert_eq!(a.urgency, Urgency::Medium);
        assert_eq!(a.duration_min, 30);
    }

    #[test]
    fn adequate_moisture_without_weather_not_needed() {
        let a = evaluate(&zone(60.0), &settings(), None, &[]);
        assert!(!a.needed);
        assert_eq!(a.reason, DEFAULT_REASON);
    }

    #[test]
    fn high_deficit_extends_duration() {
        let a = evaluate(&zone(5.0), &settings(), None, &[]);
        assert_eq!(a.urgency, Urgency::High);
        assert_eq!(a.duration_min, 45);
    }

    #[test]
    fn high_deficit_capped_by_max_daily() {
        let s = Settings {
            max_daily_watering_min: 40,
            ..settings()
        };
        let a = evaluate(&zone(5.0), &s, None, &[]);
        assert_eq!(a.duration_min, 40);
    }

    #[test]
    fn low_deficit_shrinks_with_floor() {
        let a = evaluate(&zone(35.0), &settings(), None, &[]);
        assert_eq!(a.urgency, Urgency::Low);
        assert_eq!(a.duration_min, 21);

        let mut short = zone(35.0);
        short.default_duration_min = 10;
        assert_eq!(evaluate(&short, &settings(), None, &[]).duration_min, 15);
    }

    #[test]
    fn deficit_of_exactly_fifteen_is_medium() {
        let a = evaluate(&zone(25.0), &settings(), None, &[]);
        assert_eq!(a.urgency, Urgency::Medium);
    }

    // -- Weather escalation ---------------------------------------------------

    #[test]
    fn heat_alone_triggers_medium() {
        let hot = CurrentConditions {
            temperature_c: 38.0,
            ..mild()
        };
        let a = evaluate(&zone(60.0), &settings(), Some(&hot), &[]);
        assert!(a.needed);
        assert_eq!(a.urgency, Urgency::Medium);
        assert!(a.reason.contains("temperature"), "{}", a.reason);
        assert_eq!(a.duration_min, 36);
    }

    #[test]
    fn heat_ignored_when_integration_off() {
        let hot = CurrentConditions {
            temperature_c: 38.0,
            ..mild()
        };
        let s = Settings {
            weather_integration: false,
            ..settings()
        };
        assert!(!evaluate(&zone(60.0), &s, Some(&hot), &[]).needed);
    }

    #[test]
    fn wind_only_extends_when_already_needed() {
        let windy = CurrentConditions {
            wind_speed_kmh: 30.0,
            ..mild()
        };
        assert!(!evaluate(&zone(60.0), &settings(), Some(&windy), &[]).needed);

        let a = evaluate(&zone(20.0), &settings(), Some(&windy), &[]);
        assert_eq!(a.duration_min, 33);
        assert!(a.reason.contains("Windy"));
    }

    #[test]
    fn dry_air_extends_duration() {
        let dry = CurrentConditions {
            humidity_pct: 20.0,
            ..mild()
        };
        let a = evaluate(&zone(20.0), &settings(), Some(&dry), &[]);
        assert_eq!(a.duration_min, 33);
        assert!(a.reason.contains("humidity"));
    }

    #[test]
    fn escalation_never_lowers_urgency() {
        let hot = CurrentConditions {
            temperature_c: 40.0,
            ..mild()
        };
        let a = evaluate(&zone(5.0), &settings(), Some(&hot), &[]);
        assert_eq!(a.urgency, Urgency::High);
    }

    // -- Forecast ---------------------------------------------------------------

    #[test]
    fn rain_on_day_two_skips_unneeded_zone() {
        let forecast = [day(10.0), day(40.0), day(0.0)];
        let a = evaluate(&zone(60.0), &settings(), Some(&mild()), &forecast);
        assert!(!a.needed);
        assert_eq!(a.reason, RAIN_SKIP_REASON);
    }

    #[test]
    fn rain_overrides_weather_escalation_below_high() {
        let hot = CurrentConditions {
            temperature_c: 38.0,
            ..mild()
        };
        let forecast = [day(80.0)];
        let a = evaluate(&zone(60.0), &settings(), Some(&hot), &forecast);
        assert!(a.needed, "medium-urgency need survives, only shortened");
        assert!(a.reason.ends_with("(rain expected)"), "{}", a.reason);
        assert_eq!(a.duration_min, 25);
    }

    #[test]
    fn rain_shrinks_needed_duration() {
        let forecast = [day(50.0)];
        let a = evaluate(&zone(20.0), &settings(), None, &forecast);
        assert!(a.needed);
        assert_eq!(a.duration_min, 21);
        assert!(a.reason.ends_with(" (rain expected)"));
    }

    #[test]
    fn rain_shrink_has_floor_of_ten() {
        let mut z = zone(20.0);
        z.default_duration_min = 8;
        let a = evaluate(&z, &settings(), None, &[day(50.0)]);
        assert_eq!(a.duration_min, 10);
    }

    #[test]
    fn rain_does_not_touch_high_urgency() {
        let a = evaluate(&zone(5.0), &settings(), None, &[day(90.0)]);
        assert!(a.needed);
        assert_eq!(a.duration_min, 45);
        assert!(!a.reason.contains("rain"));
    }

    #[test]
    fn rain_beyond_horizon_ignored() {
        let forecast = [day(0.0), day(0.0), day(0.0), day(100.0)];
        let a = evaluate(&zone(20.0), &settings(), None, &forecast);
        assert_eq!(a.duration_min, 30);
    }

    #[test]
    fn signal_of_exactly_thirty_is_not_rain() {
        let a = evaluate(&zone(60.0), &settings(), None, &[day(30.0)]);
        assert_eq!(a.reason, DEFAULT_REASON);
    }

    // -- Multipliers and clamp -------------------------------------------------

    #[test]
    fn crop_factor_is_case_insensitive() {
        assert_eq!(crop_factor("RICE"), 1.3);
        assert_eq!(crop_factor(" Sugarcane "), 1.5);
        assert_eq!(crop_factor("dragonfruit"), 1.0);
    }

    #[test]
    fn multipliers_compound() {
        let mut z = zone(20.0);
        z.crop_type = "rice".into();
        z.soil_type = SoilType::Clay;
        z.irrigation_method = IrrigationMethod::Flood;
        // 30 × 1.3 × 1.2 × 1.5 = 70.2
        assert_eq!(evaluate(&z, &settings(), None, &[]).duration_min, 70);
    }

    #[test]
    fn duration_always_within_bounds() {
        let s = Settings {
            max_daily_watering_min: 60,
            ..settings()
        };
        for base in [1_u32, 5, 30, 200] {
            for moisture in [0.0, 20.0, 39.0, 80.0] {
                let mut z = zone(moisture);
                z.default_duration_min = base;
                z.crop_type = "sugarcane".into();
                z.irrigation_method = IrrigationMethod::Flood;
                let a = evaluate(&z, &s, None, &[]);
                assert!((5..=60).contains(&a.duration_min), "{base}/{moisture}: {a:?}");
            }
        }
    }

    #[test]
    fn evaluation_is_repeatable() {
        let hot = CurrentConditions {
            temperature_c: 37.0,
            humidity_pct: 25.0,
            wind_speed_kmh: 22.0,
            description: "sunny".into(),
        };
        let forecast = [day(10.0), day(35.0)];
        let first = evaluate(&zone(28.0), &settings(), Some(&hot), &forecast);
        for _ in 0..10 {
            assert_eq!(evaluate(&zone(28.0), &settings(), Some(&hot), &forecast), first);
        }
    }
}
