//! Zone registry: static zone configuration plus mutable runtime state.
//!
//! The registry itself is a plain struct; the engine wraps it in an
//! `RwLock` so every mutation below is applied atomically with respect to
//! concurrent readers.

use time::{Duration, OffsetDateTime};

use crate::error::{EngineError, EngineResult};
use crate::model::{Zone, ZonePatch, ZoneSpec, MOISTURE_CEILING, MOISTURE_FLOOR};

/// New zones look "last watered" this long ago so they are evaluated at once.
const INITIAL_WATERED_AGO: Duration = Duration::days(1);

/// Largest single replenishment applied on completion, in moisture points.
const MAX_REPLENISH: f64 = 30.0;

#[derive(Debug, Default, Clone)]
pub struct ZoneRegistry {
    zones: Vec<Zone>,
}

impl ZoneRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted zones. Stored zones are taken as-is; ticks
    /// re-check each one and skip any that fail validation.
    pub fn from_zones(zones: Vec<Zone>) -> Self {
        Self { zones }
    }

    /// Add a brand-new zone. `seed_moisture` is used when the payload carries no
    /// initial estimate.
    pub fn add(
        &mut self,
        spec: ZoneSpec,
        seed_moisture: f64,
        now: OffsetDateTime,
    ) -> EngineResult<Zone> {
        spec.validate()?;
        let id = spec
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if self.find(&id).is_some() {
            return Err(EngineError::Validation(format!("zone id '{id}' already exists")));
        }
        self.check_pin_free(spec.valve_pin, &id)?;

        let zone = Zone {
            id,
            name: spec.name,
            crop_type: spec.crop_type,
            area_acres: spec.area_acres,
            soil_type: spec.soil_type,
            irrigation_method: spec.irrigation_method,
            flow_rate_lpm: spec.flow_rate_lpm,
            default_duration_min: spec.default_duration_min,
            priority: spec.priority,
            valve_pin: spec.valve_pin,
            current_moisture: spec.current_moisture.unwrap_or(seed_moisture),
            target_moisture: spec.target_moisture,
            active: spec.active.unwrap_or(true),
            last_watered: now - INITIAL_WATERED_AGO,
        };
        self.zones.push(zone.clone());
        Ok(zone)
    }

    /// Insert a new zone, or replace the static attributes of an existing one
    /// while keeping its runtime state unless the payload overrides it.
    /// Returns the stored zone and whether it was created.
    pub fn upsert(
        &mut self,
        spec: ZoneSpec,
        seed_moisture: f64,
        now: OffsetDateTime,
    ) -> EngineResult<(Zone, bool)> {
        let existing = spec.id.as_deref().and_then(|id| self.position(id));
        let Some(idx) = existing else {
            return self.add(spec, seed_moisture, now).map(|z| (z, true));
        };

        spec.validate()?;
        self.check_pin_free(spec.valve_pin, &self.zones[idx].id)?;
        let zone = &mut self.zones[idx];
        zone.name = spec.name;
        zone.crop_type = spec.crop_type;
        zone.area_acres = spec.area_acres;
        zone.soil_type = spec.soil_type;
        zone.irrigation_method = spec.irrigation_method;
        zone.flow_rate_lpm = spec.flow_rate_lpm;
        zone.default_duration_min = spec.default_duration_min;
        zone.priority = spec.priority;
        zone.valve_pin = spec.valve_pin;
        zone.target_moisture = spec.target_moisture;
        if let Some(m) = spec.current_moisture {
            zone.current_moisture = m;
        }
        if let Some(a) = spec.active {
            zone.active = a;
        }
        Ok((zone.clone(), false))
    }

    /// Apply a partial update. The patch is validated against a copy, so a
    /// rejected patch leaves the stored zone untouched.
    pub fn update(&mut self, id: &str, patch: &ZonePatch) -> EngineResult<Zone> {
        let idx = self
            .position(id)
            .ok_or_else(|| EngineError::zone_not_found(id))?;
        let mut candidate = self.zones[idx].clone();
        patch.apply_to(&mut candidate);
        candidate.check()?;
        self.check_pin_free(candidate.valve_pin, id)?;
        self.zones[idx] = candidate.clone();
        Ok(candidate)
    }

    pub fn remove(&mut self, id: &str) -> EngineResult<Zone> {
        let idx = self
            .position(id)
            .ok_or_else(|| EngineError::zone_not_found(id))?;
        Ok(self.zones.remove(idx))
    }

    /// Each relay pin drives at most one zone.
    fn check_pin_free(&self, pin: Option<u8>, owner: &str) -> EngineResult<()> {
        let Some(pin) = pin else { return Ok(()) };
        match self
            .zones
            .iter()
            .find(|z| z.id != owner && z.valve_pin == Some(pin))
        {
            Some(other) => Err(EngineError::Validation(format!(
                "valve_pin {pin} is already used by zone '{}'",
                other.id
            ))),
            None => Ok(()),
        }
    }

    pub fn get(&self, id: &str) -> EngineResult<&Zone> {
        self.find(id).ok_or_else(|| EngineError::zone_not_found(id))
    }

    pub fn find(&self, id: &str) -> Option<&Zone> {
        self.zones.iter().find(|z| z.id == id)
    }

    pub fn list(&self) -> &[Zone] {
        &self.zones
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Zone> {
        self.zones.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    /// Post-irrigation replenishment: raise moisture by
    /// `min(30, target - current + 10)` (never negative), cap at 95, and stamp
    /// `last_watered`.
    pub fn replenish(&mut self, id: &str, now: OffsetDateTime) -> EngineResult<Zone> {
        let idx = self
            .position(id)
            .ok_or_else(|| EngineError::zone_not_found(id))?;
        let zone = &mut self.zones[idx];
        let gain = (zone.target_moisture - zone.current_moisture + 10.0)
            .min(MAX_REPLENISH)
            .max(0.0);
        zone.current_moisture = (zone.current_moisture + gain).clamp(MOISTURE_FLOOR, MOISTURE_CEILING);
        zone.last_watered = now;
        Ok(zone.clone())
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.zones.iter().position(|z| z.id == id)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{IrrigationMethod, Priority, SoilType};
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2024-06-01 12:00 UTC);

    fn spec(id: Option<&str>) -> ZoneSpec {
        ZoneSpec {
            id: id.map(str::to_string),
            name: "Paddy".into(),
            crop_type: "Rice".into(),
            area_acres: 1.25,
            soil_type: SoilType::Clay,
            irrigation_method: IrrigationMethod::Flood,
            flow_rate_lpm: 22.5,
            default_duration_min: 40,
            priority: Priority::High,
            target_moisture: 70.0,
            current_moisture: Some(33.3),
            active: Some(false),
            valve_pin: Some(17),
        }
    }

    // -- add ------------------------------------------------------------------

    #[test]
    fn add_preserves_supplied_fields() {
        let mut reg = ZoneRegistry::new();
        let z = reg.add(spec(Some("z1")), 60.0, NOW).unwrap();
        assert_eq!(z.id, "z1");
        assert_eq!(z.name, "Paddy");
        assert_eq!(z.crop_type, "Rice");
        assert_eq!(z.area_acres, 1.25);
        assert_eq!(z.flow_rate_lpm, 22.5);
        assert_eq!(z.current_moisture, 33.3);
        assert!(!z.active);
        assert_eq!(z.valve_pin, Some(17));
        assert_eq!(reg.list(), &[z]);
    }

    #[test]
    fn add_uses_seed_when_no_moisture_given() {
        let mut reg = ZoneRegistry::new();
        let s = ZoneSpec {
            current_moisture: None,
            active: None,
            ..spec(None)
        };
        let z = reg.add(s, 57.0, NOW).unwrap();
        assert_eq!(z.current_moisture, 57.0);
        assert!(z.active, "zones default to active");
        assert!(!z.id.is_empty());
    }

    #[test]
    fn add_marks_last_watered_in_the_past() {
        let mut reg = ZoneRegistry::new();
        let z = reg.add(spec(None), 60.0, NOW).unwrap();
        assert!(z.last_watered <= NOW - Duration::hours(2));
    }

    #[test]
    fn add_rejects_invalid_spec() {
        let mut reg = ZoneRegistry::new();
        let bad = ZoneSpec {
            area_acres: 0.0,
            ..spec(None)
        };
        assert!(matches!(
            reg.add(bad, 60.0, NOW),
            Err(EngineError::Validation(_))
        ));
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn add_rejects_duplicate_id() {
        let mut reg = ZoneRegistry::new();
        reg.add(spec(Some("z1")), 60.0, NOW).unwrap();
        assert!(reg.add(spec(Some("z1")), 60.0, NOW).is_err());
        assert_eq!(reg.len(), 1);
    }

    // -- upsert ---------------------------------------------------------------

    #[test]
    fn upsert_updates_static_attributes_keeps_runtime_state() {
        let mut reg = ZoneRegistry::new();
        let original = reg.add(spec(Some("z1")), 60.0, NOW).unwrap();

        let changed = ZoneSpec {
            name: "Paddy East".into(),
            current_moisture: None,
            active: None,
            ..spec(Some("z1"))
        };
        let (z, created) = reg.upsert(changed, 99.0, NOW).unwrap();
        assert!(!created);
        assert_eq!(z.name, "Paddy East");
        assert_eq!(z.current_moisture, original.current_moisture);
        assert_eq!(z.last_watered, original.last_watered);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn valve_pin_drives_one_zone_only() {
        let mut reg = ZoneRegistry::new();
        reg.add(spec(Some("z1")), 60.0, NOW).unwrap();

        let err = reg.add(spec(Some("z2")), 60.0, NOW).unwrap_err();
        assert!(err.to_string().contains("already used by zone 'z1'"), "{err}");

        reg.add(
            ZoneSpec {
                valve_pin: Some(18),
                ..spec(Some("z2"))
            },
            60.0,
            NOW,
        )
        .unwrap();
        let steal = ZonePatch {
            valve_pin: Some(17),
            ..ZonePatch::default()
        };
        assert!(reg.update("z2", &steal).is_err());
        assert_eq!(reg.get("z2").unwrap().valve_pin, Some(18));

        // Re-upserting the owner with its own pin is fine.
        reg.upsert(spec(Some("z1")), 60.0, NOW).unwrap();
    }

    #[test]
    fn upsert_unknown_id_creates() {
        let mut reg = ZoneRegistry::new();
        let (z, created) = reg.upsert(spec(Some("fresh")), 60.0, NOW).unwrap();
        assert!(created);
        assert_eq!(z.id, "fresh");
    }

    // -- update / remove ------------------------------------------------------

    #[test]
    fn rejected_patch_leaves_zone_untouched() {
        let mut reg = ZoneRegistry::new();
        let before = reg.add(spec(Some("z1")), 60.0, NOW).unwrap();
        let patch = ZonePatch {
            name: Some("Renamed".into()),
            target_moisture: Some(95.0),
            ..ZonePatch::default()
        };
        assert!(reg.update("z1", &patch).is_err());
        assert_eq!(reg.get("z1").unwrap(), &before);
    }

    #[test]
    fn update_unknown_zone_is_not_found() {
        let mut reg = ZoneRegistry::new();
        let err = reg.update("nope", &ZonePatch::default()).unwrap_err();
        assert!(matches!(err, EngineError::NotFound { kind: "zone", .. }));
    }

    #[test]
    fn remove_then_get_is_not_found() {
        let mut reg = ZoneRegistry::new();
        reg.add(spec(Some("z1")), 60.0, NOW).unwrap();
        reg.remove("z1").unwrap();
        assert!(reg.get("z1").is_err());
        assert!(reg.remove("z1").is_err());
    }

    // -- replenish ------------------------------------------------------------

    #[test]
    fn replenish_caps_gain_at_thirty() {
        let mut reg = ZoneRegistry::new();
        reg.add(
            ZoneSpec {
                current_moisture: Some(20.0),
                target_moisture: 80.0,
                ..spec(Some("z1"))
            },
            60.0,
            NOW,
        )
        .unwrap();
        let z = reg.replenish("z1", NOW).unwrap();
        assert_eq!(z.current_moisture, 50.0);
        assert_eq!(z.last_watered, NOW);
    }

    #[test]
    fn replenish_tops_up_to_target_plus_ten() {
        let mut reg = ZoneRegistry::new();
        reg.add(
            ZoneSpec {
                current_moisture: Some(55.0),
                target_moisture: 60.0,
                ..spec(Some("z1"))
            },
            60.0,
            NOW,
        )
        .unwrap();
        assert_eq!(reg.replenish("z1", NOW).unwrap().current_moisture, 70.0);
    }

    #[test]
    fn replenish_never_exceeds_ceiling_or_dries() {
        let mut reg = ZoneRegistry::new();
        reg.add(
            ZoneSpec {
                current_moisture: Some(94.0),
                target_moisture: 90.0,
                ..spec(Some("z1"))
            },
            60.0,
            NOW,
        )
        .unwrap();
        assert_eq!(reg.replenish("z1", NOW).unwrap().current_moisture, 95.0);

        reg.update(
            "z1",
            &ZonePatch {
                target_moisture: Some(30.0),
                current_moisture: Some(80.0),
                ..ZonePatch::default()
            },
        )
        .unwrap();
        assert_eq!(reg.replenish("z1", NOW).unwrap().current_moisture, 80.0);
    }
}
