//! Valve control via GPIO. The `gpio` feature gates the real rppal driver;
//! without it, a mock implementation only tracks and logs state changes.
//!
//! Zones come and go at runtime, so pins are claimed on the first `open` for
//! a zone rather than up front. A zone without a `valve_pin` has nothing to
//! drive and is logged only.

use anyhow::Result;
use std::collections::HashMap;
#[cfg(not(feature = "gpio"))]
use std::collections::HashSet;
use tracing::{debug, info};

#[cfg(feature = "gpio")]
use anyhow::Context;
#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

// ---------------------------------------------------------------------------
// Real GPIO valve board (production, requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct ValveBoard {
    gpio: Gpio,
    pins: HashMap<String, OutputPin>, // zone_id -> relay pin
    active_low: bool,                 // many relay boards are active-low
}

#[cfg(feature = "gpio")]
impl ValveBoard {
    pub fn new(active_low: bool) -> Result<Self> {
        let gpio = Gpio::new().context("opening GPIO")?;
        info!(active_low, "valve board initialised");
        Ok(Self {
            gpio,
            pins: HashMap::new(),
            active_low,
        })
    }

    pub fn open(&mut self, zone_id: &str, pin: Option<u8>) -> Result<()> {
        let Some(pin_num) = pin else {
            debug!(zone = %zone_id, "valve: no pin wired, nothing to open");
            return Ok(());
        };
        if !self.pins.contains_key(zone_id) {
            let out = self
                .gpio
                .get(pin_num)
                .with_context(|| format!("claiming gpio {pin_num} for zone {zone_id}"))?
                .into_output();
            self.pins.insert(zone_id.to_string(), out);
        }
        self.set(zone_id, true);
        Ok(())
    }

    pub fn close(&mut self, zone_id: &str) {
        self.set(zone_id, false);
    }

    pub fn all_off(&mut self) {
        let keys: Vec<String> = self.pins.keys().cloned().collect();
        for k in keys {
            self.set(&k, false);
        }
    }

    fn set(&mut self, zone_id: &str, on: bool) {
        let Some(pin) = self.pins.get_mut(zone_id) else {
            debug!(zone = %zone_id, "valve: no claimed pin");
            return;
        };
        // active-low relay: LOW = ON, HIGH = OFF
        if on != self.active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        info!(zone = %zone_id, state = if on { "ON" } else { "OFF" }, "valve set");
    }
}

// ---------------------------------------------------------------------------
// Mock valve board (development, no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct ValveBoard {
    zones: HashMap<String, bool>, // zone_id -> on/off state
    failing: HashSet<String>,     // zones whose relay refuses to open
}

#[cfg(not(feature = "gpio"))]
impl ValveBoard {
    pub fn new(_active_low: bool) -> Result<Self> {
        info!("[mock-gpio] valve board initialised (no hardware)");
        Ok(Self {
            zones: HashMap::new(),
            failing: HashSet::new(),
        })
    }

    pub fn open(&mut self, zone_id: &str, pin: Option<u8>) -> Result<()> {
        if self.failing.contains(zone_id) {
            anyhow::bail!("[mock-gpio] relay for zone {zone_id} did not respond");
        }
        match pin {
            Some(p) => info!(zone = %zone_id, gpio = p, "[mock-gpio] valve set ON"),
            None => debug!(zone = %zone_id, "[mock-gpio] valve set ON (no pin wired)"),
        }
        self.zones.insert(zone_id.to_string(), true);
        Ok(())
    }

    pub fn close(&mut self, zone_id: &str) {
        if let Some(state) = self.zones.get_mut(zone_id) {
            *state = false;
            info!(zone = %zone_id, "[mock-gpio] valve set OFF");
        } else {
            debug!(zone = %zone_id, "[mock-gpio] close for unknown zone");
        }
    }

    pub fn all_off(&mut self) {
        let keys: Vec<String> = self.zones.keys().cloned().collect();
        for k in keys {
            self.close(&k);
        }
    }

    /// Make every later `open` for `zone_id` fail.
    #[cfg(test)]
    pub fn fail_on(&mut self, zone_id: &str) {
        self.failing.insert(zone_id.to_string());
    }

    #[cfg(test)]
    pub fn is_open(&self, zone_id: &str) -> bool {
        self.zones.get(zone_id).copied().unwrap_or(false)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
