//! Battery model consumed by the charging loop

use std::time::Duration;

/// Energy store advanced by the charging loop once per tick
pub trait Battery: Send {
    /// Integrate `current` at `voltage` over one tick
    fn advance(&mut self, tick: Duration, current: f64, voltage: f64);

    /// Percent, 0..=100
    fn state_of_charge(&self) -> f64;

    /// Wh
    fn capacity(&self) -> f64;

    /// Wh currently stored
    fn level(&self) -> f64;

    fn is_full(&self) -> bool;

    fn is_charging(&self) -> bool;

    fn set_charging(&mut self, charging: bool);

    /// Whole percentage points, as reported on the wire
    fn soc_percent(&self) -> u8 {
        self.state_of_charge().floor().clamp(0.0, 100.0) as u8
    }
}

/// Linear integrator: no losses, no voltage curve
#[derive(Debug, Clone)]
pub struct LinearBattery {
    capacity: f64,
    level: f64,
    time_multiplier: f64,
    full: bool,
    charging: bool,
}

impl LinearBattery {
    pub fn new(capacity_wh: f64, initial_soc: f64) -> Self {
        let soc = initial_soc.clamp(0.0, 100.0);
        Self {
            capacity: capacity_wh,
            level: capacity_wh * soc / 100.0,
            time_multiplier: 1.0,
            full: soc >= 100.0,
            charging: false,
        }
    }

    /// Scale simulated time against wall-clock ticks
    pub fn with_time_multiplier(mut self, multiplier: f64) -> Self {
        self.time_multiplier = multiplier;
        self
    }
}

impl Battery for LinearBattery {
    fn advance(&mut self, tick: Duration, current: f64, voltage: f64) {
        if !self.charging || self.full {
            return;
        }
        let energy = voltage * current * tick.as_secs_f64() / 3600.0 * self.time_multiplier;
        self.level = (self.level + energy).max(0.0);
        if self.level >= self.capacity {
            self.level = self.capacity;
            self.full = true;
            self.charging = false;
        }
    }

    fn state_of_charge(&self) -> f64 {
        self.level / self.capacity * 100.0
    }

    fn capacity(&self) -> f64 {
        self.capacity
    }

    fn level(&self) -> f64 {
        self.level
    }

    fn is_full(&self) -> bool {
        self.full
    }

    fn is_charging(&self) -> bool {
        self.charging
    }

    fn set_charging(&mut self, charging: bool) {
        self.charging = charging && !self.full;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_battery_does_not_charge() {
        let mut battery = LinearBattery::new(50_000.0, 20.0);
        battery.advance(Duration::from_secs(3600), 50.0, 200.0);
        assert_eq!(battery.soc_percent(), 20);
    }

    #[test]
    fn test_integration() {
        // 200 V * 50 A for one hour = 10 kWh = 20 % of 50 kWh
        let mut battery = LinearBattery::new(50_000.0, 20.0);
        battery.set_charging(true);
        battery.advance(Duration::from_secs(3600), 50.0, 200.0);
        assert_eq!(battery.level(), 20_000.0);
        assert_eq!(battery.soc_percent(), 40);
        assert!(battery.is_charging());
    }

    #[test]
    fn test_time_multiplier() {
        let mut battery = LinearBattery::new(50_000.0, 0.0).with_time_multiplier(100.0);
        battery.set_charging(true);
        battery.advance(Duration::from_secs(36), 50.0, 200.0);
        assert_eq!(battery.level(), 10_000.0);
    }

    #[test]
    fn test_clamps_at_capacity() {
        let mut battery = LinearBattery::new(1_000.0, 99.0);
        battery.set_charging(true);
        battery.advance(Duration::from_secs(3600), 100.0, 400.0);

        assert_eq!(battery.level(), 1_000.0);
        assert_eq!(battery.soc_percent(), 100);
        assert!(battery.is_full());
        assert!(!battery.is_charging());

        // a full battery refuses to charge
        battery.set_charging(true);
        assert!(!battery.is_charging());
    }

    #[test]
    fn test_initial_soc_is_clamped() {
        let battery = LinearBattery::new(1_000.0, 140.0);
        assert!(battery.is_full());
        assert_eq!(battery.state_of_charge(), 100.0);
    }
}
