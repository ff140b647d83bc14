//! Target current selection
//!
//! Two sources, in priority order:
//!
//! 1. a received schedule, read as a time-indexed power envelope
//! 2. a CC/CV-style taper: full current up to `bulk_soc`, then linear down
//!    to `floor_current` at 100 %
//!
//! Either way the result is capped by the EVSE's advertised maximum current.

use tracing::trace;
use whitebeet_core::ChargingProfile;

use crate::config::EvConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct ChargingPolicy {
    pub voltage: f64,
    pub initial_current: f64,
    pub floor_current: f64,
    pub bulk_soc: f64,
}

impl ChargingPolicy {
    pub fn new(voltage: f64, initial_current: f64, floor_current: f64, bulk_soc: u8) -> Self {
        Self {
            voltage,
            initial_current,
            floor_current,
            bulk_soc: bulk_soc as f64,
        }
    }

    pub fn from_config(config: &EvConfig) -> Self {
        Self::new(
            config.charging_voltage,
            config.initial_current,
            config.floor_current,
            config.bulk_soc,
        )
    }

    /// Current for `soc` percent without a schedule
    pub fn taper_current(&self, soc: f64) -> f64 {
        if soc < self.bulk_soc {
            return self.initial_current;
        }
        let progress = (soc - self.bulk_soc) / (100.0 - self.bulk_soc);
        let current = self.initial_current - (self.initial_current - self.floor_current) * progress;
        current.max(self.floor_current)
    }

    /// Current the schedule allows `elapsed_secs` into it, if an entry is in force
    pub fn schedule_current(&self, profile: &ChargingProfile, elapsed_secs: u64) -> Option<f64> {
        let entry = profile.entry_at(elapsed_secs)?;
        Some((entry.power / self.voltage).max(0.0))
    }

    /// Current to request this tick
    pub fn target_current(
        &self,
        soc: f64,
        schedule: Option<(&ChargingProfile, u64)>,
        evse_max_current: Option<f64>,
    ) -> f64 {
        let current = schedule
            .and_then(|(profile, elapsed)| self.schedule_current(profile, elapsed))
            .unwrap_or_else(|| self.taper_current(soc));
        let capped = match evse_max_current {
            Some(max) if max > 0.0 => current.min(max),
            _ => current,
        };
        trace!("target current {:.2} A at {:.1} % SOC", capped, soc);
        capped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use whitebeet_core::ProfileEntry;

    fn policy() -> ChargingPolicy {
        ChargingPolicy::new(200.0, 50.0, 5.0, 80)
    }

    fn profile() -> ChargingProfile {
        ChargingProfile {
            tuple_count: 1,
            tuple_id: 1,
            entries: vec![
                ProfileEntry { start: 0, interval: 10, power: 10_000.0 },
                ProfileEntry { start: 10, interval: 10, power: 5_000.0 },
                ProfileEntry { start: 20, interval: 0, power: 8_000.0 },
            ],
        }
    }

    #[test]
    fn test_bulk_phase_uses_initial_current() {
        assert_eq!(policy().taper_current(0.0), 50.0);
        assert_eq!(policy().taper_current(79.9), 50.0);
        assert_eq!(policy().taper_current(80.0), 50.0);
    }

    #[test]
    fn test_taper_midpoint() {
        assert_eq!(policy().taper_current(90.0), 27.5);
    }

    #[test]
    fn test_taper_reaches_floor() {
        assert_eq!(policy().taper_current(100.0), 5.0);
        assert_eq!(policy().taper_current(120.0), 5.0);
    }

    #[test]
    fn test_schedule_envelope() {
        let p = policy();
        let schedule = profile();

        assert_eq!(p.target_current(10.0, Some((&schedule, 0)), None), 50.0);
        assert_eq!(p.target_current(10.0, Some((&schedule, 12)), None), 25.0);
        assert_eq!(p.target_current(10.0, Some((&schedule, 500)), None), 40.0);
    }

    #[test]
    fn test_evse_limit_caps_current() {
        let p = policy();
        assert_eq!(p.target_current(10.0, None, Some(32.0)), 32.0);
        assert_eq!(p.target_current(10.0, Some((&profile(), 0)), Some(20.0)), 20.0);
        // a zero limit means "not advertised"
        assert_eq!(p.target_current(10.0, None, Some(0.0)), 50.0);
    }

    #[test]
    fn test_empty_schedule_falls_back_to_taper() {
        let p = policy();
        let empty = ChargingProfile::default();
        assert_eq!(p.target_current(90.0, Some((&empty, 0)), None), 27.5);
    }
}
