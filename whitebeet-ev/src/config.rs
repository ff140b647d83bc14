//! EV configuration
//!
//! Identity, battery and charging-policy settings for one session.

use std::time::Duration;

use thiserror::Error;
use whitebeet_core::codec::nearest_representable;
use whitebeet_core::EvConfiguration;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid MAC address '{0}'")]
    InvalidMac(String),

    #[error("{0}")]
    Invalid(String),
}

/// EV-side DC limits reported to the EVSE (V, A, W)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DcLimits {
    pub min_voltage: i64,
    pub min_current: i64,
    pub min_power: i64,
    pub max_voltage: i64,
    pub max_current: i64,
    pub max_power: i64,
}

impl Default for DcLimits {
    fn default() -> Self {
        Self {
            min_voltage: 150,
            min_current: 0,
            min_power: 0,
            max_voltage: 300,
            max_current: 100,
            max_power: 12000,
        }
    }
}

/// Complete EV configuration
#[derive(Debug, Clone)]
pub struct EvConfig {
    // Identity
    pub evid: [u8; 6],
    pub protocols: Vec<u8>,
    pub payment_methods: Vec<u8>,
    pub energy_transfer_modes: Vec<u8>,

    // Battery
    /// Wh
    pub battery_capacity: f64,
    /// Percent
    pub initial_soc: f64,
    /// Simulated seconds per wall-clock second
    pub time_multiplier: f64,

    // Charging policy
    pub charging_voltage: f64,
    pub initial_current: f64,
    /// Lowest current of the taper above `bulk_soc`
    pub floor_current: f64,
    pub bulk_soc: u8,
    pub full_soc: u8,
    pub dc_limits: DcLimits,
    /// Seconds from session start
    pub departure_time: u32,

    // Timing
    /// Session loop period, also the battery integration step
    pub tick: Duration,
    pub evse_connect_timeout: Duration,
    pub duty_cycle_poll_interval: Duration,
    pub slac_match_timeout: Duration,
    pub slac_poll_interval: Duration,
}

impl Default for EvConfig {
    fn default() -> Self {
        Self {
            evid: [0x02, 0x00, 0x00, 0x00, 0x00, 0x01],
            protocols: vec![0, 1],
            payment_methods: vec![0],
            energy_transfer_modes: vec![0, 4],
            battery_capacity: 50_000.0,
            initial_soc: 30.0,
            time_multiplier: 1000.0,
            charging_voltage: 200.0,
            initial_current: 50.0,
            floor_current: 5.0,
            bulk_soc: 80,
            full_soc: 100,
            dc_limits: DcLimits::default(),
            departure_time: 0,
            tick: Duration::from_millis(50),
            evse_connect_timeout: Duration::from_secs(30),
            duty_cycle_poll_interval: Duration::from_millis(100),
            slac_match_timeout: Duration::from_secs(60),
            slac_poll_interval: Duration::from_millis(200),
        }
    }
}

impl EvConfig {
    /// Set the EVCC id from a colon separated MAC
    pub fn with_mac(mut self, mac: &str) -> Result<Self, ConfigError> {
        self.evid = parse_mac(mac)?;
        Ok(self)
    }

    pub fn with_initial_soc(mut self, soc: f64) -> Self {
        self.initial_soc = soc;
        self
    }

    /// Set charging voltage and the initial (bulk) current
    pub fn with_charging_inputs(mut self, voltage: f64, current: f64) -> Self {
        self.charging_voltage = voltage;
        self.initial_current = current;
        self
    }

    pub fn with_battery_capacity(mut self, capacity_wh: f64) -> Self {
        self.battery_capacity = capacity_wh;
        self
    }

    /// Set the SOC where tapering begins and the current it tapers down to
    pub fn with_taper(mut self, bulk_soc: u8, floor_current: f64) -> Self {
        self.bulk_soc = bulk_soc;
        self.floor_current = floor_current;
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_time_multiplier(mut self, multiplier: f64) -> Self {
        self.time_multiplier = multiplier;
        self
    }

    /// Set the SLAC matching timeout and how often the inbox is checked meanwhile
    pub fn with_slac_timing(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.slac_match_timeout = timeout;
        self.slac_poll_interval = poll_interval;
        self
    }

    pub fn with_evse_connect_timeout(mut self, timeout: Duration) -> Self {
        self.evse_connect_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !positive(self.battery_capacity) {
            return Err(ConfigError::Invalid("battery capacity must be positive".into()));
        }
        if !(0.0..=100.0).contains(&self.initial_soc) {
            return Err(ConfigError::Invalid(format!(
                "initial SOC {} outside 0..=100",
                self.initial_soc
            )));
        }
        if !positive(self.charging_voltage) {
            return Err(ConfigError::Invalid("charging voltage must be positive".into()));
        }
        if self.floor_current < 0.0 || self.floor_current > self.initial_current {
            return Err(ConfigError::Invalid(format!(
                "floor current {} A must lie in 0..={} A",
                self.floor_current, self.initial_current
            )));
        }
        if self.bulk_soc >= 100 || self.full_soc > 100 || self.bulk_soc >= self.full_soc {
            return Err(ConfigError::Invalid(format!(
                "need bulk SOC < full SOC <= 100, got {} / {}",
                self.bulk_soc, self.full_soc
            )));
        }
        if !positive(self.time_multiplier) {
            return Err(ConfigError::Invalid("time multiplier must be positive".into()));
        }
        if self.tick.is_zero() {
            return Err(ConfigError::Invalid("tick must be non-zero".into()));
        }
        Ok(())
    }

    /// Record pushed with the EV configuration command
    pub fn ev_configuration(&self) -> EvConfiguration {
        EvConfiguration {
            evid: self.evid,
            protocols: self.protocols.clone(),
            payment_methods: self.payment_methods.clone(),
            energy_transfer_modes: self.energy_transfer_modes.clone(),
            battery_capacity: nearest_representable(self.battery_capacity.round() as i64),
        }
    }

    pub fn mac_string(&self) -> String {
        self.evid
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(":")
    }
}

fn positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

fn parse_mac(mac: &str) -> Result<[u8; 6], ConfigError> {
    let invalid = || ConfigError::InvalidMac(mac.to_string());
    let mut evid = [0u8; 6];
    let mut parts = mac.split(':');
    for byte in evid.iter_mut() {
        let part = parts.next().ok_or_else(invalid)?;
        if part.len() != 2 {
            return Err(invalid());
        }
        *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
    }
    if parts.next().is_some() {
        return Err(invalid());
    }
    Ok(evid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = EvConfig::default()
            .with_mac("02:1a:2B:00:00:ff")
            .unwrap()
            .with_initial_soc(55.0)
            .with_charging_inputs(400.0, 80.0)
            .with_taper(70, 8.0);

        assert_eq!(config.evid, [0x02, 0x1A, 0x2B, 0x00, 0x00, 0xFF]);
        assert_eq!(config.mac_string(), "02:1a:2b:00:00:ff");
        assert_eq!(config.initial_soc, 55.0);
        assert_eq!(config.initial_current, 80.0);
        assert_eq!(config.bulk_soc, 70);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_macs() {
        for mac in ["", "02:00:00:00:00", "02:00:00:00:00:01:02", "2:00:00:00:00:01", "zz:00:00:00:00:01"] {
            assert_eq!(
                EvConfig::default().with_mac(mac).unwrap_err(),
                ConfigError::InvalidMac(mac.to_string())
            );
        }
    }

    #[test]
    fn test_validation() {
        assert!(EvConfig::default().validate().is_ok());
        assert!(EvConfig::default().with_initial_soc(101.0).validate().is_err());
        assert!(EvConfig::default().with_taper(100, 5.0).validate().is_err());
        assert!(EvConfig::default().with_taper(80, 60.0).validate().is_err());
        assert!(EvConfig::default().with_battery_capacity(0.0).validate().is_err());
        assert!(EvConfig::default().with_tick(Duration::ZERO).validate().is_err());
    }

    #[test]
    fn test_ev_configuration_rounds_capacity() {
        let config = EvConfig::default().with_battery_capacity(123_456.0);
        assert_eq!(config.ev_configuration().battery_capacity, 123_460);
        assert_eq!(config.ev_configuration().energy_transfer_modes, vec![0, 4]);
    }
}
