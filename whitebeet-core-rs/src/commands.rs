//! Typed command catalog
//!
//! Each call builds one `(module, sub, payload)` triple and runs it through
//! `Exchange::send_query`. Errors propagate unchanged; nothing here retries.

use tracing::{debug, info};

use crate::codec::{encode_exponential, encode_u32_be, CodecError};
use crate::exchange::{Exchange, ExchangeError};
use crate::types::{control_pilot, slac, system, v2g, ModuleId, ResistorState, Role};

/// EV identity and capabilities pushed once a session has started
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvConfiguration {
    /// EVCC id, usually the MAC of the PLC interface
    pub evid: [u8; 6],
    pub protocols: Vec<u8>,
    pub payment_methods: Vec<u8>,
    pub energy_transfer_modes: Vec<u8>,
    /// Wh
    pub battery_capacity: i64,
}

impl EvConfiguration {
    pub fn to_payload(&self) -> Result<Vec<u8>, CodecError> {
        let mut payload = Vec::with_capacity(32);
        payload.extend_from_slice(&self.evid);
        push_list(&mut payload, &self.protocols);
        push_list(&mut payload, &self.payment_methods);
        push_list(&mut payload, &self.energy_transfer_modes);
        payload.extend_from_slice(&encode_exponential(self.battery_capacity)?);
        Ok(payload)
    }
}

fn push_list(payload: &mut Vec<u8>, items: &[u8]) {
    payload.push(items.len() as u8);
    payload.extend_from_slice(items);
}

/// EV-side DC charging parameters, volts / amps / watts
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DcChargingParameters {
    pub min_voltage: i64,
    pub min_current: i64,
    pub min_power: i64,
    pub max_voltage: i64,
    pub max_current: i64,
    pub max_power: i64,
    pub soc: u8,
    pub status: u8,
    pub target_voltage: i64,
    pub target_current: i64,
    // only sent with the initial "set"
    pub full_soc: u8,
    pub bulk_soc: u8,
    /// Wh
    pub energy_request: i64,
    /// Seconds from now
    pub departure_time: u32,
}

impl DcChargingParameters {
    /// Payload for the periodic update
    pub fn to_update_payload(&self) -> Result<Vec<u8>, CodecError> {
        let mut payload = Vec::with_capacity(32);
        for value in [
            self.min_voltage,
            self.min_current,
            self.min_power,
            self.max_voltage,
            self.max_current,
            self.max_power,
        ] {
            payload.extend_from_slice(&encode_exponential(value)?);
        }
        payload.push(self.soc);
        payload.push(self.status);
        payload.extend_from_slice(&encode_exponential(self.target_voltage)?);
        payload.extend_from_slice(&encode_exponential(self.target_current)?);
        Ok(payload)
    }

    /// Payload for the initial set, with SOC thresholds, energy and departure
    pub fn to_set_payload(&self) -> Result<Vec<u8>, CodecError> {
        let mut payload = self.to_update_payload()?;
        payload.push(self.full_soc);
        payload.push(self.bulk_soc);
        payload.extend_from_slice(&encode_exponential(self.energy_request)?);
        payload.extend_from_slice(&encode_u32_be(self.departure_time));
        Ok(payload)
    }
}

/// EV-side AC charging parameters, amps / volts
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AcChargingParameters {
    pub max_current: i64,
    pub min_current: i64,
    pub nominal_voltage: i64,
}

impl AcChargingParameters {
    pub fn to_payload(&self) -> Result<Vec<u8>, CodecError> {
        let mut payload = Vec::with_capacity(9);
        for value in [self.max_current, self.min_current, self.nominal_voltage] {
            payload.extend_from_slice(&encode_exponential(value)?);
        }
        Ok(payload)
    }
}

/// Command façade over an `Exchange`
#[derive(Debug, Clone)]
pub struct Whitebeet {
    exchange: Exchange,
}

impl Whitebeet {
    pub fn new(exchange: Exchange) -> Self {
        Self { exchange }
    }

    pub fn exchange(&self) -> &Exchange {
        &self.exchange
    }

    /// Commands on the same link that ignore the exchange's stop token
    pub fn without_stop(&self) -> Self {
        Self::new(self.exchange.without_stop())
    }

    fn query(&self, module: ModuleId, sub_id: u8, payload: &[u8]) -> Result<Vec<u8>, ExchangeError> {
        self.exchange.send_query(module.id(), sub_id, payload)
    }

    fn command(&self, module: ModuleId, sub_id: u8, payload: &[u8]) -> Result<(), ExchangeError> {
        self.query(module, sub_id, payload).map(|_| ())
    }

    // ------------------------------------------------------------------
    // System
    // ------------------------------------------------------------------

    /// Firmware version string
    pub fn system_get_version(&self) -> Result<String, ExchangeError> {
        let body = self.query(ModuleId::Diagnostic, system::GET_VERSION, &[])?;
        let version = String::from_utf8_lossy(&body)
            .trim_end_matches('\0')
            .trim()
            .to_string();
        info!("Whitebeet firmware version: {}", version);
        Ok(version)
    }

    // ------------------------------------------------------------------
    // Control pilot
    // ------------------------------------------------------------------

    pub fn control_pilot_set_mode(&self, role: Role) -> Result<(), ExchangeError> {
        self.command(ModuleId::ControlPilot, control_pilot::SET_MODE, &[role as u8])
    }

    pub fn control_pilot_start(&self) -> Result<(), ExchangeError> {
        self.command(ModuleId::ControlPilot, control_pilot::START, &[])
    }

    pub fn control_pilot_stop(&self) -> Result<(), ExchangeError> {
        self.command(ModuleId::ControlPilot, control_pilot::STOP, &[])
    }

    pub fn control_pilot_set_resistor(&self, state: ResistorState) -> Result<(), ExchangeError> {
        self.command(ModuleId::ControlPilot, control_pilot::SET_RESISTOR, &[state as u8])
    }

    /// Duty cycle in percent; the module reports per mille
    pub fn control_pilot_get_duty_cycle(&self) -> Result<f64, ExchangeError> {
        let body = self.query(ModuleId::ControlPilot, control_pilot::GET_DUTY_CYCLE, &[])?;
        match body.as_slice() {
            [hi, lo, ..] => Ok(u16::from_be_bytes([*hi, *lo]) as f64 / 10.0),
            _ => Err(ExchangeError::MalformedReply("duty cycle needs two bytes")),
        }
    }

    // ------------------------------------------------------------------
    // SLAC
    // ------------------------------------------------------------------

    pub fn slac_set_validation_configuration(&self, config: u8) -> Result<(), ExchangeError> {
        self.command(ModuleId::Slac, slac::SET_VALIDATION_CONFIG, &[config])
    }

    pub fn slac_set_attn_tx_ref(&self, reference: &[u8]) -> Result<(), ExchangeError> {
        self.command(ModuleId::Slac, slac::SET_ATTN_TX_REF, reference)
    }

    pub fn slac_start(&self, role: Role) -> Result<(), ExchangeError> {
        self.command(ModuleId::Slac, slac::START, &[role as u8])
    }

    pub fn slac_stop(&self) -> Result<(), ExchangeError> {
        self.command(ModuleId::Slac, slac::STOP, &[])
    }

    /// Kick off matching; the outcome arrives later as a SLAC notification
    pub fn slac_start_matching(&self) -> Result<(), ExchangeError> {
        self.command(ModuleId::Slac, slac::START_MATCHING, &[])
    }

    // ------------------------------------------------------------------
    // V2G
    // ------------------------------------------------------------------

    pub fn v2g_set_mode(&self, role: Role) -> Result<(), ExchangeError> {
        self.command(ModuleId::V2g, v2g::SET_MODE, &[role as u8])
    }

    pub fn v2g_start(&self) -> Result<(), ExchangeError> {
        self.command(ModuleId::V2g, v2g::START, &[])
    }

    pub fn v2g_stop(&self) -> Result<(), ExchangeError> {
        self.command(ModuleId::V2g, v2g::STOP, &[])
    }

    pub fn v2g_start_session(&self) -> Result<(), ExchangeError> {
        self.command(ModuleId::V2g, v2g::START_SESSION, &[])
    }

    pub fn v2g_stop_session(&self) -> Result<(), ExchangeError> {
        self.command(ModuleId::V2g, v2g::STOP_SESSION, &[])
    }

    pub fn v2g_start_cable_check(&self) -> Result<(), ExchangeError> {
        self.command(ModuleId::V2g, v2g::START_CABLE_CHECK, &[])
    }

    pub fn v2g_start_pre_charging(&self) -> Result<(), ExchangeError> {
        self.command(ModuleId::V2g, v2g::START_PRE_CHARGING, &[])
    }

    pub fn v2g_start_charging(&self) -> Result<(), ExchangeError> {
        self.command(ModuleId::V2g, v2g::START_CHARGING, &[])
    }

    pub fn v2g_stop_charging(&self, renegotiation: bool) -> Result<(), ExchangeError> {
        self.command(ModuleId::V2g, v2g::STOP_CHARGING, &[renegotiation as u8])
    }

    pub fn v2g_ev_set_configuration(&self, config: &EvConfiguration) -> Result<(), ExchangeError> {
        let payload = config.to_payload()?;
        self.command(ModuleId::V2g, v2g::SET_CONFIGURATION, &payload)?;
        info!("EV configuration pushed ({} bytes)", payload.len());
        Ok(())
    }

    pub fn v2g_set_dc_charging_parameters(
        &self,
        params: &DcChargingParameters,
    ) -> Result<(), ExchangeError> {
        let payload = params.to_set_payload()?;
        self.command(ModuleId::V2g, v2g::SET_DC_PARAMETERS, &payload)
    }

    pub fn v2g_update_dc_charging_parameters(
        &self,
        params: &DcChargingParameters,
    ) -> Result<(), ExchangeError> {
        let payload = params.to_update_payload()?;
        debug!("DC update: soc={} target={}A", params.soc, params.target_current);
        self.command(ModuleId::V2g, v2g::UPDATE_DC_PARAMETERS, &payload)
    }

    pub fn v2g_set_ac_charging_parameters(
        &self,
        params: &AcChargingParameters,
    ) -> Result<(), ExchangeError> {
        let payload = params.to_payload()?;
        self.command(ModuleId::V2g, v2g::SET_AC_PARAMETERS, &payload)
    }

    pub fn v2g_update_ac_charging_parameters(
        &self,
        params: &AcChargingParameters,
    ) -> Result<(), ExchangeError> {
        let payload = params.to_payload()?;
        self.command(ModuleId::V2g, v2g::UPDATE_AC_PARAMETERS, &payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::sim::SimulatedPeer;

    fn whitebeet(peer: &SimulatedPeer) -> Whitebeet {
        let (exchange, _inbox) = Exchange::new(Box::new(peer.clone()), LinkConfig::default());
        exchange.open().unwrap();
        Whitebeet::new(exchange)
    }

    #[test]
    fn test_ev_configuration_payload() {
        let config = EvConfiguration {
            evid: [0x02, 0, 0, 0, 0, 0x01],
            protocols: vec![0, 1],
            payment_methods: vec![0],
            energy_transfer_modes: vec![0, 4],
            battery_capacity: 50000,
        };
        assert_eq!(
            config.to_payload().unwrap(),
            vec![0x02, 0, 0, 0, 0, 0x01, 2, 0, 1, 1, 0, 2, 0, 4, 0x13, 0x88, 0x01]
        );
    }

    #[test]
    fn test_dc_parameter_variants() {
        let params = DcChargingParameters {
            max_voltage: 400,
            max_current: 100,
            max_power: 12000,
            soc: 42,
            target_voltage: 200,
            target_current: 50,
            full_soc: 100,
            bulk_soc: 80,
            energy_request: 29000,
            departure_time: 3600,
            ..Default::default()
        };

        let update = params.to_update_payload().unwrap();
        assert_eq!(update.len(), 6 * 3 + 2 + 2 * 3);
        assert_eq!(update[18], 42);

        let set = params.to_set_payload().unwrap();
        assert_eq!(set.len(), update.len() + 2 + 3 + 4);
        assert_eq!(&set[..update.len()], update.as_slice());
        assert_eq!(&set[update.len()..update.len() + 2], &[100, 80]);
        assert_eq!(&set[set.len() - 4..], &[0, 0, 0x0E, 0x10]);
    }

    #[test]
    fn test_unrepresentable_parameter_is_rejected_before_sending() {
        let peer = SimulatedPeer::new();
        let wb = whitebeet(&peer);
        let params = DcChargingParameters {
            max_power: 40001,
            ..Default::default()
        };

        assert!(matches!(
            wb.v2g_update_dc_charging_parameters(&params),
            Err(ExchangeError::Encode(CodecError::Unrepresentable(40001)))
        ));
        assert!(peer.requests().is_empty());
    }

    #[test]
    fn test_command_triples() {
        let peer = SimulatedPeer::new();
        let wb = whitebeet(&peer);

        wb.control_pilot_set_mode(Role::Ev).unwrap();
        wb.control_pilot_set_resistor(ResistorState::B).unwrap();
        wb.slac_start(Role::Ev).unwrap();
        wb.v2g_start_session().unwrap();
        wb.v2g_stop_charging(true).unwrap();

        let sent: Vec<_> = peer
            .requests()
            .into_iter()
            .map(|r| (r.module_id, r.sub_id, r.payload))
            .collect();
        assert_eq!(
            sent,
            vec![
                (0x29, 0x40, vec![0]),
                (0x29, 0x46, vec![0]),
                (0x28, 0x42, vec![0]),
                (0x27, 0xA9, vec![]),
                (0x27, 0xAD, vec![1]),
            ]
        );
    }

    #[test]
    fn test_duty_cycle_and_version() {
        let peer = SimulatedPeer::new();
        peer.set_duty_cycle_permille(50);
        let wb = whitebeet(&peer);

        assert_eq!(wb.control_pilot_get_duty_cycle().unwrap(), 5.0);
        assert_eq!(wb.system_get_version().unwrap(), "v1.0");

        peer.respond_with(0x29, 0x45, vec![0x00]);
        assert!(matches!(
            wb.control_pilot_get_duty_cycle(),
            Err(ExchangeError::MalformedReply(_))
        ));
    }
}
