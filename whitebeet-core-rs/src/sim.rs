//! In-process stand-in for the charging-controller module
//!
//! `SimulatedPeer` speaks the SPI side of the link: it answers size and data
//! transfers, drives the two handshake lines, echoes request ids and queues
//! unsolicited notifications. Clones share the same state, so a test can keep
//! one handle while the exchange owns another.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::codec::{decode_inbound, encode_frame, ChecksumPolicy};
use crate::exchange::{DATA_MARKER, SIZE_MARKER, SPI_HEADER_LEN};
use crate::transport::{Transport, TransportError, RX_READY_MASK, TX_PENDING_MASK};
use crate::types::{control_pilot, slac, system, v2g, ModuleId, NotificationId};

/// Request id carried by unsolicited frames
const NOTIFICATION_REQUEST_ID: u8 = 0x00;

const SIM_SESSION_ID: [u8; 8] = [0x5E, 0x55, 0x10, 0x00, 0x00, 0x00, 0x00, 0x01];

/// A request as the peer decoded it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub module_id: u8,
    pub sub_id: u8,
    pub request_id: u8,
    pub payload: Vec<u8>,
}

/// Notification queued after the response to a request
#[derive(Debug, Clone)]
struct FollowUp {
    module_id: u8,
    sub_id: u8,
    payload: Vec<u8>,
}

#[derive(Debug)]
struct PeerState {
    open: bool,
    rx_ready: bool,
    floating_size: bool,
    corrupt_next_id: bool,
    /// Length announced by the host's size frame, awaiting its data frame
    incoming: Option<usize>,
    /// Frame whose size was reported, awaiting the host's data read
    announced: Option<Vec<u8>>,
    outbound: VecDeque<Vec<u8>>,
    responses: HashMap<(u8, u8), Vec<u8>>,
    muted: HashSet<(u8, u8)>,
    follow_ups: HashMap<(u8, u8), Vec<FollowUp>>,
    /// Requests answered by a size frame alone
    sized_answers: HashMap<(u8, u8), u16>,
    /// Size reported by the next size read instead of a queued frame
    forced_size: Option<u16>,
    requests: Vec<RecordedRequest>,
    duty_cycle_permille: u16,
    version: String,
    status_reads: u64,
}

impl Default for PeerState {
    fn default() -> Self {
        Self {
            open: false,
            rx_ready: true,
            floating_size: false,
            corrupt_next_id: false,
            incoming: None,
            announced: None,
            outbound: VecDeque::new(),
            responses: HashMap::new(),
            muted: HashSet::new(),
            follow_ups: HashMap::new(),
            sized_answers: HashMap::new(),
            forced_size: None,
            requests: Vec::new(),
            duty_cycle_permille: 50,
            version: "v1.0".to_string(),
            status_reads: 0,
        }
    }
}

/// Scriptable module emulation implementing `Transport`
#[derive(Debug, Clone, Default)]
pub struct SimulatedPeer {
    state: Arc<Mutex<PeerState>>,
}

impl SimulatedPeer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A station that walks an EV through SLAC and a full DC session:
    /// every command the EV issues is answered with the notifications an
    /// EVSE would send next.
    pub fn charging_station() -> Self {
        let peer = Self::new();
        let station = ModuleId::V2g.id();
        let note = |id: NotificationId| id.sub_id();

        peer.on_request(
            ModuleId::Slac.id(),
            slac::START_MATCHING,
            &[(ModuleId::Slac.id(), slac::MATCHED, vec![])],
        );
        peer.on_request(
            station,
            v2g::START_SESSION,
            &[
                (
                    station,
                    note(NotificationId::SessionStarted),
                    payloads::session_started(2, SIM_SESSION_ID, b"DE*SIM*E1", 0, 3),
                ),
                (
                    station,
                    note(NotificationId::DcChargeParametersChanged),
                    payloads::dc_evse_parameters(&payloads::default_dc_limits()),
                ),
                (station, note(NotificationId::CableCheckReady), vec![]),
            ],
        );
        peer.on_request(
            station,
            v2g::START_CABLE_CHECK,
            &[
                (station, note(NotificationId::CableCheckFinished), vec![]),
                (station, note(NotificationId::PreChargingReady), vec![]),
            ],
        );
        peer.on_request(
            station,
            v2g::START_PRE_CHARGING,
            &[(station, note(NotificationId::ChargingReady), vec![])],
        );
        peer.on_request(
            station,
            v2g::START_CHARGING,
            &[(station, note(NotificationId::ChargingStarted), vec![])],
        );
        peer.on_request(
            station,
            v2g::STOP_SESSION,
            &[(station, note(NotificationId::SessionStopped), vec![])],
        );
        peer
    }

    /// Full response payload, ack byte included, for `(module, sub)`
    pub fn respond_with(&self, module_id: u8, sub_id: u8, payload: Vec<u8>) {
        let mut state = self.state.lock();
        state.muted.remove(&(module_id, sub_id));
        state.responses.insert((module_id, sub_id), payload);
    }

    /// Answer `(module, sub)` with a bare NACK code
    pub fn nack(&self, module_id: u8, sub_id: u8, code: u8) {
        self.respond_with(module_id, sub_id, vec![code]);
    }

    /// Never answer `(module, sub)`
    pub fn mute(&self, module_id: u8, sub_id: u8) {
        self.state.lock().muted.insert((module_id, sub_id));
    }

    /// Queue notifications to send once `(module, sub)` has been answered
    pub fn on_request(&self, module_id: u8, sub_id: u8, follow_ups: &[(u8, u8, Vec<u8>)]) {
        let follow_ups = follow_ups
            .iter()
            .map(|(module_id, sub_id, payload)| FollowUp {
                module_id: *module_id,
                sub_id: *sub_id,
                payload: payload.clone(),
            })
            .collect();
        self.state.lock().follow_ups.insert((module_id, sub_id), follow_ups);
    }

    /// Answer `(module, sub)` by announcing `size` bytes and sending no frame.
    /// Size 0 is a bare ACK.
    pub fn answer_with_size(&self, module_id: u8, sub_id: u8, size: u16) {
        self.state.lock().sized_answers.insert((module_id, sub_id), size);
    }

    pub fn set_rx_ready(&self, ready: bool) {
        self.state.lock().rx_ready = ready;
    }

    /// Report 0xFFFF from every size read, as an undriven bus would
    pub fn set_floating_size(&self, floating: bool) {
        self.state.lock().floating_size = floating;
    }

    /// Echo a wrong request id in the next response
    pub fn corrupt_next_response_id(&self) {
        self.state.lock().corrupt_next_id = true;
    }

    pub fn set_duty_cycle_permille(&self, permille: u16) {
        self.state.lock().duty_cycle_permille = permille;
    }

    pub fn set_version(&self, version: &str) {
        self.state.lock().version = version.to_string();
    }

    /// Queue an unsolicited frame
    pub fn push_notification(&self, module_id: u8, sub_id: u8, payload: Vec<u8>) {
        match encode_frame(module_id, sub_id, NOTIFICATION_REQUEST_ID, &payload) {
            Ok(frame) => self.state.lock().outbound.push_back(frame),
            Err(e) => warn!("Simulated peer cannot queue 0x{:02X}/0x{:02X}: {}", module_id, sub_id, e),
        }
    }

    /// Queue arbitrary bytes as the next frame
    pub fn push_raw(&self, bytes: Vec<u8>) {
        self.state.lock().outbound.push_back(bytes);
    }

    /// Every well-formed request received so far
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().requests.clone()
    }

    /// Requests received for `(module, sub)`
    pub fn count(&self, module_id: u8, sub_id: u8) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.module_id == module_id && r.sub_id == sub_id)
            .count()
    }

    pub fn pending(&self) -> usize {
        self.state.lock().outbound.len()
    }

    pub fn status_reads(&self) -> u64 {
        self.state.lock().status_reads
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }
}

impl PeerState {
    fn handle_request(&mut self, bytes: &[u8]) {
        let frame = match decode_inbound(bytes, ChecksumPolicy::Strict) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Simulated peer dropped a malformed request: {}", e);
                return;
            }
        };
        let key = (frame.module_id, frame.sub_id);
        self.requests.push(RecordedRequest {
            module_id: frame.module_id,
            sub_id: frame.sub_id,
            request_id: frame.request_id,
            payload: frame.payload.clone(),
        });

        if self.muted.contains(&key) {
            debug!("Simulated peer ignoring 0x{:02X}/0x{:02X}", key.0, key.1);
            return;
        }
        if let Some(size) = self.sized_answers.get(&key) {
            self.forced_size = Some(*size);
            return;
        }

        let payload = self.response_payload(key);
        let mut request_id = frame.request_id;
        if self.corrupt_next_id {
            self.corrupt_next_id = false;
            request_id = request_id.wrapping_add(0x10);
        }

        match encode_frame(frame.module_id, frame.sub_id, request_id, &payload) {
            Ok(response) => self.outbound.push_front(response),
            Err(e) => warn!("Simulated peer cannot encode response: {}", e),
        }

        if let Some(follow_ups) = self.follow_ups.get(&key) {
            for f in follow_ups {
                if let Ok(frame) = encode_frame(f.module_id, f.sub_id, NOTIFICATION_REQUEST_ID, &f.payload) {
                    self.outbound.push_back(frame);
                }
            }
        }
    }

    fn response_payload(&self, key: (u8, u8)) -> Vec<u8> {
        if let Some(payload) = self.responses.get(&key) {
            return payload.clone();
        }
        match key {
            (m, control_pilot::GET_DUTY_CYCLE) if m == ModuleId::ControlPilot.id() => {
                let [hi, lo] = self.duty_cycle_permille.to_be_bytes();
                vec![0x00, hi, lo]
            }
            (m, system::GET_VERSION) if m == ModuleId::Diagnostic.id() => {
                let mut payload = vec![0x00];
                payload.extend_from_slice(self.version.as_bytes());
                payload
            }
            _ => vec![0x00],
        }
    }
}

impl Transport for SimulatedPeer {
    fn open(&mut self) -> Result<(), TransportError> {
        self.state.lock().open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.state.lock().open = false;
    }

    fn transfer(&mut self, buffer: &mut [u8]) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(TransportError::NotOpen);
        }
        if buffer.len() < SPI_HEADER_LEN {
            return Err(TransportError::Rejected(format!("{} byte transfer", buffer.len())));
        }

        if buffer[..2] == SIZE_MARKER {
            let host_len = u16::from_be_bytes([buffer[2], buffer[3]]) as usize;
            if host_len > 0 {
                // host announces a request
                state.incoming = Some(host_len);
                buffer[2..4].fill(0);
                return Ok(());
            }
            let len: u16 = if state.floating_size {
                0xFFFF
            } else if let Some(size) = state.forced_size.take() {
                size
            } else if let Some(frame) = state.outbound.pop_front() {
                let len = frame.len() as u16;
                state.announced = Some(frame);
                len
            } else {
                0
            };
            buffer[2..4].copy_from_slice(&len.to_be_bytes());
            return Ok(());
        }

        if buffer[..2] == DATA_MARKER {
            if let Some(len) = state.incoming.take() {
                let end = (SPI_HEADER_LEN + len).min(buffer.len());
                let request = buffer[SPI_HEADER_LEN..end].to_vec();
                state.handle_request(&request);
                return Ok(());
            }
            if let Some(frame) = state.announced.take() {
                let n = frame.len().min(buffer.len() - SPI_HEADER_LEN);
                buffer[SPI_HEADER_LEN..SPI_HEADER_LEN + n].copy_from_slice(&frame[..n]);
                return Ok(());
            }
            return Err(TransportError::Rejected("data transfer without a size frame".to_string()));
        }

        Err(TransportError::Rejected(format!(
            "unknown transfer marker {:02X} {:02X}",
            buffer[0], buffer[1]
        )))
    }

    fn read_status(&mut self) -> Result<u32, TransportError> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(TransportError::NotOpen);
        }
        state.status_reads += 1;

        let mut status = 0;
        if state.rx_ready {
            status |= RX_READY_MASK;
        }
        if !state.outbound.is_empty() || state.forced_size.is_some() || state.floating_size {
            status |= TX_PENDING_MASK;
        }
        Ok(status)
    }
}

/// Payload builders for the notifications the peer can send
pub mod payloads {
    use crate::codec::{encode_exponential, nearest_representable};
    use crate::parsers::{AcEvseParameters, ChargingProfile, DcEvseParameters};

    fn exp(value: f64) -> [u8; 3] {
        encode_exponential(nearest_representable(value.round() as i64)).unwrap_or_default()
    }

    pub fn session_started(
        protocol: u8,
        session_id: [u8; 8],
        evse_id: &[u8],
        payment_method: u8,
        energy_transfer_mode: u8,
    ) -> Vec<u8> {
        let mut p = vec![protocol];
        p.extend_from_slice(&session_id);
        p.push(evse_id.len() as u8);
        p.extend_from_slice(evse_id);
        p.push(payment_method);
        p.push(energy_transfer_mode);
        p
    }

    /// DC limits the preset station advertises
    pub fn default_dc_limits() -> DcEvseParameters {
        DcEvseParameters {
            min_voltage: 150.0,
            min_current: 0.0,
            min_power: 0.0,
            max_voltage: 500.0,
            max_current: 200.0,
            max_power: 50000.0,
            present_voltage: 0.0,
            present_current: 0.0,
            status: 0,
            isolation_status: None,
            current_regulation_tolerance: None,
            energy_to_be_delivered: None,
        }
    }

    pub fn dc_evse_parameters(params: &DcEvseParameters) -> Vec<u8> {
        let mut p = Vec::with_capacity(40);
        for value in [
            params.min_voltage,
            params.min_current,
            params.min_power,
            params.max_voltage,
            params.max_current,
            params.max_power,
            params.present_voltage,
            params.present_current,
        ] {
            p.extend_from_slice(&exp(value));
        }
        p.push(params.status);
        match params.isolation_status {
            Some(status) => p.extend_from_slice(&[1, status]),
            None => p.push(0),
        }
        for optional in [params.current_regulation_tolerance, params.energy_to_be_delivered] {
            match optional {
                Some(value) => {
                    p.push(1);
                    p.extend_from_slice(&exp(value));
                }
                None => p.push(0),
            }
        }
        p
    }

    pub fn ac_evse_parameters(params: &AcEvseParameters) -> Vec<u8> {
        let mut p = Vec::with_capacity(7);
        p.extend_from_slice(&exp(params.nominal_voltage));
        p.extend_from_slice(&exp(params.max_current));
        p.push(params.rcd as u8);
        p
    }

    pub fn schedule(profile: &ChargingProfile) -> Vec<u8> {
        let mut p = vec![profile.tuple_count];
        p.extend_from_slice(&profile.tuple_id.to_be_bytes());
        p.extend_from_slice(&(profile.entries.len() as u16).to_be_bytes());
        for entry in &profile.entries {
            p.extend_from_slice(&entry.start.to_be_bytes());
            p.extend_from_slice(&entry.interval.to_be_bytes());
            p.extend_from_slice(&exp(entry.power));
        }
        p
    }

    pub fn evse_notification(kind: u8, max_delay: u16) -> Vec<u8> {
        let mut p = vec![kind];
        p.extend_from_slice(&max_delay.to_be_bytes());
        p
    }

    pub fn session_error(code: u8) -> Vec<u8> {
        vec![code]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsers::{ChargingProfile, Notification, ProfileEntry};

    #[test]
    fn test_status_lines_follow_queue() {
        let mut peer = SimulatedPeer::new();
        assert!(matches!(peer.read_status(), Err(TransportError::NotOpen)));

        peer.open().unwrap();
        assert_eq!(peer.read_status().unwrap(), RX_READY_MASK);

        peer.push_notification(0x27, 0xC4, vec![]);
        assert_eq!(peer.read_status().unwrap(), RX_READY_MASK | TX_PENDING_MASK);
        assert_eq!(peer.status_reads(), 2);
    }

    #[test]
    fn test_size_then_data_read() {
        let mut peer = SimulatedPeer::new();
        peer.open().unwrap();
        peer.push_notification(0x27, 0xC5, vec![]);

        let mut size = [0xAA, 0xAA, 0, 0];
        peer.transfer(&mut size).unwrap();
        assert_eq!(u16::from_be_bytes([size[2], size[3]]), 8);

        let mut data = vec![0x55, 0x55, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        peer.transfer(&mut data).unwrap();
        assert_eq!(&data[4..], encode_frame(0x27, 0xC5, 0, &[]).unwrap().as_slice());
        assert_eq!(peer.pending(), 0);
    }

    #[test]
    fn test_follow_ups_come_after_response() {
        let mut peer = SimulatedPeer::charging_station();
        peer.open().unwrap();

        let request = encode_frame(0x28, 0x44, 3, &[]).unwrap();
        let mut size = [0xAA, 0xAA, 0, request.len() as u8];
        peer.transfer(&mut size).unwrap();
        let mut data = vec![0x55, 0x55, 0, 0];
        data.extend_from_slice(&request);
        peer.transfer(&mut data).unwrap();

        assert_eq!(peer.count(0x28, 0x44), 1);
        assert_eq!(peer.pending(), 2);

        let state = peer.state.lock();
        let response = decode_inbound(&state.outbound[0], ChecksumPolicy::Strict).unwrap();
        assert_eq!((response.sub_id, response.request_id), (0x44, 3));
        let matched = decode_inbound(&state.outbound[1], ChecksumPolicy::Strict).unwrap();
        assert_eq!(matched.sub_id, slac::MATCHED);
    }

    #[test]
    fn test_payload_builders_parse_back() {
        let limits = payloads::default_dc_limits();
        assert_eq!(
            Notification::parse(0xC1, &payloads::dc_evse_parameters(&limits)).unwrap(),
            Notification::DcChargeParametersChanged(limits)
        );

        let profile = ChargingProfile {
            tuple_count: 1,
            tuple_id: 1,
            entries: vec![
                ProfileEntry { start: 0, interval: 10, power: 10000.0 },
                ProfileEntry { start: 10, interval: 0, power: 5000.0 },
            ],
        };
        assert_eq!(
            ChargingProfile::parse(&payloads::schedule(&profile)).unwrap(),
            profile
        );
    }
}
