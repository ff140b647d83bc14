//! Typed decoders for V2G notification payloads

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::codec::{decode_exponential, decode_int_be, CodecError};
use crate::types::NotificationId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("read of {needed} bytes at offset {offset} overruns a {available} byte payload")]
    OutOfBounds {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("unknown notification 0x{0:02X}")]
    UnknownNotification(u8),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Advance-only cursor over a notification payload
#[derive(Debug)]
pub struct PayloadReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        if n > self.remaining() {
            return Err(ParseError::OutOfBounds {
                offset: self.offset,
                needed: n,
                available: self.data.len(),
            });
        }
        let bytes = &self.data[self.offset..self.offset + n];
        self.offset += n;
        Ok(bytes)
    }

    pub fn read_u8(&mut self) -> Result<u8, ParseError> {
        Ok(self.read_bytes(1)?[0])
    }

    /// Big-endian unsigned integer of `n` bytes (1..=4)
    pub fn read_int(&mut self, n: usize) -> Result<u32, ParseError> {
        if !(1..=4).contains(&n) {
            return Err(CodecError::InvalidWidth(n).into());
        }
        Ok(decode_int_be(self.read_bytes(n)?)?)
    }

    pub fn read_u16(&mut self) -> Result<u16, ParseError> {
        Ok(self.read_int(2)? as u16)
    }

    pub fn read_exponential(&mut self) -> Result<f64, ParseError> {
        let bytes = self.read_bytes(3)?;
        Ok(decode_exponential([bytes[0], bytes[1], bytes[2]]))
    }

    pub fn read_flag(&mut self) -> Result<bool, ParseError> {
        Ok(self.read_u8()? != 0)
    }

    /// A field preceded by a presence flag; only read when the flag is set
    pub fn read_optional<T>(
        &mut self,
        read: impl FnOnce(&mut Self) -> Result<T, ParseError>,
    ) -> Result<Option<T>, ParseError> {
        if self.read_flag()? {
            read(self).map(Some)
        } else {
            Ok(None)
        }
    }

    /// End of a parse; trailing bytes are tolerated
    pub fn finish(self, what: &str) {
        if self.remaining() > 0 {
            warn!("{}: ignoring {} trailing bytes", what, self.remaining());
        }
    }
}

/// Payload of SessionStarted (0xC0)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub protocol: u8,
    pub session_id: [u8; 8],
    pub evse_id: Vec<u8>,
    pub payment_method: u8,
    pub energy_transfer_mode: u8,
}

impl SessionInfo {
    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        let mut reader = PayloadReader::new(payload);
        let protocol = reader.read_u8()?;
        let mut session_id = [0u8; 8];
        session_id.copy_from_slice(reader.read_bytes(8)?);
        let evse_id_len = reader.read_u8()? as usize;
        let evse_id = reader.read_bytes(evse_id_len)?.to_vec();
        let info = Self {
            protocol,
            session_id,
            evse_id,
            payment_method: reader.read_u8()?,
            energy_transfer_mode: reader.read_u8()?,
        };
        reader.finish("SessionStarted");
        Ok(info)
    }

    /// EVSE id rendered as text when it is printable
    pub fn evse_id_text(&self) -> String {
        String::from_utf8_lossy(&self.evse_id).into_owned()
    }
}

/// EVSE DC limits and present values, from DCChargeParametersChanged (0xC1)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DcEvseParameters {
    pub min_voltage: f64,
    pub min_current: f64,
    pub min_power: f64,
    pub max_voltage: f64,
    pub max_current: f64,
    pub max_power: f64,
    pub present_voltage: f64,
    pub present_current: f64,
    pub status: u8,
    pub isolation_status: Option<u8>,
    pub current_regulation_tolerance: Option<f64>,
    pub energy_to_be_delivered: Option<f64>,
}

impl DcEvseParameters {
    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        let mut r = PayloadReader::new(payload);
        let params = Self {
            min_voltage: r.read_exponential()?,
            min_current: r.read_exponential()?,
            min_power: r.read_exponential()?,
            max_voltage: r.read_exponential()?,
            max_current: r.read_exponential()?,
            max_power: r.read_exponential()?,
            present_voltage: r.read_exponential()?,
            present_current: r.read_exponential()?,
            status: r.read_u8()?,
            isolation_status: r.read_optional(|r| r.read_u8())?,
            current_regulation_tolerance: r.read_optional(|r| r.read_exponential())?,
            energy_to_be_delivered: r.read_optional(|r| r.read_exponential())?,
        };
        r.finish("DCChargeParametersChanged");
        Ok(params)
    }
}

/// From ACChargeParametersChanged (0xC2)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcEvseParameters {
    pub nominal_voltage: f64,
    pub max_current: f64,
    /// Residual current device present
    pub rcd: bool,
}

impl AcEvseParameters {
    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        let mut r = PayloadReader::new(payload);
        let params = Self {
            nominal_voltage: r.read_exponential()?,
            max_current: r.read_exponential()?,
            rcd: r.read_flag()?,
        };
        r.finish("ACChargeParametersChanged");
        Ok(params)
    }
}

/// One step of a charging schedule
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileEntry {
    /// Seconds from the start of the schedule
    pub start: u32,
    /// Seconds; 0 means "until the next entry"
    pub interval: u32,
    /// Watts
    pub power: f64,
}

/// Time-ordered power envelope from ScheduleReceived (0xC3)
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ChargingProfile {
    pub tuple_count: u8,
    pub tuple_id: u16,
    pub entries: Vec<ProfileEntry>,
}

impl ChargingProfile {
    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        let mut r = PayloadReader::new(payload);
        let tuple_count = r.read_u8()?;
        let tuple_id = r.read_u16()?;
        let count = r.read_u16()? as usize;

        // cap the allocation by what the payload can actually hold
        let mut entries = Vec::with_capacity(count.min(r.remaining() / 11));
        for _ in 0..count {
            entries.push(ProfileEntry {
                start: r.read_int(4)?,
                interval: r.read_int(4)?,
                power: r.read_exponential()?,
            });
        }
        r.finish("ScheduleReceived");
        Ok(Self {
            tuple_count,
            tuple_id,
            entries,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry in force `elapsed_secs` after the schedule started
    pub fn entry_at(&self, elapsed_secs: u64) -> Option<&ProfileEntry> {
        let entry = self
            .entries
            .iter()
            .take_while(|e| e.start as u64 <= elapsed_secs)
            .last()?;
        if entry.interval > 0 && elapsed_secs >= entry.start as u64 + entry.interval as u64 {
            return None;
        }
        Some(entry)
    }
}

/// EVSE notification type carried by NotificationReceived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NotificationKind {
    None,
    StopCharging,
    ReNegotiation,
    Other(u8),
}

impl From<u8> for NotificationKind {
    fn from(code: u8) -> Self {
        match code {
            0 => NotificationKind::None,
            1 => NotificationKind::StopCharging,
            2 => NotificationKind::ReNegotiation,
            other => NotificationKind::Other(other),
        }
    }
}

/// From NotificationReceived (0xCC)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EvseNotification {
    pub kind: NotificationKind,
    /// Seconds the EVSE allows before acting on the notification
    pub max_delay: u16,
}

impl EvseNotification {
    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        let mut r = PayloadReader::new(payload);
        let notification = Self {
            kind: NotificationKind::from(r.read_u8()?),
            max_delay: r.read_u16()?,
        };
        r.finish("NotificationReceived");
        Ok(notification)
    }
}

/// A decoded V2G notification
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum Notification {
    SessionStarted(SessionInfo),
    DcChargeParametersChanged(DcEvseParameters),
    AcChargeParametersChanged(AcEvseParameters),
    ScheduleReceived(ChargingProfile),
    CableCheckReady,
    CableCheckFinished,
    PreChargingReady,
    ChargingReady,
    ChargingStarted,
    ChargingStopped,
    PostChargingReady,
    SessionStopped,
    NotificationReceived(EvseNotification),
    SessionError { code: u8 },
}

impl Notification {
    /// Decode the payload of V2G notification `sub_id`
    pub fn parse(sub_id: u8, payload: &[u8]) -> Result<Self, ParseError> {
        let id = NotificationId::from_sub_id(sub_id).ok_or(ParseError::UnknownNotification(sub_id))?;
        let notification = match id {
            NotificationId::SessionStarted => Notification::SessionStarted(SessionInfo::parse(payload)?),
            NotificationId::DcChargeParametersChanged => {
                Notification::DcChargeParametersChanged(DcEvseParameters::parse(payload)?)
            }
            NotificationId::AcChargeParametersChanged => {
                Notification::AcChargeParametersChanged(AcEvseParameters::parse(payload)?)
            }
            NotificationId::ScheduleReceived => Notification::ScheduleReceived(ChargingProfile::parse(payload)?),
            NotificationId::CableCheckReady => Notification::CableCheckReady,
            NotificationId::CableCheckFinished => Notification::CableCheckFinished,
            NotificationId::PreChargingReady => Notification::PreChargingReady,
            NotificationId::ChargingReady => Notification::ChargingReady,
            NotificationId::ChargingStarted => Notification::ChargingStarted,
            NotificationId::ChargingStopped => Notification::ChargingStopped,
            NotificationId::PostChargingReady => Notification::PostChargingReady,
            NotificationId::SessionStopped => Notification::SessionStopped,
            NotificationId::NotificationReceived => {
                Notification::NotificationReceived(EvseNotification::parse(payload)?)
            }
            NotificationId::SessionError => {
                let mut r = PayloadReader::new(payload);
                let code = r.read_u8()?;
                r.finish("SessionError");
                Notification::SessionError { code }
            }
        };
        Ok(notification)
    }

    pub fn id(&self) -> NotificationId {
        match self {
            Notification::SessionStarted(_) => NotificationId::SessionStarted,
            Notification::DcChargeParametersChanged(_) => NotificationId::DcChargeParametersChanged,
            Notification::AcChargeParametersChanged(_) => NotificationId::AcChargeParametersChanged,
            Notification::ScheduleReceived(_) => NotificationId::ScheduleReceived,
            Notification::CableCheckReady => NotificationId::CableCheckReady,
            Notification::CableCheckFinished => NotificationId::CableCheckFinished,
            Notification::PreChargingReady => NotificationId::PreChargingReady,
            Notification::ChargingReady => NotificationId::ChargingReady,
            Notification::ChargingStarted => NotificationId::ChargingStarted,
            Notification::ChargingStopped => NotificationId::ChargingStopped,
            Notification::PostChargingReady => NotificationId::PostChargingReady,
            Notification::SessionStopped => NotificationId::SessionStopped,
            Notification::NotificationReceived(_) => NotificationId::NotificationReceived,
            Notification::SessionError { .. } => NotificationId::SessionError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_exponential;

    fn exp(value: i64) -> Vec<u8> {
        encode_exponential(value).unwrap().to_vec()
    }

    fn dc_base() -> Vec<u8> {
        let mut p = Vec::new();
        for v in [150, 0, 0, 500, 200, 50000, 370, 0] {
            p.extend(exp(v));
        }
        p.push(1); // status
        p
    }

    #[test]
    fn test_session_started() {
        let mut p = vec![0x02];
        p.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        p.push(4);
        p.extend_from_slice(b"EVSE");
        p.extend_from_slice(&[0, 3]);

        let info = SessionInfo::parse(&p).unwrap();
        assert_eq!(info.protocol, 2);
        assert_eq!(info.session_id, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(info.evse_id_text(), "EVSE");
        assert_eq!(info.payment_method, 0);
        assert_eq!(info.energy_transfer_mode, 3);
    }

    #[test]
    fn test_dc_parameters_without_optional_fields() {
        let mut p = dc_base();
        p.extend_from_slice(&[0, 0, 0]);

        let params = DcEvseParameters::parse(&p).unwrap();
        assert_eq!(params.max_voltage, 500.0);
        assert_eq!(params.max_power, 50000.0);
        assert_eq!(params.present_voltage, 370.0);
        assert_eq!(params.status, 1);
        assert_eq!(params.isolation_status, None);
        assert_eq!(params.current_regulation_tolerance, None);
        assert_eq!(params.energy_to_be_delivered, None);
    }

    #[test]
    fn test_dc_parameters_with_some_optional_fields() {
        let mut p = dc_base();
        p.extend_from_slice(&[1, 0x02]); // isolation valid
        p.push(0); // no tolerance
        p.push(1);
        p.extend(exp(20000));

        let params = DcEvseParameters::parse(&p).unwrap();
        assert_eq!(params.isolation_status, Some(2));
        assert_eq!(params.current_regulation_tolerance, None);
        assert_eq!(params.energy_to_be_delivered, Some(20000.0));
    }

    #[test]
    fn test_dc_parameters_flag_without_value_is_out_of_bounds() {
        let mut p = dc_base();
        p.extend_from_slice(&[0, 1]);

        assert!(matches!(
            DcEvseParameters::parse(&p),
            Err(ParseError::OutOfBounds { needed: 3, .. })
        ));
    }

    #[test]
    fn test_ac_parameters() {
        let mut p = exp(230);
        p.extend(exp(32));
        p.push(1);

        let params = AcEvseParameters::parse(&p).unwrap();
        assert_eq!(params.nominal_voltage, 230.0);
        assert_eq!(params.max_current, 32.0);
        assert!(params.rcd);
    }

    #[test]
    fn test_empty_schedule() {
        let profile = ChargingProfile::parse(&[1, 0x00, 0x07, 0x00, 0x00]).unwrap();
        assert_eq!(profile.tuple_count, 1);
        assert_eq!(profile.tuple_id, 7);
        assert!(profile.is_empty());
        assert_eq!(profile.entry_at(0), None);
    }

    #[test]
    fn test_schedule_keeps_entry_order() {
        let mut p = vec![1, 0, 1, 0, 3];
        for (start, interval, power) in [(0u32, 10u32, 10000i64), (10, 10, 5000), (20, 0, 8000)] {
            p.extend_from_slice(&start.to_be_bytes());
            p.extend_from_slice(&interval.to_be_bytes());
            p.extend(exp(power));
        }

        let profile = ChargingProfile::parse(&p).unwrap();
        let powers: Vec<f64> = profile.entries.iter().map(|e| e.power).collect();
        assert_eq!(powers, vec![10000.0, 5000.0, 8000.0]);

        assert_eq!(profile.entry_at(0).unwrap().power, 10000.0);
        assert_eq!(profile.entry_at(15).unwrap().power, 5000.0);
        // last entry is open ended
        assert_eq!(profile.entry_at(3600).unwrap().power, 8000.0);
    }

    #[test]
    fn test_schedule_gap_has_no_entry() {
        let mut p = vec![1, 0, 1, 0, 2];
        for (start, interval) in [(0u32, 5u32), (10, 5)] {
            p.extend_from_slice(&start.to_be_bytes());
            p.extend_from_slice(&interval.to_be_bytes());
            p.extend(exp(1000));
        }
        let profile = ChargingProfile::parse(&p).unwrap();

        assert!(profile.entry_at(4).is_some());
        assert!(profile.entry_at(7).is_none());
        assert!(profile.entry_at(12).is_some());
        assert!(profile.entry_at(15).is_none());
    }

    #[test]
    fn test_truncated_schedule_is_error() {
        // announces two entries, carries one
        let mut p = vec![1, 0, 1, 0, 2];
        p.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0]);
        p.extend(exp(1000));

        assert!(matches!(
            ChargingProfile::parse(&p),
            Err(ParseError::OutOfBounds { offset: 16, .. })
        ));
    }

    #[test]
    fn test_trailing_bytes_are_tolerated() {
        let n = EvseNotification::parse(&[2, 0x00, 0x3C, 0xEE, 0xEE]).unwrap();
        assert_eq!(n.kind, NotificationKind::ReNegotiation);
        assert_eq!(n.max_delay, 60);
    }

    #[test]
    fn test_notification_dispatch() {
        assert_eq!(Notification::parse(0xC4, &[]).unwrap(), Notification::CableCheckReady);
        assert_eq!(
            Notification::parse(0xCD, &[0x07]).unwrap(),
            Notification::SessionError { code: 7 }
        );
        assert_eq!(
            Notification::parse(0xCC, &[1, 0, 0]).unwrap().id(),
            NotificationId::NotificationReceived
        );
        assert_eq!(
            Notification::parse(0x99, &[]),
            Err(ParseError::UnknownNotification(0x99))
        );
        assert!(matches!(
            Notification::parse(0xCD, &[]),
            Err(ParseError::OutOfBounds { offset: 0, needed: 1, available: 0 })
        ));
    }

    #[test]
    fn test_read_int_width() {
        let mut r = PayloadReader::new(&[0x01, 0x02, 0x03, 0x04, 0x05]);
        assert!(matches!(r.read_int(5), Err(ParseError::Codec(CodecError::InvalidWidth(5)))));
        assert_eq!(r.read_int(3).unwrap(), 0x010203);
        assert_eq!(r.remaining(), 2);
    }
}
