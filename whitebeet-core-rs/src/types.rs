//! Wire constants for the Whitebeet host protocol

use serde::Serialize;

/// Hard cap on a frame payload
pub const MAX_PAYLOAD_LEN: usize = 4096;

/// Subsystem selector carried in every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum ModuleId {
    Diagnostic = 0x10,
    V2g = 0x27,
    Slac = 0x28,
    ControlPilot = 0x29,
}

impl ModuleId {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x10 => Some(ModuleId::Diagnostic),
            0x27 => Some(ModuleId::V2g),
            0x28 => Some(ModuleId::Slac),
            0x29 => Some(ModuleId::ControlPilot),
            _ => None,
        }
    }

    pub fn id(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for ModuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModuleId::Diagnostic => write!(f, "diagnostic"),
            ModuleId::V2g => write!(f, "v2g"),
            ModuleId::Slac => write!(f, "slac"),
            ModuleId::ControlPilot => write!(f, "control-pilot"),
        }
    }
}

/// Which side of the charging link the module plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum Role {
    Ev = 0,
    Evse = 1,
}

/// Control pilot resistor emulated by the EV
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum ResistorState {
    /// Vehicle connected, not ready
    B = 0,
    /// Vehicle ready to charge
    C = 1,
}

/// Diagnostic / system sub-ids
pub mod system {
    pub const GET_VERSION: u8 = 0x41;
}

/// Control pilot sub-ids
pub mod control_pilot {
    pub const SET_MODE: u8 = 0x40;
    pub const START: u8 = 0x42;
    pub const STOP: u8 = 0x43;
    pub const GET_DUTY_CYCLE: u8 = 0x45;
    pub const SET_RESISTOR: u8 = 0x46;
}

/// SLAC sub-ids, including the two matching outcome notifications
pub mod slac {
    pub const START: u8 = 0x42;
    pub const STOP: u8 = 0x43;
    pub const START_MATCHING: u8 = 0x44;
    pub const SET_ATTN_TX_REF: u8 = 0x48;
    pub const SET_VALIDATION_CONFIG: u8 = 0x4B;

    pub const MATCHED: u8 = 0x80;
    pub const MATCHING_FAILED: u8 = 0x81;
}

/// V2G sub-ids (EV role)
pub mod v2g {
    pub const SET_MODE: u8 = 0x40;
    pub const START: u8 = 0x42;
    pub const STOP: u8 = 0x43;
    pub const SET_CONFIGURATION: u8 = 0xA0;
    pub const SET_DC_PARAMETERS: u8 = 0xA2;
    pub const UPDATE_DC_PARAMETERS: u8 = 0xA3;
    pub const SET_AC_PARAMETERS: u8 = 0xA4;
    pub const UPDATE_AC_PARAMETERS: u8 = 0xA5;
    pub const START_SESSION: u8 = 0xA9;
    pub const START_CABLE_CHECK: u8 = 0xAA;
    pub const START_PRE_CHARGING: u8 = 0xAB;
    pub const START_CHARGING: u8 = 0xAC;
    pub const STOP_CHARGING: u8 = 0xAD;
    pub const STOP_SESSION: u8 = 0xAE;
}

/// Unsolicited V2G notifications pushed by the module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum NotificationId {
    SessionStarted = 0xC0,
    DcChargeParametersChanged = 0xC1,
    AcChargeParametersChanged = 0xC2,
    ScheduleReceived = 0xC3,
    CableCheckReady = 0xC4,
    CableCheckFinished = 0xC5,
    PreChargingReady = 0xC6,
    ChargingReady = 0xC7,
    ChargingStarted = 0xC8,
    ChargingStopped = 0xC9,
    PostChargingReady = 0xCA,
    SessionStopped = 0xCB,
    NotificationReceived = 0xCC,
    SessionError = 0xCD,
}

impl NotificationId {
    pub fn from_sub_id(sub_id: u8) -> Option<Self> {
        use NotificationId::*;
        let id = match sub_id {
            0xC0 => SessionStarted,
            0xC1 => DcChargeParametersChanged,
            0xC2 => AcChargeParametersChanged,
            0xC3 => ScheduleReceived,
            0xC4 => CableCheckReady,
            0xC5 => CableCheckFinished,
            0xC6 => PreChargingReady,
            0xC7 => ChargingReady,
            0xC8 => ChargingStarted,
            0xC9 => ChargingStopped,
            0xCA => PostChargingReady,
            0xCB => SessionStopped,
            0xCC => NotificationReceived,
            0xCD => SessionError,
            _ => return None,
        };
        Some(id)
    }

    pub fn sub_id(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for NotificationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}(0x{:02X})", self, self.sub_id())
    }
}
