//! V2G session state machine
//!
//! Consumes decoded notifications, answers them through the command API and
//! runs the charging tick while energy transfer is active.
//!
//! ```text
//! Init → SessionStarting → SessionStarted → CableCheckReady → CableCheckStarted
//!      → CableCheckFinished → PreChargingReady → PreChargingStarted
//!      → ChargingReady → ChargingStarted → ChargingStopped → SessionStopped → End
//! ```
//!
//! Any error raised while handling a notification or a tick moves the
//! session straight to `End`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use whitebeet_core::codec::nearest_representable;
use whitebeet_core::{
    AcEvseParameters, ChargingProfile, DcChargingParameters, DcEvseParameters, EvseNotification,
    ExchangeError, InboundFrame, ModuleId, Notification, NotificationKind, ParseError,
    SessionInfo, Whitebeet,
};

use crate::battery::Battery;
use crate::charging::ChargingPolicy;
use crate::config::{ConfigError, EvConfig};

/// Lifecycle of one charging session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Init,
    SessionStarting,
    SessionStarted,
    CableCheckReady,
    CableCheckStarted,
    CableCheckFinished,
    PreChargingReady,
    PreChargingStarted,
    ChargingReady,
    ChargingStarted,
    ChargingStopped,
    SessionStopped,
    End,
}

impl SessionState {
    /// States in which the EVSE holds an open V2G session
    pub fn in_session(self) -> bool {
        !matches!(self, SessionState::Init | SessionState::SessionStopped | SessionState::End)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Init => "init",
            SessionState::SessionStarting => "sessionStarting",
            SessionState::SessionStarted => "sessionStarted",
            SessionState::CableCheckReady => "cableCheckReady",
            SessionState::CableCheckStarted => "cableCheckStarted",
            SessionState::CableCheckFinished => "cableCheckFinished",
            SessionState::PreChargingReady => "preChargingReady",
            SessionState::PreChargingStarted => "preChargingStarted",
            SessionState::ChargingReady => "chargingReady",
            SessionState::ChargingStarted => "chargingStarted",
            SessionState::ChargingStopped => "chargingStopped",
            SessionState::SessionStopped => "sessionStopped",
            SessionState::End => "end",
        };
        f.write_str(name)
    }
}

/// Why a session ended early
#[derive(Debug, Error)]
pub enum SessionFailure {
    #[error("exchange failed: {0}")]
    Exchange(ExchangeError),

    #[error("malformed notification: {0}")]
    Parse(#[from] ParseError),

    #[error("EVSE reported session error 0x{0:02X}")]
    PeerError(u8),

    #[error("EVSE not connected within {0:?}")]
    EvseNotConnected(Duration),

    #[error("SLAC matching failed")]
    SlacFailed,

    #[error("SLAC matching timed out after {0:?}")]
    SlacTimeout(Duration),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("cannot start poller: {0}")]
    Poller(#[from] std::io::Error),

    #[error("session cancelled")]
    Cancelled,
}

impl From<ExchangeError> for SessionFailure {
    fn from(e: ExchangeError) -> Self {
        match e {
            ExchangeError::Cancelled => SessionFailure::Cancelled,
            other => SessionFailure::Exchange(other),
        }
    }
}

/// Observable session events
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EvEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
        at: DateTime<Utc>,
    },
    SessionStarted {
        evse_id: String,
        protocol: u8,
    },
    EvseLimits {
        max_voltage: f64,
        max_current: f64,
        max_power: f64,
    },
    ScheduleUpdated {
        tuple_id: u16,
        entries: usize,
    },
    EvseNotice {
        kind: NotificationKind,
        max_delay: u16,
    },
    BatteryUpdate {
        soc: u8,
        level_wh: f64,
        target_current: f64,
    },
    Failed {
        reason: String,
    },
    Finished {
        soc: u8,
    },
}

/// Session state machine over a command API and a battery
pub struct Session<B: Battery> {
    whitebeet: Whitebeet,
    config: EvConfig,
    policy: ChargingPolicy,
    battery: B,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    events: Option<mpsc::UnboundedSender<EvEvent>>,

    info: Option<SessionInfo>,
    evse_dc: Option<DcEvseParameters>,
    evse_ac: Option<AcEvseParameters>,
    schedule: Option<ChargingProfile>,

    /// Simulated time since energy transfer began
    charging_elapsed: Duration,
    last_reported_soc: Option<u8>,
    target_current: f64,
}

impl<B: Battery> std::fmt::Debug for Session<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("soc", &self.battery.state_of_charge())
            .field("schedule", &self.schedule.as_ref().map(|s| s.entries.len()))
            .finish_non_exhaustive()
    }
}

impl<B: Battery> Session<B> {
    pub fn new(whitebeet: Whitebeet, config: EvConfig, battery: B) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Init);
        Self {
            whitebeet,
            policy: ChargingPolicy::from_config(&config),
            config,
            battery,
            state: SessionState::Init,
            state_tx,
            events: None,
            info: None,
            evse_dc: None,
            evse_ac: None,
            schedule: None,
            charging_elapsed: Duration::ZERO,
            last_reported_soc: None,
            target_current: 0.0,
        }
    }

    /// Publish events on `sink`
    pub fn with_events(mut self, sink: mpsc::UnboundedSender<EvEvent>) -> Self {
        self.events = Some(sink);
        self
    }

    /// Snapshot channel of the current state
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state == SessionState::End
    }

    pub fn battery(&self) -> &B {
        &self.battery
    }

    pub fn session_info(&self) -> Option<&SessionInfo> {
        self.info.as_ref()
    }

    pub fn evse_dc_limits(&self) -> Option<&DcEvseParameters> {
        self.evse_dc.as_ref()
    }

    pub fn evse_ac_limits(&self) -> Option<&AcEvseParameters> {
        self.evse_ac.as_ref()
    }

    pub fn schedule(&self) -> Option<&ChargingProfile> {
        self.schedule.as_ref()
    }

    pub fn target_current(&self) -> f64 {
        self.target_current
    }

    /// DC parameter record for the current battery state
    pub fn dc_parameters(&self, target_current: f64) -> DcChargingParameters {
        let limits = &self.config.dc_limits;
        let soc = self.battery.soc_percent();
        let missing = (self.config.full_soc as f64 - self.battery.state_of_charge()).max(0.0);
        let energy_request = missing / 100.0 * self.battery.capacity();

        DcChargingParameters {
            min_voltage: limits.min_voltage,
            min_current: limits.min_current,
            min_power: limits.min_power,
            max_voltage: limits.max_voltage,
            max_current: limits.max_current,
            max_power: limits.max_power,
            soc,
            status: 0,
            target_voltage: self.config.charging_voltage.round() as i64,
            target_current: target_current.round() as i64,
            full_soc: self.config.full_soc,
            bulk_soc: self.config.bulk_soc,
            energy_request: nearest_representable(energy_request.round() as i64),
            departure_time: self.config.departure_time,
        }
    }

    /// Enter `SessionStarting` once the start-session command went out
    pub fn begin(&mut self) {
        self.transition(SessionState::SessionStarting);
    }

    /// Route an inbound frame; non-V2G frames are ignored
    pub fn handle_frame(&mut self, frame: &InboundFrame) -> Result<(), SessionFailure> {
        if frame.module_id != ModuleId::V2g.id() {
            debug!(
                "Ignoring frame 0x{:02X}/0x{:02X} outside V2G",
                frame.module_id, frame.sub_id
            );
            return Ok(());
        }
        match Notification::parse(frame.sub_id, &frame.payload) {
            Ok(notification) => self.handle_notification(notification),
            Err(ParseError::UnknownNotification(id)) => {
                warn!("Unknown V2G message 0x{:02X}, ignoring", id);
                Ok(())
            }
            Err(e) => self.guard(Err(e.into())),
        }
    }

    /// Apply one notification; an error leaves the session in `End`
    pub fn handle_notification(&mut self, notification: Notification) -> Result<(), SessionFailure> {
        if self.is_finished() {
            debug!("Session over, dropping {}", notification.id());
            return Ok(());
        }
        debug!("Handling {} in {}", notification.id(), self.state);
        let result = self.apply(notification);
        self.guard(result)
    }

    /// One loop period; charges while energy transfer is active
    pub fn tick(&mut self) -> Result<(), SessionFailure> {
        let result = match self.state {
            SessionState::ChargingStarted => self.charge_step(),
            SessionState::ChargingStopped => self.stop_session(),
            SessionState::SessionStopped => {
                self.finish();
                Ok(())
            }
            _ => Ok(()),
        };
        self.guard(result)
    }

    /// Leave for `End` after a failure; a no-op once finished
    pub fn fail(&mut self, failure: &SessionFailure) {
        if self.is_finished() {
            return;
        }
        error!("Session failed in {}: {}", self.state, failure);
        self.battery.set_charging(false);
        self.emit(EvEvent::Failed {
            reason: failure.to_string(),
        });
        self.transition(SessionState::End);
    }

    /// External stop: best-effort stop-session, then `End`
    pub fn cancel(&mut self) {
        if self.is_finished() {
            return;
        }
        info!("Session cancelled in {}", self.state);
        self.battery.set_charging(false);
        if self.state.in_session() {
            // the stop token is already set, so this request must not observe it
            if let Err(e) = self.whitebeet.without_stop().v2g_stop_session() {
                warn!("Stop-session on cancel failed: {}", e);
            }
        }
        self.finish();
    }

    /// Failures end the session here; a cancellation is left to `cancel`
    fn guard(&mut self, result: Result<(), SessionFailure>) -> Result<(), SessionFailure> {
        match &result {
            Err(SessionFailure::Cancelled) => debug!("Interrupted in {}", self.state),
            Err(e) => self.fail(e),
            Ok(()) => {}
        }
        result
    }

    fn apply(&mut self, notification: Notification) -> Result<(), SessionFailure> {
        match notification {
            Notification::SessionStarted(info) => {
                info!(
                    "Session started with EVSE {} (protocol {})",
                    info.evse_id_text(),
                    info.protocol
                );
                self.emit(EvEvent::SessionStarted {
                    evse_id: info.evse_id_text(),
                    protocol: info.protocol,
                });
                self.info = Some(info);
                self.whitebeet
                    .v2g_ev_set_configuration(&self.config.ev_configuration())?;
                self.transition(SessionState::SessionStarted);
            }
            Notification::DcChargeParametersChanged(params) => {
                debug!(
                    "EVSE DC limits: {} V / {} A / {} W",
                    params.max_voltage, params.max_current, params.max_power
                );
                self.emit(EvEvent::EvseLimits {
                    max_voltage: params.max_voltage,
                    max_current: params.max_current,
                    max_power: params.max_power,
                });
                self.evse_dc = Some(params);
            }
            Notification::AcChargeParametersChanged(params) => {
                debug!("EVSE AC limits: {} V / {} A", params.nominal_voltage, params.max_current);
                self.evse_ac = Some(params);
            }
            Notification::ScheduleReceived(profile) => {
                info!(
                    "Schedule {} received with {} entries",
                    profile.tuple_id,
                    profile.entries.len()
                );
                self.emit(EvEvent::ScheduleUpdated {
                    tuple_id: profile.tuple_id,
                    entries: profile.entries.len(),
                });
                self.schedule = Some(profile);
            }
            Notification::CableCheckReady => {
                self.transition(SessionState::CableCheckReady);
                self.whitebeet.v2g_start_cable_check()?;
                self.transition(SessionState::CableCheckStarted);
            }
            Notification::CableCheckFinished => {
                self.transition(SessionState::CableCheckFinished);
            }
            Notification::PreChargingReady => {
                self.transition(SessionState::PreChargingReady);
                self.whitebeet.v2g_start_pre_charging()?;
                self.transition(SessionState::PreChargingStarted);
            }
            Notification::ChargingReady => {
                self.whitebeet.v2g_start_charging()?;
                self.transition(SessionState::ChargingReady);
            }
            Notification::ChargingStarted => {
                self.battery.set_charging(true);
                self.charging_elapsed = Duration::ZERO;
                self.last_reported_soc = Some(self.battery.soc_percent());
                self.transition(SessionState::ChargingStarted);
            }
            Notification::NotificationReceived(notice) => self.on_evse_notice(notice)?,
            Notification::ChargingStopped => {
                if self.state == SessionState::ChargingStarted {
                    self.battery.set_charging(false);
                    self.transition(SessionState::ChargingStopped);
                }
            }
            Notification::PostChargingReady => {
                debug!("EVSE ready for post-charging");
            }
            Notification::SessionStopped => {
                if self.state != SessionState::SessionStopped {
                    self.battery.set_charging(false);
                    self.transition(SessionState::SessionStopped);
                }
            }
            Notification::SessionError { code } => {
                return Err(SessionFailure::PeerError(code));
            }
        }
        Ok(())
    }

    fn on_evse_notice(&mut self, notice: EvseNotification) -> Result<(), SessionFailure> {
        self.emit(EvEvent::EvseNotice {
            kind: notice.kind,
            max_delay: notice.max_delay,
        });
        match notice.kind {
            NotificationKind::ReNegotiation => {
                info!("EVSE requested renegotiation, reporting parameters");
                let params = self.dc_parameters(self.target_current);
                self.whitebeet.v2g_update_dc_charging_parameters(&params)?;
            }
            NotificationKind::StopCharging => {
                info!("EVSE requested stop within {} s", notice.max_delay);
                if self.state == SessionState::ChargingStarted {
                    self.battery.set_charging(false);
                    self.transition(SessionState::ChargingStopped);
                }
            }
            NotificationKind::None => {}
            NotificationKind::Other(code) => {
                warn!("Unhandled EVSE notification type {}", code);
            }
        }
        Ok(())
    }

    fn charge_step(&mut self) -> Result<(), SessionFailure> {
        if self.battery.is_full() {
            info!("Battery full, stopping");
            self.battery.set_charging(false);
            self.transition(SessionState::ChargingStopped);
            return Ok(());
        }

        let elapsed = self.charging_elapsed.as_secs();
        let schedule = self.schedule.as_ref().map(|p| (p, elapsed));
        let evse_max = self.evse_dc.as_ref().map(|p| p.max_current);
        let current = self
            .policy
            .target_current(self.battery.state_of_charge(), schedule, evse_max);
        self.target_current = current;

        self.battery
            .advance(self.config.tick, current, self.config.charging_voltage);
        self.charging_elapsed += self.config.tick.mul_f64(self.config.time_multiplier);

        let soc = self.battery.soc_percent();
        if self.last_reported_soc != Some(soc) {
            match self
                .whitebeet
                .v2g_update_dc_charging_parameters(&self.dc_parameters(current))
            {
                Ok(()) => {
                    self.last_reported_soc = Some(soc);
                    debug!("SOC {} %, {:.1} A", soc, current);
                    self.emit(EvEvent::BatteryUpdate {
                        soc,
                        level_wh: self.battery.level(),
                        target_current: current,
                    });
                }
                // retried on the next tick
                Err(e) if e.is_timeout() => warn!("DC update not delivered: {}", e),
                Err(e) => return Err(e.into()),
            }
        }

        if self.battery.is_full() {
            info!("Battery full at {:.1} %", self.battery.state_of_charge());
            self.transition(SessionState::ChargingStopped);
        }
        Ok(())
    }

    fn stop_session(&mut self) -> Result<(), SessionFailure> {
        self.battery.set_charging(false);
        self.whitebeet.v2g_stop_charging(false)?;
        self.whitebeet.v2g_stop_session()?;
        self.transition(SessionState::SessionStopped);
        Ok(())
    }

    fn finish(&mut self) {
        self.emit(EvEvent::Finished {
            soc: self.battery.soc_percent(),
        });
        self.transition(SessionState::End);
    }

    fn transition(&mut self, to: SessionState) {
        let from = self.state;
        if from == to {
            return;
        }
        info!("State: {} -> {}", from, to);
        self.state = to;
        self.state_tx.send_replace(to);
        self.emit(EvEvent::StateChanged {
            from,
            to,
            at: Utc::now(),
        });
    }

    fn emit(&self, event: EvEvent) {
        if let Some(sink) = &self.events {
            let _ = sink.send(event);
        }
    }
}
