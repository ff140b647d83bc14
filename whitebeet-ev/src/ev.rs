//! EV driver
//!
//! Owns the link to the module and runs one charging session end to end:
//!
//! 1. control pilot and SLAC bring-up
//! 2. wait for the EVSE PWM (duty cycle in (0, 10] %)
//! 3. SLAC matching
//! 4. V2G service start and session start
//! 5. the session loop: drain the inbox, tick, sleep
//!
//! The driver is blocking; async callers run it under `spawn_blocking` and
//! stop it through the [`StopHandle`]. The same token interrupts handshake
//! waits inside the exchange, so a stop lands within one GPIO poll.

use std::collections::VecDeque;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use whitebeet_core::{
    slac, stop_pair, Exchange, ExchangeError, Inbound, InboundFrame, LinkConfig, ModuleId, Poller,
    ResistorState, Role, StopHandle, StopToken, Transport, Whitebeet,
};

use crate::battery::{Battery, LinearBattery};
use crate::config::EvConfig;
use crate::session::{EvEvent, Session, SessionFailure, SessionState};

/// Outcome of a completed run
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub firmware_version: Option<String>,
    pub evse_id: Option<String>,
    pub initial_soc: f64,
    pub final_soc: f64,
    /// Wh delivered during the session
    pub energy_wh: f64,
    pub cancelled: bool,
    pub final_state: SessionState,
}

/// One EV on one Whitebeet link
pub struct Ev<B: Battery> {
    exchange: Exchange,
    inbox: UnboundedReceiver<Inbound>,
    whitebeet: Whitebeet,
    session: Session<B>,
    config: EvConfig,
    stop: StopHandle,
    token: StopToken,
    /// V2G frames that arrived before the session loop started
    deferred: VecDeque<InboundFrame>,
    firmware_version: Option<String>,
}

impl Ev<LinearBattery> {
    /// EV with a [`LinearBattery`] sized from `config`
    pub fn from_config(
        transport: Box<dyn Transport>,
        link: LinkConfig,
        config: EvConfig,
    ) -> Result<Self, SessionFailure> {
        let battery = LinearBattery::new(config.battery_capacity, config.initial_soc)
            .with_time_multiplier(config.time_multiplier);
        Self::new(transport, link, config, battery)
    }
}

impl<B: Battery> Ev<B> {
    pub fn new(
        transport: Box<dyn Transport>,
        link: LinkConfig,
        config: EvConfig,
        battery: B,
    ) -> Result<Self, SessionFailure> {
        config.validate()?;
        let (stop, token) = stop_pair();
        let (exchange, inbox) = Exchange::new(transport, link);
        let exchange = exchange.with_stop(token.clone());
        let whitebeet = Whitebeet::new(exchange.clone());
        let session = Session::new(whitebeet.clone(), config.clone(), battery);

        Ok(Self {
            exchange,
            inbox,
            whitebeet,
            session,
            config,
            stop,
            token,
            deferred: VecDeque::new(),
            firmware_version: None,
        })
    }

    pub fn with_events(mut self, sink: UnboundedSender<EvEvent>) -> Self {
        self.session = self.session.with_events(sink);
        self
    }

    /// Handle that cancels `run` from another thread or task
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.session.subscribe()
    }

    pub fn session(&self) -> &Session<B> {
        &self.session
    }

    /// Run one session to `End`.
    ///
    /// A stop request yields `Ok` with `cancelled` set; any other early exit
    /// is returned as the error that caused it.
    pub fn run(mut self) -> Result<SessionSummary, SessionFailure> {
        let started_at = Utc::now();
        let initial_soc = self.session.battery().state_of_charge();
        let initial_level = self.session.battery().level();
        info!(
            "Starting EV {} at {:.1} % SOC",
            self.config.mac_string(),
            initial_soc
        );

        if let Err(e) = self.exchange.open() {
            let failure = SessionFailure::from(ExchangeError::from(e));
            self.session.fail(&failure);
            return Err(failure);
        }

        let cancelled = match self.drive() {
            Ok(()) => false,
            Err(SessionFailure::Cancelled) => {
                self.session.cancel();
                true
            }
            Err(failure) => {
                self.session.fail(&failure);
                self.exchange.close();
                return Err(failure);
            }
        };
        self.exchange.close();

        let battery = self.session.battery();
        let summary = SessionSummary {
            started_at,
            finished_at: Utc::now(),
            firmware_version: self.firmware_version.take(),
            evse_id: self.session.session_info().map(|i| i.evse_id_text()),
            initial_soc,
            final_soc: battery.state_of_charge(),
            energy_wh: battery.level() - initial_level,
            cancelled,
            final_state: self.session.state(),
        };
        info!(
            "Session finished in {} at {:.1} % ({:.0} Wh)",
            summary.final_state, summary.final_soc, summary.energy_wh
        );
        Ok(summary)
    }

    /// Everything between open and close
    fn drive(&mut self) -> Result<(), SessionFailure> {
        let version = self.whitebeet.system_get_version()?;
        info!("Whitebeet firmware {}", version);
        self.firmware_version = Some(version);

        let mut poller = Poller::spawn(self.exchange.clone())?;
        let result = self.bring_up().and_then(|_| self.session_loop());
        if !poller.stop() {
            warn!("Poller still running after shutdown");
        }
        result
    }

    fn bring_up(&mut self) -> Result<(), SessionFailure> {
        info!("Control pilot and SLAC bring-up");
        self.whitebeet.control_pilot_set_mode(Role::Ev)?;
        self.whitebeet.control_pilot_start()?;
        self.whitebeet.control_pilot_set_resistor(ResistorState::B)?;
        self.whitebeet.slac_set_validation_configuration(0)?;
        self.whitebeet.slac_start(Role::Ev)?;

        self.wait_for_evse()?;
        self.match_slac()?;

        info!("Network established, starting V2G");
        self.whitebeet.v2g_set_mode(Role::Ev)?;
        self.whitebeet.v2g_start()?;
        let params = self.session.dc_parameters(self.config.initial_current);
        self.whitebeet.v2g_set_dc_charging_parameters(&params)?;
        self.whitebeet.v2g_start_session()?;
        self.session.begin();
        Ok(())
    }

    fn wait_for_evse(&mut self) -> Result<(), SessionFailure> {
        let timeout = self.config.evse_connect_timeout;
        let deadline = Instant::now() + timeout;
        info!("Waiting for EVSE PWM");

        loop {
            if self.token.is_stopped() {
                return Err(SessionFailure::Cancelled);
            }
            match self.whitebeet.control_pilot_get_duty_cycle() {
                Ok(duty) if duty > 0.0 && duty <= 10.0 => {
                    info!("EVSE connected ({:.1} % duty cycle)", duty);
                    return Ok(());
                }
                Ok(duty) => trace!("Duty cycle {:.1} %", duty),
                Err(ExchangeError::Cancelled) => return Err(SessionFailure::Cancelled),
                Err(e) => debug!("Duty cycle unavailable: {}", e),
            }
            if Instant::now() >= deadline {
                return Err(SessionFailure::EvseNotConnected(timeout));
            }
            if !self.token.sleep(self.config.duty_cycle_poll_interval) {
                return Err(SessionFailure::Cancelled);
            }
        }
    }

    fn match_slac(&mut self) -> Result<(), SessionFailure> {
        let timeout = self.config.slac_match_timeout;
        self.whitebeet.slac_start_matching()?;
        info!("SLAC matching started");

        let deadline = Instant::now() + timeout;
        loop {
            while let Ok(inbound) = self.inbox.try_recv() {
                let frame = match inbound {
                    Inbound::Frame(frame) => frame,
                    Inbound::Fault(e) => {
                        warn!("Poll fault while matching: {}", e);
                        continue;
                    }
                };
                if frame.module_id != ModuleId::Slac.id() {
                    self.deferred.push_back(frame);
                    continue;
                }
                match frame.sub_id {
                    slac::MATCHED => {
                        info!("SLAC matched");
                        return Ok(());
                    }
                    slac::MATCHING_FAILED => return Err(SessionFailure::SlacFailed),
                    other => debug!("SLAC message 0x{:02X} while matching", other),
                }
            }
            if Instant::now() >= deadline {
                return Err(SessionFailure::SlacTimeout(timeout));
            }
            if !self.token.sleep(self.config.slac_poll_interval) {
                return Err(SessionFailure::Cancelled);
            }
        }
    }

    fn session_loop(&mut self) -> Result<(), SessionFailure> {
        while let Some(frame) = self.deferred.pop_front() {
            self.session.handle_frame(&frame)?;
        }

        while !self.session.is_finished() {
            if self.token.is_stopped() {
                return Err(SessionFailure::Cancelled);
            }

            while let Ok(inbound) = self.inbox.try_recv() {
                match inbound {
                    Inbound::Frame(frame) => self.session.handle_frame(&frame)?,
                    // a missed poll is retried on the next cycle
                    Inbound::Fault(e) => warn!("Poll fault: {}", e),
                }
                if self.session.is_finished() {
                    return Ok(());
                }
            }

            self.session.tick()?;
            if self.session.is_finished() {
                break;
            }
            if !self.token.sleep(self.config.tick) {
                return Err(SessionFailure::Cancelled);
            }
        }
        Ok(())
    }
}

impl<B: Battery> std::fmt::Debug for Ev<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ev")
            .field("evid", &self.config.mac_string())
            .field("session", &self.session)
            .field("deferred", &self.deferred.len())
            .finish_non_exhaustive()
    }
}

