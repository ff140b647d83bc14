//! # Whitebeet EV
//!
//! EV side of an ISO 15118 DC charging session, driven through a Whitebeet
//! module via [`whitebeet_core`].
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │  Ev (driver)                             │
//! │  bring-up → SLAC → V2G → session loop    │
//! │       │                                  │
//! │       ▼                                  │
//! │  Session ──► ChargingPolicy ──► Battery  │
//! └───────┬──────────────────────────────────┘
//!         │ Whitebeet commands / Inbound frames
//!         ▼
//! ┌──────────────────────────────────────────┐
//! │  whitebeet-core                          │
//! │  Exchange │ Poller │ parsers │ codec     │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use whitebeet_core::{LinkConfig, SimulatedPeer};
//! use whitebeet_ev::{Ev, EvConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EvConfig::default()
//!         .with_mac("02:00:00:00:00:01")?
//!         .with_initial_soc(40.0);
//!
//!     let ev = Ev::from_config(
//!         Box::new(SimulatedPeer::charging_station()),
//!         LinkConfig::default(),
//!         config,
//!     )?;
//!     let summary = ev.run()?;
//!     println!("charged to {:.1} %", summary.final_soc);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod battery;
pub mod charging;
pub mod session;
pub mod ev;

pub use config::{ConfigError, DcLimits, EvConfig};
pub use battery::{Battery, LinearBattery};
pub use charging::ChargingPolicy;
pub use session::{EvEvent, Session, SessionFailure, SessionState};
pub use ev::{Ev, SessionSummary};
