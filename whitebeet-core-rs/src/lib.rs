//! Whitebeet Core Library
//!
//! Host side of the framed protocol spoken by a Whitebeet charging-controller
//! module over a half-duplex SPI link. The module raises two GPIO lines to
//! coordinate the channel: `RX_Ready` (it accepts a request) and `TX_Pending`
//! (it holds a response or an unsolicited notification).
//!
//! ## Layers
//!
//! ```text
//! Whitebeet (typed command catalog)
//!       │
//!       ▼
//! Exchange (request/response cycle, transport lock) ◄── Poller (background thread)
//!       │                                                   │
//!       ▼                                                   ▼
//! codec (frames, exponential values)               Inbound channel ──► parsers
//!       │
//!       ▼
//! Transport (USB-to-SPI bridge, or SimulatedPeer)
//! ```

pub mod types;
pub mod codec;
pub mod transport;
pub mod config;
pub mod cancel;
pub mod exchange;
pub mod poller;
pub mod commands;
pub mod parsers;
pub mod sim;

pub use types::*;
pub use cancel::{stop_pair, StopHandle, StopToken};
pub use codec::{ChecksumPolicy, CodecError, FrameCodec, FrameError, InboundFrame};
pub use config::LinkConfig;
pub use exchange::{Direction, Exchange, ExchangeError, FrameTrace, Inbound, PollOutcome};
pub use poller::Poller;
pub use commands::{AcChargingParameters, DcChargingParameters, EvConfiguration, Whitebeet};
pub use parsers::{
    AcEvseParameters, ChargingProfile, DcEvseParameters, EvseNotification, Notification,
    NotificationKind, ParseError, PayloadReader, ProfileEntry, SessionInfo,
};
pub use sim::SimulatedPeer;
pub use transport::{GpioMasks, HandshakeLines, Transport, TransportError};
