//! Transport contract for the USB-to-SPI bridge
//!
//! The bridge is a vendor driver boundary: it performs one blocking
//! full-duplex SPI exchange and reads a digital-input status word. Everything
//! protocol related lives above this trait.

use thiserror::Error;

/// Default `TX_Pending` bit in the bridge's input status word
pub const TX_PENDING_MASK: u32 = 0x0000_0100;

/// Default `RX_Ready` bit in the bridge's input status word
pub const RX_READY_MASK: u32 = 0x0000_0200;

/// Errors raised by the bridge itself
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("device is not open")]
    NotOpen,

    #[error("device unavailable: {0}")]
    Unavailable(String),

    #[error("transfer rejected: {0}")]
    Rejected(String),

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Blocking full-duplex byte transport with a GPIO status word
pub trait Transport: Send {
    /// Open the device
    fn open(&mut self) -> Result<(), TransportError>;

    /// Close the device; closing twice is a no-op
    fn close(&mut self);

    /// Exchange `buffer.len()` bytes in place
    fn transfer(&mut self, buffer: &mut [u8]) -> Result<(), TransportError>;

    /// Read the digital-input status word
    fn read_status(&mut self) -> Result<u32, TransportError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn open(&mut self) -> Result<(), TransportError> {
        (**self).open()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn transfer(&mut self, buffer: &mut [u8]) -> Result<(), TransportError> {
        (**self).transfer(buffer)
    }

    fn read_status(&mut self) -> Result<u32, TransportError> {
        (**self).read_status()
    }
}

/// Bit positions of the two handshake lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpioMasks {
    pub tx_pending: u32,
    pub rx_ready: u32,
}

impl Default for GpioMasks {
    fn default() -> Self {
        Self {
            tx_pending: TX_PENDING_MASK,
            rx_ready: RX_READY_MASK,
        }
    }
}

/// One sample of the handshake lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeLines {
    /// Peer accepts a new request
    pub rx_ready: bool,
    /// Peer holds a frame for us
    pub tx_pending: bool,
}

impl HandshakeLines {
    pub fn from_status(status: u32, masks: &GpioMasks) -> Self {
        Self {
            rx_ready: status & masks.rx_ready != 0,
            tx_pending: status & masks.tx_pending != 0,
        }
    }
}
