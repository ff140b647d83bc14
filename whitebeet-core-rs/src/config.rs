//! Link timing configuration

use std::time::Duration;

use crate::codec::ChecksumPolicy;
use crate::transport::GpioMasks;

/// Timing and handshake settings for the exchange engine and poller
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// How long to wait for `RX_Ready` before sending a request
    pub ready_timeout: Duration,

    /// How long to wait for `TX_Pending` after a request was sent
    pub response_timeout: Duration,

    /// Sleep between two GPIO samples
    pub gpio_poll_interval: Duration,

    /// Handshake line bit masks
    pub masks: GpioMasks,

    /// Handling of inbound checksum mismatches
    pub checksum_policy: ChecksumPolicy,

    /// Poller cadence
    pub poll_interval: Duration,

    /// Upper bound on joining the poller thread at shutdown
    pub stop_join_timeout: Duration,

    /// Frames drained to the inbox before a request goes out
    pub max_stale_frames: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_millis(500),
            response_timeout: Duration::from_millis(1000),
            gpio_poll_interval: Duration::from_millis(5),
            masks: GpioMasks::default(),
            checksum_policy: ChecksumPolicy::Advisory,
            poll_interval: Duration::from_millis(50),
            stop_join_timeout: Duration::from_millis(500),
            max_stale_frames: 8,
        }
    }
}

impl LinkConfig {
    /// Set both handshake timeouts
    pub fn with_timeouts(mut self, ready: Duration, response: Duration) -> Self {
        self.ready_timeout = ready;
        self.response_timeout = response;
        self
    }

    /// Set the poller cadence
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_masks(mut self, masks: GpioMasks) -> Self {
        self.masks = masks;
        self
    }

    pub fn with_checksum_policy(mut self, policy: ChecksumPolicy) -> Self {
        self.checksum_policy = policy;
        self
    }
}
