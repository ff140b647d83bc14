//! Synchronous request/response engine
//!
//! One exchange owns the transport for a complete handshake:
//!
//! 1. wait for `RX_Ready`
//! 2. size frame + data frame carrying the request
//! 3. wait for `TX_Pending`
//! 4. size frame announcing the response length, then the data frame
//! 5. decode, correlate, inspect the ack code
//!
//! The transport sits behind a `parking_lot::Mutex` held for all of the
//! above. The poller only ever `try_lock`s it, so it can never interleave
//! with an in-flight request.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::cancel::StopToken;
use crate::codec::{decode_inbound, CodecError, FrameCodec, FrameError, InboundFrame};
use crate::config::LinkConfig;
use crate::transport::{HandshakeLines, Transport, TransportError};
use crate::types::MAX_PAYLOAD_LEN;

/// Marker opening a size-frame transfer
pub const SIZE_MARKER: [u8; 2] = [0xAA, 0xAA];

/// Marker opening a data-frame transfer
pub const DATA_MARKER: [u8; 2] = [0x55, 0x55];

/// Marker plus two bytes (length, or padding) before any frame bytes
pub const SPI_HEADER_LEN: usize = 4;

/// Size reported when nobody drives MISO
const FLOATING_SIZE: u16 = 0xFFFF;

/// Failures of a request/response cycle
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("cannot encode request: {0}")]
    Encode(#[from] CodecError),

    #[error("peer not ready: RX_Ready stayed low for {0:?}")]
    PeerNotReady(Duration),

    #[error("no response: TX_Pending stayed low for {0:?}")]
    NoResponse(Duration),

    #[error("invalid inbound frame size 0x{0:04X}")]
    InvalidSize(u16),

    #[error("unsolicited frame 0x{:02X}/0x{:02X} (request id {}) while awaiting a response", .0.module_id, .0.sub_id, .0.request_id)]
    Unsolicited(InboundFrame),

    #[error("request rejected with code 0x{0:02X}")]
    Nack(u8),

    #[error("malformed reply: {0}")]
    MalformedReply(&'static str),

    #[error("exchange cancelled while waiting on the handshake lines")]
    Cancelled,
}

impl ExchangeError {
    /// Handshake timeouts, retryable while passively waiting
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExchangeError::PeerNotReady(_) | ExchangeError::NoResponse(_))
    }
}

/// Frames and faults surfaced outside of a request/response cycle
#[derive(Debug)]
pub enum Inbound {
    /// A frame nobody asked for
    Frame(InboundFrame),
    /// A poll cycle failed; the poller keeps running
    Fault(ExchangeError),
}

/// Result of one poll cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// An exchange held the transport; retry next tick
    Busy,
    /// `TX_Pending` was low or the peer had nothing to send
    Idle,
    /// A frame was published
    Delivered,
    /// A fault was published
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Tx,
    Rx,
}

/// Diagnostic copy of a frame crossing the link
#[derive(Debug, Clone, Serialize)]
pub struct FrameTrace {
    pub direction: Direction,
    pub bytes: Vec<u8>,
}

/// Everything behind the transport lock
struct Link {
    transport: Box<dyn Transport>,
    codec: FrameCodec,
}

/// Request/response engine; clones share the same transport and counter
#[derive(Clone)]
pub struct Exchange {
    link: Arc<Mutex<Link>>,
    config: LinkConfig,
    inbox: mpsc::UnboundedSender<Inbound>,
    trace: Option<mpsc::UnboundedSender<FrameTrace>>,
    /// Interrupts handshake waits once stopped
    stop: Option<StopToken>,
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("config", &self.config)
            .field("traced", &self.trace.is_some())
            .field("stoppable", &self.stop.is_some())
            .finish_non_exhaustive()
    }
}

impl Exchange {
    /// Wrap a transport; the receiver collects unsolicited frames and poll faults
    pub fn new(
        transport: Box<dyn Transport>,
        config: LinkConfig,
    ) -> (Self, mpsc::UnboundedReceiver<Inbound>) {
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let exchange = Self {
            link: Arc::new(Mutex::new(Link {
                transport,
                codec: FrameCodec::new(),
            })),
            config,
            inbox,
            trace: None,
            stop: None,
        };
        (exchange, inbox_rx)
    }

    /// Copy every transmitted and received frame to `sink`
    pub fn with_trace(mut self, sink: mpsc::UnboundedSender<FrameTrace>) -> Self {
        self.trace = Some(sink);
        self
    }

    /// Abort handshake waits with [`ExchangeError::Cancelled`] once `token` is stopped
    pub fn with_stop(mut self, token: StopToken) -> Self {
        self.stop = Some(token);
        self
    }

    /// Same link, but waits run to their timeouts regardless of the stop token.
    /// Used for the shutdown requests sent after a stop.
    pub fn without_stop(&self) -> Self {
        Self {
            stop: None,
            ..self.clone()
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn open(&self) -> Result<(), TransportError> {
        self.link.lock().transport.open()
    }

    pub fn close(&self) {
        self.link.lock().transport.close()
    }

    /// Most recently allocated request id
    pub fn last_request_id(&self) -> u8 {
        self.link.lock().codec.last_request_id()
    }

    /// Run one complete request/response cycle and return the reply body
    /// (the payload after the ack byte).
    pub fn send_query(
        &self,
        module_id: u8,
        sub_id: u8,
        payload: &[u8],
    ) -> Result<Vec<u8>, ExchangeError> {
        let mut link = self.link.lock();
        let request = link.codec.encode_request(module_id, sub_id, payload)?;

        self.drain_stale(&mut link)?;

        if !self.wait_for(&mut link, |lines| lines.rx_ready, self.config.ready_timeout)? {
            warn!("RX_Ready timeout before 0x{:02X}/0x{:02X}", module_id, sub_id);
            return Err(ExchangeError::PeerNotReady(self.config.ready_timeout));
        }

        self.write_frame(&mut link, &request.bytes)?;
        debug!(
            "TX 0x{:02X}/0x{:02X} id={} len={}",
            module_id,
            sub_id,
            request.request_id,
            payload.len()
        );

        if !self.wait_for(&mut link, |lines| lines.tx_pending, self.config.response_timeout)? {
            warn!("No response to 0x{:02X}/0x{:02X}", module_id, sub_id);
            return Err(ExchangeError::NoResponse(self.config.response_timeout));
        }

        let bytes = self.read_frame(&mut link)?;
        drop(link);

        if bytes.is_empty() {
            // bare ACK without a frame
            return Ok(Vec::new());
        }

        let frame = decode_inbound(&bytes, self.config.checksum_policy)?;
        if !frame.answers(module_id, sub_id, request.request_id) {
            warn!(
                "Expected reply to 0x{:02X}/0x{:02X} id={}, got 0x{:02X}/0x{:02X} id={}",
                module_id, sub_id, request.request_id, frame.module_id, frame.sub_id, frame.request_id
            );
            self.publish(Inbound::Frame(frame.clone()));
            return Err(ExchangeError::Unsolicited(frame));
        }

        let (ack, body) = frame.split_ack()?;
        if ack != 0x00 {
            warn!("0x{:02X}/0x{:02X} answered with NACK 0x{:02X}", module_id, sub_id, ack);
            return Err(ExchangeError::Nack(ack));
        }
        Ok(body.to_vec())
    }

    /// One poller cycle: pull a pending frame unless an exchange owns the link
    pub fn poll_once(&self) -> PollOutcome {
        let Some(mut link) = self.link.try_lock() else {
            trace!("Transport busy, skipping poll cycle");
            return PollOutcome::Busy;
        };

        let result = self.sample(&mut link).and_then(|lines| {
            if lines.tx_pending {
                self.read_frame(&mut link).map(Some)
            } else {
                Ok(None)
            }
        });
        drop(link);

        match result {
            Ok(None) => PollOutcome::Idle,
            Ok(Some(bytes)) if bytes.is_empty() => PollOutcome::Idle,
            Ok(Some(bytes)) => match decode_inbound(&bytes, self.config.checksum_policy) {
                Ok(frame) => {
                    debug!(
                        "RX unsolicited 0x{:02X}/0x{:02X} len={}",
                        frame.module_id,
                        frame.sub_id,
                        frame.payload.len()
                    );
                    self.publish(Inbound::Frame(frame));
                    PollOutcome::Delivered
                }
                Err(e) => {
                    warn!("Dropping malformed unsolicited frame: {}", e);
                    self.publish(Inbound::Fault(e.into()));
                    PollOutcome::Failed
                }
            },
            Err(e) => {
                warn!("Poll cycle failed: {}", e);
                self.publish(Inbound::Fault(e));
                PollOutcome::Failed
            }
        }
    }

    fn publish(&self, inbound: Inbound) {
        if self.inbox.send(inbound).is_err() {
            debug!("Inbox closed, dropping inbound event");
        }
    }

    /// Push frames that were already pending to the inbox; they cannot
    /// answer a request that has not been sent yet.
    fn drain_stale(&self, link: &mut MutexGuard<'_, Link>) -> Result<(), ExchangeError> {
        for _ in 0..self.config.max_stale_frames {
            if !self.sample(link)?.tx_pending {
                return Ok(());
            }
            let bytes = self.read_frame(link)?;
            if bytes.is_empty() {
                return Ok(());
            }
            match decode_inbound(&bytes, self.config.checksum_policy) {
                Ok(frame) => {
                    debug!("Pending frame 0x{:02X}/0x{:02X} moved to inbox", frame.module_id, frame.sub_id);
                    self.publish(Inbound::Frame(frame));
                }
                Err(e) => {
                    warn!("Dropping malformed pending frame: {}", e);
                    self.publish(Inbound::Fault(e.into()));
                }
            }
        }
        Ok(())
    }

    fn sample(&self, link: &mut MutexGuard<'_, Link>) -> Result<HandshakeLines, ExchangeError> {
        let status = link.transport.read_status()?;
        Ok(HandshakeLines::from_status(status, &self.config.masks))
    }

    /// Poll the handshake lines until `ready` holds or `timeout` elapses.
    /// A stopped token ends the wait early, but only after a failed sample.
    fn wait_for(
        &self,
        link: &mut MutexGuard<'_, Link>,
        ready: impl Fn(&HandshakeLines) -> bool,
        timeout: Duration,
    ) -> Result<bool, ExchangeError> {
        let started = Instant::now();
        loop {
            if ready(&self.sample(link)?) {
                return Ok(true);
            }
            if self.stop.as_ref().is_some_and(|token| token.is_stopped()) {
                debug!("Handshake wait interrupted by stop request");
                return Err(ExchangeError::Cancelled);
            }
            if started.elapsed() >= timeout {
                return Ok(false);
            }
            std::thread::sleep(self.config.gpio_poll_interval);
        }
    }

    fn write_frame(&self, link: &mut MutexGuard<'_, Link>, frame: &[u8]) -> Result<(), ExchangeError> {
        let len = frame.len() as u16;
        let mut size = [SIZE_MARKER[0], SIZE_MARKER[1], 0, 0];
        size[2..].copy_from_slice(&len.to_be_bytes());
        link.transport.transfer(&mut size)?;

        let mut data = Vec::with_capacity(SPI_HEADER_LEN + frame.len());
        data.extend_from_slice(&[DATA_MARKER[0], DATA_MARKER[1], 0, 0]);
        data.extend_from_slice(frame);
        link.transport.transfer(&mut data)?;

        self.record(Direction::Tx, frame);
        Ok(())
    }

    /// Size frame then data frame; an empty vector means length 0.
    /// Announced sizes above the largest payload are rejected before the data transfer.
    fn read_frame(&self, link: &mut MutexGuard<'_, Link>) -> Result<Vec<u8>, ExchangeError> {
        let mut size = [SIZE_MARKER[0], SIZE_MARKER[1], 0, 0];
        link.transport.transfer(&mut size)?;
        let len = u16::from_be_bytes([size[2], size[3]]);

        if len == FLOATING_SIZE || len as usize > MAX_PAYLOAD_LEN {
            return Err(ExchangeError::InvalidSize(len));
        }
        if len == 0 {
            return Ok(Vec::new());
        }

        let mut data = vec![0u8; SPI_HEADER_LEN + len as usize];
        data[..2].copy_from_slice(&DATA_MARKER);
        link.transport.transfer(&mut data)?;
        data.drain(..SPI_HEADER_LEN);

        self.record(Direction::Rx, &data);
        Ok(data)
    }

    fn record(&self, direction: Direction, bytes: &[u8]) {
        debug!("{:?} {}", direction, hex(bytes));
        if let Some(sink) = &self.trace {
            let _ = sink.send(FrameTrace {
                direction,
                bytes: bytes.to_vec(),
            });
        }
    }
}

/// Space separated upper-case hex dump
pub fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::stop_pair;
    use crate::codec::encode_frame;
    use crate::sim::SimulatedPeer;

    fn exchange(peer: &SimulatedPeer) -> (Exchange, mpsc::UnboundedReceiver<Inbound>) {
        let config = LinkConfig::default().with_timeouts(
            Duration::from_millis(50),
            Duration::from_millis(50),
        );
        let (exchange, inbox) = Exchange::new(Box::new(peer.clone()), config);
        exchange.open().unwrap();
        (exchange, inbox)
    }

    #[test]
    fn test_hex() {
        assert_eq!(hex(&[0xC0, 0x01, 0xAB]), "C0 01 AB");
        assert_eq!(hex(&[]), "");
    }

    #[test]
    fn test_query_returns_body_after_ack() {
        let peer = SimulatedPeer::new();
        peer.respond_with(0x29, 0x45, vec![0x00, 0x00, 0x32]);
        let (exchange, _inbox) = exchange(&peer);

        let body = exchange.send_query(0x29, 0x45, &[]).unwrap();
        assert_eq!(body, vec![0x00, 0x32]);
        assert_eq!(exchange.last_request_id(), 1);
    }

    #[test]
    fn test_nack() {
        let peer = SimulatedPeer::new();
        peer.respond_with(0x27, 0xA9, vec![0x05]);
        let (exchange, _inbox) = exchange(&peer);

        assert!(matches!(
            exchange.send_query(0x27, 0xA9, &[]),
            Err(ExchangeError::Nack(0x05))
        ));
    }

    #[test]
    fn test_peer_not_ready() {
        let peer = SimulatedPeer::new();
        peer.set_rx_ready(false);
        let (exchange, _inbox) = exchange(&peer);

        let err = exchange.send_query(0x27, 0xA9, &[]).unwrap_err();
        assert!(matches!(err, ExchangeError::PeerNotReady(_)));
        assert!(err.is_timeout());
        assert!(peer.requests().is_empty());
    }

    #[test]
    fn test_no_response() {
        let peer = SimulatedPeer::new();
        peer.mute(0x27, 0xAE);
        let (exchange, _inbox) = exchange(&peer);

        let err = exchange.send_query(0x27, 0xAE, &[]).unwrap_err();
        assert!(matches!(err, ExchangeError::NoResponse(_)));
        assert_eq!(peer.requests().len(), 1);
    }

    #[test]
    fn test_floating_bus_is_invalid_size() {
        let peer = SimulatedPeer::new();
        peer.set_floating_size(true);
        let (exchange, _inbox) = exchange(&peer);

        assert!(matches!(
            exchange.send_query(0x27, 0xA9, &[]),
            Err(ExchangeError::InvalidSize(0xFFFF))
        ));
    }

    #[test]
    fn test_zero_size_after_tx_pending_is_bare_ack() {
        let peer = SimulatedPeer::new();
        peer.answer_with_size(0x27, 0xA9, 0);
        let (exchange, _inbox) = exchange(&peer);

        assert_eq!(exchange.send_query(0x27, 0xA9, &[]).unwrap(), Vec::<u8>::new());
        assert_eq!(peer.count(0x27, 0xA9), 1);
    }

    #[test]
    fn test_size_over_cap_is_invalid() {
        let peer = SimulatedPeer::new();
        peer.answer_with_size(0x27, 0xA9, 4105);
        let (exchange, _inbox) = exchange(&peer);

        assert!(matches!(
            exchange.send_query(0x27, 0xA9, &[]),
            Err(ExchangeError::InvalidSize(4105))
        ));
    }

    #[test]
    fn test_size_cap_is_the_payload_limit() {
        let peer = SimulatedPeer::new();
        peer.answer_with_size(0x27, 0xA9, (MAX_PAYLOAD_LEN + 1) as u16);
        let (exchange, _inbox) = exchange(&peer);

        assert!(matches!(
            exchange.send_query(0x27, 0xA9, &[]),
            Err(ExchangeError::InvalidSize(4097))
        ));
    }

    #[test]
    fn test_mismatched_reply_reaches_inbox() {
        let peer = SimulatedPeer::new();
        peer.corrupt_next_response_id();
        let (exchange, mut inbox) = exchange(&peer);

        let err = exchange.send_query(0x29, 0x42, &[]).unwrap_err();
        assert!(matches!(err, ExchangeError::Unsolicited(_)));
        match inbox.try_recv().unwrap() {
            Inbound::Frame(frame) => assert_eq!(frame.sub_id, 0x42),
            other => panic!("unexpected {:?}", other),
        }

        // a closed inbox does not turn into an error
        drop(inbox);
        peer.corrupt_next_response_id();
        assert!(matches!(
            exchange.send_query(0x29, 0x42, &[]),
            Err(ExchangeError::Unsolicited(_))
        ));
    }

    #[test]
    fn test_stop_interrupts_ready_wait() {
        let peer = SimulatedPeer::new();
        peer.set_rx_ready(false);
        let config = LinkConfig::default().with_timeouts(
            Duration::from_secs(2),
            Duration::from_secs(2),
        );
        let (stop, token) = stop_pair();
        let (exchange, _inbox) = Exchange::new(Box::new(peer.clone()), config);
        let exchange = exchange.with_stop(token);
        exchange.open().unwrap();

        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            stop.stop();
        });
        let started = Instant::now();
        let err = exchange.send_query(0x27, 0xA9, &[]).unwrap_err();
        stopper.join().unwrap();

        assert!(matches!(err, ExchangeError::Cancelled));
        assert!(!err.is_timeout());
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(peer.requests().is_empty());
    }

    #[test]
    fn test_stopped_exchange_still_finishes_ready_handshake() {
        let peer = SimulatedPeer::new();
        let (stop, token) = stop_pair();
        let (exchange, _inbox) = exchange(&peer);
        let exchange = exchange.with_stop(token);
        stop.stop();

        // lines already up: no wait, no cancellation
        assert!(exchange.send_query(0x29, 0x42, &[]).is_ok());

        peer.set_rx_ready(false);
        assert!(matches!(
            exchange.send_query(0x29, 0x42, &[]),
            Err(ExchangeError::Cancelled)
        ));
        assert!(matches!(
            exchange.without_stop().send_query(0x29, 0x42, &[]),
            Err(ExchangeError::PeerNotReady(_))
        ));
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_frame_dumps_logged_at_debug() {
        let peer = SimulatedPeer::new();
        let (exchange, _inbox) = exchange(&peer);
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            exchange.send_query(0x29, 0x42, &[]).unwrap();
        });

        let logs = String::from_utf8(captured.0.lock().clone()).unwrap();
        let request = hex(&encode_frame(0x29, 0x42, 1, &[]).unwrap());
        let reply = hex(&encode_frame(0x29, 0x42, 1, &[0x00]).unwrap());
        assert!(logs.contains(&format!("Tx {}", request)), "{}", logs);
        assert!(logs.contains(&format!("Rx {}", reply)), "{}", logs);
    }

    #[test]
    fn test_poll_once_idle_and_delivered() {
        let peer = SimulatedPeer::new();
        let (exchange, mut inbox) = exchange(&peer);
        assert_eq!(exchange.poll_once(), PollOutcome::Idle);

        peer.push_notification(0x27, 0xC4, vec![]);
        assert_eq!(exchange.poll_once(), PollOutcome::Delivered);

        match inbox.try_recv().unwrap() {
            Inbound::Frame(frame) => {
                assert_eq!(frame.module_id, 0x27);
                assert_eq!(frame.sub_id, 0xC4);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_poll_once_reports_garbage_and_continues() {
        let peer = SimulatedPeer::new();
        let (exchange, mut inbox) = exchange(&peer);

        peer.push_raw(vec![0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07]);
        peer.push_notification(0x27, 0xC5, vec![]);

        assert_eq!(exchange.poll_once(), PollOutcome::Failed);
        assert!(matches!(
            inbox.try_recv().unwrap(),
            Inbound::Fault(ExchangeError::Frame(FrameError::BadMarker { .. }))
        ));

        assert_eq!(exchange.poll_once(), PollOutcome::Delivered);
    }

    #[test]
    fn test_stale_frames_are_drained_before_request() {
        let peer = SimulatedPeer::new();
        let (exchange, mut inbox) = exchange(&peer);

        peer.push_notification(0x27, 0xC0, vec![1, 2, 3]);
        exchange.send_query(0x27, 0xAA, &[]).unwrap();

        match inbox.try_recv().unwrap() {
            Inbound::Frame(frame) => assert_eq!(frame.sub_id, 0xC0),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_trace_sees_both_directions() {
        let peer = SimulatedPeer::new();
        let (exchange, _inbox) = exchange(&peer);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let exchange = exchange.with_trace(tx);

        exchange.send_query(0x29, 0x42, &[]).unwrap();

        let sent = rx.try_recv().unwrap();
        assert_eq!(sent.direction, Direction::Tx);
        assert_eq!(sent.bytes, encode_frame(0x29, 0x42, 1, &[]).unwrap());
        let received = rx.try_recv().unwrap();
        assert_eq!(received.direction, Direction::Rx);
        assert_eq!(received.bytes, encode_frame(0x29, 0x42, 1, &[0x00]).unwrap());
    }
}
