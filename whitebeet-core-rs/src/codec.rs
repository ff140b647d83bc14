//! Frame and numeric codecs
//!
//! A frame on the wire:
//!
//! ```text
//! +------+--------+-----+--------+--------+--------+-----------+----------+------+
//! | 0xC0 | module | sub | req_id | len_hi | len_lo | payload.. | checksum | 0xC1 |
//! +------+--------+-----+--------+--------+--------+-----------+----------+------+
//! ```
//!
//! The checksum is the one's complement of the end-around-carry sum of every
//! byte before it. A computed value of 0x00 is sent as 0xFF.
//!
//! Physical quantities travel as "exponential" values: a big-endian `i16`
//! mantissa followed by an `i8` decimal exponent.

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::types::MAX_PAYLOAD_LEN;

pub const FRAME_START: u8 = 0xC0;
pub const FRAME_END: u8 = 0xC1;

/// Start, module, sub, request id and the two length bytes
pub const FRAME_HEADER_LEN: usize = 6;

/// Checksum and end marker
pub const FRAME_TRAILER_LEN: usize = 2;

pub const FRAME_OVERHEAD: usize = FRAME_HEADER_LEN + FRAME_TRAILER_LEN;

/// Request ids wrap to zero before reaching this value
pub const RESERVED_REQUEST_ID: u8 = 0xFF;

/// Largest exponent the encoder will emit
const MAX_EXPONENT: i8 = 3;

/// Malformed frame bytes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame too short: {len} bytes")]
    TooShort { len: usize },

    #[error("bad marker at offset {offset}: expected 0x{expected:02X}, found 0x{found:02X}")]
    BadMarker { offset: usize, expected: u8, found: u8 },

    #[error("declared payload length {declared} does not match {actual} frame bytes")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("checksum mismatch: computed 0x{computed:02X}, frame carries 0x{found:02X}")]
    ChecksumMismatch { computed: u8, found: u8 },

    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD_LEN} byte cap")]
    PayloadTooLarge(usize),
}

/// Numeric encoding failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("{0} cannot be encoded as a 16-bit mantissa with exponent 0..=3")]
    Unrepresentable(i64),

    #[error("integer width {0} outside 1..=4 bytes")]
    InvalidWidth(usize),
}

/// What to do with an inbound frame whose checksum does not verify
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumPolicy {
    /// Log the mismatch and keep the frame
    #[default]
    Advisory,
    /// Reject the frame with `FrameError::ChecksumMismatch`
    Strict,
}

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboundFrame {
    pub module_id: u8,
    pub sub_id: u8,
    pub request_id: u8,
    pub payload: Vec<u8>,
    pub checksum_ok: bool,
}

impl InboundFrame {
    /// Ack/status code, the first payload byte of a response
    pub fn ack_code(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    /// Split a response into its ack code and the remaining body
    pub fn split_ack(&self) -> Result<(u8, &[u8]), FrameError> {
        match self.payload.split_first() {
            Some((ack, body)) => Ok((*ack, body)),
            None => Err(FrameError::TooShort { len: FRAME_OVERHEAD }),
        }
    }

    /// Whether this frame echoes the given request
    pub fn answers(&self, module_id: u8, sub_id: u8, request_id: u8) -> bool {
        self.module_id == module_id && self.sub_id == sub_id && self.request_id == request_id
    }
}

/// An encoded request together with the id it was assigned
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub request_id: u8,
    pub bytes: Vec<u8>,
}

/// Request encoder owning the request-id counter
#[derive(Debug, Default)]
pub struct FrameCodec {
    last_request_id: u8,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next request id, skipping the reserved value
    pub fn next_request_id(&mut self) -> u8 {
        let next = self.last_request_id.wrapping_add(1);
        self.last_request_id = if next == RESERVED_REQUEST_ID { 0 } else { next };
        self.last_request_id
    }

    /// Most recently allocated request id
    pub fn last_request_id(&self) -> u8 {
        self.last_request_id
    }

    pub fn encode_request(
        &mut self,
        module_id: u8,
        sub_id: u8,
        payload: &[u8],
    ) -> Result<OutboundFrame, FrameError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge(payload.len()));
        }
        let request_id = self.next_request_id();
        let bytes = encode_frame(module_id, sub_id, request_id, payload)?;
        Ok(OutboundFrame { request_id, bytes })
    }
}

/// Serialize a frame with an explicit request id
pub fn encode_frame(
    module_id: u8,
    sub_id: u8,
    request_id: u8,
    payload: &[u8],
) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }
    let len = payload.len() as u16;

    let mut frame = Vec::with_capacity(FRAME_OVERHEAD + payload.len());
    frame.extend_from_slice(&[FRAME_START, module_id, sub_id, request_id]);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    frame.push(checksum(&frame));
    frame.push(FRAME_END);
    Ok(frame)
}

/// One's complement of the folded byte sum; 0x00 is remapped to 0xFF
pub fn checksum(bytes: &[u8]) -> u8 {
    let mut sum: u32 = bytes.iter().map(|&b| b as u32).sum();
    while sum > 0xFF {
        sum = (sum & 0xFF) + (sum >> 8);
    }
    match !(sum as u8) {
        0x00 => 0xFF,
        value => value,
    }
}

/// Validate markers, length and checksum of an inbound frame
pub fn decode_inbound(bytes: &[u8], policy: ChecksumPolicy) -> Result<InboundFrame, FrameError> {
    if bytes.len() < FRAME_OVERHEAD {
        return Err(FrameError::TooShort { len: bytes.len() });
    }
    if bytes[0] != FRAME_START {
        return Err(FrameError::BadMarker {
            offset: 0,
            expected: FRAME_START,
            found: bytes[0],
        });
    }

    let declared = u16::from_be_bytes([bytes[4], bytes[5]]) as usize;
    if declared + FRAME_OVERHEAD != bytes.len() {
        return Err(FrameError::LengthMismatch {
            declared,
            actual: bytes.len(),
        });
    }

    let end = bytes.len() - 1;
    if bytes[end] != FRAME_END {
        return Err(FrameError::BadMarker {
            offset: end,
            expected: FRAME_END,
            found: bytes[end],
        });
    }

    let computed = checksum(&bytes[..end - 1]);
    let found = bytes[end - 1];
    let checksum_ok = computed == found;
    if !checksum_ok {
        match policy {
            ChecksumPolicy::Strict => return Err(FrameError::ChecksumMismatch { computed, found }),
            ChecksumPolicy::Advisory => warn!(
                "Checksum mismatch on frame 0x{:02X}/0x{:02X}: computed 0x{:02X}, got 0x{:02X}",
                bytes[1], bytes[2], computed, found
            ),
        }
    }

    Ok(InboundFrame {
        module_id: bytes[1],
        sub_id: bytes[2],
        request_id: bytes[3],
        payload: bytes[FRAME_HEADER_LEN..end - 1].to_vec(),
        checksum_ok,
    })
}

/// Encode an integer as mantissa + exponent, extracting trailing zeros
/// until the mantissa fits an `i16`.
pub fn encode_exponential(value: i64) -> Result<[u8; 3], CodecError> {
    let mut mantissa = value;
    let mut exponent: i8 = 0;
    while i16::try_from(mantissa).is_err() {
        if exponent == MAX_EXPONENT || mantissa % 10 != 0 {
            return Err(CodecError::Unrepresentable(value));
        }
        mantissa /= 10;
        exponent += 1;
    }
    let [hi, lo] = (mantissa as i16).to_be_bytes();
    Ok([hi, lo, exponent as u8])
}

pub fn decode_exponential(bytes: [u8; 3]) -> f64 {
    let mantissa = i16::from_be_bytes([bytes[0], bytes[1]]) as f64;
    let exponent = bytes[2] as i8 as i32;
    if exponent >= 0 {
        mantissa * 10f64.powi(exponent)
    } else {
        // division keeps values like 2005e-1 exact
        mantissa / 10f64.powi(-exponent)
    }
}

/// Closest value `encode_exponential` accepts, rounding half away from zero
pub fn nearest_representable(value: i64) -> i64 {
    let mut scale = 1i64;
    let mut scaled = value;
    while i16::try_from(scaled).is_err() && scale < 1000 {
        scale *= 10;
        scaled = (value as f64 / scale as f64).round() as i64;
    }
    let scaled = scaled.clamp(i16::MIN as i64, i16::MAX as i64);
    scaled * scale
}

pub fn encode_u32_be(value: u32) -> [u8; 4] {
    value.to_be_bytes()
}

/// Big-endian unsigned integer of 1 to 4 bytes
pub fn decode_int_be(bytes: &[u8]) -> Result<u32, CodecError> {
    if bytes.is_empty() || bytes.len() > 4 {
        return Err(CodecError::InvalidWidth(bytes.len()));
    }
    Ok(bytes.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_skip_reserved_value() {
        let mut codec = FrameCodec::new();
        assert_eq!(codec.next_request_id(), 1);

        codec.last_request_id = 0xFD;
        assert_eq!(codec.next_request_id(), 0xFE);
        assert_eq!(codec.next_request_id(), 0x00);
        assert_eq!(codec.next_request_id(), 0x01);
    }

    #[test]
    fn test_encode_request_layout() {
        let mut codec = FrameCodec::new();
        let frame = codec.encode_request(0x27, 0xA9, &[0x01, 0x02]).unwrap();

        assert_eq!(frame.request_id, 1);
        assert_eq!(&frame.bytes[..6], &[0xC0, 0x27, 0xA9, 0x01, 0x00, 0x02]);
        assert_eq!(&frame.bytes[6..8], &[0x01, 0x02]);
        assert_eq!(frame.bytes[8], checksum(&frame.bytes[..8]));
        assert_eq!(frame.bytes[9], FRAME_END);
    }

    #[test]
    fn test_checksum_never_zero() {
        // 0xC0 + 0x3F = 0xFF, complement is 0x00
        assert_eq!(checksum(&[0xC0, 0x3F]), 0xFF);
        assert_eq!(checksum(&[0x01]), 0xFE);
        // 0xFF + 0x02 = 0x101, folds to 0x02
        assert_eq!(checksum(&[0xFF, 0x02]), 0xFD);
    }

    #[test]
    fn test_decode_round_trip() {
        let bytes = encode_frame(0x29, 0x45, 7, &[0x00, 0x00, 0x32]).unwrap();
        let frame = decode_inbound(&bytes, ChecksumPolicy::Strict).unwrap();

        assert_eq!(frame.module_id, 0x29);
        assert_eq!(frame.sub_id, 0x45);
        assert_eq!(frame.request_id, 7);
        assert_eq!(frame.ack_code(), Some(0x00));
        assert_eq!(frame.split_ack().unwrap().1, &[0x00, 0x32]);
        assert!(frame.checksum_ok);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert_eq!(
            decode_inbound(&[0xC0, 0x27], ChecksumPolicy::Strict),
            Err(FrameError::TooShort { len: 2 })
        );

        let mut bytes = encode_frame(0x27, 0xC0, 0, &[1, 2, 3]).unwrap();
        bytes[0] = 0x00;
        assert!(matches!(
            decode_inbound(&bytes, ChecksumPolicy::Strict),
            Err(FrameError::BadMarker { offset: 0, .. })
        ));

        let mut bytes = encode_frame(0x27, 0xC0, 0, &[1, 2, 3]).unwrap();
        bytes.push(0);
        assert!(matches!(
            decode_inbound(&bytes, ChecksumPolicy::Strict),
            Err(FrameError::LengthMismatch { declared: 3, actual: 12 })
        ));
    }

    #[test]
    fn test_checksum_policy() {
        let mut bytes = encode_frame(0x27, 0xC4, 0, &[]).unwrap();
        let idx = bytes.len() - 2;
        bytes[idx] ^= 0x10;

        assert!(matches!(
            decode_inbound(&bytes, ChecksumPolicy::Strict),
            Err(FrameError::ChecksumMismatch { .. })
        ));

        let frame = decode_inbound(&bytes, ChecksumPolicy::Advisory).unwrap();
        assert!(!frame.checksum_ok);
        assert_eq!(frame.sub_id, 0xC4);
    }

    #[test]
    fn test_payload_cap() {
        let mut codec = FrameCodec::new();
        let payload = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert_eq!(
            codec.encode_request(0x27, 0xA0, &payload).unwrap_err(),
            FrameError::PayloadTooLarge(MAX_PAYLOAD_LEN + 1)
        );
        // the counter is untouched by a rejected request
        assert_eq!(codec.last_request_id(), 0);
    }

    #[test]
    fn test_exponential_examples() {
        assert_eq!(encode_exponential(0).unwrap(), [0, 0, 0]);
        assert_eq!(encode_exponential(50000).unwrap(), [0x13, 0x88, 1]);
        assert_eq!(encode_exponential(-200).unwrap(), [0xFF, 0x38, 0]);
        assert_eq!(encode_exponential(12345).unwrap(), [0x30, 0x39, 0]);

        assert_eq!(decode_exponential([0x13, 0x88, 1]), 50000.0);
        assert_eq!(decode_exponential([0x07, 0xD5, 0xFF]), 200.5);
    }

    #[test]
    fn test_exponential_rejects_unrepresentable() {
        assert_eq!(encode_exponential(40001), Err(CodecError::Unrepresentable(40001)));
        assert_eq!(
            encode_exponential(400_000_000),
            Err(CodecError::Unrepresentable(400_000_000))
        );
        assert!(encode_exponential(32_767_000).is_ok());
    }

    #[test]
    fn test_nearest_representable() {
        assert_eq!(nearest_representable(1234), 1234);
        assert_eq!(nearest_representable(40001), 40000);
        assert_eq!(nearest_representable(37125), 37130);
        assert!(encode_exponential(nearest_representable(123_456_789)).is_ok());
    }

    #[test]
    fn test_int_be() {
        assert_eq!(encode_u32_be(0x0102_0304), [1, 2, 3, 4]);
        assert_eq!(decode_int_be(&[0x01, 0x00]).unwrap(), 256);
        assert_eq!(decode_int_be(&[0xFF; 4]).unwrap(), u32::MAX);
        assert_eq!(decode_int_be(&[]), Err(CodecError::InvalidWidth(0)));
        assert_eq!(decode_int_be(&[0; 5]), Err(CodecError::InvalidWidth(5)));
    }
}
