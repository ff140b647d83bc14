//! Property tests for the frame codec
//!
//! - Exponential values round-trip exactly within the representable range
//! - Encoded frames decode under the strict checksum policy
//! - Any single-bit corruption of an encoded frame is rejected

use proptest::prelude::*;
use whitebeet_core::codec::*;

// ============================================================================
// Strategies
// ============================================================================

/// 16-bit mantissa scaled by up to three trailing zeros
fn representable() -> impl Strategy<Value = i64> {
    (any::<i16>(), 0u32..=3).prop_map(|(mantissa, exponent)| mantissa as i64 * 10i64.pow(exponent))
}

fn payload() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..64)
}

// ============================================================================
// Exponential values
// ============================================================================

proptest! {
    #[test]
    fn exponential_round_trip(value in representable()) {
        let bytes = encode_exponential(value).unwrap();
        prop_assert_eq!(decode_exponential(bytes), value as f64);
        prop_assert!((bytes[2] as i8) <= 3);
    }

    #[test]
    fn nearest_representable_always_encodes(value in -32_767_000i64..=32_767_000) {
        let nearest = nearest_representable(value);
        prop_assert!(encode_exponential(nearest).is_ok());
        // rounding error is at most half of the chosen scale
        prop_assert!((nearest - value).abs() <= 500);
    }

    #[test]
    fn decode_int_is_big_endian(value in any::<u32>()) {
        prop_assert_eq!(decode_int_be(&encode_u32_be(value)).unwrap(), value);
    }
}

// ============================================================================
// Frames
// ============================================================================

proptest! {
    #[test]
    fn encoded_frames_decode_strictly(
        module in any::<u8>(),
        sub in any::<u8>(),
        request_id in 0u8..0xFF,
        body in payload()
    ) {
        let frame = encode_frame(module, sub, request_id, &body).unwrap();
        let decoded = decode_inbound(&frame, ChecksumPolicy::Strict).unwrap();

        prop_assert_eq!(decoded.module_id, module);
        prop_assert_eq!(decoded.sub_id, sub);
        prop_assert_eq!(decoded.request_id, request_id);
        prop_assert_eq!(decoded.payload, body);
        prop_assert!(decoded.checksum_ok);
    }

    /// One's-complement sums catch every single-bit error
    #[test]
    fn single_bit_flip_is_rejected(
        module in any::<u8>(),
        sub in any::<u8>(),
        body in payload(),
        position in any::<prop::sample::Index>(),
        bit in 0u8..8
    ) {
        let mut frame = encode_frame(module, sub, 1, &body).unwrap();
        let index = position.index(frame.len());
        frame[index] ^= 1 << bit;

        prop_assert!(decode_inbound(&frame, ChecksumPolicy::Strict).is_err());
    }

    #[test]
    fn request_ids_never_hit_reserved_value(skip in 0usize..600) {
        let mut codec = FrameCodec::new();
        for _ in 0..skip {
            prop_assert_ne!(codec.next_request_id(), RESERVED_REQUEST_ID);
        }
    }
}
