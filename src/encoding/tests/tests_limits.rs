//! Safety limits: oversized length and count fields are rejected before
//! any allocation happens.

#[cfg(test)]
mod tests {
    use crate::encoding::*;

    #[test]
    fn byte_string_length_over_limit() {
        let buf = (MAX_BYTE_LEN + 1).to_le_bytes();
        let err = decode_from_slice::<Vec<u8>>(&buf).unwrap_err();
        assert!(
            matches!(err, EncodingError::LengthOverflow(_)),
            "expected LengthOverflow, got: {err:?}"
        );
    }

    #[test]
    fn byte_string_at_limit_needs_data() {
        let buf = MAX_BYTE_LEN.to_le_bytes();
        let err = decode_from_slice::<Vec<u8>>(&buf).unwrap_err();
        assert!(matches!(err, EncodingError::UnexpectedEof { .. }));
    }

    #[test]
    fn string_length_over_limit() {
        let buf = (MAX_BYTE_LEN + 1).to_le_bytes();
        let err = decode_from_slice::<String>(&buf).unwrap_err();
        assert!(matches!(err, EncodingError::LengthOverflow(_)));
    }

    #[test]
    fn vec_count_over_limit() {
        let buf = (MAX_VEC_ELEMENTS + 1).to_le_bytes();
        let err = decode_vec::<u64>(&buf).unwrap_err();
        assert!(matches!(err, EncodingError::LengthOverflow(_)));
    }

    #[test]
    fn vec_count_larger_than_buffer() {
        // A plausible count with no elements behind it must fail cleanly.
        let buf = 1000u32.to_le_bytes();
        let err = decode_vec::<u64>(&buf).unwrap_err();
        assert!(matches!(err, EncodingError::UnexpectedEof { .. }));
    }
}
