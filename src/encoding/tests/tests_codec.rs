//! Byte-level layout and round-trip tests for the encoding primitives and
//! the `Reader` cursor.

#[cfg(test)]
mod tests {
    use crate::encoding::*;

    #[derive(Debug, PartialEq)]
    struct Handle {
        offset: u64,
        size: u64,
        name: String,
    }

    impl Encode for Handle {
        fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
            self.offset.encode_to(buf)?;
            self.size.encode_to(buf)?;
            self.name.encode_to(buf)
        }
    }

    impl Decode for Handle {
        fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
            let mut r = Reader::new(buf);
            let offset = r.read()?;
            let size = r.read()?;
            let name = r.read()?;
            Ok((Self { offset, size, name }, r.consumed()))
        }
    }

    // ----------------------------------------------------------------
    // Integers are little-endian and fixed width
    // ----------------------------------------------------------------

    #[test]
    fn integers_are_little_endian() {
        assert_eq!(encode_to_vec(&0xDEAD_BEEFu32).unwrap(), [0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(
            encode_to_vec(&0x0102_0304_0506_0708u64).unwrap(),
            [0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]
        );
        let (v, n) = decode_from_slice::<u64>(&[1, 0, 0, 0, 0, 0, 0, 0, 0xFF]).unwrap();
        assert_eq!((v, n), (1, 8));
    }

    #[test]
    fn bool_rejects_other_bytes() {
        assert!(decode_from_slice::<bool>(&[1]).unwrap().0);
        let err = decode_from_slice::<bool>(&[7]).unwrap_err();
        assert!(matches!(err, EncodingError::InvalidBool(7)));
    }

    #[test]
    fn truncated_integer_reports_eof() {
        let err = decode_from_slice::<u32>(&[1, 2]).unwrap_err();
        assert!(matches!(
            err,
            EncodingError::UnexpectedEof {
                needed: 4,
                available: 2
            }
        ));
    }

    // ----------------------------------------------------------------
    // Byte strings and options
    // ----------------------------------------------------------------

    #[test]
    fn byte_string_is_length_prefixed() {
        let bytes = encode_to_vec(&b"abc".to_vec()).unwrap();
        assert_eq!(bytes, [3, 0, 0, 0, b'a', b'b', b'c']);
        let slice: &[u8] = b"abc";
        assert_eq!(encode_to_vec(&slice).unwrap(), bytes);
    }

    #[test]
    fn empty_byte_string() {
        let bytes = encode_to_vec(&Vec::<u8>::new()).unwrap();
        let (decoded, n) = decode_from_slice::<Vec<u8>>(&bytes).unwrap();
        assert!(decoded.is_empty());
        assert_eq!(n, 4);
    }

    #[test]
    fn option_tags() {
        assert_eq!(encode_to_vec(&None::<u32>).unwrap(), [0]);
        assert_eq!(encode_to_vec(&Some(5u32)).unwrap(), [1, 5, 0, 0, 0]);
        let err = decode_from_slice::<Option<u32>>(&[2]).unwrap_err();
        assert!(matches!(err, EncodingError::InvalidTag { tag: 2, .. }));
    }

    #[test]
    fn invalid_utf8_string() {
        let buf = [2, 0, 0, 0, 0xC3, 0x28];
        let err = decode_from_slice::<String>(&buf).unwrap_err();
        assert!(matches!(err, EncodingError::InvalidUtf8(_)));
    }

    // ----------------------------------------------------------------
    // Reader
    // ----------------------------------------------------------------

    #[test]
    fn reader_walks_composite_values() {
        let items = vec![
            Handle {
                offset: 0,
                size: 10,
                name: "filter".into(),
            },
            Handle {
                offset: 10,
                size: 99,
                name: "properties".into(),
            },
        ];
        let mut buf = Vec::new();
        encode_vec(&items, &mut buf).unwrap();
        7u8.encode_to(&mut buf).unwrap();

        let mut r = Reader::new(&buf);
        let decoded: Vec<Handle> = r.read_vec().unwrap();
        assert_eq!(decoded, items);
        assert!(!r.is_empty());
        assert_eq!(r.read::<u8>().unwrap(), 7);
        assert!(r.is_empty());
        assert_eq!(r.consumed(), buf.len());
    }

    #[test]
    fn reader_propagates_truncation() {
        let bytes = encode_to_vec(&Handle {
            offset: 1,
            size: 2,
            name: "index".into(),
        })
        .unwrap();
        let err = decode_from_slice::<Handle>(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, EncodingError::UnexpectedEof { .. }));
    }
}
