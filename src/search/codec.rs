//! Text to little-endian byte conversion for query values, and the
//! reverse rendering used for result display.

use thiserror::Error;

use super::types::ValueType;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("invalid value format: {0:?}")]
    InvalidFormat(String),
    #[error("value {text} out of range for {value_type}")]
    OutOfRange { text: String, value_type: ValueType },
    #[error("{0} queries are not implemented")]
    NotImplemented(ValueType),
    #[error("{0} is not a valid conversion target")]
    InvalidValueType(ValueType),
}

/// Encodes query text into the little-endian byte pattern scanned for.
///
/// Integer types accept the union of the signed and unsigned range for
/// their width. Qword tries a signed parse first, then an unsigned parse
/// reinterpreted as the same bits. String types encode with no terminator.
pub fn encode(text: &str, value_type: ValueType) -> Result<Vec<u8>, CodecError> {
    match value_type {
        ValueType::Byte => {
            let v = parse_ranged(text, -128, 255, value_type)?;
            Ok(vec![v as u8])
        }
        ValueType::Word => {
            let v = parse_ranged(text, -32768, 65535, value_type)?;
            Ok((v as u16).to_le_bytes().to_vec())
        }
        ValueType::Dword | ValueType::Xor => {
            let v = parse_ranged(text, -2147483648, 4294967295, value_type)?;
            Ok((v as u32).to_le_bytes().to_vec())
        }
        ValueType::Qword => {
            let trimmed = text.trim();
            if let Ok(v) = trimmed.parse::<i64>() {
                Ok(v.to_le_bytes().to_vec())
            } else if let Ok(v) = trimmed.parse::<u64>() {
                Ok(v.to_le_bytes().to_vec())
            } else {
                Err(CodecError::InvalidFormat(text.to_string()))
            }
        }
        ValueType::Float => {
            let v: f32 = text
                .trim()
                .parse()
                .map_err(|_| CodecError::InvalidFormat(text.to_string()))?;
            Ok(v.to_le_bytes().to_vec())
        }
        ValueType::Double => {
            let v: f64 = text
                .trim()
                .parse()
                .map_err(|_| CodecError::InvalidFormat(text.to_string()))?;
            Ok(v.to_le_bytes().to_vec())
        }
        ValueType::Utf8 => {
            if text.is_empty() {
                return Err(CodecError::InvalidFormat(text.to_string()));
            }
            Ok(text.as_bytes().to_vec())
        }
        ValueType::Utf16LE => {
            if text.is_empty() {
                return Err(CodecError::InvalidFormat(text.to_string()));
            }
            Ok(text.encode_utf16().flat_map(u16::to_le_bytes).collect())
        }
        ValueType::Hex | ValueType::HexMixed | ValueType::Arm | ValueType::Arm64 => {
            Err(CodecError::NotImplemented(value_type))
        }
        ValueType::Auto => Err(CodecError::InvalidValueType(value_type)),
    }
}

/// Renders stored bytes for display. Integers render signed, mirroring
/// how the client presents in-game values. Short input renders "N/A".
pub fn decode(bytes: &[u8], value_type: ValueType) -> String {
    match value_type {
        ValueType::Byte => {
            if !bytes.is_empty() {
                format!("{}", bytes[0] as i8)
            } else {
                "N/A".to_string()
            }
        }
        ValueType::Word => {
            if bytes.len() >= 2 {
                format!("{}", i16::from_le_bytes([bytes[0], bytes[1]]))
            } else {
                "N/A".to_string()
            }
        }
        ValueType::Dword | ValueType::Xor | ValueType::Auto => {
            if bytes.len() >= 4 {
                let value = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                format!("{}", value)
            } else {
                "N/A".to_string()
            }
        }
        ValueType::Qword => {
            if bytes.len() >= 8 {
                let value = i64::from_le_bytes([
                    bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
                ]);
                format!("{}", value)
            } else {
                "N/A".to_string()
            }
        }
        ValueType::Float => {
            if bytes.len() >= 4 {
                format!("{}", f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            } else {
                "N/A".to_string()
            }
        }
        ValueType::Double => {
            if bytes.len() >= 8 {
                let value = f64::from_le_bytes([
                    bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
                ]);
                format!("{}", value)
            } else {
                "N/A".to_string()
            }
        }
        ValueType::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        ValueType::Utf16LE => {
            let units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        ValueType::Hex | ValueType::HexMixed | ValueType::Arm | ValueType::Arm64 => {
            let parts: Vec<String> = bytes.iter().map(|b| format!("{:02X}", b)).collect();
            parts.join(" ")
        }
    }
}

fn parse_ranged(text: &str, min: i128, max: i128, value_type: ValueType) -> Result<i128, CodecError> {
    let v: i128 = text
        .trim()
        .parse()
        .map_err(|_| CodecError::InvalidFormat(text.to_string()))?;
    if v < min || v > max {
        return Err(CodecError::OutOfRange {
            text: text.trim().to_string(),
            value_type,
        });
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_range_acceptance() {
        assert_eq!(encode("255", ValueType::Byte).unwrap(), vec![0xFF]);
        assert_eq!(encode("-128", ValueType::Byte).unwrap(), vec![0x80]);
        assert_eq!(encode("-1", ValueType::Byte).unwrap(), vec![0xFF]);
        assert!(matches!(
            encode("256", ValueType::Byte),
            Err(CodecError::OutOfRange { .. })
        ));
        assert!(matches!(
            encode("-129", ValueType::Byte),
            Err(CodecError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_dword_range_acceptance() {
        assert_eq!(
            encode("4294967295", ValueType::Dword).unwrap(),
            vec![0xFF, 0xFF, 0xFF, 0xFF]
        );
        assert_eq!(
            encode("-2147483648", ValueType::Dword).unwrap(),
            vec![0x00, 0x00, 0x00, 0x80]
        );
        assert!(matches!(
            encode("4294967296", ValueType::Dword),
            Err(CodecError::OutOfRange { .. })
        ));
        assert!(matches!(
            encode("-2147483649", ValueType::Dword),
            Err(CodecError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_word_range_acceptance() {
        assert_eq!(encode("65535", ValueType::Word).unwrap(), vec![0xFF, 0xFF]);
        assert!(matches!(
            encode("65536", ValueType::Word),
            Err(CodecError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_qword_signed_then_unsigned() {
        assert_eq!(
            encode("-1", ValueType::Qword).unwrap(),
            vec![0xFF; 8]
        );
        // Above i64::MAX, falls through to the unsigned parse.
        assert_eq!(
            encode("18446744073709551615", ValueType::Qword).unwrap(),
            vec![0xFF; 8]
        );
        assert!(matches!(
            encode("18446744073709551616", ValueType::Qword),
            Err(CodecError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_float_encoding() {
        assert_eq!(
            encode("1.5", ValueType::Float).unwrap(),
            1.5f32.to_le_bytes().to_vec()
        );
        assert_eq!(
            encode("-0.25", ValueType::Double).unwrap(),
            (-0.25f64).to_le_bytes().to_vec()
        );
        assert!(matches!(
            encode("abc", ValueType::Float),
            Err(CodecError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_string_encoding() {
        assert_eq!(encode("abc", ValueType::Utf8).unwrap(), b"abc".to_vec());
        assert_eq!(
            encode("ab", ValueType::Utf16LE).unwrap(),
            vec![0x61, 0x00, 0x62, 0x00]
        );
        assert!(matches!(
            encode("", ValueType::Utf8),
            Err(CodecError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_reserved_types_rejected() {
        for vt in [ValueType::Hex, ValueType::HexMixed, ValueType::Arm, ValueType::Arm64] {
            assert!(matches!(encode("00 FF", vt), Err(CodecError::NotImplemented(_))));
        }
        assert!(matches!(
            encode("1000", ValueType::Auto),
            Err(CodecError::InvalidValueType(_))
        ));
    }

    #[test]
    fn test_round_trip_signed_range() {
        for (text, vt) in [
            ("-42", ValueType::Byte),
            ("1234", ValueType::Word),
            ("-100000", ValueType::Dword),
            ("1000", ValueType::Dword),
            ("-9223372036854775808", ValueType::Qword),
            ("9000000000", ValueType::Qword),
        ] {
            let bytes = encode(text, vt).unwrap();
            assert_eq!(decode(&bytes, vt), text, "{vt} round trip");
        }
        let bytes = encode("1.5", ValueType::Float).unwrap();
        assert_eq!(decode(&bytes, ValueType::Float), "1.5");
        let bytes = encode("hello", ValueType::Utf8).unwrap();
        assert_eq!(decode(&bytes, ValueType::Utf8), "hello");
        let bytes = encode("hello", ValueType::Utf16LE).unwrap();
        assert_eq!(decode(&bytes, ValueType::Utf16LE), "hello");
    }

    #[test]
    fn test_numeric_trimming() {
        assert_eq!(
            encode(" 1000 ", ValueType::Dword).unwrap(),
            encode("1000", ValueType::Dword).unwrap()
        );
    }

    #[test]
    fn test_decode_short_input() {
        assert_eq!(decode(&[0x01], ValueType::Dword), "N/A");
        assert_eq!(decode(&[], ValueType::Byte), "N/A");
    }

    #[test]
    fn test_decode_is_signed() {
        assert_eq!(decode(&[0xFF], ValueType::Byte), "-1");
        assert_eq!(decode(&[0xFF, 0xFF, 0xFF, 0xFF], ValueType::Dword), "-1");
    }
}
