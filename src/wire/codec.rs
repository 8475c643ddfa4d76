//! Tagged-value encoding and decoding for the data channel.
//!
//! This module implements the self-describing wire format shared with the
//! engine-side glue. It performs no I/O of its own beyond reading from the
//! supplied stream: encoding produces a byte buffer, decoding consumes
//! exactly one value and never reads past a declared length.
//!
//! # Wire Format
//!
//! ```text
//! value     := tag:i32 length:i32 payload
//! Logical   := elements as i32 (0 / 1 / INT_MIN for NA)
//! Integer   := elements as i32 (INT_MIN for NA)
//! Double    := elements as f64, then missingCount:i32 missingIndex:i32*
//! Character := per element: byteLength:i32 bytes  (negative length = NA)
//! Matrix    := rows:i32 cols:i32, then one nested value (row-major)
//! Unknown   := length counts diagnostic bytes, then the bytes
//! NotFound  := length is 0, no payload
//! ```
//!
//! All integers and floats use the byte order fixed at session creation.
//! A declared length above the configured ceiling is a protocol error, not
//! a truncation: the framing can no longer be trusted afterwards.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::Endian;
use crate::error::{RBridgeError, Result};
use crate::wire::value::{tag, RMatrix, RValue, NA_INTEGER};

/// Outcome of decoding one wire value.
///
/// `NotFound` and `Unknown` are control answers rather than data; the
/// facade maps them to `RValue::Missing` and `UnsupportedType`.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Value(RValue),
    NotFound,
    Unknown(String),
}

struct Encoder {
    buf: Vec<u8>,
    endian: Endian,
}

impl Encoder {
    fn put_i32(&mut self, v: i32) {
        match self.endian {
            Endian::Big => self.buf.extend_from_slice(&v.to_be_bytes()),
            Endian::Little => self.buf.extend_from_slice(&v.to_le_bytes()),
        }
    }

    fn put_f64(&mut self, v: f64) {
        match self.endian {
            Endian::Big => self.buf.extend_from_slice(&v.to_be_bytes()),
            Endian::Little => self.buf.extend_from_slice(&v.to_le_bytes()),
        }
    }
}

/// Encode one value for transmission.
///
/// The sender-side policy is applied first (scalar widening, integral
/// demotion, NA-sentinel promotion; see
/// [`RValue::normalized_for_wire`]), so the produced bytes always satisfy
/// the wire invariants regardless of the host representation passed in.
pub fn encode_value(value: &RValue, endian: Endian) -> Vec<u8> {
    let mut enc = Encoder {
        buf: Vec::new(),
        endian,
    };
    encode_normalized(&value.normalized_for_wire(), &mut enc);
    enc.buf
}

fn encode_normalized(value: &RValue, enc: &mut Encoder) {
    match value {
        RValue::Logical(v) => {
            enc.put_i32(tag::LOGICAL);
            enc.put_i32(v.len() as i32);
            for x in v {
                enc.put_i32(match x {
                    Some(true) => 1,
                    Some(false) => 0,
                    None => NA_INTEGER,
                });
            }
        }
        RValue::Integer(v) => {
            enc.put_i32(tag::INTEGER);
            enc.put_i32(v.len() as i32);
            for x in v {
                enc.put_i32(x.unwrap_or(NA_INTEGER));
            }
        }
        RValue::Double(v) => {
            enc.put_i32(tag::DOUBLE);
            enc.put_i32(v.len() as i32);
            for x in v {
                enc.put_f64(x.unwrap_or(f64::NAN));
            }
            let missing: Vec<i32> = v
                .iter()
                .enumerate()
                .filter(|(_, x)| x.is_none())
                .map(|(i, _)| i as i32)
                .collect();
            enc.put_i32(missing.len() as i32);
            for idx in missing {
                enc.put_i32(idx);
            }
        }
        RValue::Character(v) => {
            enc.put_i32(tag::CHARACTER);
            enc.put_i32(v.len() as i32);
            for s in v {
                match s {
                    Some(s) => {
                        let bytes = s.as_bytes();
                        enc.put_i32(bytes.len() as i32);
                        enc.buf.extend_from_slice(bytes);
                    }
                    None => enc.put_i32(-1),
                }
            }
        }
        RValue::Matrix(m) => {
            enc.put_i32(tag::MATRIX);
            enc.put_i32((m.rows() * m.cols()) as i32);
            enc.put_i32(m.rows() as i32);
            enc.put_i32(m.cols() as i32);
            encode_normalized(m.data(), enc);
        }
        // normalized_for_wire leaves no scalar or missing forms behind
        RValue::Bool(_) | RValue::Int(_) | RValue::Num(_) | RValue::Missing => {
            unreachable!("scalar forms are widened before encoding")
        }
    }
}

async fn read_i32<R>(reader: &mut R, endian: Endian) -> Result<i32>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes).await?;
    Ok(match endian {
        Endian::Big => i32::from_be_bytes(bytes),
        Endian::Little => i32::from_le_bytes(bytes),
    })
}

async fn read_f64<R>(reader: &mut R, endian: Endian) -> Result<f64>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = [0u8; 8];
    reader.read_exact(&mut bytes).await?;
    Ok(match endian {
        Endian::Big => f64::from_be_bytes(bytes),
        Endian::Little => f64::from_le_bytes(bytes),
    })
}

/// Validate a declared element or byte count against the sanity ceiling.
fn checked_len(declared: i32, max_len: usize, what: &str) -> Result<usize> {
    if declared < 0 {
        return Err(RBridgeError::Protocol(format!(
            "negative {what} length {declared}"
        )));
    }
    let len = declared as usize;
    if len > max_len {
        return Err(RBridgeError::Protocol(format!(
            "declared {what} length {len} exceeds ceiling {max_len}"
        )));
    }
    Ok(len)
}

/// Decode exactly one value from the stream.
///
/// Streaming: reads only the bytes the declared lengths call for. Unknown
/// tags and lengths above `max_len` are [`RBridgeError::Protocol`] — fatal
/// for the session, since the framing is untrustworthy afterwards.
pub async fn decode_value<R>(reader: &mut R, endian: Endian, max_len: usize) -> Result<Decoded>
where
    R: AsyncRead + Unpin,
{
    let tag_word = read_i32(reader, endian).await?;
    let declared = read_i32(reader, endian).await?;

    match tag_word {
        tag::NOT_FOUND => Ok(Decoded::NotFound),
        tag::UNKNOWN => {
            let len = checked_len(declared, max_len, "diagnostic")?;
            let mut bytes = vec![0u8; len];
            reader.read_exact(&mut bytes).await?;
            Ok(Decoded::Unknown(String::from_utf8_lossy(&bytes).into_owned()))
        }
        tag::LOGICAL => {
            let len = checked_len(declared, max_len, "vector")?;
            let mut v = Vec::with_capacity(len);
            for _ in 0..len {
                v.push(match read_i32(reader, endian).await? {
                    NA_INTEGER => None,
                    0 => Some(false),
                    _ => Some(true),
                });
            }
            Ok(Decoded::Value(RValue::Logical(v)))
        }
        tag::INTEGER => {
            let len = checked_len(declared, max_len, "vector")?;
            let mut v = Vec::with_capacity(len);
            for _ in 0..len {
                v.push(match read_i32(reader, endian).await? {
                    NA_INTEGER => None,
                    x => Some(x),
                });
            }
            Ok(Decoded::Value(RValue::Integer(v)))
        }
        tag::DOUBLE => {
            let len = checked_len(declared, max_len, "vector")?;
            let mut v: Vec<Option<f64>> = Vec::with_capacity(len);
            for _ in 0..len {
                v.push(Some(read_f64(reader, endian).await?));
            }
            let missing = checked_len(read_i32(reader, endian).await?, len, "missing-index")?;
            for _ in 0..missing {
                let idx = read_i32(reader, endian).await?;
                if idx < 0 || idx as usize >= len {
                    return Err(RBridgeError::Protocol(format!(
                        "missing index {idx} out of bounds for vector of {len}"
                    )));
                }
                v[idx as usize] = None;
            }
            Ok(Decoded::Value(RValue::Double(v)))
        }
        tag::CHARACTER => {
            let len = checked_len(declared, max_len, "vector")?;
            let mut v = Vec::with_capacity(len);
            for _ in 0..len {
                let byte_len = read_i32(reader, endian).await?;
                if byte_len < 0 {
                    v.push(None);
                    continue;
                }
                let byte_len = checked_len(byte_len, max_len, "string")?;
                let mut bytes = vec![0u8; byte_len];
                reader.read_exact(&mut bytes).await?;
                let s = String::from_utf8(bytes).map_err(|e| {
                    RBridgeError::Protocol(format!("string payload is not valid UTF-8: {e}"))
                })?;
                v.push(Some(s));
            }
            Ok(Decoded::Value(RValue::Character(v)))
        }
        tag::MATRIX => {
            let len = checked_len(declared, max_len, "matrix")?;
            let rows = checked_len(read_i32(reader, endian).await?, max_len, "matrix-rows")?;
            let cols = checked_len(read_i32(reader, endian).await?, max_len, "matrix-cols")?;
            if rows.checked_mul(cols) != Some(len) {
                return Err(RBridgeError::Protocol(format!(
                    "matrix extent {rows}x{cols} does not match declared length {len}"
                )));
            }
            let elements = match Box::pin(decode_value(reader, endian, max_len)).await? {
                Decoded::Value(v) => v,
                other => {
                    return Err(RBridgeError::Protocol(format!(
                        "matrix elements decoded to control answer {other:?}"
                    )))
                }
            };
            Ok(Decoded::Value(RValue::Matrix(RMatrix::new(
                rows, cols, elements,
            )?)))
        }
        other => Err(RBridgeError::Protocol(format!("unknown wire tag {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MAX: usize = 1 << 20;

    async fn roundtrip(value: RValue) -> Decoded {
        let bytes = encode_value(&value, Endian::Big);
        let mut cursor = bytes.as_slice();
        let decoded = decode_value(&mut cursor, Endian::Big, MAX)
            .await
            .expect("decode failed");
        assert!(cursor.is_empty(), "decoder left trailing bytes");
        decoded
    }

    fn be_i32(bytes: &[i32]) -> Vec<u8> {
        bytes.iter().flat_map(|v| v.to_be_bytes()).collect()
    }

    #[tokio::test]
    async fn test_logical_roundtrip_with_na() {
        let v = RValue::Logical(vec![Some(true), None, Some(false)]);
        assert_eq!(roundtrip(v.clone()).await, Decoded::Value(v));
    }

    #[tokio::test]
    async fn test_integer_roundtrip_with_na() {
        let v = RValue::Integer(vec![Some(1), None, Some(-3)]);
        assert_eq!(roundtrip(v.clone()).await, Decoded::Value(v));
    }

    #[tokio::test]
    async fn test_double_na_and_nan_are_distinct() {
        let v = RValue::Double(vec![Some(1.5), None, Some(f64::NAN), Some(3.0)]);
        let decoded = roundtrip(v).await;
        let Decoded::Value(RValue::Double(out)) = decoded else {
            panic!("expected double vector, got {decoded:?}");
        };
        assert_eq!(out[0], Some(1.5));
        assert_eq!(out[1], None);
        assert!(out[2].is_some_and(f64::is_nan));
        assert_eq!(out[3], Some(3.0));
    }

    #[tokio::test]
    async fn test_character_roundtrip_with_na_and_empty() {
        let v = RValue::Character(vec![
            Some("hello".to_string()),
            None,
            Some(String::new()),
            Some("naïve".to_string()),
        ]);
        assert_eq!(roundtrip(v.clone()).await, Decoded::Value(v));
    }

    #[tokio::test]
    async fn test_integral_doubles_travel_as_integer() {
        let bytes = encode_value(&RValue::from(vec![1.0, 2.0]), Endian::Big);
        assert_eq!(
            bytes,
            be_i32(&[tag::INTEGER, 2, 1, 2]),
            "integral doubles should demote on the wire"
        );
    }

    #[tokio::test]
    async fn test_sentinel_integer_travels_as_double() {
        let bytes = encode_value(&RValue::Integer(vec![Some(i32::MIN)]), Endian::Big);
        let mut cursor = bytes.as_slice();
        let tag_word = read_i32(&mut cursor, Endian::Big).await.unwrap();
        assert_eq!(tag_word, tag::DOUBLE);
    }

    #[tokio::test]
    async fn test_matrix_roundtrip() {
        let m = RMatrix::from_rows(vec![vec![1.5, 2.0, 3.0], vec![4.0, 5.0, 6.5]]).unwrap();
        let decoded = roundtrip(RValue::Matrix(m)).await;
        let Decoded::Value(RValue::Matrix(out)) = decoded else {
            panic!("expected matrix, got {decoded:?}");
        };
        assert_eq!(out.rows(), 2);
        assert_eq!(out.cols(), 3);
        assert_eq!(out.f64_at(0, 2), Some(3.0));
        assert_eq!(out.f64_at(1, 0), Some(4.0));
    }

    #[tokio::test]
    async fn test_not_found() {
        let bytes = be_i32(&[tag::NOT_FOUND, 0]);
        let mut cursor = bytes.as_slice();
        let decoded = decode_value(&mut cursor, Endian::Big, MAX).await.unwrap();
        assert_eq!(decoded, Decoded::NotFound);
    }

    #[tokio::test]
    async fn test_unknown_carries_diagnostic() {
        let diag = b"function";
        let mut bytes = be_i32(&[tag::UNKNOWN, diag.len() as i32]);
        bytes.extend_from_slice(diag);
        let mut cursor = bytes.as_slice();
        let decoded = decode_value(&mut cursor, Endian::Big, MAX).await.unwrap();
        assert_eq!(decoded, Decoded::Unknown("function".to_string()));
    }

    #[tokio::test]
    async fn test_unknown_tag_rejected() {
        let bytes = be_i32(&[99, 0]);
        let mut cursor = bytes.as_slice();
        let err = decode_value(&mut cursor, Endian::Big, MAX).await.unwrap_err();
        assert!(matches!(err, RBridgeError::Protocol(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_oversized_length_rejected_before_allocation() {
        let bytes = be_i32(&[tag::DOUBLE, i32::MAX]);
        let mut cursor = bytes.as_slice();
        let err = decode_value(&mut cursor, Endian::Big, MAX).await.unwrap_err();
        assert!(matches!(err, RBridgeError::Protocol(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_negative_length_rejected() {
        let bytes = be_i32(&[tag::INTEGER, -5]);
        let mut cursor = bytes.as_slice();
        let err = decode_value(&mut cursor, Endian::Big, MAX).await.unwrap_err();
        assert!(matches!(err, RBridgeError::Protocol(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_missing_index_out_of_bounds_rejected() {
        // One double, then a missing list claiming index 5.
        let mut bytes = be_i32(&[tag::DOUBLE, 1]);
        bytes.extend_from_slice(&1.0f64.to_be_bytes());
        bytes.extend_from_slice(&be_i32(&[1, 5]));
        let mut cursor = bytes.as_slice();
        let err = decode_value(&mut cursor, Endian::Big, MAX).await.unwrap_err();
        assert!(matches!(err, RBridgeError::Protocol(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_matrix_extent_mismatch_rejected() {
        let bytes = be_i32(&[tag::MATRIX, 5, 2, 3]);
        let mut cursor = bytes.as_slice();
        let err = decode_value(&mut cursor, Endian::Big, MAX).await.unwrap_err();
        assert!(matches!(err, RBridgeError::Protocol(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_truncated_stream_is_engine_closed() {
        let full = encode_value(&RValue::from(vec![1.5, 2.5]), Endian::Big);
        let mut cursor = &full[..full.len() - 3];
        let err = decode_value(&mut cursor, Endian::Big, MAX).await.unwrap_err();
        assert!(matches!(err, RBridgeError::EngineClosed(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_little_endian_roundtrip() {
        let v = RValue::Double(vec![Some(0.5), None]);
        let bytes = encode_value(&v, Endian::Little);
        assert_ne!(bytes, encode_value(&v, Endian::Big));
        let mut cursor = bytes.as_slice();
        let decoded = decode_value(&mut cursor, Endian::Little, MAX).await.unwrap();
        assert_eq!(decoded, Decoded::Value(v));
    }
}
