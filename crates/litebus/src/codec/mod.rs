// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UBJSON wire codec.
//!
//! Requests and replies travel as UBJSON maps. The encoder is constrained to
//! the exact dialect the existing clients speak:
//!
//! - integers use the smallest of `i`/`U`/`I`/`l`/`L`
//! - floats always encode as `D` (float64)
//! - object keys are bare length-prefixed strings (no `S` marker)
//! - byte payloads encode as the strongly-typed array `[$U#<count><raw>`
//!   with no closing `]`
//!
//! The decoder is more liberal: it also accepts `d` (float32), `C` (char),
//! `N` (no-op), `H` (high-precision number) and optimized `$`/`#` container
//! headers on both arrays and objects.

pub mod cursor;

use cursor::{Cursor, Writer};

/// Containers deeper than this are rejected; datagrams come from the network.
const MAX_DEPTH: usize = 64;

/// Decode failures, with the buffer offset where decoding stopped.
#[derive(Debug)]
pub enum CodecError {
    /// Buffer ended before `needed` more bytes at `offset`.
    Truncated { offset: usize, needed: usize },
    /// Unknown or misplaced type marker.
    BadMarker { offset: usize, marker: u8 },
    /// Negative or absurd length field.
    BadLength { offset: usize },
    /// String payload is not UTF-8.
    BadUtf8 { offset: usize },
    /// Container nesting exceeded [`MAX_DEPTH`].
    TooDeep,
}

pub type CodecResult<T> = std::result::Result<T, CodecError>;

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Truncated { offset, needed } => {
                write!(f, "truncated at offset {offset} (need {needed} more bytes)")
            }
            CodecError::BadMarker { offset, marker } => {
                write!(f, "bad marker 0x{marker:02x} at offset {offset}")
            }
            CodecError::BadLength { offset } => write!(f, "bad length at offset {offset}"),
            CodecError::BadUtf8 { offset } => write!(f, "invalid UTF-8 at offset {offset}"),
            CodecError::TooDeep => write!(f, "container nesting too deep"),
        }
    }
}

impl std::error::Error for CodecError {}

/// One UBJSON value.
///
/// Objects preserve key order; wildcard parameter expansion relies on the
/// device's declaration order surviving the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Object(Vec<(String, Value)>),
}

impl Value {
    /// Key lookup on an object; `None` for other variants.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(pairs) => pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view: integers widen to f64.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(x) => Some(*x),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_object(&self) -> Option<&[(String, Value)]> {
        match self {
            Value::Object(pairs) => Some(pairs),
            _ => None,
        }
    }

    /// Build an object from pairs; a thin constructor to keep call sites flat.
    #[must_use]
    pub fn object(pairs: Vec<(String, Value)>) -> Self {
        Value::Object(pairs)
    }

    #[must_use]
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }
}

// ===== Encoding =====

/// Encode a value into a fresh UBJSON buffer.
#[must_use]
pub fn encode(value: &Value) -> Vec<u8> {
    let mut writer = Writer::with_capacity(estimate(value));
    encode_into(value, &mut writer);
    writer.into_inner()
}

fn estimate(value: &Value) -> usize {
    match value {
        Value::Bytes(b) => b.len() + 16,
        Value::Str(s) => s.len() + 8,
        Value::Array(items) => 2 + items.iter().map(estimate).sum::<usize>(),
        Value::Object(pairs) => {
            2 + pairs
                .iter()
                .map(|(k, v)| k.len() + 8 + estimate(v))
                .sum::<usize>()
        }
        _ => 16,
    }
}

fn encode_into(value: &Value, w: &mut Writer) {
    match value {
        Value::Null => w.write_u8(b'Z'),
        Value::Bool(true) => w.write_u8(b'T'),
        Value::Bool(false) => w.write_u8(b'F'),
        Value::Int(i) => encode_int(*i, w),
        Value::Float(x) => {
            w.write_u8(b'D');
            w.write_f64(*x);
        }
        Value::Str(s) => {
            w.write_u8(b'S');
            encode_int(s.len() as i64, w);
            w.write_bytes(s.as_bytes());
        }
        Value::Bytes(b) => {
            // Strongly-typed uint8 array, count-terminated: no closing ']'.
            w.write_bytes(b"[$U#");
            encode_int(b.len() as i64, w);
            w.write_bytes(b);
        }
        Value::Array(items) => {
            w.write_u8(b'[');
            for item in items {
                encode_into(item, w);
            }
            w.write_u8(b']');
        }
        Value::Object(pairs) => {
            w.write_u8(b'{');
            for (key, item) in pairs {
                encode_int(key.len() as i64, w);
                w.write_bytes(key.as_bytes());
                encode_into(item, w);
            }
            w.write_u8(b'}');
        }
    }
}

fn encode_int(i: i64, w: &mut Writer) {
    if (-128..=127).contains(&i) {
        w.write_u8(b'i');
        w.write_i8(i as i8);
    } else if (128..=255).contains(&i) {
        w.write_u8(b'U');
        w.write_u8(i as u8);
    } else if (-32768..=32767).contains(&i) {
        w.write_u8(b'I');
        w.write_i16(i as i16);
    } else if (i64::from(i32::MIN)..=i64::from(i32::MAX)).contains(&i) {
        w.write_u8(b'l');
        w.write_i32(i as i32);
    } else {
        w.write_u8(b'L');
        w.write_i64(i);
    }
}

// ===== Decoding =====

/// Decode one value from a buffer. Trailing bytes are not an error; requests
/// arrive padded to no particular boundary.
pub fn decode(buf: &[u8]) -> CodecResult<Value> {
    let mut cursor = Cursor::new(buf);
    let marker = next_marker(&mut cursor)?;
    decode_value(marker, &mut cursor, 0)
}

/// Skip `N` no-op markers and return the next real marker.
fn next_marker(cursor: &mut Cursor<'_>) -> CodecResult<u8> {
    loop {
        let m = cursor.read_u8()?;
        if m != b'N' {
            return Ok(m);
        }
    }
}

fn decode_value(marker: u8, cursor: &mut Cursor<'_>, depth: usize) -> CodecResult<Value> {
    if depth > MAX_DEPTH {
        return Err(CodecError::TooDeep);
    }
    match marker {
        b'Z' => Ok(Value::Null),
        b'T' => Ok(Value::Bool(true)),
        b'F' => Ok(Value::Bool(false)),
        b'i' => Ok(Value::Int(i64::from(cursor.read_i8()?))),
        b'U' => Ok(Value::Int(i64::from(cursor.read_u8()?))),
        b'I' => Ok(Value::Int(i64::from(cursor.read_i16()?))),
        b'l' => Ok(Value::Int(i64::from(cursor.read_i32()?))),
        b'L' => Ok(Value::Int(cursor.read_i64()?)),
        b'd' => Ok(Value::Float(f64::from(cursor.read_f32()?))),
        b'D' => Ok(Value::Float(cursor.read_f64()?)),
        b'C' => {
            let c = cursor.read_u8()?;
            Ok(Value::Str((c as char).to_string()))
        }
        b'H' | b'S' => {
            let offset = cursor.offset();
            let len = decode_length(cursor)?;
            let bytes = cursor.read_bytes(len)?;
            let s = std::str::from_utf8(bytes)
                .map_err(|_| CodecError::BadUtf8 { offset })?
                .to_string();
            if marker == b'H' {
                // High-precision numbers are decimal strings; surface as float.
                match s.parse::<f64>() {
                    Ok(x) => Ok(Value::Float(x)),
                    Err(_) => Err(CodecError::BadLength { offset }),
                }
            } else {
                Ok(Value::Str(s))
            }
        }
        b'[' => decode_array(cursor, depth),
        b'{' => decode_object(cursor, depth),
        other => Err(CodecError::BadMarker {
            offset: cursor.offset().saturating_sub(1),
            marker: other,
        }),
    }
}

/// Decode an integer length field (any integer marker, non-negative).
fn decode_length(cursor: &mut Cursor<'_>) -> CodecResult<usize> {
    let offset = cursor.offset();
    let marker = next_marker(cursor)?;
    let len = match marker {
        b'i' => i64::from(cursor.read_i8()?),
        b'U' => i64::from(cursor.read_u8()?),
        b'I' => i64::from(cursor.read_i16()?),
        b'l' => i64::from(cursor.read_i32()?),
        b'L' => cursor.read_i64()?,
        marker => return Err(CodecError::BadMarker { offset, marker }),
    };
    usize::try_from(len).map_err(|_| CodecError::BadLength { offset })
}

/// Optimized container header: optional `$` element type, optional `#` count.
/// A `$` without a `#` is invalid per the UBJSON spec.
fn container_header(cursor: &mut Cursor<'_>) -> CodecResult<(Option<u8>, Option<usize>)> {
    let mut elem_type = None;
    if cursor.peek() == Some(b'$') {
        cursor.read_u8()?;
        elem_type = Some(cursor.read_u8()?);
    }
    let mut count = None;
    if cursor.peek() == Some(b'#') {
        cursor.read_u8()?;
        count = Some(decode_length(cursor)?);
    }
    if elem_type.is_some() && count.is_none() {
        return Err(CodecError::BadLength {
            offset: cursor.offset(),
        });
    }
    Ok((elem_type, count))
}

fn decode_array(cursor: &mut Cursor<'_>, depth: usize) -> CodecResult<Value> {
    let (elem_type, count) = container_header(cursor)?;
    match (elem_type, count) {
        (Some(b'U'), Some(n)) => {
            // The byte-payload fast path used by array-valued parameters.
            Ok(Value::Bytes(cursor.read_bytes(n)?.to_vec()))
        }
        (Some(marker), Some(n)) => {
            let mut items = Vec::with_capacity(n.min(4096));
            for _ in 0..n {
                items.push(decode_value(marker, cursor, depth + 1)?);
            }
            Ok(Value::Array(items))
        }
        (None, Some(n)) => {
            let mut items = Vec::with_capacity(n.min(4096));
            for _ in 0..n {
                let marker = next_marker(cursor)?;
                items.push(decode_value(marker, cursor, depth + 1)?);
            }
            Ok(Value::Array(items))
        }
        (None, None) => {
            let mut items = Vec::new();
            loop {
                let marker = next_marker(cursor)?;
                if marker == b']' {
                    return Ok(Value::Array(items));
                }
                items.push(decode_value(marker, cursor, depth + 1)?);
            }
        }
        (Some(_), None) => unreachable!("container_header rejects type without count"),
    }
}

fn decode_object(cursor: &mut Cursor<'_>, depth: usize) -> CodecResult<Value> {
    let (elem_type, count) = container_header(cursor)?;
    let mut pairs = Vec::new();
    match count {
        Some(n) => {
            for _ in 0..n {
                let key = decode_key(cursor)?;
                let marker = match elem_type {
                    Some(m) => m,
                    None => next_marker(cursor)?,
                };
                pairs.push((key, decode_value(marker, cursor, depth + 1)?));
            }
            Ok(Value::Object(pairs))
        }
        None => loop {
            if cursor.peek() == Some(b'}') {
                cursor.read_u8()?;
                return Ok(Value::Object(pairs));
            }
            let key = decode_key(cursor)?;
            let marker = next_marker(cursor)?;
            pairs.push((key, decode_value(marker, cursor, depth + 1)?));
        },
    }
}

fn decode_key(cursor: &mut Cursor<'_>) -> CodecResult<String> {
    let offset = cursor.offset();
    let len = decode_length(cursor)?;
    let bytes = cursor.read_bytes(len)?;
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|_| CodecError::BadUtf8 { offset })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: Value) -> Value {
        decode(&encode(&value)).expect("decode of encoded value should succeed")
    }

    #[test]
    fn test_roundtrip_scalars() {
        assert_eq!(roundtrip(Value::Null), Value::Null);
        assert_eq!(roundtrip(Value::Bool(true)), Value::Bool(true));
        assert_eq!(roundtrip(Value::Bool(false)), Value::Bool(false));
        assert_eq!(roundtrip(Value::Int(0)), Value::Int(0));
        assert_eq!(roundtrip(Value::Int(-5)), Value::Int(-5));
        assert_eq!(roundtrip(Value::Int(200)), Value::Int(200));
        assert_eq!(roundtrip(Value::Int(30000)), Value::Int(30000));
        assert_eq!(roundtrip(Value::Int(1 << 20)), Value::Int(1 << 20));
        assert_eq!(roundtrip(Value::Int(1 << 40)), Value::Int(1 << 40));
        assert_eq!(roundtrip(Value::Float(1.5)), Value::Float(1.5));
        assert_eq!(roundtrip(Value::str("frequency")), Value::str("frequency"));
    }

    #[test]
    fn test_int_markers_are_smallest() {
        assert_eq!(encode(&Value::Int(5))[0], b'i');
        assert_eq!(encode(&Value::Int(-5))[0], b'i');
        assert_eq!(encode(&Value::Int(200))[0], b'U');
        assert_eq!(encode(&Value::Int(300))[0], b'I');
        assert_eq!(encode(&Value::Int(70000))[0], b'l');
        assert_eq!(encode(&Value::Int(1 << 40))[0], b'L');
    }

    #[test]
    fn test_float_encodes_as_float64() {
        let buf = encode(&Value::Float(1.0));
        assert_eq!(buf[0], b'D');
        assert_eq!(buf.len(), 9);
    }

    #[test]
    fn test_bytes_encode_as_typed_uint8_array() {
        let buf = encode(&Value::Bytes(vec![1, 2, 3]));
        assert_eq!(&buf[..4], b"[$U#");
        assert_eq!(buf[4], b'i');
        assert_eq!(buf[5], 3);
        assert_eq!(&buf[6..], &[1, 2, 3]);
        assert_eq!(roundtrip(Value::Bytes(vec![1, 2, 3])), Value::Bytes(vec![1, 2, 3]));
    }

    #[test]
    fn test_large_bytes_roundtrip() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(roundtrip(Value::Bytes(data.clone())), Value::Bytes(data));
    }

    #[test]
    fn test_object_preserves_key_order() {
        let obj = Value::object(vec![
            ("zeta".to_string(), Value::Int(1)),
            ("alpha".to_string(), Value::Int(2)),
            ("mid".to_string(), Value::str("x")),
        ]);
        let back = roundtrip(obj.clone());
        assert_eq!(back, obj);
        let keys: Vec<&str> = back
            .as_object()
            .expect("object expected")
            .iter()
            .map(|(k, _)| k.as_str())
            .collect();
        assert_eq!(keys, ["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_nested_request_shape_roundtrip() {
        // The exact shape of a get request.
        let request = Value::object(vec![
            (
                "cmd".to_string(),
                Value::Array(vec![
                    Value::str("get"),
                    Value::Array(vec![Value::Array(vec![
                        Value::str("h:dev1"),
                        Value::Array(vec![Value::Array(vec![Value::str("frequency")])]),
                    ])]),
                ]),
            ),
            ("username".to_string(), Value::str("op")),
            ("program".to_string(), Value::str("test")),
            ("pid".to_string(), Value::Int(4242)),
        ]);
        assert_eq!(roundtrip(request.clone()), request);
    }

    #[test]
    fn test_decode_float32_and_char() {
        // d marker: float32 2.0
        let buf = [b'd', 0x40, 0x00, 0x00, 0x00];
        assert_eq!(decode(&buf).expect("decode d"), Value::Float(2.0));
        let buf = [b'C', b'x'];
        assert_eq!(decode(&buf).expect("decode C"), Value::Str("x".to_string()));
    }

    #[test]
    fn test_decode_noop_markers_skipped() {
        let buf = [b'N', b'N', b'T'];
        assert_eq!(decode(&buf).expect("decode with noops"), Value::Bool(true));
    }

    #[test]
    fn test_decode_count_only_array() {
        // [#i2 i1 i2
        let buf = [b'[', b'#', b'i', 2, b'i', 1, b'i', 2];
        assert_eq!(
            decode(&buf).expect("count-only array"),
            Value::Array(vec![Value::Int(1), Value::Int(2)])
        );
    }

    #[test]
    fn test_decode_typed_int_array() {
        // [$i#i3 1 2 3
        let buf = [b'[', b'$', b'i', b'#', b'i', 3, 1, 2, 3];
        assert_eq!(
            decode(&buf).expect("typed array"),
            Value::Array(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode(b"\x01\x02").is_err());
        assert!(decode(b"").is_err());
        // String with length pointing past the buffer.
        assert!(decode(&[b'S', b'i', 10, b'a']).is_err());
    }

    #[test]
    fn test_decode_rejects_unterminated_object() {
        let mut buf = encode(&Value::object(vec![("k".to_string(), Value::Int(1))]));
        buf.pop();
        assert!(decode(&buf).is_err());
    }

    #[test]
    fn test_depth_limit() {
        let mut buf = Vec::new();
        for _ in 0..200 {
            buf.push(b'[');
        }
        assert!(matches!(decode(&buf), Err(CodecError::TooDeep) | Err(CodecError::Truncated { .. })));
    }
}
