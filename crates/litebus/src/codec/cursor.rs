// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bounds-checked big-endian cursors for wire buffers.
//!
//! UBJSON carries all numeric payloads big-endian.

use super::{CodecError, CodecResult};

/// Generate read methods for primitive types.
///
/// Each generated method checks bounds, reads N big-endian bytes and
/// advances the offset.
macro_rules! impl_read_be {
    ($name:ident, $type:ty, $size:expr) => {
        pub fn $name(&mut self) -> CodecResult<$type> {
            if self.offset + $size > self.buffer.len() {
                return Err(CodecError::Truncated {
                    offset: self.offset,
                    needed: $size,
                });
            }
            let mut bytes = [0u8; $size];
            bytes.copy_from_slice(&self.buffer[self.offset..self.offset + $size]);
            self.offset += $size;
            Ok(<$type>::from_be_bytes(bytes))
        }
    };
}

/// Immutable read cursor over a received datagram or reassembled reply.
pub struct Cursor<'a> {
    buffer: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, offset: 0 }
    }

    impl_read_be!(read_u8, u8, 1);
    impl_read_be!(read_i8, i8, 1);
    impl_read_be!(read_i16, i16, 2);
    impl_read_be!(read_i32, i32, 4);
    impl_read_be!(read_i64, i64, 8);
    impl_read_be!(read_f32, f32, 4);
    impl_read_be!(read_f64, f64, 8);

    pub fn read_bytes(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        if self.offset + len > self.buffer.len() {
            return Err(CodecError::Truncated {
                offset: self.offset,
                needed: len,
            });
        }
        let slice = &self.buffer[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    /// Look at the next byte without consuming it.
    pub fn peek(&self) -> Option<u8> {
        self.buffer.get(self.offset).copied()
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn is_eof(&self) -> bool {
        self.offset >= self.buffer.len()
    }
}

/// Growable write cursor for encoding. Encoding never fails, so writers
/// return nothing.
pub struct Writer {
    buffer: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(cap),
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_i8(&mut self, value: i8) {
        self.buffer.push(value as u8);
    }

    pub fn write_i16(&mut self, value: i16) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_reads_big_endian() {
        let buf = [0x01, 0x02, 0x03, 0x04];
        let mut cursor = Cursor::new(&buf);
        assert_eq!(cursor.read_i16().expect("read i16 should succeed"), 0x0102);
        assert_eq!(cursor.read_i16().expect("read i16 should succeed"), 0x0304);
        assert!(cursor.is_eof());
    }

    #[test]
    fn test_cursor_truncation_reports_offset() {
        let buf = [0u8; 3];
        let mut cursor = Cursor::new(&buf);
        cursor.read_u8().expect("read u8 should succeed");
        let err = cursor.read_i32().unwrap_err();
        match err {
            CodecError::Truncated { offset, needed } => {
                assert_eq!(offset, 1);
                assert_eq!(needed, 4);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_writer_roundtrip_numeric_types() {
        let mut writer = Writer::new();
        writer.write_u8(0xAB);
        writer.write_i16(-2);
        writer.write_i32(0x1234_5678);
        writer.write_i64(-1);
        writer.write_f64(6.25);
        let buf = writer.into_inner();

        let mut cursor = Cursor::new(&buf);
        assert_eq!(cursor.read_u8().expect("u8"), 0xAB);
        assert_eq!(cursor.read_i16().expect("i16"), -2);
        assert_eq!(cursor.read_i32().expect("i32"), 0x1234_5678);
        assert_eq!(cursor.read_i64().expect("i64"), -1);
        assert!((cursor.read_f64().expect("f64") - 6.25).abs() < f64::EPSILON);
        assert!(cursor.is_eof());
    }

    #[test]
    fn test_peek_does_not_advance() {
        let buf = [0x42];
        let mut cursor = Cursor::new(&buf);
        assert_eq!(cursor.peek(), Some(0x42));
        assert_eq!(cursor.offset(), 0);
        assert_eq!(cursor.read_u8().expect("u8"), 0x42);
        assert_eq!(cursor.peek(), None);
    }
}
