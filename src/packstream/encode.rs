//! PackStream encoding: `Value` → bytes.
//!
//! Only the subset the outbound query client needs. Integers use the
//! smallest representation, matching what servers expect.

use bytes::{BufMut, BytesMut};

use super::decode::Value;
use super::marker;

/// Encodes a `Value` into the buffer using PackStream format.
pub fn encode_value(buf: &mut BytesMut, value: &Value) {
    match value {
        Value::Null => buf.put_u8(marker::NULL),
        Value::Bool(b) => buf.put_u8(if *b { marker::TRUE } else { marker::FALSE }),
        Value::Int(i) => encode_int(buf, *i),
        Value::String(s) => encode_string(buf, s),
        Value::List(items) => {
            encode_list_header(buf, items.len());
            for item in items {
                encode_value(buf, item);
            }
        }
        Value::Map(map) => {
            encode_map_header(buf, map.len());
            for (key, val) in map {
                encode_string(buf, key);
                encode_value(buf, val);
            }
        }
    }
}

/// Encodes an integer using the smallest possible PackStream representation.
pub fn encode_int(buf: &mut BytesMut, value: i64) {
    if (-16..=127).contains(&value) {
        buf.put_u8(value as u8);
    } else if i64::from(i8::MIN) <= value && value <= i64::from(i8::MAX) {
        buf.put_u8(marker::INT_8);
        buf.put_i8(value as i8);
    } else if i64::from(i16::MIN) <= value && value <= i64::from(i16::MAX) {
        buf.put_u8(marker::INT_16);
        buf.put_i16(value as i16);
    } else if i64::from(i32::MIN) <= value && value <= i64::from(i32::MAX) {
        buf.put_u8(marker::INT_32);
        buf.put_i32(value as i32);
    } else {
        buf.put_u8(marker::INT_64);
        buf.put_i64(value);
    }
}

/// Encodes a string (size = byte length, not char count).
pub fn encode_string(buf: &mut BytesMut, value: &str) {
    let len = value.len();
    if len <= 15 {
        buf.put_u8(marker::TINY_STRING_NIBBLE << 4 | len as u8);
    } else if len <= 255 {
        buf.put_u8(marker::STRING_8);
        buf.put_u8(len as u8);
    } else if len <= 65535 {
        buf.put_u8(marker::STRING_16);
        buf.put_u16(len as u16);
    } else {
        buf.put_u8(marker::STRING_32);
        buf.put_u32(len as u32);
    }
    buf.put_slice(value.as_bytes());
}

fn encode_list_header(buf: &mut BytesMut, len: usize) {
    if len <= 15 {
        buf.put_u8(marker::TINY_LIST_NIBBLE << 4 | len as u8);
    } else if len <= 255 {
        buf.put_u8(marker::LIST_8);
        buf.put_u8(len as u8);
    } else if len <= 65535 {
        buf.put_u8(marker::LIST_16);
        buf.put_u16(len as u16);
    } else {
        buf.put_u8(marker::LIST_32);
        buf.put_u32(len as u32);
    }
}

fn encode_map_header(buf: &mut BytesMut, len: usize) {
    if len <= 15 {
        buf.put_u8(marker::TINY_DICT_NIBBLE << 4 | len as u8);
    } else if len <= 255 {
        buf.put_u8(marker::DICT_8);
        buf.put_u8(len as u8);
    } else if len <= 65535 {
        buf.put_u8(marker::DICT_16);
        buf.put_u16(len as u16);
    } else {
        buf.put_u8(marker::DICT_32);
        buf.put_u32(len as u32);
    }
}

/// Encodes a structure header: marker byte (0xBn) + signature byte.
pub fn encode_struct_header(buf: &mut BytesMut, signature: u8, field_count: usize) {
    debug_assert!(field_count <= 15, "struct field count must be <= 15");
    buf.put_u8(marker::TINY_STRUCT_NIBBLE << 4 | field_count as u8);
    buf.put_u8(signature);
}
