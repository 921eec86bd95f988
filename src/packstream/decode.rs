//! PackStream decoding: bytes → `Value`.
//!
//! Two layers share the same `Value` type. The `parse_*` functions are the
//! strict inspection subset used on client payloads (HELLO metadata, RUN and
//! BEGIN extra maps, SUCCESS metadata). `decode_value` is the slightly wider
//! recursive decoder used on server records by the query client, where
//! integers exceed the tiny range and nulls/booleans occur.
//!
//! Every decoder takes a byte slice and returns the decoded value together
//! with the number of bytes consumed.

use std::collections::HashMap;

use super::marker;
use crate::error::ProxyError;

/// A decoded PackStream value (supported subset).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    String(String),
    List(Vec<Value>),
    Map(HashMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

/// Parses a tiny-int: a single byte with the high bit clear.
pub fn parse_tiny_int(b: u8) -> Result<i64, ProxyError> {
    if b > 0x7F {
        return Err(ProxyError::UnsupportedEncoding(format!(
            "expected tiny-int, got marker 0x{b:02X}"
        )));
    }
    Ok(i64::from(b))
}

/// Parses a tiny-string: high nibble 0x8, low nibble is the byte length.
pub fn parse_tiny_string(buf: &[u8]) -> Result<(String, usize), ProxyError> {
    let m = *buf
        .first()
        .ok_or_else(|| ProxyError::Protocol("unexpected end of data".into()))?;
    if m >> 4 != marker::TINY_STRING_NIBBLE {
        return Err(ProxyError::UnsupportedEncoding(format!(
            "expected tiny-string, got marker 0x{m:02X}"
        )));
    }
    let size = (m & 0x0F) as usize;
    let data = take(buf, 1, size)?;
    Ok((utf8(data)?, size + 1))
}

/// Parses a sized string: high nibble 0xD, low nibble `k` selects a
/// `2^k`-byte big-endian length, then that many UTF-8 bytes.
pub fn parse_string(buf: &[u8]) -> Result<(String, usize), ProxyError> {
    let m = *buf
        .first()
        .ok_or_else(|| ProxyError::Protocol("unexpected end of data".into()))?;
    if m >> 4 != marker::STRING_NIBBLE {
        return Err(ProxyError::UnsupportedEncoding(format!(
            "expected string, got marker 0x{m:02X}"
        )));
    }

    let width = 1usize << (m & 0x0F);
    let len_bytes = take(buf, 1, width)?;
    let mut size: u64 = 0;
    for &b in len_bytes {
        size = size << 8 | u64::from(b);
    }
    let size = usize::try_from(size)
        .map_err(|_| ProxyError::Protocol(format!("string length {size} exceeds address space")))?;

    let pos = 1 + width;
    let data = take(buf, pos, size)?;
    Ok((utf8(data)?, pos + size))
}

/// Parses a tiny-array: high nibble 0x9, low nibble is the element count.
/// Elements are limited to tiny-int, tiny-string and string.
pub fn parse_tiny_array(buf: &[u8]) -> Result<(Vec<Value>, usize), ProxyError> {
    let m = *buf
        .first()
        .ok_or_else(|| ProxyError::Protocol("unexpected end of data".into()))?;
    if m >> 4 != marker::TINY_LIST_NIBBLE {
        return Err(ProxyError::UnsupportedEncoding(format!(
            "expected tiny-array, got marker 0x{m:02X}"
        )));
    }

    let size = (m & 0x0F) as usize;
    let mut array = Vec::with_capacity(size);
    let mut pos = 1;

    for _ in 0..size {
        let e = *buf
            .get(pos)
            .ok_or_else(|| ProxyError::Protocol("unexpected end of data".into()))?;
        match e >> 4 {
            0x0..=0x7 => {
                array.push(Value::Int(parse_tiny_int(e)?));
                pos += 1;
            }
            marker::TINY_STRING_NIBBLE => {
                let (val, n) = parse_tiny_string(&buf[pos..])?;
                array.push(Value::String(val));
                pos += n;
            }
            marker::STRING_NIBBLE => {
                let (val, n) = parse_string(&buf[pos..])?;
                array.push(Value::String(val));
                pos += n;
            }
            _ => {
                return Err(ProxyError::UnsupportedEncoding(format!(
                    "unsupported tiny-array element marker 0x{e:02X}"
                )));
            }
        }
    }

    Ok((array, pos))
}

/// Parses a tiny-map: high nibble 0xA, low nibble is the member count.
/// Keys are tiny-strings; values may be tiny-int, tiny-string, string,
/// tiny-array or a nested tiny-map.
pub fn parse_tiny_map(buf: &[u8]) -> Result<(HashMap<String, Value>, usize), ProxyError> {
    let m = *buf
        .first()
        .ok_or_else(|| ProxyError::Protocol("unexpected end of data".into()))?;
    if m >> 4 != marker::TINY_DICT_NIBBLE {
        return Err(ProxyError::UnsupportedEncoding(format!(
            "expected tiny-map, got marker 0x{m:02X}"
        )));
    }

    let members = (m & 0x0F) as usize;
    let mut map = HashMap::with_capacity(members);
    let mut pos = 1;

    for _ in 0..members {
        let (name, n) = parse_tiny_string(&buf[pos..])?;
        pos += n;

        let v = *buf
            .get(pos)
            .ok_or_else(|| ProxyError::Protocol("unexpected end of data".into()))?;
        match v >> 4 {
            0x0..=0x7 => {
                map.insert(name, Value::Int(parse_tiny_int(v)?));
                pos += 1;
            }
            marker::TINY_STRING_NIBBLE => {
                let (val, n) = parse_tiny_string(&buf[pos..])?;
                map.insert(name, Value::String(val));
                pos += n;
            }
            marker::TINY_LIST_NIBBLE => {
                let (val, n) = parse_tiny_array(&buf[pos..])?;
                map.insert(name, Value::List(val));
                pos += n;
            }
            marker::TINY_DICT_NIBBLE => {
                let (val, n) = parse_tiny_map(&buf[pos..])?;
                map.insert(name, Value::Map(val));
                pos += n;
            }
            marker::STRING_NIBBLE => {
                let (val, n) = parse_string(&buf[pos..])?;
                map.insert(name, Value::String(val));
                pos += n;
            }
            _ => {
                return Err(ProxyError::UnsupportedEncoding(format!(
                    "unsupported tiny-map value marker 0x{v:02X}"
                )));
            }
        }
    }

    Ok((map, pos))
}

/// Recursively decodes one value, accepting the wider subset produced by
/// real servers: null, booleans, all integer widths, sized strings, lists
/// and dictionaries. Floats, byte arrays and structures stay unsupported.
pub fn decode_value(buf: &[u8]) -> Result<(Value, usize), ProxyError> {
    let m = *buf
        .first()
        .ok_or_else(|| ProxyError::Protocol("unexpected end of data".into()))?;

    match m {
        marker::NULL => Ok((Value::Null, 1)),
        marker::FALSE => Ok((Value::Bool(false), 1)),
        marker::TRUE => Ok((Value::Bool(true), 1)),

        marker::INT_8 => {
            let b = take(buf, 1, 1)?;
            Ok((Value::Int(i64::from(b[0] as i8)), 2))
        }
        marker::INT_16 => {
            let b = take(buf, 1, 2)?;
            Ok((Value::Int(i64::from(i16::from_be_bytes([b[0], b[1]]))), 3))
        }
        marker::INT_32 => {
            let b = take(buf, 1, 4)?;
            let v = i32::from_be_bytes([b[0], b[1], b[2], b[3]]);
            Ok((Value::Int(i64::from(v)), 5))
        }
        marker::INT_64 => {
            let b = take(buf, 1, 8)?;
            let v = i64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]);
            Ok((Value::Int(v), 9))
        }

        marker::STRING_8 | marker::STRING_16 | marker::STRING_32 => {
            let (s, n) = parse_string(buf)?;
            Ok((Value::String(s), n))
        }

        marker::LIST_8 | marker::LIST_16 | marker::LIST_32 => {
            let (count, header) = sized_header(buf, m, marker::LIST_8)?;
            decode_list_items(buf, header, count)
        }

        marker::DICT_8 | marker::DICT_16 | marker::DICT_32 => {
            let (count, header) = sized_header(buf, m, marker::DICT_8)?;
            decode_dict_members(buf, header, count)
        }

        _ => match m >> 4 {
            0x0..=0x7 => Ok((Value::Int(i64::from(m)), 1)),
            0xF => Ok((Value::Int(i64::from(m as i8)), 1)),
            marker::TINY_STRING_NIBBLE => {
                let (s, n) = parse_tiny_string(buf)?;
                Ok((Value::String(s), n))
            }
            marker::STRING_NIBBLE => {
                let (s, n) = parse_string(buf)?;
                Ok((Value::String(s), n))
            }
            marker::TINY_LIST_NIBBLE => decode_list_items(buf, 1, (m & 0x0F) as usize),
            marker::TINY_DICT_NIBBLE => decode_dict_members(buf, 1, (m & 0x0F) as usize),
            _ => Err(ProxyError::UnsupportedEncoding(format!(
                "unsupported marker 0x{m:02X}"
            ))),
        },
    }
}

/// Reads the element count of a sized list/dict header. `base` is the
/// 1-byte-length marker of the family; wider markers follow consecutively.
fn sized_header(buf: &[u8], m: u8, base: u8) -> Result<(usize, usize), ProxyError> {
    let width = 1usize << (m - base);
    let len_bytes = take(buf, 1, width)?;
    let mut count: usize = 0;
    for &b in len_bytes {
        count = count << 8 | usize::from(b);
    }
    Ok((count, 1 + width))
}

fn decode_list_items(buf: &[u8], mut pos: usize, count: usize) -> Result<(Value, usize), ProxyError> {
    let mut items = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        let (v, n) = decode_value(&buf[pos.min(buf.len())..])?;
        items.push(v);
        pos += n;
    }
    Ok((Value::List(items), pos))
}

fn decode_dict_members(
    buf: &[u8],
    mut pos: usize,
    count: usize,
) -> Result<(Value, usize), ProxyError> {
    let mut map = HashMap::with_capacity(count.min(64));
    for _ in 0..count {
        let (key, n) = decode_value(&buf[pos.min(buf.len())..])?;
        pos += n;
        let key = match key {
            Value::String(s) => s,
            other => {
                return Err(ProxyError::Protocol(format!(
                    "dict key must be a string, got {other:?}"
                )));
            }
        };
        let (v, n) = decode_value(&buf[pos.min(buf.len())..])?;
        pos += n;
        map.insert(key, v);
    }
    Ok((Value::Map(map), pos))
}

fn take(buf: &[u8], pos: usize, len: usize) -> Result<&[u8], ProxyError> {
    buf.get(pos..pos + len)
        .ok_or_else(|| ProxyError::Protocol("unexpected end of data".into()))
}

fn utf8(data: &[u8]) -> Result<String, ProxyError> {
    String::from_utf8(data.to_vec())
        .map_err(|e| ProxyError::Protocol(format!("invalid UTF-8 string: {e}")))
}
