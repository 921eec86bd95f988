//! Payload inspection: the few fields the proxy must read out of client and
//! server messages to route correctly.

use std::collections::HashMap;

use crate::error::ProxyError;
use crate::packstream::{parse_tiny_map, Value};

/// Whether a transaction touches a reader or a writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

/// Strips the length prefix and `00 00` terminator off a framed message.
fn payload(frame: &[u8]) -> Option<&[u8]> {
    if frame.len() < 4 {
        return None;
    }
    Some(&frame[2..frame.len() - 2])
}

/// Detects the transaction mode of a RUN or BEGIN frame.
///
/// The extra metadata map is the final field of both messages, so the frame
/// is scanned backwards for a tiny-map that consumes exactly the remaining
/// payload. `mode == "r"` selects READ; a missing key or absent map means
/// WRITE. Skipping the leading fields this way keeps arbitrary query
/// parameters (which may use encodings outside the supported subset) out of
/// the decoder's path.
pub fn transaction_mode(frame: &[u8]) -> AccessMode {
    let Some(payload) = payload(frame) else {
        return AccessMode::Write;
    };

    for pos in (0..payload.len()).rev() {
        if payload[pos] >> 4 != 0xA {
            continue;
        }
        if let Ok((map, n)) = parse_tiny_map(&payload[pos..]) {
            if pos + n == payload.len() {
                return match map.get("mode").and_then(Value::as_str) {
                    Some("r") => AccessMode::Read,
                    _ => AccessMode::Write,
                };
            }
        }
    }

    AccessMode::Write
}

/// Decodes the metadata map of a HELLO frame.
///
/// The map begins right after the struct marker and signature, at offset 4
/// of the framed bytes.
pub fn hello_metadata(frame: &[u8]) -> Result<HashMap<String, Value>, ProxyError> {
    if frame.len() < 5 {
        return Err(ProxyError::BadHello("frame too short".into()));
    }
    let (map, _) = parse_tiny_map(&frame[4..])
        .map_err(|e| ProxyError::BadHello(format!("unparseable metadata: {e}")))?;
    Ok(map)
}

/// Extracts the authenticating principal from a HELLO frame.
pub fn principal(frame: &[u8]) -> Result<String, ProxyError> {
    let meta = hello_metadata(frame)?;
    match meta.get("principal") {
        Some(Value::String(p)) => Ok(p.clone()),
        Some(_) => Err(ProxyError::BadHello("principal is not a string".into())),
        None => Err(ProxyError::BadHello("no principal in metadata".into())),
    }
}

/// The encoded form of a `bookmark` tiny-string map key.
const BOOKMARK_KEY: [u8; 9] = [0x88, b'b', b'o', b'o', b'k', b'm', b'a', b'r', b'k'];

/// Whether a SUCCESS frame's metadata carries a `bookmark` key, marking the
/// completion of a transaction.
///
/// Server SUCCESS metadata can include encodings outside the inspection
/// subset (timing integers, notification lists); when the map does not parse
/// the frame is scanned for the encoded key instead so completion is still
/// detected.
pub fn has_bookmark(frame: &[u8]) -> bool {
    if frame.len() < 5 {
        return false;
    }
    match parse_tiny_map(&frame[4..]) {
        Ok((map, _)) => map.contains_key("bookmark"),
        Err(_) => frame.windows(BOOKMARK_KEY.len()).any(|w| w == BOOKMARK_KEY),
    }
}
