//! Greedy frame scanner for buffers holding zero or more Bolt messages.

use bytes::Bytes;

use super::{identify, Message};
use crate::error::ProxyError;

/// Scans `buf` for complete framed messages.
///
/// Returns the messages found plus the unconsumed tail — a trailing partial
/// frame (possibly just one byte of its length prefix) that the caller can
/// prepend to its next read. A frame whose declared length fits the buffer
/// but lacks the `00 00` suffix is malformed.
pub fn parse(buf: &[u8]) -> Result<(Vec<Message>, &[u8]), ProxyError> {
    let mut messages = Vec::new();
    let mut i = 0;

    while i < buf.len() {
        if i + 2 > buf.len() {
            break;
        }
        let msglen = u16::from_be_bytes([buf[i], buf[i + 1]]) as usize;
        if i + msglen + 4 > buf.len() {
            break;
        }

        let frame = &buf[i..i + msglen + 4];
        if !frame.ends_with(&[0x00, 0x00]) {
            return Err(ProxyError::MalformedFrame(format!(
                "missing 00 00 suffix at offset {i}"
            )));
        }

        messages.push(Message {
            kind: identify(frame),
            data: Bytes::copy_from_slice(frame),
        });
        i += frame.len();
    }

    Ok((messages, &buf[i..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    const RECORD: [u8; 8] = [0x00, 0x04, 0xB1, 0x71, 0x91, 0x01, 0x00, 0x00];
    const RESET: [u8; 7] = [0x00, 0x03, 0xB1, 0x0F, 0xA0, 0x00, 0x00];

    #[test]
    fn empty_buffer() {
        let (messages, tail) = parse(&[]).unwrap();
        assert!(messages.is_empty());
        assert!(tail.is_empty());
    }

    #[test]
    fn single_message() {
        let (messages, tail) = parse(&RECORD).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, MessageType::Record);
        assert_eq!(&messages[0].data[..], &RECORD);
        assert!(tail.is_empty());
    }

    #[test]
    fn concatenation_reproduces_input() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&RECORD);
        buf.extend_from_slice(&RESET);
        buf.extend_from_slice(&RECORD);

        let (messages, tail) = parse(&buf).unwrap();
        assert_eq!(messages.len(), 3);
        assert!(tail.is_empty());

        let mut rejoined = Vec::new();
        for m in &messages {
            // Every frame ends in the terminator and declares its own length.
            assert!(m.data.ends_with(&[0x00, 0x00]));
            let declared = u16::from_be_bytes([m.data[0], m.data[1]]) as usize;
            assert_eq!(declared + 4, m.data.len());
            rejoined.extend_from_slice(&m.data);
        }
        assert_eq!(rejoined, buf);
    }

    #[test]
    fn truncated_final_frame_becomes_tail() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&RECORD);
        buf.extend_from_slice(&RECORD[..5]);

        let (messages, tail) = parse(&buf).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(tail, &RECORD[..5]);
    }

    #[test]
    fn one_byte_tail() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&RESET);
        buf.push(0x00);

        let (messages, tail) = parse(&buf).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(tail, &[0x00]);
    }

    #[test]
    fn missing_suffix_is_malformed() {
        let buf = [0x00, 0x03, 0xB1, 0x0F, 0xA0, 0x00, 0x01];
        assert!(matches!(
            parse(&buf),
            Err(ProxyError::MalformedFrame(_))
        ));
    }
}
