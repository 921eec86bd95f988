//! Bolt message framing and identification.
//!
//! A `Message` carries the exact on-wire bytes of one framed message —
//! length prefix through the `00 00` terminator — so it can be forwarded
//! verbatim. Identification never decodes the payload; it dispatches on the
//! fixed signature-byte position.

pub mod inspect;
pub mod parse;

use bytes::Bytes;

pub use inspect::{has_bookmark, principal, transaction_mode, AccessMode};
pub use parse::parse;

/// Message signature bytes.
pub mod sig {
    // Client → Server
    pub const HELLO: u8 = 0x01;
    pub const GOODBYE: u8 = 0x02;
    pub const RESET: u8 = 0x0F;
    pub const RUN: u8 = 0x10;
    pub const BEGIN: u8 = 0x11;
    pub const COMMIT: u8 = 0x12;
    pub const ROLLBACK: u8 = 0x13;
    pub const DISCARD: u8 = 0x2F;
    pub const PULL: u8 = 0x3F;

    // Server → Client
    pub const SUCCESS: u8 = 0x70;
    pub const RECORD: u8 = 0x71;
    pub const IGNORE: u8 = 0x7E;
    pub const FAILURE: u8 = 0x7F;
}

/// The type of a Bolt message, plus sentinels for frames the proxy cannot
/// (or need not) classify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Reset,
    Run,
    Discard,
    Pull,
    Record,
    Success,
    Ignore,
    Failure,
    Hello,
    Goodbye,
    Begin,
    Commit,
    Rollback,
    /// Signature byte not in the dispatch table.
    Unknown,
    /// Frame too short to carry a signature (keep-alive).
    Nop,
    /// Non-terminal chunk fragment on the WebSocket path.
    Chunked,
}

impl MessageType {
    /// Maps a signature byte to its message type.
    pub fn from_byte(b: u8) -> Self {
        match b {
            sig::RESET => Self::Reset,
            sig::RUN => Self::Run,
            sig::DISCARD => Self::Discard,
            sig::PULL => Self::Pull,
            sig::RECORD => Self::Record,
            sig::SUCCESS => Self::Success,
            sig::IGNORE => Self::Ignore,
            sig::FAILURE => Self::Failure,
            sig::HELLO => Self::Hello,
            sig::GOODBYE => Self::Goodbye,
            sig::BEGIN => Self::Begin,
            sig::COMMIT => Self::Commit,
            sig::ROLLBACK => Self::Rollback,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reset => "RESET",
            Self::Run => "RUN",
            Self::Discard => "DISCARD",
            Self::Pull => "PULL",
            Self::Record => "RECORD",
            Self::Success => "SUCCESS",
            Self::Ignore => "IGNORE",
            Self::Failure => "FAILURE",
            Self::Hello => "HELLO",
            Self::Goodbye => "GOODBYE",
            Self::Begin => "BEGIN",
            Self::Commit => "COMMIT",
            Self::Rollback => "ROLLBACK",
            Self::Unknown => "?UNKNOWN?",
            Self::Nop => "NOP",
            Self::Chunked => "CHUNKED",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifies a complete framed message.
///
/// Frames shorter than 4 bytes are keep-alives. Small messages start with a
/// zero length-prefix byte, putting the signature at offset 3; larger ones
/// (in practice RECORDs) carry it at offset 2.
pub fn identify(buf: &[u8]) -> MessageType {
    if buf.len() < 4 {
        return MessageType::Nop;
    }
    if buf[0] == 0x00 {
        return MessageType::from_byte(buf[3]);
    }
    MessageType::from_byte(buf[2])
}

/// A decoded Bolt frame: its type and the exact on-wire bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageType,
    pub data: Bytes,
}

/// The fixed SUCCESS frame sent to a client after authentication succeeds:
/// `{server: "Neo4j/4.2.0", connection_id: "bolt-4"}`.
pub const POST_HELLO_SUCCESS: [u8; 47] = [
    0x00, 0x2B, 0xB1, 0x70, 0xA2, //
    0x86, b's', b'e', b'r', b'v', b'e', b'r', //
    0x8B, b'N', b'e', b'o', b'4', b'j', b'/', b'4', b'.', b'2', b'.', b'0', //
    0x8D, b'c', b'o', b'n', b'n', b'e', b'c', b't', b'i', b'o', b'n', b'_', b'i', b'd', //
    0x86, b'b', b'o', b'l', b't', b'-', b'4', //
    0x00, 0x00,
];

/// A SUCCESS frame with empty metadata.
pub const EMPTY_SUCCESS: [u8; 7] = [0x00, 0x03, 0xB1, 0x70, 0xA0, 0x00, 0x00];

impl Message {
    pub fn new(data: Bytes) -> Self {
        let kind = identify(&data);
        Self { kind, data }
    }

    /// The synthetic SUCCESS emitted after backend authentication.
    pub fn post_hello_success() -> Self {
        Self {
            kind: MessageType::Success,
            data: Bytes::from_static(&POST_HELLO_SUCCESS),
        }
    }

    /// A SUCCESS carrying no metadata, used to answer RESET between
    /// transactions when no backend is bound.
    pub fn empty_success() -> Self {
        Self {
            kind: MessageType::Success,
            data: Bytes::from_static(&EMPTY_SUCCESS),
        }
    }
}
