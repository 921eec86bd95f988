//! Bolt handshake: magic preamble and version validation.
//!
//! The proxy does not negotiate freely: it pins the reply to Bolt 4.2 and
//! only checks that 4.2 is covered by one of the client's four proposals.

use crate::error::ProxyError;

/// Bolt magic preamble bytes.
pub const BOLT_MAGIC: [u8; 4] = [0x60, 0x60, 0xB0, 0x17];

/// First four bytes of an HTTP request line (`GET `), used to sniff
/// WebSocket upgrades on the shared listening port.
pub const HTTP_GET: [u8; 4] = [0x47, 0x45, 0x54, 0x20];

/// The version reply sent to every client and proposed to every backend:
/// Bolt 4.2, big-endian `[pad, range, minor, major]`.
pub const CHOSEN_VERSION: [u8; 4] = [0x00, 0x00, 0x02, 0x04];

/// Checks the 4-byte Bolt magic preamble.
pub fn validate_magic(magic: &[u8]) -> Result<(), ProxyError> {
    if magic == BOLT_MAGIC {
        Ok(())
    } else {
        Err(ProxyError::Protocol(format!(
            "invalid magic preamble: {magic:02X?}"
        )))
    }
}

/// Verifies that `chosen` is covered by one of the four 4-byte version
/// proposals and returns the server-style reply.
///
/// A proposal covers `chosen` when the major versions match and the chosen
/// minor falls within `minor - range ..= minor` of the proposal.
pub fn validate_handshake(proposals: &[u8; 16], chosen: &[u8; 4]) -> Result<[u8; 4], ProxyError> {
    let minor = chosen[2];
    let major = chosen[3];

    for p in proposals.chunks_exact(4) {
        if p[3] != major {
            continue;
        }
        let (p_range, p_minor) = (p[1], p[2]);
        if minor <= p_minor && minor >= p_minor.saturating_sub(p_range) {
            return Ok(*chosen);
        }
    }

    Err(ProxyError::Protocol(format!(
        "no client version proposal covers {chosen:02X?}"
    )))
}

/// Builds the 16-byte proposal block offered to backend servers: the pinned
/// version in slot 0, remaining slots empty.
pub fn backend_proposals() -> [u8; 16] {
    let mut proposals = [0u8; 16];
    proposals[..4].copy_from_slice(&CHOSEN_VERSION);
    proposals
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_accepted() {
        assert!(validate_magic(&BOLT_MAGIC).is_ok());
        assert!(validate_magic(&[0x60, 0x60, 0xB0, 0x18]).is_err());
    }

    #[test]
    fn handshake_exact_match() {
        // 4.2, 4.1, 4.0, 3.0 — the sequence a 4.2-era driver proposes.
        let proposals: [u8; 16] = [
            0x00, 0x00, 0x02, 0x04, //
            0x00, 0x00, 0x01, 0x04, //
            0x00, 0x00, 0x00, 0x04, //
            0x00, 0x00, 0x00, 0x03,
        ];
        assert_eq!(
            validate_handshake(&proposals, &CHOSEN_VERSION).unwrap(),
            CHOSEN_VERSION
        );
    }

    #[test]
    fn handshake_range_match() {
        // 4.4 with range 3 covers 4.4, 4.3, 4.2, 4.1.
        let mut proposals = [0u8; 16];
        proposals[1] = 3;
        proposals[2] = 4;
        proposals[3] = 4;
        assert_eq!(
            validate_handshake(&proposals, &CHOSEN_VERSION).unwrap(),
            CHOSEN_VERSION
        );
    }

    #[test]
    fn handshake_no_match() {
        // Client only speaks Bolt 5.
        let mut proposals = [0u8; 16];
        proposals[2] = 0;
        proposals[3] = 5;
        assert!(validate_handshake(&proposals, &CHOSEN_VERSION).is_err());
    }

    #[test]
    fn backend_proposals_pin_slot_zero() {
        let p = backend_proposals();
        assert_eq!(&p[..4], &CHOSEN_VERSION);
        assert!(p[4..].iter().all(|&b| b == 0));
    }
}
