//! JDWP handshake
//!
//! Both sides send the 14 ASCII bytes `JDWP-Handshake` before any packet.

use crate::error::Result;
use std::io::Write;

pub const HANDSHAKE: &[u8; 14] = b"JDWP-Handshake";

pub const HANDSHAKE_LEN: usize = HANDSHAKE.len();

/// Outcome of inspecting the start of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    Good,
    /// Prefix matches so far, more bytes needed
    Incomplete,
    Bad,
}

pub fn check_handshake(buf: &[u8]) -> HandshakeStatus {
    let n = buf.len().min(HANDSHAKE_LEN);
    if buf[..n] != HANDSHAKE[..n] {
        HandshakeStatus::Bad
    } else if n < HANDSHAKE_LEN {
        HandshakeStatus::Incomplete
    } else {
        HandshakeStatus::Good
    }
}

/// Write our half of the handshake
///
/// The peer's echo is read by the dispatch loop and checked with [`check_handshake`]
/// as bytes arrive.
pub fn send<W: Write>(writer: &mut W) -> Result<()> {
    writer.write_all(HANDSHAKE)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_handshake() {
        assert_eq!(check_handshake(b"JDWP-Handshake"), HandshakeStatus::Good);
        assert_eq!(check_handshake(b"JDWP-Handshake\0\0\0"), HandshakeStatus::Good);
        assert_eq!(check_handshake(b"JDWP-"), HandshakeStatus::Incomplete);
        assert_eq!(check_handshake(b""), HandshakeStatus::Incomplete);
        assert_eq!(check_handshake(b"JDWX"), HandshakeStatus::Bad);
    }

    #[test]
    fn test_send_writes_magic() {
        let mut out = Vec::new();
        send(&mut out).unwrap();
        assert_eq!(out, HANDSHAKE);
        assert_eq!(check_handshake(&out), HandshakeStatus::Good);
    }
}
