//! Bridge daemon request/response protocol
//!
//! # Wire Format
//!
//! Requests are ASCII commands prefixed by their length as four hex digits:
//!
//! ```text
//! ┌───────────────┬──────────────────────────┐
//! │ "0012"        │ "host:track-devices"     │
//! │ 4 hex digits  │ command (length bytes)   │
//! └───────────────┴──────────────────────────┘
//! ```
//!
//! Every request is answered by `OKAY`, or by `FAIL` followed by a
//! length-prefixed message. Streaming commands then deliver length-prefixed
//! blocks until the connection closes.

use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use std::io::{Read, Write};
use std::net::TcpStream;

/// Device list subscription
pub const TRACK_DEVICES: &str = "host:track-devices";

/// Process list subscription, sent after selecting a device
pub const TRACK_JDWP: &str = "track-jdwp";

const OKAY: &[u8; 4] = b"OKAY";
const FAIL: &[u8; 4] = b"FAIL";

/// Status line read after every request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdbResponse {
    Okay,
    Fail(String),
}

/// Frame a command for the daemon
pub fn form_request(command: &str) -> Vec<u8> {
    format!("{:04X}{}", command.len(), command).into_bytes()
}

/// Parse a 4-hex-digit length
pub fn parse_hex_length(digits: &[u8]) -> Result<usize> {
    if digits.len() != 4 || !digits.iter().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::MalformedLength(
            String::from_utf8_lossy(digits).into_owned(),
        ));
    }
    // All four bytes are ASCII hex digits at this point
    let text = std::str::from_utf8(digits)
        .map_err(|_| Error::MalformedLength(format!("{:?}", digits)))?;
    usize::from_str_radix(text, 16).map_err(|_| Error::MalformedLength(text.to_string()))
}

pub fn send_request<W: Write>(writer: &mut W, command: &str) -> Result<()> {
    log::trace!("Bridge request: {}", command);
    writer.write_all(&form_request(command))?;
    writer.flush()?;
    Ok(())
}

/// Read one `OKAY` / `FAIL <msg>` status
pub fn read_response<R: Read>(reader: &mut R) -> Result<AdbResponse> {
    let mut status = [0u8; 4];
    reader.read_exact(&mut status)?;

    match &status {
        OKAY => Ok(AdbResponse::Okay),
        FAIL => {
            let message = read_length_prefixed(reader)?;
            Ok(AdbResponse::Fail(String::from_utf8_lossy(&message).into_owned()))
        }
        other => Err(Error::UnexpectedResponse(
            String::from_utf8_lossy(other).into_owned(),
        )),
    }
}

/// Read a 4-hex-digit length followed by that many bytes
pub fn read_length_prefixed<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut digits = [0u8; 4];
    reader.read_exact(&mut digits)?;
    let len = parse_hex_length(&digits)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

/// Send a request and require `OKAY`
pub fn request_okay(stream: &mut TcpStream, command: &str) -> Result<()> {
    send_request(stream, command)?;
    match read_response(stream)? {
        AdbResponse::Okay => Ok(()),
        AdbResponse::Fail(message) => Err(Error::CommandRejected(format!(
            "{}: {}",
            command, message
        ))),
    }
}

/// Open a blocking connection to the daemon
pub fn connect(config: &BridgeConfig) -> Result<TcpStream> {
    let addr = config.socket_addr()?;
    let stream = TcpStream::connect_timeout(&addr, config.connect_timeout()).map_err(|e| {
        if e.kind() == std::io::ErrorKind::TimedOut {
            Error::Timeout
        } else {
            Error::Io(e)
        }
    })?;
    if let Err(e) = stream.set_nodelay(true) {
        log::debug!("Failed to set TCP_NODELAY: {}", e);
    }
    stream.set_read_timeout(Some(config.read_timeout()))?;
    Ok(stream)
}

/// Route the connection to one device
pub fn set_device(stream: &mut TcpStream, serial: &str) -> Result<()> {
    request_okay(stream, &format!("host:transport:{}", serial))
}

/// Open a connection streaming the device's debuggable process ids
pub fn open_jdwp_tracker(config: &BridgeConfig, serial: &str) -> Result<TcpStream> {
    let mut stream = connect(config)?;
    set_device(&mut stream, serial)?;
    request_okay(&mut stream, TRACK_JDWP)?;
    Ok(stream)
}

/// Open a pass-through connection to one process's debug socket
pub fn open_pass_through(config: &BridgeConfig, serial: &str, pid: u32) -> Result<TcpStream> {
    let mut stream = connect(config)?;
    set_device(&mut stream, serial)?;
    request_okay(&mut stream, &format!("jdwp:{}", pid))?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_form_request() {
        assert_eq!(form_request(TRACK_DEVICES), b"0012host:track-devices".to_vec());
        assert_eq!(form_request("track-jdwp"), b"000Atrack-jdwp".to_vec());
    }

    #[test]
    fn test_parse_hex_length() {
        assert_eq!(parse_hex_length(b"0000").unwrap(), 0);
        assert_eq!(parse_hex_length(b"001a").unwrap(), 26);
        assert_eq!(parse_hex_length(b"FFFF").unwrap(), 0xFFFF);
        assert!(matches!(parse_hex_length(b"00g1"), Err(Error::MalformedLength(_))));
        assert!(matches!(parse_hex_length(b"+001"), Err(Error::MalformedLength(_))));
        assert!(parse_hex_length(b"01").is_err());
    }

    #[test]
    fn test_read_okay() {
        let mut input = Cursor::new(b"OKAY".to_vec());
        assert_eq!(read_response(&mut input).unwrap(), AdbResponse::Okay);
    }

    #[test]
    fn test_read_fail_with_message() {
        let mut input = Cursor::new(b"FAIL0010device not found".to_vec());
        assert_eq!(
            read_response(&mut input).unwrap(),
            AdbResponse::Fail("device not found".to_string())
        );
    }

    #[test]
    fn test_read_unexpected_status() {
        let mut input = Cursor::new(b"WHAT".to_vec());
        assert!(matches!(
            read_response(&mut input),
            Err(Error::UnexpectedResponse(_))
        ));
    }

    #[test]
    fn test_read_length_prefixed_blocks() {
        let mut input = Cursor::new(b"000512345".to_vec());
        assert_eq!(read_length_prefixed(&mut input).unwrap(), b"12345".to_vec());

        let mut short = Cursor::new(b"0008abc".to_vec());
        assert!(matches!(read_length_prefixed(&mut short), Err(Error::Io(_))));
    }
}
