//! Emulator console AVD name query
//!
//! The console listens on `127.0.0.1:<port>` where `<port>` is the numeric
//! suffix of the `emulator-<port>` serial. After its banner (terminated by an
//! `OK` line) the command `avd name` answers with the name and another `OK`.

use crate::core::listener::EmulatorConsole;
use crate::error::{Error, Result};
use std::io::{BufRead, BufReader, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::time::Duration;

const EMULATOR_PREFIX: &str = "emulator-";

/// Console port of an emulator serial
pub fn console_port(serial: &str) -> Option<u16> {
    serial.strip_prefix(EMULATOR_PREFIX)?.parse().ok()
}

pub fn is_emulator(serial: &str) -> bool {
    serial.starts_with(EMULATOR_PREFIX)
}

/// Console client over TCP
pub struct TcpEmulatorConsole {
    timeout: Duration,
}

impl TcpEmulatorConsole {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Ask the console at `addr` for its AVD name
    pub fn query(&self, addr: SocketAddr) -> Result<Option<String>> {
        let stream = TcpStream::connect_timeout(&addr, self.timeout)?;
        stream.set_read_timeout(Some(self.timeout))?;
        let mut writer = stream.try_clone()?;
        let mut reader = BufReader::new(stream);

        // Banner
        loop {
            let line = read_line(&mut reader)?;
            if line == "OK" {
                break;
            }
            if line.starts_with("KO") {
                return Ok(None);
            }
        }

        writer.write_all(b"avd name\r\n")?;
        writer.flush()?;

        let name = read_line(&mut reader)?;
        if name.starts_with("KO") {
            return Ok(None);
        }
        let status = read_line(&mut reader)?;
        if status != "OK" {
            log::debug!("Unexpected console status after avd name: {}", status);
            return Ok(None);
        }
        Ok(Some(name))
    }
}

fn read_line(reader: &mut BufReader<TcpStream>) -> Result<String> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(Error::ConnectionClosed);
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

impl EmulatorConsole for TcpEmulatorConsole {
    fn avd_name(&self, serial: &str) -> Option<String> {
        let port = console_port(serial)?;
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        match self.query(addr) {
            Ok(name) => name,
            Err(e) => {
                log::debug!("Emulator console query for {} failed: {}", serial, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_console_port() {
        assert_eq!(console_port("emulator-5554"), Some(5554));
        assert_eq!(console_port("emulator-x"), None);
        assert_eq!(console_port("0123456789ABCDEF"), None);
        assert!(is_emulator("emulator-5556"));
        assert!(!is_emulator("HT4CJJT00659"));
    }

    #[test]
    fn test_query_avd_name() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream
                .write_all(b"Android Console: type 'help' for a list of commands\r\nOK\r\n")
                .unwrap();
            let mut command = [0u8; 10];
            stream.read_exact(&mut command).unwrap();
            assert_eq!(&command, b"avd name\r\n");
            stream.write_all(b"Pixel_7_API_34\r\nOK\r\n").unwrap();
        });

        let console = TcpEmulatorConsole::new(Duration::from_secs(2));
        assert_eq!(console.query(addr).unwrap(), Some("Pixel_7_API_34".to_string()));
        server.join().unwrap();
    }
}
