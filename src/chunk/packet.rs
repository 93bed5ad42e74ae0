//! JDWP packet and DDM chunk framing
//!
//! # Wire Format
//!
//! ```text
//! JDWP packet (big-endian)
//! ┌──────────┬──────────┬────────┬───────────────────────────┬──────────┐
//! │ length   │ id       │ flags  │ cmd set + cmd  (command)  │ data     │
//! │ u32      │ u32      │ u8     │ error code u16 (reply)    │          │
//! └──────────┴──────────┴────────┴───────────────────────────┴──────────┘
//!   length counts the 11-byte header; flags 0x80 marks a reply
//!
//! DDM chunk (packet data of command set 0xC7, command 0x01, and its replies)
//! ┌──────────┬──────────┬──────────────────┐
//! │ type     │ length   │ payload          │
//! │ 4 ASCII  │ u32      │ length bytes     │
//! └──────────┴──────────┴──────────────────┘
//! ```

use super::types::ChunkType;
use crate::error::{Error, Result};

pub const JDWP_HEADER_LEN: usize = 11;
pub const CHUNK_HEADER_LEN: usize = 8;

pub const REPLY_FLAG: u8 = 0x80;
pub const DDMS_COMMAND_SET: u8 = 0xC7;
pub const DDMS_COMMAND: u8 = 0x01;

/// One typed DDM message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub kind: ChunkType,
    pub payload: Vec<u8>,
}

impl Chunk {
    pub fn new(kind: ChunkType, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    pub fn empty(kind: ChunkType) -> Self {
        Self::new(kind, Vec::new())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CHUNK_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.kind.as_u32().to_be_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode the chunk carried by a DDM packet
    ///
    /// Only the first chunk is read; trailing bytes are ignored.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < CHUNK_HEADER_LEN {
            return Err(Error::InvalidChunk(format!(
                "chunk header needs {} bytes, got {}",
                CHUNK_HEADER_LEN,
                data.len()
            )));
        }
        let kind = ChunkType::from_u32(u32::from_be_bytes([data[0], data[1], data[2], data[3]]));
        let len = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
        let end = CHUNK_HEADER_LEN
            .checked_add(len)
            .filter(|&end| end <= data.len())
            .ok_or_else(|| {
                Error::InvalidChunk(format!(
                    "{} declares {} bytes, {} present",
                    kind,
                    len,
                    data.len() - CHUNK_HEADER_LEN
                ))
            })?;
        if end < data.len() {
            log::debug!("Ignoring {} trailing bytes after {}", data.len() - end, kind);
        }
        Ok(Self::new(kind, data[CHUNK_HEADER_LEN..end].to_vec()))
    }
}

/// Bytes 9 and 10 of the packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketHeader {
    Command { command_set: u8, command: u8 },
    Reply { error_code: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JdwpPacket {
    pub id: u32,
    pub header: PacketHeader,
    pub data: Vec<u8>,
}

impl JdwpPacket {
    /// DDM command carrying `chunk`
    pub fn ddm_command(id: u32, chunk: &Chunk) -> Self {
        Self {
            id,
            header: PacketHeader::Command {
                command_set: DDMS_COMMAND_SET,
                command: DDMS_COMMAND,
            },
            data: chunk.encode(),
        }
    }

    /// Successful reply carrying `chunk`
    pub fn ddm_reply(id: u32, chunk: &Chunk) -> Self {
        Self {
            id,
            header: PacketHeader::Reply { error_code: 0 },
            data: chunk.encode(),
        }
    }

    pub fn is_reply(&self) -> bool {
        matches!(self.header, PacketHeader::Reply { .. })
    }

    pub fn is_ddm_command(&self) -> bool {
        self.header
            == PacketHeader::Command {
                command_set: DDMS_COMMAND_SET,
                command: DDMS_COMMAND,
            }
    }

    pub fn error_code(&self) -> Option<u16> {
        match self.header {
            PacketHeader::Reply { error_code } => Some(error_code),
            PacketHeader::Command { .. } => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(JDWP_HEADER_LEN + self.data.len());
        out.extend_from_slice(&((JDWP_HEADER_LEN + self.data.len()) as u32).to_be_bytes());
        out.extend_from_slice(&self.id.to_be_bytes());
        match self.header {
            PacketHeader::Command {
                command_set,
                command,
            } => {
                out.push(0);
                out.push(command_set);
                out.push(command);
            }
            PacketHeader::Reply { error_code } => {
                out.push(REPLY_FLAG);
                out.extend_from_slice(&error_code.to_be_bytes());
            }
        }
        out.extend_from_slice(&self.data);
        out
    }

    /// Parse one packet from the front of `buf`
    ///
    /// Returns the packet and the bytes consumed, or `None` if `buf` holds
    /// only part of a packet.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        if buf.len() < JDWP_HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len < JDWP_HEADER_LEN {
            return Err(Error::InvalidPacket(format!("packet length {} below header size", len)));
        }
        if buf.len() < len {
            return Ok(None);
        }

        let id = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let flags = buf[8];
        let header = if flags & REPLY_FLAG != 0 {
            PacketHeader::Reply {
                error_code: u16::from_be_bytes([buf[9], buf[10]]),
            }
        } else {
            PacketHeader::Command {
                command_set: buf[9],
                command: buf[10],
            }
        };

        let packet = Self {
            id,
            header,
            data: buf[JDWP_HEADER_LEN..len].to_vec(),
        };
        Ok(Some((packet, len)))
    }
}

/// Reassembles packets from a byte stream
#[derive(Debug, Default)]
pub struct PacketReader {
    buf: Vec<u8>,
}

impl PacketReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Remove and return the first `count` buffered bytes
    pub fn take_prefix(&mut self, count: usize) -> Vec<u8> {
        let count = count.min(self.buf.len());
        self.buf.drain(..count).collect()
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    pub fn next_packet(&mut self) -> Result<Option<JdwpPacket>> {
        match JdwpPacket::parse(&self.buf)? {
            Some((packet, consumed)) => {
                self.buf.drain(..consumed);
                Ok(Some(packet))
            }
            None => Ok(None),
        }
    }
}
