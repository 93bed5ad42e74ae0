//! Bounded cursor over chunk payloads
//!
//! DDM payloads are big-endian except for the native heap report, which
//! uses the device's native little-endian layout. Strings are a count of
//! UTF-16 code units followed by the big-endian units themselves.

use crate::error::{Error, Result};

/// Byte order of multi-byte fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Big,
    Little,
}

/// Read cursor that reports underflow instead of panicking
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
    endian: Endian,
}

impl<'a> ByteReader<'a> {
    /// Big-endian reader
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            endian: Endian::Big,
        }
    }

    /// Little-endian reader
    pub fn little(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            endian: Endian::Little,
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Move to an absolute offset
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            return Err(Error::Underflow {
                needed: pos - self.pos,
                offset: self.pos,
                available: self.remaining(),
            });
        }
        self.pos = pos;
        Ok(())
    }

    pub fn skip(&mut self, count: usize) -> Result<()> {
        self.take(count).map(|_| ())
    }

    /// Borrow the next `count` bytes
    pub fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        if count > self.remaining() {
            return Err(Error::Underflow {
                needed: count,
                offset: self.pos,
                available: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    /// Everything after the cursor
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        let bytes = self.array::<2>()?;
        Ok(match self.endian {
            Endian::Big => u16::from_be_bytes(bytes),
            Endian::Little => u16::from_le_bytes(bytes),
        })
    }

    pub fn i16(&mut self) -> Result<i16> {
        self.u16().map(|v| v as i16)
    }

    pub fn u32(&mut self) -> Result<u32> {
        let bytes = self.array::<4>()?;
        Ok(match self.endian {
            Endian::Big => u32::from_be_bytes(bytes),
            Endian::Little => u32::from_le_bytes(bytes),
        })
    }

    pub fn i32(&mut self) -> Result<i32> {
        self.u32().map(|v| v as i32)
    }

    pub fn u64(&mut self) -> Result<u64> {
        let bytes = self.array::<8>()?;
        Ok(match self.endian {
            Endian::Big => u64::from_be_bytes(bytes),
            Endian::Little => u64::from_le_bytes(bytes),
        })
    }

    pub fn i64(&mut self) -> Result<i64> {
        self.u64().map(|v| v as i64)
    }

    /// Unsigned field of 4 or 8 bytes
    pub fn uint(&mut self, width: usize) -> Result<u64> {
        match width {
            4 => self.u32().map(u64::from),
            8 => self.u64(),
            other => Err(Error::InvalidChunk(format!("unsupported field width {}", other))),
        }
    }

    /// `count` big-endian UTF-16 code units
    pub fn utf16(&mut self, count: usize) -> Result<String> {
        let bytes = self.take(count.checked_mul(2).ok_or_else(|| {
            Error::InvalidChunk(format!("string length {} overflows", count))
        })?)?;
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        Ok(String::from_utf16_lossy(&units))
    }

    /// `i32` unit count followed by the units
    pub fn string(&mut self) -> Result<String> {
        let len = self.i32()?;
        if len < 0 {
            return Err(Error::InvalidChunk(format!("negative string length {}", len)));
        }
        self.utf16(len as usize)
    }
}

/// Growable big-endian (or little-endian) payload builder
pub struct ByteWriter {
    buf: Vec<u8>,
    endian: Endian,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            endian: Endian::Big,
        }
    }

    pub fn little() -> Self {
        Self {
            buf: Vec::new(),
            endian: Endian::Little,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn u16(&mut self, value: u16) -> &mut Self {
        match self.endian {
            Endian::Big => self.buf.extend_from_slice(&value.to_be_bytes()),
            Endian::Little => self.buf.extend_from_slice(&value.to_le_bytes()),
        }
        self
    }

    pub fn i16(&mut self, value: i16) -> &mut Self {
        self.u16(value as u16)
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        match self.endian {
            Endian::Big => self.buf.extend_from_slice(&value.to_be_bytes()),
            Endian::Little => self.buf.extend_from_slice(&value.to_le_bytes()),
        }
        self
    }

    pub fn i32(&mut self, value: i32) -> &mut Self {
        self.u32(value as u32)
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        match self.endian {
            Endian::Big => self.buf.extend_from_slice(&value.to_be_bytes()),
            Endian::Little => self.buf.extend_from_slice(&value.to_le_bytes()),
        }
        self
    }

    pub fn i64(&mut self, value: i64) -> &mut Self {
        self.u64(value as u64)
    }

    /// Unsigned field of 4 or 8 bytes; wider values are truncated to 4
    pub fn uint(&mut self, width: usize, value: u64) -> &mut Self {
        if width == 8 {
            self.u64(value)
        } else {
            self.u32(value as u32)
        }
    }

    pub fn bytes(&mut self, data: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(data);
        self
    }

    /// Big-endian UTF-16 units without a length
    pub fn utf16(&mut self, value: &str) -> &mut Self {
        for unit in value.encode_utf16() {
            self.buf.extend_from_slice(&unit.to_be_bytes());
        }
        self
    }

    /// `i32` unit count followed by the units
    pub fn string(&mut self, value: &str) -> &mut Self {
        let units = value.encode_utf16().count();
        self.i32(units as i32);
        self.utf16(value)
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

impl Default for ByteWriter {
    fn default() -> Self {
        Self::new()
    }
}
