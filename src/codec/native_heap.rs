//! Native heap codec (NHGT payload)
//!
//! The payload is little-endian. Two headers exist:
//!
//! ```text
//! legacy (32-bit fields)           signature-prefixed
//! ┌────────────────────┐           ┌──────────────────────────────┐
//! │ u32 map size       │           │ u32 0x812345dd               │
//! │ u32 alloc size     │           │ u16 version (2)              │
//! │ u32 alloc info size│           │ u16 pointer size (4 or 8)    │
//! │ u32 total memory   │           │ size_t map size ...          │
//! │ u32 backtrace size │           │ ... same five fields         │
//! └────────────────────┘           └──────────────────────────────┘
//! ```
//!
//! The signature is checked first; anything else is read as a legacy header.
//! The header is followed by `map size` bytes of `/proc/<pid>/maps` text and
//! `alloc size / alloc info size` allocation records.

use super::bytes::{ByteReader, ByteWriter};
use crate::error::{Error, Result};

/// First word of a signature-prefixed header
pub const NATIVE_HEAP_SIGNATURE: u32 = 0x812345dd;

/// Only header version understood
pub const NATIVE_HEAP_VERSION: u16 = 2;

/// Size bit marking an allocation inherited from the zygote
pub const ZYGOTE_CHILD_FLAG: u32 = 0x8000_0000;

/// Header shape used by [`encode_native_heap`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeHeaderFormat {
    Legacy,
    Signature { pointer_size: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeAllocation {
    pub size: u32,
    pub zygote_child: bool,
    pub allocation_count: u64,
    /// Non-zero return addresses, innermost first
    pub backtrace: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeLibraryMap {
    pub name: String,
    pub start: u64,
    pub end: u64,
}

impl NativeLibraryMap {
    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.end
    }
}

/// Decoded native heap report
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativeHeapSnapshot {
    pub pointer_size: u16,
    pub total_memory: u64,
    pub maps: Vec<NativeLibraryMap>,
    pub allocations: Vec<NativeAllocation>,
}

/// Decode an NHGT payload
pub fn decode_native_heap(payload: &[u8]) -> Result<NativeHeapSnapshot> {
    let mut reader = ByteReader::little(payload);

    let mut pointer_size: u16 = 4;
    if payload.len() >= 4 && u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]])
        == NATIVE_HEAP_SIGNATURE
    {
        reader.skip(4)?;
        let version = reader.u16()?;
        if version != NATIVE_HEAP_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        pointer_size = reader.u16()?;
    }
    if pointer_size != 4 && pointer_size != 8 {
        return Err(Error::UnsupportedPointerSize(pointer_size));
    }
    let width = pointer_size as usize;

    let map_size = reader.uint(width)? as usize;
    let alloc_size = reader.uint(width)?;
    let alloc_info_size = reader.uint(width)?;
    let total_memory = reader.uint(width)?;
    let backtrace_size = reader.uint(width)?;

    let mut snapshot = NativeHeapSnapshot {
        pointer_size,
        total_memory,
        ..Default::default()
    };

    // Allocation tracking is off on the device
    if alloc_info_size == 0 {
        return Ok(snapshot);
    }

    if map_size > 0 {
        snapshot.maps = parse_maps(reader.take(map_size)?);
    }

    let record_len = (2 + backtrace_size).saturating_mul(width as u64);
    let padding = alloc_info_size.saturating_sub(record_len) as usize;
    let iterations = alloc_size / alloc_info_size;

    for _ in 0..iterations {
        let raw_size = reader.uint(width)? as u32;
        let allocation_count = reader.uint(width)?;
        let mut backtrace = Vec::new();
        for _ in 0..backtrace_size {
            let address = reader.uint(width)?;
            if address != 0 {
                backtrace.push(address);
            }
        }
        reader.skip(padding)?;

        snapshot.allocations.push(NativeAllocation {
            size: raw_size & !ZYGOTE_CHILD_FLAG,
            zygote_child: raw_size & ZYGOTE_CHILD_FLAG != 0,
            allocation_count,
            backtrace,
        });
    }

    Ok(snapshot)
}

/// Parse `/proc/<pid>/maps` text, keeping file-backed mappings
///
/// Expected line shape: `7fe51f2000-7fe5213000 r-xp 00000000 00:00 0   /system/lib64/libc.so`
pub fn parse_maps(text: &[u8]) -> Vec<NativeLibraryMap> {
    let text = String::from_utf8_lossy(text);
    let mut maps = Vec::new();

    for line in text.lines() {
        let Some(library_start) = line.rfind(' ') else {
            continue;
        };
        let library = &line[library_start + 1..];
        if !library.starts_with('/') {
            continue;
        }

        let Some((range, _)) = line.split_once(' ') else {
            continue;
        };
        let Some((start, end)) = range.split_once('-') else {
            continue;
        };
        let (Ok(start), Ok(end)) = (u64::from_str_radix(start, 16), u64::from_str_radix(end, 16))
        else {
            log::debug!("Skipping maps line with bad range: {}", line);
            continue;
        };

        maps.push(NativeLibraryMap {
            name: library.to_string(),
            start,
            end,
        });
    }

    maps
}

/// Encode a snapshot; backtraces are zero-padded to the longest one
pub fn encode_native_heap(snapshot: &NativeHeapSnapshot, format: NativeHeaderFormat) -> Vec<u8> {
    let mut writer = ByteWriter::little();
    let width = match format {
        NativeHeaderFormat::Legacy => 4,
        NativeHeaderFormat::Signature { pointer_size } => {
            writer
                .u32(NATIVE_HEAP_SIGNATURE)
                .u16(NATIVE_HEAP_VERSION)
                .u16(pointer_size);
            pointer_size as usize
        }
    };

    let maps: String = snapshot
        .maps
        .iter()
        .map(|m| format!("{:x}-{:x} r-xp 00000000 00:00 0 {}\n", m.start, m.end, m.name))
        .collect();
    let backtrace_size = snapshot
        .allocations
        .iter()
        .map(|a| a.backtrace.len())
        .max()
        .unwrap_or(0) as u64;
    let alloc_info_size = if snapshot.allocations.is_empty() {
        0
    } else {
        (2 + backtrace_size) * width as u64
    };

    writer
        .uint(width, maps.len() as u64)
        .uint(width, alloc_info_size * snapshot.allocations.len() as u64)
        .uint(width, alloc_info_size)
        .uint(width, snapshot.total_memory)
        .uint(width, backtrace_size);

    if alloc_info_size == 0 {
        return writer.into_inner();
    }

    writer.bytes(maps.as_bytes());
    for allocation in &snapshot.allocations {
        let size = if allocation.zygote_child {
            allocation.size | ZYGOTE_CHILD_FLAG
        } else {
            allocation.size
        };
        writer
            .uint(width, u64::from(size))
            .uint(width, allocation.allocation_count);
        for i in 0..backtrace_size as usize {
            writer.uint(width, allocation.backtrace.get(i).copied().unwrap_or(0));
        }
    }

    writer.into_inner()
}
