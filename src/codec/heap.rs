//! Heap info (HPIF) and heap segment (HPSG/NHSG) codecs

use super::bytes::{ByteReader, ByteWriter};
use crate::error::Result;

/// Per-heap statistics from an HPIF chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapInfo {
    pub heap_id: u32,
    /// Milliseconds since the epoch on the device
    pub timestamp: i64,
    /// Why the report was sent (0 = on request, 1 = after GC)
    pub reason: u8,
    pub max_size: u32,
    pub size: u32,
    pub bytes_allocated: u32,
    pub objects_allocated: u32,
}

/// Decode an HPIF payload
pub fn decode_heap_info(payload: &[u8]) -> Result<Vec<HeapInfo>> {
    let mut reader = ByteReader::new(payload);
    let count = reader.i32()?.max(0) as usize;

    let mut heaps = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        heaps.push(HeapInfo {
            heap_id: reader.u32()?,
            timestamp: reader.i64()?,
            reason: reader.u8()?,
            max_size: reader.u32()?,
            size: reader.u32()?,
            bytes_allocated: reader.u32()?,
            objects_allocated: reader.u32()?,
        });
    }
    Ok(heaps)
}

pub fn encode_heap_info(heaps: &[HeapInfo]) -> Vec<u8> {
    let mut writer = ByteWriter::new();
    writer.i32(heaps.len() as i32);
    for heap in heaps {
        writer
            .u32(heap.heap_id)
            .i64(heap.timestamp)
            .u8(heap.reason)
            .u32(heap.max_size)
            .u32(heap.size)
            .u32(heap.bytes_allocated)
            .u32(heap.objects_allocated);
    }
    writer.into_inner()
}

/// Reachability of a heap element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Solidity {
    Free,
    Hard,
    Soft,
    Weak,
    Phantom,
    Finalizable,
    Sweep,
    Invalid,
}

impl Solidity {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0 => Solidity::Free,
            1 => Solidity::Hard,
            2 => Solidity::Soft,
            3 => Solidity::Weak,
            4 => Solidity::Phantom,
            5 => Solidity::Finalizable,
            6 => Solidity::Sweep,
            _ => Solidity::Invalid,
        }
    }
}

/// What occupies a heap element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Object,
    ClassObject,
    Array1,
    Array2,
    Array4,
    Array8,
    Unknown,
    Native,
}

impl ElementKind {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0 => ElementKind::Object,
            1 => ElementKind::ClassObject,
            2 => ElementKind::Array1,
            3 => ElementKind::Array2,
            4 => ElementKind::Array4,
            5 => ElementKind::Array8,
            6 => ElementKind::Unknown,
            _ => ElementKind::Native,
        }
    }
}

/// Continuation flag: the element spills into the next pair
pub const PARTIAL_FLAG: u8 = 0x80;

/// One run of heap memory with a single solidity and kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapSegmentElement {
    pub solidity: Solidity,
    pub kind: ElementKind,
    pub address: u64,
    pub length: u64,
}

/// Decoded HPSG/NHSG payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapSegment {
    pub heap_id: u32,
    pub allocation_unit_size: u8,
    pub start_address: u32,
    pub offset: u32,
    pub allocation_unit_count: u32,
    pub elements: Vec<HeapSegmentElement>,
}

/// Decode a heap segment
///
/// Usage data is a list of `(state, length - 1)` byte pairs in units of
/// `allocation_unit_size`. A pair whose state has [`PARTIAL_FLAG`] set is
/// merged with the following pair.
pub fn decode_heap_segment(payload: &[u8]) -> Result<HeapSegment> {
    let mut reader = ByteReader::new(payload);
    let heap_id = reader.u32()?;
    let allocation_unit_size = reader.u8()?;
    let start_address = reader.u32()?;
    let offset = reader.u32()?;
    let allocation_unit_count = reader.u32()?;

    let unit = u64::from(allocation_unit_size);
    let base = u64::from(start_address) + u64::from(offset);
    let mut elements = Vec::new();
    let mut units_seen: u64 = 0;

    while !reader.is_empty() {
        let first = reader.u8()?;
        let mut units = u64::from(reader.u8()?) + 1;
        let mut state = first;
        while state & PARTIAL_FLAG != 0 {
            state = reader.u8()?;
            units += u64::from(reader.u8()?) + 1;
        }

        elements.push(HeapSegmentElement {
            solidity: Solidity::from_bits(first),
            kind: ElementKind::from_bits(first >> 3),
            address: base + units_seen * unit,
            length: units * unit,
        });
        units_seen += units;
    }

    Ok(HeapSegment {
        heap_id,
        allocation_unit_size,
        start_address,
        offset,
        allocation_unit_count,
        elements,
    })
}

/// Segment header followed by raw usage pairs
pub fn encode_heap_segment(segment: &HeapSegment, usage: &[(u8, u8)]) -> Vec<u8> {
    let mut writer = ByteWriter::new();
    writer
        .u32(segment.heap_id)
        .u8(segment.allocation_unit_size)
        .u32(segment.start_address)
        .u32(segment.offset)
        .u32(segment.allocation_unit_count);
    for &(state, len) in usage {
        writer.u8(state).u8(len);
    }
    writer.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_heap_info_decode() {
        let heaps = vec![
            HeapInfo {
                heap_id: 1,
                timestamp: 1_700_000_000_000,
                reason: 0,
                max_size: 64 * 1024 * 1024,
                size: 8 * 1024 * 1024,
                bytes_allocated: 5_000_000,
                objects_allocated: 42_000,
            },
            HeapInfo {
                heap_id: 2,
                timestamp: 1_700_000_000_500,
                reason: 1,
                max_size: u32::MAX,
                size: 0,
                bytes_allocated: 0,
                objects_allocated: 0,
            },
        ];
        let payload = encode_heap_info(&heaps);
        assert_eq!(payload.len(), 4 + 2 * 29);
        assert_eq!(decode_heap_info(&payload).unwrap(), heaps);
    }

    #[test]
    fn test_heap_info_truncated() {
        let mut payload = encode_heap_info(&[HeapInfo {
            heap_id: 1,
            timestamp: 0,
            reason: 0,
            max_size: 1,
            size: 1,
            bytes_allocated: 1,
            objects_allocated: 1,
        }]);
        payload.truncate(20);
        assert!(matches!(
            decode_heap_info(&payload),
            Err(Error::Underflow { .. })
        ));
    }

    fn header() -> HeapSegment {
        HeapSegment {
            heap_id: 1,
            allocation_unit_size: 8,
            start_address: 0x4000_0000,
            offset: 0x100,
            allocation_unit_count: 64,
            elements: vec![],
        }
    }

    #[test]
    fn test_segment_elements() {
        // hard object 2 units, free 4 units
        let payload = encode_heap_segment(&header(), &[(0x01, 1), (0x00, 3)]);
        let segment = decode_heap_segment(&payload).unwrap();

        assert_eq!(segment.heap_id, 1);
        assert_eq!(segment.allocation_unit_count, 64);
        assert_eq!(segment.elements.len(), 2);

        let first = segment.elements[0];
        assert_eq!(first.solidity, Solidity::Hard);
        assert_eq!(first.kind, ElementKind::Object);
        assert_eq!(first.address, 0x4000_0100);
        assert_eq!(first.length, 16);

        let second = segment.elements[1];
        assert_eq!(second.solidity, Solidity::Free);
        assert_eq!(second.address, 0x4000_0110);
        assert_eq!(second.length, 32);
    }

    #[test]
    fn test_partial_elements_merge() {
        // array-4 object spanning 256 + 2 units, then a class object
        let array4_hard = (4 << 3) | 1;
        let class_hard = (1 << 3) | 1;
        let payload = encode_heap_segment(
            &header(),
            &[(PARTIAL_FLAG | array4_hard, 255), (array4_hard, 1), (class_hard, 0)],
        );
        let segment = decode_heap_segment(&payload).unwrap();

        assert_eq!(segment.elements.len(), 2);
        assert_eq!(segment.elements[0].kind, ElementKind::Array4);
        assert_eq!(segment.elements[0].length, 258 * 8);
        assert_eq!(segment.elements[1].kind, ElementKind::ClassObject);
        assert_eq!(segment.elements[1].address, 0x4000_0100 + 258 * 8);
    }

    #[test]
    fn test_dangling_usage_byte() {
        let mut payload = encode_heap_segment(&header(), &[(0x01, 0)]);
        payload.push(0x01);
        assert!(decode_heap_segment(&payload).is_err());
    }
}
