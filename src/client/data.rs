//! Per-session telemetry state

use crate::codec::heap::decode_heap_segment;
use crate::codec::{AllocationRecord, HeapInfo, HeapSegment, NativeHeapSnapshot};
use crate::core::types::{AllocationTrackingStatus, DebuggerStatus, MethodProfilingStatus};
use std::collections::{BTreeMap, BTreeSet};

/// Raw heap segment chunks collected between start and end markers
#[derive(Debug, Clone, Default)]
pub struct HeapData {
    chunks: Vec<Vec<u8>>,
    complete: bool,
}

impl HeapData {
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.complete = false;
    }

    /// Append one segment; data arriving after a seal starts a new list
    pub fn add(&mut self, raw: Vec<u8>) {
        if self.complete {
            self.clear();
        }
        self.chunks.push(raw);
    }

    pub fn seal(&mut self) {
        self.complete = true;
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn raw_chunks(&self) -> &[Vec<u8>] {
        &self.chunks
    }

    /// Decode every collected segment, skipping malformed ones
    pub fn segments(&self) -> Vec<HeapSegment> {
        self.chunks
            .iter()
            .filter_map(|raw| match decode_heap_segment(raw) {
                Ok(segment) => Some(segment),
                Err(e) => {
                    log::warn!("Discarding malformed heap segment: {}", e);
                    None
                }
            })
            .collect()
    }
}

/// Everything known about one client process
#[derive(Debug, Clone, Default)]
pub struct ClientData {
    pub vm_identifier: Option<String>,
    /// Application name from HELO or APNM
    pub description: Option<String>,
    pub user_id: Option<i32>,
    pub abi: Option<String>,
    pub jvm_flags: Option<String>,
    pub features: BTreeSet<String>,

    pub debugger_status: DebuggerStatus,
    pub debugger_port: Option<u16>,

    pub allocation_status: AllocationTrackingStatus,
    pub allocations: Vec<AllocationRecord>,

    pub method_profiling_status: MethodProfilingStatus,
    /// Device file of a running MPRS trace
    pub pending_method_profiling_file: Option<String>,
    /// Device file of a pending HPDU dump
    pub pending_hprof_file: Option<String>,

    pub heap_info: BTreeMap<u32, HeapInfo>,
    pub vm_heap: HeapData,
    pub native_heap: HeapData,
    pub native_snapshot: Option<NativeHeapSnapshot>,
}

impl ClientData {
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::heap::encode_heap_segment;

    fn raw_segment(heap_id: u32) -> Vec<u8> {
        encode_heap_segment(
            &HeapSegment {
                heap_id,
                allocation_unit_size: 8,
                start_address: 0x1000,
                offset: 0,
                allocation_unit_count: 1,
                elements: vec![],
            },
            &[(0x01, 0)],
        )
    }

    #[test]
    fn test_heap_data_lifecycle() {
        let mut heap = HeapData::default();
        heap.add(raw_segment(1));
        heap.add(raw_segment(2));
        assert!(!heap.is_complete());
        heap.seal();
        assert!(heap.is_complete());
        assert_eq!(heap.raw_chunks().len(), 2);

        // New data after the seal starts over
        heap.add(raw_segment(3));
        assert!(!heap.is_complete());
        assert_eq!(heap.raw_chunks().len(), 1);
        assert_eq!(heap.segments()[0].heap_id, 3);
    }

    #[test]
    fn test_malformed_segment_skipped() {
        let mut heap = HeapData::default();
        heap.add(vec![0, 1, 2]);
        heap.add(raw_segment(7));
        heap.seal();
        let segments = heap.segments();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].heap_id, 7);
    }
}
