//! Binary chunk codecs
//!
//! Pure encode/decode functions for the fixed DDM payload layouts. No I/O
//! and no state; every decoder takes a payload slice and returns a value or
//! a decode error for that payload alone.

pub mod allocations;
pub mod bytes;
pub mod descriptor;
pub mod heap;
pub mod native_heap;

pub use allocations::{AllocationRecord, StackFrame, decode_allocations, encode_allocations};
pub use bytes::{ByteReader, ByteWriter};
pub use descriptor::descriptor_to_dot;
pub use heap::{HeapInfo, HeapSegment, decode_heap_info, decode_heap_segment};
pub use native_heap::{NativeAllocation, NativeHeapSnapshot, NativeLibraryMap, decode_native_heap};
