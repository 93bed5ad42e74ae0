//! Allocation record codec (REAL payload)
//!
//! # Wire Format
//!
//! All fields big-endian.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ u8  message header length                                   │
//! │ u8  entry header length                                     │
//! │ u8  stack frame length                                      │
//! │ u16 number of entries                                       │
//! │ u32 offset to string tables                                 │
//! │ u16 class names │ u16 method names │ u16 file names         │
//! ├─────────────────────────────────────────────────────────────┤
//! │ entries (at message header length), each:                   │
//! │   u32 total size, u16 thread id, u16 class idx, u8 depth    │
//! │   (padding to entry header length)                          │
//! │   depth × frame: u16 class, u16 method, u16 file, i16 line  │
//! │   (padding to stack frame length)                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │ class table │ method table │ file table                     │
//! │   each entry: u32 unit count + UTF-16BE units               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Entries are numbered from `number of entries` down to 1, so the most
//! recent allocation carries the highest number.

use super::bytes::{ByteReader, ByteWriter};
use super::descriptor::{descriptor_to_dot, dot_to_descriptor};
use crate::error::{Error, Result};
use std::collections::HashMap;

/// Line number of a frame executing native code
pub const NATIVE_LINE: i16 = -2;

/// Line number of a frame without source information
pub const NO_SOURCE_LINE: i16 = -1;

const MIN_MESSAGE_HEADER_LEN: u8 = 15;
const MIN_ENTRY_HEADER_LEN: u8 = 9;
const MIN_STACK_FRAME_LEN: u8 = 8;

/// One resolved stack frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub class_name: String,
    pub method_name: String,
    pub file_name: String,
    pub line: i16,
}

impl StackFrame {
    pub fn is_native(&self) -> bool {
        self.line == NATIVE_LINE
    }

    pub fn has_source(&self) -> bool {
        self.line >= 0
    }
}

/// One decoded allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRecord {
    /// Sequence number, most recent highest
    pub number: u32,
    pub class_name: String,
    pub size: u32,
    pub thread_id: u16,
    pub stack: Vec<StackFrame>,
}

/// Field widths declared in the payload header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationLayout {
    pub message_header_len: u8,
    pub entry_header_len: u8,
    pub stack_frame_len: u8,
}

impl Default for AllocationLayout {
    fn default() -> Self {
        Self {
            message_header_len: MIN_MESSAGE_HEADER_LEN,
            entry_header_len: MIN_ENTRY_HEADER_LEN,
            stack_frame_len: MIN_STACK_FRAME_LEN,
        }
    }
}

/// Decode a REAL payload
pub fn decode_allocations(payload: &[u8]) -> Result<Vec<AllocationRecord>> {
    let mut reader = ByteReader::new(payload);

    let layout = AllocationLayout {
        message_header_len: reader.u8()?,
        entry_header_len: reader.u8()?,
        stack_frame_len: reader.u8()?,
    };
    if layout.message_header_len < MIN_MESSAGE_HEADER_LEN
        || layout.entry_header_len < MIN_ENTRY_HEADER_LEN
        || layout.stack_frame_len < MIN_STACK_FRAME_LEN
    {
        return Err(Error::InvalidChunk(format!(
            "allocation header declares short layout {:?}",
            layout
        )));
    }

    let num_entries = reader.u16()?;
    let offset_to_strings = reader.u32()? as usize;
    let num_class_names = reader.u16()? as usize;
    let num_method_names = reader.u16()? as usize;
    let num_file_names = reader.u16()? as usize;

    reader.seek(offset_to_strings)?;
    let class_names: Vec<String> = read_string_table(&mut reader, num_class_names)?
        .iter()
        .map(|name| descriptor_to_dot(name))
        .collect();
    let method_names = read_string_table(&mut reader, num_method_names)?;
    let file_names = read_string_table(&mut reader, num_file_names)?;

    reader.seek(layout.message_header_len as usize)?;

    let mut records = Vec::with_capacity(num_entries as usize);
    for i in 0..num_entries {
        let entry_start = reader.position();
        let size = reader.u32()?;
        let thread_id = reader.u16()?;
        let class_index = reader.u16()? as usize;
        let depth = reader.u8()?;
        reader.seek(entry_start + layout.entry_header_len as usize)?;

        let mut stack = Vec::with_capacity(depth as usize);
        for _ in 0..depth {
            let frame_start = reader.position();
            let frame_class = reader.u16()? as usize;
            let method = reader.u16()? as usize;
            let file = reader.u16()? as usize;
            let line = reader.i16()?;
            reader.seek(frame_start + layout.stack_frame_len as usize)?;

            stack.push(StackFrame {
                class_name: lookup(&class_names, frame_class, "class")?,
                method_name: lookup(&method_names, method, "method")?,
                file_name: lookup(&file_names, file, "file")?,
                line,
            });
        }

        records.push(AllocationRecord {
            number: u32::from(num_entries - i),
            class_name: lookup(&class_names, class_index, "class")?,
            size,
            thread_id,
            stack,
        });
    }

    Ok(records)
}

/// Encode records in the given order with the minimal layout
pub fn encode_allocations(records: &[AllocationRecord]) -> Vec<u8> {
    encode_allocations_with_layout(records, AllocationLayout::default())
}

/// Encode records, zero-padding headers and frames to `layout`
///
/// Widths below the minimum are raised to the minimum.
pub fn encode_allocations_with_layout(
    records: &[AllocationRecord],
    layout: AllocationLayout,
) -> Vec<u8> {
    let layout = AllocationLayout {
        message_header_len: layout.message_header_len.max(MIN_MESSAGE_HEADER_LEN),
        entry_header_len: layout.entry_header_len.max(MIN_ENTRY_HEADER_LEN),
        stack_frame_len: layout.stack_frame_len.max(MIN_STACK_FRAME_LEN),
    };

    let mut classes = StringTable::default();
    let mut methods = StringTable::default();
    let mut files = StringTable::default();

    let mut body = ByteWriter::new();
    for record in records {
        let start = body.len();
        body.u32(record.size)
            .u16(record.thread_id)
            .u16(classes.index(&dot_to_descriptor(&record.class_name)))
            .u8(record.stack.len().min(u8::MAX as usize) as u8);
        pad_to(&mut body, start + layout.entry_header_len as usize);

        for frame in record.stack.iter().take(u8::MAX as usize) {
            let start = body.len();
            body.u16(classes.index(&dot_to_descriptor(&frame.class_name)))
                .u16(methods.index(&frame.method_name))
                .u16(files.index(&frame.file_name))
                .i16(frame.line);
            pad_to(&mut body, start + layout.stack_frame_len as usize);
        }
    }
    let body = body.into_inner();

    let mut out = ByteWriter::new();
    out.u8(layout.message_header_len)
        .u8(layout.entry_header_len)
        .u8(layout.stack_frame_len)
        .u16(records.len() as u16)
        .u32((layout.message_header_len as usize + body.len()) as u32)
        .u16(classes.names.len() as u16)
        .u16(methods.names.len() as u16)
        .u16(files.names.len() as u16);
    pad_to(&mut out, layout.message_header_len as usize);
    out.bytes(&body);

    for table in [&classes, &methods, &files] {
        for name in &table.names {
            out.u32(name.encode_utf16().count() as u32).utf16(name);
        }
    }

    out.into_inner()
}

fn read_string_table(reader: &mut ByteReader<'_>, count: usize) -> Result<Vec<String>> {
    let mut names = Vec::with_capacity(count);
    for _ in 0..count {
        let len = reader.u32()? as usize;
        names.push(reader.utf16(len)?);
    }
    Ok(names)
}

fn lookup(table: &[String], index: usize, name: &'static str) -> Result<String> {
    table.get(index).cloned().ok_or(Error::StringIndex {
        table: name,
        index,
        len: table.len(),
    })
}

fn pad_to(writer: &mut ByteWriter, len: usize) {
    while writer.len() < len {
        writer.u8(0);
    }
}

/// Deduplicating string table used by the encoder
#[derive(Default)]
struct StringTable {
    names: Vec<String>,
    positions: HashMap<String, u16>,
}

impl StringTable {
    fn index(&mut self, name: &str) -> u16 {
        if let Some(&idx) = self.positions.get(name) {
            return idx;
        }
        let idx = self.names.len() as u16;
        self.names.push(name.to_string());
        self.positions.insert(name.to_string(), idx);
        idx
    }
}
