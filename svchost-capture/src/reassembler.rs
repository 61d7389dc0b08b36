//! Line reassembly over an endpoint's fixed receive buffer.
//!
//! A record ends at `\n`. A `\r` right before the `\n` is stripped, and so
//! is a single `\r` right after it, which arrives as the first byte of the
//! next record. Records are cut only at `\n` and trimmed only at their own
//! edges, so the output is the same wherever the byte stream was chunked.
//! Records that end up empty are dropped.
//!
//! Two escape hatches keep a writer from stalling the buffer:
//! - a full buffer without any boundary is emitted whole and cleared;
//! - on the final drain an unterminated tail is emitted as the last record.

/// Whether more bytes may still follow the current buffer contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// The stream is live; keep unterminated tails for the next read.
    Incremental,
    /// The stream is closing; emit whatever is left.
    Final,
}

/// Result of one reassembly pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Extracted<'a> {
    /// Complete records in stream order, borrowed from the buffer.
    pub records: Vec<&'a [u8]>,
    /// Bytes the caller should compact off the front of the buffer.
    pub consumed: usize,
    /// The buffer was full with no boundary and was emitted whole.
    pub overflowed: bool,
}

/// Extract complete records from `buf`.
///
/// `appended` is the count of bytes added since the previous pass; everything
/// before them is a tail already known to hold no `\n`, so scanning starts at
/// the new bytes. `capacity` is the fixed size of the owning buffer.
pub fn extract(buf: &[u8], appended: usize, capacity: usize, flush: Flush) -> Extracted<'_> {
    let len = buf.len();
    let mut records = Vec::new();
    let mut start = 0;
    let mut pos = len - appended.min(len);

    while let Some(offset) = buf[pos..].iter().position(|&b| b == b'\n') {
        let newline = pos + offset;
        let record = trim_record(&buf[start..newline]);
        if !record.is_empty() {
            records.push(record);
        }
        start = newline + 1;
        pos = start;
    }

    let mut consumed = start;
    let mut overflowed = false;
    if consumed == 0 && len > 0 && len >= capacity {
        let whole = strip_leading_cr(buf);
        if !whole.is_empty() {
            records.push(whole);
        }
        consumed = len;
        overflowed = true;
    } else if flush == Flush::Final && consumed < len {
        let tail = strip_leading_cr(&buf[consumed..]);
        if !tail.is_empty() {
            records.push(tail);
        }
        consumed = len;
    }

    Extracted {
        records,
        consumed,
        overflowed,
    }
}

fn trim_record(record: &[u8]) -> &[u8] {
    let record = record.strip_suffix(b"\r").unwrap_or(record);
    strip_leading_cr(record)
}

fn strip_leading_cr(record: &[u8]) -> &[u8] {
    record.strip_prefix(b"\r").unwrap_or(record)
}
