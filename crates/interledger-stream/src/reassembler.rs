//! Reassembles out-of-order `StreamData` chunks into an ordered byte stream.
//!
//! Chunks arrive as `(offset, bytes)` pairs (one ILP Prepare can carry
//! several `StreamData` frames for the same stream, and Prepares themselves
//! can in principle be reordered upstream of STREAM even though this
//! implementation never has more than one in flight). They are kept sorted
//! by offset in a `BTreeMap`; `read()` only ever returns the contiguous
//! prefix starting at `read_offset`, advancing it by however many bytes it
//! returns.
use bytes::Bytes;
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("overlapping chunk at offset {offset} disagrees with previously buffered bytes")]
    OverlapMismatch { offset: u64 },
    #[error("data at offset {offset} (len {len}) extends past the final offset {end_offset}")]
    PastFinalOffset {
        offset: u64,
        len: usize,
        end_offset: u64,
    },
}

/// An offset-indexed reassembly buffer for a single stream's incoming data.
#[derive(Debug, Default)]
pub struct Reassembler {
    chunks: BTreeMap<u64, Bytes>,
    read_offset: u64,
    /// Total length of the stream's data, once known (the sender marks the
    /// final `StreamData` frame, or the stream closes). `None` until then.
    end_offset: Option<u64>,
    /// Highest offset + length seen so far, used to enforce
    /// `connection_max_data_in`/per-stream `maxOffset` windows.
    max_offset: u64,
}

impl Reassembler {
    pub fn new() -> Self {
        Reassembler::default()
    }

    pub fn read_offset(&self) -> u64 {
        self.read_offset
    }

    pub fn max_offset(&self) -> u64 {
        self.max_offset
    }

    pub fn end_offset(&self) -> Option<u64> {
        self.end_offset
    }

    /// Mark the stream's total byte length, learned from a final `StreamData`
    /// frame or a `StreamClose`.
    pub fn set_end_offset(&mut self, end_offset: u64) {
        self.end_offset = Some(match self.end_offset {
            Some(existing) => existing.max(end_offset),
            None => end_offset,
        });
    }

    /// Insert a chunk at `offset`. Idempotent for exact duplicates;
    /// overlapping chunks that disagree byte-for-byte are a protocol
    /// violation the caller should surface as such.
    pub fn push(&mut self, offset: u64, data: Bytes) -> Result<(), ReassemblyError> {
        if data.is_empty() {
            self.max_offset = self.max_offset.max(offset);
            return Ok(());
        }

        let end = offset + data.len() as u64;
        if let Some(end_offset) = self.end_offset {
            if end > end_offset {
                return Err(ReassemblyError::PastFinalOffset {
                    offset,
                    len: data.len(),
                    end_offset,
                });
            }
        }

        // Check overlap against every chunk whose range intersects this one.
        for (&existing_offset, existing_data) in self.chunks.range(..end) {
            let existing_end = existing_offset + existing_data.len() as u64;
            if existing_end <= offset {
                continue;
            }
            let overlap_start = offset.max(existing_offset);
            let overlap_end = end.min(existing_end);
            let a = &data[(overlap_start - offset) as usize..(overlap_end - offset) as usize];
            let b = &existing_data[(overlap_start - existing_offset) as usize
                ..(overlap_end - existing_offset) as usize];
            if a != b {
                return Err(ReassemblyError::OverlapMismatch { offset });
            }
        }

        self.max_offset = self.max_offset.max(end);
        self.chunks.entry(offset).or_insert(data);
        Ok(())
    }

    /// Total bytes currently queued (not necessarily contiguous from
    /// `read_offset`).
    pub fn byte_length(&self) -> usize {
        self.chunks.values().map(|b| b.len()).sum()
    }

    /// Pop the next contiguous chunk starting at `read_offset`, if any,
    /// advancing `read_offset` past it.
    pub fn read(&mut self) -> Option<Bytes> {
        let chunk = self.chunks.remove(&self.read_offset)?;
        self.read_offset += chunk.len() as u64;
        Some(chunk)
    }

    /// Drain every contiguous chunk currently available, concatenated in
    /// order.
    pub fn read_all(&mut self) -> Bytes {
        let mut out = Vec::new();
        while let Some(chunk) = self.read() {
            out.extend_from_slice(&chunk);
        }
        Bytes::from(out)
    }

    /// Whether the stream has delivered every byte up to its (known) end.
    pub fn is_complete(&self) -> bool {
        matches!(self.end_offset, Some(end) if self.read_offset >= end)
    }
}
