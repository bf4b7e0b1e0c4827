//! Sink side of the streaming I/O bridge.
//!
//! Output leaves the executing context as an ordered sequence of
//! `{offset, bytes}` chunks. A seekable destination can write each chunk in
//! place; an append-only destination uses [`ChunkAssembler`] to materialize
//! the logical byte stream, including header bytes a muxer rewrites after
//! trailer information becomes known.

use bytes::Bytes;

use crate::engine_api::OutputChunk;

/// Reassembles offset-tagged chunks into a contiguous byte buffer.
#[derive(Debug, Default)]
pub struct ChunkAssembler {
    buf: Vec<u8>,
}

impl ChunkAssembler {
    /// An empty assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one chunk at its absolute offset, overwriting earlier bytes
    /// where ranges overlap. A gap before the chunk is zero-filled (muxers
    /// write sequentially, so gaps only occur with out-of-order delivery).
    pub fn push(&mut self, chunk: &OutputChunk) {
        let start = chunk.offset as usize;
        let end = start + chunk.data.len();
        if self.buf.len() < end {
            self.buf.resize(end, 0);
        }
        self.buf[start..end].copy_from_slice(&chunk.data);
    }

    /// Bytes materialized so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing was written yet.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The assembled output.
    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.buf)
    }

    /// View of the assembled output.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(offset: u64, data: &'static [u8]) -> OutputChunk {
        OutputChunk {
            offset,
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn sequential_chunks_concatenate() {
        let mut asm = ChunkAssembler::new();
        asm.push(&chunk(0, b"head"));
        asm.push(&chunk(4, b"body"));
        assert_eq!(asm.as_slice(), b"headbody");
    }

    #[test]
    fn header_rewrite_overwrites_in_place() {
        let mut asm = ChunkAssembler::new();
        asm.push(&chunk(0, b"????"));
        asm.push(&chunk(4, b"body"));
        // trailer pass patches the header once sizes are known
        asm.push(&chunk(0, b"HEAD"));
        assert_eq!(asm.into_bytes().as_ref(), b"HEADbody");
    }

    #[test]
    fn gap_is_zero_filled() {
        let mut asm = ChunkAssembler::new();
        asm.push(&chunk(2, b"xy"));
        assert_eq!(asm.as_slice(), &[0, 0, b'x', b'y']);
    }
}
