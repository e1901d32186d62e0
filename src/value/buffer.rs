use crate::merkle::{CHUNK_COUNT, CHUNK_SIZE, Chunk, MerkleError, MerkleProof, MerkleTree};
use crate::transcript::{Hash256, Transcript};
use crate::value::TAG_BUFFER;
use std::collections::BTreeSet;

/// Largest addressable offset (exclusive) of any buffer.
pub const MAX_BUFFER_LEN: u64 = CHUNK_COUNT * CHUNK_SIZE as u64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("range {offset}+{len} is outside the buffer address space")]
    OutOfBounds { offset: u64, len: u64 },
    #[error("buffer chunk {0} is hidden behind a hash commitment")]
    Hidden(u64),
    #[error("malformed buffer tree")]
    Malformed,
}

impl From<MerkleError> for BufferError {
    fn from(err: MerkleError) -> Self {
        match err {
            MerkleError::Hidden(index) => BufferError::Hidden(index),
            MerkleError::OutOfRange(index) => BufferError::OutOfBounds {
                offset: index.saturating_mul(CHUNK_SIZE as u64),
                len: CHUNK_SIZE as u64,
            },
            MerkleError::Malformed(_) => BufferError::Malformed,
        }
    }
}

/// Zero-filled byte sequence committed to as a Merkle root.
///
/// Buffers are persistent: `write` returns a new buffer sharing every
/// untouched subtree with the old one. Trailing zeroes are not part of the
/// commitment, so `Buffer::new()` and a buffer of explicit zero bytes hash
/// the same.
#[derive(Debug, Clone)]
pub struct Buffer {
    tree: MerkleTree,
    hash: Hash256,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for Buffer {}

fn check_range(offset: u64, len: u64) -> Result<(), BufferError> {
    match offset.checked_add(len) {
        Some(end) if end <= MAX_BUFFER_LEN => Ok(()),
        _ => Err(BufferError::OutOfBounds { offset, len }),
    }
}

/// Chunk indices covering `offset..offset + len`. Empty when `len` is zero.
pub fn chunk_span(offset: u64, len: u64) -> std::ops::Range<u64> {
    if len == 0 {
        return 0..0;
    }
    let first = offset / CHUNK_SIZE as u64;
    let last = (offset + len - 1) / CHUNK_SIZE as u64;
    first..last + 1
}

impl Buffer {
    pub fn new() -> Self {
        Self::from_tree(MerkleTree::new())
    }

    pub(crate) fn from_tree(tree: MerkleTree) -> Self {
        let hash = Transcript::new(TAG_BUFFER)
            .absorb_hash(&tree.root())
            .finalize();
        Self { tree, hash }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BufferError> {
        check_range(0, bytes.len() as u64)?;
        let chunks: Vec<Chunk> = bytes
            .chunks(CHUNK_SIZE)
            .map(|piece| {
                let mut chunk = [0u8; CHUNK_SIZE];
                chunk[..piece.len()].copy_from_slice(piece);
                chunk
            })
            .collect();
        Ok(Self::from_tree(MerkleTree::from_chunks(&chunks)?))
    }

    pub(crate) fn tree(&self) -> &MerkleTree {
        &self.tree
    }

    /// Value-level content hash.
    pub fn hash(&self) -> Hash256 {
        self.hash
    }

    /// Root of the chunk tree.
    pub fn merkle_hash(&self) -> Hash256 {
        self.tree.root()
    }

    pub fn is_complete(&self) -> bool {
        self.tree.is_complete()
    }

    pub fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>, BufferError> {
        check_range(offset, len)?;
        let mut out = Vec::with_capacity(len as usize);
        for index in chunk_span(offset, len) {
            let chunk = self.tree.get_chunk(index)?;
            let chunk_start = index * CHUNK_SIZE as u64;
            let from = offset.max(chunk_start) - chunk_start;
            let to = (offset + len).min(chunk_start + CHUNK_SIZE as u64) - chunk_start;
            out.extend_from_slice(&chunk[from as usize..to as usize]);
        }
        Ok(out)
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<Buffer, BufferError> {
        let len = data.len() as u64;
        check_range(offset, len)?;
        let mut tree = self.tree.clone();
        for index in chunk_span(offset, len) {
            let mut chunk = tree.get_chunk(index)?;
            let chunk_start = index * CHUNK_SIZE as u64;
            let from = offset.max(chunk_start);
            let to = (offset + len).min(chunk_start + CHUNK_SIZE as u64);
            let src = &data[(from - offset) as usize..(to - offset) as usize];
            chunk[(from - chunk_start) as usize..(to - chunk_start) as usize].copy_from_slice(src);
            tree = tree.set_chunk(index, chunk)?;
        }
        Ok(Self::from_tree(tree))
    }

    pub fn get_proof(&self, chunk_index: u64) -> Result<MerkleProof, BufferError> {
        Ok(self.tree.get_proof(chunk_index)?)
    }

    /// Same commitment, but only the listed chunks stay readable.
    pub fn prune(&self, chunks: &BTreeSet<u64>) -> Buffer {
        Self {
            tree: self.tree.prune(chunks),
            hash: self.hash,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merkle::verify_merkle_proof;

    #[test]
    fn read_back_what_was_written_across_chunks() {
        let data: Vec<u8> = (0u8..80).collect();
        let buf = Buffer::new().write(20, &data).unwrap();
        assert_eq!(buf.read(20, 80).unwrap(), data);
        assert_eq!(buf.read(0, 20).unwrap(), vec![0u8; 20]);
        assert_eq!(buf.read(99, 3).unwrap(), vec![79, 0, 0]);
    }

    #[test]
    fn from_bytes_matches_write() {
        let data = b"deterministic".repeat(7);
        let a = Buffer::from_bytes(&data).unwrap();
        let b = Buffer::new().write(0, &data).unwrap();
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a, b);
    }

    #[test]
    fn trailing_zeroes_do_not_change_hash() {
        let a = Buffer::from_bytes(&[1, 2, 3]).unwrap();
        let b = Buffer::from_bytes(&[1, 2, 3, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0])
            .unwrap();
        assert_eq!(a.hash(), b.hash());
        assert_eq!(Buffer::from_bytes(&[0u8; 100]).unwrap(), Buffer::new());
    }

    #[test]
    fn out_of_bounds_read_and_write() {
        let buf = Buffer::new();
        assert_eq!(
            buf.read(MAX_BUFFER_LEN - 1, 2),
            Err(BufferError::OutOfBounds {
                offset: MAX_BUFFER_LEN - 1,
                len: 2
            })
        );
        assert!(buf.read(MAX_BUFFER_LEN - 1, 1).is_ok());
        assert!(matches!(
            buf.write(u64::MAX, &[1]),
            Err(BufferError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn pruned_buffer_serves_touched_range_only() {
        let data: Vec<u8> = (0..200u32).map(|i| (i % 251) as u8 + 1).collect();
        let buf = Buffer::from_bytes(&data).unwrap();
        let keep: BTreeSet<u64> = chunk_span(70, 8).collect();
        let pruned = buf.prune(&keep);

        assert_eq!(pruned.hash(), buf.hash());
        assert_eq!(pruned.read(70, 8).unwrap(), buf.read(70, 8).unwrap());
        assert_eq!(pruned.read(0, 1), Err(BufferError::Hidden(0)));

        let written_full = buf.write(72, &[0xee; 4]).unwrap();
        let written_pruned = pruned.write(72, &[0xee; 4]).unwrap();
        assert_eq!(written_full.hash(), written_pruned.hash());
    }

    #[test]
    fn chunk_proof_verifies_against_merkle_hash() {
        let buf = Buffer::from_bytes(&[7u8; 100]).unwrap();
        let proof = buf.get_proof(2).unwrap();
        let mut chunk = [0u8; CHUNK_SIZE];
        chunk[..4].copy_from_slice(&[7u8; 4]);
        assert!(verify_merkle_proof(&chunk, &proof, &buf.merkle_hash()));
    }

    #[test]
    fn chunk_span_bounds() {
        assert_eq!(chunk_span(0, 0), 0..0);
        assert_eq!(chunk_span(31, 1), 0..1);
        assert_eq!(chunk_span(31, 2), 0..2);
        assert_eq!(chunk_span(64, 32), 2..3);
    }
}
