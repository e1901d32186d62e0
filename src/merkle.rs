//! Fixed-depth sparse Merkle tree over 32-byte chunks.
//!
//! Buffers are committed to as the root of this tree, so a single chunk can be
//! revealed together with its sibling path instead of the whole buffer. Empty
//! subtrees are never materialised: their hashes come from a precomputed
//! table, and a subtree that a proof does not need is replaced by its hash.

use crate::digest_sha2;
use crate::transcript::Hash256;
use once_cell::sync::Lazy;
use std::collections::BTreeSet;
use std::sync::Arc;

pub const CHUNK_SIZE: usize = 32;
/// Height of the root. 2^27 chunks of 32 bytes give a 4 GiB address space.
pub const TREE_DEPTH: u32 = 27;
pub const CHUNK_COUNT: u64 = 1 << TREE_DEPTH;

pub type Chunk = [u8; CHUNK_SIZE];

static ZERO_HASHES: Lazy<Vec<Hash256>> = Lazy::new(|| {
    let mut hashes = Vec::with_capacity(TREE_DEPTH as usize + 1);
    let mut current = Hash256(digest_sha2(&[0u8; CHUNK_SIZE]));
    hashes.push(current);
    for _ in 0..TREE_DEPTH {
        current = hash_pair(&current, &current);
        hashes.push(current);
    }
    hashes
});

/// Hash of an all-zero subtree of the given height.
pub fn zero_hash(height: u32) -> Hash256 {
    ZERO_HASHES[height as usize]
}

fn hash_pair(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut combined = [0u8; 64];
    combined[..32].copy_from_slice(&left.0);
    combined[32..].copy_from_slice(&right.0);
    Hash256(digest_sha2(&combined))
}

fn hash_leaf(chunk: &Chunk) -> Hash256 {
    Hash256(digest_sha2(chunk))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MerkleError {
    #[error("chunk {0} is outside the tree")]
    OutOfRange(u64),
    #[error("chunk {0} is hidden behind a hash commitment")]
    Hidden(u64),
    #[error("leaf node found at height {0}")]
    Malformed(u32),
}

#[derive(Debug, Clone)]
pub enum MerkleNode {
    /// All-zero subtree.
    Zero,
    /// Non-zero chunk, only ever at height 0.
    Leaf(Arc<Chunk>),
    Branch(Arc<Branch>),
    /// Subtree known only by its hash.
    Opaque(Hash256),
}

#[derive(Debug)]
pub struct Branch {
    pub left: MerkleNode,
    pub right: MerkleNode,
    hash: Hash256,
}

impl MerkleNode {
    pub fn hash(&self, height: u32) -> Hash256 {
        match self {
            MerkleNode::Zero => zero_hash(height),
            MerkleNode::Leaf(chunk) => hash_leaf(chunk),
            MerkleNode::Branch(branch) => branch.hash,
            MerkleNode::Opaque(hash) => *hash,
        }
    }

    pub(crate) fn leaf(chunk: Chunk) -> Self {
        if chunk == [0u8; CHUNK_SIZE] {
            MerkleNode::Zero
        } else {
            MerkleNode::Leaf(Arc::new(chunk))
        }
    }

    /// Joins two children of `height - 1`; two zero children collapse to `Zero`.
    pub(crate) fn branch(left: MerkleNode, right: MerkleNode, height: u32) -> Self {
        if matches!((&left, &right), (MerkleNode::Zero, MerkleNode::Zero)) {
            return MerkleNode::Zero;
        }
        let hash = hash_pair(&left.hash(height - 1), &right.hash(height - 1));
        MerkleNode::Branch(Arc::new(Branch { left, right, hash }))
    }

    fn is_complete(&self) -> bool {
        match self {
            MerkleNode::Zero | MerkleNode::Leaf(_) => true,
            MerkleNode::Opaque(_) => false,
            MerkleNode::Branch(b) => b.left.is_complete() && b.right.is_complete(),
        }
    }
}

#[derive(Debug)]
pub struct MerkleProof {
    /// Sibling hashes from the leaf level up to just below the root.
    pub path: Vec<Hash256>,
    /// `true` when the node on the path is the right child at that level.
    pub position: Vec<bool>,
}

#[derive(Debug, Clone)]
pub struct MerkleTree {
    root: MerkleNode,
}

impl Default for MerkleTree {
    fn default() -> Self {
        Self::new()
    }
}

impl MerkleTree {
    pub fn new() -> Self {
        Self {
            root: MerkleNode::Zero,
        }
    }

    pub fn from_chunks(chunks: &[Chunk]) -> Result<Self, MerkleError> {
        if chunks.len() as u64 > CHUNK_COUNT {
            return Err(MerkleError::OutOfRange(chunks.len() as u64));
        }
        Ok(Self {
            root: build(chunks, TREE_DEPTH, 0),
        })
    }

    pub(crate) fn from_root_node(root: MerkleNode) -> Self {
        Self { root }
    }

    pub(crate) fn root_node(&self) -> &MerkleNode {
        &self.root
    }

    pub fn root(&self) -> Hash256 {
        self.root.hash(TREE_DEPTH)
    }

    /// Whether every chunk is locally available (no hidden subtrees).
    pub fn is_complete(&self) -> bool {
        self.root.is_complete()
    }

    pub fn get_chunk(&self, index: u64) -> Result<Chunk, MerkleError> {
        if index >= CHUNK_COUNT {
            return Err(MerkleError::OutOfRange(index));
        }
        let mut node = &self.root;
        let mut height = TREE_DEPTH;
        loop {
            match node {
                MerkleNode::Zero => return Ok([0u8; CHUNK_SIZE]),
                MerkleNode::Opaque(_) => return Err(MerkleError::Hidden(index)),
                MerkleNode::Leaf(chunk) => {
                    if height != 0 {
                        return Err(MerkleError::Malformed(height));
                    }
                    return Ok(**chunk);
                }
                MerkleNode::Branch(b) => {
                    height -= 1;
                    node = if (index >> height) & 1 == 0 {
                        &b.left
                    } else {
                        &b.right
                    };
                }
            }
        }
    }

    /// Returns a new tree with chunk `index` replaced. The receiver is untouched.
    pub fn set_chunk(&self, index: u64, chunk: Chunk) -> Result<Self, MerkleError> {
        if index >= CHUNK_COUNT {
            return Err(MerkleError::OutOfRange(index));
        }
        Ok(Self {
            root: set_at(&self.root, TREE_DEPTH, index, chunk)?,
        })
    }

    pub fn get_proof(&self, index: u64) -> Result<MerkleProof, MerkleError> {
        if index >= CHUNK_COUNT {
            return Err(MerkleError::OutOfRange(index));
        }
        let mut path = Vec::with_capacity(TREE_DEPTH as usize);
        let mut position = Vec::with_capacity(TREE_DEPTH as usize);
        let mut node = self.root.clone();
        let mut height = TREE_DEPTH;
        while height > 0 {
            let (left, right) = match &node {
                MerkleNode::Zero => (MerkleNode::Zero, MerkleNode::Zero),
                MerkleNode::Branch(b) => (b.left.clone(), b.right.clone()),
                MerkleNode::Opaque(_) => return Err(MerkleError::Hidden(index)),
                MerkleNode::Leaf(_) => return Err(MerkleError::Malformed(height)),
            };
            height -= 1;
            if (index >> height) & 1 == 0 {
                path.push(right.hash(height));
                position.push(false);
                node = left;
            } else {
                path.push(left.hash(height));
                position.push(true);
                node = right;
            }
        }
        path.reverse();
        position.reverse();
        Ok(MerkleProof { path, position })
    }

    /// Keeps only the chunks in `keep`; every other subtree is replaced by
    /// its hash. The root hash is unchanged.
    pub fn prune(&self, keep: &BTreeSet<u64>) -> Self {
        Self {
            root: prune_node(&self.root, TREE_DEPTH, 0, keep),
        }
    }
}

fn build(chunks: &[Chunk], height: u32, base: u64) -> MerkleNode {
    if base >= chunks.len() as u64 {
        return MerkleNode::Zero;
    }
    if height == 0 {
        return MerkleNode::leaf(chunks[base as usize]);
    }
    let half = 1u64 << (height - 1);
    MerkleNode::branch(
        build(chunks, height - 1, base),
        build(chunks, height - 1, base + half),
        height,
    )
}

fn set_at(node: &MerkleNode, height: u32, index: u64, chunk: Chunk) -> Result<MerkleNode, MerkleError> {
    if height == 0 {
        return Ok(MerkleNode::leaf(chunk));
    }
    let (left, right) = match node {
        MerkleNode::Zero => (MerkleNode::Zero, MerkleNode::Zero),
        MerkleNode::Branch(b) => (b.left.clone(), b.right.clone()),
        MerkleNode::Opaque(_) => return Err(MerkleError::Hidden(index)),
        MerkleNode::Leaf(_) => return Err(MerkleError::Malformed(height)),
    };
    let child = height - 1;
    if (index >> child) & 1 == 0 {
        Ok(MerkleNode::branch(set_at(&left, child, index, chunk)?, right, height))
    } else {
        Ok(MerkleNode::branch(left, set_at(&right, child, index, chunk)?, height))
    }
}

fn prune_node(node: &MerkleNode, height: u32, base: u64, keep: &BTreeSet<u64>) -> MerkleNode {
    let span = 1u64 << height;
    if keep.range(base..base + span).next().is_none() {
        return match node {
            MerkleNode::Zero => MerkleNode::Zero,
            other => MerkleNode::Opaque(other.hash(height)),
        };
    }
    match node {
        MerkleNode::Branch(b) => {
            let half = span / 2;
            MerkleNode::Branch(Arc::new(Branch {
                left: prune_node(&b.left, height - 1, base, keep),
                right: prune_node(&b.right, height - 1, base + half, keep),
                hash: b.hash,
            }))
        }
        other => other.clone(),
    }
}

pub fn verify_merkle_proof(chunk: &Chunk, proof: &MerkleProof, root: &Hash256) -> bool {
    let mut current_hash = hash_leaf(chunk);

    for (sibling, is_right) in proof.path.iter().zip(proof.position.iter()) {
        current_hash = if *is_right {
            hash_pair(sibling, &current_hash)
        } else {
            hash_pair(&current_hash, sibling)
        };
    }

    current_hash == *root
}
