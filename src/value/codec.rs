//! Byte encoding of values.
//!
//! Values are written as a one-byte tag followed by a payload:
//!
//! | tag | payload                                   |
//! |-----|-------------------------------------------|
//! | 0   | 32-byte big-endian integer                |
//! | 1   | segment (u64 BE), pc (u64 BE), 32-byte hash |
//! | 2   | 32-byte hash                              |
//! | 3   | arity byte, then each child               |
//! | 12  | buffer tree, root first                   |
//!
//! Buffer trees are written node by node: `0` zero subtree, `1` followed by a
//! chunk (leaves only), `2` followed by both children, `3` followed by the hash
//! of a hidden subtree.

use super::{
    Buffer, MAX_TUPLE_ARITY, TAG_BUFFER, TAG_CODE_POINT, TAG_HASH_ONLY, TAG_INT, TAG_TUPLE,
    Tuple, Uint256, Value,
};
use crate::code::{CodePointRef, CodePointStub};
use crate::merkle::{CHUNK_SIZE, MerkleNode, MerkleTree, TREE_DEPTH};
use crate::transcript::Hash256;

const NODE_ZERO: u8 = 0;
const NODE_LEAF: u8 = 1;
const NODE_BRANCH: u8 = 2;
const NODE_OPAQUE: u8 = 3;

/// Deepest tuple nesting accepted from untrusted input.
pub const MAX_DECODE_DEPTH: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("unexpected end of input at byte {0}")]
    UnexpectedEof(usize),
    #[error("unknown value tag {0}")]
    UnknownTag(u8),
    #[error("tuple arity {0} out of range")]
    Arity(usize),
    #[error("malformed buffer node {tag} at height {height}")]
    BadNode { tag: u8, height: u32 },
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),
    #[error("tuples nested deeper than {0}")]
    TooDeep(usize),
}

/// Cursor over an input slice.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            depth: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < len {
            return Err(CodecError::UnexpectedEof(self.data.len()));
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.read_bytes(8)?);
        Ok(u64::from_be_bytes(raw))
    }

    pub fn read_array32(&mut self) -> Result<[u8; 32], CodecError> {
        let mut raw = [0u8; 32];
        raw.copy_from_slice(self.read_bytes(32)?);
        Ok(raw)
    }

    pub fn read_hash(&mut self) -> Result<Hash256, CodecError> {
        Ok(Hash256(self.read_array32()?))
    }

    pub fn read_value(&mut self) -> Result<Value, CodecError> {
        let tag = self.read_u8()?;
        match tag {
            TAG_INT => Ok(Value::Int(Uint256::from_be_bytes(&self.read_array32()?))),
            TAG_CODE_POINT => {
                let segment = self.read_u64()?;
                let pc = self.read_u64()?;
                let hash = self.read_hash()?;
                Ok(Value::CodePoint(CodePointStub::new(
                    CodePointRef { segment, pc },
                    hash,
                )))
            }
            TAG_HASH_ONLY => Ok(Value::HashOnly(self.read_hash()?)),
            TAG_TUPLE => {
                let arity = self.read_u8()? as usize;
                if arity > MAX_TUPLE_ARITY {
                    return Err(CodecError::Arity(arity));
                }
                if self.depth >= MAX_DECODE_DEPTH {
                    return Err(CodecError::TooDeep(MAX_DECODE_DEPTH));
                }
                self.depth += 1;
                let mut items = Vec::with_capacity(arity);
                for _ in 0..arity {
                    items.push(self.read_value()?);
                }
                self.depth -= 1;
                Tuple::new(items)
                    .map(Value::Tuple)
                    .map_err(|_| CodecError::Arity(arity))
            }
            TAG_BUFFER => {
                let root = self.read_node(TREE_DEPTH)?;
                Ok(Value::Buffer(Buffer::from_tree(MerkleTree::from_root_node(root))))
            }
            other => Err(CodecError::UnknownTag(other)),
        }
    }

    fn read_node(&mut self, height: u32) -> Result<MerkleNode, CodecError> {
        let tag = self.read_u8()?;
        match tag {
            NODE_ZERO => Ok(MerkleNode::Zero),
            NODE_LEAF if height == 0 => {
                let mut chunk = [0u8; CHUNK_SIZE];
                chunk.copy_from_slice(self.read_bytes(CHUNK_SIZE)?);
                Ok(MerkleNode::leaf(chunk))
            }
            NODE_BRANCH if height > 0 => {
                let left = self.read_node(height - 1)?;
                let right = self.read_node(height - 1)?;
                Ok(MerkleNode::branch(left, right, height))
            }
            NODE_OPAQUE => Ok(MerkleNode::Opaque(self.read_hash()?)),
            tag => Err(CodecError::BadNode { tag, height }),
        }
    }
}

pub fn write_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Int(n) => {
            out.push(TAG_INT);
            out.extend_from_slice(&n.to_be_bytes());
        }
        Value::CodePoint(stub) => {
            out.push(TAG_CODE_POINT);
            out.extend_from_slice(&stub.pc.segment.to_be_bytes());
            out.extend_from_slice(&stub.pc.pc.to_be_bytes());
            out.extend_from_slice(stub.hash.as_bytes());
        }
        Value::HashOnly(hash) => {
            out.push(TAG_HASH_ONLY);
            out.extend_from_slice(hash.as_bytes());
        }
        Value::Tuple(t) => {
            out.push(TAG_TUPLE);
            out.push(t.len() as u8);
            for item in t.items() {
                write_value(out, item);
            }
        }
        Value::Buffer(b) => {
            out.push(TAG_BUFFER);
            write_node(out, b.tree().root_node());
        }
    }
}

fn write_node(out: &mut Vec<u8>, node: &MerkleNode) {
    match node {
        MerkleNode::Zero => out.push(NODE_ZERO),
        MerkleNode::Leaf(chunk) => {
            out.push(NODE_LEAF);
            out.extend_from_slice(&chunk[..]);
        }
        MerkleNode::Branch(b) => {
            out.push(NODE_BRANCH);
            write_node(out, &b.left);
            write_node(out, &b.right);
        }
        MerkleNode::Opaque(hash) => {
            out.push(NODE_OPAQUE);
            out.extend_from_slice(hash.as_bytes());
        }
    }
}

pub fn encode_value(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_value(&mut out, value);
    out
}

/// Decodes exactly one value; trailing input is an error.
pub fn decode_value(bytes: &[u8]) -> Result<Value, CodecError> {
    let mut reader = Reader::new(bytes);
    let value = reader.read_value()?;
    match reader.remaining() {
        0 => Ok(value),
        n => Err(CodecError::TrailingBytes(n)),
    }
}
