//! Hash-linked code.
//!
//! Each code point commits to its operation and to the hash of the point that
//! follows it, so the hash of a segment's head commits to the whole segment.
//! Execution walks a segment from the head towards pc 0, which always holds
//! the error sentinel.

pub mod opcode;
pub mod segment;
pub mod table;

pub use opcode::{Opcode, UNKNOWN_OPCODE_GAS};
pub use segment::{Code, CodeError, CodePoint};
pub use table::{TableError, make_table, table_lookup};

use crate::transcript::{Hash256, Transcript};
use crate::value::{TAG_CODE_POINT, Value};
use once_cell::sync::Lazy;
use std::fmt;

static ERROR_CODE_POINT_HASH: Lazy<Hash256> =
    Lazy::new(|| Operation::new(Opcode::Error).code_point_hash(&Hash256::ZERO));

/// Hash of the sentinel that terminates every segment.
pub fn error_code_point_hash() -> Hash256 {
    *ERROR_CODE_POINT_HASH
}

/// An opcode byte with an optional immediate operand.
///
/// The byte is kept raw so that unknown opcodes can be stored and hashed;
/// they fault only when executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub code: u8,
    pub immediate: Option<Value>,
}

impl Operation {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            code: opcode as u8,
            immediate: None,
        }
    }

    pub fn with_immediate(opcode: Opcode, immediate: Value) -> Self {
        Self {
            code: opcode as u8,
            immediate: Some(immediate),
        }
    }

    pub fn raw(code: u8, immediate: Option<Value>) -> Self {
        Self { code, immediate }
    }

    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::try_from(self.code).ok()
    }

    /// Gas charged before the operation takes effect.
    pub fn base_gas(&self) -> u64 {
        self.opcode().map_or(UNKNOWN_OPCODE_GAS, Opcode::base_gas)
    }

    /// `H(1 ‖ opcode ‖ [immediate hash] ‖ next)`.
    pub fn code_point_hash(&self, next: &Hash256) -> Hash256 {
        let mut t = Transcript::new(TAG_CODE_POINT);
        t.absorb_u8(self.code);
        if let Some(imm) = &self.immediate {
            t.absorb_hash(&imm.hash());
        }
        t.absorb_hash(next);
        t.finalize()
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.opcode() {
            Some(op) => write!(f, "{op:?}")?,
            None => write!(f, "0x{:02x}", self.code)?,
        }
        if let Some(imm) = &self.immediate {
            write!(f, " [{}]", imm.hash())?;
        }
        Ok(())
    }
}

/// Location of a code point inside a [`Code`] store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodePointRef {
    pub segment: u64,
    pub pc: u64,
}

/// Reference to a code point together with its hash.
///
/// Only the hash takes part in value hashing; the reference lets the owner of
/// the code store find the operation again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodePointStub {
    pub pc: CodePointRef,
    pub hash: Hash256,
    /// `H(1 ‖ hash)`, the stub's hash as a value.
    value_hash: Hash256,
}

static ERROR_POINT: Lazy<CodePointStub> = Lazy::new(|| {
    CodePointStub::new(CodePointRef { segment: 0, pc: 0 }, error_code_point_hash())
});

impl CodePointStub {
    pub fn new(pc: CodePointRef, hash: Hash256) -> Self {
        let value_hash = Transcript::new(TAG_CODE_POINT).absorb_hash(&hash).finalize();
        Self {
            pc,
            hash,
            value_hash,
        }
    }

    pub fn value_hash(&self) -> Hash256 {
        self.value_hash
    }

    /// The sentinel of segment 0.
    pub fn error_point() -> Self {
        *ERROR_POINT
    }

    pub fn is_error_point(&self) -> bool {
        self.hash == error_code_point_hash()
    }
}

impl fmt::Display for CodePointStub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pc.segment, self.pc.pc)
    }
}
