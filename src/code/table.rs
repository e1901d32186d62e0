//! Jump tables: code point stubs packed into a tree of tuples.
//!
//! Leaves hold up to eight consecutive stubs. Levels are grouped by eight
//! until at most eight nodes remain, which become the root. Every leaf sits at
//! the same depth, so an index is resolved by its base-8 digits, most
//! significant first.

use super::CodePointStub;
use crate::value::{MAX_TUPLE_ARITY, Tuple, Value};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    #[error("index {0} is outside the table")]
    OutOfRange(u64),
    #[error("table entry is not a code point")]
    NotACodePoint,
    #[error("table node is not a tuple")]
    NotATuple,
    #[error("table node is hidden behind a hash commitment")]
    Hidden,
}

fn group(level: Vec<Value>) -> Vec<Value> {
    level
        .chunks(MAX_TUPLE_ARITY)
        .map(|chunk| Value::Tuple(Tuple::bounded(chunk.to_vec())))
        .collect()
}

pub fn make_table(stubs: &[CodePointStub]) -> Value {
    let mut level = group(stubs.iter().copied().map(Value::CodePoint).collect());
    while level.len() > 1 {
        level = group(level);
    }
    level.pop().unwrap_or_else(Value::empty_tuple)
}

fn as_tuple(value: &Value) -> Result<&Tuple, TableError> {
    match value {
        Value::Tuple(t) => Ok(t),
        Value::HashOnly(_) => Err(TableError::Hidden),
        _ => Err(TableError::NotATuple),
    }
}

/// Number of tuple levels between the root and the stubs.
fn depth(table: &Value) -> Result<u32, TableError> {
    let mut node = table;
    let mut depth = 0;
    loop {
        let t = as_tuple(node)?;
        depth += 1;
        match t.get(0) {
            Some(Value::CodePoint(_)) => return Ok(depth),
            Some(child) => node = child,
            None => return Ok(0),
        }
    }
}

pub fn table_lookup(table: &Value, index: u64) -> Result<CodePointStub, TableError> {
    let depth = depth(table)?;
    if depth == 0 || (depth < 22 && index >= 8u64.pow(depth)) {
        return Err(TableError::OutOfRange(index));
    }
    let mut node = table;
    for level in (0..depth).rev() {
        let digit = index.checked_shr(3 * level).unwrap_or(0) & 7;
        node = as_tuple(node)?
            .get(digit as usize)
            .ok_or(TableError::OutOfRange(index))?;
    }
    match node {
        Value::CodePoint(stub) => Ok(*stub),
        Value::HashOnly(_) => Err(TableError::Hidden),
        _ => Err(TableError::NotACodePoint),
    }
}
