//! Value model: tagged, immutable, content-hashed machine values.
//!
//! Every value commits to its contents through `hash()`. The hash combines a
//! type discriminant with the hashes of the children, so structurally equal
//! values always hash equally and a `HashOnly` commitment can stand in for any
//! value whose contents are not needed.

pub mod buffer;
pub mod codec;
pub mod int;

pub use buffer::{Buffer, BufferError, MAX_BUFFER_LEN};
pub use int::Uint256;

use crate::code::CodePointStub;
use crate::transcript::{Hash256, Transcript};
use once_cell::sync::{Lazy, OnceCell};
use std::fmt;
use std::sync::Arc;

pub const TAG_INT: u8 = 0;
pub const TAG_CODE_POINT: u8 = 1;
pub const TAG_HASH_ONLY: u8 = 2;
pub const TAG_TUPLE: u8 = 3;
pub const TAG_BUFFER: u8 = 12;

pub const MAX_TUPLE_ARITY: usize = 8;

static EMPTY_TUPLE_HASH: Lazy<Hash256> = Lazy::new(|| Tuple::empty().hash());

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValueError {
    #[error("tuple arity {0} exceeds the maximum of 8")]
    ArityError(usize),
}

struct TupleInner {
    items: Vec<Value>,
    hash: OnceCell<Hash256>,
}

impl Drop for TupleInner {
    // Deeply nested tuples are unlinked with a work list, not recursion.
    fn drop(&mut self) {
        let mut pending = std::mem::take(&mut self.items);
        while let Some(value) = pending.pop() {
            if let Value::Tuple(Tuple(inner)) = value {
                if let Ok(mut inner) = Arc::try_unwrap(inner) {
                    pending.append(&mut inner.items);
                }
            }
        }
    }
}

/// Ordered, fixed-arity composite. Children are shared, never mutated.
#[derive(Clone)]
pub struct Tuple(Arc<TupleInner>);

impl Tuple {
    pub fn new(items: Vec<Value>) -> Result<Self, ValueError> {
        if items.len() > MAX_TUPLE_ARITY {
            return Err(ValueError::ArityError(items.len()));
        }
        Ok(Self(Arc::new(TupleInner {
            items,
            hash: OnceCell::new(),
        })))
    }

    pub fn empty() -> Self {
        Self(Arc::new(TupleInner {
            items: Vec::new(),
            hash: OnceCell::new(),
        }))
    }

    /// Caller guarantees `items.len() <= MAX_TUPLE_ARITY`.
    pub(crate) fn bounded(items: Vec<Value>) -> Self {
        debug_assert!(items.len() <= MAX_TUPLE_ARITY);
        Self(Arc::new(TupleInner {
            items,
            hash: OnceCell::new(),
        }))
    }

    /// Two-element tuple; cannot exceed the arity bound.
    pub fn pair(first: Value, second: Value) -> Self {
        Self(Arc::new(TupleInner {
            items: vec![first, second],
            hash: OnceCell::new(),
        }))
    }

    pub fn len(&self) -> usize {
        self.0.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.items.get(index)
    }

    pub fn items(&self) -> &[Value] {
        &self.0.items
    }

    /// Copy of this tuple with slot `index` replaced, or `None` past the end.
    pub fn with(&self, index: usize, value: Value) -> Option<Tuple> {
        if index >= self.len() {
            return None;
        }
        let mut items = self.0.items.clone();
        items[index] = value;
        Some(Self(Arc::new(TupleInner {
            items,
            hash: OnceCell::new(),
        })))
    }

    pub fn hash(&self) -> Hash256 {
        *self.0.hash.get_or_init(|| {
            let mut t = Transcript::new(TAG_TUPLE);
            t.absorb_u8(self.len() as u8);
            for item in &self.0.items {
                t.absorb_hash(&item.hash());
            }
            t.finalize()
        })
    }
}

impl fmt::Debug for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.items()).finish()
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    Int(Uint256),
    Tuple(Tuple),
    CodePoint(CodePointStub),
    Buffer(Buffer),
    /// Opaque commitment to a value whose contents are not available.
    HashOnly(Hash256),
}

impl Value {
    pub fn int(value: u64) -> Value {
        Value::Int(Uint256::from_u64(value))
    }

    pub fn empty_tuple() -> Value {
        Value::Tuple(Tuple::empty())
    }

    pub fn empty_tuple_hash() -> Hash256 {
        *EMPTY_TUPLE_HASH
    }

    pub fn tuple(items: Vec<Value>) -> Result<Value, ValueError> {
        Ok(Value::Tuple(Tuple::new(items)?))
    }

    pub fn hash(&self) -> Hash256 {
        match self {
            Value::Int(n) => n.value_hash(),
            Value::Tuple(t) => t.hash(),
            Value::CodePoint(stub) => stub.value_hash(),
            Value::Buffer(b) => b.hash(),
            Value::HashOnly(h) => *h,
        }
    }

    pub fn type_code(&self) -> u8 {
        match self {
            Value::Int(_) => TAG_INT,
            Value::Tuple(_) => TAG_TUPLE,
            Value::CodePoint(_) => TAG_CODE_POINT,
            Value::Buffer(_) => TAG_BUFFER,
            Value::HashOnly(_) => TAG_HASH_ONLY,
        }
    }

    pub fn is_hash_only(&self) -> bool {
        matches!(self, Value::HashOnly(_))
    }

    /// Replaces the value by its commitment.
    pub fn to_hash_only(&self) -> Value {
        Value::HashOnly(self.hash())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        if self.hash() != other.hash() {
            return false;
        }
        match (self, other) {
            (Value::HashOnly(_), _) | (_, Value::HashOnly(_)) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a.items() == b.items(),
            (Value::CodePoint(a), Value::CodePoint(b)) => a.hash == b.hash,
            (Value::Buffer(a), Value::Buffer(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl From<Uint256> for Value {
    fn from(n: Uint256) -> Self {
        Value::Int(n)
    }
}

impl From<Buffer> for Value {
    fn from(b: Buffer) -> Self {
        Value::Buffer(b)
    }
}

impl From<Tuple> for Value {
    fn from(t: Tuple) -> Self {
        Value::Tuple(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuple_arity_is_bounded() {
        let items = vec![Value::int(0); 9];
        assert_eq!(Tuple::new(items).unwrap_err(), ValueError::ArityError(9));
        assert!(Tuple::new(vec![Value::int(0); 8]).is_ok());
    }

    #[test]
    fn structurally_equal_values_hash_equally() {
        let a = Value::tuple(vec![Value::int(1), Value::Buffer(Buffer::new())]).unwrap();
        let b = Value::tuple(vec![Value::int(1), Value::Buffer(Buffer::new())]).unwrap();
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a, b);

        let c = Value::tuple(vec![Value::int(2), Value::Buffer(Buffer::new())]).unwrap();
        assert_ne!(a.hash(), c.hash());
        assert_ne!(a, c);
    }

    #[test]
    fn hash_only_stands_in_for_its_value() {
        let inner = Value::tuple(vec![Value::int(7), Value::int(8)]).unwrap();
        let full = Value::tuple(vec![Value::int(1), inner.clone()]).unwrap();
        let partial = Value::tuple(vec![Value::int(1), inner.to_hash_only()]).unwrap();
        assert_eq!(full.hash(), partial.hash());
        assert_eq!(full, partial);
    }

    #[test]
    fn type_discriminant_separates_variants() {
        // An int and a one-element tuple holding it must not collide.
        let n = Value::int(0);
        let t = Value::tuple(vec![Value::int(0)]).unwrap();
        assert_ne!(n.hash(), t.hash());
        assert_ne!(Value::empty_tuple().hash(), Value::Buffer(Buffer::new()).hash());
    }

    #[test]
    fn tuple_with_is_copy_on_write() {
        let t = Tuple::new(vec![Value::int(1), Value::int(2)]).unwrap();
        let u = t.with(1, Value::int(3)).unwrap();
        assert_eq!(t.get(1), Some(&Value::int(2)));
        assert_eq!(u.get(1), Some(&Value::int(3)));
        assert!(t.with(2, Value::int(0)).is_none());
    }

    #[test]
    fn hash_is_cached() {
        let t = Tuple::new(vec![Value::int(5)]).unwrap();
        let first = t.hash();
        assert_eq!(t.0.hash.get(), Some(&first));
        assert_eq!(t.hash(), first);
    }

    #[test]
    fn deeply_nested_tuple_drops_without_recursion() {
        let mut value = Value::empty_tuple();
        for i in 0..300_000u64 {
            let pair = Tuple::pair(Value::int(i), value);
            pair.hash();
            value = Value::Tuple(pair);
        }
        let shared = value.clone();
        drop(value);
        assert_eq!(shared.type_code(), TAG_TUPLE);
        drop(shared);
    }
}
