//! Persistent value stack.
//!
//! A stack hashes exactly like the right-nested tuple `(top, (next, (...,
//! ())))`, so any suffix can be replaced by its commitment without changing
//! the stack hash. Partial stacks carried in proofs end in such an opaque
//! suffix.

use crate::transcript::{Hash256, Transcript};
use crate::value::{TAG_TUPLE, Tuple, Value};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StackError {
    #[error("stack underflow")]
    Underflow,
    /// The remainder of the stack is known only by its hash.
    #[error("stack contents hidden behind a hash commitment")]
    Hidden,
    #[error("value is not a stack")]
    Malformed,
}

#[derive(Debug)]
pub struct StackNode {
    value: Value,
    rest: Stack,
    hash: Hash256,
}

#[derive(Debug, Clone, Default)]
pub enum Stack {
    #[default]
    Empty,
    Opaque(Hash256),
    Node(Arc<StackNode>),
}

impl Stack {
    pub fn new() -> Self {
        Stack::Empty
    }

    pub fn hash(&self) -> Hash256 {
        match self {
            Stack::Empty => Value::empty_tuple_hash(),
            Stack::Opaque(hash) => *hash,
            Stack::Node(node) => node.hash,
        }
    }

    pub fn push(&self, value: Value) -> Stack {
        let hash = Transcript::new(TAG_TUPLE)
            .absorb_u8(2)
            .absorb_hash(&value.hash())
            .absorb_hash(&self.hash())
            .finalize();
        Stack::Node(Arc::new(StackNode {
            value,
            rest: self.clone(),
            hash,
        }))
    }

    pub fn pop(&self) -> Result<(Value, Stack), StackError> {
        match self {
            Stack::Empty => Err(StackError::Underflow),
            Stack::Opaque(_) => Err(StackError::Hidden),
            Stack::Node(node) => Ok((node.value.clone(), node.rest.clone())),
        }
    }

    /// Top item and the stack below it, borrowed.
    pub fn split(&self) -> Option<(&Value, &Stack)> {
        match self {
            Stack::Node(node) => Some((&node.value, &node.rest)),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> Result<bool, StackError> {
        match self {
            Stack::Empty => Ok(true),
            Stack::Opaque(_) => Err(StackError::Hidden),
            Stack::Node(_) => Ok(false),
        }
    }

    /// Number of revealed items above the end or the opaque suffix.
    pub fn visible_len(&self) -> usize {
        let mut len = 0;
        let mut cur = self;
        while let Stack::Node(node) = cur {
            len += 1;
            cur = &node.rest;
        }
        len
    }

    /// Revealed items, top first.
    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        let mut cur = self;
        std::iter::from_fn(move || match cur {
            Stack::Node(node) => {
                cur = &node.rest;
                Some(&node.value)
            }
            _ => None,
        })
    }

    /// Keeps the top `depth` items and replaces the rest by its hash. An
    /// empty remainder stays explicit, so emptiness is always decidable.
    /// `reveal` maps each kept item.
    pub fn truncate_with(&self, depth: usize, reveal: &mut impl FnMut(&Value) -> Value) -> Stack {
        match self {
            Stack::Node(node) if depth > 0 => node
                .rest
                .truncate_with(depth - 1, reveal)
                .push(reveal(&node.value)),
            Stack::Node(node) => Stack::Opaque(node.hash),
            other => other.clone(),
        }
    }

    /// The end of the revealed part: `Empty` or an opaque suffix.
    fn bottom(&self) -> &Stack {
        let mut cur = self;
        while let Stack::Node(node) = cur {
            cur = &node.rest;
        }
        cur
    }

    /// Nested-pair form, built bottom up so every level's hash is cached.
    pub fn to_value(&self) -> Value {
        let mut out = match self.bottom() {
            Stack::Opaque(hash) => Value::HashOnly(*hash),
            _ => Value::empty_tuple(),
        };
        let items: Vec<&Value> = self.iter().collect();
        for item in items.into_iter().rev() {
            let pair = Tuple::pair(item.clone(), out);
            pair.hash();
            out = Value::Tuple(pair);
        }
        out
    }

    pub fn from_value(value: &Value) -> Result<Stack, StackError> {
        let mut items = Vec::new();
        let mut cur = value;
        let base = loop {
            match cur {
                Value::HashOnly(hash) if *hash == Value::empty_tuple_hash() => break Stack::Empty,
                Value::HashOnly(hash) => break Stack::Opaque(*hash),
                Value::Tuple(t) if t.is_empty() => break Stack::Empty,
                Value::Tuple(t) => match t.items() {
                    [top, rest] => {
                        items.push(top);
                        cur = rest;
                    }
                    _ => return Err(StackError::Malformed),
                },
                _ => return Err(StackError::Malformed),
            }
        };
        Ok(items
            .into_iter()
            .rev()
            .fold(base, |stack, item| stack.push(item.clone())))
    }
}

impl Drop for StackNode {
    // Unlinks long chains iteratively instead of recursing once per node.
    fn drop(&mut self) {
        let mut rest = std::mem::take(&mut self.rest);
        while let Stack::Node(node) = rest {
            match Arc::try_unwrap(node) {
                Ok(mut inner) => rest = std::mem::take(&mut inner.rest),
                Err(_) => break,
            }
        }
    }
}

impl PartialEq for Stack {
    fn eq(&self, other: &Self) -> bool {
        self.hash() == other.hash()
    }
}

impl Eq for Stack {}

impl FromIterator<Value> for Stack {
    /// Pushes in iteration order; the last item ends up on top.
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        iter.into_iter().fold(Stack::Empty, |stack, v| stack.push(v))
    }
}
