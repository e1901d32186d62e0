//! Content-addressed persistence of values and machine checkpoints.
//!
//! The core only needs `put(hash, bytes)` and `get(hash)`. Tuples are stored
//! as a node listing their children's hashes, so shared subtrees are stored
//! once; every other value is stored whole in the value codec. Machine stacks
//! are stored the same way, one `(item, rest)` node per cell, walked without
//! ever building the nested value. Whatever comes back from a store is
//! re-hashed before it is trusted.

use crate::code::CodePointStub;
use crate::transcript::Hash256;
use crate::value::codec::{CodecError, Reader, decode_value, encode_value, write_value};
use crate::value::{MAX_TUPLE_ARITY, TAG_HASH_ONLY, TAG_TUPLE, Tuple, Value};
use crate::vm::{MachineState, Stack, Status};
use std::collections::{HashMap, HashSet};
use tracing::debug;

const TAG_CHECKPOINT: u8 = 0x20;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("node {0} not found")]
    Missing(Hash256),
    #[error("node stored under {expected} hashes to {found}")]
    HashMismatch { expected: Hash256, found: Hash256 },
    #[error("corrupt node: {0}")]
    Corrupt(&'static str),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Key/value storage keyed by content hash.
pub trait NodeStore {
    fn put(&mut self, hash: Hash256, bytes: Vec<u8>);
    fn get(&self, hash: &Hash256) -> Option<Vec<u8>>;
}

#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    nodes: HashMap<Hash256, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl NodeStore for MemoryStore {
    fn put(&mut self, hash: Hash256, bytes: Vec<u8>) {
        self.nodes.insert(hash, bytes);
    }

    fn get(&self, hash: &Hash256) -> Option<Vec<u8>> {
        self.nodes.get(hash).cloned()
    }
}

/// A stored node is final unless it only records a commitment.
fn is_settled(store: &impl NodeStore, hash: &Hash256) -> bool {
    matches!(store.get(hash), Some(bytes) if bytes.first() != Some(&TAG_HASH_ONLY))
}

fn tuple_node(children: &[Hash256]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + 32 * children.len());
    out.push(TAG_TUPLE);
    out.push(children.len() as u8);
    for child in children {
        out.extend_from_slice(child.as_bytes());
    }
    out
}

/// Child hashes of a stored tuple node.
fn read_tuple_node(bytes: &[u8]) -> Result<Vec<Hash256>, StoreError> {
    let mut r = Reader::new(bytes.get(1..).unwrap_or_default());
    let arity = r.read_u8()? as usize;
    if arity > MAX_TUPLE_ARITY {
        return Err(CodecError::Arity(arity).into());
    }
    let children = (0..arity)
        .map(|_| r.read_hash())
        .collect::<Result<Vec<_>, _>>()?;
    if r.remaining() != 0 {
        return Err(CodecError::TrailingBytes(r.remaining()).into());
    }
    Ok(children)
}

/// Stores `value` and everything under it; returns its hash.
pub fn save_value(store: &mut impl NodeStore, value: &Value) -> Hash256 {
    let mut work = vec![value.clone()];
    while let Some(v) = work.pop() {
        let hash = v.hash();
        match &v {
            Value::HashOnly(_) => {
                if store.get(&hash).is_none() {
                    store.put(hash, encode_value(&v));
                }
            }
            _ if is_settled(store, &hash) => {}
            Value::Tuple(t) => {
                let children: Vec<Hash256> = t.items().iter().map(Value::hash).collect();
                store.put(hash, tuple_node(&children));
                work.extend(t.items().iter().cloned());
            }
            other => store.put(hash, encode_value(other)),
        }
    }
    value.hash()
}

enum Frame {
    Visit(Hash256),
    Build(Hash256, Vec<Hash256>),
}

fn check(expected: Hash256, value: &Value) -> Result<(), StoreError> {
    let found = value.hash();
    if found != expected {
        return Err(StoreError::HashMismatch { expected, found });
    }
    Ok(())
}

/// Loads the value stored under `hash`, verifying every node on the way.
pub fn load_value(store: &impl NodeStore, hash: &Hash256) -> Result<Value, StoreError> {
    let mut done: HashMap<Hash256, Value> = HashMap::new();
    let mut open: HashSet<Hash256> = HashSet::new();
    let mut work = vec![Frame::Visit(*hash)];

    while let Some(frame) = work.pop() {
        match frame {
            Frame::Visit(h) => {
                if done.contains_key(&h) {
                    continue;
                }
                // A node reachable from itself cannot have honest hashes.
                if !open.insert(h) {
                    return Err(StoreError::Corrupt("cycle"));
                }
                let bytes = store.get(&h).ok_or(StoreError::Missing(h))?;
                if bytes.first() == Some(&TAG_TUPLE) {
                    let children = read_tuple_node(&bytes)?;
                    work.push(Frame::Build(h, children.clone()));
                    work.extend(children.into_iter().rev().map(Frame::Visit));
                } else {
                    let value = decode_value(&bytes)?;
                    check(h, &value)?;
                    open.remove(&h);
                    done.insert(h, value);
                }
            }
            Frame::Build(h, children) => {
                let items = children
                    .iter()
                    .map(|c| done.get(c).cloned().ok_or(StoreError::Missing(*c)))
                    .collect::<Result<Vec<_>, _>>()?;
                let value = Value::Tuple(Tuple::bounded(items));
                check(h, &value)?;
                open.remove(&h);
                done.insert(h, value);
            }
        }
    }
    done.remove(hash).ok_or(StoreError::Missing(*hash))
}

/// Stores `stack` cell by cell, stopping at the first cell already stored.
fn save_stack(store: &mut impl NodeStore, stack: &Stack) -> Hash256 {
    let mut cur = stack;
    loop {
        match cur.split() {
            Some((item, rest)) => {
                let hash = cur.hash();
                if is_settled(store, &hash) {
                    break;
                }
                save_value(store, item);
                store.put(hash, tuple_node(&[item.hash(), rest.hash()]));
                cur = rest;
            }
            None => {
                save_value(store, &cur.to_value());
                break;
            }
        }
    }
    stack.hash()
}

fn load_stack(store: &impl NodeStore, hash: &Hash256) -> Result<Stack, StoreError> {
    let mut items = Vec::new();
    let mut seen = HashSet::new();
    let mut cur = *hash;
    let base = loop {
        if cur == Value::empty_tuple_hash() {
            break Stack::Empty;
        }
        if !seen.insert(cur) {
            return Err(StoreError::Corrupt("cycle"));
        }
        let bytes = store.get(&cur).ok_or(StoreError::Missing(cur))?;
        match bytes.first() {
            Some(&TAG_HASH_ONLY) => break Stack::Opaque(cur),
            Some(&TAG_TUPLE) => match read_tuple_node(&bytes)?.as_slice() {
                [item, rest] => {
                    items.push(load_value(store, item)?);
                    cur = *rest;
                }
                _ => return Err(StoreError::Corrupt("stack")),
            },
            _ => return Err(StoreError::Corrupt("stack")),
        }
    };
    let stack: Stack = items
        .into_iter()
        .rev()
        .fold(base, |stack, item| stack.push(item));
    let found = stack.hash();
    if found != *hash {
        return Err(StoreError::HashMismatch {
            expected: *hash,
            found,
        });
    }
    Ok(stack)
}

/// Checkpoints a machine under its state hash.
pub fn save_machine(store: &mut impl NodeStore, state: &MachineState) -> Hash256 {
    let data = save_stack(store, &state.data_stack);
    let aux = save_stack(store, &state.aux_stack);
    let register = save_value(store, &state.register);
    let static_value = save_value(store, &state.static_value);

    let mut record = vec![TAG_CHECKPOINT];
    write_value(&mut record, &Value::CodePoint(state.pc));
    record.extend_from_slice(data.as_bytes());
    record.extend_from_slice(aux.as_bytes());
    record.extend_from_slice(register.as_bytes());
    record.extend_from_slice(static_value.as_bytes());
    write_value(&mut record, &Value::CodePoint(state.error_handler));
    record.extend_from_slice(&state.gas_remaining.to_be_bytes());
    record.push(state.status as u8);

    let hash = state.hash();
    store.put(hash, record);
    debug!(%hash, gas = state.gas_remaining, status = %state.status, "machine checkpoint saved");
    hash
}

fn read_code_point(r: &mut Reader<'_>) -> Result<CodePointStub, StoreError> {
    match r.read_value()? {
        Value::CodePoint(stub) => Ok(stub),
        _ => Err(StoreError::Corrupt("expected a code point")),
    }
}

pub fn load_machine(store: &impl NodeStore, hash: &Hash256) -> Result<MachineState, StoreError> {
    let bytes = store.get(hash).ok_or(StoreError::Missing(*hash))?;
    let mut r = Reader::new(&bytes);
    if r.read_u8()? != TAG_CHECKPOINT {
        return Err(StoreError::Corrupt("not a machine checkpoint"));
    }
    let pc = read_code_point(&mut r)?;
    let data = r.read_hash()?;
    let aux = r.read_hash()?;
    let register = r.read_hash()?;
    let static_value = r.read_hash()?;
    let error_handler = read_code_point(&mut r)?;
    let gas_remaining = r.read_u64()?;
    let status = Status::try_from(r.read_u8()?).map_err(|_| StoreError::Corrupt("status byte"))?;
    if r.remaining() != 0 {
        return Err(CodecError::TrailingBytes(r.remaining()).into());
    }

    let state = MachineState {
        pc,
        data_stack: load_stack(store, &data)?,
        aux_stack: load_stack(store, &aux)?,
        register: load_value(store, &register)?,
        static_value: load_value(store, &static_value)?,
        error_handler,
        gas_remaining,
        status,
    };
    let found = state.hash();
    if found != *hash {
        return Err(StoreError::HashMismatch {
            expected: *hash,
            found,
        });
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::CodePointRef;
    use crate::value::Buffer;

    fn sample() -> Value {
        let shared = Value::tuple(vec![Value::int(1), Value::int(2)]).unwrap();
        let buffer = Buffer::new().write(70, b"stored").unwrap();
        Value::tuple(vec![
            shared.clone(),
            shared,
            Value::Buffer(buffer),
            Value::HashOnly(Hash256([5u8; 32])),
        ])
        .unwrap()
    }

    #[test]
    fn value_round_trip_shares_subtrees() {
        let mut store = MemoryStore::new();
        let value = sample();
        let hash = save_value(&mut store, &value);
        // root, shared pair, its two ints, buffer, commitment
        assert_eq!(store.len(), 6);
        let back = load_value(&store, &hash).unwrap();
        assert_eq!(back, value);
        assert_eq!(back.hash(), hash);
    }

    #[test]
    fn real_value_replaces_a_stored_commitment() {
        let mut store = MemoryStore::new();
        let inner = Value::int(42);
        save_value(&mut store, &inner.to_hash_only());
        save_value(&mut store, &inner);
        assert!(matches!(load_value(&store, &inner.hash()), Ok(Value::Int(_))));
        // And a later commitment does not clobber it.
        save_value(&mut store, &inner.to_hash_only());
        assert!(matches!(load_value(&store, &inner.hash()), Ok(Value::Int(_))));
    }

    #[test]
    fn tampered_node_is_rejected() {
        let mut store = MemoryStore::new();
        let value = sample();
        let hash = save_value(&mut store, &value);
        let one = Value::int(1).hash();
        store.put(one, encode_value(&Value::int(9)));
        assert_eq!(
            load_value(&store, &hash),
            Err(StoreError::HashMismatch {
                expected: one,
                found: Value::int(9).hash()
            })
        );
        assert_eq!(
            load_value(&store, &Hash256([0xaa; 32])),
            Err(StoreError::Missing(Hash256([0xaa; 32])))
        );
    }

    #[test]
    fn self_referencing_node_is_corrupt() {
        let mut store = MemoryStore::new();
        let h = Hash256([7u8; 32]);
        let mut node = vec![TAG_TUPLE, 1];
        node.extend_from_slice(h.as_bytes());
        store.put(h, node);
        assert_eq!(load_value(&store, &h), Err(StoreError::Corrupt("cycle")));
    }

    #[test]
    fn machine_checkpoint_round_trip() {
        let entry = CodePointStub::new(CodePointRef { segment: 2, pc: 9 }, Hash256([1u8; 32]));
        let mut state = MachineState::new(entry, sample(), 1234);
        state.data_stack = state.data_stack.push(Value::int(3)).push(sample());
        state.aux_stack = state.aux_stack.push(Value::empty_tuple());
        state.register = Value::HashOnly(Hash256([8u8; 32]));
        state.status = Status::Errored;

        let mut store = MemoryStore::new();
        let hash = save_machine(&mut store, &state);
        assert_eq!(hash, state.hash());
        let back = load_machine(&store, &hash).unwrap();
        assert_eq!(back, state);
        assert_eq!(back.pc.pc, entry.pc);
        assert_eq!(back.data_stack.visible_len(), 2);

        let mut corrupt = store.get(&hash).unwrap();
        let last = corrupt.len() - 1;
        corrupt[last] = Status::Running as u8;
        store.put(hash, corrupt);
        assert!(matches!(
            load_machine(&store, &hash),
            Err(StoreError::HashMismatch { .. })
        ));
    }

    #[test]
    fn deep_stack_checkpoint_round_trip() {
        let entry = CodePointStub::new(CodePointRef { segment: 1, pc: 3 }, Hash256([2u8; 32]));
        let mut state = MachineState::new(entry, Value::empty_tuple(), 10_000_000);
        state.data_stack = (0..300_000u64).map(Value::int).collect();

        let mut store = MemoryStore::new();
        let hash = save_machine(&mut store, &state);
        let back = load_machine(&store, &hash).unwrap();
        assert_eq!(back.hash(), hash);
        assert_eq!(back.data_stack.visible_len(), 300_000);
        drop(back);

        // A later checkpoint only adds the cells above the shared part.
        let before = store.len();
        state.data_stack = state.data_stack.push(Value::int(1)).push(Value::int(2));
        let next = save_machine(&mut store, &state);
        assert_eq!(store.len(), before + 3);
        assert!(load_machine(&store, &next).unwrap() == state);
    }

    #[test]
    fn partial_stack_checkpoint_keeps_its_commitment() {
        let entry = CodePointStub::new(CodePointRef { segment: 1, pc: 3 }, Hash256([2u8; 32]));
        let full: Stack = (0..5u64).map(Value::int).collect();
        let mut state = MachineState::new(entry, Value::empty_tuple(), 10);
        state.data_stack = full.truncate_with(2, &mut |v| v.clone());

        let mut store = MemoryStore::new();
        let hash = save_machine(&mut store, &state);
        let back = load_machine(&store, &hash).unwrap();
        assert_eq!(back.data_stack.visible_len(), 2);
        assert_eq!(back.data_stack.hash(), full.hash());
    }

    #[test]
    fn stack_cell_pointing_at_itself_is_corrupt() {
        let h = Hash256([6u8; 32]);
        let mut store = MemoryStore::new();
        save_value(&mut store, &Value::int(1));
        store.put(h, tuple_node(&[Value::int(1).hash(), h]));
        assert_eq!(load_stack(&store, &h), Err(StoreError::Corrupt("cycle")));
    }
}
