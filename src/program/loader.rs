use crate::code::{Code, CodeError, CodePointRef, CodePointStub, Operation, make_table};
use crate::transcript::Hash256;
use crate::value::codec::{CodecError, Reader};
use crate::value::{Buffer, Tuple, Value};
use once_cell::sync::Lazy;
use std::collections::BTreeSet;
use tracing::info;

pub const END_OF_PROGRAM: u8 = 0xff;

const IMMEDIATE_NONE: u8 = 0;
const IMMEDIATE_INT: u8 = 1;
const IMMEDIATE_GUEST_FRAME: u8 = 2;
const IMMEDIATE_BUFFER_LEN: u8 = 3;

/// Gas constant baked into the tag-2 frame.
pub const GUEST_FRAME_GAS: u64 = 100_000;

static GUEST_FRAME: Lazy<Value> = Lazy::new(|| {
    Value::Tuple(Tuple::bounded(vec![
        Value::Buffer(Buffer::new()),
        Value::int(0),
        Value::Buffer(Buffer::new()),
        Value::int(0),
        Value::int(GUEST_FRAME_GAS),
    ]))
});

/// `(empty buffer, n)`.
fn buffer_len_immediate(len: u64) -> Value {
    Value::Tuple(Tuple::pair(Value::Buffer(Buffer::new()), Value::int(len)))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProgramLoadError {
    #[error("program truncated at byte {0}")]
    Truncated(usize),
    #[error("unknown immediate tag {tag} at byte {offset}")]
    UnknownImmediateTag { offset: usize, tag: u8 },
    #[error("program has no 0xff terminator")]
    MissingTerminator,
    #[error("{0} bytes after the terminator")]
    TrailingBytes(usize),
    #[error("invalid hex: {0}")]
    Hex(String),
    #[error(transparent)]
    Code(#[from] CodeError),
}

impl From<CodecError> for ProgramLoadError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::UnexpectedEof(at) => ProgramLoadError::Truncated(at),
            _ => ProgramLoadError::MissingTerminator,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("immediate at pc {0} has no record encoding")]
    UnsupportedImmediate(u64),
    #[error("label {0} is not part of the encoded segment")]
    ForeignLabel(CodePointStub),
    #[error(transparent)]
    Code(#[from] CodeError),
}

/// A program loaded into a fresh code store.
#[derive(Debug, Clone)]
pub struct LoadedProgram {
    pub code: Code,
    /// Head of the segment; where execution starts.
    pub entry: CodePointStub,
    /// Labelled code points, in execution order.
    pub labels: Vec<CodePointStub>,
    pub table: Value,
}

impl LoadedProgram {
    pub fn table_hash(&self) -> Hash256 {
        self.table.hash()
    }
}

pub fn load_program(bytes: &[u8]) -> Result<LoadedProgram, ProgramLoadError> {
    let mut code = Code::new();
    let mut stub = code.add_segment();
    let mut labels = Vec::new();
    let mut reader = Reader::new(bytes);

    loop {
        if reader.remaining() == 0 {
            return Err(ProgramLoadError::MissingTerminator);
        }
        let opcode = reader.read_u8()?;
        if opcode == END_OF_PROGRAM {
            break;
        }
        let offset = reader.position();
        let immediate = match reader.read_u8()? {
            IMMEDIATE_NONE => None,
            IMMEDIATE_INT => Some(Value::int(reader.read_u64()?)),
            IMMEDIATE_GUEST_FRAME => Some(GUEST_FRAME.clone()),
            IMMEDIATE_BUFFER_LEN => Some(buffer_len_immediate(reader.read_u64()?)),
            tag => return Err(ProgramLoadError::UnknownImmediateTag { offset, tag }),
        };
        stub = code.add_operation(stub, Operation::raw(opcode, immediate))?;
        if reader.read_u8()? != 0 {
            labels.push(stub);
        }
    }
    if reader.remaining() != 0 {
        return Err(ProgramLoadError::TrailingBytes(reader.remaining()));
    }

    labels.reverse();
    let table = make_table(&labels);
    info!(
        operations = stub.pc.pc,
        labels = labels.len(),
        entry = %stub.hash,
        table = %table.hash(),
        "program loaded"
    );
    Ok(LoadedProgram {
        code,
        entry: stub,
        labels,
        table,
    })
}

pub fn load_program_hex(hex_str: &str) -> Result<LoadedProgram, ProgramLoadError> {
    let bytes = hex::decode(hex_str.trim()).map_err(|e| ProgramLoadError::Hex(e.to_string()))?;
    load_program(&bytes)
}

fn encode_immediate(out: &mut Vec<u8>, immediate: Option<&Value>, pc: u64) -> Result<(), EncodeError> {
    let Some(value) = immediate else {
        out.push(IMMEDIATE_NONE);
        return Ok(());
    };
    if let Value::Int(n) = value {
        if let Some(n) = n.to_u64() {
            out.push(IMMEDIATE_INT);
            out.extend_from_slice(&n.to_be_bytes());
            return Ok(());
        }
    }
    if value.hash() == GUEST_FRAME.hash() {
        out.push(IMMEDIATE_GUEST_FRAME);
        return Ok(());
    }
    if let Value::Tuple(t) = value {
        if let [Value::Buffer(b), Value::Int(n)] = t.items() {
            match n.to_u64() {
                Some(n) if *b == Buffer::new() => {
                    out.push(IMMEDIATE_BUFFER_LEN);
                    out.extend_from_slice(&n.to_be_bytes());
                    return Ok(());
                }
                _ => {}
            }
        }
    }
    Err(EncodeError::UnsupportedImmediate(pc))
}

/// Writes the segment ending at `head` back into record form.
///
/// Records come out in load order, so `load_program` on the result rebuilds
/// the same head hash. `labels` must point into the same segment.
pub fn encode_program(
    code: &Code,
    head: CodePointStub,
    labels: &[CodePointStub],
) -> Result<Vec<u8>, EncodeError> {
    code.fetch(&head)?;
    let segment = head.pc.segment;
    let mut labelled = BTreeSet::new();
    for label in labels {
        let point = code
            .get(CodePointRef {
                segment,
                pc: label.pc.pc,
            })
            .map_err(|_| EncodeError::ForeignLabel(*label))?;
        if label.pc.segment != segment || point.hash != label.hash || label.pc.pc > head.pc.pc {
            return Err(EncodeError::ForeignLabel(*label));
        }
        labelled.insert(label.pc.pc);
    }

    let mut out = Vec::new();
    for pc in 1..=head.pc.pc {
        let point = code.get(CodePointRef { segment, pc })?;
        out.push(point.op.code);
        encode_immediate(&mut out, point.op.immediate.as_ref(), pc)?;
        out.push(u8::from(labelled.contains(&pc)));
    }
    out.push(END_OF_PROGRAM);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{Opcode, table_lookup};

    fn record(op: Opcode, tag: u8, payload: &[u8], label: bool) -> Vec<u8> {
        let mut r = vec![op as u8, tag];
        r.extend_from_slice(payload);
        r.push(label as u8);
        r
    }

    fn sample_program() -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend(record(Opcode::Halt, 0, &[], true));
        bytes.extend(record(Opcode::Add, 1, &7u64.to_be_bytes(), false));
        bytes.extend(record(Opcode::Nop, 2, &[], true));
        bytes.extend(record(Opcode::Pop, 3, &42u64.to_be_bytes(), false));
        bytes.extend(record(Opcode::Nop, 0, &[], true));
        bytes.push(END_OF_PROGRAM);
        bytes
    }

    #[test]
    fn loads_records_into_one_segment() {
        let program = load_program(&sample_program()).unwrap();
        assert_eq!(program.entry.pc, CodePointRef { segment: 0, pc: 5 });
        assert_eq!(program.code.segment_count(), 1);

        let (op, _) = program.code.fetch(&program.entry).unwrap();
        assert_eq!(op.opcode(), Some(Opcode::Nop));

        let add = program.code.get(CodePointRef { segment: 0, pc: 2 }).unwrap();
        assert_eq!(add.op.immediate, Some(Value::int(7)));
        let pop = program.code.get(CodePointRef { segment: 0, pc: 4 }).unwrap();
        assert_eq!(pop.op.immediate, Some(buffer_len_immediate(42)));
        let nop = program.code.get(CodePointRef { segment: 0, pc: 3 }).unwrap();
        assert_eq!(nop.op.immediate.as_ref(), Some(&*GUEST_FRAME));
    }

    #[test]
    fn labels_are_in_reverse_load_order() {
        let program = load_program(&sample_program()).unwrap();
        let pcs: Vec<u64> = program.labels.iter().map(|s| s.pc.pc).collect();
        assert_eq!(pcs, vec![5, 3, 1]);
        assert_eq!(table_lookup(&program.table, 0).unwrap(), program.entry);
        assert_eq!(table_lookup(&program.table, 2).unwrap().pc.pc, 1);
    }

    #[test]
    fn encode_then_load_keeps_hashes() {
        let first = load_program(&sample_program()).unwrap();
        let bytes = encode_program(&first.code, first.entry, &first.labels).unwrap();
        assert_eq!(bytes, sample_program());
        let second = load_program(&bytes).unwrap();
        assert_eq!(second.entry.hash, first.entry.hash);
        assert_eq!(second.table_hash(), first.table_hash());
    }

    #[test]
    fn malformed_programs_are_rejected() {
        let mut bytes = sample_program();
        bytes.pop();
        assert_eq!(load_program(&bytes).unwrap_err(), ProgramLoadError::MissingTerminator);

        let truncated = [Opcode::Add as u8, IMMEDIATE_INT, 0, 0];
        assert!(matches!(
            load_program(&truncated),
            Err(ProgramLoadError::Truncated(_))
        ));

        let bad_tag = [Opcode::Add as u8, 9, 0, END_OF_PROGRAM];
        assert_eq!(
            load_program(&bad_tag).unwrap_err(),
            ProgramLoadError::UnknownImmediateTag { offset: 1, tag: 9 }
        );

        let trailing = [END_OF_PROGRAM, 0];
        assert_eq!(load_program(&trailing).unwrap_err(), ProgramLoadError::TrailingBytes(1));
    }

    #[test]
    fn empty_program_is_just_the_sentinel() {
        let program = load_program(&[END_OF_PROGRAM]).unwrap();
        assert!(program.entry.is_error_point());
        assert!(program.labels.is_empty());
        assert_eq!(program.table, Value::empty_tuple());
    }

    #[test]
    fn unencodable_immediate() {
        let mut code = Code::new();
        let s = code.add_segment();
        let big = Value::Int(crate::value::Uint256::max_value());
        let head = code
            .add_operation(s, Operation::with_immediate(Opcode::Nop, big))
            .unwrap();
        assert_eq!(
            encode_program(&code, head, &[]).unwrap_err(),
            EncodeError::UnsupportedImmediate(1)
        );
    }
}
