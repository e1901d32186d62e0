use super::{CodePointRef, CodePointStub, Operation, error_code_point_hash};
use crate::transcript::Hash256;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodeError {
    #[error("segment {0} does not exist")]
    UnknownSegment(u64),
    #[error("no code point at {segment}:{pc}")]
    UnknownPc { segment: u64, pc: u64 },
    #[error("stub hash does not match code point at {segment}:{pc}")]
    StubMismatch { segment: u64, pc: u64 },
}

/// One stored code point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodePoint {
    pub op: Operation,
    pub next_hash: Hash256,
    pub hash: Hash256,
}

impl CodePoint {
    fn new(op: Operation, next_hash: Hash256) -> Self {
        let hash = op.code_point_hash(&next_hash);
        Self {
            op,
            next_hash,
            hash,
        }
    }
}

/// Append-only store of code segments.
///
/// Code points are never changed after insertion. Appending anywhere other
/// than the head of a segment copies the prefix into a new segment, so stubs
/// handed out earlier stay valid.
#[derive(Debug, Clone, Default)]
pub struct Code {
    segments: Vec<Vec<CodePoint>>,
}

impl Code {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a segment holding only the error sentinel and returns its stub.
    pub fn add_segment(&mut self) -> CodePointStub {
        let segment = self.segments.len() as u64;
        let sentinel = CodePoint::new(Operation::new(super::Opcode::Error), Hash256::ZERO);
        debug_assert_eq!(sentinel.hash, error_code_point_hash());
        let hash = sentinel.hash;
        self.segments.push(vec![sentinel]);
        CodePointStub::new(CodePointRef { segment, pc: 0 }, hash)
    }

    /// Adds `op` in front of `at`; the new point continues into `at`.
    pub fn add_operation(
        &mut self,
        at: CodePointStub,
        op: Operation,
    ) -> Result<CodePointStub, CodeError> {
        let CodePointRef { segment, pc } = at.pc;
        let points = self
            .segments
            .get(segment as usize)
            .ok_or(CodeError::UnknownSegment(segment))?;
        let current = points
            .get(pc as usize)
            .ok_or(CodeError::UnknownPc { segment, pc })?;
        if current.hash != at.hash {
            return Err(CodeError::StubMismatch { segment, pc });
        }

        let point = CodePoint::new(op, at.hash);
        let hash = point.hash;
        if pc as usize + 1 == points.len() {
            self.segments[segment as usize].push(point);
            return Ok(CodePointStub::new(
                CodePointRef {
                    segment,
                    pc: pc + 1,
                },
                hash,
            ));
        }

        let mut forked = points[..=pc as usize].to_vec();
        forked.push(point);
        let new_segment = self.segments.len() as u64;
        self.segments.push(forked);
        Ok(CodePointStub::new(
            CodePointRef {
                segment: new_segment,
                pc: pc + 1,
            },
            hash,
        ))
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn segment_len(&self, segment: u64) -> Option<usize> {
        self.segments.get(segment as usize).map(Vec::len)
    }

    pub fn get(&self, pc: CodePointRef) -> Result<&CodePoint, CodeError> {
        self.segments
            .get(pc.segment as usize)
            .ok_or(CodeError::UnknownSegment(pc.segment))?
            .get(pc.pc as usize)
            .ok_or(CodeError::UnknownPc {
                segment: pc.segment,
                pc: pc.pc,
            })
    }

    pub fn stub(&self, pc: CodePointRef) -> Result<CodePointStub, CodeError> {
        Ok(CodePointStub::new(pc, self.get(pc)?.hash))
    }

    /// Stub of the most recently added point in `segment`.
    pub fn segment_head(&self, segment: u64) -> Result<CodePointStub, CodeError> {
        let len = self
            .segment_len(segment)
            .ok_or(CodeError::UnknownSegment(segment))?;
        self.stub(CodePointRef {
            segment,
            pc: len as u64 - 1,
        })
    }

    /// Resolves a stub to its operation and the stub of the following point.
    ///
    /// The sentinel at pc 0 continues into a stub with the zero hash.
    pub fn fetch(&self, stub: &CodePointStub) -> Result<(&Operation, CodePointStub), CodeError> {
        let point = self.get(stub.pc)?;
        if point.hash != stub.hash {
            return Err(CodeError::StubMismatch {
                segment: stub.pc.segment,
                pc: stub.pc.pc,
            });
        }
        let next_pc = CodePointRef {
            segment: stub.pc.segment,
            pc: stub.pc.pc.saturating_sub(1),
        };
        Ok((&point.op, CodePointStub::new(next_pc, point.next_hash)))
    }

    /// Operations of a segment from the head down to the sentinel.
    pub fn walk(&self, segment: u64) -> Result<impl Iterator<Item = &CodePoint>, CodeError> {
        let points = self
            .segments
            .get(segment as usize)
            .ok_or(CodeError::UnknownSegment(segment))?;
        Ok(points.iter().rev())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::Opcode;

    #[test]
    fn new_segment_starts_at_sentinel() {
        let mut code = Code::new();
        let stub = code.add_segment();
        assert!(stub.is_error_point());
        assert_eq!(stub.pc, CodePointRef { segment: 0, pc: 0 });
        let (op, _) = code.fetch(&stub).unwrap();
        assert_eq!(op.opcode(), Some(Opcode::Error));
    }

    #[test]
    fn appending_at_head_extends_the_segment() {
        let mut code = Code::new();
        let sentinel = code.add_segment();
        let a = code.add_operation(sentinel, Operation::new(Opcode::Halt)).unwrap();
        let b = code.add_operation(a, Operation::new(Opcode::Nop)).unwrap();
        assert_eq!(code.segment_count(), 1);
        assert_eq!(b.pc, CodePointRef { segment: 0, pc: 2 });
        assert_eq!(code.segment_head(0).unwrap(), b);

        // The head commits to the whole chain.
        let expected = Operation::new(Opcode::Nop)
            .code_point_hash(&Operation::new(Opcode::Halt).code_point_hash(&sentinel.hash));
        assert_eq!(b.hash, expected);

        let (op, next) = code.fetch(&b).unwrap();
        assert_eq!(op.opcode(), Some(Opcode::Nop));
        assert_eq!(next, a);
    }

    #[test]
    fn appending_below_head_forks() {
        let mut code = Code::new();
        let sentinel = code.add_segment();
        let a = code.add_operation(sentinel, Operation::new(Opcode::Halt)).unwrap();
        let _b = code.add_operation(a, Operation::new(Opcode::Nop)).unwrap();
        let c = code.add_operation(a, Operation::new(Opcode::Pop)).unwrap();

        assert_eq!(code.segment_count(), 2);
        assert_eq!(c.pc, CodePointRef { segment: 1, pc: 2 });
        assert_eq!(code.segment_len(0), Some(3));
        assert_eq!(code.segment_len(1), Some(3));

        // The fork continues into a copy of `a` with the same hash.
        let (_, next) = code.fetch(&c).unwrap();
        assert_eq!(next.hash, a.hash);
        assert_eq!(next.pc.segment, 1);
    }

    #[test]
    fn stale_or_foreign_stubs_are_rejected() {
        let mut code = Code::new();
        let sentinel = code.add_segment();
        let bogus = CodePointStub::new(sentinel.pc, Hash256([1u8; 32]));
        assert!(matches!(
            code.add_operation(bogus, Operation::new(Opcode::Nop)),
            Err(CodeError::StubMismatch { .. })
        ));
        assert!(matches!(
            code.fetch(&CodePointStub::new(CodePointRef { segment: 4, pc: 0 }, sentinel.hash)),
            Err(CodeError::UnknownSegment(4))
        ));
    }

    #[test]
    fn sentinel_continues_into_zero_hash() {
        let mut code = Code::new();
        let sentinel = code.add_segment();
        let (_, next) = code.fetch(&sentinel).unwrap();
        assert_eq!(next.hash, Hash256::ZERO);
    }
}
