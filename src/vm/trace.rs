//! Execution trace recording.
//!
//! Records one row per executed step: where the machine was, what it ran and
//! the commitment it reached.

use crate::code::CodePointStub;
use crate::transcript::Hash256;

/// One executed step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRow {
    /// Zero-based step index within the run.
    pub step: u64,
    /// Code point executed.
    pub pc: CodePointStub,
    /// Raw opcode byte.
    pub opcode: u8,
    /// Gas left after the step.
    pub gas_remaining: u64,
    /// Hash of the post-step machine.
    pub state_hash: Hash256,
}

/// Execution trace storing the sequence of state commitments.
#[derive(Debug, Clone, Default)]
pub struct ExecutionTrace {
    rows: Vec<TraceRow>,
}

impl ExecutionTrace {
    pub fn new() -> Self {
        Self { rows: Vec::new() }
    }

    /// Appends the next step; steps must arrive in order.
    pub fn push(&mut self, row: TraceRow) {
        debug_assert_eq!(row.step, self.rows.len() as u64);
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get_row(&self, index: usize) -> Option<&TraceRow> {
        self.rows.get(index)
    }

    pub fn rows(&self) -> &[TraceRow] {
        &self.rows
    }

    /// Hash reached after the last recorded step.
    pub fn final_hash(&self) -> Option<Hash256> {
        self.rows.last().map(|row| row.state_hash)
    }

    /// Prints trace in tabular format.
    pub fn print_trace(&self) {
        println!("step | pc | op | gas | state");
        for row in &self.rows {
            println!(
                "{} | {} | 0x{:02x} | {} | {}",
                row.step, row.pc, row.opcode, row.gas_remaining, row.state_hash
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::CodePointRef;

    fn generate_test_trace() -> ExecutionTrace {
        let mut trace = ExecutionTrace::new();
        for i in 0..5u64 {
            trace.push(TraceRow {
                step: i,
                pc: CodePointStub::new(CodePointRef { segment: 0, pc: 5 - i }, Hash256([i as u8; 32])),
                opcode: 0x3b,
                gas_remaining: 100 - i,
                state_hash: Hash256([0x10 + i as u8; 32]),
            });
        }
        trace
    }

    #[test]
    fn print_test_trace() {
        generate_test_trace().print_trace();
    }

    #[test]
    fn rows_are_indexed_by_step() {
        let trace = generate_test_trace();
        assert_eq!(trace.len(), 5);
        assert_eq!(trace.get_row(2).map(|r| r.gas_remaining), Some(98));
        assert!(trace.get_row(5).is_none());
        assert_eq!(trace.final_hash(), Some(Hash256([0x14; 32])));
        assert!(ExecutionTrace::new().final_hash().is_none());
    }
}
