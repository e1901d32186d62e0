use super::stack::Stack;
use crate::code::CodePointStub;
use crate::program::loader::LoadedProgram;
use crate::transcript::{Hash256, Transcript};
use crate::value::Value;
use std::fmt;

const TAG_MACHINE: u8 = 0x20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Running = 0,
    Halted = 1,
    Errored = 2,
}

impl TryFrom<u8> for Status {
    type Error = u8;
    fn try_from(v: u8) -> Result<Self, u8> {
        match v {
            0 => Ok(Status::Running),
            1 => Ok(Status::Halted),
            2 => Ok(Status::Errored),
            other => Err(other),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Running => "running",
            Status::Halted => "halted",
            Status::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// Complete state of one machine.
///
/// Every component caches its own hash, so `hash()` only combines eight
/// digests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineState {
    pub pc: CodePointStub,
    pub data_stack: Stack,
    pub aux_stack: Stack,
    pub register: Value,
    pub static_value: Value,
    pub error_handler: CodePointStub,
    pub gas_remaining: u64,
    pub status: Status,
}

impl MachineState {
    pub fn new(entry: CodePointStub, static_value: Value, gas: u64) -> Self {
        Self {
            pc: entry,
            data_stack: Stack::new(),
            aux_stack: Stack::new(),
            register: Value::empty_tuple(),
            static_value,
            error_handler: CodePointStub::error_point(),
            gas_remaining: gas,
            status: Status::Running,
        }
    }

    /// Fresh machine at the program entry; the jump table is the static value.
    pub fn from_program(program: &LoadedProgram, gas: u64) -> Self {
        Self::new(program.entry, program.table.clone(), gas)
    }

    pub fn hash(&self) -> Hash256 {
        Transcript::new(TAG_MACHINE)
            .absorb_hash(&self.pc.hash)
            .absorb_hash(&self.data_stack.hash())
            .absorb_hash(&self.aux_stack.hash())
            .absorb_hash(&self.register.hash())
            .absorb_hash(&self.static_value.hash())
            .absorb_hash(&self.error_handler.hash)
            .absorb_u64(self.gas_remaining)
            .absorb_u8(self.status as u8)
            .finalize()
    }

    /// No further step is possible: halted, or errored with no handler to
    /// resume at.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            Status::Halted => true,
            Status::Errored => self.pc.is_error_point(),
            Status::Running => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::CodePointRef;

    fn state() -> MachineState {
        let entry = CodePointStub::new(CodePointRef { segment: 0, pc: 3 }, Hash256([4u8; 32]));
        MachineState::new(entry, Value::int(9), 1_000)
    }

    #[test]
    fn every_field_is_committed() {
        let base = state();
        let h = base.hash();

        let mut s = base.clone();
        s.gas_remaining -= 1;
        assert_ne!(s.hash(), h);

        let mut s = base.clone();
        s.status = Status::Errored;
        assert_ne!(s.hash(), h);

        let mut s = base.clone();
        s.data_stack = s.data_stack.push(Value::int(0));
        assert_ne!(s.hash(), h);

        let mut s = base.clone();
        s.aux_stack = s.aux_stack.push(Value::int(0));
        assert_ne!(s.hash(), h);

        let mut s = base.clone();
        s.register = Value::int(1);
        assert_ne!(s.hash(), h);

        let mut s = base.clone();
        s.static_value = Value::int(1);
        assert_ne!(s.hash(), h);

        let mut s = base.clone();
        s.error_handler = base.pc;
        assert_ne!(s.hash(), h);

        // The code reference is not part of the commitment, only the hash.
        let mut s = base.clone();
        s.pc.pc.segment = 7;
        assert_eq!(s.hash(), h);
    }

    #[test]
    fn data_and_aux_stacks_are_not_interchangeable() {
        let mut a = state();
        a.data_stack = a.data_stack.push(Value::int(5));
        let mut b = state();
        b.aux_stack = b.aux_stack.push(Value::int(5));
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn terminal_states() {
        let mut s = state();
        assert!(!s.is_terminal());
        s.status = Status::Errored;
        assert!(!s.is_terminal());
        s.pc = CodePointStub::error_point();
        assert!(s.is_terminal());
        s.status = Status::Halted;
        assert!(s.is_terminal());
    }

    #[test]
    fn status_byte_round_trip() {
        for status in [Status::Running, Status::Halted, Status::Errored] {
            assert_eq!(Status::try_from(status as u8), Ok(status));
        }
        assert_eq!(Status::try_from(3), Err(3));
    }
}
