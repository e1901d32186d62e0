//! Virtual machine for one-step proofs.
//!
//! Provides machine state, the persistent stacks it is built from, the
//! interpreter and execution trace recording.

pub mod interpreter;
pub mod stack;
pub mod state;
pub mod trace;

pub use interpreter::{
    Fault, Interpreter, RunOutcome, StepError, StepRecord, StopReason, Witness, execute,
};
pub use stack::{Stack, StackError};
pub use state::{MachineState, Status};
pub use trace::{ExecutionTrace, TraceRow};
