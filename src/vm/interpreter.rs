//! Fetch, charge, execute.
//!
//! `execute` is the single implementation of opcode semantics. The
//! interpreter calls it with operations fetched from the code store; the
//! verifier calls it with the operation and partial state carried by a proof.
//! While it runs it records in a [`Witness`] how much of the pre-state the
//! step actually looked at, which is what a proof has to reveal.

use super::stack::{Stack, StackError};
use super::state::{MachineState, Status};
use super::trace::{ExecutionTrace, TraceRow};
use crate::code::{Code, CodeError, CodePointStub, Opcode, Operation, TableError, table_lookup};
use crate::config::VmConfig;
use crate::program::loader::LoadedProgram;
use crate::sandbox::{GuestEngine, GuestError, NoGuest, WasmEnvData};
use crate::transcript::Hash256;
use crate::value::buffer::chunk_span;
use crate::value::{Buffer, BufferError, MAX_BUFFER_LEN, Tuple, Uint256, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Recoverable faults. A faulting step still produces a post-state: the
/// machine is `Errored` at its error handler with the pre-step stacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Fault {
    #[error("stack underflow")]
    StackUnderflow,
    #[error("operand has the wrong type")]
    TypeMismatch,
    #[error("tuple index outside its arity")]
    ArityError,
    #[error("access out of bounds")]
    OutOfBounds,
    #[error("division by zero")]
    DivisionByZero,
    #[error("out of gas")]
    OutOfGas,
    #[error("guest trapped")]
    GuestTrap,
    #[error("guest exceeded its resources")]
    GuestResourceExceeded,
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),
    #[error("error opcode executed")]
    ExplicitError,
}

/// Hard failures: the step could not be evaluated at all.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepError {
    #[error("machine is {0} and cannot step")]
    NotRunnable(Status),
    #[error(transparent)]
    Code(#[from] CodeError),
    /// Part of the state the step needs is only known by its hash.
    #[error("missing witness: {0}")]
    MissingWitness(String),
    #[error("guest engine failure: {0}")]
    Guest(String),
}

/// Tuple levels of a stack item or register revealed in a proof. No opcode
/// looks further into a value than a jump table is deep.
pub const REVEAL_DEPTH: usize = 64;

/// What a step read from its pre-state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Witness {
    /// Items of the pre-step data stack that must be revealed.
    pub data_depth: usize,
    pub aux_depth: usize,
    pub register_read: bool,
    pub static_read: bool,
    /// Touched chunks per buffer, keyed by buffer hash.
    pub buffers: HashMap<Hash256, BTreeSet<u64>>,
}

impl Witness {
    fn touch(&mut self, buffer: &Buffer, chunks: impl IntoIterator<Item = u64>) {
        self.buffers.entry(buffer.hash()).or_default().extend(chunks);
    }

    /// Copy of `value` with every buffer pruned to the chunks this step
    /// touched. Buffers the step never addressed keep only their root, and
    /// tuples below `REVEAL_DEPTH` are replaced by their hash.
    pub fn reveal(&self, value: &Value) -> Value {
        self.reveal_within(value, REVEAL_DEPTH)
    }

    fn reveal_within(&self, value: &Value, depth: usize) -> Value {
        match value {
            Value::Buffer(b) => match self.buffers.get(&b.hash()) {
                Some(chunks) => Value::Buffer(b.prune(chunks)),
                None => Value::Buffer(b.prune(&BTreeSet::new())),
            },
            Value::Tuple(_) if depth == 0 => value.to_hash_only(),
            Value::Tuple(t) => Value::Tuple(Tuple::bounded(
                t.items()
                    .iter()
                    .map(|item| self.reveal_within(item, depth - 1))
                    .collect(),
            )),
            other => other.clone(),
        }
    }
}

/// Everything a step produced besides the post-state.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub op: Operation,
    pub next: CodePointStub,
    pub post: MachineState,
    pub fault: Option<Fault>,
    pub witness: Witness,
}

enum Interrupt {
    Fault(Fault),
    Hard(StepError),
}

impl From<Fault> for Interrupt {
    fn from(fault: Fault) -> Self {
        Interrupt::Fault(fault)
    }
}

impl From<StepError> for Interrupt {
    fn from(err: StepError) -> Self {
        Interrupt::Hard(err)
    }
}

fn missing(what: impl Into<String>) -> Interrupt {
    Interrupt::Hard(StepError::MissingWitness(what.into()))
}

impl From<BufferError> for Interrupt {
    fn from(err: BufferError) -> Self {
        match err {
            BufferError::OutOfBounds { .. } => Fault::OutOfBounds.into(),
            BufferError::Hidden(chunk) => missing(format!("buffer chunk {chunk}")),
            BufferError::Malformed => missing("malformed buffer"),
        }
    }
}

/// A stack plus how deep into its pre-step contents the step has reached.
struct Tracked {
    stack: Stack,
    pushed: usize,
    consumed: usize,
    depth: usize,
}

impl Tracked {
    fn new(stack: &Stack) -> Self {
        Self {
            stack: stack.clone(),
            pushed: 0,
            consumed: 0,
            depth: 0,
        }
    }

    fn stack_error(err: StackError) -> Interrupt {
        match err {
            StackError::Underflow => Fault::StackUnderflow.into(),
            StackError::Hidden | StackError::Malformed => missing("stack"),
        }
    }

    fn pop(&mut self) -> Result<Value, Interrupt> {
        if self.pushed > 0 {
            self.pushed -= 1;
        } else {
            self.consumed += 1;
            self.depth = self.depth.max(self.consumed);
        }
        let (value, rest) = self.stack.pop().map_err(Self::stack_error)?;
        self.stack = rest;
        Ok(value)
    }

    fn push(&mut self, value: Value) {
        self.pushed += 1;
        self.stack = self.stack.push(value);
    }

    fn is_empty(&mut self) -> Result<bool, Interrupt> {
        if self.pushed == 0 {
            self.depth = self.depth.max(self.consumed + 1);
        }
        self.stack.is_empty().map_err(Self::stack_error)
    }
}

fn flag(b: bool) -> Value {
    Value::int(b as u64)
}

fn as_int(value: Value) -> Result<Uint256, Interrupt> {
    match value {
        Value::Int(n) => Ok(n),
        _ => Err(Fault::TypeMismatch.into()),
    }
}

fn as_tuple(value: Value) -> Result<Tuple, Interrupt> {
    match value {
        Value::Tuple(t) => Ok(t),
        _ => Err(Fault::TypeMismatch.into()),
    }
}

fn as_code_point(value: Value) -> Result<CodePointStub, Interrupt> {
    match value {
        Value::CodePoint(stub) => Ok(stub),
        _ => Err(Fault::TypeMismatch.into()),
    }
}

fn as_buffer(value: Value) -> Result<Buffer, Interrupt> {
    match value {
        Value::Buffer(b) => Ok(b),
        _ => Err(Fault::TypeMismatch.into()),
    }
}

fn index(n: &Uint256) -> Result<usize, Interrupt> {
    n.to_u64()
        .and_then(|i| usize::try_from(i).ok())
        .ok_or(Fault::ArityError.into())
}

fn offset(n: &Uint256) -> Result<u64, Interrupt> {
    n.to_u64().ok_or(Fault::OutOfBounds.into())
}

/// Working copy of the mutable parts of the state during one step.
struct Step<'a> {
    pre: &'a MachineState,
    data: Tracked,
    aux: Tracked,
    register: Value,
    error_handler: CodePointStub,
    next_pc: CodePointStub,
    gas: u64,
    status: Status,
    witness: &'a mut Witness,
    guest: &'a dyn GuestEngine,
    guest_gas_cap: u64,
}

impl Step<'_> {
    fn pop(&mut self) -> Result<Value, Interrupt> {
        self.data.pop()
    }

    fn push(&mut self, value: Value) {
        self.data.push(value);
    }

    fn pop_int(&mut self) -> Result<Uint256, Interrupt> {
        as_int(self.pop()?)
    }

    fn pop_tuple(&mut self) -> Result<Tuple, Interrupt> {
        as_tuple(self.pop()?)
    }

    fn pop_buffer(&mut self) -> Result<Buffer, Interrupt> {
        as_buffer(self.pop()?)
    }

    fn binary(
        &mut self,
        f: impl FnOnce(&Uint256, &Uint256) -> Result<Uint256, Fault>,
    ) -> Result<(), Interrupt> {
        let a = self.pop_int()?;
        let b = self.pop_int()?;
        let r = f(&a, &b)?;
        self.push(Value::Int(r));
        Ok(())
    }

    fn compare(&mut self, f: impl FnOnce(&Uint256, &Uint256) -> bool) -> Result<(), Interrupt> {
        let a = self.pop_int()?;
        let b = self.pop_int()?;
        self.push(flag(f(&a, &b)));
        Ok(())
    }

    fn get_buffer(&mut self, width: u64) -> Result<(), Interrupt> {
        let offset = offset(&self.pop_int()?)?;
        let buffer = self.pop_buffer()?;
        let bytes = buffer.read(offset, width)?;
        self.witness.touch(&buffer, chunk_span(offset, width));
        self.push(Value::Int(Uint256::from_be_slice(&bytes)));
        Ok(())
    }

    fn set_buffer(&mut self, width: usize) -> Result<(), Interrupt> {
        let offset = offset(&self.pop_int()?)?;
        let value = self.pop_int()?;
        let buffer = self.pop_buffer()?;
        let bytes = value.to_be_bytes();
        let updated = buffer.write(offset, &bytes[32 - width..])?;
        self.witness.touch(&buffer, chunk_span(offset, width as u64));
        self.push(Value::Buffer(updated));
        Ok(())
    }

    fn jump_to(&mut self, target: CodePointStub) {
        self.next_pc = target;
    }

    fn record_guest(&mut self, input: Hash256, touched: BTreeSet<u64>) {
        self.witness.buffers.entry(input).or_default().extend(touched);
    }

    fn run_guest(&mut self) -> Result<(), Interrupt> {
        let arg = self.pop_tuple()?;
        let (buffer, len) = match arg.items() {
            [Value::Buffer(b), Value::Int(n)] => (b.clone(), n.clone()),
            _ => return Err(Fault::TypeMismatch.into()),
        };
        let buffer_len = match len.to_u64() {
            Some(l) if l <= MAX_BUFFER_LEN => l,
            _ => return Err(Fault::OutOfBounds.into()),
        };
        let budget = self.gas.min(self.guest_gas_cap);
        let input_hash = buffer.hash();
        let result = self.guest.invoke(WasmEnvData { buffer_len, buffer }, budget);
        match result {
            Ok(out) if out.gas_used <= budget => {
                self.record_guest(input_hash, out.touched);
                self.gas -= out.gas_used;
                self.push(Value::Tuple(Tuple::pair(
                    Value::Buffer(out.env.buffer),
                    Value::int(out.env.buffer_len),
                )));
                self.push(Value::int(out.gas_used));
                Ok(())
            }
            Ok(out) => {
                self.record_guest(input_hash, out.touched);
                self.gas -= budget;
                Err(Fault::GuestResourceExceeded.into())
            }
            Err(GuestError::Trap {
                gas_used, touched, ..
            }) => {
                self.record_guest(input_hash, touched);
                self.gas -= gas_used.min(budget);
                Err(Fault::GuestTrap.into())
            }
            Err(GuestError::ResourceExceeded { touched }) => {
                self.record_guest(input_hash, touched);
                self.gas -= budget;
                Err(Fault::GuestResourceExceeded.into())
            }
            Err(GuestError::MissingWitness(chunk)) => Err(missing(format!("guest buffer chunk {chunk}"))),
            Err(GuestError::Engine(msg)) => Err(StepError::Guest(msg).into()),
        }
    }

    fn apply(&mut self, opcode: Opcode) -> Result<(), Interrupt> {
        use Opcode::*;
        match opcode {
            Add => self.binary(|a, b| Ok(a.wrapping_add(b)))?,
            Mul => self.binary(|a, b| Ok(a.wrapping_mul(b)))?,
            Sub => self.binary(|a, b| Ok(a.wrapping_sub(b)))?,
            Div => self.binary(|a, b| a.checked_div(b).ok_or(Fault::DivisionByZero))?,
            Mod => self.binary(|a, b| a.checked_rem(b).ok_or(Fault::DivisionByZero))?,
            Exp => self.binary(|a, b| Ok(a.wrapping_pow(b)))?,
            Lt => self.compare(|a, b| a < b)?,
            Gt => self.compare(|a, b| a > b)?,
            Eq => {
                let a = self.pop()?;
                let b = self.pop()?;
                self.push(flag(a.hash() == b.hash()));
            }
            IsZero => {
                let a = self.pop_int()?;
                self.push(flag(a.is_zero()));
            }
            BitwiseAnd => self.binary(|a, b| Ok(a.bitand(b)))?,
            BitwiseOr => self.binary(|a, b| Ok(a.bitor(b)))?,
            BitwiseXor => self.binary(|a, b| Ok(a.bitxor(b)))?,
            BitwiseNot => {
                let a = self.pop_int()?;
                self.push(Value::Int(a.not()));
            }
            Byte => self.binary(|a, b| Ok(b.byte(a)))?,
            ShiftLeft => self.binary(|a, b| Ok(b.shl(a)))?,
            ShiftRight => self.binary(|a, b| Ok(b.shr(a)))?,
            Hash => {
                let a = self.pop()?;
                self.push(Value::Int(Uint256::from_be_bytes(a.hash().as_bytes())));
            }
            Type => {
                let a = self.pop()?;
                self.push(Value::int(a.type_code() as u64));
            }
            Pop => {
                self.pop()?;
            }
            StaticPush => {
                self.witness.static_read = true;
                self.push(self.pre.static_value.clone());
            }
            RegisterPush => {
                self.witness.register_read = true;
                self.push(self.register.clone());
            }
            RegisterSet => self.register = self.pop()?,
            Jump => {
                let target = as_code_point(self.pop()?)?;
                self.jump_to(target);
            }
            CJump => {
                let target = as_code_point(self.pop()?)?;
                let cond = self.pop_int()?;
                if !cond.is_zero() {
                    self.jump_to(target);
                }
            }
            StackEmpty => {
                let empty = self.data.is_empty()?;
                self.push(flag(empty));
            }
            PcPush => self.push(Value::CodePoint(self.pre.pc)),
            AuxPush => {
                let a = self.pop()?;
                self.aux.push(a);
            }
            AuxPop => {
                let a = self.aux.pop()?;
                self.push(a);
            }
            AuxStackEmpty => {
                let empty = self.aux.is_empty()?;
                self.push(flag(empty));
            }
            Nop => {}
            ErrPush => self.push(Value::CodePoint(self.error_handler)),
            ErrSet => self.error_handler = as_code_point(self.pop()?)?,
            Switch => {
                let i = offset(&self.pop_int()?)?;
                let table = self.pop()?;
                let target = table_lookup(&table, i).map_err(|err| match err {
                    TableError::OutOfRange(_) => Fault::OutOfBounds,
                    _ => Fault::TypeMismatch,
                })?;
                self.jump_to(target);
            }
            Dup0 => {
                let a = self.pop()?;
                self.push(a.clone());
                self.push(a);
            }
            Dup1 => {
                let a = self.pop()?;
                let b = self.pop()?;
                self.push(b.clone());
                self.push(a);
                self.push(b);
            }
            Dup2 => {
                let a = self.pop()?;
                let b = self.pop()?;
                let c = self.pop()?;
                self.push(c.clone());
                self.push(b);
                self.push(a);
                self.push(c);
            }
            Swap1 => {
                let a = self.pop()?;
                let b = self.pop()?;
                self.push(a);
                self.push(b);
            }
            Swap2 => {
                let a = self.pop()?;
                let b = self.pop()?;
                let c = self.pop()?;
                self.push(a);
                self.push(b);
                self.push(c);
            }
            TGet => {
                let i = index(&self.pop_int()?)?;
                let t = self.pop_tuple()?;
                let item = t.get(i).cloned().ok_or(Fault::ArityError)?;
                self.push(item);
            }
            TSet => {
                let i = index(&self.pop_int()?)?;
                let t = self.pop_tuple()?;
                let value = self.pop()?;
                let updated = t.with(i, value).ok_or(Fault::ArityError)?;
                self.push(Value::Tuple(updated));
            }
            TLen => {
                let t = self.pop_tuple()?;
                self.push(Value::int(t.len() as u64));
            }
            XGet => {
                let i = index(&self.pop_int()?)?;
                let t = as_tuple(self.aux.pop()?)?;
                let item = t.get(i).cloned().ok_or(Fault::ArityError)?;
                self.aux.push(Value::Tuple(t));
                self.push(item);
            }
            XSet => {
                let i = index(&self.pop_int()?)?;
                let value = self.pop()?;
                let t = as_tuple(self.aux.pop()?)?;
                let updated = t.with(i, value).ok_or(Fault::ArityError)?;
                self.aux.push(Value::Tuple(updated));
            }
            Error => return Err(Fault::ExplicitError.into()),
            Halt => {
                self.status = Status::Halted;
                self.next_pc = self.pre.pc;
            }
            PushGas => self.push(Value::int(self.gas)),
            NewBuffer => self.push(Value::Buffer(Buffer::new())),
            GetBuffer8 => self.get_buffer(1)?,
            GetBuffer64 => self.get_buffer(8)?,
            GetBuffer256 => self.get_buffer(32)?,
            SetBuffer8 => self.set_buffer(1)?,
            SetBuffer64 => self.set_buffer(8)?,
            SetBuffer256 => self.set_buffer(32)?,
            RunWasm => self.run_guest()?,
        }
        Ok(())
    }
}

/// Post-state of a faulting step: pre-step contents, charged gas, handler pc.
fn fault_state(pre: &MachineState, gas: u64) -> MachineState {
    MachineState {
        pc: pre.error_handler,
        gas_remaining: gas,
        status: Status::Errored,
        ..pre.clone()
    }
}

/// Executes `op` against `pre`; `next` is the code point that follows it.
///
/// Faults are folded into the returned state; only hard failures are `Err`.
/// `witness` accumulates what was read from `pre`.
pub fn execute(
    pre: &MachineState,
    op: &Operation,
    next: CodePointStub,
    guest: &dyn GuestEngine,
    guest_gas_cap: u64,
    witness: &mut Witness,
) -> Result<(MachineState, Option<Fault>), StepError> {
    if pre.is_terminal() {
        return Err(StepError::NotRunnable(pre.status));
    }
    let cost = op.base_gas();
    if pre.gas_remaining < cost {
        return Ok((fault_state(pre, 0), Some(Fault::OutOfGas)));
    }

    let mut step = Step {
        pre,
        data: Tracked::new(&pre.data_stack),
        aux: Tracked::new(&pre.aux_stack),
        register: pre.register.clone(),
        error_handler: pre.error_handler,
        next_pc: next,
        gas: pre.gas_remaining - cost,
        status: Status::Running,
        witness,
        guest,
        guest_gas_cap,
    };
    if let Some(imm) = &op.immediate {
        step.push(imm.clone());
    }
    let result = match op.opcode() {
        Some(opcode) => step.apply(opcode),
        None => Err(Fault::UnknownOpcode(op.code).into()),
    };
    step.witness.data_depth = step.witness.data_depth.max(step.data.depth);
    step.witness.aux_depth = step.witness.aux_depth.max(step.aux.depth);

    match result {
        Ok(()) => Ok((
            MachineState {
                pc: step.next_pc,
                data_stack: step.data.stack,
                aux_stack: step.aux.stack,
                register: step.register,
                static_value: pre.static_value.clone(),
                error_handler: step.error_handler,
                gas_remaining: step.gas,
                status: step.status,
            },
            None,
        )),
        Err(Interrupt::Fault(fault)) => Ok((fault_state(pre, step.gas), Some(fault))),
        Err(Interrupt::Hard(err)) => Err(err),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Halted,
    /// Errored with no handler left to resume at.
    Errored,
    StepLimit,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub state: MachineState,
    pub steps: u64,
    pub stop: StopReason,
    pub trace: Option<ExecutionTrace>,
}

/// Steps machines over one code store.
#[derive(Clone)]
pub struct Interpreter {
    code: Arc<Code>,
    guest: Arc<dyn GuestEngine>,
    config: VmConfig,
}

impl Interpreter {
    pub fn new(code: Arc<Code>, guest: Arc<dyn GuestEngine>, config: VmConfig) -> Self {
        Self {
            code,
            guest,
            config,
        }
    }

    /// Interpreter whose `RunWasm` always traps.
    pub fn without_guest(code: Arc<Code>, config: VmConfig) -> Self {
        Self::new(code, Arc::new(NoGuest), config)
    }

    pub fn code(&self) -> &Code {
        &self.code
    }

    pub fn guest(&self) -> &dyn GuestEngine {
        self.guest.as_ref()
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Fresh machine at `program`'s entry with the configured gas limit.
    pub fn start(&self, program: &LoadedProgram) -> MachineState {
        MachineState::from_program(program, self.config.gas_limit)
    }

    pub fn step(&self, state: &MachineState) -> Result<MachineState, StepError> {
        Ok(self.step_recorded(state)?.post)
    }

    /// One step, keeping the operation, fault and witness alongside the
    /// post-state.
    pub fn step_recorded(&self, state: &MachineState) -> Result<StepRecord, StepError> {
        if state.is_terminal() {
            return Err(StepError::NotRunnable(state.status));
        }
        let (op, next) = self.code.fetch(&state.pc)?;
        let mut witness = Witness::default();
        let (post, fault) = execute(
            state,
            op,
            next,
            self.guest.as_ref(),
            self.config.guest.max_gas_per_invocation,
            &mut witness,
        )?;
        match fault {
            Some(fault) => warn!(
                pc = %state.pc,
                op = %op,
                %fault,
                handler = %state.error_handler,
                "error transition"
            ),
            None => debug!(
                pc = %state.pc,
                op = %op,
                gas = post.gas_remaining,
                hash = %post.hash(),
                "step"
            ),
        }
        Ok(StepRecord {
            op: op.clone(),
            next,
            post,
            fault,
            witness,
        })
    }

    /// Steps until the machine halts, errors out for good, or `max_steps`
    /// steps have run.
    pub fn run(&self, mut state: MachineState, max_steps: u64) -> Result<RunOutcome, StepError> {
        let mut trace = self.config.trace.then(ExecutionTrace::new);
        let mut steps = 0;
        let stop = loop {
            if state.status == Status::Halted {
                break StopReason::Halted;
            }
            if state.is_terminal() {
                break StopReason::Errored;
            }
            if steps >= max_steps {
                break StopReason::StepLimit;
            }
            let record = self.step_recorded(&state)?;
            if let Some(trace) = trace.as_mut() {
                trace.push(TraceRow {
                    step: steps,
                    pc: state.pc,
                    opcode: record.op.code,
                    gas_remaining: record.post.gas_remaining,
                    state_hash: record.post.hash(),
                });
            }
            state = record.post;
            steps += 1;
        };
        debug!(steps, ?stop, hash = %state.hash(), "run finished");
        Ok(RunOutcome {
            state,
            steps,
            stop,
            trace,
        })
    }

    /// `run` bounded by the configured step ceiling.
    pub fn run_to_completion(&self, state: MachineState) -> Result<RunOutcome, StepError> {
        self.run(state, self.config.max_steps)
    }
}
