//! One-step proofs.
//!
//! A proof carries the executed operation, both state commitments, the gas the
//! step consumed and the slice of the pre-state the step read. Everything the
//! step did not read is replaced by its hash, so the proof stays small while
//! the pre-state hash can still be recomputed from it.

use crate::code::{CodePointStub, Operation};
use crate::transcript::Hash256;
use crate::value::codec::{CodecError, Reader, write_value};
use crate::value::Value;
use crate::vm::{Interpreter, MachineState, Stack, Status, StepError, StepRecord, Witness};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProofError {
    #[error(transparent)]
    Step(#[from] StepError),
    #[error("proof encoding: {0}")]
    Codec(#[from] CodecError),
    #[error("revealed frame is malformed: {0}")]
    Frame(&'static str),
    #[error("revealed pre-state hashes to {found}, proof claims {expected}")]
    PreStateMismatch { expected: Hash256, found: Hash256 },
    #[error("operation does not hash to the revealed program counter")]
    CodeMismatch,
    #[error("replay reached {found}, proof claims {expected}")]
    PostStateMismatch { expected: Hash256, found: Hash256 },
    #[error("replay used {replayed} gas, proof claims {claimed}")]
    GasMismatch { claimed: u64, replayed: u64 },
    #[error("operation {found} differs from the one at the program counter")]
    OperationMismatch { found: String },
}

/// Everything a verifier needs to adjudicate one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepProof {
    pub pre_state_hash: Hash256,
    pub op: Operation,
    pub post_state_hash: Hash256,
    pub gas_used: u64,
    /// `[pc, next, data_stack, aux_stack, register, static, error_handler,
    /// gas_remaining, status]` of the pre-state, revealed as far as the step
    /// read it.
    pub auxiliary_revealed_values: Vec<Value>,
}

/// The pre-state frame a verifier rebuilds from a proof.
#[derive(Debug, Clone)]
pub struct RevealedFrame {
    pub state: MachineState,
    pub next: CodePointStub,
}

fn reveal_frame(pre: &MachineState, next: CodePointStub, witness: &Witness) -> Vec<Value> {
    let mut reveal = |v: &Value| witness.reveal(v);
    let data = pre.data_stack.truncate_with(witness.data_depth, &mut reveal);
    let aux = pre.aux_stack.truncate_with(witness.aux_depth, &mut reveal);
    let register = match witness.register_read {
        true => witness.reveal(&pre.register),
        false => pre.register.to_hash_only(),
    };
    let static_value = match witness.static_read {
        true => witness.reveal(&pre.static_value),
        false => pre.static_value.to_hash_only(),
    };
    vec![
        Value::CodePoint(pre.pc),
        Value::CodePoint(next),
        data.to_value(),
        aux.to_value(),
        register,
        static_value,
        Value::CodePoint(pre.error_handler),
        Value::int(pre.gas_remaining),
        Value::int(pre.status as u64),
    ]
}

impl StepProof {
    /// Proof for the transition `pre -> record.post`.
    pub fn from_record(pre: &MachineState, record: &StepRecord) -> Self {
        Self {
            pre_state_hash: pre.hash(),
            op: record.op.clone(),
            post_state_hash: record.post.hash(),
            gas_used: pre.gas_remaining - record.post.gas_remaining,
            auxiliary_revealed_values: reveal_frame(pre, record.next, &record.witness),
        }
    }

    /// Rebuilds the partial pre-state carried by the proof.
    pub fn frame(&self) -> Result<RevealedFrame, ProofError> {
        let [pc, next, data, aux, register, static_value, handler, gas, status] =
            self.auxiliary_revealed_values.as_slice()
        else {
            return Err(ProofError::Frame("expected nine values"));
        };
        let code_point = |v: &Value, what| match v {
            Value::CodePoint(stub) => Ok(*stub),
            _ => Err(ProofError::Frame(what)),
        };
        let small = |v: &Value, what| match v {
            Value::Int(n) => n.to_u64().ok_or(ProofError::Frame(what)),
            _ => Err(ProofError::Frame(what)),
        };
        let stack = |v: &Value, what| Stack::from_value(v).map_err(|_| ProofError::Frame(what));
        let status = u8::try_from(small(status, "status")?)
            .ok()
            .and_then(|b| Status::try_from(b).ok())
            .ok_or(ProofError::Frame("status"))?;
        let state = MachineState {
            pc: code_point(pc, "pc")?,
            data_stack: stack(data, "data stack")?,
            aux_stack: stack(aux, "aux stack")?,
            register: register.clone(),
            static_value: static_value.clone(),
            error_handler: code_point(handler, "error handler")?,
            gas_remaining: small(gas, "gas")?,
            status,
        };
        Ok(RevealedFrame {
            state,
            next: code_point(next, "next")?,
        })
    }

    /// Field-order concatenation: pre hash, opcode, immediate flag and value,
    /// post hash, gas used, value count, values.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(self.pre_state_hash.as_bytes());
        out.push(self.op.code);
        match &self.op.immediate {
            Some(imm) => {
                out.push(1);
                write_value(&mut out, imm);
            }
            None => out.push(0),
        }
        out.extend_from_slice(self.post_state_hash.as_bytes());
        out.extend_from_slice(&self.gas_used.to_be_bytes());
        out.push(self.auxiliary_revealed_values.len() as u8);
        for value in &self.auxiliary_revealed_values {
            write_value(&mut out, value);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProofError> {
        let mut r = Reader::new(bytes);
        let pre_state_hash = r.read_hash()?;
        let code = r.read_u8()?;
        let immediate = match r.read_u8()? {
            0 => None,
            1 => Some(r.read_value()?),
            _ => return Err(ProofError::Frame("immediate flag")),
        };
        let post_state_hash = r.read_hash()?;
        let gas_used = r.read_u64()?;
        let count = r.read_u8()? as usize;
        let auxiliary_revealed_values = (0..count)
            .map(|_| r.read_value())
            .collect::<Result<Vec<_>, _>>()?;
        if r.remaining() != 0 {
            return Err(CodecError::TrailingBytes(r.remaining()).into());
        }
        Ok(Self {
            pre_state_hash,
            op: Operation::raw(code, immediate),
            post_state_hash,
            gas_used,
            auxiliary_revealed_values,
        })
    }
}

/// Produces proofs by stepping an interpreter.
pub struct StepProver {
    interpreter: Interpreter,
}

impl StepProver {
    pub fn new(interpreter: Interpreter) -> Self {
        Self { interpreter }
    }

    pub fn interpreter(&self) -> &Interpreter {
        &self.interpreter
    }

    /// Executes one step from `pre` and proves it.
    pub fn generate_proof(&self, pre: &MachineState) -> Result<(MachineState, StepProof), ProofError> {
        let record = self.interpreter.step_recorded(pre)?;
        let proof = StepProof::from_record(pre, &record);
        debug!(
            pre = %proof.pre_state_hash,
            post = %proof.post_state_hash,
            gas_used = proof.gas_used,
            revealed_data = record.witness.data_depth,
            revealed_aux = record.witness.aux_depth,
            "step proof"
        );
        Ok((record.post, proof))
    }

    /// Proof for a transition the caller already executed. Fails if `op` is
    /// not the operation at `pre`'s program counter or `post` is not what the
    /// step produces.
    pub fn build_proof(
        &self,
        pre: &MachineState,
        op: &Operation,
        post: &MachineState,
    ) -> Result<StepProof, ProofError> {
        let record = self.interpreter.step_recorded(pre)?;
        if &record.op != op {
            return Err(ProofError::OperationMismatch {
                found: op.to_string(),
            });
        }
        if record.post.hash() != post.hash() {
            return Err(ProofError::PostStateMismatch {
                expected: post.hash(),
                found: record.post.hash(),
            });
        }
        Ok(StepProof::from_record(pre, &record))
    }

    /// Proves up to `max_steps` consecutive steps, stopping early at a
    /// terminal state.
    pub fn prove_run(
        &self,
        mut state: MachineState,
        max_steps: u64,
    ) -> Result<(MachineState, Vec<StepProof>), ProofError> {
        let mut proofs = Vec::new();
        while (proofs.len() as u64) < max_steps && !state.is_terminal() {
            let (post, proof) = self.generate_proof(&state)?;
            proofs.push(proof);
            state = post;
        }
        Ok((state, proofs))
    }
}
