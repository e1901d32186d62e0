use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    config::GuestConfig,
    prover::{ProofError, StepProof},
    sandbox::{GuestEngine, NoGuest},
    vm::{MachineState, Witness, execute},
};

/// Checks one-step proofs against nothing but their own contents.
///
/// The verifier:
/// 1. Rebuilds the revealed pre-state and checks it hashes to the claimed one
/// 2. Checks the operation is the one committed to by the program counter
/// 3. Replays the step and compares the post-state hash and gas used
pub struct StepVerifier {
    guest: Arc<dyn GuestEngine>,
    config: GuestConfig,
}

impl StepVerifier {
    /// Verifier replaying `RunWasm` with `guest`; it must be built from the
    /// same module the prover used.
    pub fn new(guest: Arc<dyn GuestEngine>, config: GuestConfig) -> Self {
        Self { guest, config }
    }

    pub fn without_guest(config: GuestConfig) -> Self {
        Self::new(Arc::new(NoGuest), config)
    }

    /// Replays the proven step and returns the partial post-state.
    pub fn replay(&self, proof: &StepProof) -> Result<MachineState, ProofError> {
        let frame = proof.frame()?;
        let pre_hash = frame.state.hash();
        if pre_hash != proof.pre_state_hash {
            return Err(ProofError::PreStateMismatch {
                expected: proof.pre_state_hash,
                found: pre_hash,
            });
        }
        if proof.op.code_point_hash(&frame.next.hash) != frame.state.pc.hash {
            return Err(ProofError::CodeMismatch);
        }

        let mut witness = Witness::default();
        let (post, fault) = execute(
            &frame.state,
            &proof.op,
            frame.next,
            self.guest.as_ref(),
            self.config.max_gas_per_invocation,
            &mut witness,
        )?;
        let replayed = frame.state.gas_remaining - post.gas_remaining;
        if replayed != proof.gas_used {
            return Err(ProofError::GasMismatch {
                claimed: proof.gas_used,
                replayed,
            });
        }
        debug!(op = %proof.op, ?fault, gas_used = replayed, "replayed step");
        Ok(post)
    }

    pub fn verify(&self, proof: &StepProof) -> Result<(), ProofError> {
        let post = self.replay(proof)?;
        let post_hash = post.hash();
        if post_hash != proof.post_state_hash {
            return Err(ProofError::PostStateMismatch {
                expected: proof.post_state_hash,
                found: post_hash,
            });
        }
        Ok(())
    }

    /// `true` if the proof verifies; the reason for a rejection is logged.
    pub fn is_valid(&self, proof: &StepProof) -> bool {
        match self.verify(proof) {
            Ok(()) => true,
            Err(err) => {
                warn!(pre = %proof.pre_state_hash, error = %err, "proof rejected");
                false
            }
        }
    }

    /// Verifies a chain of proofs, each starting where the previous one ended.
    pub fn verify_chain(&self, proofs: &[StepProof]) -> Result<(), ProofError> {
        for (i, proof) in proofs.iter().enumerate() {
            if i > 0 && proofs[i - 1].post_state_hash != proof.pre_state_hash {
                return Err(ProofError::PreStateMismatch {
                    expected: proofs[i - 1].post_state_hash,
                    found: proof.pre_state_hash,
                });
            }
            self.verify(proof)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{Code, CodePointStub, Opcode, Operation};
    use crate::config::VmConfig;
    use crate::prover::StepProver;
    use crate::transcript::Hash256;
    use crate::value::Value;
    use crate::vm::{Interpreter, StepError};

    fn setup(ops: Vec<Operation>) -> (StepProver, CodePointStub) {
        let mut code = Code::new();
        let mut head = code.add_segment();
        for op in ops.into_iter().rev() {
            head = code.add_operation(head, op).unwrap();
        }
        let vm = Interpreter::without_guest(Arc::new(code), VmConfig::default());
        (StepProver::new(vm), head)
    }

    fn verifier() -> StepVerifier {
        StepVerifier::without_guest(GuestConfig::default())
    }

    fn start(entry: CodePointStub) -> MachineState {
        let mut s = MachineState::new(entry, Value::int(3), 500);
        for i in 0..4 {
            s.data_stack = s.data_stack.push(Value::int(i + 1));
        }
        s
    }

    #[test]
    fn honest_run_verifies() {
        let (prover, entry) = setup(vec![
            Operation::new(Opcode::Add),
            Operation::new(Opcode::StaticPush),
            Operation::new(Opcode::Mul),
            Operation::with_immediate(Opcode::RegisterSet, Value::int(9)),
            Operation::new(Opcode::RegisterPush),
            Operation::new(Opcode::Halt),
        ]);
        let (end, proofs) = prover.prove_run(start(entry), 100).unwrap();
        assert_eq!(proofs.len(), 6);
        assert_eq!(proofs.last().unwrap().post_state_hash, end.hash());
        verifier().verify_chain(&proofs).unwrap();
    }

    #[test]
    fn fault_transitions_verify() {
        let (prover, entry) = setup(vec![Operation::with_immediate(Opcode::Div, Value::int(0))]);
        let mut pre = start(entry);
        pre.data_stack = pre.data_stack.push(Value::int(0));
        let (post, proof) = prover.generate_proof(&pre).unwrap();
        assert!(post.pc.is_error_point());
        verifier().verify(&proof).unwrap();
    }

    #[test]
    fn tampered_proofs_are_rejected() {
        let (prover, entry) = setup(vec![Operation::new(Opcode::Sub)]);
        let (_, proof) = prover.generate_proof(&start(entry)).unwrap();
        let v = verifier();
        assert!(v.is_valid(&proof));

        let mut bad = proof.clone();
        bad.post_state_hash = Hash256([1u8; 32]);
        assert!(matches!(v.verify(&bad), Err(ProofError::PostStateMismatch { .. })));

        let mut bad = proof.clone();
        bad.gas_used += 1;
        assert!(matches!(v.verify(&bad), Err(ProofError::GasMismatch { .. })));

        let mut bad = proof.clone();
        bad.op = Operation::new(Opcode::Add);
        assert_eq!(v.verify(&bad), Err(ProofError::CodeMismatch));

        let mut bad = proof.clone();
        bad.auxiliary_revealed_values[7] = Value::int(501);
        assert!(matches!(v.verify(&bad), Err(ProofError::PreStateMismatch { .. })));

        let mut bad = proof;
        bad.auxiliary_revealed_values.pop();
        assert!(matches!(v.verify(&bad), Err(ProofError::Frame(_))));
    }

    #[test]
    fn hidden_operand_is_a_hard_error() {
        let (prover, entry) = setup(vec![Operation::new(Opcode::Pop)]);
        let (_, mut proof) = prover.generate_proof(&start(entry)).unwrap();
        // Hide the stack the step needs; the hash is unchanged.
        let hidden = proof.auxiliary_revealed_values[2].to_hash_only();
        proof.auxiliary_revealed_values[2] = hidden;
        assert!(matches!(
            verifier().verify(&proof),
            Err(ProofError::Step(StepError::MissingWitness(_)))
        ));
    }
}
