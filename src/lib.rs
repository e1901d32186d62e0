//! Execution core of a deterministic, hash-committed stack machine.
//!
//! Every component of machine state is content-addressed so that a single
//! interpreter step can be proven to a verifier that only holds the pre-state
//! commitment. See `prover` and `verifier` for the one-step proof round trip.

use sha2::{Digest, Sha256};

pub mod code;
pub mod config;
pub mod merkle;
pub mod program;
pub mod prover;
pub mod sandbox;
pub mod store;
pub mod transcript;
pub mod value;
pub mod verifier;
pub mod vm;

pub use code::{Code, CodePointRef, CodePointStub, Opcode, Operation};
pub use config::{ConfigError, GuestConfig, VmConfig};
pub use program::loader::{
    EncodeError, LoadedProgram, ProgramLoadError, encode_program, load_program, load_program_hex,
};
pub use prover::{ProofError, StepProof, StepProver};
pub use sandbox::{GuestEngine, GuestError, GuestOutcome, NoGuest, WasmEnvData, wasm::WasmSandbox};
pub use store::{MemoryStore, NodeStore, StoreError, load_machine, load_value, save_machine, save_value};
pub use transcript::Hash256;
pub use value::{Buffer, Tuple, Uint256, Value};
pub use verifier::StepVerifier;
pub use vm::{
    ExecutionTrace, Fault, Interpreter, MachineState, RunOutcome, Stack, Status, StepError, StopReason,
};

pub fn digest_sha2(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}
