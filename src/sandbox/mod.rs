//! Guest-sandbox bridge.
//!
//! One opcode hands a buffer to an embedded guest engine and folds the result
//! back into machine state. The guest sees only the buffer and a gas ledger:
//! it can read and write byte ranges, resize the logical length and charge
//! gas. Nothing else crosses the boundary.

pub mod wasm;

use crate::value::Buffer;
use std::collections::BTreeSet;

/// The record marshalled across the guest boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WasmEnvData {
    pub buffer_len: u64,
    pub buffer: Buffer,
}

#[derive(Debug, Clone)]
pub struct GuestOutcome {
    pub env: WasmEnvData,
    pub gas_used: u64,
    /// Chunks of the input buffer the guest read or wrote.
    pub touched: BTreeSet<u64>,
}

/// Failures of one invocation. `Trap` and `ResourceExceeded` are the guest's
/// own doing and carry the chunks touched before it stopped; the other two
/// are failures of the host side.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuestError {
    #[error("guest trapped after {gas_used} gas: {message}")]
    Trap {
        message: String,
        gas_used: u64,
        touched: BTreeSet<u64>,
    },
    #[error("guest exceeded its gas budget")]
    ResourceExceeded { touched: BTreeSet<u64> },
    /// The guest touched a chunk that is hidden in a partial buffer.
    #[error("guest needs buffer chunk {0}, which is not revealed")]
    MissingWitness(u64),
    /// The engine itself failed, independent of the guest's behaviour.
    #[error("guest engine failure: {0}")]
    Engine(String),
}

/// A guest engine invoked by `RunWasm`.
///
/// Every invocation must start from a fresh guest instance, so two calls with
/// the same input and budget produce the same outcome.
pub trait GuestEngine: Send + Sync {
    fn invoke(&self, input: WasmEnvData, gas_budget: u64) -> Result<GuestOutcome, GuestError>;
}

/// Engine for machines that never run guest code; every invocation traps.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGuest;

impl GuestEngine for NoGuest {
    fn invoke(&self, _input: WasmEnvData, _gas_budget: u64) -> Result<GuestOutcome, GuestError> {
        Err(GuestError::Trap {
            message: "no guest engine configured".into(),
            gas_used: 0,
            touched: BTreeSet::new(),
        })
    }
}
