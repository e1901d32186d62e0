//! `wasmtime`-backed guest engine.
//!
//! The guest module exports `memory` and `run: () -> ()` and may import, from
//! module `env`:
//!
//! ```text
//! buffer_len() -> i64
//! set_buffer_len(len: i64)
//! read(offset: i64, ptr: i32, len: i32)    ; buffer -> guest memory
//! write(offset: i64, ptr: i32, len: i32)   ; guest memory -> buffer
//! charge_gas(amount: i64)
//! ```
//!
//! Execution is metered with fuel. Explicit `charge_gas` calls burn
//! `amount * fuel_per_gas` fuel, so gas used is
//! `ceil(fuel consumed / fuel_per_gas)` and never exceeds the budget.

use super::{GuestEngine, GuestError, GuestOutcome, WasmEnvData};
use crate::config::GuestConfig;
use crate::value::buffer::{BufferError, MAX_BUFFER_LEN, chunk_span};
use std::collections::BTreeSet;
use tracing::trace;
use wasmtime::{
    Caller, Config, Engine, Extern, Linker, Memory, Module, Store, StoreLimits,
    StoreLimitsBuilder, Trap,
};

#[derive(Debug, thiserror::Error)]
enum HostFault {
    #[error("negative argument to {0}")]
    Negative(&'static str),
    #[error("guest memory range out of bounds")]
    Memory,
    #[error("buffer range {offset}+{len} out of bounds")]
    OutOfBounds { offset: u64, len: u64 },
    #[error("buffer chunk {0} is hidden")]
    Hidden(u64),
    #[error("gas budget exhausted")]
    OutOfGas,
    #[error("guest does not export memory")]
    NoMemory,
}

impl From<BufferError> for HostFault {
    fn from(err: BufferError) -> Self {
        match err {
            BufferError::Hidden(chunk) => HostFault::Hidden(chunk),
            BufferError::OutOfBounds { offset, len } => HostFault::OutOfBounds { offset, len },
            BufferError::Malformed => HostFault::OutOfBounds { offset: 0, len: 0 },
        }
    }
}

struct HostState {
    env: WasmEnvData,
    touched: BTreeSet<u64>,
    fuel_per_gas: u64,
    limits: StoreLimits,
}

pub struct WasmSandbox {
    engine: Engine,
    module: Module,
    linker: Linker<HostState>,
    config: GuestConfig,
}

fn engine_error(err: wasmtime::Error) -> GuestError {
    GuestError::Engine(err.to_string())
}

fn guest_memory(caller: &mut Caller<'_, HostState>) -> Result<Memory, HostFault> {
    caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or(HostFault::NoMemory)
}

/// Validates a guest pointer range against current memory size.
fn guest_range(
    caller: &Caller<'_, HostState>,
    memory: &Memory,
    ptr: i32,
    len: i32,
    name: &'static str,
) -> Result<(usize, usize), HostFault> {
    let len = usize::try_from(len).map_err(|_| HostFault::Negative(name))?;
    let ptr = ptr as u32 as usize;
    match ptr.checked_add(len) {
        Some(end) if end <= memory.data_size(caller) => Ok((ptr, len)),
        _ => Err(HostFault::Memory),
    }
}

fn define_host(linker: &mut Linker<HostState>) -> wasmtime::Result<()> {
    linker.func_wrap("env", "buffer_len", |caller: Caller<'_, HostState>| -> i64 {
        caller.data().env.buffer_len as i64
    })?;

    linker.func_wrap(
        "env",
        "set_buffer_len",
        |mut caller: Caller<'_, HostState>, len: i64| -> wasmtime::Result<()> {
            let len = u64::try_from(len).map_err(|_| HostFault::Negative("set_buffer_len"))?;
            if len > MAX_BUFFER_LEN {
                return Err(HostFault::OutOfBounds { offset: 0, len }.into());
            }
            caller.data_mut().env.buffer_len = len;
            Ok(())
        },
    )?;

    linker.func_wrap(
        "env",
        "read",
        |mut caller: Caller<'_, HostState>, offset: i64, ptr: i32, len: i32| -> wasmtime::Result<()> {
            let offset = u64::try_from(offset).map_err(|_| HostFault::Negative("read"))?;
            let memory = guest_memory(&mut caller)?;
            let (ptr, len) = guest_range(&caller, &memory, ptr, len, "read")?;
            let state = caller.data_mut();
            let bytes = state
                .env
                .buffer
                .read(offset, len as u64)
                .map_err(HostFault::from)?;
            state.touched.extend(chunk_span(offset, len as u64));
            memory
                .write(&mut caller, ptr, &bytes)
                .map_err(|_| HostFault::Memory)?;
            Ok(())
        },
    )?;

    linker.func_wrap(
        "env",
        "write",
        |mut caller: Caller<'_, HostState>, offset: i64, ptr: i32, len: i32| -> wasmtime::Result<()> {
            let offset = u64::try_from(offset).map_err(|_| HostFault::Negative("write"))?;
            let memory = guest_memory(&mut caller)?;
            let (ptr, len) = guest_range(&caller, &memory, ptr, len, "write")?;
            let mut data = vec![0u8; len];
            memory
                .read(&caller, ptr, &mut data)
                .map_err(|_| HostFault::Memory)?;
            let state = caller.data_mut();
            let updated = state.env.buffer.write(offset, &data).map_err(HostFault::from)?;
            state.touched.extend(chunk_span(offset, len as u64));
            state.env.buffer = updated;
            Ok(())
        },
    )?;

    linker.func_wrap(
        "env",
        "charge_gas",
        |mut caller: Caller<'_, HostState>, amount: i64| -> wasmtime::Result<()> {
            let amount = u64::try_from(amount).map_err(|_| HostFault::Negative("charge_gas"))?;
            let cost = amount.saturating_mul(caller.data().fuel_per_gas);
            let fuel = caller.get_fuel()?;
            if cost > fuel {
                caller.set_fuel(0)?;
                return Err(HostFault::OutOfGas.into());
            }
            caller.set_fuel(fuel - cost)?;
            Ok(())
        },
    )?;

    Ok(())
}

fn classify(err: wasmtime::Error, gas_used: u64, touched: BTreeSet<u64>) -> GuestError {
    let trap = |message: String, touched| GuestError::Trap {
        message,
        gas_used,
        touched,
    };
    if let Some(fault) = err.downcast_ref::<HostFault>() {
        return match fault {
            HostFault::OutOfGas => GuestError::ResourceExceeded { touched },
            HostFault::Hidden(chunk) => GuestError::MissingWitness(*chunk),
            other => trap(other.to_string(), touched),
        };
    }
    match err.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => GuestError::ResourceExceeded { touched },
        Some(t) => trap(t.to_string(), touched),
        None => engine_error(err),
    }
}

impl WasmSandbox {
    /// Compiles a guest module from wasm bytes or WAT text.
    pub fn new(module: impl AsRef<[u8]>, config: GuestConfig) -> Result<Self, GuestError> {
        let mut wasm_config = Config::new();
        wasm_config.consume_fuel(true);
        wasm_config.cranelift_nan_canonicalization(true);
        let engine = Engine::new(&wasm_config).map_err(engine_error)?;
        let module = Module::new(&engine, module).map_err(engine_error)?;
        let mut linker = Linker::new(&engine);
        define_host(&mut linker).map_err(engine_error)?;
        Ok(Self {
            engine,
            module,
            linker,
            config,
        })
    }

    pub fn config(&self) -> &GuestConfig {
        &self.config
    }
}

impl GuestEngine for WasmSandbox {
    fn invoke(&self, input: WasmEnvData, gas_budget: u64) -> Result<GuestOutcome, GuestError> {
        let fuel_per_gas = self.config.fuel_per_gas.max(1);
        let fuel = gas_budget.saturating_mul(fuel_per_gas);
        let limits = StoreLimitsBuilder::new()
            .memory_size(self.config.memory_limit_bytes)
            .instances(1)
            .build();
        let mut store = Store::new(
            &self.engine,
            HostState {
                env: input,
                touched: BTreeSet::new(),
                fuel_per_gas,
                limits,
            },
        );
        store.limiter(|state| &mut state.limits);
        store.set_fuel(fuel).map_err(engine_error)?;
        trace!(gas_budget, fuel, "guest invocation start");

        let result = self
            .linker
            .instantiate(&mut store, &self.module)
            .and_then(|instance| {
                let run = instance.get_typed_func::<(), ()>(&mut store, "run")?;
                run.call(&mut store, ())
            });

        let remaining = store.get_fuel().map_err(engine_error)?;
        let gas_used = (fuel - remaining.min(fuel)).div_ceil(fuel_per_gas);
        let HostState { env, touched, .. } = store.into_data();
        if let Err(err) = result {
            let err = classify(err, gas_used, touched);
            trace!(gas_used, error = %err, "guest invocation failed");
            return Err(err);
        }

        trace!(gas_used, buffer_len = env.buffer_len, "guest invocation done");
        Ok(GuestOutcome {
            env,
            gas_used,
            touched,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Buffer;

    const IMPORTS: &str = r#"
        (import "env" "buffer_len" (func $len (result i64)))
        (import "env" "set_buffer_len" (func $set_len (param i64)))
        (import "env" "read" (func $read (param i64 i32 i32)))
        (import "env" "write" (func $write (param i64 i32 i32)))
        (import "env" "charge_gas" (func $charge (param i64)))
        (memory (export "memory") 1)
    "#;

    fn sandbox(body: &str) -> WasmSandbox {
        let wat = format!("(module {IMPORTS} {body})");
        WasmSandbox::new(wat, GuestConfig::default()).unwrap()
    }

    fn increment() -> WasmSandbox {
        sandbox(
            r#"(func (export "run")
                (call $read (i64.const 0) (i32.const 0) (i32.const 8))
                (i64.store (i32.const 0) (i64.add (i64.load (i32.const 0)) (i64.const 1)))
                (call $write (i64.const 0) (i32.const 0) (i32.const 8))
                (call $set_len (i64.add (call $len) (i64.const 1)))
                (call $charge (i64.const 5)))"#,
        )
    }

    fn input(bytes: &[u8]) -> WasmEnvData {
        WasmEnvData {
            buffer_len: bytes.len() as u64,
            buffer: Buffer::from_bytes(bytes).unwrap(),
        }
    }

    #[test]
    fn guest_reads_and_writes_the_buffer() {
        let out = increment().invoke(input(&[1]), 1_000).unwrap();
        assert_eq!(out.env.buffer.read(0, 8).unwrap(), vec![2, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(out.env.buffer_len, 2);
        assert!(out.gas_used >= 5 && out.gas_used <= 1_000);
        assert_eq!(out.touched, [0u64].into_iter().collect());
    }

    #[test]
    fn invocations_do_not_share_state() {
        let engine = increment();
        let a = engine.invoke(input(&[7, 7]), 1_000).unwrap();
        let b = engine.invoke(input(&[7, 7]), 1_000).unwrap();
        assert_eq!(a.env, b.env);
        assert_eq!(a.gas_used, b.gas_used);
    }

    #[test]
    fn trap_is_reported_with_gas() {
        let engine = sandbox(r#"(func (export "run") unreachable)"#);
        assert!(matches!(
            engine.invoke(input(&[]), 1_000),
            Err(GuestError::Trap { .. })
        ));
    }

    #[test]
    fn trap_reports_chunks_read_before_it() {
        let engine = sandbox(
            r#"(func (export "run")
                (call $read (i64.const 40) (i32.const 0) (i32.const 4))
                unreachable)"#,
        );
        match engine.invoke(input(&[3u8; 64]), 1_000) {
            Err(GuestError::Trap { touched, gas_used, .. }) => {
                assert_eq!(touched, [1u64].into_iter().collect());
                assert!(gas_used > 0);
            }
            other => panic!("expected trap, got {other:?}"),
        }
    }

    #[test]
    fn endless_loop_runs_out_of_fuel() {
        let engine = sandbox(r#"(func (export "run") (loop $l (br $l)))"#);
        assert!(matches!(
            engine.invoke(input(&[]), 50),
            Err(GuestError::ResourceExceeded { .. })
        ));
    }

    #[test]
    fn explicit_charge_over_budget() {
        let engine = sandbox(r#"(func (export "run") (call $charge (i64.const 1000000)))"#);
        assert!(matches!(
            engine.invoke(input(&[]), 100),
            Err(GuestError::ResourceExceeded { .. })
        ));
    }

    #[test]
    fn memory_growth_is_capped() {
        let engine = sandbox(
            r#"(func (export "run")
                (if (i32.eq (memory.grow (i32.const 400)) (i32.const -1))
                    (then unreachable)))"#,
        );
        assert!(matches!(
            engine.invoke(input(&[]), 1_000),
            Err(GuestError::Trap { .. })
        ));
    }

    #[test]
    fn hidden_chunk_is_missing_witness() {
        let full = Buffer::from_bytes(&[1u8; 64]).unwrap();
        let pruned = full.prune(&[1u64].into_iter().collect());
        let env = WasmEnvData {
            buffer_len: 64,
            buffer: pruned,
        };
        assert_eq!(
            increment().invoke(env, 1_000).unwrap_err(),
            GuestError::MissingWitness(0)
        );
    }

    #[test]
    fn host_imports_outside_env_are_not_provided() {
        let wat = r#"(module
            (import "wasi_snapshot_preview1" "fd_write" (func (param i32 i32 i32 i32) (result i32)))
            (memory (export "memory") 1)
            (func (export "run")))"#;
        let engine = WasmSandbox::new(wat, GuestConfig::default()).unwrap();
        assert!(matches!(
            engine.invoke(input(&[]), 1_000),
            Err(GuestError::Engine(_))
        ));
    }
}
