//! Per-thread execution contexts.
//!
//! Worker threads run Wasm functions against the shared linear memory, each
//! on its own stack carved out of that memory. The module ABI gives no
//! mutual exclusion; disjoint stacks are what keeps concurrent executions
//! off each other's toes.

use tracing::{debug, error};
use wasmer::{Function, Value};

use crate::module::STACK_SIZE;

use super::execute::{invoke, ExecuteError, InvokeOutcome};
use super::WasmModule;

/// Stack carved out of linear memory for each worker thread.
pub const THREAD_STACK_SIZE: u32 = 2 * 1024 * 1024;

/// Everything needed to run one function on a worker thread.
pub struct WasmThreadSpec {
    pub func: Function,
    pub args: Vec<Value>,
    pub stack_base: u32,
}

impl WasmModule {
    /// Carves a fresh thread stack out of linear memory, returning its base.
    pub fn allocate_thread_stack(&mut self) -> Result<u32, ExecuteError> {
        let compartment = self.compartment.as_mut().ok_or(ExecuteError::NotBound)?;
        let mut state = self.state.lock().unwrap();
        let memory = state.memory.as_mut().ok_or(ExecuteError::NotBound)?;
        Ok(memory.map_bytes(&mut compartment.store, THREAD_STACK_SIZE)?)
    }

    /// Runs `spec.func` in a thread execution context: the stack pointer is
    /// repointed at the top of the spec's stack for the duration of the
    /// call and put back afterwards. Returns the guest's return value, with
    /// traps reported as 1 and exits as their status code.
    pub fn execute_thread(&mut self, spec: &WasmThreadSpec) -> Result<i32, ExecuteError> {
        let stack_pointer = {
            let state = self.state.lock().unwrap();
            state
                .main_instance
                .as_ref()
                .and_then(|instance| instance.exports.get_global("__stack_pointer").ok().cloned())
        }
        .ok_or(ExecuteError::MissingStackPointer)?;

        let compartment = self.compartment.as_mut().ok_or(ExecuteError::NotBound)?;
        let store = &mut compartment.store;

        // If the resting value is not the module's stack size, the
        // assumption that this global is the stack pointer does not hold,
        // and repointing it would corrupt something else.
        let saved = stack_pointer.get(store);
        let current = match saved {
            Value::I32(value) => value as u32,
            _ => return Err(ExecuteError::MissingStackPointer),
        };
        if current != STACK_SIZE {
            error!(
                current,
                "expected first mutable global in context to be the stack pointer"
            );
            return Err(ExecuteError::UnexpectedStackPointer(current));
        }

        let stack_top = spec.stack_base + THREAD_STACK_SIZE - 1;
        stack_pointer
            .set(store, Value::I32(stack_top as i32))
            .map_err(ExecuteError::StackPointerUpdate)?;

        debug!(
            stack_base = spec.stack_base,
            stack_top, "invoking function on thread stack"
        );
        let outcome = invoke(store, &spec.func, &spec.args);

        stack_pointer
            .set(store, saved)
            .map_err(ExecuteError::StackPointerUpdate)?;

        let return_value = match outcome {
            InvokeOutcome::Returned(value) => value,
            InvokeOutcome::Trapped(reason) => {
                error!(%reason, "runtime exception");
                1
            }
            InvokeOutcome::Exited(code) => {
                debug!(code, "caught wasm exit signal");
                code
            }
        };

        Ok(return_value)
    }
}
