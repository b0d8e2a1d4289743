//! Function execution on a bound module.
//!
//! Invocation results collapse the two historical control-flow exceptions
//! (runtime traps and the guest exit signal) into [`InvokeOutcome`]: a trap
//! becomes `Trapped`, a `proc_exit` becomes `Exited`, and everything else
//! is a plain `Returned`.

use std::sync::Arc;

use tracing::{debug, error};
use wasmer::{AsStoreMut, Function, RuntimeError, Value};

use crate::config;
use crate::memory::MemoryMapError;
use crate::message::Message;
use crate::module::{get_export_function, ENTRY_FUNC_NAME};
use crate::omp::{self, Level, ThreadPool};

use super::threads::WasmThreadSpec;
use super::WasmModule;

/// The guest asked to terminate with a status code. Raised by `proc_exit`
/// and unwound through the runtime as a user error.
#[derive(Debug, thiserror::Error)]
#[error("wasm exit with code {0}")]
pub struct ExitSignal(pub i32);

/// What happened when a Wasm function was driven to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvokeOutcome {
    /// The function returned normally; `0` when it returns no value.
    Returned(i32),
    /// A runtime trap (out-of-bounds access, unreachable, division by
    /// zero, ...).
    Trapped(String),
    /// The guest raised the exit signal with this status code.
    Exited(i32),
}

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("module must be bound before executing a function")]
    NotBound,

    #[error("cannot execute {requested} on module bound to {bound}")]
    WrongFunction { requested: String, bound: String },

    #[error("unexpected function pointer signature with {0} params")]
    UnexpectedFunctionArity(usize),

    #[error("invalid input for single-argument function: {0:?}")]
    InvalidFunctionArg(String),

    #[error("no function at table index {0}")]
    FunctionNotFound(i32),

    #[error("missing exported function {0}")]
    MissingExport(String),

    #[error("module does not export a stack pointer global")]
    MissingStackPointer,

    #[error("expected first mutable global in context to be the stack pointer ({0})")]
    UnexpectedStackPointer(u32),

    #[error("failed to update stack pointer: {0}")]
    StackPointerUpdate(RuntimeError),

    #[error(transparent)]
    Memory(#[from] MemoryMapError),
}

/// Calls `func` and folds the result into an [`InvokeOutcome`].
pub(crate) fn invoke(
    store: &mut impl AsStoreMut,
    func: &Function,
    args: &[Value],
) -> InvokeOutcome {
    match func.call(store, args) {
        Ok(results) => {
            let value = results
                .first()
                .and_then(|value| match value {
                    Value::I32(v) => Some(*v),
                    _ => None,
                })
                .unwrap_or(0);
            InvokeOutcome::Returned(value)
        }
        Err(err) => match err.downcast::<ExitSignal>() {
            Ok(ExitSignal(code)) => InvokeOutcome::Exited(code),
            Err(trap) => InvokeOutcome::Trapped(trap.message()),
        },
    }
}

impl WasmModule {
    /// Executes the invocation described by `msg`. Returns whether the call
    /// succeeded; the guest's status code lands in `msg.return_value`.
    /// Traps and exits are results, not errors; only precondition
    /// violations surface as `Err`.
    pub fn execute(&mut self, msg: &mut Message) -> Result<bool, ExecuteError> {
        if !self.is_bound() || self.compartment.is_none() {
            return Err(ExecuteError::NotBound);
        }

        {
            let state = self.state.lock().unwrap();
            if state.user != msg.user || state.function != msg.function {
                let bound = format!("{}/{}", state.user, state.function);
                error!(
                    requested = %msg.func_str(),
                    bound = %bound,
                    "cannot execute function on module bound to another"
                );
                return Err(ExecuteError::WrongFunction {
                    requested: msg.func_str(),
                    bound,
                });
            }
        }

        // Make sure function-specific shared files are in place.
        self.state.lock().unwrap().filesystem.sync_shared_files(msg);

        self.prepare_omp_context(msg);

        // A distributed OpenMP fork runs on a fresh thread stack and skips
        // the normal entrypoint plumbing entirely.
        if msg.omp_depth > 0 {
            let return_value = self.execute_remote_omp(msg)?;
            msg.return_value = return_value;
            return Ok(true);
        }

        let (func, args) = if msg.func_ptr > 0 {
            let func = self.function_from_table(msg.func_ptr)?;

            let n_params = {
                let compartment = self.compartment.as_mut().ok_or(ExecuteError::NotBound)?;
                func.ty(&compartment.store).params().len()
            };

            let args = match n_params {
                0 => Vec::new(),
                1 => {
                    // A single-argument pointer is a chained invocation; the
                    // argument rides in as the message input.
                    let value = if msg.input_data.is_empty() {
                        0
                    } else {
                        parse_input_arg(&msg.input_data)?
                    };
                    vec![Value::I32(value)]
                }
                n => {
                    error!(params = n, "unexpected function pointer type");
                    return Err(ExecuteError::UnexpectedFunctionArity(n));
                }
            };

            (func, args)
        } else {
            {
                let mut state = self.state.lock().unwrap();
                state.argv = vec![msg.func_str()];
            }

            let func = {
                let state = self.state.lock().unwrap();
                state
                    .main_instance
                    .as_ref()
                    .and_then(|instance| get_export_function(instance, ENTRY_FUNC_NAME))
            }
            .ok_or_else(|| ExecuteError::MissingExport(ENTRY_FUNC_NAME.to_string()))?;

            (func, Vec::new())
        };

        let compartment = self.compartment.as_mut().ok_or(ExecuteError::NotBound)?;
        let outcome = invoke(&mut compartment.store, &func, &args);

        let (success, return_value) = match outcome {
            InvokeOutcome::Returned(value) => (true, value),
            InvokeOutcome::Trapped(reason) => {
                error!(%reason, "runtime exception");
                (false, 1)
            }
            InvokeOutcome::Exited(code) => {
                debug!(code, "caught wasm exit signal");
                (code == 0, code)
            }
        };

        msg.return_value = return_value;
        Ok(success)
    }

    /// Runs one remote OpenMP thread: the indirect function gets
    /// `[thread_num, argc, args...]` (args reversed, matching the fork
    /// convention) on a freshly allocated thread stack.
    fn execute_remote_omp(&mut self, msg: &Message) -> Result<i32, ExecuteError> {
        let func = self.function_from_table(msg.func_ptr)?;

        let thread_num = msg.omp_thread_num;
        let argc = msg.omp_function_args.len();
        debug!(
            thread_num,
            func_ptr = msg.func_ptr,
            argc,
            "running OMP thread"
        );

        let mut args = Vec::with_capacity(argc + 2);
        args.push(Value::I32(thread_num));
        args.push(Value::I32(argc as i32));
        for arg in msg.omp_function_args.iter().rev() {
            args.push(Value::I32(*arg));
        }

        let stack_base = self.allocate_thread_stack()?;
        let spec = WasmThreadSpec {
            func,
            args,
            stack_base,
        };

        self.execute_thread(&spec)
    }

    fn prepare_omp_context(&mut self, msg: &Message) {
        let level = if msg.omp_depth > 0 {
            Level::MultiHost {
                depth: msg.omp_depth,
                effective_depth: msg.omp_eff_depth,
                max_active_levels: msg.omp_max_active_levels,
                num_threads: msg.omp_num_threads,
            }
        } else {
            let pool_size = config::global().omp_thread_pool_size;
            self.state.lock().unwrap().omp_pool = Some(ThreadPool::new(pool_size));
            Level::SingleHost
        };

        omp::set_thread_context(msg.omp_thread_num, Arc::new(level));
    }

    /// Resolves a function pointer through the indirect call table.
    pub fn function_from_table(&mut self, func_ptr: i32) -> Result<Function, ExecuteError> {
        let compartment = self.compartment.as_mut().ok_or(ExecuteError::NotBound)?;
        let state = self.state.lock().unwrap();
        let table = state.table.as_ref().ok_or(ExecuteError::NotBound)?;
        table
            .get_function(&mut compartment.store, func_ptr as u32)
            .ok_or(ExecuteError::FunctionNotFound(func_ptr))
    }
}

fn parse_input_arg(input: &[u8]) -> Result<i32, ExecuteError> {
    let text = std::str::from_utf8(input)
        .map_err(|_| ExecuteError::InvalidFunctionArg(String::from_utf8_lossy(input).into_owned()))?;
    text.trim()
        .parse()
        .map_err(|_| ExecuteError::InvalidFunctionArg(text.to_string()))
}
