//! Built-in `wasi_snapshot_preview1` intrinsics.
//!
//! Just enough of WASI preview 1 for platform functions: stdio writes
//! (with optional capture), process exit, and the argv/environ pair. The
//! platform registers the rest of its syscall surface at start-up.

use std::io::Write;

use tracing::debug;
use wasmer::{FunctionEnvMut, FunctionType, MemoryView, RuntimeError, Type, Value};

use super::{arg_i32, IntrinsicCatalog};
use crate::module::execute::ExitSignal;
use crate::module::HostEnv;

const ERRNO_SUCCESS: i32 = 0;
const ERRNO_BADF: i32 = 8;

pub(super) fn register_defaults(catalog: &mut IntrinsicCatalog) {
    catalog.register(
        "fd_write",
        FunctionType::new(vec![Type::I32; 4], vec![Type::I32]),
        fd_write,
    );
    catalog.register(
        "proc_exit",
        FunctionType::new(vec![Type::I32], vec![]),
        proc_exit,
    );
    catalog.register(
        "args_sizes_get",
        FunctionType::new(vec![Type::I32; 2], vec![Type::I32]),
        args_sizes_get,
    );
    catalog.register(
        "args_get",
        FunctionType::new(vec![Type::I32; 2], vec![Type::I32]),
        args_get,
    );
    catalog.register(
        "environ_sizes_get",
        FunctionType::new(vec![Type::I32; 2], vec![Type::I32]),
        environ_sizes_get,
    );
    catalog.register(
        "environ_get",
        FunctionType::new(vec![Type::I32; 2], vec![Type::I32]),
        environ_get,
    );
}

fn fd_write(
    mut ctx: FunctionEnvMut<'_, HostEnv>,
    args: &[Value],
) -> Result<Vec<Value>, RuntimeError> {
    let fd = arg_i32(args, 0)?;
    let iovs = arg_i32(args, 1)? as u32;
    let iovs_len = arg_i32(args, 2)? as u32;
    let nwritten_ptr = arg_i32(args, 3)? as u32;

    let (data, store) = ctx.data_and_store_mut();
    let state = data.state.clone();
    let memory = state
        .lock()
        .unwrap()
        .memory
        .as_ref()
        .map(|manager| manager.memory().clone())
        .ok_or_else(|| RuntimeError::new("fd_write before memory is bound"))?;
    let view = memory.view(&store);

    // Gather the scatter list before touching any output stream.
    let mut gathered = Vec::new();
    for i in 0..iovs_len {
        let entry = iovs + i * 8;
        let base = read_guest_u32(&view, entry)?;
        let len = read_guest_u32(&view, entry + 4)?;
        let start = gathered.len();
        gathered.resize(start + len as usize, 0);
        view.read(base as u64, &mut gathered[start..])
            .map_err(|e| RuntimeError::new(format!("fd_write iovec out of bounds: {e}")))?;
    }

    match fd {
        1 => {
            let mut state = state.lock().unwrap();
            if state.capture_stdout {
                state
                    .capture_stdout_bytes(&gathered)
                    .map_err(|e| RuntimeError::new(format!("stdout capture failed: {e}")))?;
            } else {
                let _ = std::io::stdout().write_all(&gathered);
            }
        }
        2 => {
            let _ = std::io::stderr().write_all(&gathered);
        }
        _ => return Ok(vec![Value::I32(ERRNO_BADF)]),
    }

    write_guest_u32(&view, nwritten_ptr, gathered.len() as u32)?;
    Ok(vec![Value::I32(ERRNO_SUCCESS)])
}

fn proc_exit(
    _ctx: FunctionEnvMut<'_, HostEnv>,
    args: &[Value],
) -> Result<Vec<Value>, RuntimeError> {
    let code = arg_i32(args, 0)?;
    debug!(code, "proc_exit");
    Err(RuntimeError::user(Box::new(ExitSignal(code))))
}

fn args_sizes_get(
    mut ctx: FunctionEnvMut<'_, HostEnv>,
    args: &[Value],
) -> Result<Vec<Value>, RuntimeError> {
    let argc_ptr = arg_i32(args, 0)? as u32;
    let buf_size_ptr = arg_i32(args, 1)? as u32;

    let (data, store) = ctx.data_and_store_mut();
    let state = data.state.clone();
    let (memory, argv) = {
        let state = state.lock().unwrap();
        let memory = state
            .memory
            .as_ref()
            .map(|manager| manager.memory().clone())
            .ok_or_else(|| RuntimeError::new("args_sizes_get before memory is bound"))?;
        (memory, state.argv.clone())
    };
    let view = memory.view(&store);

    write_guest_u32(&view, argc_ptr, argv.len() as u32)?;
    write_guest_u32(&view, buf_size_ptr, string_array_buffer_size(&argv))?;
    Ok(vec![Value::I32(ERRNO_SUCCESS)])
}

fn args_get(
    mut ctx: FunctionEnvMut<'_, HostEnv>,
    args: &[Value],
) -> Result<Vec<Value>, RuntimeError> {
    let argv_ptr = arg_i32(args, 0)? as u32;
    let argv_buf_ptr = arg_i32(args, 1)? as u32;

    let (data, store) = ctx.data_and_store_mut();
    let state = data.state.clone();
    let (memory, argv) = {
        let state = state.lock().unwrap();
        let memory = state
            .memory
            .as_ref()
            .map(|manager| manager.memory().clone())
            .ok_or_else(|| RuntimeError::new("args_get before memory is bound"))?;
        (memory, state.argv.clone())
    };
    let view = memory.view(&store);

    write_string_array(&view, &argv, argv_ptr, argv_buf_ptr)?;
    Ok(vec![Value::I32(ERRNO_SUCCESS)])
}

fn environ_sizes_get(
    mut ctx: FunctionEnvMut<'_, HostEnv>,
    args: &[Value],
) -> Result<Vec<Value>, RuntimeError> {
    let count_ptr = arg_i32(args, 0)? as u32;
    let buf_size_ptr = arg_i32(args, 1)? as u32;

    let (data, store) = ctx.data_and_store_mut();
    let state = data.state.clone();
    let (memory, vars) = {
        let state = state.lock().unwrap();
        let memory = state
            .memory
            .as_ref()
            .map(|manager| manager.memory().clone())
            .ok_or_else(|| RuntimeError::new("environ_sizes_get before memory is bound"))?;
        (memory, state.environment_strings())
    };
    let view = memory.view(&store);

    write_guest_u32(&view, count_ptr, vars.len() as u32)?;
    write_guest_u32(&view, buf_size_ptr, string_array_buffer_size(&vars))?;
    Ok(vec![Value::I32(ERRNO_SUCCESS)])
}

fn environ_get(
    mut ctx: FunctionEnvMut<'_, HostEnv>,
    args: &[Value],
) -> Result<Vec<Value>, RuntimeError> {
    let environ_ptr = arg_i32(args, 0)? as u32;
    let environ_buf_ptr = arg_i32(args, 1)? as u32;

    let (data, store) = ctx.data_and_store_mut();
    let state = data.state.clone();
    let (memory, vars) = {
        let state = state.lock().unwrap();
        let memory = state
            .memory
            .as_ref()
            .map(|manager| manager.memory().clone())
            .ok_or_else(|| RuntimeError::new("environ_get before memory is bound"))?;
        (memory, state.environment_strings())
    };
    let view = memory.view(&store);

    write_string_array(&view, &vars, environ_ptr, environ_buf_ptr)?;
    Ok(vec![Value::I32(ERRNO_SUCCESS)])
}

/// Writes `strings` into guest memory using the argv/envp convention: the
/// strings are laid out back to back, null-terminated, at `str_buffer`, and
/// a pointer to each is written into the array at `str_pointers`.
pub(crate) fn write_string_array(
    view: &MemoryView<'_>,
    strings: &[String],
    str_pointers: u32,
    str_buffer: u32,
) -> Result<(), RuntimeError> {
    let mut next_buffer = str_buffer;
    let mut next_pointer = str_pointers;

    for string in strings {
        view.write(next_buffer as u64, string.as_bytes())
            .and_then(|_| view.write(next_buffer as u64 + string.len() as u64, &[0]))
            .map_err(|e| RuntimeError::new(format!("string buffer out of bounds: {e}")))?;

        write_guest_u32(view, next_pointer, next_buffer)?;

        next_buffer += string.len() as u32 + 1;
        next_pointer += 4;
    }

    Ok(())
}

fn string_array_buffer_size(strings: &[String]) -> u32 {
    strings.iter().map(|s| s.len() as u32 + 1).sum()
}

pub(crate) fn read_guest_u32(view: &MemoryView<'_>, ptr: u32) -> Result<u32, RuntimeError> {
    let mut bytes = [0u8; 4];
    view.read(ptr as u64, &mut bytes)
        .map_err(|e| RuntimeError::new(format!("guest pointer {ptr:#x} out of bounds: {e}")))?;
    Ok(u32::from_le_bytes(bytes))
}

pub(crate) fn write_guest_u32(
    view: &MemoryView<'_>,
    ptr: u32,
    value: u32,
) -> Result<(), RuntimeError> {
    view.write(ptr as u64, &value.to_le_bytes())
        .map_err(|e| RuntimeError::new(format!("guest pointer {ptr:#x} out of bounds: {e}")))
}
