//! Built-in `env` intrinsics: the dynamic linking helpers guest code calls
//! like `dlopen`/`dlsym`.

use wasmer::{FunctionEnvMut, FunctionType, RuntimeError, Type, Value};

use super::{arg_i32, read_guest_string, IntrinsicCatalog};
use crate::module::dynlink;
use crate::module::HostEnv;

pub(super) fn register_defaults(catalog: &mut IntrinsicCatalog) {
    catalog.register(
        "dynamic_load",
        FunctionType::new(vec![Type::I32; 2], vec![Type::I32]),
        dynamic_load,
    );
    catalog.register(
        "get_dynamic_func",
        FunctionType::new(vec![Type::I32; 3], vec![Type::I32]),
        get_dynamic_func,
    );
}

/// `dynamic_load(path_ptr, path_len) -> handle`; the guest-facing face of
/// `dlopen`. Returns 0 when the path does not name a loadable module.
fn dynamic_load(
    mut ctx: FunctionEnvMut<'_, HostEnv>,
    args: &[Value],
) -> Result<Vec<Value>, RuntimeError> {
    let path_ptr = arg_i32(args, 0)?;
    let path_len = arg_i32(args, 1)?;

    let func_env = ctx.as_ref();
    let (data, mut store) = ctx.data_and_store_mut();
    let state = data.state.clone();

    let path = {
        let memory = state
            .lock()
            .unwrap()
            .memory
            .as_ref()
            .map(|manager| manager.memory().clone())
            .ok_or_else(|| RuntimeError::new("dynamic_load before memory is bound"))?;
        let view = memory.view(&store);
        read_guest_string(&view, path_ptr, path_len)?
    };

    let handle = dynlink::dynamic_load_impl(&state, &mut store, &func_env, &path)
        .map_err(|e| RuntimeError::user(Box::new(e)))?;

    Ok(vec![Value::I32(handle as i32)])
}

/// `get_dynamic_func(handle, name_ptr, name_len) -> table index`; the
/// guest-facing face of `dlsym`. The returned index is callable through the
/// indirect function table.
fn get_dynamic_func(
    mut ctx: FunctionEnvMut<'_, HostEnv>,
    args: &[Value],
) -> Result<Vec<Value>, RuntimeError> {
    let handle = arg_i32(args, 0)?;
    let name_ptr = arg_i32(args, 1)?;
    let name_len = arg_i32(args, 2)?;

    let (data, mut store) = ctx.data_and_store_mut();
    let state = data.state.clone();

    let name = {
        let memory = state
            .lock()
            .unwrap()
            .memory
            .as_ref()
            .map(|manager| manager.memory().clone())
            .ok_or_else(|| RuntimeError::new("get_dynamic_func before memory is bound"))?;
        let view = memory.view(&store);
        read_guest_string(&view, name_ptr, name_len)?
    };

    let index = dynlink::get_dynamic_func_impl(&state, &mut store, handle as u32, &name)
        .map_err(|e| RuntimeError::user(Box::new(e)))?;

    Ok(vec![Value::I32(index as i32)])
}
