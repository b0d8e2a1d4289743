//! Dynamic loading of shared modules, the Wasm equivalent of `dlopen`.
//!
//! Handle conventions follow `dlopen`: `0` is the error value, `1` resolves
//! against the main/env/wasi bundle, and real shared modules get handles
//! from `2` upwards. A path loads at most once per bound module; repeat
//! loads return the cached handle with no side effects.

use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::{debug, error};
use wasmer::{AsStoreMut, FunctionEnv, Instance};

use crate::instance::ModuleInstanceRef;
use crate::module::{
    create_module_instance, run_wasm_constructors, HostEnv, LinkError, ModuleState,
};

/// Handle meaning "resolve against the main module and the intrinsics".
pub const MAIN_MODULE_DYNLINK_HANDLE: u32 = 1;

/// Pages of linear memory reserved for each dynamic module (stack + data +
/// heap).
pub const DYNAMIC_MODULE_MEMORY_PAGES: u32 = 66;

/// Stack carved out of the bottom of each dynamic module's region.
pub const DYNAMIC_MODULE_STACK_SIZE: u32 = 2 * 1024 * 1024;

/// Bookkeeping for one loaded shared module. The memory region invariant is
/// `memory_bottom < stack_top <= data_bottom <= data_top <= heap_bottom <=
/// memory_top`, with the table slice disjoint from every other module's.
#[derive(Clone, Default)]
pub struct LoadedDynamicModule {
    pub path: String,

    pub memory_bottom: u32,
    pub memory_top: u32,

    pub stack_top: u32,
    pub stack_pointer: u32,
    pub stack_size: u32,

    pub data_bottom: u32,
    pub data_top: u32,
    pub heap_bottom: u32,

    pub table_bottom: u32,
    pub table_top: u32,

    pub instance: Option<Instance>,
}

impl LoadedDynamicModule {
    pub fn validate(&self) -> bool {
        self.memory_bottom < self.stack_top
            && self.stack_top <= self.data_bottom
            && self.data_bottom <= self.data_top
            && self.data_top <= self.heap_bottom
            && self.heap_bottom <= self.memory_top
            && self.table_bottom <= self.table_top
    }

    pub(crate) fn log_layout(&self) {
        debug!(
            path = self.path.as_str(),
            memory = %format_args!("{:#x}-{:#x}", self.memory_bottom, self.memory_top),
            stack_pointer = self.stack_pointer,
            data = %format_args!("{:#x}-{:#x}", self.data_bottom, self.data_top),
            table = %format_args!("{}-{}", self.table_bottom, self.table_top),
            "loaded dynamic module"
        );
    }
}

impl std::fmt::Debug for LoadedDynamicModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedDynamicModule")
            .field("path", &self.path)
            .field("memory_bottom", &self.memory_bottom)
            .field("memory_top", &self.memory_top)
            .field("stack_top", &self.stack_top)
            .field("stack_pointer", &self.stack_pointer)
            .field("data_bottom", &self.data_bottom)
            .field("data_top", &self.data_top)
            .field("heap_bottom", &self.heap_bottom)
            .field("table_bottom", &self.table_bottom)
            .field("table_top", &self.table_top)
            .field("instantiated", &self.instance.is_some())
            .finish()
    }
}

/// Loads the shared module at `path`, returning its handle. Returns `0`
/// (the `dlopen` error value) when the path is missing or names a
/// directory; real link failures surface as errors.
pub(crate) fn dynamic_load_impl(
    state_arc: &Arc<Mutex<ModuleState>>,
    store: &mut impl AsStoreMut,
    func_env: &FunctionEnv<HostEnv>,
    path: &str,
) -> Result<u32, LinkError> {
    // The empty path is "link against the main module", no work needed.
    if path.is_empty() {
        debug!("dynamic linking main module");
        return Ok(MAIN_MODULE_DYNLINK_HANDLE);
    }

    if let Some(handle) = state_arc
        .lock()
        .unwrap()
        .dynamic_path_to_handle
        .get(path)
        .copied()
    {
        debug!(handle, path, "using cached dynamic module handle");
        return Ok(handle);
    }

    let fs_path = Path::new(path);
    if fs_path.is_dir() {
        error!(path, "dynamic linking a directory");
        return Ok(0);
    }
    if !fs_path.exists() {
        error!(path, "dynamic module does not exist");
        return Ok(0);
    }

    // Handles start at 2, otherwise dlopen-style callers read the first
    // handle as an error.
    let handle = {
        let mut state = state_arc.lock().unwrap();
        let handle = 2 + state.dynamic_modules.len() as u32;
        state
            .dynamic_path_to_handle
            .insert(path.to_string(), handle);
        state.last_loaded_dynamic_handle = handle;
        state.dynamic_modules.insert(
            handle,
            LoadedDynamicModule {
                path: path.to_string(),
                ..Default::default()
            },
        );
        handle
    };

    let name = format!("handle_{handle}");
    let instance = create_module_instance(state_arc, store, func_env, &name, path)?;

    run_wasm_constructors(store, &instance, false)?;

    debug!(path, handle, "loaded shared module");
    Ok(handle)
}

/// Resolves `name` against the module behind `handle` and returns a table
/// index callable from Wasm. Entries already in the GOT keep their index;
/// anything else is appended to the table and registered.
pub(crate) fn get_dynamic_func_impl(
    state_arc: &Arc<Mutex<ModuleState>>,
    store: &mut impl AsStoreMut,
    handle: u32,
    name: &str,
) -> Result<u32, LinkError> {
    let mut state = state_arc.lock().unwrap();
    let state = &mut *state;

    if let Some(index) = state.got.lookup_function(name) {
        debug!(name, index, "resolved dynamic function from GOT");
        return Ok(index);
    }

    let exported = if handle == MAIN_MODULE_DYNLINK_HANDLE {
        // Check env, then the main module, then WASI.
        let mut chain = Vec::new();
        if let Some(env) = state.env_instance.as_ref() {
            chain.push(ModuleInstanceRef::Env(env));
        }
        if let Some(main) = state.main_instance.as_ref() {
            chain.push(ModuleInstanceRef::Main(main));
        }
        if let Some(wasi) = state.wasi_instance.as_ref() {
            chain.push(ModuleInstanceRef::Wasi(wasi));
        }
        chain.iter().find_map(|instance| instance.get_export(name))
    } else {
        let module = state
            .dynamic_modules
            .get(&handle)
            .ok_or(LinkError::MissingDynamicModule(handle))?;
        module
            .instance
            .as_ref()
            .and_then(|instance| instance.exports.get_extern(name).cloned())
    };

    let Some(wasmer::Extern::Function(func)) = exported else {
        error!(name, handle, "unable to dynamically load function");
        return Err(LinkError::MissingDynamicFunction(name.to_string()));
    };

    let table = state.table.as_ref().ok_or(LinkError::IncompleteState)?;
    let index = table.append(store, func)?;
    state.got.register_function(name, index)?;

    debug!(name, index, "resolved dynamic function");
    Ok(index)
}
