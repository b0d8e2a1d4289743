//! The bound module: one `(user, function)` pair bound to an instantiated
//! Wasm universe.
//!
//! A [`WasmModule`] owns a compartment (the store every instance lives in)
//! plus the host-side state: linear memory and table managers, the GOT,
//! intrinsic instances and the dynamic module registry. Host state other
//! than the store sits behind `Arc<Mutex<..>>` so intrinsics called from
//! executing Wasm can reach back into it; the lock is never held across a
//! Wasm invocation.

pub mod dynlink;
pub mod execute;
pub(crate) mod resolver;
pub mod snapshot;
pub mod threads;

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::{Arc, Mutex};

use tracing::{debug, error};
use wasmer::{AsStoreMut, Function, FunctionEnv, Instance, InstantiationError, Store, Value};

use crate::config;
use crate::fs::EmulatedFilesystem;
use crate::got::{GlobalOffsetTable, GotError, GotPlacement};
use crate::instance::IntrinsicsInstance;
use crate::intrinsics;
use crate::ir::IrError;
use crate::ir_cache::IrCache;
use crate::memory::{MemoryManager, MemoryMapError, GUARD_REGION_PAGES, WASM_PAGE_SIZE};
use crate::message::Message;
use crate::omp::ThreadPool;
use crate::table::{TableError, TableManager};

use dynlink::{LoadedDynamicModule, DYNAMIC_MODULE_MEMORY_PAGES, DYNAMIC_MODULE_STACK_SIZE};
use execute::{invoke, InvokeOutcome};

/// Entrypoint the execution driver looks up when `func_ptr` is zero.
pub const ENTRY_FUNC_NAME: &str = "_start";
/// Linker-generated constructor hook, run right after instantiation.
pub const WASM_CTORS_FUNC_NAME: &str = "__wasm_call_ctors";
/// Optional pre-warm hook run at bind time.
pub const ZYGOTE_FUNC_NAME: &str = "_faasm_zygote";

/// Stack size platform modules are built with. The thread runner checks the
/// stack-pointer global against this before repointing it.
pub const STACK_SIZE: u32 = 4 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error(transparent)]
    Ir(#[from] IrError),

    #[error(transparent)]
    Got(#[from] GotError),

    #[error(transparent)]
    Table(#[from] TableError),

    #[error(transparent)]
    Memory(#[from] MemoryMapError),

    #[error("failed to instantiate module: {0}")]
    Instantiation(Box<InstantiationError>),

    #[error("missing import {namespace}.{name}")]
    MissingImport { namespace: String, name: String },

    #[error("resolved import {namespace}.{name} to {found}, but was expecting {expected}")]
    ImportTypeMismatch {
        namespace: String,
        name: String,
        found: String,
        expected: String,
    },

    #[error("memory offset not found in GOT: {namespace}.{name}")]
    MissingGotData { namespace: String, name: String },

    #[error("found immutable stack top")]
    ImmutableStackPointer,

    #[error("main module does not export {0}")]
    MissingMainExport(&'static str),

    #[error("invalid dynamic module layout for {path}")]
    InvalidDynamicModuleLayout { path: String },

    #[error("no dynamic modules loaded")]
    NoDynamicModules,

    #[error("no dynamic module registered for handle {0}")]
    MissingDynamicModule(u32),

    #[error("unable to dynamically load function {0}")]
    MissingDynamicFunction(String),

    #[error("{func} failed with return code {code}")]
    ConstructorFailed { func: &'static str, code: i32 },

    #[error("{func} did not run to completion: {reason}")]
    ConstructorTrapped { func: &'static str, reason: String },

    #[error("module host state is incomplete")]
    IncompleteState,
}

impl From<InstantiationError> for LinkError {
    fn from(err: InstantiationError) -> Self {
        Self::Instantiation(Box::new(err))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error("cannot bind a module twice")]
    AlreadyBound,

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("zygote failed with return code {code}")]
    ZygoteFailed { code: i32 },

    #[error("zygote did not run to completion: {reason}")]
    ZygoteTrapped { reason: String },

    #[error("wasm memory layout not as expected (__heap_base={heap_base}, __data_end={data_end})")]
    BadMemoryLayout { heap_base: i32, data_end: i32 },
}

/// Data reachable from intrinsics while guest code is running.
#[derive(Clone)]
pub struct HostEnv {
    pub(crate) state: Arc<Mutex<ModuleState>>,
}

/// The store every instance of one bound module lives in. Dropping it
/// releases all instances, memories and tables at once.
pub(crate) struct Compartment {
    pub store: Store,
}

/// Host-side state of a bound module, shared with intrinsics.
#[derive(Default)]
pub(crate) struct ModuleState {
    pub user: String,
    pub function: String,

    pub memory: Option<MemoryManager>,
    pub table: Option<TableManager>,
    pub got: GlobalOffsetTable,

    pub env_instance: Option<IntrinsicsInstance>,
    pub wasi_instance: Option<IntrinsicsInstance>,
    pub main_instance: Option<Instance>,

    pub dynamic_modules: BTreeMap<u32, LoadedDynamicModule>,
    pub dynamic_path_to_handle: HashMap<String, u32>,
    pub last_loaded_dynamic_handle: u32,

    /// File-backed regions created through `map_file`, keyed by origin path.
    pub shared_wasm_ptrs: HashMap<String, u32>,

    pub filesystem: EmulatedFilesystem,
    pub wasm_environment: Vec<(String, String)>,
    pub argv: Vec<String>,

    pub memory_fd: i32,
    pub memory_fd_size: u64,

    pub capture_stdout: bool,
    pub stdout_mem_fd: i32,
    pub stdout_size: u64,

    pub omp_pool: Option<ThreadPool>,
}

impl ModuleState {
    pub fn environment_strings(&self) -> Vec<String> {
        self.wasm_environment
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect()
    }

    /// Appends to the captured-stdout memfd, creating it on first use.
    pub fn capture_stdout_bytes(&mut self, bytes: &[u8]) -> io::Result<usize> {
        if self.stdout_mem_fd <= 0 {
            let fd = unsafe { libc::memfd_create(b"wasmcell_stdout\0".as_ptr().cast(), 0) };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            self.stdout_mem_fd = fd;
        }

        let written = unsafe {
            libc::write(
                self.stdout_mem_fd,
                bytes.as_ptr().cast(),
                bytes.len(),
            )
        };
        if written < 0 {
            return Err(io::Error::last_os_error());
        }

        self.stdout_size += written as u64;
        Ok(written as usize)
    }
}

/// A `(user, function)` pair bound to an instantiated module tree.
pub struct WasmModule {
    compartment: Option<Compartment>,
    func_env: Option<FunctionEnv<HostEnv>>,
    state: Arc<Mutex<ModuleState>>,
    is_bound: bool,
}

impl Default for WasmModule {
    fn default() -> Self {
        Self::new()
    }
}

impl WasmModule {
    pub fn new() -> Self {
        Self {
            compartment: None,
            func_env: None,
            state: Arc::new(Mutex::new(ModuleState::default())),
            is_bound: false,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.is_bound
    }

    pub fn bound_user(&self) -> String {
        self.state.lock().unwrap().user.clone()
    }

    pub fn bound_function(&self) -> String {
        self.state.lock().unwrap().function.clone()
    }

    /// Binds to the message's `(user, function)`, running constructors and
    /// the zygote hook.
    pub fn bind_to_function(&mut self, msg: &Message) -> Result<(), BindError> {
        self.do_bind(msg, true)
    }

    /// Binds without executing the zygote hook.
    pub fn bind_to_function_no_zygote(&mut self, msg: &Message) -> Result<(), BindError> {
        self.do_bind(msg, false)
    }

    // The order things happen in here is load-bearing: the zygote may run
    // non-trivial code, so memory, the filesystem and the constructors all
    // have to be in place before it.
    fn do_bind(&mut self, msg: &Message, execute_zygote: bool) -> Result<(), BindError> {
        if self.is_bound {
            return Err(BindError::AlreadyBound);
        }
        self.is_bound = true;

        {
            let mut state = self.state.lock().unwrap();
            state.user = msg.user.clone();
            state.function = msg.function.clone();
            state.capture_stdout = config::global().capture_stdout;
        }

        let mut store = Store::new(IrCache::global().engine().clone());
        let func_env = FunctionEnv::new(
            &mut store,
            HostEnv {
                state: Arc::clone(&self.state),
            },
        );

        let instance =
            create_module_instance(&self.state, &mut store, &func_env, &msg.func_str(), "")?;

        self.state.lock().unwrap().filesystem.prepare();

        // The ctors hook is how the linker sets the environment up (e.g.
        // preopened file descriptors); a main module without one is broken.
        run_wasm_constructors(&mut store, &instance, true)?;

        if execute_zygote {
            execute_zygote_function(&mut store, &instance)?;
        }

        // If the stack was not placed at the bottom of memory these two
        // diverge, and every later layout assumption is off.
        let heap_base = read_global_i32(&mut store, &instance, "__heap_base");
        let data_end = read_global_i32(&mut store, &instance, "__data_end");
        if heap_base > 0 && data_end > 0 && heap_base != data_end {
            error!(
                heap_base,
                data_end, "appears stack is not at the bottom of linear memory"
            );
            return Err(BindError::BadMemoryLayout {
                heap_base,
                data_end,
            });
        }

        {
            let state = self.state.lock().unwrap();
            let pages = state
                .memory
                .as_ref()
                .map(|memory| memory.size_pages(&store))
                .unwrap_or(0);
            let table_size = state
                .table
                .as_ref()
                .map(|table| table.size(&store))
                .unwrap_or(0);
            debug!(
                func = %msg.func_str(),
                initial_pages = pages,
                initial_table = table_size,
                "bound module"
            );
        }

        self.compartment = Some(Compartment { store });
        self.func_env = Some(func_env);

        Ok(())
    }

    /// Releases everything the bind built up. Idempotent; afterwards the
    /// record is inert. Returns whether the compartment was actually
    /// collected (informational).
    pub fn tear_down(&mut self) -> bool {
        {
            let mut state = self.state.lock().unwrap();

            state.shared_wasm_ptrs.clear();
            state.got.clear();

            state.dynamic_path_to_handle.clear();
            for module in state.dynamic_modules.values_mut() {
                module.instance = None;
            }
            state.dynamic_modules.clear();
            state.last_loaded_dynamic_handle = 0;

            state.memory = None;
            state.table = None;
            state.main_instance = None;
            state.env_instance = None;
            state.wasi_instance = None;
            state.omp_pool = None;

            if state.stdout_mem_fd > 0 {
                unsafe { libc::close(state.stdout_mem_fd) };
            }
            state.stdout_mem_fd = 0;
            state.stdout_size = 0;
        }

        self.func_env = None;

        match self.compartment.take() {
            Some(compartment) => {
                drop(compartment);
                debug!("collected compartment");
                true
            }
            None => true,
        }
    }

    /// Loads a shared module, `dlopen`-style. See [`dynlink`] for handle
    /// conventions.
    pub fn dynamic_load(&mut self, path: &str) -> Result<u32, LinkError> {
        let func_env = self.func_env.clone().ok_or(LinkError::IncompleteState)?;
        let compartment = self.compartment.as_mut().ok_or(LinkError::IncompleteState)?;
        dynlink::dynamic_load_impl(&self.state, &mut compartment.store, &func_env, path)
    }

    /// Resolves a function exported by a loaded module into a table index.
    pub fn get_dynamic_func(&mut self, handle: u32, name: &str) -> Result<u32, LinkError> {
        let compartment = self.compartment.as_mut().ok_or(LinkError::IncompleteState)?;
        dynlink::get_dynamic_func_impl(&self.state, &mut compartment.store, handle, name)
    }

    pub fn dynamic_module_count(&self) -> usize {
        self.state.lock().unwrap().dynamic_modules.len()
    }

    pub fn last_loaded_dynamic_handle(&self) -> u32 {
        self.state.lock().unwrap().last_loaded_dynamic_handle
    }

    /// A copy of the bookkeeping record for a loaded module.
    pub fn dynamic_module_record(&self, handle: u32) -> Option<LoadedDynamicModule> {
        self.state
            .lock()
            .unwrap()
            .dynamic_modules
            .get(&handle)
            .cloned()
    }

    /// Data region start the next `__memory_base` import resolves to.
    pub fn next_memory_base(&self) -> Result<u32, LinkError> {
        self.with_last_loaded(|module| module.data_bottom)
    }

    pub fn next_stack_pointer(&self) -> Result<u32, LinkError> {
        self.with_last_loaded(|module| module.stack_pointer)
    }

    pub fn next_table_base(&self) -> Result<u32, LinkError> {
        self.with_last_loaded(|module| module.table_bottom)
    }

    fn with_last_loaded<R>(
        &self,
        f: impl FnOnce(&LoadedDynamicModule) -> R,
    ) -> Result<R, LinkError> {
        let state = self.state.lock().unwrap();
        if state.last_loaded_dynamic_handle == 0 {
            return Err(LinkError::NoDynamicModules);
        }
        state
            .dynamic_modules
            .get(&state.last_loaded_dynamic_handle)
            .map(f)
            .ok_or(LinkError::MissingDynamicModule(
                state.last_loaded_dynamic_handle,
            ))
    }

    pub fn function_offset_from_got(&self, name: &str) -> Option<u32> {
        self.state.lock().unwrap().got.lookup_function(name)
    }

    pub fn data_offset_from_got(&self, name: &str) -> Option<i32> {
        self.state
            .lock()
            .unwrap()
            .got
            .lookup_data(name)
            .map(|entry| entry.offset)
    }

    /// Value of an exported i32 global on the main instance, or -1 when the
    /// export is absent.
    pub fn get_global_i32(&mut self, name: &str) -> i32 {
        let Some(compartment) = self.compartment.as_mut() else {
            return -1;
        };
        let state = self.state.lock().unwrap();
        let Some(instance) = state.main_instance.clone() else {
            return -1;
        };
        drop(state);
        read_global_i32(&mut compartment.store, &instance, name)
    }

    /// Bytes the guest wrote to stdout while capture was enabled.
    pub fn read_captured_stdout(&self) -> io::Result<Vec<u8>> {
        let state = self.state.lock().unwrap();
        if state.stdout_mem_fd <= 0 || state.stdout_size == 0 {
            return Ok(Vec::new());
        }

        let mut buf = vec![0u8; state.stdout_size as usize];
        let read = unsafe {
            libc::pread(
                state.stdout_mem_fd,
                buf.as_mut_ptr().cast(),
                buf.len(),
                0,
            )
        };
        if read < 0 {
            return Err(io::Error::last_os_error());
        }
        buf.truncate(read as usize);
        Ok(buf)
    }

    pub fn set_environment_variable(&mut self, key: &str, value: &str) {
        self.state
            .lock()
            .unwrap()
            .wasm_environment
            .push((key.to_string(), value.to_string()));
    }

    /// Grows linear memory by whole pages; returns the new region's Wasm
    /// address.
    pub fn map_pages(&mut self, pages: u32) -> Result<u32, LinkError> {
        self.with_memory(|memory, store| memory.map_pages(store, pages))
    }

    /// Byte-count variant of [`WasmModule::map_pages`].
    pub fn map_bytes(&mut self, n_bytes: u32) -> Result<u32, LinkError> {
        self.with_memory(|memory, store| memory.map_bytes(store, n_bytes))
    }

    /// Maps `length` bytes of `fd` into the Wasm address space read-only and
    /// shared, recording the region under `path` for later lookups.
    pub fn map_file(&mut self, path: &str, fd: i32, length: u32) -> Result<u32, LinkError> {
        let wasm_ptr = self.with_memory(|memory, store| memory.map_file(store, fd, length))?;
        self.state
            .lock()
            .unwrap()
            .shared_wasm_ptrs
            .insert(path.to_string(), wasm_ptr);
        Ok(wasm_ptr)
    }

    /// Wasm address a path was previously mapped at, if any.
    pub fn shared_pointer(&self, path: &str) -> Option<u32> {
        self.state.lock().unwrap().shared_wasm_ptrs.get(path).copied()
    }

    /// Installs a guard region and returns its Wasm address.
    pub fn install_guard_region(&mut self) -> Result<u32, LinkError> {
        self.with_memory(|memory, store| memory.install_guard(store, GUARD_REGION_PAGES))
    }

    /// Translates a Wasm pointer to a host pointer, bounds-checked.
    pub fn native_pointer(&mut self, wasm_ptr: u32, len: u32) -> Result<*mut u8, LinkError> {
        let compartment = self.compartment.as_mut().ok_or(LinkError::IncompleteState)?;
        let state = self.state.lock().unwrap();
        let memory = state.memory.as_ref().ok_or(LinkError::IncompleteState)?;
        Ok(memory.native_ptr(&compartment.store, wasm_ptr, len)?)
    }

    /// Copies `len` bytes out of linear memory.
    pub fn read_memory(&mut self, wasm_ptr: u32, len: u32) -> Result<Vec<u8>, LinkError> {
        let compartment = self.compartment.as_ref().ok_or(LinkError::IncompleteState)?;
        let state = self.state.lock().unwrap();
        let memory = state.memory.as_ref().ok_or(LinkError::IncompleteState)?;

        let mut buf = vec![0u8; len as usize];
        memory
            .memory()
            .view(&compartment.store)
            .read(wasm_ptr as u64, &mut buf)
            .map_err(MemoryMapError::from)
            .map_err(LinkError::Memory)?;
        Ok(buf)
    }

    /// Copies `data` into linear memory at `wasm_ptr`.
    pub fn write_memory(&mut self, wasm_ptr: u32, data: &[u8]) -> Result<(), LinkError> {
        let compartment = self.compartment.as_ref().ok_or(LinkError::IncompleteState)?;
        let state = self.state.lock().unwrap();
        let memory = state.memory.as_ref().ok_or(LinkError::IncompleteState)?;

        memory
            .memory()
            .view(&compartment.store)
            .write(wasm_ptr as u64, data)
            .map_err(MemoryMapError::from)
            .map_err(LinkError::Memory)?;
        Ok(())
    }

    pub fn memory_size_pages(&self) -> u32 {
        let Some(compartment) = self.compartment.as_ref() else {
            return 0;
        };
        let state = self.state.lock().unwrap();
        state
            .memory
            .as_ref()
            .map(|memory| memory.size_pages(&compartment.store))
            .unwrap_or(0)
    }

    pub fn table_size(&self) -> u32 {
        let Some(compartment) = self.compartment.as_ref() else {
            return 0;
        };
        let state = self.state.lock().unwrap();
        state
            .table
            .as_ref()
            .map(|table| table.size(&compartment.store))
            .unwrap_or(0)
    }

    fn with_memory<R>(
        &mut self,
        f: impl FnOnce(&mut MemoryManager, &mut Store) -> Result<R, MemoryMapError>,
    ) -> Result<R, LinkError> {
        let compartment = self.compartment.as_mut().ok_or(LinkError::IncompleteState)?;
        let mut state = self.state.lock().unwrap();
        let memory = state.memory.as_mut().ok_or(LinkError::IncompleteState)?;
        Ok(f(memory, &mut compartment.store)?)
    }
}

impl Drop for WasmModule {
    fn drop(&mut self) {
        self.tear_down();
    }
}

/// Creates an instance for the main module (`shared_path` empty) or a
/// dynamically loaded one, wiring memory, table and GOT on the way.
pub(crate) fn create_module_instance(
    state_arc: &Arc<Mutex<ModuleState>>,
    store: &mut impl AsStoreMut,
    func_env: &FunctionEnv<HostEnv>,
    name: &str,
    shared_path: &str,
) -> Result<Instance, LinkError> {
    let is_main = shared_path.is_empty();
    let (user, function) = {
        let state = state_arc.lock().unwrap();
        (state.user.clone(), state.function.clone())
    };

    // Stick to the shared cache entry; modules must never be re-parsed per
    // instance.
    let cached = IrCache::global().get_module(&user, &function, shared_path)?;

    let mut dynamic_handle = None;

    if is_main {
        let env_instance = intrinsics::instantiate_env(store, func_env);
        let wasi_instance = intrinsics::instantiate_wasi(store, func_env);

        let mut state = state_arc.lock().unwrap();
        state.env_instance = Some(env_instance);
        state.wasi_instance = Some(wasi_instance);

        // The first global is the stack top; a module with an immutable one
        // was not built for this platform.
        if cached.ir.first_global_mutable == Some(false) {
            return Err(LinkError::ImmutableStackPointer);
        }

        state
            .got
            .populate_from_ir(&cached.ir, GotPlacement::MainModule)?;
    } else {
        // A dynamic module needs the same resources as a main module, carved
        // out of the shared memory and table by hand.
        let mut state = state_arc.lock().unwrap();
        let state = &mut *state;

        let handle = *state
            .dynamic_path_to_handle
            .get(shared_path)
            .ok_or(LinkError::IncompleteState)?;
        dynamic_handle = Some(handle);

        let table = state.table.as_ref().ok_or(LinkError::IncompleteState)?;
        let old_table_elems = table.size(store);
        if cached.ir.table_elem_count > 0 {
            table.reserve(store, cached.ir.table_elem_count)?;
        }
        let new_table_elems = table.size(store);

        let memory = state.memory.as_mut().ok_or(LinkError::IncompleteState)?;
        memory.install_guard(store, GUARD_REGION_PAGES)?;
        let memory_bottom = memory.map_pages(store, DYNAMIC_MODULE_MEMORY_PAGES)?;
        memory.install_guard(store, GUARD_REGION_PAGES)?;

        let module = state
            .dynamic_modules
            .get_mut(&handle)
            .ok_or(LinkError::MissingDynamicModule(handle))?;

        module.memory_bottom = memory_bottom;
        module.memory_top =
            memory_bottom + DYNAMIC_MODULE_MEMORY_PAGES * WASM_PAGE_SIZE as u32;

        module.stack_size = DYNAMIC_MODULE_STACK_SIZE;
        module.stack_top = module.memory_bottom + module.stack_size;
        module.stack_pointer = module.stack_top - 1;

        module.data_bottom = module.stack_top;
        module.data_top = module.data_bottom + cached.ir.data_size;
        module.heap_bottom = module.data_top;

        module.table_bottom = old_table_elems;
        module.table_top = new_table_elems;

        let placement = GotPlacement::DynamicModule {
            table_bottom: old_table_elems,
            data_bottom: module.data_bottom as i32,
        };
        state.got.populate_from_ir(&cached.ir, placement)?;
    }

    let imports = resolver::build_imports(state_arc, store, &cached.module, is_main)?;

    debug!(%user, %function, name, path = shared_path, "instantiating module");
    let instance = Instance::new(store, &cached.module, &imports)?;

    if is_main {
        let memory = instance
            .exports
            .get_memory("memory")
            .map_err(|_| LinkError::MissingMainExport("memory"))?
            .clone();
        let table = instance
            .exports
            .get_table("__indirect_function_table")
            .map_err(|_| LinkError::MissingMainExport("__indirect_function_table"))?
            .clone();

        let mut state = state_arc.lock().unwrap();
        state.memory = Some(MemoryManager::new(
            memory,
            config::global().memory_quota_pages,
        ));
        state.table = Some(TableManager::new(table));
        state.main_instance = Some(instance.clone());
    }

    // Entries referenced before this module existed may be exported by it;
    // fill the reserved slots now. Anything left is fatal.
    {
        let mut state = state_arc.lock().unwrap();
        let state = &mut *state;
        let table = state.table.as_ref().ok_or(LinkError::IncompleteState)?;
        state.got.drain_missing_against(store, &instance, table)?;
    }

    if let Some(handle) = dynamic_handle {
        let mut state = state_arc.lock().unwrap();
        let module = state
            .dynamic_modules
            .get_mut(&handle)
            .ok_or(LinkError::MissingDynamicModule(handle))?;
        module.instance = Some(instance.clone());

        if !module.validate() {
            error!(path = shared_path, ?module, "invalid dynamic module");
            return Err(LinkError::InvalidDynamicModuleLayout {
                path: shared_path.to_string(),
            });
        }
        module.log_layout();
    }

    Ok(instance)
}

/// Runs `__wasm_call_ctors` on an instance. Main modules must have one;
/// dynamic modules run it only if present.
pub(crate) fn run_wasm_constructors(
    store: &mut impl AsStoreMut,
    instance: &Instance,
    required: bool,
) -> Result<(), LinkError> {
    let func = match instance.exports.get_function(WASM_CTORS_FUNC_NAME) {
        Ok(func) => func.clone(),
        Err(_) if required => {
            error!("did not find {WASM_CTORS_FUNC_NAME} export");
            return Err(LinkError::MissingMainExport(WASM_CTORS_FUNC_NAME));
        }
        Err(_) => return Ok(()),
    };

    match invoke(store, &func, &[]) {
        InvokeOutcome::Returned(0) | InvokeOutcome::Exited(0) => {
            debug!("successfully executed {WASM_CTORS_FUNC_NAME}");
            Ok(())
        }
        InvokeOutcome::Returned(code) | InvokeOutcome::Exited(code) => {
            error!(code, "{WASM_CTORS_FUNC_NAME} failed");
            Err(LinkError::ConstructorFailed {
                func: WASM_CTORS_FUNC_NAME,
                code,
            })
        }
        InvokeOutcome::Trapped(reason) => Err(LinkError::ConstructorTrapped {
            func: WASM_CTORS_FUNC_NAME,
            reason,
        }),
    }
}

fn execute_zygote_function(
    store: &mut impl AsStoreMut,
    instance: &Instance,
) -> Result<(), BindError> {
    let Ok(zygote) = instance.exports.get_function(ZYGOTE_FUNC_NAME) else {
        return Ok(());
    };
    let zygote = zygote.clone();

    match invoke(store, &zygote, &[]) {
        InvokeOutcome::Returned(0) | InvokeOutcome::Exited(0) => {
            debug!("successfully executed zygote");
            Ok(())
        }
        InvokeOutcome::Returned(code) | InvokeOutcome::Exited(code) => {
            error!(code, "zygote failed");
            Err(BindError::ZygoteFailed { code })
        }
        InvokeOutcome::Trapped(reason) => Err(BindError::ZygoteTrapped { reason }),
    }
}

/// Value of an exported i32 global, or -1 when missing (matching the
/// host-call convention for absent globals).
pub(crate) fn read_global_i32(
    store: &mut impl AsStoreMut,
    instance: &Instance,
    name: &str,
) -> i32 {
    match instance.exports.get_global(name) {
        Ok(global) => match global.get(store) {
            Value::I32(value) => value,
            _ => -1,
        },
        Err(_) => -1,
    }
}

/// Strict/lenient export lookup, mirroring the host's function helpers.
pub(crate) fn get_export_function(instance: &Instance, name: &str) -> Option<Function> {
    instance.exports.get_function(name).ok().cloned()
}
