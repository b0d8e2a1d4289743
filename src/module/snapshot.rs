//! Snapshotting, restoring and zygote-style cloning.
//!
//! A snapshot is the linear-memory image framed as a host-endian `u64`
//! page count followed by the raw bytes. Cloning rebuilds the source's
//! module tree in a fresh compartment (same modules, same GOT, same
//! dynamic-load layout), then either byte-copies the source memory or maps
//! it copy-on-write from its backing fd.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

use tracing::debug;
use wasmer::{Extern, FunctionEnv, Instance, RuntimeError, Store, Value};

use crate::instance::ModuleInstanceRef;
use crate::ir::IrError;
use crate::ir_cache::IrCache;
use crate::memory::{GuardRegion, MemoryManager, MemoryMapError, WASM_PAGE_SIZE};
use crate::module::{resolver, LinkError};
use crate::table::TableError;

use super::dynlink::LoadedDynamicModule;
use super::{create_module_instance, Compartment, HostEnv, ModuleState, WasmModule};

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("module must be bound before snapshotting")]
    NotBound,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Memory(#[from] MemoryMapError),
}

#[derive(Debug, thiserror::Error)]
pub enum CloneError {
    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Ir(#[from] IrError),

    #[error(transparent)]
    Memory(#[from] MemoryMapError),

    #[error(transparent)]
    Table(#[from] TableError),

    #[error("source module host state is incomplete")]
    IncompleteState,

    #[error("GOT entry {0} has no exporter in the cloned compartment")]
    GotFixup(String),

    #[error("failed to restore global {name}: {source}")]
    GlobalRestore { name: String, source: RuntimeError },

    #[error("failed to remap memory from fd {fd}: {source}")]
    MemoryFdMap { fd: i32, source: io::Error },
}

impl WasmModule {
    /// Serialises linear memory: `u64` page count, then the raw bytes.
    /// Guard regions are written as zeroes.
    pub fn snapshot<W: Write>(&mut self, writer: &mut W) -> Result<(), SnapshotError> {
        let compartment = self.compartment.as_ref().ok_or(SnapshotError::NotBound)?;
        let state = self.state.lock().unwrap();
        let memory = state.memory.as_ref().ok_or(SnapshotError::NotBound)?;

        let num_pages = memory.size_pages(&compartment.store) as u64;
        let bytes = memory.read_nonguard(&compartment.store)?;

        writer.write_all(&num_pages.to_ne_bytes())?;
        writer.write_all(&bytes)?;
        Ok(())
    }

    /// Reads a snapshot back: grows memory if the image is larger, then
    /// copies the bytes into place from address zero.
    pub fn restore<R: Read>(&mut self, reader: &mut R) -> Result<(), SnapshotError> {
        let mut count = [0u8; 8];
        reader.read_exact(&mut count)?;
        let num_pages = u64::from_ne_bytes(count);

        let mut bytes = vec![0u8; num_pages as usize * WASM_PAGE_SIZE];
        reader.read_exact(&mut bytes)?;

        let compartment = self.compartment.as_mut().ok_or(SnapshotError::NotBound)?;
        let mut state = self.state.lock().unwrap();
        let memory = state.memory.as_mut().ok_or(SnapshotError::NotBound)?;

        let current = memory.size_pages(&compartment.store) as u64;
        if num_pages > current {
            memory.map_pages(&mut compartment.store, (num_pages - current) as u32)?;
        }

        memory.write_nonguard(&compartment.store, &bytes)?;
        Ok(())
    }

    /// Dumps linear memory into `fd` and records it as this module's
    /// snapshot backing; clones map it copy-on-write instead of copying
    /// bytes.
    pub fn write_memory_to_fd(&mut self, fd: i32) -> Result<(), SnapshotError> {
        let compartment = self.compartment.as_ref().ok_or(SnapshotError::NotBound)?;
        let mut state = self.state.lock().unwrap();

        debug!(
            user = state.user.as_str(),
            function = state.function.as_str(),
            fd,
            "writing memory to fd"
        );

        let memory = state.memory.as_ref().ok_or(SnapshotError::NotBound)?;
        let bytes = memory.read_nonguard(&compartment.store)?;

        if unsafe { libc::ftruncate(fd, bytes.len() as libc::off_t) } != 0 {
            return Err(io::Error::last_os_error().into());
        }

        let mut offset = 0usize;
        while offset < bytes.len() {
            let written = unsafe {
                libc::pwrite(
                    fd,
                    bytes[offset..].as_ptr().cast(),
                    bytes.len() - offset,
                    offset as libc::off_t,
                )
            };
            if written < 0 {
                return Err(io::Error::last_os_error().into());
            }
            offset += written as usize;
        }

        state.memory_fd = fd;
        state.memory_fd_size = bytes.len() as u64;
        Ok(())
    }

    /// Creates an anonymous memfd and dumps linear memory into it. Returns
    /// the fd, which stays owned by this module (and its clones).
    pub fn create_memory_fd(&mut self) -> Result<i32, SnapshotError> {
        let fd = unsafe { libc::memfd_create(b"wasmcell_memory\0".as_ptr().cast(), 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        self.write_memory_to_fd(fd)?;
        Ok(fd)
    }

    /// Structural clone for zygote-style spawning: a fresh compartment with
    /// the same module tree, GOT and dynamic layout, and an independent
    /// copy of linear memory (or a copy-on-write map of `memory_fd` when
    /// one is set). Captured stdout state is never carried over.
    pub fn try_clone(&mut self) -> Result<Self, CloneError> {
        if !self.is_bound || self.compartment.is_none() {
            return Ok(WasmModule::new());
        }

        let snapshot = self.capture_clone_source()?;
        build_clone(snapshot)
    }

    fn capture_clone_source(&mut self) -> Result<CloneSource, CloneError> {
        let compartment = self
            .compartment
            .as_mut()
            .ok_or(CloneError::IncompleteState)?;
        let store = &mut compartment.store;
        let state = self.state.lock().unwrap();

        let memory = state.memory.as_ref().ok_or(CloneError::IncompleteState)?;
        let table = state.table.as_ref().ok_or(CloneError::IncompleteState)?;

        let memory_bytes = if state.memory_fd > 0 {
            None
        } else {
            Some(memory.read_nonguard(&*store)?)
        };

        // Mutable exported globals carry zygote-initialised state the
        // memory image does not cover.
        let mut global_values: Vec<(Option<u32>, String, Value)> = Vec::new();
        if let Some(main) = state.main_instance.clone() {
            collect_mutable_globals(store, &main, None, &mut global_values);
        }
        for (handle, module) in &state.dynamic_modules {
            if let Some(instance) = module.instance.clone() {
                collect_mutable_globals(store, &instance, Some(*handle), &mut global_values);
            }
        }

        let dynamic_records = state
            .dynamic_modules
            .iter()
            .map(|(handle, module)| {
                (
                    *handle,
                    LoadedDynamicModule {
                        instance: None,
                        ..module.clone()
                    },
                )
            })
            .collect();

        Ok(CloneSource {
            user: state.user.clone(),
            function: state.function.clone(),
            got: state.got.clone(),
            dynamic_records,
            dynamic_path_to_handle: state.dynamic_path_to_handle.clone(),
            last_loaded_dynamic_handle: state.last_loaded_dynamic_handle,
            shared_wasm_ptrs: state.shared_wasm_ptrs.clone(),
            wasm_environment: state.wasm_environment.clone(),
            argv: state.argv.clone(),
            filesystem: state.filesystem.clone(),
            memory_fd: state.memory_fd,
            memory_fd_size: state.memory_fd_size,
            capture_stdout: state.capture_stdout,
            guard_regions: memory.guard_regions().to_vec(),
            memory_pages: memory.size_pages(&*store),
            table_size: table.size(&*store),
            memory_bytes,
            global_values,
        })
    }
}

struct CloneSource {
    user: String,
    function: String,
    got: crate::got::GlobalOffsetTable,
    dynamic_records: Vec<(u32, LoadedDynamicModule)>,
    dynamic_path_to_handle: std::collections::HashMap<String, u32>,
    last_loaded_dynamic_handle: u32,
    shared_wasm_ptrs: std::collections::HashMap<String, u32>,
    wasm_environment: Vec<(String, String)>,
    argv: Vec<String>,
    filesystem: crate::fs::EmulatedFilesystem,
    memory_fd: i32,
    memory_fd_size: u64,
    capture_stdout: bool,
    guard_regions: Vec<GuardRegion>,
    memory_pages: u32,
    table_size: u32,
    memory_bytes: Option<Vec<u8>>,
    global_values: Vec<(Option<u32>, String, Value)>,
}

fn build_clone(source: CloneSource) -> Result<WasmModule, CloneError> {
    let state_arc = Arc::new(Mutex::new(ModuleState::default()));
    {
        let mut state = state_arc.lock().unwrap();
        state.user = source.user.clone();
        state.function = source.function.clone();
        state.got = source.got.clone();
        state.dynamic_path_to_handle = source.dynamic_path_to_handle.clone();
        state.last_loaded_dynamic_handle = source.last_loaded_dynamic_handle;
        state.shared_wasm_ptrs = source.shared_wasm_ptrs.clone();
        state.wasm_environment = source.wasm_environment.clone();
        state.argv = source.argv.clone();
        state.filesystem = source.filesystem.clone();
        state.memory_fd = source.memory_fd;
        state.memory_fd_size = source.memory_fd_size;
        state.capture_stdout = source.capture_stdout;
        // Stdout capture is deliberately not carried over.
        for (handle, record) in &source.dynamic_records {
            state.dynamic_modules.insert(*handle, record.clone());
        }
    }

    let mut store = Store::new(IrCache::global().engine().clone());
    let func_env = FunctionEnv::new(
        &mut store,
        HostEnv {
            state: Arc::clone(&state_arc),
        },
    );

    // Re-create the main instance. The copied GOT already holds every
    // entry, so the rebuild is a no-op re-registration at the same indices.
    let main_name = format!("{}/{}", source.user, source.function);
    let main_instance =
        create_module_instance(&state_arc, &mut store, &func_env, &main_name, "")?;

    // Replay dynamic instantiations in handle order against the recorded
    // layout: no fresh carving, the records already say where everything
    // goes.
    for (handle, record) in &source.dynamic_records {
        {
            let mut state = state_arc.lock().unwrap();
            let state = &mut *state;
            state.last_loaded_dynamic_handle = *handle;

            let table = state.table.as_ref().ok_or(CloneError::IncompleteState)?;
            let current = table.size(&store);
            if record.table_top > current {
                table.reserve(&mut store, record.table_top - current)?;
            }

            let memory = state.memory.as_mut().ok_or(CloneError::IncompleteState)?;
            let target_pages = record.memory_top / WASM_PAGE_SIZE as u32
                + crate::memory::GUARD_REGION_PAGES;
            memory.ensure_pages(&mut store, target_pages)?;
        }

        let cached = IrCache::global().get_module(&source.user, &source.function, &record.path)?;
        let imports = resolver::build_imports(&state_arc, &mut store, &cached.module, false)?;
        let instance =
            Instance::new(&mut store, &cached.module, &imports).map_err(LinkError::from)?;

        let mut state = state_arc.lock().unwrap();
        state
            .dynamic_modules
            .get_mut(handle)
            .ok_or(CloneError::IncompleteState)?
            .instance = Some(instance);
    }

    {
        let mut state = state_arc.lock().unwrap();
        state.last_loaded_dynamic_handle = source.last_loaded_dynamic_handle;
    }

    // Match the source's table and memory sizes exactly (slots appended at
    // runtime, thread stacks, file maps).
    {
        let mut state = state_arc.lock().unwrap();
        let state = &mut *state;

        let table = state.table.as_ref().ok_or(CloneError::IncompleteState)?;
        let current = table.size(&store);
        if source.table_size > current {
            table.reserve(&mut store, source.table_size - current)?;
        }

        let memory = state.memory.as_mut().ok_or(CloneError::IncompleteState)?;
        memory.ensure_pages(&mut store, source.memory_pages)?;
        memory.set_guard_regions(source.guard_regions.clone());
    }

    // Rewrite every GOT function entry into its recorded table slot. The
    // source table accumulated entries through instantiation, scans and
    // placeholder drains; the GOT is the ledger of all of them.
    {
        let state = state_arc.lock().unwrap();
        let table = state.table.as_ref().ok_or(CloneError::IncompleteState)?;

        let mut chain: Vec<ModuleInstanceRef<'_>> = Vec::new();
        if let Some(env) = state.env_instance.as_ref() {
            chain.push(ModuleInstanceRef::Env(env));
        }
        chain.push(ModuleInstanceRef::Main(&main_instance));
        if let Some(wasi) = state.wasi_instance.as_ref() {
            chain.push(ModuleInstanceRef::Wasi(wasi));
        }
        for (handle, module) in &state.dynamic_modules {
            if let Some(instance) = module.instance.as_ref() {
                chain.push(ModuleInstanceRef::Dynamic {
                    handle: *handle,
                    instance,
                });
            }
        }

        for (name, index) in source.got.functions() {
            let func = chain
                .iter()
                .find_map(|instance| match instance.get_export(name) {
                    Some(Extern::Function(func)) => Some(func),
                    _ => None,
                })
                .ok_or_else(|| CloneError::GotFixup(name.to_string()))?;
            table.set(&mut store, index, func)?;
        }
    }

    // Bring the memory contents over: copy-on-write from the backing fd
    // when one exists, otherwise a byte copy. Guards come back afterwards.
    {
        let state = state_arc.lock().unwrap();
        let memory = state.memory.as_ref().ok_or(CloneError::IncompleteState)?;

        if source.memory_fd > 0 {
            map_memory_from_fd(memory, &store, source.memory_fd, source.memory_fd_size)?;
        } else if let Some(bytes) = source.memory_bytes.as_ref() {
            memory.write_nonguard(&store, bytes)?;
        }

        memory.rearm_guards(&store)?;
    }

    // Mutable global values are part of the zygote image too.
    {
        let state = state_arc.lock().unwrap();
        for (key, name, value) in &source.global_values {
            let instance = match key {
                None => Some(&main_instance),
                Some(handle) => state
                    .dynamic_modules
                    .get(handle)
                    .and_then(|module| module.instance.as_ref()),
            };
            let Some(instance) = instance else { continue };
            if let Ok(global) = instance.exports.get_global(name) {
                global
                    .set(&mut store, value.clone())
                    .map_err(|source| CloneError::GlobalRestore {
                        name: name.clone(),
                        source,
                    })?;
            }
        }
    }

    debug!(func = %main_name, "cloned module");

    Ok(WasmModule {
        compartment: Some(Compartment { store }),
        func_env: Some(func_env),
        state: state_arc,
        is_bound: true,
    })
}

fn collect_mutable_globals(
    store: &mut Store,
    instance: &Instance,
    key: Option<u32>,
    out: &mut Vec<(Option<u32>, String, Value)>,
) {
    for (name, export) in instance.exports.iter() {
        let Extern::Global(global) = export else {
            continue;
        };
        if !global.ty(&*store).mutability.is_mutable() {
            continue;
        }
        let value = global.get(store);
        if matches!(
            value,
            Value::I32(_) | Value::I64(_) | Value::F32(_) | Value::F64(_)
        ) {
            out.push((key, name.clone(), value));
        }
    }
}

fn map_memory_from_fd(
    memory: &MemoryManager,
    store: &impl wasmer::AsStoreRef,
    fd: i32,
    size: u64,
) -> Result<(), CloneError> {
    debug!(fd, size, "mapping memory from fd");

    let base = memory.native_ptr(store, 0, size as u32)?;
    let mapped = unsafe {
        libc::mmap(
            base.cast(),
            size as usize,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_FIXED,
            fd,
            0,
        )
    };
    if mapped == libc::MAP_FAILED {
        return Err(CloneError::MemoryFdMap {
            fd,
            source: io::Error::last_os_error(),
        });
    }

    Ok(())
}
