//! Wasm module host for a serverless function platform.
//!
//! `wasmcell` loads compiled Wasm modules, builds their linear memory and
//! indirect call table, resolves imports (including dynamically linked
//! shared modules, through a custom global offset table), invokes function
//! entrypoints, isolates executions with guard regions, and supports
//! snapshotting and zygote-style cloning of warmed-up instances.
//!
//! The compiler/JIT underneath is the `wasmer` engine, consumed strictly
//! through its embedder API; this crate is the host logic around it.
//!
//! ```no_run
//! use wasmcell::{Message, WasmModule};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut msg = Message::new("demo", "hello");
//! let mut module = WasmModule::new();
//! module.bind_to_function(&msg)?;
//!
//! let success = module.execute(&mut msg)?;
//! assert!(success);
//! println!("returned {}", msg.return_value);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod fs;
pub mod got;
pub mod instance;
pub mod intrinsics;
pub mod ir;
pub mod ir_cache;
pub mod memory;
pub mod message;
pub mod module;
pub mod omp;
pub mod table;

pub use config::HostConfig;
pub use got::{GlobalOffsetTable, GotDataEntry, GotError};
pub use ir_cache::{FunctionLoader, IrCache};
pub use memory::{MemoryManager, MemoryMapError, GUARD_REGION_PAGES, WASM_PAGE_SIZE};
pub use message::Message;
pub use module::dynlink::{
    LoadedDynamicModule, DYNAMIC_MODULE_MEMORY_PAGES, DYNAMIC_MODULE_STACK_SIZE,
    MAIN_MODULE_DYNLINK_HANDLE,
};
pub use module::execute::{ExecuteError, ExitSignal, InvokeOutcome};
pub use module::snapshot::{CloneError, SnapshotError};
pub use module::threads::{WasmThreadSpec, THREAD_STACK_SIZE};
pub use module::{
    BindError, LinkError, WasmModule, ENTRY_FUNC_NAME, STACK_SIZE, WASM_CTORS_FUNC_NAME,
    ZYGOTE_FUNC_NAME,
};
pub use table::{TableError, TableManager};

/// Drops every cached module across the process.
pub fn flush_module_cache() {
    IrCache::global().flush();
}
