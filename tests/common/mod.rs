#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use wasmcell::{FunctionLoader, IrCache, Message, WasmModule};

/// Serves function modules straight from memory; shared modules still come
/// from disk through the default loader path.
#[derive(Default)]
struct TestLoader {
    functions: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl FunctionLoader for TestLoader {
    fn load_function_wasm(&self, user: &str, function: &str) -> io::Result<Vec<u8>> {
        self.functions
            .lock()
            .unwrap()
            .get(&(user.to_string(), function.to_string()))
            .cloned()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no wasm registered for {user}/{function}"),
                )
            })
    }
}

fn loader() -> &'static Arc<TestLoader> {
    static LOADER: OnceLock<Arc<TestLoader>> = OnceLock::new();
    LOADER.get_or_init(|| {
        let loader = Arc::new(TestLoader::default());
        IrCache::global().set_loader(loader.clone());
        loader
    })
}

pub fn register_function(user: &str, function: &str, wat: &str) {
    let bytes = wasmer::wat2wasm(wat.as_bytes())
        .expect("invalid wat")
        .into_owned();
    loader()
        .functions
        .lock()
        .unwrap()
        .insert((user.to_string(), function.to_string()), bytes);
}

/// Registers `wat` under `(user, function)` and binds a fresh module to it.
pub fn bind(user: &str, function: &str, wat: &str) -> (WasmModule, Message) {
    register_function(user, function, wat);
    let msg = Message::new(user, function);
    let mut module = WasmModule::new();
    module.bind_to_function(&msg).expect("bind failed");
    (module, msg)
}

/// Assembles `wat` and writes it as a shared module file under `dir`.
pub fn write_shared_module(dir: &Path, name: &str, wat: &str) -> PathBuf {
    let bytes = wasmer::wat2wasm(wat.as_bytes()).expect("invalid wat");
    let path = dir.join(name);
    std::fs::write(&path, bytes).expect("failed to write shared module");
    path
}
