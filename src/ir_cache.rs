//! Process-wide cache of parsed and compiled modules.
//!
//! Modules are interned per `(user, function, shared-path)`. Reads are
//! lock-free once a module is cached; misses are serialised per key so two
//! bound modules racing on the same function only compile it once.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use once_cell::sync::Lazy;
use tracing::debug;
use wasmer::{Engine, Module};

use crate::config;
use crate::ir::{IrError, ModuleIr};

/// Storage interface the cache pulls module bytes through. The surrounding
/// platform installs its own implementation (S3, local disk, ...) at
/// start-up.
pub trait FunctionLoader: Send + Sync {
    /// Returns the compiled Wasm for a `(user, function)` pair.
    fn load_function_wasm(&self, user: &str, function: &str) -> std::io::Result<Vec<u8>>;

    /// Returns the bytes of a shared module. Shared modules are addressed by
    /// path, so the default implementation reads them straight from disk.
    fn load_shared_wasm(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        std::fs::read(path)
    }
}

/// Default loader: reads `<func_dir>/<user>/<function>/function.wasm`.
struct FsLoader;

impl FunctionLoader for FsLoader {
    fn load_function_wasm(&self, user: &str, function: &str) -> std::io::Result<Vec<u8>> {
        let mut path = config::global().func_dir;
        path.push(user);
        path.push(function);
        path.push("function.wasm");
        std::fs::read(path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    user: String,
    function: String,
    shared_path: PathBuf,
}

impl CacheKey {
    fn describe(&self) -> String {
        if self.shared_path.as_os_str().is_empty() {
            format!("{}/{}", self.user, self.function)
        } else {
            format!(
                "{}/{} [{}]",
                self.user,
                self.function,
                self.shared_path.display()
            )
        }
    }
}

/// A compiled module together with the structural metadata the host needs
/// around instantiation.
pub struct CachedModule {
    pub module: Module,
    pub ir: ModuleIr,
}

pub struct IrCache {
    engine: Engine,
    modules: RwLock<HashMap<CacheKey, Arc<CachedModule>>>,
    miss_locks: Mutex<HashMap<CacheKey, Arc<Mutex<()>>>>,
    loader: RwLock<Arc<dyn FunctionLoader>>,
}

static GLOBAL_CACHE: Lazy<IrCache> = Lazy::new(IrCache::new);

impl IrCache {
    fn new() -> Self {
        Self {
            engine: Engine::default(),
            modules: RwLock::new(HashMap::new()),
            miss_locks: Mutex::new(HashMap::new()),
            loader: RwLock::new(Arc::new(FsLoader)),
        }
    }

    pub fn global() -> &'static IrCache {
        &GLOBAL_CACHE
    }

    /// The engine every compartment's store is created from. Sharing one
    /// engine is what lets cached modules instantiate into any store.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Replaces the storage backend. Modules already cached are kept.
    pub fn set_loader(&self, loader: Arc<dyn FunctionLoader>) {
        *self.loader.write().unwrap() = loader;
    }

    /// Fetches the module for `(user, function)`, or for the shared module
    /// at `shared_path` when it is non-empty. Compiles and interns on miss.
    pub fn get_module(
        &self,
        user: &str,
        function: &str,
        shared_path: &str,
    ) -> Result<Arc<CachedModule>, IrError> {
        let key = CacheKey {
            user: user.to_string(),
            function: function.to_string(),
            shared_path: PathBuf::from(shared_path),
        };

        if let Some(hit) = self.modules.read().unwrap().get(&key) {
            return Ok(hit.clone());
        }

        // Serialise the miss per key, then re-check before doing the work.
        let key_lock = {
            let mut locks = self.miss_locks.lock().unwrap();
            locks.entry(key.clone()).or_default().clone()
        };
        let _guard = key_lock.lock().unwrap();

        if let Some(hit) = self.modules.read().unwrap().get(&key) {
            return Ok(hit.clone());
        }

        let loader = self.loader.read().unwrap().clone();
        let bytes = if shared_path.is_empty() {
            loader.load_function_wasm(user, function)
        } else {
            loader.load_shared_wasm(&key.shared_path)
        }
        .map_err(|source| IrError::Load {
            key: key.describe(),
            source,
        })?;

        let ir = ModuleIr::parse(&bytes)?;
        let module = Module::new(&self.engine, bytes.as_slice()).map_err(|source| IrError::Compile {
            key: key.describe(),
            source: Box::new(source),
        })?;

        debug!(key = %key.describe(), size = bytes.len(), "compiled and cached module");

        let cached = Arc::new(CachedModule { module, ir });
        self.modules
            .write()
            .unwrap()
            .insert(key, cached.clone());

        Ok(cached)
    }

    /// Drops every cached module.
    pub fn flush(&self) {
        self.modules.write().unwrap().clear();
        self.miss_locks.lock().unwrap().clear();
        debug!("flushed module cache");
    }
}
