//! Host-implemented intrinsic modules.
//!
//! Two process-wide catalogs, `env` and `wasi_snapshot_preview1`, hold
//! the intrinsic definitions. They are built lazily on first use and may be
//! extended by the embedding platform before the first bind. Binding a
//! module materialises each catalog into an [`IntrinsicsInstance`] whose
//! functions live in that compartment's store, which is the moral
//! equivalent of cloning a base intrinsics module into the compartment.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use wasmer::{AsStoreMut, Function, FunctionEnv, FunctionEnvMut, FunctionType, RuntimeError, Value};

use crate::instance::IntrinsicsInstance;
use crate::module::HostEnv;

mod env;
mod wasi;

pub const ENV_NAMESPACE: &str = "env";
pub const WASI_NAMESPACE: &str = "wasi_snapshot_preview1";

/// The host side of an intrinsic.
pub type IntrinsicImpl = Arc<
    dyn Fn(FunctionEnvMut<'_, HostEnv>, &[Value]) -> Result<Vec<Value>, RuntimeError>
        + Send
        + Sync,
>;

pub struct IntrinsicDef {
    ty: FunctionType,
    host_fn: IntrinsicImpl,
}

pub struct IntrinsicCatalog {
    namespace: &'static str,
    defs: HashMap<String, IntrinsicDef>,
}

impl IntrinsicCatalog {
    fn new(namespace: &'static str) -> Self {
        Self {
            namespace,
            defs: HashMap::new(),
        }
    }

    /// Registers (or replaces) an intrinsic. Only affects modules bound
    /// afterwards.
    pub fn register<F>(&mut self, name: &str, ty: FunctionType, host_fn: F)
    where
        F: Fn(FunctionEnvMut<'_, HostEnv>, &[Value]) -> Result<Vec<Value>, RuntimeError>
            + Send
            + Sync
            + 'static,
    {
        self.defs.insert(
            name.to_string(),
            IntrinsicDef {
                ty,
                host_fn: Arc::new(host_fn),
            },
        );
    }

    /// Materialises every definition into `store`, bound to `func_env`.
    pub(crate) fn instantiate(
        &self,
        store: &mut impl AsStoreMut,
        func_env: &FunctionEnv<HostEnv>,
    ) -> IntrinsicsInstance {
        let mut exports = HashMap::with_capacity(self.defs.len());
        for (name, def) in &self.defs {
            let host_fn = def.host_fn.clone();
            let func = Function::new_with_env(
                store,
                func_env,
                def.ty.clone(),
                move |ctx: FunctionEnvMut<'_, HostEnv>, args: &[Value]| host_fn(ctx, args),
            );
            exports.insert(name.clone(), func);
        }
        IntrinsicsInstance::new(self.namespace, exports)
    }
}

struct BaseCatalogs {
    env: IntrinsicCatalog,
    wasi: IntrinsicCatalog,
}

static BASE_CATALOGS: Lazy<RwLock<BaseCatalogs>> = Lazy::new(|| {
    let mut env_catalog = IntrinsicCatalog::new(ENV_NAMESPACE);
    env::register_defaults(&mut env_catalog);

    let mut wasi_catalog = IntrinsicCatalog::new(WASI_NAMESPACE);
    wasi::register_defaults(&mut wasi_catalog);

    RwLock::new(BaseCatalogs {
        env: env_catalog,
        wasi: wasi_catalog,
    })
});

/// Registers an intrinsic in one of the two namespaces. Returns `false` for
/// an unknown namespace. Intended for host start-up, before any bind.
pub fn register_intrinsic<F>(namespace: &str, name: &str, ty: FunctionType, host_fn: F) -> bool
where
    F: Fn(FunctionEnvMut<'_, HostEnv>, &[Value]) -> Result<Vec<Value>, RuntimeError>
        + Send
        + Sync
        + 'static,
{
    let mut catalogs = BASE_CATALOGS.write().unwrap();
    match namespace {
        ENV_NAMESPACE => catalogs.env.register(name, ty, host_fn),
        WASI_NAMESPACE => catalogs.wasi.register(name, ty, host_fn),
        _ => return false,
    }
    true
}

pub(crate) fn instantiate_env(
    store: &mut impl AsStoreMut,
    func_env: &FunctionEnv<HostEnv>,
) -> IntrinsicsInstance {
    BASE_CATALOGS.read().unwrap().env.instantiate(store, func_env)
}

pub(crate) fn instantiate_wasi(
    store: &mut impl AsStoreMut,
    func_env: &FunctionEnv<HostEnv>,
) -> IntrinsicsInstance {
    BASE_CATALOGS.read().unwrap().wasi.instantiate(store, func_env)
}

/// Pulls an i32 argument out of a dynamic intrinsic call.
pub(crate) fn arg_i32(args: &[Value], index: usize) -> Result<i32, RuntimeError> {
    match args.get(index) {
        Some(Value::I32(value)) => Ok(*value),
        other => Err(RuntimeError::new(format!(
            "intrinsic argument {index} must be an i32, got {other:?}"
        ))),
    }
}

/// Reads a guest string at `(ptr, len)`.
pub(crate) fn read_guest_string(
    view: &wasmer::MemoryView<'_>,
    ptr: i32,
    len: i32,
) -> Result<String, RuntimeError> {
    let mut bytes = vec![0u8; len.max(0) as usize];
    view.read(ptr as u32 as u64, &mut bytes)
        .map_err(|e| RuntimeError::new(format!("bad string pointer: {e}")))?;
    String::from_utf8(bytes).map_err(|_| RuntimeError::new("intrinsic string is not UTF-8"))
}
