//! Instance variants the import resolver walks over.
//!
//! One bound module deals with four kinds of instances: the two
//! host-implemented intrinsic bundles, the main module, and dynamically
//! loaded shared modules. They share nothing but the ability to look up an
//! export by name, so that capability is the whole interface.

use std::collections::HashMap;

use wasmer::{Extern, Function, Instance};

/// A host-implemented module: a bag of named functions materialised from an
/// intrinsic catalog into a compartment's store.
#[derive(Clone)]
pub struct IntrinsicsInstance {
    namespace: &'static str,
    exports: HashMap<String, Function>,
}

impl IntrinsicsInstance {
    pub(crate) fn new(namespace: &'static str, exports: HashMap<String, Function>) -> Self {
        Self { namespace, exports }
    }

    pub fn namespace(&self) -> &str {
        self.namespace
    }

    pub fn get_export(&self, name: &str) -> Option<Extern> {
        self.exports
            .get(name)
            .map(|func| Extern::Function(func.clone()))
    }
}

impl std::fmt::Debug for IntrinsicsInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntrinsicsInstance")
            .field("namespace", &self.namespace)
            .field("exports", &self.exports.len())
            .finish()
    }
}

/// A borrowed view of any instance kind, used to express the resolver's
/// fallback chains as plain sequences.
#[derive(Clone, Copy)]
pub(crate) enum ModuleInstanceRef<'a> {
    Env(&'a IntrinsicsInstance),
    Wasi(&'a IntrinsicsInstance),
    Main(&'a Instance),
    Dynamic {
        #[allow(dead_code)]
        handle: u32,
        instance: &'a Instance,
    },
}

impl ModuleInstanceRef<'_> {
    pub fn get_export(&self, name: &str) -> Option<Extern> {
        match self {
            Self::Env(intrinsics) | Self::Wasi(intrinsics) => intrinsics.get_export(name),
            Self::Main(instance) | Self::Dynamic { instance, .. } => {
                instance.exports.get_extern(name).cloned()
            }
        }
    }
}
