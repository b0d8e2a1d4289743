//! Import resolution for module instantiation.
//!
//! Every import of a module being instantiated is answered here, one at a
//! time, before the instance is created. Main modules only see the two
//! intrinsic namespaces. Dynamic modules additionally get the GOT
//! namespaces, the dynamic-linking pseudo globals, and a fallback chain
//! over every instance already in the compartment.

use std::sync::{Arc, Mutex};

use tracing::{debug, error, warn};
use wasmer::{
    AsStoreMut, Extern, ExternType, Function, Global, Imports, ImportType, Module, Mutability,
    Type, Value,
};

use crate::instance::ModuleInstanceRef;
use crate::intrinsics::WASI_NAMESPACE;
use crate::module::{LinkError, ModuleState};

/// Builds the import object for `module` by resolving each of its imports.
pub(crate) fn build_imports(
    state_arc: &Arc<Mutex<ModuleState>>,
    store: &mut impl AsStoreMut,
    module: &Module,
    is_main: bool,
) -> Result<Imports, LinkError> {
    let mut imports = Imports::new();
    let mut state = state_arc.lock().unwrap();

    for import in module.imports() {
        let resolved = resolve_import(&mut state, store, &import, is_main)?;
        verify_extern_type(store, &import, &resolved)?;
        imports.define(import.module(), import.name(), resolved);
    }

    Ok(imports)
}

fn resolve_import(
    state: &mut ModuleState,
    store: &mut impl AsStoreMut,
    import: &ImportType,
    is_main: bool,
) -> Result<Extern, LinkError> {
    let namespace = import.module();
    let name = import.name();

    if is_main {
        // Main module linking comes from the intrinsics only.
        let instance = if namespace == WASI_NAMESPACE {
            state.wasi_instance.as_ref()
        } else {
            state.env_instance.as_ref()
        };
        return instance
            .and_then(|intrinsics| intrinsics.get_export(name))
            .ok_or_else(|| missing_import(namespace, name));
    }

    let (data_bottom, table_bottom, stack_pointer) = last_loaded_layout(state)?;

    match (namespace, name) {
        ("GOT.mem", _) => {
            let entry = state
                .got
                .lookup_data(name)
                .ok_or_else(|| LinkError::MissingGotData {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                })?;
            debug!(namespace, name, offset = entry.offset, "resolved GOT data entry");

            // Note: all GOT.mem imports are created mutable, even when the
            // global they reference is not.
            let global =
                new_integer_global(store, import, entry.offset as i64, Some(Mutability::Var))?;
            Ok(Extern::Global(global))
        }

        ("GOT.func", _) => {
            let index = match state.got.lookup_function(name) {
                Some(index) => {
                    debug!(namespace, name, index, "resolved GOT function entry");
                    index
                }
                None => match scan_for_function(state, name) {
                    // Exported by a module already in the compartment: give
                    // it a table slot and remember it.
                    Some(func) => {
                        let index = {
                            let table =
                                state.table.as_ref().ok_or(LinkError::IncompleteState)?;
                            table.append(store, func)?
                        };
                        state.got.register_function(name, index)?;
                        index
                    }
                    // Nobody exports it yet. Reserve a slot and leave it to
                    // be filled when the producing module finishes loading.
                    None => {
                        let index = {
                            let table =
                                state.table.as_ref().ok_or(LinkError::IncompleteState)?;
                            table.reserve(store, 1)?
                        };
                        warn!(namespace, name, index, "adding placeholder table offset");
                        state.got.record_missing(name, index);
                        index
                    }
                },
            };

            let global = new_integer_global(store, import, index as i64, None)?;
            Ok(Extern::Global(global))
        }

        // Where the loaded module should place its data.
        (_, "__memory_base") => {
            new_integer_global(store, import, data_bottom as i64, None).map(Extern::Global)
        }

        // Where the loaded module's table slice starts.
        (_, "__table_base") => {
            new_integer_global(store, import, table_bottom as i64, None).map(Extern::Global)
        }

        // Where the loaded module should put its stack.
        (_, "__stack_pointer") => {
            new_integer_global(store, import, stack_pointer as i64, None).map(Extern::Global)
        }

        // The table imported from the main module.
        (_, "__indirect_function_table") => {
            let table = state.table.as_ref().ok_or(LinkError::IncompleteState)?;
            Ok(Extern::Table(table.table().clone()))
        }

        _ => {
            debug!(namespace, name, "resolving fallback");

            let selected_wasi = namespace == WASI_NAMESPACE;
            let mut chain: Vec<ModuleInstanceRef<'_>> = Vec::new();
            if selected_wasi {
                if let Some(wasi) = state.wasi_instance.as_ref() {
                    chain.push(ModuleInstanceRef::Wasi(wasi));
                }
            } else if let Some(env) = state.env_instance.as_ref() {
                chain.push(ModuleInstanceRef::Env(env));
            }
            if let Some(main) = state.main_instance.as_ref() {
                chain.push(ModuleInstanceRef::Main(main));
            }
            for (handle, module) in &state.dynamic_modules {
                if let Some(instance) = module.instance.as_ref() {
                    chain.push(ModuleInstanceRef::Dynamic {
                        handle: *handle,
                        instance,
                    });
                }
            }

            chain
                .iter()
                .find_map(|instance| instance.get_export(name))
                .ok_or_else(|| missing_import(namespace, name))
        }
    }
}

/// First export named `name` in the main instance or any non-null dynamic
/// instance.
fn scan_for_function(state: &ModuleState, name: &str) -> Option<Function> {
    if let Some(main) = state.main_instance.as_ref() {
        if let Some(Extern::Function(func)) = main.exports.get_extern(name).cloned() {
            return Some(func);
        }
    }

    for module in state.dynamic_modules.values() {
        let Some(instance) = module.instance.as_ref() else {
            continue;
        };
        if let Some(Extern::Function(func)) = instance.exports.get_extern(name).cloned() {
            return Some(func);
        }
    }

    None
}

fn last_loaded_layout(state: &ModuleState) -> Result<(u32, u32, u32), LinkError> {
    if state.last_loaded_dynamic_handle == 0 {
        return Err(LinkError::NoDynamicModules);
    }
    state
        .dynamic_modules
        .get(&state.last_loaded_dynamic_handle)
        .map(|module| (module.data_bottom, module.table_bottom, module.stack_pointer))
        .ok_or(LinkError::MissingDynamicModule(
            state.last_loaded_dynamic_handle,
        ))
}

fn missing_import(namespace: &str, name: &str) -> LinkError {
    error!(namespace, name, "missing import");
    LinkError::MissingImport {
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

/// Creates a fresh integer global matching the import's declared type,
/// initialised to `value`. `force_mutability` overrides the import's own
/// mutability (the GOT.mem quirk).
fn new_integer_global(
    store: &mut impl AsStoreMut,
    import: &ImportType,
    value: i64,
    force_mutability: Option<Mutability>,
) -> Result<Global, LinkError> {
    let ExternType::Global(global_ty) = import.ty() else {
        return Err(LinkError::ImportTypeMismatch {
            namespace: import.module().to_string(),
            name: import.name().to_string(),
            found: "integer global".to_string(),
            expected: format!("{:?}", import.ty()),
        });
    };

    let value = match global_ty.ty {
        Type::I32 => Value::I32(value as i32),
        Type::I64 => Value::I64(value),
        other => {
            return Err(LinkError::ImportTypeMismatch {
                namespace: import.module().to_string(),
                name: import.name().to_string(),
                found: "i32 or i64 global".to_string(),
                expected: format!("{other:?} global"),
            })
        }
    };

    let mutability = force_mutability.unwrap_or(global_ty.mutability);
    Ok(if mutability.is_mutable() {
        Global::new_mut(store, value)
    } else {
        Global::new(store, value)
    })
}

/// Rejects a resolution whose extern type does not satisfy the import.
fn verify_extern_type(
    store: &mut impl AsStoreMut,
    import: &ImportType,
    resolved: &Extern,
) -> Result<(), LinkError> {
    let expected = import.ty();
    let found = resolved.ty(store);

    let compatible = match (expected, &found) {
        (ExternType::Function(want), ExternType::Function(have)) => want == have,
        (ExternType::Global(want), ExternType::Global(have)) => want == have,
        (ExternType::Table(want), ExternType::Table(_)) => {
            let Extern::Table(table) = resolved else {
                return unreachable_mismatch(import, &found);
            };
            want.ty == table.ty(store).ty && table.size(store) >= want.minimum
        }
        (ExternType::Memory(want), ExternType::Memory(_)) => {
            let Extern::Memory(memory) = resolved else {
                return unreachable_mismatch(import, &found);
            };
            memory.view(store).size().0 >= want.minimum.0
        }
        _ => false,
    };

    if compatible {
        Ok(())
    } else {
        error!(
            namespace = import.module(),
            name = import.name(),
            ?found,
            ?expected,
            "resolved import to the wrong extern type"
        );
        Err(LinkError::ImportTypeMismatch {
            namespace: import.module().to_string(),
            name: import.name().to_string(),
            found: format!("{found:?}"),
            expected: format!("{expected:?}"),
        })
    }
}

fn unreachable_mismatch(import: &ImportType, found: &ExternType) -> Result<(), LinkError> {
    Err(LinkError::ImportTypeMismatch {
        namespace: import.module().to_string(),
        name: import.name().to_string(),
        found: format!("{found:?}"),
        expected: format!("{:?}", import.ty()),
    })
}
